#![deny(missing_debug_implementations, rust_2018_idioms)]

use clap::{Parser, Subcommand};

use e4s_cl::commands;
use e4s_cl::config::Config;
use e4s_cl::errors::{self, Result};
use e4s_cl::profile::Stores;
use e4s_cl::shell::MessageInfo;

#[derive(Parser, Debug)]
#[clap(name = "e4s-cl", version, about = "Launch containerized MPI applications against the host MPI runtime", long_about = None)]
struct Cli {
    /// Provide verbose diagnostic output.
    #[clap(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create and select a profile for this system.
    Init(commands::init::Init),
    /// Run a launcher command with its ranks containerized.
    Launch(commands::launch::Launch),
    /// Manage stored profiles.
    #[clap(subcommand)]
    Profile(commands::profile::ProfileCommand),
    /// Per-rank worker, spawned by the launcher.
    #[clap(name = "__execute", hide = true)]
    Execute(commands::execute::Execute),
}

fn run() -> Result<i32> {
    // argument errors exit 1, not clap's default 2, which is reserved for
    // environment errors
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = if e.use_stderr() { 1 } else { 0 };
            e.print().ok();
            std::process::exit(code);
        }
    };
    let mut msg_info = MessageInfo::new(cli.verbose);

    let config = Config::load(&mut msg_info)?;
    msg_info.ranked_log = !config.disable_ranked_log;
    let stores = Stores::open()?;

    match cli.command {
        Commands::Init(args) => {
            args.run(&stores, &mut msg_info)?;
            Ok(0)
        }
        Commands::Launch(args) => args.run(&stores, &config, &mut msg_info),
        Commands::Profile(args) => {
            args.run(&stores, &mut msg_info)?;
            Ok(0)
        }
        Commands::Execute(args) => args.run(&stores, &config, &mut msg_info),
    }
}

fn main() {
    let code = match errors::install_panic_hook()
        .and_then(|_| errors::install_termination_hook())
        .and_then(|_| run())
    {
        Ok(code) => code,
        Err(report) => {
            eprintln!("Error: {report:?}");
            errors::exit_code(&report)
        }
    };
    std::process::exit(code);
}
