//! Launcher argument splitting.
//!
//! Each MPI launcher family declares the flags it understands and how many
//! tokens each consumes; `split` uses that table to find where the launcher's
//! own arguments end and the user program begins.

use std::collections::HashMap;

use once_cell::sync::Lazy;

use crate::shell::MessageInfo;

/// How many tokens a flag consumes after itself. `Two` covers the hydra
/// `-env <name> <value>` style.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Arity {
    Zero,
    One,
    Two,
}

impl Arity {
    fn consumes(self) -> usize {
        match self {
            Arity::Zero => 0,
            Arity::One => 1,
            Arity::Two => 2,
        }
    }
}

#[derive(Debug)]
pub struct LauncherFamily {
    pub name: &'static str,
    /// Recognized program basenames.
    basenames: &'static [&'static str],
    options: HashMap<&'static str, Arity>,
}

macro_rules! options {
    ($($flag:literal => $arity:ident),* $(,)?) => {
        [$(($flag, Arity::$arity)),*].into_iter().collect()
    };
}

static FAMILIES: Lazy<Vec<LauncherFamily>> = Lazy::new(|| {
    vec![
        LauncherFamily {
            name: "mpirun",
            basenames: &["mpirun", "mpiexec", "mpiexec.hydra", "mpiexec.mpd", "orterun"],
            options: options! {
                "-np" => One, "-n" => One, "-c" => One,
                "-host" => One, "--host" => One, "-hosts" => One,
                "-hostfile" => One, "--hostfile" => One,
                "-machinefile" => One, "--machinefile" => One, "-f" => One,
                "-wdir" => One, "--wdir" => One,
                "-x" => One, "-genv" => Two, "-env" => Two,
                "-envlist" => One, "-genvlist" => One,
                "-ppn" => One, "--map-by" => One, "--rank-by" => One, "--bind-to" => One,
                "-rf" => One, "--rankfile" => One,
                "--timeout" => One, "--mca" => One, "-mca" => One,
                "--oversubscribe" => Zero, "--overload-allowed" => Zero,
                "--use-hwthread-cpus" => Zero, "--bynode" => Zero,
                "-q" => Zero, "--quiet" => Zero, "-v" => Zero, "--verbose" => Zero,
                "--tag-output" => Zero, "-l" => Zero,
            },
        },
        LauncherFamily {
            name: "srun",
            basenames: &["srun"],
            options: options! {
                "-n" => One, "--ntasks" => One,
                "-N" => One, "--nodes" => One,
                "-c" => One, "--cpus-per-task" => One,
                "-p" => One, "--partition" => One,
                "-t" => One, "--time" => One,
                "-J" => One, "--job-name" => One,
                "--mpi" => One, "--mem" => One, "--gres" => One,
                "--ntasks-per-node" => One, "--cpu-bind" => One,
                "--distribution" => One, "-m" => One,
                "--exclusive" => Zero, "--overlap" => Zero,
                "-l" => Zero, "--label" => Zero,
                "-q" => One, "--qos" => One,
                "-v" => Zero, "--verbose" => Zero,
            },
        },
        LauncherFamily {
            name: "aprun",
            basenames: &["aprun"],
            options: options! {
                "-n" => One, "-N" => One, "-d" => One, "-j" => One,
                "-L" => One, "-cc" => One, "-e" => One,
                "-m" => One, "-r" => One,
                "-b" => Zero, "-q" => Zero,
            },
        },
        LauncherFamily {
            name: "jsrun",
            basenames: &["jsrun"],
            options: options! {
                "-n" => One, "--nrs" => One,
                "-a" => One, "--tasks_per_rs" => One,
                "-c" => One, "--cpu_per_rs" => One,
                "-g" => One, "--gpu_per_rs" => One,
                "-r" => One, "--rs_per_host" => One,
                "-l" => One, "--latency_priority" => One,
                "-b" => One, "--bind" => One,
                "-d" => One, "--launch_distribution" => One,
            },
        },
    ]
});

/// A user command split at the launcher/program boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitCommand {
    pub launcher: String,
    pub launcher_args: Vec<String>,
    pub program: Vec<String>,
}

impl SplitCommand {
    /// The original token stream, without the `--` marker.
    pub fn all(&self) -> Vec<String> {
        let mut all = vec![self.launcher.clone()];
        all.extend(self.launcher_args.iter().cloned());
        all.extend(self.program.iter().cloned());
        all
    }
}

pub fn family_of(launcher: &str) -> Option<&'static LauncherFamily> {
    let basename = basename(launcher);
    FAMILIES
        .iter()
        .find(|family| family.basenames.contains(&basename))
}

fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Flag used to set the process count for this launcher binary.
pub fn nproc_flag(launcher: &str) -> &'static str {
    if basename(launcher) == "srun" {
        "-n"
    } else {
        "-np"
    }
}

/// Splits `argv` into launcher, launcher arguments and user program.
///
/// An explicit `--` always sets the boundary. Otherwise the launcher
/// family's option table decides: the first token that is neither a known
/// flag nor a value consumed by one starts the program. Applying `split` to
/// its own output is stable.
pub fn split(argv: &[String], msg_info: &mut MessageInfo) -> SplitCommand {
    assert!(!argv.is_empty(), "launcher command cannot be empty");
    let launcher = argv[0].clone();
    let rest = &argv[1..];

    // explicit boundary wins over any table
    if let Some(boundary) = rest.iter().position(|t| t == "--") {
        return SplitCommand {
            launcher,
            launcher_args: rest[..boundary].to_vec(),
            program: rest[boundary + 1..].to_vec(),
        };
    }

    let family = match family_of(&launcher) {
        Some(family) => family,
        None => {
            // unknown launcher without `--`: everything after the binary is
            // the program
            msg_info.warn(format!(
                "unrecognized launcher `{launcher}`; use `--` to separate launcher options from the command"
            ));
            return SplitCommand {
                launcher,
                launcher_args: vec![],
                program: rest.to_vec(),
            };
        }
    };

    let mut launcher_args = vec![];
    let mut index = 0;
    while index < rest.len() {
        let token = &rest[index];
        match family.options.get(token.as_str()) {
            Some(arity) => {
                launcher_args.push(token.clone());
                index += 1;
                for _ in 0..arity.consumes() {
                    if let Some(value) = rest.get(index) {
                        launcher_args.push(value.clone());
                    }
                    index += 1;
                }
            }
            None => {
                // `--flag=value` forms of known flags stay with the launcher
                if let Some((flag, _)) = token.split_once('=') {
                    if family.options.contains_key(flag) {
                        launcher_args.push(token.clone());
                        index += 1;
                        continue;
                    }
                }
                if token.starts_with('-') {
                    msg_info.warn(format!(
                        "`{token}` is not a known {} option; treating it as the start of the command",
                        family.name
                    ));
                }
                break;
            }
        }
    }

    SplitCommand {
        launcher,
        launcher_args,
        program: rest[index..].to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    fn quiet() -> MessageInfo {
        MessageInfo::default()
    }

    #[test]
    fn explicit_boundary() {
        let split = split(&strings(&["mpirun", "-n", "4", "--", "a.out", "-x"]), &mut quiet());
        assert_eq!(split.launcher, "mpirun");
        assert_eq!(split.launcher_args, strings(&["-n", "4"]));
        assert_eq!(split.program, strings(&["a.out", "-x"]));
    }

    #[test]
    fn heuristic_boundary() {
        let split = split(&strings(&["mpirun", "-np", "4", "a.out", "-x", "1"]), &mut quiet());
        assert_eq!(split.launcher_args, strings(&["-np", "4"]));
        assert_eq!(split.program, strings(&["a.out", "-x", "1"]));
    }

    #[test]
    fn env_flags_consume_name_and_value() {
        let split1 = split(
            &strings(&["mpiexec", "-genv", "OMP_NUM_THREADS", "4", "./a.out"]),
            &mut quiet(),
        );
        assert_eq!(
            split1.launcher_args,
            strings(&["-genv", "OMP_NUM_THREADS", "4"])
        );
        assert_eq!(split1.program, strings(&["./a.out"]));

        let split2 = split(
            &strings(&["mpiexec.hydra", "-n", "2", "-env", "PATH", "/opt/bin", "app", "-x"]),
            &mut quiet(),
        );
        assert_eq!(
            split2.launcher_args,
            strings(&["-n", "2", "-env", "PATH", "/opt/bin"])
        );
        assert_eq!(split2.program, strings(&["app", "-x"]));
    }

    #[test]
    fn unknown_flag_starts_program() {
        let split = split(&strings(&["mpirun", "-n", "4", "--xyz", "a.out"]), &mut quiet());
        assert_eq!(split.launcher_args, strings(&["-n", "4"]));
        assert_eq!(split.program, strings(&["--xyz", "a.out"]));
    }

    #[test]
    fn unknown_launcher_needs_boundary() {
        let split1 = split(&strings(&["mylauncher", "-q", "a.out"]), &mut quiet());
        assert_eq!(split1.launcher, "mylauncher");
        assert!(split1.launcher_args.is_empty());
        assert_eq!(split1.program, strings(&["-q", "a.out"]));

        let split2 = split(&strings(&["mylauncher", "-q", "--", "a.out"]), &mut quiet());
        assert_eq!(split2.launcher_args, strings(&["-q"]));
        assert_eq!(split2.program, strings(&["a.out"]));
    }

    #[test]
    fn split_is_a_fixed_point() {
        for argv in [
            strings(&["mpirun", "-n", "4", "a.out", "-x"]),
            strings(&["srun", "-n", "8", "--exclusive", "./app", "input"]),
            strings(&["jsrun", "-n", "2", "-a", "1", "bench"]),
            strings(&["mpiexec", "-genv", "OMP_NUM_THREADS", "4", "a.out"]),
        ] {
            let first = split(&argv, &mut quiet());
            let second = split(&first.all(), &mut quiet());
            assert_eq!(first, second);
        }
    }

    #[test]
    fn srun_long_flags() {
        let split = split(
            &strings(&["/usr/bin/srun", "--ntasks", "16", "--mpi=pmix", "app"]),
            &mut quiet(),
        );
        assert_eq!(split.launcher_args, strings(&["--ntasks", "16", "--mpi=pmix"]));
        assert_eq!(split.program, strings(&["app"]));
    }

    #[test]
    fn nproc_flag_per_launcher() {
        assert_eq!(nproc_flag("/usr/bin/srun"), "-n");
        assert_eq!(nproc_flag("mpirun"), "-np");
        assert_eq!(nproc_flag("aprun"), "-np");
    }

    #[test]
    fn paths_resolve_to_families() {
        assert_eq!(family_of("/opt/openmpi/bin/mpirun").unwrap().name, "mpirun");
        assert_eq!(family_of("mpiexec.hydra").unwrap().name, "mpirun");
        assert_eq!(family_of("srun").unwrap().name, "srun");
        assert!(family_of("bash").is_none());
    }
}
