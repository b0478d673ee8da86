//! `launch`: wrap a user's launcher command so that every rank starts
//! through the per-rank worker.

use std::env;
use std::process::Command;

use clap::Args;

use crate::config::Config;
use crate::container::{Backend, Engine};
use crate::errors::*;
use crate::extensions::{CommandExt, SafeCommand};
use crate::launcher::{self, SplitCommand};
use crate::mpi::{self, Family};
use crate::profile::{Profile, Stores};
use crate::shell::MessageInfo;

use super::ProfileOverrides;

#[derive(Args, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Launch {
    #[clap(flatten)]
    pub overrides: ProfileOverrides,
    /// Translate the containerized binary's MPI family onto the host's.
    #[clap(long)]
    pub from: Option<Family>,
    /// The launcher command, e.g. `mpirun -n 4 ./a.out`.
    #[clap(allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl Launch {
    pub fn run(
        self,
        stores: &Stores,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<i32> {
        let split = launcher::split(&self.command, msg_info);
        if split.program.is_empty() {
            eyre::bail!("no program to launch; place it after the launcher options or `--`");
        }

        let profile = self.overrides.resolve(stores, msg_info)?;
        let translation = self.translation_family(&split, &profile, config, msg_info)?;

        let mut launcher_options = config.launcher_options.clone();
        let mut argv = vec![split.launcher.clone()];
        argv.append(&mut launcher_options);
        argv.extend(split.launcher_args.iter().cloned());
        argv.extend(self.worker_command(&profile, translation)?);
        argv.extend(split.program.iter().cloned());

        let mut safe = SafeCommand::new(&argv[0]);
        safe.args(argv[1..].iter().cloned());
        msg_info.debug(format!("delegating to {safe}"));
        let mut cmd = Command::from(safe);
        let status = cmd.run_and_get_status(msg_info)?;
        Ok(status.code().unwrap_or(1))
    }

    /// Whether ranks must run the user program through the translation
    /// layer, and between which families (`from` the container's, `to` the
    /// host's). `--from` forces the decision unless host and container
    /// already match, which short-circuits to a plain launch.
    fn translation_family(
        &self,
        split: &SplitCommand,
        profile: &Profile,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<Option<(Family, Family)>> {
        let host = mpi::host_family(&split.launcher, msg_info);

        if let Some(from) = self.from {
            let host = host.ok_or_else(|| {
                EnvironmentError(
                    "could not determine the host MPI family from the launcher".to_owned(),
                )
            })?;
            if host == from {
                msg_info.debug(format!(
                    "host launcher already speaks {from}; skipping translation"
                ));
                return Ok(None);
            }
            return Ok(Some((from, host)));
        }

        let host = match host {
            Some(host) => host,
            None => return Ok(None),
        };
        let image = match &profile.image {
            Some(image) => image.clone(),
            None => return Ok(None),
        };
        let backend: Backend = match &profile.backend {
            Some(name) => name.parse()?,
            None => return Ok(None),
        };
        if backend == Backend::Bare {
            return Ok(None);
        }

        let engine = Engine::new(backend, config)?;
        let banner = match engine.image_version_info(&image, config, msg_info) {
            Ok(banner) => banner,
            Err(e) => {
                msg_info.warn(format!("could not probe the image's MPI runtime: {e}"));
                return Ok(None);
            }
        };
        match mpi::family_from_banner(&banner) {
            Some(container) if container != host => {
                msg_info.status(format!(
                    "container MPI ({container}) differs from the host ({host}); enabling translation"
                ));
                Ok(Some((container, host)))
            }
            _ => Ok(None),
        }
    }

    /// The worker argv injected as the launcher's program: a re-invocation
    /// of this binary's hidden subcommand.
    fn worker_command(
        &self,
        profile: &Profile,
        translation: Option<(Family, Family)>,
    ) -> Result<Vec<String>> {
        let this = env::current_exe()
            .wrap_err("could not locate the e4s-cl binary")?
            .display()
            .to_string();
        let mut argv = vec![this, "__execute".to_owned()];
        if self.overrides.is_empty() {
            // a selected profile was used; pin it by name for the ranks
            argv.push("--profile".to_owned());
            argv.push(profile.name.clone());
        } else {
            argv.extend(self.overrides.forwarded_args());
        }
        if let Some((from, to)) = translation {
            argv.push("--from".to_owned());
            argv.push(from.to_string());
            argv.push("--to".to_owned());
            argv.push(to.to_string());
        }
        argv.push("--".to_owned());
        Ok(argv)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_command_pins_the_profile() {
        let launch = Launch {
            overrides: ProfileOverrides::default(),
            from: None,
            command: vec!["mpirun".into()],
        };
        let profile = Profile::new("chosen");
        let argv = launch.worker_command(&profile, None).unwrap();
        assert_eq!(argv[1], "__execute");
        assert_eq!(&argv[2..4], &["--profile", "chosen"]);
        assert_eq!(argv.last().unwrap(), "--");
    }

    #[test]
    fn worker_command_forwards_translation() {
        let launch = Launch {
            overrides: ProfileOverrides {
                image: Some("img.sif".to_owned()),
                backend: Some("apptainer".to_owned()),
                ..Default::default()
            },
            from: None,
            command: vec!["mpirun".into()],
        };
        let profile = Profile::new("<command line>");
        let argv = launch
            .worker_command(&profile, Some((Family::OpenMpi, Family::Mpich)))
            .unwrap();
        assert!(argv.windows(2).any(|w| w == ["--image", "img.sif"]));
        assert!(argv.windows(2).any(|w| w == ["--from", "openmpi"]));
        assert!(argv.windows(2).any(|w| w == ["--to", "mpich"]));
        // ad-hoc launches never pin a profile name
        assert!(!argv.contains(&"--profile".to_owned()));
    }
}
