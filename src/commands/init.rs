//! `init`: bootstrap a profile from the local MPI installation and select
//! it, so a bare `e4s-cl launch` works right away.

use std::path::PathBuf;

use clap::Args;

use crate::errors::*;
use crate::launcher;
use crate::profile::{Profile, Stores};
use crate::shell::MessageInfo;

use super::classify_arguments;

#[derive(Args, Debug)]
pub struct Init {
    /// Name of the profile to create or replace.
    #[clap(long, default_value = "default")]
    pub profile: String,
    /// MPI installation prefix to seed the library set from.
    #[clap(long)]
    pub mpi: Option<PathBuf>,
    /// Launcher binary to trace a reference run with.
    #[clap(long)]
    pub launcher: Option<String>,
    /// Extra arguments for the reference run.
    #[clap(long)]
    pub launcher_args: Option<String>,
    /// Container image identifier.
    #[clap(long)]
    pub image: Option<String>,
    /// Container backend.
    #[clap(long)]
    pub backend: Option<String>,
    /// Script sourced inside the container.
    #[clap(long)]
    pub source: Option<PathBuf>,
    /// Translation layer installation path.
    #[clap(long)]
    pub wi4mpi: Option<PathBuf>,
}

impl Init {
    pub fn run(self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<()> {
        let mut profile = Profile::new(&self.profile);
        profile.backend = self.backend.clone();
        profile.image = self.image.clone();
        profile.source = self.source.clone();
        profile.wi4mpi = self.wi4mpi.clone();

        if let Some(mpi) = &self.mpi {
            let candidates: Vec<PathBuf> = ["lib", "lib64"]
                .iter()
                .map(|sub| mpi.join(sub))
                .filter(|dir| dir.is_dir())
                .flat_map(|dir| {
                    dir.read_dir()
                        .into_iter()
                        .flatten()
                        .flatten()
                        .map(|entry| entry.path())
                        .collect::<Vec<_>>()
                })
                .filter(|path| {
                    path.file_name()
                        .map(|name| name.to_string_lossy().contains(".so"))
                        .unwrap_or(false)
                })
                .collect();
            if candidates.is_empty() {
                msg_info.warn(format!(
                    "no shared objects found under `{}`",
                    mpi.display()
                ));
            }
            for record in classify_arguments(&candidates, msg_info)? {
                match record.kind {
                    crate::PathKind::Library => profile.add_library(record)?,
                    _ => {}
                }
            }
        }

        // replace a previous `init` run wholesale
        if stores.user.get(&self.profile)?.is_some() {
            stores.user.update(&self.profile, profile)?;
        } else {
            stores.user.create(profile)?;
        }
        stores.user.select(&self.profile)?;

        if let Some(command) = self.detect_command(msg_info) {
            let detect = super::detect::Detect {
                profile: Some(self.profile.clone()),
                command,
            };
            if let Err(e) = detect.run(stores, msg_info) {
                msg_info.warn(format!(
                    "system detection failed ({e}); the profile was created without it"
                ));
            }
        }

        msg_info.status(format!("profile `{}` created and selected", self.profile));
        Ok(())
    }

    /// A reference run for detection, when a launcher was given or found.
    fn detect_command(&self, msg_info: &mut MessageInfo) -> Option<Vec<String>> {
        let launcher_bin = match &self.launcher {
            Some(launcher) => launcher.clone(),
            None => return None,
        };
        let mut command = vec![launcher_bin.clone()];
        match &self.launcher_args {
            Some(args) => match shell_words::split(args) {
                Ok(mut split) => command.append(&mut split),
                Err(e) => {
                    msg_info.warn(format!("ignoring unparsable --launcher_args: {e}"));
                    command.push(launcher::nproc_flag(&launcher_bin).to_owned());
                    command.push("2".to_owned());
                }
            },
            None => {
                command.push(launcher::nproc_flag(&launcher_bin).to_owned());
                command.push("2".to_owned());
            }
        }
        command.push("hostname".to_owned());
        Some(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_command_uses_launcher_flag_conventions() {
        let init = Init {
            profile: "default".to_owned(),
            mpi: None,
            launcher: Some("/usr/bin/srun".to_owned()),
            launcher_args: None,
            image: None,
            backend: None,
            source: None,
            wi4mpi: None,
        };
        let command = init.detect_command(&mut MessageInfo::default()).unwrap();
        assert_eq!(command, ["/usr/bin/srun", "-n", "2", "hostname"]);

        let init = Init {
            launcher: Some("mpirun".to_owned()),
            launcher_args: Some("-np 4 -hostfile hosts".to_owned()),
            ..init
        };
        let command = init.detect_command(&mut MessageInfo::default()).unwrap();
        assert_eq!(
            command,
            ["mpirun", "-np", "4", "-hostfile", "hosts", "hostname"]
        );
    }
}
