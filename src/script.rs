//! Entry-script synthesis.
//!
//! Every rank runs a generated POSIX-sh script inside the container. The
//! script wires up the dynamic linker, optionally sources user setup, then
//! `exec`s the user command so signals reach it directly.

use std::borrow::Cow;
use std::fs;
use std::path::{Path, PathBuf};

use crate::errors::*;
use crate::wi4mpi::Wi4mpiEnv;

#[derive(Debug, Clone, Default)]
pub struct EntryScript {
    /// In-container directory holding the bound host libraries.
    pub library_dir: PathBuf,
    /// User setup script to source, if the profile has one.
    pub source: Option<PathBuf>,
    /// Absolute in-container paths to preload, in order.
    pub preload: Vec<PathBuf>,
    /// Translation-layer environment, when MPI translation is on.
    pub wi4mpi: Option<Wi4mpiEnv>,
    /// The user command, verbatim.
    pub command: Vec<String>,
}

fn quote(value: &str) -> String {
    shell_escape::escape(Cow::from(value)).into_owned()
}

impl EntryScript {
    pub fn render(&self) -> String {
        let mut script = String::from("#!/bin/sh\n");

        script.push_str(&format!(
            "export LD_LIBRARY_PATH={}${{LD_LIBRARY_PATH:+:$LD_LIBRARY_PATH}}\n",
            quote(&self.library_dir.display().to_string())
        ));

        if let Some(source) = &self.source {
            // `.` keeps side effects in this shell
            script.push_str(&format!(". {}\n", quote(&source.display().to_string())));
        }

        if !self.preload.is_empty() {
            let list = self
                .preload
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" ");
            script.push_str(&format!("export LD_PRELOAD={}\n", quote(&list)));
        }

        let command = self
            .command
            .iter()
            .map(|arg| quote(arg))
            .collect::<Vec<_>>()
            .join(" ");

        match &self.wi4mpi {
            Some(wi4mpi) => {
                for (key, value) in wi4mpi.exports() {
                    script.push_str(&format!("export {key}={}\n", quote(&value)));
                }
                let options = match &wi4mpi.options {
                    Some(options) => format!("{options} "),
                    None => String::new(),
                };
                script.push_str(&format!(
                    "exec {} {options}{command}\n",
                    quote(&wi4mpi.wrapper().display().to_string())
                ));
            }
            None => {
                script.push_str(&format!("exec {command}\n"));
            }
        }

        script
    }

    /// Writes the script, executable, into `dir`.
    pub fn write(&self, dir: &Path) -> Result<PathBuf> {
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("could not create `{}`", dir.display()))?;
        let path = dir.join(crate::ENTRY_SCRIPT);
        fs::write(&path, self.render())
            .wrap_err_with(|| format!("could not write `{}`", path.display()))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755))?;
        }
        Ok(path)
    }
}
