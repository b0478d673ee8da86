//! Wi4MPI translation-layer support: layout checks, environment synthesis
//! and an idempotent install into a profile-local prefix.

use std::env;
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::container::{Bind, Engine};
use crate::errors::*;
use crate::shell::MessageInfo;

/// Image used to compile the translation layer when a profile needs it and
/// none is installed yet.
pub const BUILDER_IMAGE: &str = "ghcr.io/e4s-project/wi4mpi-builder:latest";

/// In-container mount point of the install prefix during a build.
const BUILD_PREFIX: &str = "/opt/wi4mpi";

/// Subdirectories a usable installation must carry.
const EXPECTED_LAYOUT: &[&str] = &["bin", "lib", "libexec"];

/// Checks that `root` looks like a translation-layer installation.
pub fn validate_layout(root: &Path) -> Result<()> {
    if !root.is_dir() {
        eyre::bail!(
            "translation layer path `{}` is not a directory",
            root.display()
        );
    }
    for sub in EXPECTED_LAYOUT {
        if !root.join(sub).is_dir() {
            eyre::bail!(
                "`{}` does not look like a translation layer installation (missing `{sub}/`)",
                root.display()
            );
        }
    }
    Ok(())
}

/// Environment the entry script exports before delegating to the wrapper.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wi4mpiEnv {
    pub root: PathBuf,
    pub from: String,
    pub to: String,
    /// Extra arguments for the wrapper, verbatim.
    pub options: Option<String>,
}

impl Wi4mpiEnv {
    pub fn exports(&self) -> Vec<(&'static str, String)> {
        vec![
            ("WI4MPI_ROOT", self.root.display().to_string()),
            ("WI4MPI_FROM", self.from.clone()),
            ("WI4MPI_TO", self.to.clone()),
            (
                "WI4MPI_WRAPPER_BIN",
                self.root.join("libexec/wi4mpi").display().to_string(),
            ),
        ]
    }

    /// The translation launcher the user command is exec'd through.
    pub fn wrapper(&self) -> PathBuf {
        self.root.join("bin/mpirun")
    }
}

/// Installs the translation layer into `prefix` unless one is already
/// there. Safe to call from every rank: the check is on the expected files,
/// and ranks that lose the race see a complete installation.
pub fn ensure_installed(
    prefix: &Path,
    from: &str,
    to: &str,
    engine: &Engine,
    config: &Config,
    msg_info: &mut MessageInfo,
) -> Result<()> {
    if validate_layout(prefix).is_ok() {
        msg_info.debug(format!(
            "translation layer already present at `{}`",
            prefix.display()
        ));
        return Ok(());
    }

    msg_info.status(format!(
        "installing the {from} -> {to} translation layer into `{}`",
        prefix.display()
    ));
    std::fs::create_dir_all(prefix)
        .wrap_err_with(|| format!("could not create `{}`", prefix.display()))?;

    // compiler flags are forwarded only during installation
    let mut env = vec![];
    for (var, flag) in [
        ("E4S_CL_WI4MPI_CFLAGS", "WI4MPI_CFLAGS"),
        ("E4S_CL_WI4MPI_CXXFLAGS", "WI4MPI_CXXFLAGS"),
    ] {
        if let Ok(value) = env::var(var) {
            env.push((flag.to_owned(), value));
        }
    }

    let command = vec![
        "build-wi4mpi".to_owned(),
        "--from".to_owned(),
        from.to_owned(),
        "--to".to_owned(),
        to.to_owned(),
        "--prefix".to_owned(),
        BUILD_PREFIX.to_owned(),
    ];
    let binds = vec![Bind::new(prefix, BUILD_PREFIX)];
    let status = engine.execute(
        Some(BUILDER_IMAGE),
        &command,
        &binds,
        &env,
        None,
        config,
        msg_info,
    )?;
    if !status.success() {
        eyre::bail!("translation layer installation failed with {status}");
    }
    validate_layout(prefix)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn layout_validation() {
        let dir = tempfile::tempdir().unwrap();
        assert!(validate_layout(&dir.path().join("missing")).is_err());
        assert!(validate_layout(dir.path()).is_err());

        for sub in EXPECTED_LAYOUT {
            fs::create_dir(dir.path().join(sub)).unwrap();
        }
        assert!(validate_layout(dir.path()).is_ok());
    }

    #[test]
    fn exported_environment() {
        let env = Wi4mpiEnv {
            root: PathBuf::from("/opt/wi4mpi"),
            from: "openmpi".to_owned(),
            to: "mpich".to_owned(),
            options: None,
        };
        let exports = env.exports();
        assert!(exports.contains(&("WI4MPI_ROOT", "/opt/wi4mpi".to_owned())));
        assert!(exports.contains(&("WI4MPI_FROM", "openmpi".to_owned())));
        assert!(exports.contains(&("WI4MPI_TO", "mpich".to_owned())));
        assert!(exports
            .contains(&("WI4MPI_WRAPPER_BIN", "/opt/wi4mpi/libexec/wi4mpi".to_owned())));
        assert_eq!(env.wrapper(), PathBuf::from("/opt/wi4mpi/bin/mpirun"));
    }
}
