//! Container backend driver.
//!
//! Every backend is a value with the same contract: run a command inside an
//! image with a set of bind mounts and environment variables, forward stdio
//! and hand back the exit status. Configuration is read-only once the engine
//! is built, so concurrent ranks never share mutable state.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus};
use std::str::FromStr;

use atty::Stream;

use crate::config::{self, Config};
use crate::errors::*;
use crate::extensions::CommandExt;
use crate::profile::{PathKind, PathRecord};
use crate::resolve::ContainerInfo;
use crate::shell::MessageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Apptainer,
    Singularity,
    Docker,
    Podman,
    Shifter,
    /// No container: stage symlinks and run on the host.
    Bare,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Apptainer => "apptainer",
            Backend::Singularity => "singularity",
            Backend::Docker => "docker",
            Backend::Podman => "podman",
            Backend::Shifter => "shifter",
            Backend::Bare => "none",
        }
    }

    /// Shifter cannot bind single files; callers stage them into one bound
    /// directory instead.
    pub fn supports_file_binding(&self) -> bool {
        !matches!(self, Backend::Shifter)
    }

    /// Environment variable whose value is appended verbatim to the backend
    /// command line.
    fn options_var(&self) -> Option<&'static str> {
        match self {
            Backend::Apptainer => Some("E4S_CL_APPTAINER_EXEC_OPTIONS"),
            Backend::Singularity => Some("E4S_CL_SINGULARITY_EXEC_OPTIONS"),
            Backend::Docker => Some("E4S_CL_DOCKER_OPTIONS"),
            Backend::Podman => Some("E4S_CL_PODMAN_RUN_OPTIONS"),
            Backend::Shifter => Some("E4S_CL_SHIFTER_OPTIONS"),
            Backend::Bare => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Backend {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "apptainer" => Ok(Backend::Apptainer),
            "singularity" => Ok(Backend::Singularity),
            "docker" => Ok(Backend::Docker),
            "podman" => Ok(Backend::Podman),
            "shifter" => Ok(Backend::Shifter),
            "none" | "bare" => Ok(Backend::Bare),
            other => Err(eyre::eyre!("unknown container backend `{other}`")),
        }
    }
}

/// One bind mount request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bind {
    pub source: PathBuf,
    pub target: PathBuf,
    pub readonly: bool,
}

impl Bind {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<PathBuf>) -> Self {
        Bind {
            source: source.into(),
            target: target.into(),
            readonly: false,
        }
    }

    pub fn readonly(mut self) -> Self {
        self.readonly = true;
        self
    }

    /// `src:dst[:ro]` form shared by apptainer and docker-style engines.
    fn colon_spec(&self) -> String {
        let mut spec = format!("{}:{}", self.source.display(), self.target.display());
        if self.readonly {
            spec.push_str(":ro");
        }
        spec
    }
}

/// A resolved backend: the variant plus the executable that drives it.
#[derive(Debug, Clone)]
pub struct Engine {
    pub backend: Backend,
    pub path: Option<PathBuf>,
}

impl Engine {
    pub fn new(backend: Backend, config: &Config) -> Result<Engine> {
        if backend == Backend::Bare {
            return Ok(Engine {
                backend,
                path: None,
            });
        }
        let name = backend.name();
        let path = match &config.backend(name).executable {
            Some(executable) => PathBuf::from(executable),
            None => which::which(name).map_err(|_| {
                EnvironmentError(format!(
                    "container backend `{name}` is not installed or not on PATH"
                ))
            })?,
        };
        Ok(Engine {
            backend,
            path: Some(path),
        })
    }

    fn executable(&self) -> &Path {
        // Bare never builds a backend command line
        self.path.as_deref().unwrap_or_else(|| Path::new("sh"))
    }

    /// Builds the backend command for `command` inside `image`. The bind
    /// list must already respect `supports_file_binding`.
    pub fn build_command(
        &self,
        image: Option<&str>,
        command: &[String],
        binds: &[Bind],
        env: &[(String, String)],
        workdir: Option<&Path>,
        config: &Config,
    ) -> Result<Command> {
        let backend_config = config.backend(self.backend.name());
        let extra = match self.backend.options_var() {
            Some(var) => config::env_options(var)?,
            None => vec![],
        };

        let image = match (self.backend, image) {
            (Backend::Bare, _) => None,
            (_, Some(image)) => Some(image),
            (_, None) => {
                eyre::bail!("backend `{}` requires an image", self.backend)
            }
        };

        let mut cmd = match self.backend {
            Backend::Apptainer | Backend::Singularity => {
                let mut cmd = Command::new(self.executable());
                cmd.args(&backend_config.options);
                cmd.arg("exec");
                cmd.args(&backend_config.run_options);
                cmd.args(&extra);
                for bind in binds {
                    cmd.args(["-B", &bind.colon_spec()]);
                }
                if let Some(workdir) = workdir {
                    cmd.arg("--pwd").arg(workdir);
                }
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd.arg(image.expect("image checked above"));
                cmd.args(command);
                cmd
            }
            Backend::Docker | Backend::Podman => {
                let mut cmd = Command::new(self.executable());
                cmd.args(&backend_config.options);
                cmd.args(["run", "--rm"]);
                cmd.args(&backend_config.run_options);
                cmd.args(&extra);
                if atty::is(Stream::Stdin) {
                    cmd.arg("-i");
                    if atty::is(Stream::Stdout) && atty::is(Stream::Stderr) {
                        cmd.arg("-t");
                    }
                }
                for bind in binds {
                    cmd.args(["-v", &bind.colon_spec()]);
                }
                for (key, value) in env {
                    cmd.args(["-e", &format!("{key}={value}")]);
                }
                if let Some(workdir) = workdir {
                    cmd.arg("-w").arg(workdir);
                }
                cmd.arg(image.expect("image checked above"));
                cmd.args(command);
                cmd
            }
            Backend::Shifter => {
                let mut cmd = Command::new(self.executable());
                cmd.args(&backend_config.options);
                cmd.args(&extra);
                cmd.arg(format!("--image={}", image.expect("image checked above")));
                for bind in binds {
                    if !bind.source.is_dir() {
                        eyre::bail!(
                            "shifter cannot bind single files; `{}` must be staged into a directory",
                            bind.source.display()
                        );
                    }
                    cmd.arg(format!(
                        "--volume={}:{}",
                        bind.source.display(),
                        bind.target.display()
                    ));
                }
                if let Some(workdir) = workdir {
                    cmd.arg(format!("--workdir={}", workdir.display()));
                }
                for (key, value) in env {
                    cmd.env(key, value);
                }
                cmd.args(command);
                cmd
            }
            Backend::Bare => {
                if command.is_empty() {
                    eyre::bail!("cannot run an empty command");
                }
                let mut cmd = Command::new(&command[0]);
                cmd.args(&command[1..]);
                for (key, value) in env {
                    cmd.env(key, value);
                }
                if let Some(workdir) = workdir {
                    cmd.current_dir(workdir);
                }
                cmd
            }
        };

        // the user program inherits stdio from the launcher
        cmd.stdin(std::process::Stdio::inherit());
        Ok(cmd)
    }

    /// Runs `command` inside the container, forwarding stdio and status.
    #[allow(clippy::too_many_arguments)]
    pub fn execute(
        &self,
        image: Option<&str>,
        command: &[String],
        binds: &[Bind],
        env: &[(String, String)],
        workdir: Option<&Path>,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<ExitStatus> {
        if let Some(image_path) = image {
            // path-shaped images must exist before the backend is started
            if image_path.starts_with('/') && !Path::new(image_path).exists() {
                eyre::bail!("image `{image_path}` does not exist");
            }
        }
        let mut cmd = self.build_command(image, command, binds, env, workdir, config)?;
        cmd.run_and_get_status(msg_info)
    }

    /// Version banner of the MPI runtime inside the image, best effort.
    pub fn image_version_info(
        &self,
        image: &str,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<String> {
        let command = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            "mpirun --version 2>&1 || mpichversion 2>&1 || true".to_owned(),
        ];
        let mut cmd = self.build_command(Some(image), &command, &[], &[], None, config)?;
        let output = cmd.run_and_get_output(msg_info)?;
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// What the container already provides: its ldconfig cache and glibc
    /// release. Used for the host/container library tie-break.
    pub fn probe(
        &self,
        image: Option<&str>,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<ContainerInfo> {
        if self.backend == Backend::Bare {
            return Ok(ContainerInfo::default());
        }
        let image = image.ok_or_else(|| eyre::eyre!("cannot probe a backend without an image"))?;
        let command = vec![
            "sh".to_owned(),
            "-c".to_owned(),
            format!(
                "ldconfig -p 2>/dev/null || /sbin/ldconfig -p 2>/dev/null; \
                 echo {GLIBC_MARKER}; getconf GNU_LIBC_VERSION 2>/dev/null"
            ),
        ];
        let mut cmd = self.build_command(Some(image), &command, &[], &[], None, config)?;
        let output = cmd.run_and_get_output(msg_info)?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut info = parse_probe_output(&stdout);
        // a directory image (apptainer sandbox) is inspectable from outside
        let image_path = Path::new(image);
        if image_path.is_dir() {
            info.rootfs = Some(image_path.to_path_buf());
        }
        Ok(info)
    }
}

const GLIBC_MARKER: &str = "@e4s-cl-glibc@";

pub fn parse_probe_output(output: &str) -> ContainerInfo {
    let (cache, version) = match output.split_once(GLIBC_MARKER) {
        Some((cache, version)) => (cache, version),
        None => (output, ""),
    };
    let libraries: HashMap<String, PathBuf> = crate::resolve::LdCache::parse(cache).into_map();
    let glibc_version = version
        .lines()
        .find_map(|line| line.trim().strip_prefix("glibc ").map(str::to_owned))
        .and_then(|v| {
            let (major, minor) = v.split_once('.')?;
            Some((major.parse().ok()?, minor.trim().parse().ok()?))
        });
    ContainerInfo {
        libraries,
        glibc_version,
        rootfs: None,
    }
}

/// Copies file and directory records into `staging` so a single directory
/// bind can stand in for per-file binds (shifter).
pub fn stage_records(records: &[&PathRecord], staging: &Path) -> Result<Vec<(PathBuf, PathBuf)>> {
    fs::create_dir_all(staging)
        .wrap_err_with(|| format!("could not create staging directory `{}`", staging.display()))?;
    let mut staged = vec![];
    for record in records {
        let name = record
            .host_path
            .file_name()
            .ok_or_else(|| eyre::eyre!("cannot stage `{}`", record.host_path.display()))?;
        let dest = staging.join(name);
        match record.kind {
            PathKind::Directory => {
                for entry in walkdir::WalkDir::new(&record.realpath) {
                    let entry = entry?;
                    let rel = entry
                        .path()
                        .strip_prefix(&record.realpath)
                        .expect("walkdir stays under its root");
                    let target = dest.join(rel);
                    if entry.file_type().is_dir() {
                        fs::create_dir_all(&target)?;
                    } else {
                        if let Some(parent) = target.parent() {
                            fs::create_dir_all(parent)?;
                        }
                        fs::copy(entry.path(), &target)?;
                    }
                }
            }
            _ => {
                fs::copy(&record.realpath, &dest).wrap_err_with(|| {
                    format!("could not stage `{}`", record.host_path.display())
                })?;
            }
        }
        staged.push((record.host_path.clone(), dest));
    }
    Ok(staged)
}

/// Copies the selected libraries into `dir`, each under its soname, so one
/// directory bind carries the whole set into the container.
pub fn stage_libraries(libraries: &[&PathRecord], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("could not create `{}`", dir.display()))?;
    for record in libraries {
        let name = match &record.soname {
            Some(soname) => soname.clone(),
            None => record
                .realpath
                .file_name()
                .ok_or_else(|| eyre::eyre!("library without a file name"))?
                .to_string_lossy()
                .into_owned(),
        };
        fs::copy(&record.realpath, dir.join(name)).wrap_err_with(|| {
            format!("could not stage library `{}`", record.realpath.display())
        })?;
    }
    Ok(())
}

/// Fills a directory with symlinks to every library, for the bare backend
/// and for the host-library bind directory.
pub fn link_libraries(libraries: &[&PathRecord], dir: &Path) -> Result<()> {
    fs::create_dir_all(dir)
        .wrap_err_with(|| format!("could not create `{}`", dir.display()))?;
    for record in libraries {
        let name = match &record.soname {
            Some(soname) => PathBuf::from(soname),
            None => PathBuf::from(
                record
                    .realpath
                    .file_name()
                    .ok_or_else(|| eyre::eyre!("library without a file name"))?,
            ),
        };
        let link = dir.join(name);
        if link.exists() {
            continue;
        }
        #[cfg(unix)]
        std::os::unix::fs::symlink(&record.realpath, &link)
            .wrap_err_with(|| format!("could not link `{}`", record.realpath.display()))?;
        #[cfg(not(unix))]
        fs::copy(&record.realpath, &link)
            .wrap_err_with(|| format!("could not copy `{}`", record.realpath.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn command_line(cmd: &Command) -> Vec<String> {
        std::iter::once(cmd.get_program())
            .chain(cmd.get_args())
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    fn engine(backend: Backend) -> Engine {
        Engine {
            backend,
            path: Some(PathBuf::from(backend.name())),
        }
    }

    #[test]
    fn backend_names_round_trip() {
        for name in crate::profile::BACKEND_NAMES {
            let backend: Backend = name.parse().unwrap();
            assert_eq!(&backend.name(), name);
        }
        assert!("qemu".parse::<Backend>().is_err());
    }

    #[test]
    fn apptainer_command_shape() {
        let config = Config::default();
        let binds = vec![
            Bind::new("/tmp/libs", "/.e4s-cl/hostlibs").readonly(),
            Bind::new("/etc/hosts", "/etc/hosts"),
        ];
        let cmd = engine(Backend::Apptainer)
            .build_command(
                Some("image.sif"),
                &["/.e4s-cl/entry".to_owned()],
                &binds,
                &[],
                None,
                &config,
            )
            .unwrap();
        let line = command_line(&cmd);
        assert_eq!(
            line,
            vec![
                "apptainer",
                "exec",
                "-B",
                "/tmp/libs:/.e4s-cl/hostlibs:ro",
                "-B",
                "/etc/hosts:/etc/hosts",
                "image.sif",
                "/.e4s-cl/entry",
            ]
        );
    }

    #[test]
    fn podman_command_shape() {
        let config = Config::default();
        let cmd = engine(Backend::Podman)
            .build_command(
                Some("ubuntu:22.04"),
                &["/bin/true".to_owned()],
                &[Bind::new("/a", "/b")],
                &[("K".to_owned(), "V".to_owned())],
                Some(Path::new("/work")),
                &config,
            )
            .unwrap();
        let line = command_line(&cmd);
        assert_eq!(line[0], "podman");
        assert_eq!(&line[1..3], &["run", "--rm"]);
        assert!(line.windows(2).any(|w| w == ["-v", "/a:/b"]));
        assert!(line.windows(2).any(|w| w == ["-e", "K=V"]));
        assert!(line.windows(2).any(|w| w == ["-w", "/work"]));
        assert_eq!(line[line.len() - 2..], ["ubuntu:22.04", "/bin/true"]);
    }

    #[test]
    fn shifter_rejects_file_binds() {
        let config = Config::default();
        let err = engine(Backend::Shifter)
            .build_command(
                Some("ubuntu:22.04"),
                &["/bin/true".to_owned()],
                &[Bind::new("/etc/hosts", "/etc/hosts")],
                &[],
                None,
                &config,
            )
            .unwrap_err();
        assert!(err.to_string().contains("staged into a directory"));
        assert!(!Backend::Shifter.supports_file_binding());
    }

    #[test]
    fn image_required_except_bare() {
        let config = Config::default();
        assert!(engine(Backend::Docker)
            .build_command(None, &["true".to_owned()], &[], &[], None, &config)
            .is_err());
        let cmd = engine(Backend::Bare)
            .build_command(None, &["/bin/echo".to_owned(), "ok".to_owned()], &[], &[], None, &config)
            .unwrap();
        assert_eq!(command_line(&cmd), vec!["/bin/echo", "ok"]);
    }

    #[test]
    fn probe_output_parsing() {
        let output = format!(
            "12 libs found in cache\n\
             \tlibz.so.1 (libc6,x86-64) => /usr/lib/libz.so.1\n\
             {GLIBC_MARKER}\nglibc 2.35\n"
        );
        let info = parse_probe_output(&output);
        assert_eq!(
            info.libraries.get("libz.so.1"),
            Some(&PathBuf::from("/usr/lib/libz.so.1"))
        );
        assert_eq!(info.glibc_version, Some((2, 35)));

        let info = parse_probe_output("garbage");
        assert!(info.libraries.is_empty());
        assert_eq!(info.glibc_version, None);
    }

    #[test]
    fn staging_copies_files() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("input.dat");
        fs::write(&source, "payload").unwrap();
        let record = PathRecord::file(source.clone(), source);
        let staging = dir.path().join("staged");

        let staged = stage_records(&[&record], &staging).unwrap();
        assert_eq!(staged.len(), 1);
        assert_eq!(
            fs::read_to_string(staging.join("input.dat")).unwrap(),
            "payload"
        );
    }

    #[test]
    fn library_links_use_sonames() {
        let dir = tempfile::tempdir().unwrap();
        let real = dir.path().join("libthing.so.1.2.3");
        fs::write(&real, "elf!").unwrap();
        let record = PathRecord::library(
            real.clone(),
            real,
            Some("libthing.so.1".to_owned()),
            BTreeSet::new(),
        );
        let libdir = dir.path().join("hostlibs");
        link_libraries(&[&record], &libdir).unwrap();
        assert!(libdir.join("libthing.so.1").exists());
    }
}
