use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::errors::*;
use crate::shell::MessageInfo;

/// Per-backend configuration table.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Default, Clone)]
pub struct BackendConfig {
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub run_options: Vec<String>,
    pub executable: Option<String>,
}

/// One configuration document. Every field is optional so documents merge
/// per top-level key, later files overriding earlier ones.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct ConfigFile {
    pub container_directory: Option<String>,
    pub launcher_options: Option<Vec<String>>,
    pub preload_root_libraries: Option<bool>,
    pub disable_ranked_log: Option<bool>,
    pub apptainer: Option<BackendConfig>,
    pub singularity: Option<BackendConfig>,
    pub docker: Option<BackendConfig>,
    pub podman: Option<BackendConfig>,
    pub shifter: Option<BackendConfig>,
}

impl ConfigFile {
    /// Parses a YAML document. Unknown keys are collected for the caller to
    /// warn about; value shape mismatches are hard errors.
    pub fn parse(yaml: &str) -> Result<(Self, BTreeSet<String>)> {
        let deserializer = serde_yaml::Deserializer::from_str(yaml);
        let mut unused = BTreeSet::new();
        let cfg = serde_ignored::deserialize(deserializer, |path| {
            unused.insert(path.to_string());
        })?;
        Ok((cfg, unused))
    }

    fn merge(&mut self, other: ConfigFile) {
        macro_rules! take {
            ($($field:ident),*) => {
                $(if other.$field.is_some() {
                    self.$field = other.$field;
                })*
            };
        }
        take!(
            container_directory,
            launcher_options,
            preload_root_libraries,
            disable_ranked_log,
            apptainer,
            singularity,
            docker,
            podman,
            shifter
        );
    }
}

/// Fully resolved configuration with defaults applied.
#[derive(Debug, Clone)]
pub struct Config {
    pub container_directory: String,
    pub launcher_options: Vec<String>,
    pub preload_root_libraries: bool,
    pub disable_ranked_log: bool,
    apptainer: BackendConfig,
    singularity: BackendConfig,
    docker: BackendConfig,
    podman: BackendConfig,
    shifter: BackendConfig,
}

impl Default for Config {
    fn default() -> Self {
        Config::from_file(ConfigFile::default())
    }
}

impl Config {
    pub fn from_file(file: ConfigFile) -> Self {
        let container_directory = env::var("E4S_CL_CONTAINER_DIR")
            .ok()
            .or(file.container_directory)
            .unwrap_or_else(|| crate::CONTAINER_DIR.to_owned());
        Config {
            container_directory,
            launcher_options: file.launcher_options.unwrap_or_default(),
            preload_root_libraries: file.preload_root_libraries.unwrap_or(false),
            disable_ranked_log: file.disable_ranked_log.unwrap_or(false),
            apptainer: file.apptainer.unwrap_or_default(),
            singularity: file.singularity.unwrap_or_default(),
            docker: file.docker.unwrap_or_default(),
            podman: file.podman.unwrap_or_default(),
            shifter: file.shifter.unwrap_or_default(),
        }
    }

    /// Loads and merges every configuration file on the search path.
    pub fn load(msg_info: &mut MessageInfo) -> Result<Self> {
        let mut merged = ConfigFile::default();
        for path in search_path() {
            if !path.exists() {
                continue;
            }
            let contents = fs::read_to_string(&path)
                .wrap_err_with(|| format!("could not read `{}`", path.display()))?;
            let (file, unused) = ConfigFile::parse(&contents)
                .wrap_err_with(|| format!("malformed configuration in `{}`", path.display()))?;
            if !unused.is_empty() {
                msg_info.warn(format!(
                    "unused key(s) in `{}`:\n > {}",
                    path.display(),
                    unused.into_iter().collect::<Vec<_>>().join(", ")
                ));
            }
            merged.merge(file);
        }
        Ok(Config::from_file(merged))
    }

    pub fn backend(&self, name: &str) -> &BackendConfig {
        match name {
            "apptainer" => &self.apptainer,
            "singularity" => &self.singularity,
            "docker" => &self.docker,
            "podman" => &self.podman,
            "shifter" => &self.shifter,
            _ => {
                static EMPTY: BackendConfig = BackendConfig {
                    options: Vec::new(),
                    run_options: Vec::new(),
                    executable: None,
                };
                &EMPTY
            }
        }
    }
}

/// `/etc`, then the installation prefix, then the user's own file; later
/// entries override earlier ones.
fn search_path() -> Vec<PathBuf> {
    let mut paths = vec![PathBuf::from("/etc/e4s-cl/e4s-cl.yaml")];
    if let Some(prefix) = install_prefix() {
        paths.push(prefix.join("e4s-cl.yaml"));
    }
    if let Some(home) = home::home_dir() {
        paths.push(home.join(".config/e4s-cl.yaml"));
    }
    paths
}

/// Directory the binary was installed under (`<prefix>/bin/e4s-cl`).
pub fn install_prefix() -> Option<PathBuf> {
    env::current_exe()
        .ok()?
        .parent()?
        .parent()
        .map(Path::to_path_buf)
}

/// Extra backend arguments taken verbatim from the environment
/// (`E4S_CL_APPTAINER_EXEC_OPTIONS` and friends), split shell-style.
pub fn env_options(var: &str) -> Result<Vec<String>> {
    match env::var(var) {
        Ok(value) => shell_words::split(&value)
            .wrap_err_with(|| format!("could not parse options in `{var}`")),
        Err(_) => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_reports_unused_keys() {
        let yaml = "container_directory: /.e4s-cl\nno_such_key: 1\n";
        let (cfg, unused) = ConfigFile::parse(yaml).unwrap();
        assert_eq!(cfg.container_directory.as_deref(), Some("/.e4s-cl"));
        assert!(unused.contains("no_such_key"));
    }

    #[test]
    fn parse_rejects_bad_shapes() {
        // a list where a bool belongs is an error, not a warning
        let yaml = "preload_root_libraries:\n  - yes\n";
        assert!(ConfigFile::parse(yaml).is_err());
    }

    #[test]
    fn later_documents_override() {
        let (system, _) = ConfigFile::parse("container_directory: /system\n").unwrap();
        let (user, _) = ConfigFile::parse(
            "container_directory: /user\npreload_root_libraries: true\n",
        )
        .unwrap();
        let mut merged = ConfigFile::default();
        merged.merge(system);
        merged.merge(user);
        assert_eq!(merged.container_directory.as_deref(), Some("/user"));
        assert_eq!(merged.preload_root_libraries, Some(true));
    }

    #[test]
    fn backend_tables() {
        let yaml = "podman:\n  run_options: [\"--ipc=host\"]\n  executable: /opt/bin/podman\n";
        let (file, unused) = ConfigFile::parse(yaml).unwrap();
        assert!(unused.is_empty());
        let config = Config::from_file(file);
        let podman = config.backend("podman");
        assert_eq!(podman.run_options, vec!["--ipc=host".to_owned()]);
        assert_eq!(podman.executable.as_deref(), Some("/opt/bin/podman"));
        assert!(config.backend("docker").run_options.is_empty());
    }
}
