//! `__execute`: the per-rank worker. Never documented to users; the
//! launcher invokes it once per rank with the frozen launch settings.

use std::env;
use std::path::{Path, PathBuf};

use clap::Args;

use crate::config::Config;
use crate::container::{self, Backend, Bind, Engine};
use crate::errors::*;
use crate::mpi::Family;
use crate::profile::{PathKind, PathRecord, Profile, Stores};
use crate::resolve::{self, ClassifyPolicy};
use crate::script::EntryScript;
use crate::shell::MessageInfo;
use crate::wi4mpi::{self, Wi4mpiEnv};

use super::ProfileOverrides;

/// Environment that must not leak from the host into the container.
const ENV_FILTER: &[&str] = &[
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "PYTHONHOME",
    "PYTHONPATH",
];

#[derive(Args, Debug)]
#[clap(trailing_var_arg = true)]
pub struct Execute {
    #[clap(flatten)]
    pub overrides: ProfileOverrides,
    /// MPI family of the containerized binary, when translating.
    #[clap(long)]
    pub from: Option<Family>,
    /// MPI family of the host runtime, when translating.
    #[clap(long)]
    pub to: Option<Family>,
    /// The user command to run inside the container.
    #[clap(allow_hyphen_values = true, required = true)]
    pub command: Vec<String>,
}

impl Execute {
    pub fn run(
        self,
        stores: &Stores,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<i32> {
        let profile = self.overrides.resolve(stores, msg_info)?;
        let backend = backend_of(&profile)?;
        let engine = Engine::new(backend, config)?;

        let wi4mpi_env = self.translation_env(&profile, &engine, config, msg_info)?;

        // the library set completes on the executing node, which may see
        // paths the detect host did not
        let policy = ClassifyPolicy::new();
        let mut libraries: Vec<PathRecord> = profile.libraries.values().cloned().collect();
        resolve::complete_libraries(&mut libraries, &policy, msg_info);

        let container_probe = match engine.probe(profile.image.as_deref(), config, msg_info) {
            Ok(probe) => probe,
            Err(e) => {
                msg_info.warn(format!("could not probe the container: {e}"));
                Default::default()
            }
        };
        let selected = resolve::select_binds(&libraries, &container_probe, msg_info);

        // per-rank private staging, no sharing between ranks
        let staging = rank_staging_dir()?;
        let hostlibs = staging.join(crate::HOST_LIBS_DIR);

        let status = if backend == Backend::Bare {
            container::link_libraries(&selected, &hostlibs)?;
            let entry =
                self.entry_script(&profile, &hostlibs, &selected, &hostlibs, wi4mpi_env, config);
            let entry_path = entry.write(&staging)?;
            filter_environment();
            engine.execute(
                None,
                &[entry_path.display().to_string()],
                &[],
                &[],
                None,
                config,
                msg_info,
            )?
        } else {
            container::stage_libraries(&selected, &hostlibs)?;
            let container_dir = PathBuf::from(&config.container_directory);
            let container_libs = container_dir.join(crate::HOST_LIBS_DIR);
            let entry = self.entry_script(
                &profile,
                &container_libs,
                &selected,
                &container_libs,
                wi4mpi_env,
                config,
            );
            entry.write(&staging)?;

            let mut binds = vec![
                Bind::new(&staging, &container_dir),
                Bind::new(&hostlibs, &container_libs).readonly(),
            ];
            binds.extend(file_binds(&profile, &staging, &container_dir, backend)?);

            filter_environment();
            let command = vec![container_dir.join(crate::ENTRY_SCRIPT).display().to_string()];
            engine.execute(
                profile.image.as_deref(),
                &command,
                &binds,
                &[],
                None,
                config,
                msg_info,
            )?
        };

        Ok(status.code().unwrap_or(1))
    }

    fn entry_script(
        &self,
        profile: &Profile,
        library_dir: &Path,
        selected: &[&PathRecord],
        preload_dir: &Path,
        wi4mpi: Option<Wi4mpiEnv>,
        config: &Config,
    ) -> EntryScript {
        let preload = if config.preload_root_libraries {
            selected
                .iter()
                .map(|record| preload_dir.join(record.identity()))
                .collect()
        } else {
            vec![]
        };
        EntryScript {
            library_dir: library_dir.to_path_buf(),
            source: profile.source.clone(),
            preload,
            wi4mpi,
            command: self.command.clone(),
        }
    }

    /// Translation setup: only active when the launch front decided so.
    fn translation_env(
        &self,
        profile: &Profile,
        engine: &Engine,
        config: &Config,
        msg_info: &mut MessageInfo,
    ) -> Result<Option<Wi4mpiEnv>> {
        let (from, to) = match (self.from, self.to) {
            (Some(from), Some(to)) => (from, to),
            (None, None) => return Ok(None),
            _ => eyre::bail!("--from and --to must be passed together"),
        };

        let root = match &profile.wi4mpi {
            Some(root) => root.clone(),
            None => default_wi4mpi_prefix(from, to)?,
        };
        if engine.backend == Backend::Bare && !root.is_dir() {
            return Err(EnvironmentError(
                "MPI translation requires a container backend to build the translation layer"
                    .to_owned(),
            )
            .into());
        }
        wi4mpi::ensure_installed(&root, from.as_str(), to.as_str(), engine, config, msg_info)?;
        Ok(Some(Wi4mpiEnv {
            root,
            from: from.to_string(),
            to: to.to_string(),
            options: profile.wi4mpi_options.clone(),
        }))
    }
}

fn backend_of(profile: &Profile) -> Result<Backend> {
    match (&profile.backend, &profile.image) {
        (Some(name), _) => name.parse(),
        (None, None) => Ok(Backend::Bare),
        (None, Some(_)) => {
            eyre::bail!("the profile names an image but no backend to run it with")
        }
    }
}

/// `/tmp/.e4s-cl/<pid>`: private to this rank, cannot collide across the
/// launcher's fork-exec fan-out.
fn rank_staging_dir() -> Result<PathBuf> {
    let dir = env::temp_dir()
        .join(".e4s-cl")
        .join(std::process::id().to_string());
    std::fs::create_dir_all(&dir)
        .wrap_err_with(|| format!("could not create staging directory `{}`", dir.display()))?;
    Ok(dir)
}

fn default_wi4mpi_prefix(from: Family, to: Family) -> Result<PathBuf> {
    let home = home::home_dir().ok_or_else(|| eyre::eyre!("could not find home directory"))?;
    Ok(home
        .join(".local/e4s_cl/wi4mpi")
        .join(format!("{from}-to-{to}")))
}

/// The profile's files and directories as bind requests. Backends without
/// per-file binding get the files staged into one bound directory.
fn file_binds(
    profile: &Profile,
    staging: &Path,
    container_dir: &Path,
    backend: Backend,
) -> Result<Vec<Bind>> {
    let mut binds = vec![];
    let records: Vec<&PathRecord> = profile.files.values().collect();

    if backend.supports_file_binding() {
        for record in records {
            binds.push(Bind::new(&record.host_path, &record.host_path));
        }
        return Ok(binds);
    }

    // stage single files, bind directories as they are
    let mut to_stage = vec![];
    for record in records {
        match record.kind {
            PathKind::Directory => {
                binds.push(Bind::new(&record.host_path, &record.host_path));
            }
            _ => to_stage.push(record),
        }
    }
    if !to_stage.is_empty() {
        let staged_dir = staging.join("files");
        container::stage_records(&to_stage, &staged_dir)?;
        binds.push(Bind::new(&staged_dir, container_dir.join("files")));
    }
    Ok(binds)
}

/// Strips host-only environment from this rank before the backend starts;
/// backends that inherit the environment would otherwise leak it inside.
fn filter_environment() {
    for var in ENV_FILTER {
        env::remove_var(var);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    #[test]
    fn backend_resolution() {
        let mut profile = Profile::new("p");
        assert_eq!(backend_of(&profile).unwrap(), Backend::Bare);

        profile.backend = Some("shifter".to_owned());
        assert_eq!(backend_of(&profile).unwrap(), Backend::Shifter);

        profile.backend = None;
        profile.image = Some("img.sif".to_owned());
        assert!(backend_of(&profile).is_err());
    }

    #[test]
    fn shifter_files_are_staged_not_bound() {
        let dir = tempfile::tempdir().unwrap();
        let data = dir.path().join("input.dat");
        std::fs::write(&data, "x").unwrap();

        let mut profile = Profile::new("p");
        profile
            .add_file(PathRecord::file(data.clone(), data.clone()))
            .unwrap();

        let staging = dir.path().join("staging");
        let binds = file_binds(
            &profile,
            &staging,
            Path::new("/.e4s-cl"),
            Backend::Shifter,
        )
        .unwrap();

        // one directory bind, no per-file bind
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].source, staging.join("files"));
        assert_eq!(binds[0].target, Path::new("/.e4s-cl/files"));
        assert!(staging.join("files/input.dat").exists());
    }

    #[test]
    fn file_binds_in_place_for_binding_backends() {
        let mut profile = Profile::new("p");
        profile
            .add_file(PathRecord::file(
                PathBuf::from("/etc/hosts"),
                PathBuf::from("/etc/hosts"),
            ))
            .unwrap();
        let binds = file_binds(
            &profile,
            Path::new("/tmp/.e4s-cl/1"),
            Path::new("/.e4s-cl"),
            Backend::Podman,
        )
        .unwrap();
        assert_eq!(binds.len(), 1);
        assert_eq!(binds[0].source, Path::new("/etc/hosts"));
        assert_eq!(binds[0].target, Path::new("/etc/hosts"));
    }

    #[test]
    fn preload_list_follows_config() {
        let record = PathRecord::library(
            PathBuf::from("/lib/libmpi.so.12"),
            PathBuf::from("/lib/libmpi.so.12"),
            Some("libmpi.so.12".to_owned()),
            BTreeSet::new(),
        );
        let selected = vec![&record];
        let execute = Execute {
            overrides: ProfileOverrides::default(),
            from: None,
            to: None,
            command: vec!["./a.out".to_owned()],
        };

        let profile = Profile::new("p");
        let mut config = Config::default();
        config.preload_root_libraries = true;
        let entry = execute.entry_script(
            &profile,
            Path::new("/.e4s-cl/hostlibs"),
            &selected,
            Path::new("/.e4s-cl/hostlibs"),
            None,
            &config,
        );
        assert_eq!(
            entry.preload,
            vec![PathBuf::from("/.e4s-cl/hostlibs/libmpi.so.12")]
        );

        config.preload_root_libraries = false;
        let entry = execute.entry_script(
            &profile,
            Path::new("/.e4s-cl/hostlibs"),
            &selected,
            Path::new("/.e4s-cl/hostlibs"),
            None,
            &config,
        );
        assert!(entry.preload.is_empty());
    }
}
