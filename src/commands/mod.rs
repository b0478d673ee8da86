pub mod detect;
pub mod execute;
pub mod init;
pub mod launch;
pub mod profile;

use std::path::PathBuf;
use std::str::FromStr;

use crate::errors::*;
use crate::profile::{PathRecord, Profile, Stores};
use crate::resolve::{self, ClassifyPolicy};
use crate::shell::MessageInfo;

/// Flags shared by `launch` and `__execute` that override or stand in for a
/// stored profile.
#[derive(clap::Args, Debug, Clone, Default)]
pub struct ProfileOverrides {
    /// Profile to launch with (defaults to the selected profile).
    #[clap(long)]
    pub profile: Option<String>,
    /// Container image identifier.
    #[clap(long)]
    pub image: Option<String>,
    /// Container backend (apptainer, singularity, docker, podman, shifter, none).
    #[clap(long)]
    pub backend: Option<String>,
    /// Comma-separated host libraries to bind.
    #[clap(long, value_delimiter = ',')]
    pub libraries: Vec<PathBuf>,
    /// Comma-separated host files or directories to bind.
    #[clap(long, value_delimiter = ',')]
    pub files: Vec<PathBuf>,
    /// Script sourced inside the container before the command runs.
    #[clap(long)]
    pub source: Option<PathBuf>,
    /// Path to a translation layer installation.
    #[clap(long)]
    pub wi4mpi: Option<PathBuf>,
}

impl ProfileOverrides {
    pub fn is_empty(&self) -> bool {
        self.profile.is_none()
            && self.image.is_none()
            && self.backend.is_none()
            && self.libraries.is_empty()
            && self.files.is_empty()
            && self.source.is_none()
            && self.wi4mpi.is_none()
    }

    /// The profile one launch runs with: the named (or selected) profile
    /// with command-line overrides applied on top, or a purely ad-hoc
    /// record when no stored profile is involved.
    pub fn resolve(&self, stores: &Stores, msg_info: &mut MessageInfo) -> Result<Profile> {
        let mut profile = match &self.profile {
            Some(name) => stores
                .get(name)?
                .ok_or_else(|| ProfileError::NotFound(name.clone()))?,
            None => match stores.selected()? {
                Some(profile) => profile,
                None if self.image.is_some() || self.backend.is_some() => {
                    Profile::new("<command line>")
                }
                None => return Err(ProfileError::NothingSelected)
                    .suggestion("select a profile with `e4s-cl profile select`, or pass --profile/--image/--backend"),
            },
        };

        if let Some(image) = &self.image {
            profile.image = Some(image.clone());
        }
        if let Some(backend) = &self.backend {
            crate::Backend::from_str(backend)?;
            profile.backend = Some(backend.clone());
        }
        if let Some(source) = &self.source {
            profile.source = Some(source.clone());
        }
        if let Some(wi4mpi) = &self.wi4mpi {
            profile.wi4mpi = Some(wi4mpi.clone());
        }
        for record in classify_arguments(&self.libraries, msg_info)? {
            profile.add_library(record)?;
        }
        for record in classify_arguments(&self.files, msg_info)? {
            match record.kind {
                crate::PathKind::Library => profile.add_library(record)?,
                _ => profile.add_file(record)?,
            }
        }
        Ok(profile)
    }

    /// The flags to forward to the per-rank worker, mirroring what was given
    /// to `launch`.
    pub fn forwarded_args(&self) -> Vec<String> {
        let mut args = vec![];
        let mut push_opt = |flag: &str, value: &Option<String>| {
            if let Some(value) = value {
                args.push(flag.to_owned());
                args.push(value.clone());
            }
        };
        push_opt("--profile", &self.profile);
        push_opt("--image", &self.image);
        push_opt("--backend", &self.backend);
        push_opt(
            "--source",
            &self.source.as_ref().map(|p| p.display().to_string()),
        );
        push_opt(
            "--wi4mpi",
            &self.wi4mpi.as_ref().map(|p| p.display().to_string()),
        );
        let join = |paths: &[PathBuf]| {
            paths
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(",")
        };
        if !self.libraries.is_empty() {
            args.push("--libraries".to_owned());
            args.push(join(&self.libraries));
        }
        if !self.files.is_empty() {
            args.push("--files".to_owned());
            args.push(join(&self.files));
        }
        args
    }
}

/// Classifies user-supplied paths, warning about what gets dropped.
pub fn classify_arguments(
    paths: &[PathBuf],
    msg_info: &mut MessageInfo,
) -> Result<Vec<PathRecord>> {
    let policy = ClassifyPolicy::new();
    let classified = resolve::classify(paths.iter().cloned(), &policy);
    for (path, reason) in &classified.rejected {
        msg_info.warn(format!("ignoring `{}`: {reason}", path.display()));
    }
    let mut records = classified.libraries;
    records.extend(classified.files);
    records.extend(classified.directories);
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::{ProfileStore, StorageLevel};

    fn test_stores(dir: &std::path::Path) -> Stores {
        Stores {
            user: ProfileStore::at(StorageLevel::User, dir.join("user.json")),
            system: None,
        }
    }

    #[test]
    fn resolve_prefers_flag_over_selection() {
        let dir = tempfile::tempdir().unwrap();
        let stores = test_stores(dir.path());
        let mut flagged = Profile::new("flagged");
        flagged.image = Some("a.sif".to_owned());
        stores.user.create(flagged).unwrap();
        stores.user.create(Profile::new("chosen")).unwrap();
        stores.user.select("chosen").unwrap();

        let overrides = ProfileOverrides {
            profile: Some("flagged".to_owned()),
            ..Default::default()
        };
        let profile = overrides
            .resolve(&stores, &mut MessageInfo::default())
            .unwrap();
        assert_eq!(profile.name, "flagged");
    }

    #[test]
    fn resolve_falls_back_to_selected_then_adhoc() {
        let dir = tempfile::tempdir().unwrap();
        let stores = test_stores(dir.path());

        // nothing selected, no flags: user error
        let overrides = ProfileOverrides::default();
        assert!(overrides
            .resolve(&stores, &mut MessageInfo::default())
            .is_err());

        // ad-hoc launch from flags alone
        let overrides = ProfileOverrides {
            image: Some("ubuntu:22.04".to_owned()),
            backend: Some("podman".to_owned()),
            ..Default::default()
        };
        let profile = overrides
            .resolve(&stores, &mut MessageInfo::default())
            .unwrap();
        assert_eq!(profile.image.as_deref(), Some("ubuntu:22.04"));
        assert_eq!(profile.backend.as_deref(), Some("podman"));
    }

    #[test]
    fn overrides_apply_on_top_of_stored_profile() {
        let dir = tempfile::tempdir().unwrap();
        let stores = test_stores(dir.path());
        let mut stored = Profile::new("p");
        stored.image = Some("old.sif".to_owned());
        stored.backend = Some("apptainer".to_owned());
        stores.user.create(stored).unwrap();

        let overrides = ProfileOverrides {
            profile: Some("p".to_owned()),
            image: Some("new.sif".to_owned()),
            ..Default::default()
        };
        let profile = overrides
            .resolve(&stores, &mut MessageInfo::default())
            .unwrap();
        assert_eq!(profile.image.as_deref(), Some("new.sif"));
        assert_eq!(profile.backend.as_deref(), Some("apptainer"));
    }

    #[test]
    fn forwarded_args_mirror_flags() {
        let overrides = ProfileOverrides {
            profile: Some("p".to_owned()),
            backend: Some("podman".to_owned()),
            files: vec![PathBuf::from("/etc/hosts"), PathBuf::from("/data")],
            ..Default::default()
        };
        let args = overrides.forwarded_args();
        assert_eq!(
            args,
            [
                "--profile",
                "p",
                "--backend",
                "podman",
                "--files",
                "/etc/hosts,/data"
            ]
        );
    }
}
