//! Profile records and their two-level persistent store.
//!
//! A profile bundles everything one launch needs: the backend, the image,
//! the host files and libraries to bind, an optional setup script and an
//! optional translation layer. Profiles live in a single JSON document per
//! storage level; the user-level document also carries the selection state.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::errors::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathKind {
    Library,
    File,
    Directory,
}

/// One observed filesystem path, classified.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PathRecord {
    pub kind: PathKind,
    pub host_path: PathBuf,
    /// All symlinks resolved.
    pub realpath: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soname: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub needed: BTreeSet<String>,
}

impl PathRecord {
    pub fn file(host_path: PathBuf, realpath: PathBuf) -> Self {
        PathRecord {
            kind: PathKind::File,
            host_path,
            realpath,
            soname: None,
            needed: BTreeSet::new(),
        }
    }

    pub fn directory(host_path: PathBuf, realpath: PathBuf) -> Self {
        PathRecord {
            kind: PathKind::Directory,
            host_path,
            realpath,
            soname: None,
            needed: BTreeSet::new(),
        }
    }

    pub fn library(
        host_path: PathBuf,
        realpath: PathBuf,
        soname: Option<String>,
        needed: BTreeSet<String>,
    ) -> Self {
        PathRecord {
            kind: PathKind::Library,
            host_path,
            realpath,
            soname,
            needed,
        }
    }

    /// Identity used for library deduplication: the soname when the object
    /// declares one, the fully resolved path otherwise.
    pub fn identity(&self) -> String {
        match &self.soname {
            Some(soname) => soname.clone(),
            None => self.realpath.display().to_string(),
        }
    }
}

pub const BACKEND_NAMES: &[&str] = &[
    "apptainer",
    "singularity",
    "docker",
    "podman",
    "shifter",
    "none",
];

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Profile {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub libraries: BTreeMap<String, PathRecord>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub files: BTreeMap<String, PathRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wi4mpi: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wi4mpi_options: Option<String>,
}

impl Profile {
    pub fn new(name: impl Into<String>) -> Self {
        Profile {
            name: name.into(),
            ..Default::default()
        }
    }

    /// Adds a library record, deduplicating by soname-else-realpath and
    /// keeping the sets disjoint.
    pub fn add_library(&mut self, record: PathRecord) -> Result<()> {
        let key = record.identity();
        if self.files.values().any(|f| f.host_path == record.host_path) {
            return Err(ProfileError::Overlap(record.host_path).into());
        }
        self.libraries.insert(key, record);
        Ok(())
    }

    /// Adds a file or directory record, keyed by host path.
    pub fn add_file(&mut self, record: PathRecord) -> Result<()> {
        if self
            .libraries
            .values()
            .any(|l| l.host_path == record.host_path)
        {
            return Err(ProfileError::Overlap(record.host_path).into());
        }
        self.files
            .insert(record.host_path.display().to_string(), record);
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(ProfileError::EmptyName.into());
        }
        if let Some(backend) = &self.backend {
            if !BACKEND_NAMES.contains(&backend.as_str()) {
                eyre::bail!("unknown backend `{backend}`");
            }
        }
        for library in self.libraries.values() {
            if let Some(file) = self
                .files
                .values()
                .find(|f| f.host_path == library.host_path)
            {
                return Err(ProfileError::Overlap(file.host_path.clone()).into());
            }
        }
        if let Some(wi4mpi) = &self.wi4mpi {
            crate::wi4mpi::validate_layout(wi4mpi)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageLevel {
    User,
    System,
}

impl fmt::Display for StorageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLevel::User => f.write_str("user"),
            StorageLevel::System => f.write_str("system"),
        }
    }
}

impl FromStr for StorageLevel {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(StorageLevel::User),
            "system" => Ok(StorageLevel::System),
            other => Err(eyre::eyre!("unknown storage level `{other}`")),
        }
    }
}

/// On-disk document: selection state plus every profile of one level.
/// Serialization is deterministic (struct field order plus BTreeMap keys)
/// so `dump` output diffs cleanly.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selected: Option<String>,
    #[serde(default)]
    pub profiles: Vec<Profile>,
}

/// Handle on one storage level. All operations go through an explicit store
/// value; there is no process-global state.
#[derive(Debug, Clone)]
pub struct ProfileStore {
    pub level: StorageLevel,
    path: PathBuf,
}

impl ProfileStore {
    pub fn user() -> Result<Self> {
        let home = home::home_dir().ok_or_else(|| eyre::eyre!("could not find home directory"))?;
        Ok(ProfileStore {
            level: StorageLevel::User,
            path: home.join(".local/e4s_cl/user.json"),
        })
    }

    pub fn system() -> Result<Self> {
        let prefix = crate::config::install_prefix()
            .ok_or_else(|| eyre::eyre!("could not locate the installation prefix"))?;
        Ok(ProfileStore {
            level: StorageLevel::System,
            path: prefix.join("e4s_cl/system.json"),
        })
    }

    pub fn at(level: StorageLevel, path: PathBuf) -> Self {
        ProfileStore { level, path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read(&self) -> Result<Document> {
        if !self.path.exists() {
            return Ok(Document::default());
        }
        let contents = fs::read_to_string(&self.path)
            .wrap_err_with(|| format!("could not read `{}`", self.path.display()))?;
        serde_json::from_str(&contents)
            .wrap_err_with(|| format!("malformed profile store `{}`", self.path.display()))
    }

    /// Serializes the whole document to a sibling temporary file, fsyncs and
    /// renames over the store. Concurrent writers serialize on an advisory
    /// lock next to the document.
    pub fn write(&self, document: &Document) -> Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| eyre::eyre!("store path has no parent directory"))?;
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("could not create `{}`", dir.display()))?;

        let json = serde_json::to_string_pretty(document)?;
        let mut temp = tempfile::NamedTempFile::new_in(dir)?;
        temp.write_all(json.as_bytes())?;
        temp.write_all(b"\n")?;
        temp.as_file().sync_all()?;
        temp.persist(&self.path)
            .wrap_err_with(|| format!("could not replace `{}`", self.path.display()))?;
        Ok(())
    }

    /// Read-modify-write under the store lock. The mutation sees the latest
    /// committed document; a torn write is impossible (temp file + rename).
    pub fn modify<T>(&self, mutate: impl FnOnce(&mut Document) -> Result<T>) -> Result<T> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| eyre::eyre!("store path has no parent directory"))?;
        fs::create_dir_all(dir)
            .wrap_err_with(|| format!("could not create `{}`", dir.display()))?;
        let _lock = StoreLock::acquire(&self.path.with_extension("lock"))?;

        let mut document = self.read()?;
        let result = mutate(&mut document)?;
        for profile in &document.profiles {
            profile.validate()?;
        }
        self.write(&document)?;
        Ok(result)
    }

    pub fn create(&self, profile: Profile) -> Result<()> {
        profile.validate()?;
        self.modify(|document| {
            if document.profiles.iter().any(|p| p.name == profile.name) {
                return Err(ProfileError::AlreadyExists(profile.name.clone()).into());
            }
            document.profiles.push(profile);
            document.profiles.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(())
        })
    }

    pub fn get(&self, name: &str) -> Result<Option<Profile>> {
        Ok(self
            .read()?
            .profiles
            .into_iter()
            .find(|p| p.name == name))
    }

    pub fn list(&self) -> Result<Vec<Profile>> {
        Ok(self.read()?.profiles)
    }

    /// Replaces the named profile wholesale. The stored record is untouched
    /// if the replacement violates an invariant.
    pub fn update(&self, name: &str, profile: Profile) -> Result<()> {
        profile.validate()?;
        self.modify(|document| {
            let new_name = profile.name.clone();
            let slot = document
                .profiles
                .iter_mut()
                .find(|p| p.name == name)
                .ok_or_else(|| ProfileError::NotFound(name.to_owned()))?;
            *slot = profile;
            // selection follows a rename
            if document.selected.as_deref() == Some(name) {
                document.selected = Some(new_name);
            }
            document.profiles.sort_by(|a, b| a.name.cmp(&b.name));
            Ok(())
        })
    }

    pub fn delete(&self, name: &str) -> Result<()> {
        self.modify(|document| {
            if document.selected.as_deref() == Some(name) {
                return Err(ProfileError::DeleteSelected(name.to_owned()).into());
            }
            let before = document.profiles.len();
            document.profiles.retain(|p| p.name != name);
            if document.profiles.len() == before {
                return Err(ProfileError::NotFound(name.to_owned()).into());
            }
            Ok(())
        })
    }

    pub fn select(&self, name: &str) -> Result<()> {
        self.modify(|document| {
            if !document.profiles.iter().any(|p| p.name == name) {
                return Err(ProfileError::NotFound(name.to_owned()).into());
            }
            document.selected = Some(name.to_owned());
            Ok(())
        })
    }

    pub fn unselect(&self) -> Result<()> {
        self.modify(|document| {
            document.selected = None;
            Ok(())
        })
    }

    pub fn selected(&self) -> Result<Option<String>> {
        Ok(self.read()?.selected)
    }
}

/// User store with system fallback for reads; writes always target the user
/// level unless the caller named a level explicitly.
#[derive(Debug, Clone)]
pub struct Stores {
    pub user: ProfileStore,
    pub system: Option<ProfileStore>,
}

impl Stores {
    pub fn open() -> Result<Self> {
        Ok(Stores {
            user: ProfileStore::user()?,
            system: ProfileStore::system().ok(),
        })
    }

    /// Implicit writes land in the user store; the system store is only
    /// writable when named explicitly (and the filesystem permits it).
    pub fn writable(&self, level: Option<StorageLevel>) -> Result<&ProfileStore> {
        match level {
            None | Some(StorageLevel::User) => Ok(&self.user),
            Some(StorageLevel::System) => self
                .system
                .as_ref()
                .ok_or_else(|| ProfileError::ReadOnlyStore.into()),
        }
    }

    pub fn level(&self, level: StorageLevel) -> Option<&ProfileStore> {
        match level {
            StorageLevel::User => Some(&self.user),
            StorageLevel::System => self.system.as_ref(),
        }
    }

    /// User store first, system store as fallback.
    pub fn get(&self, name: &str) -> Result<Option<Profile>> {
        if let Some(profile) = self.user.get(name)? {
            return Ok(Some(profile));
        }
        match &self.system {
            Some(system) => system.get(name),
            None => Ok(None),
        }
    }

    pub fn list(&self, level: Option<StorageLevel>) -> Result<Vec<(StorageLevel, Profile)>> {
        let mut profiles = vec![];
        let stores: Vec<&ProfileStore> = match level {
            Some(level) => self.level(level).into_iter().collect(),
            None => [Some(&self.user), self.system.as_ref()]
                .into_iter()
                .flatten()
                .collect(),
        };
        for store in stores {
            for profile in store.list()? {
                profiles.push((store.level, profile));
            }
        }
        Ok(profiles)
    }

    pub fn selected(&self) -> Result<Option<Profile>> {
        let name = match self.user.selected()? {
            Some(name) => name,
            None => return Ok(None),
        };
        match self.get(&name)? {
            Some(profile) => Ok(Some(profile)),
            None => Ok(None),
        }
    }
}

struct StoreLock {
    file: fs::File,
}

impl StoreLock {
    #[cfg(unix)]
    fn acquire(path: &Path) -> Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("could not open lock file `{}`", path.display()))?;
        nix::fcntl::flock(file.as_raw_fd(), nix::fcntl::FlockArg::LockExclusive)
            .wrap_err_with(|| format!("could not lock `{}`", path.display()))?;
        Ok(StoreLock { file })
    }

    #[cfg(not(unix))]
    fn acquire(_path: &Path) -> Result<Self> {
        eyre::bail!("profile store locking requires a unix host")
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::io::AsRawFd;
            nix::fcntl::flock(self.file.as_raw_fd(), nix::fcntl::FlockArg::Unlock).ok();
        }
    }
}

/// Renders a document with sorted keys for `dump` and `diff`.
pub fn render(document: &Document) -> Result<String> {
    Ok(serde_json::to_string_pretty(document)?)
}

/// Field-by-field difference of two profiles, as printable lines.
pub fn diff(a: &Profile, b: &Profile) -> Vec<String> {
    let mut lines = vec![];
    let mut field = |name: &str, left: String, right: String| {
        if left != right {
            lines.push(format!("{name}: {left} != {right}"));
        }
    };
    let show = |o: &Option<String>| o.clone().unwrap_or_else(|| "<unset>".into());
    let show_path =
        |o: &Option<PathBuf>| o.as_ref().map_or("<unset>".into(), |p| p.display().to_string());

    field("backend", show(&a.backend), show(&b.backend));
    field("image", show(&a.image), show(&b.image));
    field("source", show_path(&a.source), show_path(&b.source));
    field("wi4mpi", show_path(&a.wi4mpi), show_path(&b.wi4mpi));
    field(
        "wi4mpi_options",
        show(&a.wi4mpi_options),
        show(&b.wi4mpi_options),
    );

    let keys = |m: &BTreeMap<String, PathRecord>| m.keys().cloned().collect::<BTreeSet<_>>();
    for only in keys(&a.libraries).difference(&keys(&b.libraries)) {
        lines.push(format!("library only in `{}`: {only}", a.name));
    }
    for only in keys(&b.libraries).difference(&keys(&a.libraries)) {
        lines.push(format!("library only in `{}`: {only}", b.name));
    }
    for only in keys(&a.files).difference(&keys(&b.files)) {
        lines.push(format!("file only in `{}`: {only}", a.name));
    }
    for only in keys(&b.files).difference(&keys(&a.files)) {
        lines.push(format!("file only in `{}`: {only}", b.name));
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, ProfileStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = ProfileStore::at(StorageLevel::User, dir.path().join("user.json"));
        (dir, store)
    }

    fn library(path: &str, soname: &str) -> PathRecord {
        PathRecord::library(
            PathBuf::from(path),
            PathBuf::from(path),
            Some(soname.to_owned()),
            BTreeSet::new(),
        )
    }

    #[test]
    fn round_trip() {
        let (_dir, store) = store();
        let mut profile = Profile::new("mvapich");
        profile.backend = Some("podman".to_owned());
        profile.image = Some("registry/ubuntu:22.04".to_owned());
        profile
            .add_library(library("/usr/lib64/libmpi.so.12", "libmpi.so.12"))
            .unwrap();
        store.create(profile.clone()).unwrap();

        assert_eq!(store.get("mvapich").unwrap(), Some(profile));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn deterministic_serialization() {
        let (_dir, store) = store();
        let mut profile = Profile::new("p");
        profile
            .add_library(library("/lib/b.so.1", "b.so.1"))
            .unwrap();
        profile
            .add_library(library("/lib/a.so.1", "a.so.1"))
            .unwrap();
        store.create(profile).unwrap();

        let first = fs::read_to_string(store.path()).unwrap();
        // rewrite the same document; bytes must not change
        store.modify(|_| Ok(())).unwrap();
        let second = fs::read_to_string(store.path()).unwrap();
        assert_eq!(first, second);
        // keys come out sorted
        assert!(first.find("a.so.1").unwrap() < first.find("b.so.1").unwrap());
    }

    #[test]
    fn library_dedup_by_soname() {
        let mut profile = Profile::new("p");
        profile
            .add_library(library("/lib/x.so.1", "x.so.1"))
            .unwrap();
        profile
            .add_library(library("/lib/x.so.1", "x.so.1"))
            .unwrap();
        assert_eq!(profile.libraries.len(), 1);
    }

    #[test]
    fn overlap_rejected() {
        let mut profile = Profile::new("p");
        profile
            .add_file(PathRecord::file(
                PathBuf::from("/etc/hosts"),
                PathBuf::from("/etc/hosts"),
            ))
            .unwrap();
        let err = profile
            .add_library(library("/etc/hosts", "hosts.so"))
            .unwrap_err();
        assert!(err.downcast_ref::<ProfileError>().is_some());
    }

    #[test]
    fn selection_lifecycle() {
        let (_dir, store) = store();
        store.create(Profile::new("a")).unwrap();
        store.create(Profile::new("b")).unwrap();

        assert_eq!(store.selected().unwrap(), None);
        store.select("a").unwrap();
        assert_eq!(store.selected().unwrap(), Some("a".to_owned()));

        // only one profile selected at a time
        store.select("b").unwrap();
        assert_eq!(store.selected().unwrap(), Some("b".to_owned()));

        // selected profiles cannot be deleted
        let err = store.delete("b").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProfileError>(),
            Some(ProfileError::DeleteSelected(_))
        ));
        store.unselect().unwrap();
        assert_eq!(store.selected().unwrap(), None);
        store.delete("b").unwrap();
    }

    #[test]
    fn duplicate_create_rejected() {
        let (_dir, store) = store();
        store.create(Profile::new("p")).unwrap();
        let err = store.create(Profile::new("p")).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ProfileError>(),
            Some(ProfileError::AlreadyExists(_))
        ));
    }

    #[test]
    fn update_is_all_or_nothing() {
        let (_dir, store) = store();
        store.create(Profile::new("p")).unwrap();

        let mut bad = Profile::new("p");
        bad.backend = Some("hypervisor".to_owned());
        assert!(store.update("p", bad).is_err());

        // stored record untouched
        let stored = store.get("p").unwrap().unwrap();
        assert_eq!(stored.backend, None);
    }

    #[test]
    fn diff_reports_field_and_set_changes() {
        let mut a = Profile::new("a");
        a.backend = Some("podman".to_owned());
        a.add_library(library("/lib/x.so.1", "x.so.1")).unwrap();
        let mut b = Profile::new("b");
        b.backend = Some("docker".to_owned());
        b.add_library(library("/lib/y.so.1", "y.so.1")).unwrap();

        let lines = diff(&a, &b);
        assert!(lines.iter().any(|l| l.starts_with("backend:")));
        assert!(lines.iter().any(|l| l.contains("x.so.1")));
        assert!(lines.iter().any(|l| l.contains("y.so.1")));
        assert!(diff(&a, &a).is_empty());
    }
}
