//! Path classification and library resolution.
//!
//! Raw path observations from the tracer come in as a bag; what comes out is
//! a disjoint set of libraries, files and directories, with the library set
//! completed over `DT_NEEDED` and later filtered against the container's own
//! sonames before binding.

use std::cmp::Ordering;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::elf;
use crate::errors::*;
use crate::extensions::CommandExt;
use crate::profile::{PathKind, PathRecord};
use crate::shell::MessageInfo;

/// Paths that only exist inside containers; observing one on the host side
/// is always noise.
pub const CONTAINER_ONLY_PREFIXES: &[&str] = &["/.e4s-cl"];

/// Default dynamic-linker search directories, consulted after
/// `LD_LIBRARY_PATH` and before the ldconfig cache.
const DEFAULT_SEARCH_DIRS: &[&str] = &["/lib64", "/lib", "/usr/lib64", "/usr/lib"];

#[derive(Debug, Clone, Default)]
pub struct ClassifyPolicy {
    /// Prefixes dropped unconditionally.
    pub container_only_prefixes: Vec<PathBuf>,
    /// `LD_LIBRARY_PATH` captured at detect time.
    pub ld_library_path: Vec<PathBuf>,
}

impl ClassifyPolicy {
    pub fn new() -> Self {
        ClassifyPolicy {
            container_only_prefixes: CONTAINER_ONLY_PREFIXES
                .iter()
                .map(PathBuf::from)
                .collect(),
            ld_library_path: std::env::var_os("LD_LIBRARY_PATH")
                .map(|p| std::env::split_paths(&p).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct Classification {
    pub libraries: Vec<PathRecord>,
    pub files: Vec<PathRecord>,
    pub directories: Vec<PathRecord>,
    /// Dropped paths with the reason, for user-facing warnings.
    pub rejected: Vec<(PathBuf, String)>,
}

/// Classifies a bag of absolute paths. Idempotent: feeding the host paths of
/// the result back in yields the same sets.
pub fn classify<I>(paths: I, policy: &ClassifyPolicy) -> Classification
where
    I: IntoIterator<Item = PathBuf>,
{
    let mut out = Classification::default();
    let mut seen = BTreeSet::new();

    for path in paths {
        if !seen.insert(path.clone()) {
            continue;
        }
        if policy
            .container_only_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix))
        {
            out.rejected
                .push((path, "path only exists inside containers".to_owned()));
            continue;
        }
        let realpath = match path.canonicalize() {
            Ok(realpath) => realpath,
            Err(_) => {
                out.rejected
                    .push((path, "does not exist on the host".to_owned()));
                continue;
            }
        };
        if realpath.is_dir() {
            out.directories.push(PathRecord::directory(path, realpath));
            continue;
        }
        if elf::is_elf(&realpath) {
            match elf::inspect(&realpath) {
                Ok(info) => {
                    if info.soname.is_some() {
                        out.libraries.push(PathRecord::library(
                            path,
                            realpath,
                            info.soname,
                            info.needed.into_iter().collect(),
                        ));
                        continue;
                    }
                    // an ELF without a soname (e.g. an executable) is a file
                }
                Err(e) => {
                    out.rejected.push((path, e.to_string()));
                    continue;
                }
            }
        }
        out.files.push(PathRecord::file(path, realpath));
    }

    dedup_libraries(&mut out.libraries);
    out
}

fn dedup_libraries(libraries: &mut Vec<PathRecord>) {
    let mut seen = BTreeSet::new();
    libraries.retain(|record| seen.insert(record.identity()));
}

/// Completes the library set over `DT_NEEDED` to a fixed point. Each soname
/// is visited at most once, so cyclic dependency graphs terminate. Missing
/// dependencies are warnings.
pub fn complete_libraries(
    libraries: &mut Vec<PathRecord>,
    policy: &ClassifyPolicy,
    msg_info: &mut MessageInfo,
) {
    let cache = LdCache::load(msg_info);
    let mut known: BTreeSet<String> = libraries.iter().map(|l| l.identity()).collect();
    let mut work: VecDeque<PathRecord> = libraries.iter().cloned().collect();

    while let Some(record) = work.pop_front() {
        let search_dirs = search_dirs_for(&record, policy);
        for soname in &record.needed {
            if known.contains(soname) {
                continue;
            }
            known.insert(soname.clone());
            match find_library(soname, &search_dirs, &cache) {
                Some(path) => match elf::inspect(&path) {
                    Ok(info) => {
                        let realpath = path.canonicalize().unwrap_or_else(|_| path.clone());
                        let dep = PathRecord::library(
                            path,
                            realpath,
                            info.soname.or_else(|| Some(soname.clone())),
                            info.needed.into_iter().collect(),
                        );
                        libraries.push(dep.clone());
                        work.push_back(dep);
                    }
                    Err(e) => msg_info.warn(format!("skipping dependency `{soname}`: {e}")),
                },
                None => msg_info.warn(format!(
                    "could not resolve `{soname}`, needed by `{}`",
                    record.host_path.display()
                )),
            }
        }
    }

    dedup_libraries(libraries);
}

/// Search order: the dependent's RPATH/RUNPATH, the captured
/// `LD_LIBRARY_PATH`, the default directories, then the ldconfig cache.
fn search_dirs_for(record: &PathRecord, policy: &ClassifyPolicy) -> Vec<PathBuf> {
    let mut dirs = vec![];
    if let Ok(info) = elf::inspect(&record.realpath) {
        for dir in info.rpath.iter().chain(info.runpath.iter()) {
            dirs.push(interpolate(dir, &record.realpath, info.is_64));
        }
    }
    dirs.extend(policy.ld_library_path.iter().cloned());
    dirs.extend(DEFAULT_SEARCH_DIRS.iter().map(PathBuf::from));
    dirs
}

fn find_library(soname: &str, search_dirs: &[PathBuf], cache: &LdCache) -> Option<PathBuf> {
    for dir in search_dirs {
        let candidate = dir.join(soname);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    cache.lookup(soname)
}

/// `$ORIGIN`/`$LIB` interpolation in RPATH entries.
fn interpolate(dir: &str, dependent: &Path, is_64: bool) -> PathBuf {
    let origin = dependent
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_default();
    let lib = if is_64 { "lib64" } else { "lib" };
    let mut out = PathBuf::new();
    for comp in Path::new(dir).components() {
        let part = comp.as_os_str();
        if part == "$ORIGIN" || part == "${ORIGIN}" {
            out.push(&origin);
        } else if part == "$LIB" || part == "${LIB}" {
            out.push(lib);
        } else {
            out.push(part);
        }
    }
    out
}

/// Parsed `ldconfig -p` output: soname to path.
#[derive(Debug, Default)]
pub struct LdCache {
    entries: HashMap<String, PathBuf>,
}

impl LdCache {
    pub fn load(msg_info: &mut MessageInfo) -> Self {
        let output = Command::new("ldconfig")
            .arg("-p")
            .run_and_get_stdout(msg_info);
        match output {
            Ok(stdout) => LdCache::parse(&stdout),
            Err(_) => {
                msg_info.debug("`ldconfig -p` unavailable, skipping cache lookups");
                LdCache::default()
            }
        }
    }

    pub fn parse(output: &str) -> Self {
        let mut entries = HashMap::new();
        for line in output.lines().skip(1) {
            if let Some((soname, path)) = parse_ldconfig_line(line) {
                entries.entry(soname).or_insert(path);
            }
        }
        LdCache { entries }
    }

    pub fn lookup(&self, soname: &str) -> Option<PathBuf> {
        self.entries.get(soname).cloned()
    }

    pub fn into_map(self) -> HashMap<String, PathBuf> {
        self.entries
    }
}

/// One `ldconfig -p` line: `\tlibm.so.6 (libc6,x86-64) => /lib64/libm.so.6`.
fn parse_ldconfig_line(line: &str) -> Option<(String, PathBuf)> {
    let (lhs, path) = line.split_once("=>")?;
    let soname = lhs.trim().split_whitespace().next()?;
    let path = path.trim();
    if soname.is_empty() || path.is_empty() {
        return None;
    }
    Some((soname.to_owned(), PathBuf::from(path)))
}

/// What the rank worker learned about the container before binding.
#[derive(Debug, Default)]
pub struct ContainerInfo {
    /// soname to in-container path, from the container's own ldconfig cache.
    pub libraries: HashMap<String, PathBuf>,
    /// The container's glibc release, when the probe could read it.
    pub glibc_version: Option<(u32, u32)>,
    /// Set when the image is a plain rootfs directory on the host, in which
    /// case container libraries can be inspected directly.
    pub rootfs: Option<PathBuf>,
}

/// Sonames owned by glibc itself; their versions track the glibc release.
pub const LIBC_SONAMES: &[&str] = &[
    "libc.so.6",
    "libm.so.6",
    "libmvec.so.1",
    "libpthread.so.0",
    "libdl.so.2",
    "librt.so.1",
    "libutil.so.1",
    "libresolv.so.2",
    "libnsl.so.1",
    "libanl.so.1",
    "ld-linux-x86-64.so.2",
    "ld-linux.so.2",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDecision {
    BindHost,
    KeepContainer,
}

/// Compares two defined-version sets. `Greater` means the left side is
/// newer: a strict superset wins, otherwise the higher maximum `GLIBC_x.y`
/// symbol wins.
pub fn compare_version_sets(left: &BTreeSet<String>, right: &BTreeSet<String>) -> Ordering {
    if left == right {
        return Ordering::Equal;
    }
    if left.is_superset(right) {
        return Ordering::Greater;
    }
    if right.is_superset(left) {
        return Ordering::Less;
    }
    elf::max_glibc_version(left).cmp(&elf::max_glibc_version(right))
}

/// The host/container tie-break of one host library against the probed
/// container state.
pub fn tie_break(record: &PathRecord, container: &ContainerInfo) -> BindDecision {
    let soname = match &record.soname {
        Some(soname) => soname,
        None => return BindDecision::BindHost,
    };
    let container_path = match container.libraries.get(soname) {
        Some(path) => path,
        // present only on host
        None => return BindDecision::BindHost,
    };

    // a rootfs-backed image lets us read the container's own version table
    if let Some(rootfs) = &container.rootfs {
        let inside = rootfs.join(container_path.strip_prefix("/").unwrap_or(container_path));
        if let (Ok(host), Ok(cont)) = (elf::inspect(&record.realpath), elf::inspect(&inside)) {
            return match compare_version_sets(&host.defined_versions, &cont.defined_versions) {
                Ordering::Less => BindDecision::KeepContainer,
                _ => BindDecision::BindHost,
            };
        }
    }

    // opaque image: only the libc family has a comparable version
    if LIBC_SONAMES.contains(&soname.as_str()) {
        let host_version = elf::inspect(&record.realpath)
            .ok()
            .and_then(|info| elf::max_glibc_version(&info.defined_versions));
        if let (Some(host), Some(cont)) = (host_version, container.glibc_version) {
            if cont > host {
                return BindDecision::KeepContainer;
            }
        }
    }
    BindDecision::BindHost
}

/// Splits a library set into host binds and container-kept sonames.
pub fn select_binds<'a>(
    libraries: &'a [PathRecord],
    container: &ContainerInfo,
    msg_info: &mut MessageInfo,
) -> Vec<&'a PathRecord> {
    let mut binds = vec![];
    for record in libraries {
        debug_assert_eq!(record.kind, PathKind::Library);
        match tie_break(record, container) {
            BindDecision::BindHost => binds.push(record),
            BindDecision::KeepContainer => msg_info.debug(format!(
                "keeping the container's `{}`",
                record.identity()
            )),
        }
    }
    binds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn policy() -> ClassifyPolicy {
        ClassifyPolicy {
            container_only_prefixes: vec![PathBuf::from("/.e4s-cl")],
            ld_library_path: vec![],
        }
    }

    #[test]
    fn classify_files_dirs_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("hostfile");
        fs::write(&file, "x").unwrap();
        let sub = dir.path().join("sub");
        fs::create_dir(&sub).unwrap();

        let result = classify(
            vec![
                file.clone(),
                sub.clone(),
                dir.path().join("missing"),
                PathBuf::from("/.e4s-cl/entry"),
            ],
            &policy(),
        );

        assert_eq!(result.files.len(), 1);
        assert_eq!(result.files[0].host_path, file);
        assert_eq!(result.directories.len(), 1);
        assert!(result.libraries.is_empty());
        assert_eq!(result.rejected.len(), 2);
        // container-only prefixes are dropped even when they exist
        assert!(result
            .rejected
            .iter()
            .any(|(p, _)| p == Path::new("/.e4s-cl/entry")));
    }

    #[test]
    fn classify_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, "x").unwrap();

        let first = classify(vec![file.clone(), dir.path().to_path_buf()], &policy());
        let again = classify(
            first
                .files
                .iter()
                .chain(first.directories.iter())
                .map(|r| r.host_path.clone()),
            &policy(),
        );
        assert_eq!(first.files, again.files);
        assert_eq!(first.directories, again.directories);
        assert!(again.rejected.is_empty());
    }

    #[test]
    fn ldconfig_parse() {
        let output = "1058 libs found in cache `/etc/ld.so.cache`\n\
                      \tlibz.so.1 (libc6,x86-64) => /lib/x86_64-linux-gnu/libz.so.1\n\
                      \tlibm.so.6 (libc6,x86-64) => /lib/x86_64-linux-gnu/libm.so.6\n";
        let cache = LdCache::parse(output);
        assert_eq!(
            cache.lookup("libz.so.1"),
            Some(PathBuf::from("/lib/x86_64-linux-gnu/libz.so.1"))
        );
        assert_eq!(cache.lookup("libmpi.so.12"), None);
    }

    #[test]
    fn interpolate_origin_and_lib() {
        let dep = PathBuf::from("/opt/mpi/lib/libmpi.so.12");
        assert_eq!(
            interpolate("$ORIGIN/../lib64", &dep, true),
            PathBuf::from("/opt/mpi/lib/../lib64")
        );
        assert_eq!(
            interpolate("/opt/$LIB", &dep, true),
            PathBuf::from("/opt/lib64")
        );
        assert_eq!(
            interpolate("/opt/$LIB", &dep, false),
            PathBuf::from("/opt/lib")
        );
    }

    fn versions(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn version_set_comparison() {
        let small = versions(&["GLIBC_2.2.5", "GLIBC_2.4"]);
        let large = versions(&["GLIBC_2.2.5", "GLIBC_2.4", "GLIBC_2.34"]);
        assert_eq!(compare_version_sets(&large, &small), Ordering::Greater);
        assert_eq!(compare_version_sets(&small, &large), Ordering::Less);
        assert_eq!(compare_version_sets(&small, &small), Ordering::Equal);

        // disjoint sets fall back to the maximum GLIBC symbol
        let a = versions(&["GLIBC_2.17", "OTHER_1.0"]);
        let b = versions(&["GLIBC_2.28", "ELSE_2.0"]);
        assert_eq!(compare_version_sets(&b, &a), Ordering::Greater);
    }

    #[test]
    fn tie_break_host_only_library() {
        let record = PathRecord::library(
            PathBuf::from("/usr/lib64/libmpi.so.12"),
            PathBuf::from("/usr/lib64/libmpi.so.12"),
            Some("libmpi.so.12".to_owned()),
            BTreeSet::new(),
        );
        let container = ContainerInfo::default();
        assert_eq!(tie_break(&record, &container), BindDecision::BindHost);
    }

    #[test]
    fn tie_break_non_libc_collision_binds_host() {
        let record = PathRecord::library(
            PathBuf::from("/usr/lib64/libz.so.1"),
            PathBuf::from("/usr/lib64/libz.so.1"),
            Some("libz.so.1".to_owned()),
            BTreeSet::new(),
        );
        let mut container = ContainerInfo::default();
        container
            .libraries
            .insert("libz.so.1".to_owned(), PathBuf::from("/lib/libz.so.1"));
        assert_eq!(tie_break(&record, &container), BindDecision::BindHost);
    }
}
