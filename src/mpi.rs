//! MPI distribution fingerprinting from version banners.
//!
//! Used to decide whether the host launcher and the containerized binary
//! speak the same ABI, and to parameterize the translation layer when they
//! do not.

use std::fmt;
use std::process::Command;
use std::str::FromStr;

use once_cell::sync::Lazy;
use regex::RegexSet;

use crate::errors::*;
use crate::extensions::CommandExt;
use crate::shell::MessageInfo;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    OpenMpi,
    Mpich,
    Mvapich,
    Intel,
}

impl Family {
    pub fn as_str(&self) -> &'static str {
        match self {
            Family::OpenMpi => "openmpi",
            Family::Mpich => "mpich",
            Family::Mvapich => "mvapich",
            Family::Intel => "intel",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Family {
    type Err = eyre::Report;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "openmpi" | "open mpi" | "ompi" => Ok(Family::OpenMpi),
            "mpich" => Ok(Family::Mpich),
            "mvapich" | "mvapich2" => Ok(Family::Mvapich),
            "intel" | "intelmpi" | "impi" => Ok(Family::Intel),
            other => Err(eyre::eyre!("unknown MPI family `{other}`")),
        }
    }
}

/// Banner patterns, most specific first: MVAPICH and Intel MPI both embed
/// "MPICH" in their banners, and Cray MPICH plus Hydra map onto mpich.
static PATTERNS: &[(&str, Family)] = &[
    (r"(?i)mvapich", Family::Mvapich),
    (r"(?i)intel\(?r?\)? mpi", Family::Intel),
    (r"(?i)open ?mpi", Family::OpenMpi),
    (r"(?i)open ?rte", Family::OpenMpi),
    (r"(?i)cray mpich", Family::Mpich),
    (r"(?i)hydra", Family::Mpich),
    (r"(?i)mpich", Family::Mpich),
];

static PATTERN_SET: Lazy<RegexSet> =
    Lazy::new(|| RegexSet::new(PATTERNS.iter().map(|(pattern, _)| *pattern)).unwrap());

/// Maps a version banner onto an MPI family. Unknown banners map to `None`
/// (rendered as the empty string at the CLI surface).
pub fn family_from_banner(banner: &str) -> Option<Family> {
    PATTERN_SET
        .matches(banner)
        .iter()
        .next()
        .map(|index| PATTERNS[index].1)
}

/// Family of the host launcher, from its `--version` banner.
pub fn host_family(launcher: &str, msg_info: &mut MessageInfo) -> Option<Family> {
    let output = Command::new(launcher)
        .arg("--version")
        .run_and_get_output(msg_info)
        .ok()?;
    let mut banner = String::from_utf8_lossy(&output.stdout).into_owned();
    banner.push_str(&String::from_utf8_lossy(&output.stderr));
    family_from_banner(&banner)
}
