//! Read-only ELF inspection: sonames, `DT_NEEDED`, search paths and the
//! defined-version table. Only the dynamic metadata the resolver needs is
//! decoded; nothing is loaded or relocated.

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use object::elf;
use object::read::elf::{Dyn, FileHeader, SectionHeader};
use object::Endianness;

pub const ELF_MAGIC: &[u8; 4] = b"\x7fELF";

#[derive(Debug, thiserror::Error)]
pub enum ElfError {
    #[error("could not read `{0}`")]
    Io(String, #[source] std::io::Error),
    #[error("`{0}` is not an ELF object")]
    NotElf(String),
    #[error("could not parse `{0}`")]
    Parse(String, #[source] object::read::Error),
}

/// Dynamic-section metadata of one shared object or executable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElfInfo {
    pub soname: Option<String>,
    pub needed: Vec<String>,
    /// Raw `DT_RPATH` entries, colon-split, uninterpolated.
    pub rpath: Vec<String>,
    /// Raw `DT_RUNPATH` entries, colon-split, uninterpolated.
    pub runpath: Vec<String>,
    /// Version definitions from `.gnu.version_d` (e.g. `GLIBC_2.34`),
    /// excluding the base definition that only restates the soname.
    pub defined_versions: BTreeSet<String>,
    pub is_64: bool,
}

/// Cheap magic sniff; avoids parsing every file the tracer saw.
pub fn is_elf(path: &Path) -> bool {
    use std::io::Read;
    let mut magic = [0u8; 4];
    match fs::File::open(path) {
        Ok(mut file) => file.read_exact(&mut magic).is_ok() && &magic == ELF_MAGIC,
        Err(_) => false,
    }
}

pub fn inspect(path: &Path) -> Result<ElfInfo, ElfError> {
    let name = path.display().to_string();
    let data = fs::read(path).map_err(|e| ElfError::Io(name.clone(), e))?;
    if data.len() < 5 || &data[..4] != ELF_MAGIC {
        return Err(ElfError::NotElf(name));
    }
    match data[4] {
        elf::ELFCLASS64 => parse::<elf::FileHeader64<Endianness>>(&data, &name, true),
        elf::ELFCLASS32 => parse::<elf::FileHeader32<Endianness>>(&data, &name, false),
        _ => Err(ElfError::NotElf(name)),
    }
}

fn parse<Elf: FileHeader<Endian = Endianness>>(
    data: &[u8],
    name: &str,
    is_64: bool,
) -> Result<ElfInfo, ElfError> {
    let parse_err = |e| ElfError::Parse(name.to_owned(), e);

    let header = Elf::parse(data).map_err(parse_err)?;
    let endian = header.endian().map_err(parse_err)?;
    let sections = header.sections(endian, data).map_err(parse_err)?;

    let mut info = ElfInfo {
        is_64,
        ..Default::default()
    };

    for section in sections.iter() {
        let (dyns, link) = match section.dynamic(endian, data).map_err(parse_err)? {
            Some(dynamic) => dynamic,
            None => continue,
        };
        let strings = sections.strings(endian, data, link).map_err(parse_err)?;
        for entry in dyns {
            let tag = match entry.tag32(endian) {
                Some(tag) => tag,
                None => continue,
            };
            let string = |entry: &Elf::Dyn| {
                entry
                    .string(endian, strings)
                    .ok()
                    .map(|s| String::from_utf8_lossy(s).into_owned())
            };
            match tag {
                elf::DT_SONAME => info.soname = string(entry),
                elf::DT_NEEDED => info.needed.extend(string(entry)),
                elf::DT_RPATH => {
                    info.rpath
                        .extend(string(entry).iter().flat_map(|s| split_paths(s)));
                }
                elf::DT_RUNPATH => {
                    info.runpath
                        .extend(string(entry).iter().flat_map(|s| split_paths(s)));
                }
                _ => {}
            }
        }
    }

    if let Some((mut verdefs, link)) = sections.gnu_verdef(endian, data).map_err(parse_err)? {
        let strings = sections.strings(endian, data, link).map_err(parse_err)?;
        while let Some((verdef, mut verdauxs)) = verdefs.next().map_err(parse_err)? {
            // the base definition restates the soname, not a symbol version
            if verdef.vd_flags.get(endian) & elf::VER_FLG_BASE != 0 {
                continue;
            }
            if let Some(aux) = verdauxs.next().map_err(parse_err)? {
                if let Ok(name) = aux.name(endian, strings) {
                    info.defined_versions
                        .insert(String::from_utf8_lossy(name).into_owned());
                }
            }
        }
    }

    Ok(info)
}

fn split_paths(value: &str) -> Vec<String> {
    value
        .split(':')
        .filter(|s| !s.is_empty())
        .map(ToOwned::to_owned)
        .collect()
}

/// `GLIBC_x.y` symbol versions as comparable pairs.
pub fn glibc_versions(versions: &BTreeSet<String>) -> Vec<(u32, u32)> {
    versions
        .iter()
        .filter_map(|v| parse_glibc_version(v))
        .collect()
}

pub fn parse_glibc_version(version: &str) -> Option<(u32, u32)> {
    let rest = version.strip_prefix("GLIBC_")?;
    let (major, minor) = rest.split_once('.')?;
    Some((major.parse().ok()?, minor.split('.').next()?.parse().ok()?))
}

/// The highest `GLIBC_x.y` version a library defines, if any.
pub fn max_glibc_version(versions: &BTreeSet<String>) -> Option<(u32, u32)> {
    glibc_versions(versions).into_iter().max()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glibc_version_parsing() {
        assert_eq!(parse_glibc_version("GLIBC_2.34"), Some((2, 34)));
        assert_eq!(parse_glibc_version("GLIBC_2.2.5"), Some((2, 2)));
        assert_eq!(parse_glibc_version("GCC_3.0"), None);
        assert_eq!(parse_glibc_version("GLIBC_PRIVATE"), None);
    }

    #[test]
    fn max_version_orders_numerically() {
        let versions: BTreeSet<String> = ["GLIBC_2.4", "GLIBC_2.34", "GLIBC_2.9"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        // lexicographic order would pick 2.9
        assert_eq!(max_glibc_version(&versions), Some((2, 34)));
    }

    #[test]
    fn magic_sniff_rejects_non_elf() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("not-elf");
        fs::write(&path, b"#!/bin/sh\n").unwrap();
        assert!(!is_elf(&path));
        assert!(matches!(inspect(&path), Err(ElfError::NotElf(_))));
    }

    #[test]
    fn rpath_entries_split_on_colon() {
        assert_eq!(
            split_paths("/opt/mpi/lib:/usr/lib64:"),
            vec!["/opt/mpi/lib".to_owned(), "/usr/lib64".to_owned()]
        );
    }
}
