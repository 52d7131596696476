//! Package identifiers and the offset table that makes the index archive random-access.

use crate::error::{self, Result};
use serde::{Deserialize, Serialize};
use snafu::{ensure, ResultExt};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::str::FromStr;

/// A package name and version, written `<name>-<version>`, e.g. `acme-widgets-1.2.0`.
///
/// Names may themselves contain dashes; the version is everything after the last dash, and must
/// start with an ASCII digit.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PackageId {
    name: String,
    version: String,
}

impl PackageId {
    /// Creates a package identifier from its parts.
    pub fn new<N: Into<String>, V: Into<String>>(name: N, version: V) -> Result<Self> {
        let (name, version) = (name.into(), version.into());
        ensure!(
            !name.is_empty()
                && !version.is_empty()
                && !name.contains('/')
                && !version.contains('/')
                && version.starts_with(|c: char| c.is_ascii_digit()),
            error::PackageIdInvalidSnafu {
                id: format!("{name}-{version}"),
            }
        );
        Ok(Self { name, version })
    }

    /// The package name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The package version.
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The file name of this package's release archive, `<name>-<version>.tar.gz`.
    pub fn archive_file_name(&self) -> String {
        format!("{self}.tar.gz")
    }

    /// The index entry path for one of this package's files. Per-version files live under
    /// `<name>/<version>/`; `preferred-versions` is per-package and lives under `<name>/`.
    pub(crate) fn index_entry(&self, file_name: &str) -> String {
        if file_name == "preferred-versions" {
            format!("{}/{}", self.name, file_name)
        } else {
            format!("{}/{}/{}", self.name, self.version, file_name)
        }
    }
}

impl FromStr for PackageId {
    type Err = crate::error::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (name, version) = s
            .rsplit_once('-')
            .ok_or_else(|| error::PackageIdInvalidSnafu { id: s }.build())?;
        Self::new(name, version).map_err(|_| error::PackageIdInvalidSnafu { id: s }.build())
    }
}

impl fmt::Display for PackageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.name, self.version)
    }
}

// =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=   =^..^=

/// The sidecar offset table for the index archive, mapping each archive entry path to the
/// position and length of its contents. Regenerated whenever the archive is replaced.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct TarIndex {
    entries: BTreeMap<String, TarEntryLocation>,
}

/// Where an entry's contents live inside the archive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub(crate) struct TarEntryLocation {
    pub(crate) offset: u64,
    pub(crate) length: u64,
}

impl TarIndex {
    /// Walks the archive once, recording the raw file position of every regular file entry.
    pub(crate) fn build(tar_path: &Path) -> Result<Self> {
        let file = File::open(tar_path).context(error::FileOpenSnafu { path: tar_path })?;
        let mut archive = tar::Archive::new(file);
        let mut entries = BTreeMap::new();
        for entry in archive
            .entries()
            .context(error::FileReadSnafu { path: tar_path })?
        {
            let entry = entry.context(error::FileReadSnafu { path: tar_path })?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let Ok(path) = entry.path() else {
                // Non-UTF-8 entry names cannot be addressed; skip them.
                continue;
            };
            entries.insert(
                path.to_string_lossy().into_owned(),
                TarEntryLocation {
                    offset: entry.raw_file_position(),
                    length: entry.size(),
                },
            );
        }
        Ok(Self { entries })
    }

    /// Loads a previously stored sidecar. A missing or unreadable sidecar yields `None`; the
    /// caller rebuilds from the archive.
    pub(crate) fn load(sidecar: &Path) -> Option<Self> {
        let bytes = std::fs::read(sidecar).ok()?;
        serde_json::from_slice(&bytes).ok()
    }

    pub(crate) fn get(&self, entry: &str) -> Option<TarEntryLocation> {
        self.entries.get(entry).copied()
    }

    pub(crate) fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec_pretty(self).context(error::JsonSerializeSnafu {
            what: "index sidecar",
        })
    }

    /// Reads one entry's contents out of the archive.
    pub(crate) fn read_entry(&self, tar_path: &Path, entry: &str) -> Result<Option<Vec<u8>>> {
        let Some(location) = self.get(entry) else {
            return Ok(None);
        };
        let mut file = File::open(tar_path).context(error::FileOpenSnafu { path: tar_path })?;
        file.seek(SeekFrom::Start(location.offset))
            .context(error::FileReadSnafu { path: tar_path })?;
        let mut buf = vec![0; usize::try_from(location.length).unwrap_or(usize::MAX)];
        file.read_exact(&mut buf)
            .context(error::FileReadSnafu { path: tar_path })?;
        Ok(Some(buf))
    }
}

#[cfg(test)]
mod tests {
    use super::{PackageId, TarIndex};
    use std::io::Write;

    #[test]
    fn package_id_parsing() {
        let id: PackageId = "acme-widgets-1.2.0".parse().unwrap();
        assert_eq!(id.name(), "acme-widgets");
        assert_eq!(id.version(), "1.2.0");
        assert_eq!(id.to_string(), "acme-widgets-1.2.0");
        assert_eq!(id.archive_file_name(), "acme-widgets-1.2.0.tar.gz");

        assert!("acme".parse::<PackageId>().is_err());
        assert!("acme-".parse::<PackageId>().is_err());
        assert!("acme-beta".parse::<PackageId>().is_err());
        assert!("-1.0".parse::<PackageId>().is_err());
    }

    #[test]
    fn entry_paths() {
        let id: PackageId = "acme-widgets-1.2.0".parse().unwrap();
        assert_eq!(
            id.index_entry("acme-widgets.cabal"),
            "acme-widgets/1.2.0/acme-widgets.cabal"
        );
        assert_eq!(
            id.index_entry("preferred-versions"),
            "acme-widgets/preferred-versions"
        );
    }

    #[test]
    fn builds_and_reads_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("00-index.tar");

        let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
        for (path, contents) in [
            ("acme-widgets/1.2.0/acme-widgets.cabal", "name: acme-widgets"),
            ("acme-widgets/preferred-versions", "acme-widgets >= 1.0"),
        ] {
            let mut header = tar::Header::new_ustar();
            header.set_size(contents.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            builder
                .append_data(&mut header, path, contents.as_bytes())
                .unwrap();
        }
        builder.into_inner().unwrap().flush().unwrap();

        let index = TarIndex::build(&tar_path).unwrap();
        let id: PackageId = "acme-widgets-1.2.0".parse().unwrap();
        let cabal = index
            .read_entry(&tar_path, &id.index_entry("acme-widgets.cabal"))
            .unwrap()
            .unwrap();
        assert_eq!(cabal, b"name: acme-widgets");
        assert!(index
            .read_entry(&tar_path, "missing/1.0/missing.cabal")
            .unwrap()
            .is_none());
    }

    #[test]
    fn sidecar_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let tar_path = dir.path().join("00-index.tar");
        let mut builder = tar::Builder::new(std::fs::File::create(&tar_path).unwrap());
        let mut header = tar::Header::new_ustar();
        header.set_size(2);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append_data(&mut header, "a/1.0/a.cabal", &b"hi"[..]).unwrap();
        builder.into_inner().unwrap().flush().unwrap();

        let index = TarIndex::build(&tar_path).unwrap();
        let sidecar = dir.path().join("00-index.tar.idx");
        std::fs::write(&sidecar, index.to_json().unwrap()).unwrap();

        let loaded = TarIndex::load(&sidecar).unwrap();
        assert_eq!(
            loaded.read_entry(&tar_path, "a/1.0/a.cabal").unwrap().unwrap(),
            b"hi"
        );
        assert!(TarIndex::load(&dir.path().join("missing.idx")).is_none());
    }
}
