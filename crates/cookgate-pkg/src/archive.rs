use std::collections::BTreeMap;
use std::io::Read as _;
use std::path::{Component, Path};

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub const DEFAULT_MAX_FILES: usize = 10_000;
pub const DEFAULT_MAX_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArchiveLimits {
    pub max_files: usize,
    pub max_bytes: u64,
}

impl Default for ArchiveLimits {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_bytes: DEFAULT_MAX_BYTES,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LimitExceeded {
    #[error("bundle holds more than {max} files")]
    Files { max: usize },
    #[error("bundle content exceeds {max} bytes")]
    Bytes { max: u64 },
}

/// Running file/byte tally checked against [`ArchiveLimits`] before each file is accepted.
#[derive(Debug)]
pub struct Budget {
    limits: ArchiveLimits,
    files: usize,
    bytes: u64,
}

impl Budget {
    pub fn new(limits: ArchiveLimits) -> Self {
        Self {
            limits,
            files: 0,
            bytes: 0,
        }
    }

    pub fn charge(&mut self, len: u64) -> Result<(), LimitExceeded> {
        if self.files + 1 > self.limits.max_files {
            return Err(LimitExceeded::Files {
                max: self.limits.max_files,
            });
        }
        let bytes = self.bytes.saturating_add(len);
        if bytes > self.limits.max_bytes {
            return Err(LimitExceeded::Bytes {
                max: self.limits.max_bytes,
            });
        }
        self.files += 1;
        self.bytes = bytes;
        Ok(())
    }
}

/// Builds a gzip-compressed tar with every entry stored under `<root>/`. Headers are
/// deterministic (mode 0644, uid/gid 0, mtime 0) and entries are sorted by path.
pub fn build_tar_gz(root: &str, files: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>> {
    validate_archive_rel_path(Path::new(root))?;

    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.mode(tar::HeaderMode::Deterministic);
    for (rel, bytes) in files {
        let rel_path = Path::new(rel);
        validate_archive_rel_path(rel_path)?;
        let path = Path::new(root).join(rel_path);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(bytes.len() as u64);
        header.set_mode(0o644);
        header.set_mtime(0);
        header.set_uid(0);
        header.set_gid(0);
        header.set_cksum();
        builder
            .append_data(&mut header, &path, std::io::Cursor::new(bytes))
            .with_context(|| format!("append tar entry: {}", path.display()))?;
    }
    let encoder = builder.into_inner().context("finish tar")?;
    encoder.finish().context("finish gzip")
}

/// Reads a `.tar.gz` into memory, keyed by path with the first component (the archive's root
/// directory) stripped. Only regular files are kept. Exceeding `limits` fails with a
/// [`LimitExceeded`] inside the returned error.
pub fn unpack_tar_gz(
    archive_bytes: &[u8],
    limits: ArchiveLimits,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut budget = Budget::new(limits);
    let mut out = BTreeMap::new();
    let mut archive = tar::Archive::new(GzDecoder::new(archive_bytes));
    for entry in archive.entries().context("read tar entries")? {
        let mut entry = entry.context("read tar entry")?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry.path().context("read tar entry path")?.into_owned();
        validate_archive_rel_path(&path)?;
        let Some(rel) = strip_root(&path) else {
            continue;
        };
        budget.charge(entry.size())?;

        let mut buf = Vec::new();
        entry
            .read_to_end(&mut buf)
            .with_context(|| format!("read tar entry bytes: {}", path.display()))?;
        out.insert(rel, buf);
    }
    Ok(out)
}

fn strip_root(path: &Path) -> Option<String> {
    let mut components = path.components();
    components.next()?;
    let rest: Vec<String> = components
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    if rest.is_empty() {
        return None;
    }
    Some(rest.join("/"))
}

pub fn validate_archive_rel_path(path: &Path) -> Result<()> {
    if path.as_os_str().is_empty() {
        anyhow::bail!("empty archive path");
    }
    if path.is_absolute() {
        anyhow::bail!("absolute archive paths are not allowed: {:?}", path);
    }
    for component in path.components() {
        match component {
            Component::Prefix(_) => {
                anyhow::bail!("windows prefix archive paths are not allowed: {:?}", path);
            }
            Component::ParentDir => {
                anyhow::bail!("archive paths must not contain '..': {:?}", path);
            }
            Component::RootDir | Component::CurDir | Component::Normal(_) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(entries: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        entries
            .iter()
            .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
            .collect()
    }

    #[test]
    fn build_then_unpack_strips_root() {
        let input = files(&[
            ("recipes/default.rb", "log 'hi'\n"),
            ("metadata.json", "{}"),
        ]);
        let tgz = build_tar_gz("foo", &input).unwrap();
        let out = unpack_tar_gz(&tgz, ArchiveLimits::default()).unwrap();
        assert_eq!(out, input);
    }

    #[test]
    fn build_is_deterministic() {
        let input = files(&[("a.rb", "a"), ("b/c.rb", "c")]);
        assert_eq!(
            build_tar_gz("foo", &input).unwrap(),
            build_tar_gz("foo", &input).unwrap()
        );
    }

    #[test]
    fn rejects_parent_dir_entries() {
        let input = files(&[("../evil", "x")]);
        assert!(build_tar_gz("foo", &input).is_err());
    }

    #[test]
    fn file_limit_is_enforced() {
        let input = files(&[("a", "1"), ("b", "2"), ("c", "3")]);
        let tgz = build_tar_gz("foo", &input).unwrap();
        let err = unpack_tar_gz(
            &tgz,
            ArchiveLimits {
                max_files: 2,
                max_bytes: 1024,
            },
        )
        .unwrap_err();
        assert_eq!(
            err.downcast_ref::<LimitExceeded>(),
            Some(&LimitExceeded::Files { max: 2 })
        );
    }

    #[test]
    fn byte_limit_is_enforced() {
        let mut budget = Budget::new(ArchiveLimits {
            max_files: 10,
            max_bytes: 5,
        });
        budget.charge(3).unwrap();
        assert_eq!(budget.charge(3), Err(LimitExceeded::Bytes { max: 5 }));
    }
}
