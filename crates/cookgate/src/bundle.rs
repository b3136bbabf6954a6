//! Rebuilding an uploaded cookbook from the storage backend.
//!
//! The upload request only lists checksums; the content has to be pulled from storage, written
//! into a per-upload scratch directory (the lint tools run against it), hashed for comparison
//! and packed into the archive that may later be published.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Context as _;
use cookgate_contracts::{CHEFIGNORE_FILE, GITIGNORE_FILE, METADATA_JSON};
use cookgate_pkg::archive::validate_archive_rel_path;
use cookgate_pkg::{
    build_tar_gz, normalize_line_endings, ArchiveLimits, Budget, ContentDigest, CookbookVersion,
    LimitExceeded, Storage,
};
use tempfile::TempDir;

use crate::compare::{FileHashMap, IgnoreRules};
use crate::error::GateError;

/// The candidate side of a comparison. The scratch directory is removed when the bundle is
/// dropped, whichever way the gate exits.
#[derive(Debug)]
pub struct CandidateBundle {
    dir: TempDir,
    pub hashes: FileHashMap,
    pub gitignore: Option<Vec<u8>>,
    pub chefignore: Option<Vec<u8>>,
    /// `<name>/...` rooted `.tar.gz` of the normalized content.
    pub archive: Vec<u8>,
}

impl CandidateBundle {
    /// Directory holding the rebuilt cookbook tree.
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

fn scratch_dir(temp_root: Option<&Path>, user: &str, name: &str) -> anyhow::Result<TempDir> {
    let prefix = format!("{user}-{name}-");
    let mut builder = tempfile::Builder::new();
    builder.prefix(&prefix);
    match temp_root {
        Some(root) => {
            std::fs::create_dir_all(root)
                .with_context(|| format!("create temp root {}", root.display()))?;
            builder
                .tempdir_in(root)
                .with_context(|| format!("create temp dir in {}", root.display()))
        }
        None => builder.tempdir().context("create temp dir"),
    }
}

fn write_file(root: &Path, rel: &str, content: &[u8]) -> anyhow::Result<()> {
    validate_archive_rel_path(Path::new(rel))?;
    let dest = root.join(rel);
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("create dir {}", parent.display()))?;
    }
    std::fs::write(&dest, content).with_context(|| format!("write {}", dest.display()))
}

/// Fetches every file of `cookbook` that its ignore files and the fixed rules (metadata files,
/// `spec/`) keep, and builds its bundle. Any failed fetch aborts the build.
pub fn build_bundle(
    cookbook: &CookbookVersion,
    storage: &dyn Storage,
    org_id: Option<&str>,
    temp_root: Option<&Path>,
    user: &str,
    limits: ArchiveLimits,
) -> Result<CandidateBundle, GateError> {
    let name = cookbook.cookbook_name.as_str();
    let file_count = cookbook.all_files().count();
    if file_count > limits.max_files {
        return Err(GateError::BundleTooLarge(LimitExceeded::Files {
            max: limits.max_files,
        }));
    }

    let dir = scratch_dir(temp_root, user, name)?;
    let mut budget = Budget::new(limits);
    let mut files: BTreeMap<String, Vec<u8>> = BTreeMap::new();
    let mut bundle = CandidateBundle {
        dir,
        hashes: FileHashMap::new(),
        gitignore: None,
        chefignore: None,
        archive: Vec::new(),
    };

    // The ignore files decide what else gets downloaded, so they are read first.
    let mut ignore_files: BTreeMap<&str, Vec<u8>> = BTreeMap::new();
    for item in &cookbook.root_files {
        if item.path == GITIGNORE_FILE || item.path == CHEFIGNORE_FILE {
            let raw = storage
                .fetch(org_id, &item.checksum)
                .with_context(|| format!("Failed to download {} from storage", item.path))?;
            budget.charge(raw.len() as u64)?;
            ignore_files.insert(item.path.as_str(), normalize_line_endings(&raw).into_owned());
        }
    }
    bundle.gitignore = ignore_files.get(GITIGNORE_FILE).cloned();
    bundle.chefignore = ignore_files.get(CHEFIGNORE_FILE).cloned();
    let rules = IgnoreRules::new(bundle.gitignore.as_deref(), bundle.chefignore.as_deref())?;

    for item in cookbook.all_files() {
        if rules.is_ignored(&item.path) {
            tracing::trace!(path = %item.path, "skipping ignored file");
            continue;
        }
        let content = match ignore_files.remove(item.path.as_str()) {
            Some(content) => content,
            None => {
                let raw = storage
                    .fetch(org_id, &item.checksum)
                    .with_context(|| format!("Failed to download {} from storage", item.path))?;
                budget.charge(raw.len() as u64)?;
                normalize_line_endings(&raw).into_owned()
            }
        };
        write_file(bundle.path(), &item.path, &content)?;
        bundle
            .hashes
            .insert(item.path.clone(), ContentDigest::of(&content));
        files.insert(item.path.clone(), content);
    }

    // Uploaded metadata.json is always ignored above; the published archive carries one
    // synthesized from the upload.
    let metadata = cookbook.synthesized_metadata_json()?;
    write_file(bundle.path(), METADATA_JSON, &metadata)?;
    bundle
        .hashes
        .insert(METADATA_JSON.to_string(), ContentDigest::of(&metadata));
    files.insert(METADATA_JSON.to_string(), metadata);

    bundle.archive = build_tar_gz(name, &files)?;
    tracing::debug!(
        cookbook = name,
        version = %cookbook.version,
        files = files.len(),
        "rebuilt cookbook bundle"
    );
    Ok(bundle)
}
