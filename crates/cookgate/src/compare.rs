use std::collections::{BTreeMap, BTreeSet};

use anyhow::{Context, Result};
use cookgate_contracts::{CHEFIGNORE_FILE, GITIGNORE_FILE, METADATA_JSON, METADATA_RB};
use cookgate_pathspec::{Grammar, IgnoreFile, PatternError};
use cookgate_pkg::{unpack_tar_gz, ArchiveLimits, ContentDigest};
use serde::Serialize;

/// Relative path to content digest, for one side of a comparison.
pub type FileHashMap = BTreeMap<String, ContentDigest>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DiscrepancyKind {
    Changed,
    Extra,
    Missing,
}

/// Paths that keep the candidate from matching its source. The three sets are disjoint.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DiscrepancyReport {
    /// In both, with different content.
    pub changed: BTreeSet<String>,
    /// Only in the candidate.
    pub extra: BTreeSet<String>,
    /// Only in the source.
    pub missing: BTreeSet<String>,
}

impl DiscrepancyReport {
    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.extra.is_empty() && self.missing.is_empty()
    }

    /// The class that fails the comparison: changed files first, then extra, then missing.
    pub fn first_failure(&self) -> Option<(DiscrepancyKind, Vec<String>)> {
        [
            (DiscrepancyKind::Changed, &self.changed),
            (DiscrepancyKind::Extra, &self.extra),
            (DiscrepancyKind::Missing, &self.missing),
        ]
        .into_iter()
        .find(|(_, paths)| !paths.is_empty())
        .map(|(kind, paths)| (kind, paths.iter().cloned().collect()))
    }
}

/// Decides which unmatched paths do not count. `.gitignore` patterns decide first and the
/// `chefignore` patterns are only consulted for paths `.gitignore` keeps.
#[derive(Debug)]
pub struct IgnoreRules {
    gitignore: IgnoreFile,
    chefignore: IgnoreFile,
}

impl IgnoreRules {
    pub fn new(gitignore: Option<&[u8]>, chefignore: Option<&[u8]>) -> Result<Self, PatternError> {
        let parse = |grammar, source: Option<&[u8]>| match source {
            Some(bytes) => IgnoreFile::parse_bytes(grammar, bytes),
            None => Ok(IgnoreFile::empty()),
        };
        Ok(Self {
            gitignore: parse(Grammar::GitIgnore, gitignore)?,
            chefignore: parse(Grammar::ChefIgnore, chefignore)?,
        })
    }

    pub fn is_ignored(&self, path: &str) -> bool {
        if path == METADATA_RB || path == METADATA_JSON || path.starts_with("spec/") {
            return true;
        }
        self.gitignore.is_ignored(path) || self.chefignore.is_ignored(path)
    }
}

/// The unpacked source of truth, hashed the same way as the candidate.
#[derive(Debug, Clone, Default)]
pub struct SourceBundle {
    pub hashes: FileHashMap,
    pub gitignore: Option<Vec<u8>>,
    pub chefignore: Option<Vec<u8>>,
}

impl SourceBundle {
    pub fn from_tar_gz(bytes: &[u8], limits: ArchiveLimits) -> Result<Self> {
        let files = unpack_tar_gz(bytes, limits).context("unpack source cookbook")?;
        let mut bundle = SourceBundle::default();
        for (path, content) in files {
            bundle
                .hashes
                .insert(path.clone(), ContentDigest::of(&content));
            if path == GITIGNORE_FILE {
                bundle.gitignore = Some(content);
            } else if path == CHEFIGNORE_FILE {
                bundle.chefignore = Some(content);
            }
        }
        Ok(bundle)
    }
}

/// Ignore rules for a comparison: each ignore file is taken from the source when the source
/// has one, else from the candidate.
pub fn ignore_rules(
    source: &SourceBundle,
    candidate_gitignore: Option<&[u8]>,
    candidate_chefignore: Option<&[u8]>,
) -> Result<IgnoreRules, PatternError> {
    IgnoreRules::new(
        source.gitignore.as_deref().or(candidate_gitignore),
        source.chefignore.as_deref().or(candidate_chefignore),
    )
}

pub fn compare(
    candidate: &FileHashMap,
    source: &FileHashMap,
    rules: &IgnoreRules,
) -> DiscrepancyReport {
    let mut report = DiscrepancyReport::default();
    let mut unmatched: BTreeSet<&str> = source
        .keys()
        .map(String::as_str)
        .filter(|p| *p != METADATA_JSON)
        .collect();

    for (path, digest) in candidate {
        if path == METADATA_JSON {
            continue;
        }
        match source.get(path) {
            Some(theirs) => {
                unmatched.remove(path.as_str());
                if theirs != digest && !rules.is_ignored(path) {
                    report.changed.insert(path.clone());
                }
            }
            None => {
                if !rules.is_ignored(path) {
                    report.extra.insert(path.clone());
                }
            }
        }
    }

    report.missing = unmatched
        .into_iter()
        .filter(|p| !rules.is_ignored(p))
        .map(str::to_string)
        .collect();
    report
}
