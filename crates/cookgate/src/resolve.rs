//! Finding the source of truth for a cookbook version.
//!
//! Search order, first hit wins:
//! 1. the community registry; a known cookbook with an unknown version falls back to a
//!    tags-only search of the fork organization and otherwise fails,
//! 2. the organization's private registry,
//! 3. the configured version-control organizations, tag `v<version>` first and the default
//!    branch otherwise.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::Context as _;
use cookgate_pkg::{Lookup, Registry};
use cookgate_vcs::VcsHost;
use serde::Serialize;
use url::Url;

use crate::error::GateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Origin {
    Community,
    PrivateRegistry,
    Vcs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceReference {
    pub origin: Origin,
    /// Where the source archive is downloaded from.
    pub download_url: Url,
    /// A packaged registry release rather than repository content.
    pub artifact: bool,
    pub private: bool,
    /// For repository hits: the `v<version>` tag existed. `false` means the default branch
    /// was used.
    pub tagged: bool,
    /// The organization/group of a repository hit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcs_owner: Option<String>,
}

/// Collaborators and search settings for one resolution.
pub struct Resolver<'a> {
    pub community: Option<&'a dyn Registry>,
    /// Organization searched (tags only) for forks of community cookbooks.
    pub forks: Option<&'a str>,
    pub private_registry: Option<&'a dyn Registry>,
    pub vcs: &'a BTreeMap<String, Arc<dyn VcsHost>>,
    /// Organizations searched for private sources; empty disables the search.
    pub search_orgs: Vec<String>,
}

pub fn tag_for(version: &str) -> String {
    format!("v{version}")
}

impl Resolver<'_> {
    pub fn resolve(&self, name: &str, version: &str) -> Result<SourceReference, GateError> {
        if let Some(community) = self.community {
            if let Some(found) = self.search_community(community, name, version)? {
                return Ok(found);
            }
        }
        if let Some(registry) = self.private_registry {
            if let Some(mut found) = search_registry(registry, name, version)?.ok() {
                found.origin = Origin::PrivateRegistry;
                found.private = true;
                return Ok(found);
            }
        }
        if !self.search_orgs.is_empty() {
            if let Some(mut found) = self.search_vcs(&self.search_orgs, name, version, false)? {
                found.private = true;
                return Ok(found);
            }
        }
        Err(GateError::SourceNotFound {
            cookbook: name.to_string(),
        })
    }

    fn search_community(
        &self,
        community: &dyn Registry,
        name: &str,
        version: &str,
    ) -> Result<Option<SourceReference>, GateError> {
        match search_registry(community, name, version)? {
            Ok(found) => Ok(Some(found)),
            Err(RegistryMiss::NotFound) => Ok(None),
            Err(RegistryMiss::UnknownVersion) => {
                if let Some(forks) = self.forks {
                    let orgs = [forks.to_string()];
                    if let Some(found) = self.search_vcs(&orgs, name, version, true)? {
                        tracing::info!(cookbook = name, version, org = forks, "found fork of community cookbook");
                        return Ok(Some(found));
                    }
                }
                Err(GateError::UnknownCommunityVersion {
                    cookbook: name.to_string(),
                    version: version.to_string(),
                })
            }
        }
    }

    /// Searches `orgs` in order for a repository named after the cookbook.
    pub fn search_vcs(
        &self,
        orgs: &[String],
        name: &str,
        version: &str,
        tags_only: bool,
    ) -> Result<Option<SourceReference>, GateError> {
        let tag = tag_for(version);
        for org in orgs {
            let org = org.trim();
            let host = self.vcs.get(org).ok_or_else(|| {
                GateError::Backend(anyhow::anyhow!(
                    "No Git config specified for organization: {org}!"
                ))
            })?;
            let tagged = host.tag_exists(name, &tag)?;
            if tags_only && !tagged {
                continue;
            }
            let reference = tagged.then_some(tag.as_str());
            if let Some(link) = host.archive_link(name, reference)? {
                tracing::debug!(cookbook = name, org, tagged, "found cookbook repository");
                return Ok(Some(SourceReference {
                    origin: Origin::Vcs,
                    download_url: link,
                    artifact: false,
                    private: false,
                    tagged,
                    vcs_owner: Some(org.to_string()),
                }));
            }
        }
        Ok(None)
    }

    /// Downloads the source archive of a resolved reference.
    pub fn fetch(&self, source: &SourceReference) -> Result<Vec<u8>, GateError> {
        match source.origin {
            Origin::Vcs => {
                let owner = source.vcs_owner.as_deref().unwrap_or_default();
                let host = self.vcs.get(owner).ok_or_else(|| {
                    GateError::Backend(anyhow::anyhow!(
                        "No Git config specified for organization: {owner}!"
                    ))
                })?;
                Ok(host.download_archive(&source.download_url)?)
            }
            Origin::Community => download(self.community, &source.download_url),
            Origin::PrivateRegistry => download(self.private_registry, &source.download_url),
        }
    }
}

fn download(registry: Option<&dyn Registry>, url: &Url) -> Result<Vec<u8>, GateError> {
    let registry = registry
        .ok_or_else(|| GateError::Backend(anyhow::anyhow!("no registry configured for {url}")))?;
    registry
        .download(url)
        .with_context(|| format!("Failed to download the cookbook from {url}"))
        .map_err(GateError::from)
}

enum RegistryMiss {
    NotFound,
    UnknownVersion,
}

fn search_registry(
    registry: &dyn Registry,
    name: &str,
    version: &str,
) -> Result<Result<SourceReference, RegistryMiss>, GateError> {
    let universe = registry.universe()?;
    match universe.lookup(name, version) {
        Lookup::NotFound => Ok(Err(RegistryMiss::NotFound)),
        Lookup::UnknownVersion => Ok(Err(RegistryMiss::UnknownVersion)),
        Lookup::Found(entry) => {
            let download_url = registry.artifact_url(&entry.location_path, name, version)?;
            Ok(Ok(SourceReference {
                origin: Origin::Community,
                download_url,
                artifact: true,
                private: false,
                tagged: false,
                vcs_owner: None,
            }))
        }
    }
}
