use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One file of a cookbook version as listed by the package-management server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CookbookItem {
    pub name: String,
    pub path: String,
    pub checksum: String,
    #[serde(default)]
    pub specificity: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A cookbook version document, as sent in an upload request body and returned by
/// `GET /cookbooks/<name>/<version>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CookbookVersion {
    pub cookbook_name: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub version: String,
    #[serde(rename = "frozen?", default)]
    pub frozen: bool,
    #[serde(default)]
    pub metadata: Metadata,
    #[serde(default)]
    pub recipes: Vec<CookbookItem>,
    #[serde(default)]
    pub definitions: Vec<CookbookItem>,
    #[serde(default)]
    pub libraries: Vec<CookbookItem>,
    #[serde(default)]
    pub attributes: Vec<CookbookItem>,
    #[serde(default)]
    pub files: Vec<CookbookItem>,
    #[serde(default)]
    pub templates: Vec<CookbookItem>,
    #[serde(default)]
    pub resources: Vec<CookbookItem>,
    #[serde(default)]
    pub providers: Vec<CookbookItem>,
    #[serde(default)]
    pub root_files: Vec<CookbookItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CookbookVersion {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        let mut doc: CookbookVersion =
            serde_json::from_slice(bytes).context("parse cookbook version")?;
        if doc.cookbook_name.trim().is_empty() {
            anyhow::bail!("cookbook version is missing cookbook_name");
        }
        if doc.version.is_empty() {
            doc.version = doc.metadata.version.clone();
        }
        if doc.version.is_empty() {
            anyhow::bail!("cookbook {} has no version", doc.cookbook_name);
        }
        Ok(doc)
    }

    /// Every file across all roles, flattened in role order.
    pub fn all_files(&self) -> impl Iterator<Item = &CookbookItem> {
        [
            &self.files,
            &self.definitions,
            &self.libraries,
            &self.attributes,
            &self.recipes,
            &self.providers,
            &self.resources,
            &self.templates,
            &self.root_files,
        ]
        .into_iter()
        .flatten()
    }

    pub fn root_file(&self, name: &str) -> Option<&CookbookItem> {
        self.root_files.iter().find(|f| f.name == name)
    }

    /// `metadata.json` rendered from the version's metadata, for uploads that only carry
    /// `metadata.rb`.
    pub fn synthesized_metadata_json(&self) -> Result<Vec<u8>> {
        let mut out =
            serde_json::to_vec_pretty(&self.metadata).context("serialize cookbook metadata")?;
        out.push(b'\n');
        Ok(out)
    }
}
