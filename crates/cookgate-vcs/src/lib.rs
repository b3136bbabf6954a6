//! Version-control hosting backends.
//!
//! The gate talks to one capability, [`VcsHost`], with a GitHub and a GitLab variant selected at
//! configuration load time by the `type` field of a [`HostConfig`].

mod api;
pub mod github;
pub mod gitlab;
pub mod lock;

use std::fmt;

use serde::{Deserialize, Serialize};

pub use github::GitHubHost;
pub use gitlab::GitLabHost;
pub use lock::{LockGuard, LockTable};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HostKind {
    Github,
    Gitlab,
}

impl HostKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Github => "github",
            Self::Gitlab => "gitlab",
        }
    }

    fn owner_label(self) -> &'static str {
        match self {
            Self::Github => "GitHub organization",
            Self::Gitlab => "GitLab group",
        }
    }
}

impl fmt::Display for HostKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection settings for the hosting service of one organization/group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostConfig {
    #[serde(rename = "type")]
    pub kind: HostKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default)]
    pub ssl_no_verify: bool,
    pub token: String,
}

#[derive(Debug, thiserror::Error)]
pub enum VcsError {
    #[error("The token configured for {} {owner} is not valid!", .host.owner_label())]
    InvalidToken { host: HostKind, owner: String },
    #[error("{action}: HTTP {status}: {message}")]
    Status {
        action: String,
        status: u16,
        message: String,
    },
    #[error("{action}: {message}")]
    Transport { action: String, message: String },
    #[error("{action}: {message}")]
    Decode { action: String, message: String },
    #[error("invalid {host} configuration: {message}")]
    Config { host: HostKind, message: String },
}

pub type VcsResult<T> = Result<T, VcsError>;

/// Name and mail address recorded on commits and tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committer {
    pub name: String,
    pub mail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileContent {
    pub content: Vec<u8>,
    /// Revision marker the host wants back when the file is updated or deleted.
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub path: String,
    pub sha: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Missing,
    File(FileContent),
    Directory(Vec<DirEntry>),
}

/// Operations the gate needs from a hosting service. `repo` is a repository (GitHub) or project
/// (GitLab) inside the organization/group the host was built for.
pub trait VcsHost: Send + Sync {
    fn kind(&self) -> HostKind;

    /// The organization or group every call is scoped to.
    fn owner(&self) -> &str;

    fn get_content(&self, repo: &str, path: &str) -> VcsResult<Content>;

    /// Each write returns the id of the commit it produced.
    fn create_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String>;

    fn update_file(
        &self,
        repo: &str,
        path: &str,
        sha: &str,
        message: &str,
        committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String>;

    fn delete_file(
        &self,
        repo: &str,
        path: &str,
        sha: &str,
        message: &str,
        committer: &Committer,
    ) -> VcsResult<String>;

    /// Deletes every entry, one commit per file. `message` renders the commit message for a path.
    fn delete_directory(
        &self,
        repo: &str,
        entries: &[DirEntry],
        committer: &Committer,
        message: &dyn Fn(&str) -> String,
    ) -> VcsResult<()> {
        for entry in entries {
            self.delete_file(repo, &entry.path, &entry.sha, &message(&entry.path), committer)?;
        }
        Ok(())
    }

    /// Textual patch of one commit.
    fn get_diff(&self, repo: &str, sha: &str) -> VcsResult<String>;

    /// Tarball link for `reference`, or for the default branch when `None`. `Ok(None)` when the
    /// repository does not exist.
    fn archive_link(&self, repo: &str, reference: Option<&str>) -> VcsResult<Option<url::Url>>;

    fn download_archive(&self, link: &url::Url) -> VcsResult<Vec<u8>>;

    fn tag_exists(&self, repo: &str, tag: &str) -> VcsResult<bool>;

    /// Tags the default branch tip.
    fn create_tag(&self, repo: &str, tag: &str, tagger: &Committer) -> VcsResult<()>;

    fn delete_tag(&self, repo: &str, tag: &str) -> VcsResult<()>;
}

/// Builds the backend named by `config.kind` for `owner`.
pub fn from_config(owner: &str, config: &HostConfig) -> VcsResult<Box<dyn VcsHost>> {
    if config.token.trim().is_empty() {
        return Err(VcsError::Config {
            host: config.kind,
            message: format!("no token for {owner}"),
        });
    }
    Ok(match config.kind {
        HostKind::Github => Box::new(GitHubHost::new(owner, config)?),
        HostKind::Gitlab => Box::new(GitLabHost::new(owner, config)?),
    })
}
