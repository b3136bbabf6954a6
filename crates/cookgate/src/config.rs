//! Gate configuration: one JSON document with defaults, per-organization overrides and the
//! connection settings of every collaborator.
//!
//! Per-organization options are resolved through [`Config::effective`] with an [`OrgOption`]
//! key. Overrides only apply on an `enterprise` server, which is the only kind that hosts more
//! than one organization.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use anyhow::{Context, Result};
use cookgate_contracts::CONFIG_SCHEMA_VERSION;
use cookgate_vcs::HostConfig;
use regex::Regex;
use serde::{Deserialize, Serialize};

pub const DEFAULT_COMMUNITY_URL: &str = "https://supermarket.chef.io";
pub const DEFAULT_MAIL_PORT: u16 = 25;
pub const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Nothing is gated; uploads are only recorded.
    Silent,
    /// Failed lint checks may be bypassed by a forced upload.
    Permissive,
    #[default]
    Strict,
}

/// What happens when an environment or role pins unfrozen cookbooks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidateChanges {
    /// Reject the change.
    Enforced,
    /// Report, but let the change through.
    Permissive,
    #[default]
    Silent,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChefKind {
    Enterprise,
    #[default]
    OpenSource,
    Goiardi,
}

impl ChefKind {
    /// Enterprise and open-source servers keep file contents in bookshelf, addressed by an
    /// organization id; goiardi serves them from its own file store.
    pub fn uses_bookshelf(self) -> bool {
        !matches!(self, ChefKind::Goiardi)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default)]
    pub log_file: Option<PathBuf>,
    #[serde(default)]
    pub temp_dir: Option<PathBuf>,
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub mail_domain: String,
    #[serde(default)]
    pub mail_server: String,
    #[serde(default = "default_mail_port")]
    pub mail_port: u16,
    #[serde(default)]
    pub mail_recipient: String,
    #[serde(default)]
    pub validate_changes: ValidateChanges,
    #[serde(default)]
    pub commit_changes: bool,
    #[serde(default)]
    pub mail_changes: bool,
    #[serde(default)]
    pub search_github: bool,
    #[serde(default)]
    pub publish_cookbook: bool,
    /// Cookbook-name regexes that are never published.
    #[serde(default)]
    pub blacklist: Vec<String>,
    /// Organization whose audit repositories record configuration changes.
    #[serde(default)]
    pub git_organization: Option<String>,
    /// Organizations searched, in order, for private cookbook sources.
    #[serde(default)]
    pub git_cookbook_orgs: Vec<String>,
    #[serde(default)]
    pub include_fcs: Option<String>,
    #[serde(default)]
    pub exclude_fcs: Vec<String>,
}

fn default_mail_port() -> u16 {
    DEFAULT_MAIL_PORT
}

impl Default for Defaults {
    fn default() -> Self {
        Self {
            log_file: None,
            temp_dir: None,
            mode: Mode::default(),
            mail_domain: String::new(),
            mail_server: String::new(),
            mail_port: DEFAULT_MAIL_PORT,
            mail_recipient: String::new(),
            validate_changes: ValidateChanges::default(),
            commit_changes: false,
            mail_changes: false,
            search_github: false,
            publish_cookbook: false,
            blacklist: Vec::new(),
            git_organization: None,
            git_cookbook_orgs: Vec::new(),
            include_fcs: None,
            exclude_fcs: Vec::new(),
        }
    }
}

/// Per-organization overrides. Unset fields fall back to [`Defaults`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CustomerOverrides {
    #[serde(default)]
    pub mode: Option<Mode>,
    #[serde(default)]
    pub mail_domain: Option<String>,
    #[serde(default)]
    pub mail_server: Option<String>,
    #[serde(default)]
    pub mail_port: Option<u16>,
    #[serde(default)]
    pub mail_recipient: Option<String>,
    #[serde(default)]
    pub validate_changes: Option<ValidateChanges>,
    #[serde(default)]
    pub commit_changes: Option<bool>,
    #[serde(default)]
    pub mail_changes: Option<bool>,
    #[serde(default)]
    pub search_github: Option<bool>,
    #[serde(default)]
    pub publish_cookbook: Option<bool>,
    #[serde(default)]
    pub blacklist: Option<Vec<String>>,
    #[serde(default)]
    pub git_cookbook_orgs: Option<Vec<String>>,
    #[serde(default)]
    pub exclude_fcs: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSection {
    /// Defaults to the chef server URL.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    #[serde(default = "default_region")]
    pub region: String,
    /// Bearer token for goiardi's file store.
    #[serde(default)]
    pub token: Option<String>,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChefSection {
    #[serde(default)]
    pub kind: ChefKind,
    pub server_url: String,
    #[serde(default)]
    pub ssl_no_verify: bool,
    /// Client name sent as `X-Ops-Userid`.
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub storage: StorageSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommunitySection {
    #[serde(default = "default_community_url")]
    pub url: String,
    /// Organization holding forks of community cookbooks with pending pull requests.
    #[serde(default)]
    pub forks: Option<String>,
}

fn default_community_url() -> String {
    DEFAULT_COMMUNITY_URL.to_string()
}

impl Default for CommunitySection {
    fn default() -> Self {
        Self {
            url: default_community_url(),
            forks: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SupermarketSection {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub ssl_no_verify: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TestsSection {
    #[serde(default)]
    pub foodcritic: Option<PathBuf>,
    #[serde(default)]
    pub rubocop: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub schema_version: String,
    #[serde(default)]
    pub default: Defaults,
    #[serde(default)]
    pub customer: BTreeMap<String, CustomerOverrides>,
    pub chef: ChefSection,
    #[serde(default)]
    pub community: CommunitySection,
    #[serde(default)]
    pub supermarket: SupermarketSection,
    #[serde(default)]
    pub tests: TestsSection,
    /// Hosting settings per organization/group.
    #[serde(default)]
    pub git: BTreeMap<String, HostConfig>,
}

/// Options that an organization may override.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrgOption {
    Mode,
    MailDomain,
    MailServer,
    MailPort,
    MailRecipient,
    ValidateChanges,
    CommitChanges,
    MailChanges,
    SearchGithub,
    PublishCookbook,
    Blacklist,
    GitCookbookOrgs,
    ExcludeFcs,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionValue {
    Mode(Mode),
    ValidateChanges(ValidateChanges),
    Flag(bool),
    Text(String),
    Port(u16),
    List(Vec<String>),
}

fn merge_lists(defaults: &[String], overrides: Option<&Vec<String>>) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in defaults.iter().chain(overrides.into_iter().flatten()) {
        let item = item.trim();
        if !item.is_empty() && !out.iter().any(|x| x == item) {
            out.push(item.to_string());
        }
    }
    out
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("read config: {}", path.display()))?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));
        Self::parse(&bytes, base).with_context(|| format!("load config: {}", path.display()))
    }

    /// Parses and validates a config document; relative paths are resolved against `base`.
    pub fn parse(bytes: &[u8], base: &Path) -> Result<Self> {
        let mut cfg: Config = serde_json::from_slice(bytes).context("parse config JSON")?;
        cfg.validate()?;
        cfg.resolve_paths(base);
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.schema_version.trim() != CONFIG_SCHEMA_VERSION {
            anyhow::bail!(
                "config.schema_version mismatch: expected {} got {:?}",
                CONFIG_SCHEMA_VERSION,
                self.schema_version
            );
        }
        if self.chef.server_url.trim().is_empty() {
            anyhow::bail!("config.chef.server_url must be non-empty");
        }
        for (org, host) in &self.git {
            if host.token.trim().is_empty() {
                anyhow::bail!(
                    "No token found for Git organization {org}! All configured organizations need to have a valid token."
                );
            }
        }
        let blacklists = std::iter::once(("default", &self.default.blacklist)).chain(
            self.customer
                .iter()
                .filter_map(|(org, c)| c.blacklist.as_ref().map(|b| (org.as_str(), b))),
        );
        for (scope, patterns) in blacklists {
            for pattern in patterns {
                Regex::new(pattern).with_context(|| {
                    format!("The blacklist {pattern:?} of {scope} is not a valid regular expression")
                })?;
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let anchor = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut() {
                if path.is_relative() {
                    *path = base.join(&*path);
                }
            }
        };
        anchor(&mut self.default.log_file);
        anchor(&mut self.default.temp_dir);

        // Bare tool names are left for a PATH lookup.
        let anchor_tool = |p: &mut Option<PathBuf>| {
            if let Some(path) = p.as_mut() {
                if path.is_relative() && path.components().count() > 1 {
                    *path = base.join(&*path);
                }
            }
        };
        anchor_tool(&mut self.tests.foodcritic);
        anchor_tool(&mut self.tests.rubocop);
    }

    fn overrides(&self, org: Option<&str>) -> Option<&CustomerOverrides> {
        if self.chef.kind != ChefKind::Enterprise {
            return None;
        }
        self.customer.get(org?)
    }

    /// The value of `key` for `org`: its override when one applies, else the default. List
    /// options combine both, defaults first.
    pub fn effective(&self, org: Option<&str>, key: OrgOption) -> OptionValue {
        let d = &self.default;
        let c = self.overrides(org);
        match key {
            OrgOption::Mode => OptionValue::Mode(c.and_then(|c| c.mode).unwrap_or(d.mode)),
            OrgOption::ValidateChanges => OptionValue::ValidateChanges(
                c.and_then(|c| c.validate_changes)
                    .unwrap_or(d.validate_changes),
            ),
            OrgOption::MailDomain => OptionValue::Text(
                c.and_then(|c| c.mail_domain.clone())
                    .unwrap_or_else(|| d.mail_domain.clone()),
            ),
            OrgOption::MailServer => OptionValue::Text(
                c.and_then(|c| c.mail_server.clone())
                    .unwrap_or_else(|| d.mail_server.clone()),
            ),
            OrgOption::MailRecipient => OptionValue::Text(
                c.and_then(|c| c.mail_recipient.clone())
                    .unwrap_or_else(|| d.mail_recipient.clone()),
            ),
            OrgOption::MailPort => {
                OptionValue::Port(c.and_then(|c| c.mail_port).unwrap_or(d.mail_port))
            }
            OrgOption::CommitChanges => OptionValue::Flag(
                c.and_then(|c| c.commit_changes)
                    .unwrap_or(d.commit_changes),
            ),
            OrgOption::MailChanges => {
                OptionValue::Flag(c.and_then(|c| c.mail_changes).unwrap_or(d.mail_changes))
            }
            OrgOption::SearchGithub => OptionValue::Flag(
                c.and_then(|c| c.search_github)
                    .unwrap_or(d.search_github),
            ),
            OrgOption::PublishCookbook => OptionValue::Flag(
                c.and_then(|c| c.publish_cookbook)
                    .unwrap_or(d.publish_cookbook),
            ),
            OrgOption::Blacklist => {
                OptionValue::List(merge_lists(&d.blacklist, c.and_then(|c| c.blacklist.as_ref())))
            }
            OrgOption::GitCookbookOrgs => OptionValue::List(merge_lists(
                &d.git_cookbook_orgs,
                c.and_then(|c| c.git_cookbook_orgs.as_ref()),
            )),
            OrgOption::ExcludeFcs => OptionValue::List(merge_lists(
                &d.exclude_fcs,
                c.and_then(|c| c.exclude_fcs.as_ref()),
            )),
        }
    }

    pub fn mode(&self, org: Option<&str>) -> Mode {
        match self.effective(org, OrgOption::Mode) {
            OptionValue::Mode(mode) => mode,
            _ => self.default.mode,
        }
    }

    pub fn validate_changes(&self, org: Option<&str>) -> ValidateChanges {
        match self.effective(org, OrgOption::ValidateChanges) {
            OptionValue::ValidateChanges(v) => v,
            _ => self.default.validate_changes,
        }
    }

    /// `false` for keys that are not flags.
    pub fn flag(&self, org: Option<&str>, key: OrgOption) -> bool {
        matches!(self.effective(org, key), OptionValue::Flag(true))
    }

    /// Empty for keys that are not text.
    pub fn text(&self, org: Option<&str>, key: OrgOption) -> String {
        match self.effective(org, key) {
            OptionValue::Text(s) => s,
            _ => String::new(),
        }
    }

    pub fn mail_port(&self, org: Option<&str>) -> u16 {
        match self.effective(org, OrgOption::MailPort) {
            OptionValue::Port(port) => port,
            _ => self.default.mail_port,
        }
    }

    /// Empty for keys that are not lists.
    pub fn list(&self, org: Option<&str>, key: OrgOption) -> Vec<String> {
        match self.effective(org, key) {
            OptionValue::List(items) => items,
            _ => Vec::new(),
        }
    }

    /// Address recorded on tags and commits made for `user`.
    pub fn mail_for(&self, org: Option<&str>, user: &str) -> String {
        format!("{user}@{}", self.text(org, OrgOption::MailDomain))
    }

    /// `true` when `cookbook` matches a blacklist pattern of `org` and must not be published.
    pub fn blacklisted(&self, org: Option<&str>, cookbook: &str) -> Result<bool> {
        for pattern in self.list(org, OrgOption::Blacklist) {
            let re = Regex::new(&pattern)
                .with_context(|| format!("compile blacklist pattern {pattern:?}"))?;
            if re.is_match(cookbook) {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// The live configuration. Each request works on one [`snapshot`](Self::snapshot); a reload
/// swaps in a fully validated replacement.
#[derive(Debug)]
pub struct ConfigHandle {
    path: PathBuf,
    current: RwLock<Arc<Config>>,
}

impl ConfigHandle {
    pub fn load(path: &Path) -> Result<Self> {
        let cfg = Config::load(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(Arc::new(cfg)),
        })
    }

    /// A handle that cannot be reloaded from disk, for embedding callers and tests.
    pub fn fixed(cfg: Config) -> Self {
        Self {
            path: PathBuf::new(),
            current: RwLock::new(Arc::new(cfg)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn snapshot(&self) -> Arc<Config> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Re-reads the file. On error the previous configuration stays active. The binary loads
    /// the file fresh on every invocation, so only tests swap a live handle.
    #[cfg(test)]
    fn reload(&self) -> Result<Arc<Config>> {
        if self.path.as_os_str().is_empty() {
            anyhow::bail!("configuration was not loaded from a file");
        }
        let fresh = Arc::new(Config::load(&self.path)?);
        *self.current.write().unwrap_or_else(PoisonError::into_inner) = Arc::clone(&fresh);
        tracing::info!(path = %self.path.display(), "configuration reloaded");
        Ok(fresh)
    }
}
