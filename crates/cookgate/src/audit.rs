//! Audit trail: every accepted configuration change is committed to a version-control
//! repository named after the organization, and optionally mailed as a diff.

use std::sync::Arc;
use std::thread::JoinHandle;

use anyhow::{Context, Result};
use cookgate_contracts::COMMITTER_SIGNATURE;
use cookgate_pkg::CookbookVersion;
use cookgate_vcs::{Committer, Content, LockTable, VcsHost};
use serde_json::Value;

use crate::backends::Backends;
use crate::config::{Config, ConfigHandle, OrgOption};
use crate::notify::{Notice, Notifier};
use crate::resolve::SourceReference;

/// Repository used when a change has no organization.
pub const DEFAULT_REPO: &str = "config";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    /// Maps the HTTP method of the proxied request.
    pub fn from_method(method: &str) -> Result<Self> {
        match method.trim().to_ascii_uppercase().as_str() {
            "POST" => Ok(Self::Create),
            "PUT" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => anyhow::bail!("unsupported method {other:?} for the audit trail"),
        }
    }

    pub fn verb(self) -> &'static str {
        match self {
            Self::Create => "created",
            Self::Update => "updated",
            Self::Delete => "deleted",
        }
    }
}

/// Where a change lands in the audit repository: `<kind>/<item>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeDetails {
    /// Plural object type, e.g. `roles` or `data_bags`.
    pub kind: String,
    pub item: String,
}

impl ChangeDetails {
    pub fn new(kind: &str, item: &str) -> Self {
        Self {
            kind: kind.to_string(),
            item: item.to_string(),
        }
    }

    /// A data bag item, or the whole bag when `item` is `None`.
    pub fn data_bag(bag: &str, item: Option<&str>) -> Self {
        let item = match item {
            Some(item) => format!("{bag}/{item}.json"),
            None => bag.to_string(),
        };
        Self::new("data_bags", &item)
    }

    pub fn for_cookbook(name: &str, version: &str) -> Self {
        Self::new("cookbooks", &format!("{name}-{version}.json"))
    }

    /// Names the item after the body's `name`, or `raw_data.id` for data bag items.
    pub fn from_body(kind: &str, body: &[u8]) -> Result<Self> {
        let doc: Value = serde_json::from_slice(body).context("parse change body")?;
        let name = doc
            .get("name")
            .and_then(Value::as_str)
            .or_else(|| doc.pointer("/raw_data/id").and_then(Value::as_str))
            .or_else(|| doc.get("id").and_then(Value::as_str))
            .with_context(|| format!("change body for {kind} carries no name"))?;
        Ok(Self::new(kind, &format!("{name}.json")))
    }

    pub fn path(&self) -> String {
        format!("{}/{}", self.kind, self.item)
    }

    fn singular_kind(&self) -> &str {
        self.kind.strip_suffix('s').unwrap_or(&self.kind)
    }

    fn commit_message(&self, verb: &str) -> String {
        let item = self.item.strip_suffix(".json").unwrap_or(&self.item);
        format!(
            "Config for {} {item} {verb} by {COMMITTER_SIGNATURE}",
            self.singular_kind()
        )
    }
}

#[derive(Debug, Clone)]
pub struct Change {
    pub organization: Option<String>,
    pub user: String,
    pub action: Action,
    pub details: ChangeDetails,
    pub body: Vec<u8>,
}

/// Content written for a change: deletes keep the raw body, everything else is stored as pretty
/// JSON without the `automatic` attributes.
pub fn remarshal(action: Action, body: &[u8]) -> Result<Vec<u8>> {
    if action == Action::Delete {
        let mut out = body.to_vec();
        out.push(b'\n');
        return Ok(out);
    }
    let mut doc: Value = serde_json::from_slice(body).context("parse change body")?;
    if let Some(obj) = doc.as_object_mut() {
        obj.remove("automatic");
    }
    let mut out = serde_json::to_vec_pretty(&doc).context("render change body")?;
    out.push(b'\n');
    Ok(out)
}

/// Body recorded for an uploaded cookbook.
pub fn cookbook_record(
    cookbook: &CookbookVersion,
    forced: bool,
    source: Option<&SourceReference>,
) -> Result<Vec<u8>> {
    let source = source.map_or_else(|| "N/A".to_string(), |s| s.download_url.to_string());
    let doc = serde_json::json!({
        "name": cookbook.cookbook_name,
        "version": cookbook.version,
        "frozen": cookbook.frozen,
        "forcedupload": forced,
        "source": source,
    });
    serde_json::to_vec(&doc).context("render cookbook record")
}

pub fn repo_for(org: Option<&str>) -> &str {
    match org {
        Some(org) if !org.trim().is_empty() => org,
        _ => DEFAULT_REPO,
    }
}

pub struct Auditor {
    config: Arc<ConfigHandle>,
    backends: Backends,
    locks: Arc<LockTable>,
    notifier: Arc<dyn Notifier>,
}

impl Auditor {
    pub fn new(
        config: Arc<ConfigHandle>,
        backends: Backends,
        locks: Arc<LockTable>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            backends,
            locks,
            notifier,
        }
    }

    /// Commits `change`. Returns the commit id, or `None` when nothing had to be committed.
    pub fn record(&self, change: &Change) -> Result<Option<String>> {
        let cfg = self.config.snapshot();
        let org = change.organization.as_deref();
        let owner = cfg
            .default
            .git_organization
            .as_deref()
            .context("no git_organization configured for the audit trail")?;
        let host = self
            .backends
            .vcs_host(owner)
            .with_context(|| format!("No Git config specified for organization: {owner}!"))?;
        let repo = repo_for(org);
        let path = change.details.path();
        let committer = Committer {
            name: change.user.clone(),
            mail: cfg.mail_for(org, &change.user),
        };
        let content = remarshal(change.action, &change.body)?;

        let _guard = self.locks.acquire(&format!("{owner}/{repo}"));
        let commit = self.write(host.as_ref(), repo, &path, change, &committer, &content)?;

        if let Some(sha) = &commit {
            tracing::info!(org = repo, user = %change.user, path, sha, "recorded config change");
            if cfg.flag(org, OrgOption::MailChanges) {
                self.mail_diff(&cfg, host.as_ref(), repo, sha, change, &committer.mail);
            }
        }
        Ok(commit)
    }

    fn write(
        &self,
        host: &dyn VcsHost,
        repo: &str,
        path: &str,
        change: &Change,
        committer: &Committer,
        content: &[u8],
    ) -> Result<Option<String>> {
        let details = &change.details;
        let existing = host
            .get_content(repo, path)
            .with_context(|| format!("get {path} from {repo}"))?;
        let sha = match (existing, change.action) {
            (Content::Missing, Action::Delete) => {
                anyhow::bail!("Failed to delete non-existing file or directory {path}")
            }
            (Content::Missing, _) => host.create_file(
                repo,
                path,
                &details.commit_message(Action::Create.verb()),
                committer,
                content,
            )?,
            (Content::File(file), Action::Delete) => host.delete_file(
                repo,
                path,
                &file.sha,
                &details.commit_message(Action::Delete.verb()),
                committer,
            )?,
            (Content::File(file), _) => {
                if file.content == content {
                    return Ok(None);
                }
                host.update_file(
                    repo,
                    path,
                    &file.sha,
                    &details.commit_message(Action::Update.verb()),
                    committer,
                    content,
                )?
            }
            (Content::Directory(entries), Action::Delete) => {
                let kind = details.singular_kind().to_string();
                let message = move |p: &str| {
                    let item = p.strip_prefix("data_bags/").unwrap_or(p);
                    let item = item.strip_suffix(".json").unwrap_or(item);
                    format!("Config for {kind} {item} deleted by {COMMITTER_SIGNATURE}")
                };
                host.delete_directory(repo, &entries, committer, &message)?;
                return Ok(None);
            }
            (Content::Directory(_), _) => {
                anyhow::bail!("{path} is a directory in {repo}; only a delete can replace it")
            }
        };
        Ok(Some(sha))
    }

    fn mail_diff(
        &self,
        cfg: &Config,
        host: &dyn VcsHost,
        repo: &str,
        sha: &str,
        change: &Change,
        from: &str,
    ) {
        let org = change.organization.as_deref();
        let to = cfg.text(org, OrgOption::MailRecipient);
        let server = cfg.text(org, OrgOption::MailServer);
        if to.is_empty() || server.is_empty() {
            tracing::warn!(org = repo, sha, "mail_changes is set without mail_server and mail_recipient");
            return;
        }
        let diff = match host.get_diff(repo, sha) {
            Ok(diff) => diff,
            Err(err) => {
                tracing::warn!(org = repo, sha, "Failed to get diff: {err}");
                return;
            }
        };
        let subject = format!(
            "[{} CHEF] {} {}",
            repo.to_uppercase(),
            change.action.verb(),
            change.details.path()
        );
        let notice = Notice {
            from: from.to_string(),
            to,
            relay: format!("{server}:{}", cfg.mail_port(org)),
            subject,
            body: diff,
        };
        if let Err(err) = self.notifier.notify(&notice) {
            tracing::warn!(org = repo, subject = %notice.subject, "Failed to send notification: {err:#}");
        }
    }

    /// Runs [`record`](Self::record) on its own thread; failures are logged.
    pub fn record_in_background(self: &Arc<Self>, change: Change) -> std::io::Result<JoinHandle<()>> {
        let auditor = Arc::clone(self);
        std::thread::Builder::new()
            .name("cookgate-audit".to_string())
            .spawn(move || {
                if let Err(err) = auditor.record(&change) {
                    tracing::error!(
                        user = %change.user,
                        path = change.details.path(),
                        "Failed to record change: {err:#}"
                    );
                }
            })
    }
}

impl std::fmt::Debug for Auditor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Auditor")
            .field("config", &self.config.path())
            .field("backends", &self.backends)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn details_for_common_objects() {
        assert_eq!(
            ChangeDetails::from_body("roles", br#"{"name":"web","run_list":[]}"#)
                .unwrap()
                .path(),
            "roles/web.json"
        );
        assert_eq!(
            ChangeDetails::from_body("data_bags", br#"{"raw_data":{"id":"admins"}}"#)
                .unwrap()
                .item,
            "admins.json"
        );
        assert_eq!(
            ChangeDetails::data_bag("users", Some("jdoe")).path(),
            "data_bags/users/jdoe.json"
        );
        assert_eq!(ChangeDetails::data_bag("users", None).path(), "data_bags/users");
        assert_eq!(
            ChangeDetails::for_cookbook("foo", "1.0.0").path(),
            "cookbooks/foo-1.0.0.json"
        );
        assert!(ChangeDetails::from_body("roles", b"{}").is_err());
    }

    #[test]
    fn commit_messages_use_the_singular_kind() {
        let details = ChangeDetails::data_bag("users", Some("jdoe"));
        assert_eq!(
            details.commit_message("created"),
            "Config for data_bag users/jdoe created by cookgate"
        );
    }

    #[test]
    fn remarshal_drops_automatic_attributes() {
        let out = remarshal(
            Action::Update,
            br#"{"name":"web01","automatic":{"ohai":1},"normal":{"motd":"<hi> & bye"}}"#,
        )
        .unwrap();
        assert_eq!(
            String::from_utf8(out).unwrap(),
            "{\n  \"name\": \"web01\",\n  \"normal\": {\n    \"motd\": \"<hi> & bye\"\n  }\n}\n"
        );
        assert_eq!(remarshal(Action::Delete, b"{}").unwrap(), b"{}\n");
    }

    #[test]
    fn methods_map_to_actions() {
        assert_eq!(Action::from_method("post").unwrap(), Action::Create);
        assert_eq!(Action::from_method("PUT").unwrap().verb(), "updated");
        assert!(Action::from_method("PATCH").is_err());
    }

    #[test]
    fn cookbook_record_without_source() {
        let cb = CookbookVersion {
            cookbook_name: "foo".to_string(),
            version: "1.0.0".to_string(),
            frozen: true,
            ..CookbookVersion::default()
        };
        let doc: Value = serde_json::from_slice(&cookbook_record(&cb, true, None).unwrap()).unwrap();
        assert_eq!(
            doc,
            serde_json::json!({"name":"foo","version":"1.0.0","frozen":true,"forcedupload":true,"source":"N/A"})
        );
    }

    #[test]
    fn missing_organization_uses_default_repo() {
        assert_eq!(repo_for(None), "config");
        assert_eq!(repo_for(Some("acme")), "acme");
    }
}
