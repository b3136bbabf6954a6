//! The upload gate.
//!
//! One call to [`Gatekeeper::process`] handles one cookbook upload, strictly in order:
//! frozen check, bundle rebuild, source resolution, lint checks (repository sources only),
//! content comparison, dependency validation, then tagging and publishing. The first failure
//! ends the pass; nothing is retried.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use cookgate_contracts::GATE_REPORT_SCHEMA_VERSION;
use cookgate_pkg::{ArchiveLimits, CookbookVersion};
use cookgate_vcs::{Committer, VcsHost};
use serde::Serialize;

use crate::audit::{cookbook_record, Action, Auditor, Change, ChangeDetails};
use crate::backends::Backends;
use crate::bundle::{build_bundle, CandidateBundle};
use crate::checks::{run_checks, GateMetrics, LintSettings, LintTool};
use crate::compare::{compare, ignore_rules, SourceBundle};
use crate::config::{Config, ConfigHandle, Mode, OrgOption};
use crate::constraints::{check_dependencies, cookbook_frozen, ConstraintSet};
use crate::error::{Fault, Framing, GateError};
use crate::resolve::{tag_for, Origin, Resolver, SourceReference};

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub organization: Option<String>,
    pub user: String,
    pub cookbook: CookbookVersion,
    /// The client asked to force the upload.
    pub forced: bool,
    pub client_agent: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Decision {
    /// Nothing to check; the upload is forwarded as is.
    PassThrough,
    /// Every check passed.
    Accepted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GateOutcome {
    pub decision: Decision,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceReference>,
    pub tag_created: bool,
    pub published: bool,
    pub bypassed_checks: Vec<LintTool>,
}

impl GateOutcome {
    fn pass_through() -> Self {
        Self {
            decision: Decision::PassThrough,
            source: None,
            tag_created: false,
            published: false,
            bypassed_checks: Vec::new(),
        }
    }
}

pub struct Gatekeeper {
    config: Arc<ConfigHandle>,
    backends: Backends,
    metrics: Arc<GateMetrics>,
    limits: ArchiveLimits,
    auditor: Option<Arc<Auditor>>,
}

impl Gatekeeper {
    pub fn new(config: Arc<ConfigHandle>, backends: Backends) -> Self {
        Self {
            config,
            backends,
            metrics: Arc::new(GateMetrics::default()),
            limits: ArchiveLimits::default(),
            auditor: None,
        }
    }

    pub fn with_limits(mut self, limits: ArchiveLimits) -> Self {
        self.limits = limits;
        self
    }

    /// Accepted uploads are recorded through `auditor` when `commit_changes` is set.
    pub fn with_auditor(mut self, auditor: Arc<Auditor>) -> Self {
        self.auditor = Some(auditor);
        self
    }

    pub fn metrics(&self) -> &GateMetrics {
        &self.metrics
    }

    pub fn process(&self, req: &UploadRequest) -> Result<GateOutcome, GateError> {
        let cfg = self.config.snapshot();
        let org = req.organization.as_deref();
        let name = req.cookbook.cookbook_name.as_str();
        let version = req.cookbook.version.as_str();
        let mode = cfg.mode(org);

        let outcome = if mode == Mode::Silent {
            GateOutcome::pass_through()
        } else {
            if cookbook_frozen(self.backends.chef.as_ref(), org, name, version)? {
                tracing::debug!(
                    cookbook = name,
                    version,
                    agent = req.client_agent.as_deref().unwrap_or_default(),
                    "refusing to overwrite frozen cookbook"
                );
                return Err(GateError::FrozenOverwrite {
                    cookbook: name.to_string(),
                    version: version.to_string(),
                });
            }
            if req.cookbook.frozen {
                self.validate(&cfg, req, mode)?
            } else {
                GateOutcome::pass_through()
            }
        };

        tracing::info!(
            cookbook = name,
            version,
            org = org.unwrap_or_default(),
            user = %req.user,
            decision = ?outcome.decision,
            "upload gated"
        );
        if cfg.flag(org, OrgOption::CommitChanges) {
            self.record(req, outcome.source.as_ref());
        }
        Ok(outcome)
    }

    fn validate(
        &self,
        cfg: &Config,
        req: &UploadRequest,
        mode: Mode,
    ) -> Result<GateOutcome, GateError> {
        let org = req.organization.as_deref();
        let cookbook = &req.cookbook;
        let name = cookbook.cookbook_name.as_str();
        let version = cookbook.version.as_str();
        let chef = self.backends.chef.as_ref();

        let org_id = if cfg.chef.kind.uses_bookshelf() {
            Some(
                chef.organization_id(org)
                    .context("Failed to get organization ID")?,
            )
        } else {
            None
        };
        let bundle = build_bundle(
            cookbook,
            self.backends.storage.as_ref(),
            org_id.as_deref(),
            cfg.default.temp_dir.as_deref(),
            &req.user,
            self.limits,
        )?;

        let resolver = self.resolver(cfg, org);
        let source = resolver.resolve(name, version)?;
        tracing::debug!(cookbook = name, version, origin = ?source.origin, url = %source.download_url, "resolved source");

        let mut bypassed_checks = Vec::new();
        if !source.artifact {
            let settings = self.lint_settings(cfg, org);
            let bypass_allowed = mode == Mode::Permissive && req.forced;
            bypassed_checks = run_checks(
                &settings,
                bundle.path(),
                bypass_allowed,
                &self.metrics,
                name,
                &req.user,
            )?;
        }

        self.compare_with_source(&resolver, &source, &bundle)?;

        if !cookbook.metadata.dependencies.is_empty() {
            let set = ConstraintSet::from_cookbook_versions(&cookbook.metadata.dependencies);
            let failures = check_dependencies(chef, org, &set, false)?;
            if !failures.is_empty() {
                return Err(GateError::Constraints {
                    failures,
                    framing: Framing::Dependencies,
                });
            }
        }

        let (tag_created, published) = self.tag_and_publish(cfg, req, &source, &bundle)?;
        Ok(GateOutcome {
            decision: Decision::Accepted,
            source: Some(source),
            tag_created,
            published,
            bypassed_checks,
        })
    }

    fn resolver<'a>(&'a self, cfg: &'a Config, org: Option<&str>) -> Resolver<'a> {
        let search_orgs = if cfg.flag(org, OrgOption::SearchGithub) {
            cfg.list(org, OrgOption::GitCookbookOrgs)
        } else {
            Vec::new()
        };
        Resolver {
            community: self.backends.community.as_deref(),
            forks: cfg.community.forks.as_deref(),
            private_registry: self.backends.private_registry.as_deref(),
            vcs: &self.backends.vcs,
            search_orgs,
        }
    }

    fn lint_settings(&self, cfg: &Config, org: Option<&str>) -> LintSettings {
        LintSettings {
            foodcritic: cfg.tests.foodcritic.clone(),
            rubocop: cfg.tests.rubocop.clone(),
            include_fcs: cfg.default.include_fcs.clone(),
            exclude_fcs: cfg.list(org, OrgOption::ExcludeFcs),
            home: scratch_root(cfg),
        }
    }

    fn compare_with_source(
        &self,
        resolver: &Resolver<'_>,
        source: &SourceReference,
        bundle: &CandidateBundle,
    ) -> Result<(), GateError> {
        let bytes = resolver.fetch(source)?;
        let upstream = SourceBundle::from_tar_gz(&bytes, self.limits)?;
        let rules = ignore_rules(
            &upstream,
            bundle.gitignore.as_deref(),
            bundle.chefignore.as_deref(),
        )?;
        let report = compare(&bundle.hashes, &upstream.hashes, &rules);
        match report.first_failure() {
            None => Ok(()),
            Some((kind, paths)) => Err(GateError::Discrepancy {
                kind,
                paths,
                source_url: source.download_url.to_string(),
                origin: source.origin,
            }),
        }
    }

    fn tag_and_publish(
        &self,
        cfg: &Config,
        req: &UploadRequest,
        source: &SourceReference,
        bundle: &CandidateBundle,
    ) -> Result<(bool, bool), GateError> {
        let org = req.organization.as_deref();
        let name = req.cookbook.cookbook_name.as_str();
        let tag = tag_for(&req.cookbook.version);

        let host: Option<&Arc<dyn VcsHost>> = match (source.origin, source.vcs_owner.as_deref()) {
            (Origin::Vcs, Some(owner)) => self.backends.vcs_host(owner),
            _ => None,
        };
        let mut tag_created = false;
        if let Some(host) = host {
            if !source.tagged {
                let tagger = Committer {
                    name: req.user.clone(),
                    mail: cfg.mail_for(org, &req.user),
                };
                host.create_tag(name, &tag, &tagger)?;
                tag_created = true;
                tracing::info!(cookbook = name, tag, owner = host.owner(), "tagged cookbook repository");
            }
        }

        if !(cfg.flag(org, OrgOption::PublishCookbook) && source.private && host.is_some()) {
            return Ok((tag_created, false));
        }
        if cfg.blacklisted(org, name)? {
            tracing::info!(cookbook = name, "cookbook is blacklisted; not publishing");
            return Ok((tag_created, false));
        }
        let Some(registry) = self.backends.private_registry.as_deref() else {
            return Err(GateError::Backend(anyhow::anyhow!(
                "publish_cookbook is set but no private registry is configured"
            )));
        };

        if let Err(err) = registry.publish(name, &bundle.archive) {
            let mut message = format!("Failed to upload cookbook {name} to the private registry: {err:#}");
            let mut rollback_failed = false;
            if let (true, Some(host)) = (tag_created, host) {
                if let Err(untag) = host.delete_tag(name, &tag) {
                    message.push_str(&format!("; removing tag {tag} failed: {untag}"));
                    rollback_failed = true;
                }
            }
            return Err(GateError::Publish {
                message,
                rollback_failed,
            });
        }
        tracing::info!(cookbook = name, version = %req.cookbook.version, "published cookbook");
        Ok((tag_created, true))
    }

    fn record(&self, req: &UploadRequest, source: Option<&SourceReference>) {
        let Some(auditor) = &self.auditor else {
            return;
        };
        let change = match upload_change(req, source) {
            Ok(change) => change,
            Err(err) => {
                tracing::error!(cookbook = %req.cookbook.cookbook_name, "{err:#}");
                return;
            }
        };
        if let Err(err) = auditor.record_in_background(change) {
            tracing::error!(cookbook = %req.cookbook.cookbook_name, "Failed to start audit thread: {err}");
        }
    }
}

/// The audit-trail entry for a gated upload.
pub fn upload_change(
    req: &UploadRequest,
    source: Option<&SourceReference>,
) -> anyhow::Result<Change> {
    Ok(Change {
        organization: req.organization.clone(),
        user: req.user.clone(),
        action: Action::Create,
        details: ChangeDetails::for_cookbook(&req.cookbook.cookbook_name, &req.cookbook.version),
        body: cookbook_record(&req.cookbook, req.forced, source)?,
    })
}

impl std::fmt::Debug for Gatekeeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gatekeeper")
            .field("backends", &self.backends)
            .field("limits", &self.limits)
            .finish_non_exhaustive()
    }
}

/// Machine-readable result of one gate pass.
#[derive(Debug, Clone, Serialize)]
pub struct GateReport {
    pub schema_version: &'static str,
    pub cookbook: String,
    pub version: String,
    pub ok: bool,
    pub status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<Fault>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<GateOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl GateReport {
    pub fn new(cookbook: &CookbookVersion, result: &Result<GateOutcome, GateError>) -> Self {
        let (ok, status, fault, outcome, message) = match result {
            Ok(outcome) => (true, 200, None, Some(outcome.clone()), None),
            Err(err) => (
                false,
                err.status(),
                Some(err.fault()),
                None,
                Some(err.to_string()),
            ),
        };
        Self {
            schema_version: GATE_REPORT_SCHEMA_VERSION,
            cookbook: cookbook.cookbook_name.clone(),
            version: cookbook.version.clone(),
            ok,
            status,
            fault,
            outcome,
            message,
        }
    }
}

/// The configured temp dir, else the system one. Also `HOME` for the lint tools.
pub fn scratch_root(cfg: &Config) -> PathBuf {
    cfg.default.temp_dir.clone().unwrap_or_else(std::env::temp_dir)
}
