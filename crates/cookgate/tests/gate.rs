mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use common::{config, handle, tarball, upload, FakeChef, FakeRegistry, FakeVcs, World};
use cookgate::{
    Auditor, Decision, DiscrepancyKind, Fault, GateError, GateReport, Gatekeeper, LintTool, Origin,
    TracingNotifier, UploadRequest,
};
use cookgate_contracts::GATE_REPORT_SCHEMA_VERSION;
use cookgate_pkg::{ArchiveLimits, CookbookVersion};
use cookgate_vcs::LockTable;

const COMMUNITY: &str = "https://supermarket.example.com/";
const PRIVATE: &str = "https://private.example.com/";

const FOO_FILES: &[(&str, &str)] = &[
    ("recipes/default.rb", "package 'foo'\n"),
    ("metadata.rb", "name 'foo'\nversion '1.0.0'\n"),
    ("metadata.json", "{\"name\":\"foo\",\"uploaded_by\":\"jdoe\"}"),
    ("README.md", "# foo\n"),
];

const FOO_RELEASED: &[(&str, &str)] = &[
    ("recipes/default.rb", "package 'foo'\n"),
    ("metadata.rb", "name 'foo'\nversion '1.0.0'\n"),
    ("metadata.json", "{\"name\":\"foo\"}"),
    ("README.md", "# foo\n"),
];

fn request(cookbook: CookbookVersion) -> UploadRequest {
    UploadRequest {
        organization: Some("acme".to_string()),
        user: "jdoe".to_string(),
        cookbook,
        forced: false,
        client_agent: None,
    }
}

fn community_with_foo() -> FakeRegistry {
    FakeRegistry::new(COMMUNITY).with_artifact("foo", "1.0.0", tarball("foo", FOO_RELEASED))
}

fn vcs_config() -> serde_json::Value {
    serde_json::json!({
        "default": {
            "search_github": true,
            "git_cookbook_orgs": ["acme"],
            "publish_cookbook": true
        }
    })
}

#[test]
fn identical_community_release_passes_despite_metadata_json() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage).community(community_with_foo());
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    assert_eq!(outcome.decision, Decision::Accepted);
    let source = outcome.source.unwrap();
    assert_eq!(source.origin, Origin::Community);
    assert!(source.artifact);
    assert!(!outcome.tag_created);
    assert!(!outcome.published);
    // metadata.rb and metadata.json are never downloaded.
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn differing_spec_files_do_not_block_the_upload() {
    let mut files = FOO_FILES.to_vec();
    files.push(("spec/a_spec.rb", "describe 'local' do\nend\n"));
    let mut released = FOO_RELEASED.to_vec();
    released.push(("spec/a_spec.rb", "describe 'upstream' do\nend\n"));
    let (cb, storage) = upload("foo", "1.0.0", true, &files);
    let world = World::new(FakeChef::new(), storage).community(
        FakeRegistry::new(COMMUNITY).with_artifact("foo", "1.0.0", tarball("foo", &released)),
    );
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    assert_eq!(outcome.decision, Decision::Accepted);
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 2);
}

#[test]
fn gitignored_upload_files_are_skipped() {
    let mut files = FOO_FILES.to_vec();
    files.push((".gitignore", "*.log\n"));
    files.push(("build.log", "noise\n"));
    let mut released = FOO_RELEASED.to_vec();
    released.push((".gitignore", "*.log\n"));
    let (cb, storage) = upload("foo", "1.0.0", true, &files);
    let world = World::new(FakeChef::new(), storage).community(
        FakeRegistry::new(COMMUNITY).with_artifact("foo", "1.0.0", tarball("foo", &released)),
    );
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    assert_eq!(gate.process(&request(cb)).unwrap().decision, Decision::Accepted);
    // recipes/default.rb, README.md and .gitignore
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 3);
}

#[test]
fn extra_file_is_reported_by_name() {
    let mut files = FOO_FILES.to_vec();
    files.push(("extra.rb", "puts 'hi'\n"));
    let (cb, storage) = upload("foo", "1.0.0", true, &files);
    let world = World::new(FakeChef::new(), storage).community(community_with_foo());
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    let GateError::Discrepancy { kind, paths, origin, .. } = &err else {
        panic!("expected a discrepancy, got {err:?}");
    };
    assert_eq!(*kind, DiscrepancyKind::Extra);
    assert_eq!(paths, &vec!["extra.rb".to_string()]);
    assert_eq!(*origin, Origin::Community);
    assert_eq!(err.status(), 412);
    assert_eq!(err.fault(), Fault::Client);
    assert!(err.to_string().contains(" - extra.rb"), "{err}");
}

#[test]
fn changed_file_from_repository_source_asks_for_a_merge() {
    let mut files = FOO_FILES.to_vec();
    files[0] = ("recipes/default.rb", "package 'foo-patched'\n");
    let (cb, storage) = upload("foo", "1.0.0", true, &files);
    let world = World::new(FakeChef::new(), storage).vcs(
        FakeVcs::new("acme")
            .with_repo("foo", tarball("foo-1a2b3c", FOO_RELEASED))
            .with_tag("foo", "v1.0.0"),
    );
    let gate = Gatekeeper::new(handle(config(vcs_config())), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(
        err,
        GateError::Discrepancy {
            kind: DiscrepancyKind::Changed,
            origin: Origin::Vcs,
            ..
        }
    ));
    let text = err.to_string();
    assert!(text.contains(" - recipes/default.rb"), "{text}");
    assert!(text.contains("merged into the central"), "{text}");
    assert!(world.vcs["acme"].created_tags.lock().unwrap().is_empty());
}

#[test]
fn frozen_version_fails_before_any_download() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new().with_version("foo", "1.0.0", true), storage)
        .community(community_with_foo());
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(err, GateError::FrozenOverwrite { .. }));
    assert_eq!(err.status(), 409);
    assert!(err.to_string().contains("please bump the version"));
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 0);
    let community = world.community.as_ref().unwrap();
    assert_eq!(community.universe_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn unfrozen_dependency_is_reported() {
    let (mut cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    cb.metadata
        .dependencies
        .insert("bar".to_string(), "= 2.0.0".to_string());
    cb.metadata
        .dependencies
        .insert("baz".to_string(), "~> 1.0".to_string());
    let chef = FakeChef::new().with_version("bar", "2.0.0", false);
    let world = World::new(chef, storage).community(community_with_foo());
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    let GateError::Constraints { failures, .. } = &err else {
        panic!("expected a dependency failure, got {err:?}");
    };
    assert_eq!(failures, &vec!["bar version 2.0.0 needs to be frozen".to_string()]);
    assert_eq!(err.status(), 412);
    assert!(err.to_string().contains("=== Dependency errors found ==="));
}

#[test]
fn unfrozen_upload_passes_through() {
    let (cb, storage) = upload("foo", "1.0.0", false, FOO_FILES);
    let world = World::new(FakeChef::new(), storage);
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    assert_eq!(outcome.decision, Decision::PassThrough);
    assert_eq!(world.chef.lookups.load(Ordering::SeqCst), 1);
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn silent_mode_checks_nothing() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new().with_version("foo", "1.0.0", true), storage);
    let cfg = config(serde_json::json!({"default": {"mode": "silent"}}));
    let gate = Gatekeeper::new(handle(cfg), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    assert_eq!(outcome.decision, Decision::PassThrough);
    assert_eq!(world.chef.lookups.load(Ordering::SeqCst), 0);
}

#[test]
fn unresolved_source_is_a_client_fault() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage).community(FakeRegistry::new(COMMUNITY));
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(err, GateError::SourceNotFound { .. }));
    assert_eq!(err.fault(), Fault::Client);
    assert!(err
        .to_string()
        .contains("Failed to locate the source of the foo cookbook!"));
}

#[test]
fn untagged_repository_source_is_tagged_and_published() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .community(FakeRegistry::new(COMMUNITY))
        .private_registry(FakeRegistry::new(PRIVATE))
        .vcs(FakeVcs::new("acme").with_repo("foo", tarball("acme-foo-0f0f0f", FOO_RELEASED)));
    let gate = Gatekeeper::new(handle(config(vcs_config())), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    let source = outcome.source.as_ref().unwrap();
    assert_eq!(source.origin, Origin::Vcs);
    assert!(source.private);
    assert!(!source.tagged);
    assert!(outcome.tag_created);
    assert!(outcome.published);
    assert_eq!(
        *world.vcs["acme"].created_tags.lock().unwrap(),
        vec![(
            "foo".to_string(),
            "v1.0.0".to_string(),
            "jdoe@example.com".to_string()
        )]
    );
    let private = world.private_registry.as_ref().unwrap();
    assert_eq!(*private.published.lock().unwrap(), vec!["foo".to_string()]);
}

#[test]
fn blacklisted_cookbook_is_tagged_but_not_published() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .private_registry(FakeRegistry::new(PRIVATE))
        .vcs(FakeVcs::new("acme").with_repo("foo", tarball("foo", FOO_RELEASED)));
    let mut extra = vcs_config();
    extra["default"]["blacklist"] = serde_json::json!(["^fo+$"]);
    let gate = Gatekeeper::new(handle(config(extra)), world.backends());

    let outcome = gate.process(&request(cb)).unwrap();
    assert!(outcome.tag_created);
    assert!(!outcome.published);
    let private = world.private_registry.as_ref().unwrap();
    assert!(private.published.lock().unwrap().is_empty());
}

#[test]
fn failed_publish_removes_the_fresh_tag() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .private_registry(FakeRegistry::new(PRIVATE).failing_publish())
        .vcs(FakeVcs::new("acme").with_repo("foo", tarball("foo", FOO_RELEASED)));
    let gate = Gatekeeper::new(handle(config(vcs_config())), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(
        err,
        GateError::Publish {
            rollback_failed: false,
            ..
        }
    ));
    assert_eq!(err.status(), 502);
    assert_eq!(
        *world.vcs["acme"].deleted_tags.lock().unwrap(),
        vec![("foo".to_string(), "v1.0.0".to_string())]
    );
}

#[test]
fn failed_rollback_is_reported_with_the_publish_error() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .private_registry(FakeRegistry::new(PRIVATE).failing_publish())
        .vcs(
            FakeVcs::new("acme")
                .with_repo("foo", tarball("foo", FOO_RELEASED))
                .failing_untag(),
        );
    let gate = Gatekeeper::new(handle(config(vcs_config())), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    let text = err.to_string();
    assert!(text.contains("HTTP 500: internal error"), "{text}");
    assert!(text.contains("delete tag v1.0.0"), "{text}");
    assert!(
        text.ends_with(" - NOTE: Failed to untag the repo during cleanup!"),
        "{text}"
    );
}

#[test]
fn existing_tag_is_never_removed() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .private_registry(FakeRegistry::new(PRIVATE).failing_publish())
        .vcs(
            FakeVcs::new("acme")
                .with_repo("foo", tarball("foo", FOO_RELEASED))
                .with_tag("foo", "v1.0.0"),
        );
    let gate = Gatekeeper::new(handle(config(vcs_config())), world.backends());

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(err, GateError::Publish { .. }));
    assert!(world.vcs["acme"].deleted_tags.lock().unwrap().is_empty());
}

#[test]
fn oversized_bundle_is_refused_before_downloading() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage).community(community_with_foo());
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends())
        .with_limits(ArchiveLimits {
            max_files: 2,
            ..ArchiveLimits::default()
        });

    let err = gate.process(&request(cb)).unwrap_err();
    assert!(matches!(err, GateError::BundleTooLarge(_)));
    assert_eq!(err.status(), 413);
    assert_eq!(world.storage.fetches.load(Ordering::SeqCst), 0);
}

#[test]
fn report_carries_status_and_fault() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new().with_version("foo", "1.0.0", true), storage);
    let gate = Gatekeeper::new(handle(config(serde_json::json!({}))), world.backends());

    let req = request(cb);
    let result = gate.process(&req);
    let report = serde_json::to_value(GateReport::new(&req.cookbook, &result)).unwrap();
    assert_eq!(report["schema_version"], GATE_REPORT_SCHEMA_VERSION);
    assert_eq!(report["ok"], false);
    assert_eq!(report["status"], 409);
    assert_eq!(report["fault"], "client");
}

#[test]
fn accepted_upload_is_recorded_when_commit_changes_is_set() {
    let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
    let world = World::new(FakeChef::new(), storage)
        .community(community_with_foo())
        .vcs(FakeVcs::new("acme"));
    let cfg = handle(config(serde_json::json!({
        "default": {"commit_changes": true, "git_organization": "acme"}
    })));
    let auditor = Arc::new(Auditor::new(
        Arc::clone(&cfg),
        world.backends(),
        Arc::new(LockTable::new()),
        Arc::new(TracingNotifier),
    ));
    let gate = Gatekeeper::new(cfg, world.backends()).with_auditor(auditor);

    let mut req = request(cb);
    req.forced = true;
    gate.process(&req).unwrap();

    let host = &world.vcs["acme"];
    let mut recorded = None;
    for _ in 0..200 {
        recorded = host.file("acme", "cookbooks/foo-1.0.0.json");
        if recorded.is_some() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    let doc: serde_json::Value = serde_json::from_str(&recorded.expect("record written")).unwrap();
    assert_eq!(doc["forcedupload"], true);
    assert_eq!(doc["frozen"], true);
    assert_eq!(
        doc["source"],
        "https://supermarket.example.com/api/v1/cookbooks/foo/versions/1.0.0/download"
    );
}

#[cfg(unix)]
mod lint {
    use super::*;
    use std::os::unix::fs::PermissionsExt as _;
    use std::path::{Path, PathBuf};

    fn failing_rubocop(dir: &Path) -> PathBuf {
        let path = dir.join("rubocop");
        std::fs::write(
            &path,
            "#!/bin/sh\necho \"$1/recipes/default.rb:1:1: C: 1 offense detected\"\nexit 1\n",
        )
        .unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    fn gate_with_rubocop(mode: &str, tmp: &Path, world: &World) -> Gatekeeper {
        let mut extra = vcs_config();
        extra["default"]["mode"] = serde_json::json!(mode);
        extra["default"]["publish_cookbook"] = serde_json::json!(false);
        extra["default"]["temp_dir"] = serde_json::json!(tmp.join("work"));
        extra["tests"] = serde_json::json!({"rubocop": failing_rubocop(tmp)});
        Gatekeeper::new(handle(config(extra)), world.backends())
    }

    fn world() -> (CookbookVersion, World) {
        let (cb, storage) = upload("foo", "1.0.0", true, FOO_FILES);
        let world = World::new(FakeChef::new(), storage).vcs(
            FakeVcs::new("acme")
                .with_repo("foo", tarball("foo", FOO_RELEASED))
                .with_tag("foo", "v1.0.0"),
        );
        (cb, world)
    }

    #[test]
    fn strict_mode_denies_failed_checks() {
        let tmp = tempfile::tempdir().unwrap();
        let (cb, world) = world();
        let gate = gate_with_rubocop("strict", tmp.path(), &world);

        let mut req = request(cb);
        req.forced = true;
        let err = gate.process(&req).unwrap_err();
        let GateError::LintFailed { tool, output } = &err else {
            panic!("expected a lint failure, got {err:?}");
        };
        assert_eq!(*tool, LintTool::Rubocop);
        assert_eq!(output, "recipes/default.rb:1:1: C: 1 offense detected");
        assert_eq!(gate.metrics().snapshot().checks_denied, 1);
    }

    #[test]
    fn forced_upload_bypasses_checks_in_permissive_mode() {
        let tmp = tempfile::tempdir().unwrap();
        let (cb, world) = world();
        let gate = gate_with_rubocop("permissive", tmp.path(), &world);

        let mut req = request(cb);
        req.forced = true;
        let outcome = gate.process(&req).unwrap();
        assert_eq!(outcome.bypassed_checks, vec![LintTool::Rubocop]);
        assert_eq!(gate.metrics().snapshot().checks_bypassed, 1);

        // Scratch trees are gone once the pass ends.
        let work = tmp.path().join("work");
        assert_eq!(std::fs::read_dir(&work).unwrap().count(), 0);
    }

    #[test]
    fn permissive_mode_without_force_denies() {
        let tmp = tempfile::tempdir().unwrap();
        let (cb, world) = world();
        let gate = gate_with_rubocop("permissive", tmp.path(), &world);

        let err = gate.process(&request(cb)).unwrap_err();
        assert!(matches!(err, GateError::LintFailed { .. }));
    }
}
