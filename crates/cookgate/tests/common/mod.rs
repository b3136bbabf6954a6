#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use cookgate::config::{Config, ConfigHandle};
use cookgate::Backends;
use cookgate_contracts::CONFIG_SCHEMA_VERSION;
use cookgate_pkg::{
    build_tar_gz, sha256_hex, ChefServer, CookbookItem, CookbookVersion, Registry, Storage,
    Universe, UniverseEntry,
};
use cookgate_vcs::{
    Committer, Content, DirEntry, FileContent, HostKind, VcsError, VcsHost, VcsResult,
};
use url::Url;

pub fn config(extra: serde_json::Value) -> Config {
    let mut doc = serde_json::json!({
        "schema_version": CONFIG_SCHEMA_VERSION,
        "default": {"mail_domain": "example.com"},
        "chef": {"kind": "open-source", "server_url": "https://chef.example.com", "user": "gate"},
        "git": {
            "acme": {"type": "github", "token": "t0k"},
            "forks": {"type": "github", "token": "t1k"}
        }
    });
    merge(&mut doc, extra);
    Config::parse(&serde_json::to_vec(&doc).unwrap(), Path::new("/etc/cookgate")).unwrap()
}

fn merge(base: &mut serde_json::Value, extra: serde_json::Value) {
    match (base, extra) {
        (serde_json::Value::Object(base), serde_json::Value::Object(extra)) => {
            for (k, v) in extra {
                let nested = v.is_object() && base.get(&k).is_some_and(|e| e.is_object());
                if nested {
                    if let Some(existing) = base.get_mut(&k) {
                        merge(existing, v);
                    }
                } else {
                    base.insert(k, v);
                }
            }
        }
        (base, extra) => *base = extra,
    }
}

pub fn handle(cfg: Config) -> Arc<ConfigHandle> {
    Arc::new(ConfigHandle::fixed(cfg))
}

// ---- package-management server ----

#[derive(Default)]
pub struct FakeChef {
    versions: Mutex<BTreeMap<(String, String), bool>>,
    pub lookups: AtomicUsize,
}

impl FakeChef {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_version(self, name: &str, version: &str, frozen: bool) -> Self {
        self.versions
            .lock()
            .unwrap()
            .insert((name.to_string(), version.to_string()), frozen);
        self
    }
}

impl ChefServer for FakeChef {
    fn cookbook_version(
        &self,
        _org: Option<&str>,
        name: &str,
        version: &str,
    ) -> anyhow::Result<Option<CookbookVersion>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let versions = self.versions.lock().unwrap();
        Ok(versions
            .get(&(name.to_string(), version.to_string()))
            .map(|frozen| CookbookVersion {
                cookbook_name: name.to_string(),
                version: version.to_string(),
                frozen: *frozen,
                ..CookbookVersion::default()
            }))
    }

    fn organization_id(&self, _org: Option<&str>) -> anyhow::Result<String> {
        Ok("5f2c0e1a".to_string())
    }
}

// ---- storage ----

#[derive(Default)]
pub struct FakeStorage {
    objects: BTreeMap<String, Vec<u8>>,
    pub fetches: AtomicUsize,
}

impl Storage for FakeStorage {
    fn fetch(&self, org_id: Option<&str>, checksum: &str) -> anyhow::Result<Vec<u8>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        anyhow::ensure!(org_id.is_some(), "bookshelf storage needs an organization id");
        self.objects
            .get(checksum)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404: no object {checksum}"))
    }
}

/// A cookbook version document plus the storage holding its files. Paths under `recipes/` are
/// recipes, everything else is a root file.
pub fn upload(
    name: &str,
    version: &str,
    frozen: bool,
    files: &[(&str, &str)],
) -> (CookbookVersion, FakeStorage) {
    let mut cb = CookbookVersion {
        cookbook_name: name.to_string(),
        name: format!("{name}-{version}"),
        version: version.to_string(),
        frozen,
        ..CookbookVersion::default()
    };
    cb.metadata.name = name.to_string();
    cb.metadata.version = version.to_string();
    let mut storage = FakeStorage::default();
    for (path, content) in files {
        let checksum = sha256_hex(content.as_bytes());
        let item = CookbookItem {
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            path: path.to_string(),
            checksum: checksum.clone(),
            specificity: "default".to_string(),
            url: None,
        };
        if path.starts_with("recipes/") {
            cb.recipes.push(item);
        } else {
            cb.root_files.push(item);
        }
        storage
            .objects
            .insert(checksum, content.as_bytes().to_vec());
    }
    (cb, storage)
}

pub fn tarball(root: &str, files: &[(&str, &str)]) -> Vec<u8> {
    let files: BTreeMap<String, Vec<u8>> = files
        .iter()
        .map(|(p, c)| (p.to_string(), c.as_bytes().to_vec()))
        .collect();
    build_tar_gz(root, &files).unwrap()
}

// ---- registry ----

pub struct FakeRegistry {
    base: Url,
    universe: Universe,
    artifacts: BTreeMap<String, Vec<u8>>,
    pub publish_fails: bool,
    pub published: Mutex<Vec<String>>,
    pub universe_calls: AtomicUsize,
}

impl FakeRegistry {
    pub fn new(base: &str) -> Self {
        Self {
            base: Url::parse(base).unwrap(),
            universe: Universe::default(),
            artifacts: BTreeMap::new(),
            publish_fails: false,
            published: Mutex::new(Vec::new()),
            universe_calls: AtomicUsize::new(0),
        }
    }

    /// Lists `name` `version` in the universe without an artifact behind it.
    pub fn list(mut self, name: &str, version: &str) -> Self {
        self.universe.0.entry(name.to_string()).or_default().insert(
            version.to_string(),
            UniverseEntry {
                location_type: "opscode".to_string(),
                location_path: self.base.as_str().trim_end_matches('/').to_string(),
                download_url: None,
                dependencies: BTreeMap::new(),
            },
        );
        self
    }

    pub fn with_artifact(self, name: &str, version: &str, tarball: Vec<u8>) -> Self {
        let mut registry = self.list(name, version);
        let url = registry.url_for(name, version);
        registry.artifacts.insert(url.to_string(), tarball);
        registry
    }

    pub fn failing_publish(mut self) -> Self {
        self.publish_fails = true;
        self
    }

    pub fn url_for(&self, name: &str, version: &str) -> Url {
        self.base
            .join(&format!("api/v1/cookbooks/{name}/versions/{version}/download"))
            .unwrap()
    }
}

impl Registry for FakeRegistry {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn universe(&self) -> anyhow::Result<Universe> {
        self.universe_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.universe.clone())
    }

    fn artifact_url(&self, _location_path: &str, name: &str, version: &str) -> anyhow::Result<Url> {
        Ok(self.url_for(name, version))
    }

    fn download(&self, url: &Url) -> anyhow::Result<Vec<u8>> {
        self.artifacts
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("HTTP 404: {url}"))
    }

    fn publish(&self, name: &str, _tarball: &[u8]) -> anyhow::Result<()> {
        if self.publish_fails {
            anyhow::bail!("upload {name} to the registry: HTTP 500: internal error");
        }
        self.published.lock().unwrap().push(name.to_string());
        Ok(())
    }
}

// ---- version control ----

pub struct FakeVcs {
    owner: String,
    repos: BTreeMap<String, Vec<u8>>,
    tags: Mutex<BTreeSet<(String, String)>>,
    files: Mutex<BTreeMap<(String, String), FileContent>>,
    next_id: AtomicUsize,
    pub delete_tag_fails: bool,
    pub tag_checks: AtomicUsize,
    pub created_tags: Mutex<Vec<(String, String, String)>>,
    pub deleted_tags: Mutex<Vec<(String, String)>>,
    pub commits: Mutex<Vec<String>>,
}

impl FakeVcs {
    pub fn new(owner: &str) -> Self {
        Self {
            owner: owner.to_string(),
            repos: BTreeMap::new(),
            tags: Mutex::new(BTreeSet::new()),
            files: Mutex::new(BTreeMap::new()),
            next_id: AtomicUsize::new(0),
            delete_tag_fails: false,
            tag_checks: AtomicUsize::new(0),
            created_tags: Mutex::new(Vec::new()),
            deleted_tags: Mutex::new(Vec::new()),
            commits: Mutex::new(Vec::new()),
        }
    }

    /// A repository whose archive (any reference) is `tarball`.
    pub fn with_repo(mut self, repo: &str, tarball: Vec<u8>) -> Self {
        self.repos.insert(repo.to_string(), tarball);
        self
    }

    pub fn with_tag(self, repo: &str, tag: &str) -> Self {
        self.tags
            .lock()
            .unwrap()
            .insert((repo.to_string(), tag.to_string()));
        self
    }

    pub fn with_file(self, repo: &str, path: &str, content: &str) -> Self {
        let sha = self.next("blob");
        self.files.lock().unwrap().insert(
            (repo.to_string(), path.to_string()),
            FileContent {
                content: content.as_bytes().to_vec(),
                sha,
            },
        );
        self
    }

    pub fn failing_untag(mut self) -> Self {
        self.delete_tag_fails = true;
        self
    }

    pub fn file(&self, repo: &str, path: &str) -> Option<String> {
        self.files
            .lock()
            .unwrap()
            .get(&(repo.to_string(), path.to_string()))
            .map(|f| String::from_utf8_lossy(&f.content).into_owned())
    }

    fn next(&self, prefix: &str) -> String {
        format!("{prefix}-{}", self.next_id.fetch_add(1, Ordering::SeqCst))
    }

    fn commit(&self, message: &str) -> String {
        self.commits.lock().unwrap().push(message.to_string());
        self.next("commit")
    }
}

impl VcsHost for FakeVcs {
    fn kind(&self) -> HostKind {
        HostKind::Github
    }

    fn owner(&self) -> &str {
        &self.owner
    }

    fn get_content(&self, repo: &str, path: &str) -> VcsResult<Content> {
        let files = self.files.lock().unwrap();
        if let Some(file) = files.get(&(repo.to_string(), path.to_string())) {
            return Ok(Content::File(file.clone()));
        }
        let prefix = format!("{path}/");
        let entries: Vec<DirEntry> = files
            .iter()
            .filter(|((r, p), _)| r == repo && p.starts_with(&prefix))
            .map(|((_, p), f)| DirEntry {
                path: p.clone(),
                sha: f.sha.clone(),
            })
            .collect();
        if entries.is_empty() {
            Ok(Content::Missing)
        } else {
            Ok(Content::Directory(entries))
        }
    }

    fn create_file(
        &self,
        repo: &str,
        path: &str,
        message: &str,
        _committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let sha = self.next("blob");
        self.files.lock().unwrap().insert(
            (repo.to_string(), path.to_string()),
            FileContent {
                content: content.to_vec(),
                sha,
            },
        );
        Ok(self.commit(message))
    }

    fn update_file(
        &self,
        repo: &str,
        path: &str,
        sha: &str,
        message: &str,
        _committer: &Committer,
        content: &[u8],
    ) -> VcsResult<String> {
        let blob = self.next("blob");
        let mut files = self.files.lock().unwrap();
        let file = files
            .get_mut(&(repo.to_string(), path.to_string()))
            .filter(|f| f.sha == sha)
            .ok_or_else(|| VcsError::Status {
                action: format!("update {path}"),
                status: 409,
                message: "sha does not match".to_string(),
            })?;
        file.content = content.to_vec();
        file.sha = blob;
        drop(files);
        Ok(self.commit(message))
    }

    fn delete_file(
        &self,
        repo: &str,
        path: &str,
        _sha: &str,
        message: &str,
        _committer: &Committer,
    ) -> VcsResult<String> {
        self.files
            .lock()
            .unwrap()
            .remove(&(repo.to_string(), path.to_string()));
        Ok(self.commit(message))
    }

    fn get_diff(&self, _repo: &str, sha: &str) -> VcsResult<String> {
        Ok(format!("diff of {sha}"))
    }

    fn archive_link(&self, repo: &str, reference: Option<&str>) -> VcsResult<Option<Url>> {
        if !self.repos.contains_key(repo) {
            return Ok(None);
        }
        let reference = reference.unwrap_or("HEAD");
        Ok(Some(
            Url::parse(&format!(
                "https://vcs.example.com/{}/{repo}/archive/{reference}.tar.gz",
                self.owner
            ))
            .unwrap(),
        ))
    }

    fn download_archive(&self, link: &Url) -> VcsResult<Vec<u8>> {
        let repo = link.path_segments().and_then(|mut s| s.nth(1)).unwrap_or_default();
        self.repos.get(repo).cloned().ok_or_else(|| VcsError::Status {
            action: format!("download {link}"),
            status: 404,
            message: "not found".to_string(),
        })
    }

    fn tag_exists(&self, repo: &str, tag: &str) -> VcsResult<bool> {
        self.tag_checks.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .tags
            .lock()
            .unwrap()
            .contains(&(repo.to_string(), tag.to_string())))
    }

    fn create_tag(&self, repo: &str, tag: &str, tagger: &Committer) -> VcsResult<()> {
        self.tags
            .lock()
            .unwrap()
            .insert((repo.to_string(), tag.to_string()));
        self.created_tags.lock().unwrap().push((
            repo.to_string(),
            tag.to_string(),
            tagger.mail.clone(),
        ));
        Ok(())
    }

    fn delete_tag(&self, repo: &str, tag: &str) -> VcsResult<()> {
        if self.delete_tag_fails {
            return Err(VcsError::Status {
                action: format!("delete tag {tag}"),
                status: 500,
                message: "internal error".to_string(),
            });
        }
        self.tags
            .lock()
            .unwrap()
            .remove(&(repo.to_string(), tag.to_string()));
        self.deleted_tags
            .lock()
            .unwrap()
            .push((repo.to_string(), tag.to_string()));
        Ok(())
    }
}

// ---- wiring ----

pub struct World {
    pub chef: Arc<FakeChef>,
    pub storage: Arc<FakeStorage>,
    pub community: Option<Arc<FakeRegistry>>,
    pub private_registry: Option<Arc<FakeRegistry>>,
    pub vcs: BTreeMap<String, Arc<FakeVcs>>,
}

impl World {
    pub fn new(chef: FakeChef, storage: FakeStorage) -> Self {
        Self {
            chef: Arc::new(chef),
            storage: Arc::new(storage),
            community: None,
            private_registry: None,
            vcs: BTreeMap::new(),
        }
    }

    pub fn community(mut self, registry: FakeRegistry) -> Self {
        self.community = Some(Arc::new(registry));
        self
    }

    pub fn private_registry(mut self, registry: FakeRegistry) -> Self {
        self.private_registry = Some(Arc::new(registry));
        self
    }

    pub fn vcs(mut self, host: FakeVcs) -> Self {
        self.vcs.insert(host.owner.clone(), Arc::new(host));
        self
    }

    pub fn backends(&self) -> Backends {
        Backends {
            chef: self.chef.clone(),
            storage: self.storage.clone(),
            community: self
                .community
                .clone()
                .map(|r| -> Arc<dyn Registry> { r }),
            private_registry: self
                .private_registry
                .clone()
                .map(|r| -> Arc<dyn Registry> { r }),
            vcs: self
                .vcs
                .iter()
                .map(|(org, host)| (org.clone(), Arc::clone(host) as Arc<dyn VcsHost>))
                .collect(),
        }
    }
}
