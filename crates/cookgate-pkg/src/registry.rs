use std::collections::BTreeMap;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

use crate::digest::sha256_hex;
use crate::http::{HttpClient, TransportOptions};

/// One version of a cookbook as advertised by a registry's `/universe` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UniverseEntry {
    #[serde(default)]
    pub location_type: String,
    #[serde(default)]
    pub location_path: String,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub dependencies: BTreeMap<String, String>,
}

/// `{ name: { version: entry } }`
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Universe(pub BTreeMap<String, BTreeMap<String, UniverseEntry>>);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup<'a> {
    Found(&'a UniverseEntry),
    /// The registry knows the cookbook but not this version.
    UnknownVersion,
    NotFound,
}

impl Universe {
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).context("parse registry universe")
    }

    pub fn lookup(&self, name: &str, version: &str) -> Lookup<'_> {
        match self.0.get(name) {
            None => Lookup::NotFound,
            Some(versions) => match versions.get(version) {
                Some(entry) => Lookup::Found(entry),
                None => Lookup::UnknownVersion,
            },
        }
    }
}

/// A cookbook registry (the public community site or an organization's private one).
pub trait Registry: Send + Sync {
    /// Base URL, used to label resolved sources.
    fn base_url(&self) -> &Url;

    fn universe(&self) -> Result<Universe>;

    /// Reads the artifact descriptor at `<location_path>/cookbooks/<name>/versions/<x_y_z>` and
    /// returns its `file` URL.
    fn artifact_url(&self, location_path: &str, name: &str, version: &str) -> Result<Url>;

    fn download(&self, url: &Url) -> Result<Vec<u8>>;

    /// Publishes a `.tgz` of the cookbook under the `other` category.
    fn publish(&self, name: &str, tarball: &[u8]) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct ArtifactDescriptor {
    file: String,
}

#[derive(Debug, Clone)]
pub struct SupermarketClient {
    base: Url,
    http: HttpClient,
    token: Option<String>,
}

impl SupermarketClient {
    pub fn new(base: &str, token: Option<String>, opts: &TransportOptions) -> Result<Self> {
        let mut base = Url::parse(base).with_context(|| format!("parse registry url {base:?}"))?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            base,
            http: HttpClient::new(opts),
            token,
        })
    }

    fn auth_headers(&self) -> Vec<(&'static str, String)> {
        self.token
            .as_deref()
            .map(crate::http::bearer)
            .into_iter()
            .collect()
    }
}

impl Registry for SupermarketClient {
    fn base_url(&self) -> &Url {
        &self.base
    }

    fn universe(&self) -> Result<Universe> {
        let url = self.base.join("universe").context("build universe url")?;
        let bytes = self
            .http
            .fetch_bytes(&url, &[])
            .with_context(|| format!("get cookbook list from {url}"))?;
        Universe::from_json(&bytes).with_context(|| format!("universe from {url}"))
    }

    fn artifact_url(&self, location_path: &str, name: &str, version: &str) -> Result<Url> {
        let raw = format!(
            "{}/cookbooks/{}/versions/{}",
            location_path.trim_end_matches('/'),
            name,
            version.replace('.', "_")
        );
        let url = Url::parse(&raw).with_context(|| format!("parse cookbook url {raw:?}"))?;
        let bytes = self
            .http
            .fetch_bytes(&url, &[])
            .with_context(|| format!("get cookbook info from {url}"))?;
        let desc: ArtifactDescriptor = serde_json::from_slice(&bytes)
            .with_context(|| format!("parse cookbook info from {url}"))?;
        Url::parse(&desc.file)
            .with_context(|| format!("parse cookbook download url {:?}", desc.file))
    }

    fn download(&self, url: &Url) -> Result<Vec<u8>> {
        self.http
            .fetch_bytes(url, &[])
            .with_context(|| format!("download cookbook from {url}"))
    }

    fn publish(&self, name: &str, tarball: &[u8]) -> Result<()> {
        let url = self
            .base
            .join("api/v1/cookbooks")
            .context("build publish url")?;
        let form = MultipartForm::new(tarball)
            .file("tarball", &format!("{name}.tgz"), tarball)
            .field("cookbook", br#"{"category":"other"}"#);
        let mut headers = self.auth_headers();
        headers.push(("Content-Type", form.content_type()));
        self.http
            .send("POST", &url, &headers, &form.finish())?
            .expect_status(&[201])
            .with_context(|| format!("upload {name} to the registry"))?;
        Ok(())
    }
}

/// Minimal `multipart/form-data` body builder. The boundary is derived from the payload so the
/// body is reproducible.
struct MultipartForm {
    boundary: String,
    body: Vec<u8>,
}

impl MultipartForm {
    fn new(seed: &[u8]) -> Self {
        Self {
            boundary: format!("cookgate-{}", &sha256_hex(seed)[..32]),
            body: Vec::new(),
        }
    }

    fn file(mut self, field: &str, filename: &str, content: &[u8]) -> Self {
        self.part(
            &format!(
                "Content-Disposition: form-data; name=\"{field}\"; filename=\"{filename}\"\r\n\
                 Content-Type: application/octet-stream"
            ),
            content,
        );
        self
    }

    fn field(mut self, field: &str, content: &[u8]) -> Self {
        self.part(
            &format!("Content-Disposition: form-data; name=\"{field}\""),
            content,
        );
        self
    }

    fn part(&mut self, headers: &str, content: &[u8]) {
        self.body
            .extend_from_slice(format!("--{}\r\n{headers}\r\n\r\n", self.boundary).as_bytes());
        self.body.extend_from_slice(content);
        self.body.extend_from_slice(b"\r\n");
    }

    fn content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn finish(mut self) -> Vec<u8> {
        self.body
            .extend_from_slice(format!("--{}--\r\n", self.boundary).as_bytes());
        self.body
    }
}
