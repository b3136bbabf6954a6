use std::collections::BTreeMap;

use anyhow::{Context, Result};
use cookgate_contracts::PLACEHOLDER_CHECKSUM;
use regex::Regex;
use serde::Deserialize;
use url::Url;

use crate::cookbook::CookbookVersion;
use crate::http::{HttpClient, TransportOptions};

/// The package-management server, as far as the upload gate needs it.
pub trait ChefServer: Send + Sync {
    /// `None` when the server has no such cookbook version.
    fn cookbook_version(
        &self,
        org: Option<&str>,
        name: &str,
        version: &str,
    ) -> Result<Option<CookbookVersion>>;

    /// The storage-level organization id, used to address file contents.
    fn organization_id(&self, org: Option<&str>) -> Result<String>;
}

#[derive(Debug, Deserialize)]
struct Sandbox {
    #[serde(default)]
    checksums: BTreeMap<String, Option<SandboxItem>>,
}

#[derive(Debug, Deserialize)]
struct SandboxItem {
    #[serde(default)]
    url: String,
}

/// Extracts the organization id from a sandbox creation reply. The placeholder checksum's upload
/// URL looks like `https://host/bookshelf/organization-<id>/checksum-<sum>?...`.
pub fn organization_id_from_sandbox(body: &[u8]) -> Result<String> {
    let sandbox: Sandbox = serde_json::from_slice(body).context("parse sandbox reply")?;
    let url = sandbox
        .checksums
        .get(PLACEHOLDER_CHECKSUM)
        .and_then(|item| item.as_ref())
        .map(|item| item.url.as_str())
        .unwrap_or_default();
    let re = Regex::new(r"^.*/organization-(.*)/checksum-.*$").context("compile sandbox regex")?;
    match re.captures(url).and_then(|c| c.get(1)) {
        Some(id) if !id.as_str().is_empty() => Ok(id.as_str().to_string()),
        _ => anyhow::bail!(
            "could not find an organization id in reply: {}",
            String::from_utf8_lossy(body)
        ),
    }
}

/// Client for servers that accept the calls below without request signing (goiardi with auth
/// disabled, or a server fronted by a signing sidecar).
#[derive(Debug, Clone)]
pub struct HttpChefServer {
    base: Url,
    user: String,
    http: HttpClient,
}

impl HttpChefServer {
    pub fn new(base: &str, user: &str, opts: &TransportOptions) -> Result<Self> {
        let base = Url::parse(base).with_context(|| format!("parse chef server url {base:?}"))?;
        Ok(Self {
            base,
            user: user.to_string(),
            http: HttpClient::new(opts),
        })
    }

    fn endpoint(&self, org: Option<&str>, rel: &str) -> Result<Url> {
        let path = match org {
            Some(org) if !org.is_empty() => format!("/organizations/{org}/{rel}"),
            _ => format!("/{rel}"),
        };
        let mut url = self.base.clone();
        url.set_path(&path);
        Ok(url)
    }

    fn headers(&self) -> Vec<(&'static str, String)> {
        vec![
            ("Accept", "application/json".to_string()),
            ("X-Ops-Userid", self.user.clone()),
        ]
    }
}

impl ChefServer for HttpChefServer {
    fn cookbook_version(
        &self,
        org: Option<&str>,
        name: &str,
        version: &str,
    ) -> Result<Option<CookbookVersion>> {
        let url = self.endpoint(org, &format!("cookbooks/{name}/{version}"))?;
        let resp = self.http.get(&url, &self.headers())?;
        if resp.status == 404 {
            return Ok(None);
        }
        let body = resp
            .expect_status(&[200])
            .with_context(|| format!("get info for cookbook {name} version {version}"))?;
        let cb = CookbookVersion::from_json(&body)
            .with_context(|| format!("get info for cookbook {name} version {version}"))?;
        Ok(Some(cb))
    }

    fn organization_id(&self, org: Option<&str>) -> Result<String> {
        let url = self.endpoint(org, "sandboxes")?;
        let body = format!(r#"{{"checksums":{{"{PLACEHOLDER_CHECKSUM}":null}}}}"#);
        let mut headers = self.headers();
        headers.push(("Content-Type", "application/json".to_string()));
        let reply = self
            .http
            .send("POST", &url, &headers, body.as_bytes())?
            .expect_status(&[200, 201])
            .context("create sandbox")?;
        organization_id_from_sandbox(&reply)
    }
}
