use cookgate_pkg::{describe_error_body, HttpClient, HttpResponse, TransportOptions};
use serde::de::DeserializeOwned;
use url::Url;

use crate::{HostKind, VcsError, VcsResult};

/// Authenticated JSON client shared by both backends.
#[derive(Debug, Clone)]
pub(crate) struct Api {
    pub(crate) kind: HostKind,
    pub(crate) owner: String,
    pub(crate) base: Url,
    http: HttpClient,
    auth: (&'static str, String),
    accept: &'static str,
}

impl Api {
    pub(crate) fn new(
        kind: HostKind,
        owner: &str,
        base: &str,
        ssl_no_verify: bool,
        auth: (&'static str, String),
        accept: &'static str,
    ) -> VcsResult<Self> {
        let trimmed = format!("{}/", base.trim_end_matches('/'));
        let base = Url::parse(&trimmed).map_err(|e| VcsError::Config {
            host: kind,
            message: format!("parse server url {base:?}: {e}"),
        })?;
        Ok(Self {
            kind,
            owner: owner.to_string(),
            base,
            http: HttpClient::new(&TransportOptions::insecure(ssl_no_verify)),
            auth,
            accept,
        })
    }

    pub(crate) fn url(&self, rel: &str) -> VcsResult<Url> {
        self.base.join(rel).map_err(|e| VcsError::Config {
            host: self.kind,
            message: format!("build url for {rel:?}: {e}"),
        })
    }

    fn headers(&self, accept: Option<&'static str>, json_body: bool) -> Vec<(&'static str, String)> {
        let mut headers = vec![
            (self.auth.0, self.auth.1.clone()),
            ("Accept", accept.unwrap_or(self.accept).to_string()),
        ];
        if json_body {
            headers.push(("Content-Type", "application/json".to_string()));
        }
        headers
    }

    /// Performs the call; `401` becomes [`VcsError::InvalidToken`], any other status is handed
    /// back for the caller to judge.
    pub(crate) fn call(
        &self,
        method: &str,
        url: &Url,
        body: Option<&serde_json::Value>,
        accept: Option<&'static str>,
        action: &str,
    ) -> VcsResult<HttpResponse> {
        let headers = self.headers(accept, body.is_some());
        let result = match (method, body) {
            ("GET", _) => self.http.get(url, &headers),
            ("DELETE", None) => self.http.delete(url, &headers),
            (_, body) => {
                let bytes = match body {
                    Some(v) => serde_json::to_vec(v).map_err(|e| VcsError::Decode {
                        action: action.to_string(),
                        message: e.to_string(),
                    })?,
                    None => Vec::new(),
                };
                self.http.send(method, url, &headers, &bytes)
            }
        };
        let resp = result.map_err(|e| VcsError::Transport {
            action: action.to_string(),
            message: format!("{e:#}"),
        })?;
        if resp.status == 401 {
            return Err(VcsError::InvalidToken {
                host: self.kind,
                owner: self.owner.clone(),
            });
        }
        Ok(resp)
    }

    pub(crate) fn expect(
        &self,
        resp: HttpResponse,
        allowed: &[u16],
        action: &str,
    ) -> VcsResult<Vec<u8>> {
        if allowed.contains(&resp.status) {
            return Ok(resp.body);
        }
        Err(VcsError::Status {
            action: action.to_string(),
            status: resp.status,
            message: describe_error_body(&resp.body),
        })
    }

    pub(crate) fn json<T: DeserializeOwned>(&self, body: &[u8], action: &str) -> VcsResult<T> {
        serde_json::from_slice(body).map_err(|e| VcsError::Decode {
            action: action.to_string(),
            message: e.to_string(),
        })
    }

    /// GET that maps `404` to `None`.
    pub(crate) fn get_optional<T: DeserializeOwned>(
        &self,
        url: &Url,
        action: &str,
    ) -> VcsResult<Option<T>> {
        let resp = self.call("GET", url, None, None, action)?;
        if resp.status == 404 {
            return Ok(None);
        }
        let body = self.expect(resp, &[200], action)?;
        self.json(&body, action).map(Some)
    }

    pub(crate) fn download(&self, link: &Url) -> VcsResult<Vec<u8>> {
        let action = format!("download {link}");
        let resp = self.call("GET", link, None, Some("*/*"), &action)?;
        self.expect(resp, &[200], &action)
    }
}
