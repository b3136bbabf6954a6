use std::io::Read as _;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use url::Url;

pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const GLOBAL_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub ssl_no_verify: bool,
    pub connect_timeout: Duration,
    pub global_timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            ssl_no_verify: false,
            connect_timeout: CONNECT_TIMEOUT,
            global_timeout: GLOBAL_TIMEOUT,
        }
    }
}

impl TransportOptions {
    pub fn insecure(ssl_no_verify: bool) -> Self {
        Self {
            ssl_no_verify,
            ..Self::default()
        }
    }
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Returns the body when the status is one of `allowed`, else an error carrying the
    /// server's own error text.
    pub fn expect_status(self, allowed: &[u16]) -> Result<Vec<u8>> {
        if allowed.contains(&self.status) {
            return Ok(self.body);
        }
        anyhow::bail!("HTTP {}: {}", self.status, describe_error_body(&self.body))
    }
}

#[derive(Debug, Default, Deserialize)]
struct ErrorInfo {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    errors: Option<Vec<String>>,
    #[serde(default)]
    error_messages: Option<Vec<String>>,
}

/// Chef-style servers report `{"error": ..}`, `{"errors": [..]}` or `{"error_messages": [..]}`;
/// anything else is returned verbatim.
pub fn describe_error_body(body: &[u8]) -> String {
    if let Ok(info) = serde_json::from_slice::<ErrorInfo>(body) {
        if let Some(errors) = info.errors.filter(|e| !e.is_empty()) {
            return errors.join(";");
        }
        if let Some(messages) = info.error_messages.filter(|e| !e.is_empty()) {
            return messages.join(";");
        }
        if let Some(error) = info.error {
            return error;
        }
    }
    String::from_utf8_lossy(body).trim().to_string()
}

/// A blocking HTTP client with finite timeouts. Non-success statuses are returned to the caller
/// instead of being turned into transport errors.
#[derive(Debug, Clone)]
pub struct HttpClient {
    agent: ureq::Agent,
}

impl Default for HttpClient {
    fn default() -> Self {
        Self::new(&TransportOptions::default())
    }
}

impl HttpClient {
    pub fn new(opts: &TransportOptions) -> Self {
        let mut builder = ureq::Agent::config_builder()
            .http_status_as_error(false)
            .timeout_connect(Some(opts.connect_timeout))
            .timeout_global(Some(opts.global_timeout));
        if opts.ssl_no_verify {
            builder = builder.tls_config(
                ureq::tls::TlsConfig::builder()
                    .disable_verification(true)
                    .build(),
            );
        }
        Self {
            agent: builder.build().into(),
        }
    }

    pub fn get(&self, url: &Url, headers: &[(&str, String)]) -> Result<HttpResponse> {
        let req = with_headers(self.agent.get(url.as_str()), headers);
        let resp = req
            .call()
            .map_err(|e| anyhow::anyhow!("http GET {url}: {e}"))?;
        read_response("GET", url, resp)
    }

    pub fn delete(&self, url: &Url, headers: &[(&str, String)]) -> Result<HttpResponse> {
        let req = with_headers(self.agent.delete(url.as_str()), headers);
        let resp = req
            .call()
            .map_err(|e| anyhow::anyhow!("http DELETE {url}: {e}"))?;
        read_response("DELETE", url, resp)
    }

    /// Sends `body` with `method` (`POST`, `PUT`, `PATCH` or `DELETE`).
    pub fn send(
        &self,
        method: &str,
        url: &Url,
        headers: &[(&str, String)],
        body: &[u8],
    ) -> Result<HttpResponse> {
        let resp = match method {
            "POST" => with_headers(self.agent.post(url.as_str()), headers).send(body),
            "PUT" => with_headers(self.agent.put(url.as_str()), headers).send(body),
            "PATCH" => with_headers(self.agent.patch(url.as_str()), headers).send(body),
            "DELETE" => {
                with_headers(self.agent.delete(url.as_str()).force_send_body(), headers).send(body)
            }
            other => anyhow::bail!("unsupported http method {other:?} for {}", url.as_str()),
        };
        let resp = resp.map_err(|e| anyhow::anyhow!("http {method} {url}: {e}"))?;
        read_response(method, url, resp)
    }

    /// Fetches `url` and requires a 200. `file://` URLs are read from disk.
    pub fn fetch_bytes(&self, url: &Url, headers: &[(&str, String)]) -> Result<Vec<u8>> {
        match url.scheme() {
            "file" => {
                let path = url.to_file_path().map_err(|_| {
                    anyhow::anyhow!("file url could not be converted to a path: {:?}", url)
                })?;
                std::fs::read(&path).with_context(|| format!("read {}", path.display()))
            }
            "http" | "https" => self
                .get(url, headers)?
                .expect_status(&[200])
                .with_context(|| format!("GET {}", url.as_str())),
            other => anyhow::bail!("unsupported url scheme {other:?} for {}", url.as_str()),
        }
    }
}

fn with_headers<B>(
    mut req: ureq::RequestBuilder<B>,
    headers: &[(&str, String)],
) -> ureq::RequestBuilder<B> {
    for (name, value) in headers {
        req = req.header(*name, value.as_str());
    }
    req
}

fn read_response(
    method: &str,
    url: &Url,
    resp: ureq::http::Response<ureq::Body>,
) -> Result<HttpResponse> {
    let status = resp.status().as_u16();
    tracing::debug!(method, url = %url, status, "http response");
    let mut reader = resp.into_body().into_reader();
    let mut body = Vec::new();
    reader
        .read_to_end(&mut body)
        .context("read http response")?;
    Ok(HttpResponse { status, body })
}

/// RFC 3986 percent-encoding of everything but unreserved characters (and `/` unless
/// `encode_slash`).
pub fn percent_encode(s: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}

pub fn bearer(token: &str) -> (&'static str, String) {
    ("Authorization", format!("Bearer {token}"))
}
