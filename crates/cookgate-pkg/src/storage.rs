use anyhow::{Context, Result};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use time::macros::format_description;
use time::OffsetDateTime;
use url::Url;

use crate::digest::sha256_hex;
use crate::http::{percent_encode, HttpClient, TransportOptions};

type HmacSha256 = Hmac<Sha256>;

/// Presigned bookshelf URLs are only valid for this many seconds.
pub const PRESIGN_EXPIRES_SECS: u64 = 10;

/// Where uploaded cookbook file contents live, addressed by checksum.
pub trait Storage: Send + Sync {
    fn fetch(&self, org_id: Option<&str>, checksum: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct BookshelfCredentials {
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
}

/// Chef Server's S3-compatible bookshelf, read with SigV4 presigned GETs.
#[derive(Debug, Clone)]
pub struct BookshelfStorage {
    base: Url,
    creds: BookshelfCredentials,
    http: HttpClient,
}

impl BookshelfStorage {
    pub fn new(base: Url, creds: BookshelfCredentials, opts: &TransportOptions) -> Self {
        Self {
            base,
            creds,
            http: HttpClient::new(opts),
        }
    }

    pub fn object_url(&self, org_id: &str, checksum: &str) -> Result<Url> {
        let path = format!("bookshelf/organization-{org_id}/checksum-{checksum}");
        let mut base = self.base.clone();
        base.set_path("/");
        base.join(&path)
            .with_context(|| format!("build bookshelf url for {path}"))
    }

    pub fn presign_at(&self, org_id: &str, checksum: &str, now: OffsetDateTime) -> Result<Url> {
        let url = self.object_url(org_id, checksum)?;
        presign_get(&url, &self.creds, now, PRESIGN_EXPIRES_SECS)
    }
}

impl Storage for BookshelfStorage {
    fn fetch(&self, org_id: Option<&str>, checksum: &str) -> Result<Vec<u8>> {
        let org_id = org_id.context("bookshelf storage needs an organization id")?;
        let url = self.presign_at(org_id, checksum, OffsetDateTime::now_utc())?;
        self.http.fetch_bytes(&url, &[])
    }
}

/// goiardi's file store: `<base>/file_store/<checksum>`.
#[derive(Debug, Clone)]
pub struct FileStoreStorage {
    base: Url,
    token: Option<String>,
    http: HttpClient,
}

impl FileStoreStorage {
    pub fn new(base: Url, token: Option<String>, opts: &TransportOptions) -> Self {
        Self {
            base,
            token,
            http: HttpClient::new(opts),
        }
    }
}

impl Storage for FileStoreStorage {
    fn fetch(&self, _org_id: Option<&str>, checksum: &str) -> Result<Vec<u8>> {
        let mut base = self.base.clone();
        base.set_path("/");
        let url = base
            .join(&format!("file_store/{checksum}"))
            .context("build file store url")?;
        let headers: Vec<_> = self
            .token
            .as_deref()
            .map(crate::http::bearer)
            .into_iter()
            .collect();
        self.http.fetch_bytes(&url, &headers)
    }
}

/// AWS Signature Version 4 query-string presigning of an unsigned-payload GET.
pub fn presign_get(
    url: &Url,
    creds: &BookshelfCredentials,
    now: OffsetDateTime,
    expires_secs: u64,
) -> Result<Url> {
    let host = url.host_str().context("presign url has no host")?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    let amz_date = now
        .format(format_description!(
            "[year][month][day]T[hour][minute][second]Z"
        ))
        .context("format request time")?;
    let date = &amz_date[..8];
    let scope = format!("{date}/{}/s3/aws4_request", creds.region);

    let mut query = vec![
        ("X-Amz-Algorithm", "AWS4-HMAC-SHA256".to_string()),
        (
            "X-Amz-Credential",
            format!("{}/{scope}", creds.access_key),
        ),
        ("X-Amz-Date", amz_date.clone()),
        ("X-Amz-Expires", expires_secs.to_string()),
        ("X-Amz-SignedHeaders", "host".to_string()),
    ];
    query.sort();
    let canonical_query = query
        .iter()
        .map(|(k, v)| format!("{}={}", percent_encode(k, true), percent_encode(v, true)))
        .collect::<Vec<_>>()
        .join("&");

    let canonical_request = format!(
        "GET\n{}\n{canonical_query}\nhost:{host}\n\nhost\nUNSIGNED-PAYLOAD",
        percent_encode(url.path(), false)
    );
    let string_to_sign = format!(
        "AWS4-HMAC-SHA256\n{amz_date}\n{scope}\n{}",
        sha256_hex(canonical_request.as_bytes())
    );

    let mut key = hmac_sha256(
        format!("AWS4{}", creds.secret_key).as_bytes(),
        date.as_bytes(),
    )?;
    for part in [creds.region.as_str(), "s3", "aws4_request"] {
        key = hmac_sha256(&key, part.as_bytes())?;
    }
    let signature = hex::encode(hmac_sha256(&key, string_to_sign.as_bytes())?);

    let mut out = url.clone();
    out.set_query(Some(&format!(
        "{canonical_query}&X-Amz-Signature={signature}"
    )));
    Ok(out)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|err| anyhow::anyhow!("invalid signing key: {err}"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}
