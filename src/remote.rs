use std::fmt;
use std::thread;
use std::time::Duration;

use reqwest::Url;
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{FormHeader, FormId, FormVersion, parse_form_header};
use crate::error::CatalogError;
use crate::store::Fingerprint;

#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Where the catalog lives and how to authenticate against it.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub server_url: String,
    pub list_path: String,
    pub credentials: Option<Credentials>,
}

impl ServerSettings {
    pub fn list_url(&self) -> String {
        let base = self.server_url.trim_end_matches('/');
        let path = self.list_path.trim();
        if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RemoteCatalogEntry {
    pub form_id: FormId,
    pub version: FormVersion,
    pub display_name: String,
    pub download_url: String,
    pub manifest_url: Option<String>,
    pub hash: Option<Fingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFile {
    pub filename: String,
    pub download_url: String,
    pub hash: Option<Fingerprint>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaManifest {
    pub files: Vec<MediaFile>,
}

#[derive(Debug, Clone)]
pub struct DownloadedArtifact {
    pub bytes: Vec<u8>,
    pub header: FormHeader,
    pub manifest: Option<MediaManifest>,
}

pub trait CatalogClient: Send + Sync {
    fn fetch_catalog(&self, server: &ServerSettings)
    -> Result<Vec<RemoteCatalogEntry>, CatalogError>;

    fn download_artifact(
        &self,
        entry: &RemoteCatalogEntry,
        credentials: Option<&Credentials>,
    ) -> Result<DownloadedArtifact, CatalogError>;

    fn download_media(
        &self,
        file: &MediaFile,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, CatalogError>;
}

/// Bounded exponential backoff for transient download failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
        }
    }
}

impl RetryPolicy {
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let factor = 1u32 << attempt.min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Clone)]
pub struct HttpCatalogClient {
    client: Client,
    retry: RetryPolicy,
}

impl HttpCatalogClient {
    pub fn new(request_timeout: Duration) -> Result<Self, CatalogError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("formcat/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| CatalogError::Network(err.to_string()))?,
        );
        let client = Client::builder()
            .default_headers(headers)
            .timeout(request_timeout)
            .build()
            .map_err(|err| CatalogError::Network(err.to_string()))?;
        Ok(Self {
            client,
            retry: RetryPolicy::default(),
        })
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn get(&self, url: &str, credentials: Option<&Credentials>) -> RequestBuilder {
        let request = self.client.get(url);
        match credentials {
            Some(creds) => request.basic_auth(&creds.username, Some(&creds.password)),
            None => request,
        }
    }

    fn handle_status(response: Response) -> Result<Response, CatalogError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let status = status.as_u16();
        if matches!(status, 401 | 403) {
            return Err(CatalogError::Auth { status });
        }
        let message = response
            .text()
            .unwrap_or_else(|_| "catalog request failed".to_string());
        Err(CatalogError::Status { status, message })
    }

    fn send_with_retries<F>(&self, mut make_req: F) -> Result<Response, CatalogError>
    where
        F: FnMut() -> RequestBuilder,
    {
        let mut attempt = 0usize;
        loop {
            match make_req().send() {
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    if attempt < self.retry.max_retries && is_retryable_status(status) {
                        let delay = self.retry.delay_for(attempt);
                        tracing::debug!(status, attempt, ?delay, "retrying download");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if attempt < self.retry.max_retries && is_retryable_error(&err) {
                        let delay = self.retry.delay_for(attempt);
                        tracing::debug!(error = %err, attempt, ?delay, "retrying download");
                        thread::sleep(delay);
                        attempt += 1;
                        continue;
                    }
                    return Err(CatalogError::Network(err.to_string()));
                }
            }
        }
    }

    fn fetch_bytes(
        &self,
        url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, CatalogError> {
        let response = self.send_with_retries(|| self.get(url, credentials))?;
        let response = Self::handle_status(response)?;
        let bytes = response
            .bytes()
            .map_err(|err| CatalogError::Network(err.to_string()))?;
        Ok(bytes.to_vec())
    }
}

impl CatalogClient for HttpCatalogClient {
    fn fetch_catalog(
        &self,
        server: &ServerSettings,
    ) -> Result<Vec<RemoteCatalogEntry>, CatalogError> {
        let url = server.list_url();
        tracing::info!(%url, "fetching form list");
        let response = self
            .get(&url, server.credentials.as_ref())
            .send()
            .map_err(|err| CatalogError::Network(err.to_string()))?;
        let response = Self::handle_status(response)?;
        let body = response
            .bytes()
            .map_err(|err| CatalogError::Network(err.to_string()))?;
        parse_catalog(&body, &server.server_url)
    }

    fn download_artifact(
        &self,
        entry: &RemoteCatalogEntry,
        credentials: Option<&Credentials>,
    ) -> Result<DownloadedArtifact, CatalogError> {
        let bytes = self.fetch_bytes(&entry.download_url, credentials)?;
        let header = verify_artifact(entry, &bytes)?;

        let manifest = match &entry.manifest_url {
            Some(url) => {
                let body = self.fetch_bytes(url, credentials)?;
                Some(parse_manifest(&body, url)?)
            }
            None => None,
        };

        Ok(DownloadedArtifact {
            bytes,
            header,
            manifest,
        })
    }

    fn download_media(
        &self,
        file: &MediaFile,
        credentials: Option<&Credentials>,
    ) -> Result<Vec<u8>, CatalogError> {
        let bytes = self.fetch_bytes(&file.download_url, credentials)?;
        if let Some(expected) = &file.hash {
            let actual = Fingerprint::of(&bytes);
            if &actual != expected {
                return Err(CatalogError::Parse(format!(
                    "fingerprint mismatch for media {}: expected {expected}, got {actual}",
                    file.filename
                )));
            }
        }
        Ok(bytes)
    }
}

/// Checks that downloaded bytes are the form the catalog promised.
pub fn verify_artifact(
    entry: &RemoteCatalogEntry,
    bytes: &[u8],
) -> Result<FormHeader, CatalogError> {
    let header = parse_form_header(bytes)?;
    if header.form_id != entry.form_id {
        return Err(CatalogError::Parse(format!(
            "downloaded form declares id {} but catalog listed {}",
            header.form_id, entry.form_id
        )));
    }
    if header.version != entry.version {
        return Err(CatalogError::Parse(format!(
            "downloaded form declares version {} but catalog listed {}",
            header.version, entry.version
        )));
    }
    if let Some(expected) = &entry.hash {
        let actual = Fingerprint::of(bytes);
        if &actual != expected {
            return Err(CatalogError::Parse(format!(
                "fingerprint mismatch: expected {expected}, got {actual}"
            )));
        }
    }
    Ok(header)
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum CatalogDocument {
    Wrapped { forms: Vec<RawEntry> },
    Bare(Vec<RawEntry>),
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawEntry {
    form_id: String,
    #[serde(default)]
    version: Option<Value>,
    #[serde(default, alias = "displayName")]
    name: Option<String>,
    download_url: String,
    #[serde(default)]
    manifest_url: Option<String>,
    #[serde(default)]
    hash: Option<String>,
}

/// Parses a form list document, keeping the server's order.
pub fn parse_catalog(
    body: &[u8],
    server_url: &str,
) -> Result<Vec<RemoteCatalogEntry>, CatalogError> {
    let document: CatalogDocument = serde_json::from_slice(body)
        .map_err(|err| CatalogError::Parse(format!("form list: {err}")))?;
    let raw = match document {
        CatalogDocument::Wrapped { forms } => forms,
        CatalogDocument::Bare(forms) => forms,
    };

    raw.into_iter()
        .map(|entry| {
            let form_id = entry
                .form_id
                .parse::<FormId>()
                .map_err(|err| CatalogError::Parse(format!("form list: {err}")))?;
            if entry.download_url.trim().is_empty() {
                return Err(CatalogError::Parse(format!(
                    "form list: {form_id} has no downloadUrl"
                )));
            }
            let version = FormVersion::from_json(entry.version.as_ref())?;
            let display_name = entry
                .name
                .map(|name| name.trim().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| form_id.to_string());
            let hash = match entry.hash.as_deref() {
                Some(value) => Some(Fingerprint::parse(value).ok_or_else(|| {
                    CatalogError::Parse(format!("form list: {form_id} has invalid hash {value}"))
                })?),
                None => None,
            };
            Ok(RemoteCatalogEntry {
                download_url: resolve_url(server_url, &entry.download_url)?,
                manifest_url: entry
                    .manifest_url
                    .as_deref()
                    .map(|url| resolve_url(server_url, url))
                    .transpose()?,
                form_id,
                version,
                display_name,
                hash,
            })
        })
        .collect()
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawManifest {
    media_files: Vec<RawMediaFile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMediaFile {
    filename: String,
    download_url: String,
    #[serde(default)]
    hash: Option<String>,
}

pub fn parse_manifest(body: &[u8], manifest_url: &str) -> Result<MediaManifest, CatalogError> {
    let raw: RawManifest = serde_json::from_slice(body)
        .map_err(|err| CatalogError::Parse(format!("media manifest: {err}")))?;
    let files = raw
        .media_files
        .into_iter()
        .map(|file| {
            let filename = file.filename.trim().to_string();
            if filename.is_empty()
                || filename.starts_with('.')
                || filename.contains(['/', '\\'])
            {
                return Err(CatalogError::Parse(format!(
                    "media manifest: unsafe filename {:?}",
                    file.filename
                )));
            }
            let hash = match file.hash.as_deref() {
                Some(value) => Some(Fingerprint::parse(value).ok_or_else(|| {
                    CatalogError::Parse(format!(
                        "media manifest: {filename} has invalid hash {value}"
                    ))
                })?),
                None => None,
            };
            Ok(MediaFile {
                download_url: resolve_url(manifest_url, &file.download_url)?,
                filename,
                hash,
            })
        })
        .collect::<Result<Vec<_>, CatalogError>>()?;
    Ok(MediaManifest { files })
}

fn resolve_url(base: &str, reference: &str) -> Result<String, CatalogError> {
    let reference = reference.trim();
    if let Ok(absolute) = Url::parse(reference) {
        return Ok(absolute.to_string());
    }
    let base = Url::parse(base).map_err(|_| CatalogError::InvalidServerUrl(base.to_string()))?;
    base.join(reference)
        .map(|url| url.to_string())
        .map_err(|err| CatalogError::Parse(format!("bad url {reference}: {err}")))
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}
