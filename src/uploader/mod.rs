//! Microsoft Graph client used to push PDFs into the SharePoint document
//! store.
//!
//! Authentication is a client-credentials grant with a cached bearer token
//! (renewed 60 s before expiry, re-fetched once on 401). Uploads land under
//! a temporary name and are renamed into place so a crashed transfer never
//! leaves a half-written artifact at the final path.

use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::Config;

const GRAPH_BASE: &str = "https://graph.microsoft.com/v1.0";
/// Streamed transfer chunk size.
const UPLOAD_CHUNK_SIZE: usize = 4 * 1024 * 1024;
/// Per-chunk network timeout.
const CHUNK_TIMEOUT_SECS: u64 = 60;
/// Attempts per request on transient failures.
const MAX_ATTEMPTS: u32 = 3;
/// Renew the token this long before it actually expires.
const TOKEN_EXPIRY_SKEW: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("forbidden")]
    Forbidden,
    #[error("payload too large")]
    TooLarge,
    #[error("unsupported media type")]
    UnsupportedMedia,
    #[error("HTTP {0}")]
    Http(u16),
    #[error("network error: {0}")]
    Network(String),
    #[error("upload cancelled")]
    Cancelled,
    #[error("malformed Graph response: {0}")]
    Malformed(String),
}

impl UploadError {
    /// Terminal failures are recorded on the artifact and never retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UploadError::Auth(_)
                | UploadError::Forbidden
                | UploadError::TooLarge
                | UploadError::UnsupportedMedia
        )
    }
}

#[derive(Clone, Debug)]
struct CachedToken {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Deserialize)]
struct OAuthTokenResponse {
    expires_in: i64,
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SiteResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct DriveItemList {
    value: Vec<DriveItem>,
}

#[derive(Debug, Deserialize)]
struct DriveItem {
    id: String,
    name: String,
    #[serde(default)]
    size: Option<i64>,
    #[serde(default)]
    file: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct UploadSessionResponse {
    #[serde(rename = "uploadUrl")]
    upload_url: String,
}

pub struct SharePointUploader {
    http: Client,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    site_host: String,
    site_path: String,
    site_id: RwLock<Option<String>>,
    drive_id: RwLock<Option<String>>,
    // Held across the refresh so only one fetch is ever in flight.
    token: Mutex<Option<CachedToken>>,
}

impl SharePointUploader {
    pub fn new(config: &Config) -> Self {
        let http = Client::builder()
            .timeout(Duration::from_secs(CHUNK_TIMEOUT_SECS))
            .build()
            .expect("Failed to build Graph HTTP client");

        SharePointUploader {
            http,
            tenant_id: config.identity_tenant.clone(),
            client_id: config.identity_client_id.clone(),
            client_secret: config.identity_client_secret.clone(),
            site_host: config.sharepoint_host.clone(),
            site_path: config.sharepoint_site_path.clone(),
            site_id: RwLock::new(None),
            drive_id: RwLock::new(None),
            token: Mutex::new(None),
        }
    }

    /// List `(filename, size)` of everything already in the destination
    /// folder. A missing folder is created and reported as empty.
    pub async fn existing_artifacts(
        &self,
        folder: &str,
    ) -> Result<HashMap<String, i64>, UploadError> {
        let drive_id = self.ensure_site_and_drive().await?;
        let path = encode_path(folder);
        let url = format!(
            "{GRAPH_BASE}/drives/{drive_id}/root:/{path}:/children?$select=id,name,size,file"
        );

        let resp = self
            .send_with_retry(|| self.request(Method::GET, &url), None)
            .await?;
        if resp.status() == StatusCode::NOT_FOUND {
            self.ensure_folder(folder).await?;
            return Ok(HashMap::new());
        }
        let resp = check_status(resp)?;

        let body: DriveItemList = resp
            .json()
            .await
            .map_err(|e| UploadError::Malformed(e.to_string()))?;
        Ok(body
            .value
            .into_iter()
            .filter(|item| item.file.is_some())
            .filter_map(|item| item.size.map(|s| (item.name, s)))
            .collect())
    }

    /// Create the folder hierarchy if any segment is missing.
    pub async fn ensure_folder(&self, folder: &str) -> Result<(), UploadError> {
        let drive_id = self.ensure_site_and_drive().await?;
        let mut current = String::new();
        for segment in folder.split('/').filter(|s| !s.is_empty()) {
            if !current.is_empty() {
                current.push('/');
            }
            current.push_str(segment);

            let check_url = format!(
                "{GRAPH_BASE}/drives/{drive_id}/root:/{}",
                encode_path(&current)
            );
            let resp = self
                .send_with_retry(|| self.request(Method::GET, &check_url), None)
                .await?;
            if resp.status() != StatusCode::NOT_FOUND {
                check_status(resp)?;
                continue;
            }

            let parent = current
                .rsplit_once('/')
                .map(|(head, _)| head.to_string())
                .unwrap_or_default();
            let create_url = if parent.is_empty() {
                format!("{GRAPH_BASE}/drives/{drive_id}/root/children")
            } else {
                format!(
                    "{GRAPH_BASE}/drives/{drive_id}/root:/{}:/children",
                    encode_path(&parent)
                )
            };
            let body = serde_json::json!({
                "name": segment,
                "folder": {},
                "@microsoft.graph.conflictBehavior": "fail"
            });
            let resp = self
                .send_with_retry(|| self.request(Method::POST, &create_url).json(&body), None)
                .await?;
            // Someone else created it between the check and the POST.
            if resp.status() == StatusCode::CONFLICT {
                continue;
            }
            check_status(resp)?;
        }
        Ok(())
    }

    /// Upload one artifact as `<folder>/<filename>`. The transfer goes to a
    /// temporary name first and is renamed into place on success.
    pub async fn upload(
        &self,
        folder: &str,
        filename: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<(), UploadError> {
        let drive_id = self.ensure_site_and_drive().await?;
        let temp_name = format!("{filename}.uploading");
        let temp_path = encode_path(&join_path(folder, &temp_name));

        let item_id = if bytes.len() <= UPLOAD_CHUNK_SIZE {
            self.put_small(&drive_id, &temp_path, bytes, cancel).await?
        } else {
            self.put_chunked(&drive_id, &temp_path, bytes, cancel).await?
        };

        // Rename into place; replace wins so a retried rename is idempotent.
        let rename_url = format!("{GRAPH_BASE}/drives/{drive_id}/items/{item_id}");
        let body = serde_json::json!({
            "name": filename,
            "@microsoft.graph.conflictBehavior": "replace"
        });
        let resp = self
            .send_with_retry(|| self.request(Method::PATCH, &rename_url).json(&body), None)
            .await?;
        check_status(resp)?;
        Ok(())
    }

    async fn put_small(
        &self,
        drive_id: &str,
        encoded_path: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        if cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        let url = format!(
            "{GRAPH_BASE}/drives/{drive_id}/root:/{encoded_path}:/content\
             ?@microsoft.graph.conflictBehavior=replace"
        );
        let payload = bytes.to_vec();
        let resp = self
            .send_with_retry(
                || {
                    self.request(Method::PUT, &url)
                        .header("Content-Type", "application/pdf")
                        .body(payload.clone())
                },
                Some(cancel),
            )
            .await?;
        let resp = check_status(resp)?;
        let item: DriveItem = resp
            .json()
            .await
            .map_err(|e| UploadError::Malformed(e.to_string()))?;
        Ok(item.id)
    }

    async fn put_chunked(
        &self,
        drive_id: &str,
        encoded_path: &str,
        bytes: &[u8],
        cancel: &CancellationToken,
    ) -> Result<String, UploadError> {
        let session_url = format!(
            "{GRAPH_BASE}/drives/{drive_id}/root:/{encoded_path}:/createUploadSession"
        );
        let body = serde_json::json!({
            "item": { "@microsoft.graph.conflictBehavior": "replace" }
        });
        let resp = self
            .send_with_retry(|| self.request(Method::POST, &session_url).json(&body), None)
            .await?;
        let resp = check_status(resp)?;
        let session: UploadSessionResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Malformed(e.to_string()))?;

        let total = bytes.len();
        let mut item_id = None;
        for (index, chunk) in bytes.chunks(UPLOAD_CHUNK_SIZE).enumerate() {
            if cancel.is_cancelled() {
                return Err(UploadError::Cancelled);
            }
            let start = index * UPLOAD_CHUNK_SIZE;
            let end = start + chunk.len() - 1;
            let range = format!("bytes {start}-{end}/{total}");
            let payload = chunk.to_vec();

            // The session URL is pre-authorized; no bearer header.
            let resp = self
                .send_with_retry(
                    || {
                        self.http
                            .put(&session.upload_url)
                            .header("Content-Length", payload.len())
                            .header("Content-Range", range.clone())
                            .timeout(Duration::from_secs(CHUNK_TIMEOUT_SECS))
                            .body(payload.clone())
                    },
                    Some(cancel),
                )
                .await?;
            let resp = check_status(resp)?;

            if end + 1 == total {
                let item: DriveItem = resp
                    .json()
                    .await
                    .map_err(|e| UploadError::Malformed(e.to_string()))?;
                item_id = Some(item.id);
            }
        }
        item_id.ok_or_else(|| UploadError::Malformed("upload session returned no item".into()))
    }

    // --- Plumbing ---

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.http.request(method, url)
    }

    /// Send with bearer auth, renewing the token once on 401, retrying
    /// transient failures with 1 s / 2 s / 4 s backoff and honoring
    /// `Retry-After` on 429.
    async fn send_with_retry<F>(
        &self,
        build: F,
        cancel: Option<&CancellationToken>,
    ) -> Result<Response, UploadError>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut reauthed = false;
        let mut attempt: u32 = 0;
        loop {
            if let Some(token) = cancel {
                if token.is_cancelled() {
                    return Err(UploadError::Cancelled);
                }
            }

            let bearer = self.access_token().await?;
            let result = build().bearer_auth(&bearer).send().await;

            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED && !reauthed {
                        reauthed = true;
                        self.invalidate_token().await;
                        continue;
                    }
                    if is_transient(status) && attempt + 1 < MAX_ATTEMPTS {
                        let delay = retry_after(&resp).unwrap_or_else(|| backoff(attempt));
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    if attempt + 1 < MAX_ATTEMPTS {
                        let delay = backoff(attempt);
                        attempt += 1;
                        tokio::time::sleep(delay).await;
                        continue;
                    }
                    return Err(UploadError::Network(e.to_string()));
                }
            }
        }
    }

    async fn access_token(&self) -> Result<String, UploadError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > Instant::now() + TOKEN_EXPIRY_SKEW {
                return Ok(cached.token.clone());
            }
        }

        let url = format!(
            "https://login.microsoftonline.com/{}/oauth2/v2.0/token",
            self.tenant_id
        );
        let params = [
            ("client_id", self.client_id.as_str()),
            ("client_secret", self.client_secret.as_str()),
            ("scope", "https://graph.microsoft.com/.default"),
            ("grant_type", "client_credentials"),
        ];
        let resp = self
            .http
            .post(url)
            .form(&params)
            .send()
            .await
            .map_err(|e| UploadError::Network(e.to_string()))?;
        if !resp.status().is_success() {
            return Err(UploadError::Auth(format!(
                "token endpoint returned {}",
                resp.status()
            )));
        }
        let token: OAuthTokenResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Auth(e.to_string()))?;

        let cached = CachedToken {
            token: token.access_token.clone(),
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.max(0) as u64),
        };
        *guard = Some(cached);
        Ok(token.access_token)
    }

    async fn invalidate_token(&self) {
        let mut guard = self.token.lock().await;
        *guard = None;
    }

    async fn ensure_site_and_drive(&self) -> Result<String, UploadError> {
        if let Some(drive_id) = self.drive_id.read().await.clone() {
            return Ok(drive_id);
        }

        let cached_site = self.site_id.read().await.clone();
        let site_id = match cached_site {
            Some(id) => id,
            None => {
                let url = format!("{GRAPH_BASE}/sites/{}:{}", self.site_host, self.site_path);
                let resp = self
                    .send_with_retry(|| self.request(Method::GET, &url), None)
                    .await?;
                let resp = check_status(resp)?;
                let site: SiteResponse = resp
                    .json()
                    .await
                    .map_err(|e| UploadError::Malformed(e.to_string()))?;
                *self.site_id.write().await = Some(site.id.clone());
                site.id
            }
        };

        let url = format!("{GRAPH_BASE}/sites/{site_id}/drive");
        let resp = self
            .send_with_retry(|| self.request(Method::GET, &url), None)
            .await?;
        let resp = check_status(resp)?;
        let drive: DriveResponse = resp
            .json()
            .await
            .map_err(|e| UploadError::Malformed(e.to_string()))?;
        *self.drive_id.write().await = Some(drive.id.clone());
        Ok(drive.id)
    }
}

/// Decide what to do with `filename` given what already exists at the
/// destination: skip it as a duplicate, or upload under a (possibly
/// suffix-disambiguated) name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameDecision {
    /// An artifact with the same name and size already exists.
    Skip,
    /// Upload under this name.
    Upload(String),
}

pub fn pick_destination_name(
    existing: &HashMap<String, i64>,
    filename: &str,
    size: i64,
) -> NameDecision {
    match existing.get(filename) {
        None => return NameDecision::Upload(filename.to_string()),
        Some(&s) if s == size => return NameDecision::Skip,
        Some(_) => {}
    }
    for n in 2.. {
        let candidate = suffixed_name(filename, n);
        match existing.get(&candidate) {
            None => return NameDecision::Upload(candidate),
            Some(&s) if s == size => return NameDecision::Skip,
            Some(_) => {}
        }
    }
    unreachable!()
}

fn suffixed_name(filename: &str, n: u32) -> String {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} (_{n}).{ext}"),
        _ => format!("{filename} (_{n})"),
    }
}

fn join_path(folder: &str, name: &str) -> String {
    let folder = folder.trim_matches('/');
    if folder.is_empty() {
        name.to_string()
    } else {
        format!("{folder}/{name}")
    }
}

fn encode_path(path: &str) -> String {
    path.trim_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn is_transient(status: StatusCode) -> bool {
    status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
}

fn retry_after(resp: &Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_secs(1 << attempt.min(4))
}

fn check_status(resp: Response) -> Result<Response, UploadError> {
    match resp.status() {
        s if s.is_success() => Ok(resp),
        StatusCode::UNAUTHORIZED => Err(UploadError::Auth("401 after re-auth".to_string())),
        StatusCode::FORBIDDEN => Err(UploadError::Forbidden),
        StatusCode::PAYLOAD_TOO_LARGE => Err(UploadError::TooLarge),
        StatusCode::UNSUPPORTED_MEDIA_TYPE => Err(UploadError::UnsupportedMedia),
        s => Err(UploadError::Http(s.as_u16())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_key_skips() {
        let mut existing = HashMap::new();
        existing.insert("pump.pdf".to_string(), 1024);
        assert_eq!(
            pick_destination_name(&existing, "pump.pdf", 1024),
            NameDecision::Skip
        );
    }

    #[test]
    fn test_new_name_uploads_as_is() {
        let existing = HashMap::new();
        assert_eq!(
            pick_destination_name(&existing, "pump.pdf", 1024),
            NameDecision::Upload("pump.pdf".to_string())
        );
    }

    #[test]
    fn test_collision_gets_numeric_suffix() {
        let mut existing = HashMap::new();
        existing.insert("pump.pdf".to_string(), 1024);
        assert_eq!(
            pick_destination_name(&existing, "pump.pdf", 2048),
            NameDecision::Upload("pump (_2).pdf".to_string())
        );

        existing.insert("pump (_2).pdf".to_string(), 4096);
        assert_eq!(
            pick_destination_name(&existing, "pump.pdf", 2048),
            NameDecision::Upload("pump (_3).pdf".to_string())
        );
    }

    #[test]
    fn test_collision_chain_can_still_dedup() {
        let mut existing = HashMap::new();
        existing.insert("pump.pdf".to_string(), 1024);
        existing.insert("pump (_2).pdf".to_string(), 2048);
        // The size matches the suffixed copy, so it's the same artifact.
        assert_eq!(
            pick_destination_name(&existing, "pump.pdf", 2048),
            NameDecision::Skip
        );
    }

    #[test]
    fn test_suffixed_name_without_extension() {
        assert_eq!(suffixed_name("README", 2), "README (_2)");
        assert_eq!(suffixed_name("a.b.pdf", 2), "a.b (_2).pdf");
    }

    #[test]
    fn test_terminal_classification() {
        assert!(UploadError::Forbidden.is_terminal());
        assert!(UploadError::TooLarge.is_terminal());
        assert!(UploadError::UnsupportedMedia.is_terminal());
        assert!(UploadError::Auth("x".into()).is_terminal());
        assert!(!UploadError::Http(500).is_terminal());
        assert!(!UploadError::Network("reset".into()).is_terminal());
        assert!(!UploadError::Cancelled.is_terminal());
    }

    #[test]
    fn test_encode_path() {
        assert_eq!(encode_path("/Docs/Acme Pumps/"), "Docs/Acme%20Pumps");
        assert_eq!(encode_path("Docs"), "Docs");
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(backoff(0), Duration::from_secs(1));
        assert_eq!(backoff(1), Duration::from_secs(2));
        assert_eq!(backoff(2), Duration::from_secs(4));
    }
}
