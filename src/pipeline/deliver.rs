//! Delivery of the kept pages to the document API.
//!
//! One job produces one request:
//!
//! ```text
//! POST {url}/{workspace}/api/document/{docId?}
//! Authorization: Bearer <token>            (omitted when token is empty)
//! multipart: files=<page>... | files=pages.zip, meta, documentType, properties
//! ```
//!
//! With `upload.compression = zip` and more than one page, the pages are
//! bundled into `pages.zip` inside the job directory, sent as the only part,
//! and the archive is deleted again whatever the outcome.
//!
//! When a job fails, [`DocumentSink::report_failure`] posts a short JSON
//! record to `{url}/{workspace}/api/log` on a detached task. That call has its
//! own timeout and its result is only logged; it can never change the job's
//! outcome.

use crate::config::{ApiSettings, CompressionMode, ImageFormat, UploadSettings};
use crate::error::{DeliveryError, ScanError};
use crate::job::{PageImage, UploadResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::multipart::{Form, Part};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Archive file name used for bundled uploads.
pub const ARCHIVE_NAME: &str = "pages.zip";

const MAX_ERROR_BODY: usize = 512;

/// Per-job fields sent alongside the pages.
#[derive(Debug, Clone, Default)]
pub struct DeliveryMetadata {
    /// Append to this document instead of creating a new one.
    pub doc_id: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub document_type: Option<String>,
    pub properties: Option<serde_json::Value>,
    pub format: ImageFormat,
    /// Where a temporary archive may be written.
    pub work_dir: PathBuf,
}

/// Context for a failure report.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub kind: String,
    pub message: String,
    pub source: Option<String>,
    pub device: String,
    pub timestamp: DateTime<Utc>,
}

/// Successful answer from [`HttpDeliveryAgent::check_connection`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionCheck {
    pub url: String,
    pub status: u16,
}

/// Destination for a job's kept pages.
#[async_trait]
pub trait DocumentSink: Send + Sync {
    /// Send `pages` (non-empty, in delivery order) as one document.
    async fn deliver(
        &self,
        pages: &[PageImage],
        metadata: &DeliveryMetadata,
    ) -> Result<UploadResult, DeliveryError>;

    /// Best-effort, non-blocking diagnostic report. Must not fail or block.
    fn report_failure(&self, report: FailureReport);
}

/// [`DocumentSink`] that talks to the document API over HTTP.
#[derive(Clone)]
pub struct HttpDeliveryAgent {
    client: reqwest::Client,
    base_url: String,
    workspace: String,
    token: String,
    timeout_secs: u64,
    telemetry_timeout: Duration,
    compression: CompressionMode,
    zip_level: u8,
}

impl HttpDeliveryAgent {
    pub fn new(api: &ApiSettings, upload: &UploadSettings) -> Result<Self, ScanError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(api.timeout_secs))
            .build()
            .map_err(|e| ScanError::InvalidConfig(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: api.url.trim_end_matches('/').to_string(),
            workspace: api.workspace.clone(),
            token: api.token.clone(),
            timeout_secs: api.timeout_secs,
            telemetry_timeout: Duration::from_secs(api.telemetry_timeout_secs),
            compression: upload.compression,
            zip_level: upload.zip_compression_level,
        })
    }

    /// Upload endpoint, with the document id appended when given.
    pub fn document_url(&self, doc_id: Option<&str>) -> String {
        format!(
            "{}/{}/api/document/{}",
            self.base_url,
            self.workspace,
            doc_id.unwrap_or("")
        )
    }

    pub fn log_url(&self) -> String {
        format!("{}/{}/api/log", self.base_url, self.workspace)
    }

    /// Workspace API root, used by [`Self::check_connection`].
    pub fn api_root_url(&self) -> String {
        format!("{}/{}/api/", self.base_url, self.workspace)
    }

    /// Ask the API root for a response with the configured credentials.
    ///
    /// `200` and `404` both mean the server answered for this workspace; many
    /// deployments have no handler on the bare root.
    pub async fn check_connection(&self) -> Result<ConnectionCheck, DeliveryError> {
        let url = self.api_root_url();
        debug!("Checking API connection at {}", url);

        let mut request = self.client.get(&url);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout_secs))?;
        let status = response.status();

        match status {
            reqwest::StatusCode::OK | reqwest::StatusCode::NOT_FOUND => Ok(ConnectionCheck {
                url,
                status: status.as_u16(),
            }),
            reqwest::StatusCode::UNAUTHORIZED | reqwest::StatusCode::FORBIDDEN => {
                let body = response.text().await.unwrap_or_default();
                Err(DeliveryError::AuthRejected {
                    status: status.as_u16(),
                    detail: truncate(&body, MAX_ERROR_BODY),
                })
            }
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(DeliveryError::ServerError {
                    status: status.as_u16(),
                    body: truncate(&body, MAX_ERROR_BODY),
                })
            }
        }
    }

    async fn build_form(
        &self,
        pages: &[PageImage],
        metadata: &DeliveryMetadata,
        archive: Option<&Path>,
    ) -> Result<Form, DeliveryError> {
        let mut form = Form::new();

        match archive {
            Some(path) => {
                let bytes = read_part(path).await?;
                form = form.part("files", file_part(bytes, ARCHIVE_NAME, "application/zip")?);
            }
            None => {
                for page in pages {
                    let bytes = read_part(&page.path).await?;
                    let name = page
                        .path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| {
                            format!("page_{:03}.{}", page.index, metadata.format.extension())
                        });
                    form = form.part("files", file_part(bytes, &name, metadata.format.mime_type())?);
                }
            }
        }

        if let Some(ref meta) = metadata.meta {
            form = form.text("meta", meta.to_string());
        }
        if let Some(ref document_type) = metadata.document_type {
            form = form.text("documentType", document_type.clone());
        }
        if let Some(ref properties) = metadata.properties {
            form = form.text("properties", properties.to_string());
        }
        Ok(form)
    }

    async fn send(
        &self,
        pages: &[PageImage],
        metadata: &DeliveryMetadata,
        archive: Option<&Path>,
    ) -> Result<UploadResult, DeliveryError> {
        let form = self.build_form(pages, metadata, archive).await?;
        let url = self.document_url(metadata.doc_id.as_deref());
        info!("Uploading {} pages to {}", pages.len(), url);

        let mut request = self.client.post(&url).multipart(form);
        if !self.token.is_empty() {
            request = request.bearer_auth(&self.token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| map_transport(e, self.timeout_secs))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| map_transport(e, self.timeout_secs))?;

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(DeliveryError::AuthRejected {
                status: status.as_u16(),
                detail: truncate(&body, MAX_ERROR_BODY),
            });
        }
        if !status.is_success() {
            return Err(DeliveryError::ServerError {
                status: status.as_u16(),
                body: truncate(&body, MAX_ERROR_BODY),
            });
        }

        Ok(parse_response(
            status.as_u16(),
            &body,
            metadata.doc_id.as_deref(),
            pages.len(),
        ))
    }
}

#[async_trait]
impl DocumentSink for HttpDeliveryAgent {
    async fn deliver(
        &self,
        pages: &[PageImage],
        metadata: &DeliveryMetadata,
    ) -> Result<UploadResult, DeliveryError> {
        if pages.is_empty() {
            return Err(DeliveryError::Payload {
                detail: "refusing to upload an empty page set".into(),
            });
        }

        if self.compression == CompressionMode::Zip && pages.len() > 1 {
            let archive = ArchiveFile(metadata.work_dir.join(ARCHIVE_NAME));
            let paths: Vec<PathBuf> = pages.iter().map(|p| p.path.clone()).collect();
            let target = archive.0.clone();
            let level = self.zip_level;
            tokio::task::spawn_blocking(move || build_archive(&paths, &target, level))
                .await
                .map_err(|e| DeliveryError::Payload {
                    detail: format!("archive task failed: {}", e),
                })??;
            // `archive` is dropped (and the file removed) after the request
            // completes, on every path.
            return self.send(pages, metadata, Some(&archive.0)).await;
        }

        self.send(pages, metadata, None).await
    }

    fn report_failure(&self, report: FailureReport) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!("No runtime available; failure report dropped");
            return;
        };

        let request = self
            .client
            .post(self.log_url())
            .timeout(self.telemetry_timeout)
            .json(&TelemetryBody::from(&report));
        let request = if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        };

        handle.spawn(async move {
            match request.send().await {
                Ok(resp) => debug!("Failure report sent: HTTP {}", resp.status()),
                Err(e) => debug!("Failure report not delivered: {}", e),
            }
        });
    }
}

// ── Wire types ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryBody {
    level: &'static str,
    message: String,
    source: &'static str,
    client_timestamp: String,
    details: TelemetryDetails,
}

#[derive(Debug, Serialize)]
struct TelemetryDetails {
    kind: String,
    source: Option<String>,
    device: String,
}

impl From<&FailureReport> for TelemetryBody {
    fn from(r: &FailureReport) -> Self {
        Self {
            level: "error",
            message: r.message.clone(),
            source: "scanner",
            client_timestamp: r.timestamp.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            details: TelemetryDetails {
                kind: r.kind.clone(),
                source: r.source.clone(),
                device: r.device.clone(),
            },
        }
    }
}

/// Interpret a 2xx body. Non-JSON bodies fall back to the request values.
pub fn parse_response(
    status: u16,
    body: &str,
    requested_doc_id: Option<&str>,
    pages_sent: usize,
) -> UploadResult {
    let fallback = || UploadResult {
        status: Some(status),
        doc_id: requested_doc_id.map(str::to_string),
        pages_added: pages_sent,
        total_pages: None,
        error: None,
    };

    let Ok(json) = serde_json::from_str::<serde_json::Value>(body) else {
        debug!("Non-JSON upload response; assuming {} pages added", pages_sent);
        return fallback();
    };
    if !json.is_object() {
        return fallback();
    }

    let doc_id = match json.get("docId") {
        Some(serde_json::Value::String(s)) => Some(s.clone()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => requested_doc_id.map(str::to_string),
    };
    let as_count = |key: &str| json.get(key).and_then(|v| v.as_u64()).map(|n| n as usize);

    UploadResult {
        status: Some(status),
        doc_id,
        pages_added: as_count("pagesAdded").unwrap_or(pages_sent),
        total_pages: as_count("totalPages"),
        error: None,
    }
}

fn map_transport(e: reqwest::Error, timeout_secs: u64) -> DeliveryError {
    if e.is_timeout() {
        DeliveryError::Timeout { secs: timeout_secs }
    } else {
        DeliveryError::NetworkUnreachable {
            detail: e.to_string(),
        }
    }
}

fn truncate(body: &str, max: usize) -> String {
    if body.len() <= max {
        return body.to_string();
    }
    let mut end = max;
    while !body.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &body[..end])
}

async fn read_part(path: &Path) -> Result<Vec<u8>, DeliveryError> {
    tokio::fs::read(path)
        .await
        .map_err(|e| DeliveryError::Payload {
            detail: format!("cannot read '{}': {}", path.display(), e),
        })
}

fn file_part(bytes: Vec<u8>, name: &str, mime: &str) -> Result<Part, DeliveryError> {
    Part::bytes(bytes)
        .file_name(name.to_string())
        .mime_str(mime)
        .map_err(|e| DeliveryError::Payload {
            detail: format!("invalid MIME type '{}': {}", mime, e),
        })
}

// ── Archive ──────────────────────────────────────────────────────────────

/// Removes the archive file when dropped.
struct ArchiveFile(PathBuf);

impl Drop for ArchiveFile {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.0) {
            Ok(()) => debug!("Removed {}", self.0.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.0.display(), e),
        }
    }
}

/// Bundle `pages` into a zip at `target`, entries named by file name, in
/// order.
pub fn build_archive(pages: &[PathBuf], target: &Path, level: u8) -> Result<(), DeliveryError> {
    let payload = |detail: String| DeliveryError::Payload { detail };

    let file = std::fs::File::create(target)
        .map_err(|e| payload(format!("cannot create '{}': {}", target.display(), e)))?;
    let mut zip = zip::ZipWriter::new(file);

    let options = if level == 0 {
        zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Stored)
    } else {
        zip::write::SimpleFileOptions::default()
            .compression_method(zip::CompressionMethod::Deflated)
            .compression_level(Some(level as i64))
    };

    for path in pages {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| payload(format!("page path '{}' has no file name", path.display())))?;
        let bytes = std::fs::read(path)
            .map_err(|e| payload(format!("cannot read '{}': {}", path.display(), e)))?;
        zip.start_file(name, options)
            .map_err(|e| payload(format!("zip entry: {}", e)))?;
        zip.write_all(&bytes)
            .map_err(|e| payload(format!("zip write: {}", e)))?;
    }

    zip.finish()
        .map_err(|e| payload(format!("zip finish: {}", e)))?;
    debug!("Built archive {} ({} entries)", target.display(), pages.len());
    Ok(())
}
