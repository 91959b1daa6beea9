//! Job data model: what a scan job asked for, what it produced, and how it
//! ended.

use crate::config::{check_resolution, ColorMode, ImageFormat, LogicalSource, ScanConfig};
use crate::error::{FilterError, ScanError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Lifecycle state of a scan job.
///
/// `Succeeded` and `Failed` are terminal: a job never leaves them. The
/// coordinator's state cell returns to accepting triggers from either.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Idle,
    Running,
    Succeeded,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Succeeded | JobState::Failed)
    }

    pub(crate) fn to_u8(self) -> u8 {
        match self {
            JobState::Idle => 0,
            JobState::Running => 1,
            JobState::Succeeded => 2,
            JobState::Failed => 3,
        }
    }

    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => JobState::Running,
            2 => JobState::Succeeded,
            3 => JobState::Failed,
            _ => JobState::Idle,
        }
    }
}

/// Parameters a job actually ran with, after overrides were applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobParams {
    pub device: String,
    pub source: LogicalSource,
    pub resolution: u32,
    pub mode: ColorMode,
    pub format: ImageFormat,
    pub skip_blank: bool,
    pub keep_files: bool,
    /// Deliver the kept pages. When off, the job stops after filtering and
    /// its directory is kept.
    pub upload: bool,
    /// Append to an existing document instead of creating one.
    pub doc_id: Option<String>,
    /// Free-form metadata, sent as the `meta` field.
    pub meta: Option<serde_json::Value>,
    pub document_type: Option<String>,
    pub properties: Option<serde_json::Value>,
}

impl JobParams {
    /// Merge per-trigger overrides over the configured defaults.
    pub fn resolve(config: &ScanConfig, overrides: &JobOverrides) -> Self {
        let upload = overrides.upload.unwrap_or(true);
        Self {
            device: config.scanner.device.clone(),
            source: overrides
                .source
                .clone()
                .unwrap_or_else(|| config.scanner.source.clone()),
            resolution: overrides.resolution.unwrap_or(config.scanner.resolution),
            mode: overrides.mode.unwrap_or(config.scanner.mode),
            format: overrides.format.unwrap_or(config.scanner.format),
            skip_blank: overrides
                .skip_blank
                .unwrap_or(config.processing.skip_blank),
            keep_files: !upload || overrides.keep_files.unwrap_or(config.storage.keep_files),
            upload,
            doc_id: overrides.doc_id.clone(),
            meta: overrides.meta.clone(),
            document_type: overrides.document_type.clone(),
            properties: overrides.properties.clone(),
        }
    }
}

/// Per-trigger overrides. Unset fields fall back to [`ScanConfig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobOverrides {
    pub source: Option<LogicalSource>,
    pub resolution: Option<u32>,
    pub mode: Option<ColorMode>,
    pub format: Option<ImageFormat>,
    pub skip_blank: Option<bool>,
    pub keep_files: Option<bool>,
    /// `Some(false)` captures and filters without delivering.
    pub upload: Option<bool>,
    pub doc_id: Option<String>,
    pub meta: Option<serde_json::Value>,
    pub document_type: Option<String>,
    pub properties: Option<serde_json::Value>,
}

impl JobOverrides {
    /// Range-check the fields that bypass [`ScanConfig::validate`].
    pub fn validate(&self) -> Result<(), ScanError> {
        if let Some(dpi) = self.resolution {
            check_resolution("resolution override", dpi)?;
        }
        Ok(())
    }
}

/// One captured page.
///
/// `index` is 1-based and follows capture order, which is also delivery
/// order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PageImage {
    pub index: usize,
    pub path: PathBuf,
    pub bytes: u64,
    /// Fraction of non-white pixels; `None` when classification was skipped
    /// or failed.
    pub non_white_fraction: Option<f64>,
    pub filter_error: Option<FilterError>,
    pub kept: bool,
}

/// Outcome of a delivery attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadResult {
    /// HTTP status code, when a response arrived.
    pub status: Option<u16>,
    pub doc_id: Option<String>,
    pub pages_added: usize,
    pub total_pages: Option<usize>,
    pub error: Option<String>,
}

/// A single scan job from trigger to terminal state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub id: String,
    pub params: JobParams,
    pub state: JobState,
    /// Resolved device-specific source; `None` when the device exposes no
    /// source option.
    pub concrete_source: Option<String>,
    pub pages: Vec<PageImage>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl ScanJob {
    pub fn new(id: String, params: JobParams, started_at: DateTime<Utc>) -> Self {
        Self {
            id,
            params,
            state: JobState::Running,
            concrete_source: None,
            pages: Vec::new(),
            started_at,
            completed_at: None,
            error: None,
        }
    }

    /// Pages that survived the filter, in capture order.
    pub fn kept_pages(&self) -> impl Iterator<Item = &PageImage> {
        self.pages.iter().filter(|p| p.kept)
    }
}

/// Compact record of the last finished job, returned by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub state: JobState,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub source: Option<String>,
    pub pages_captured: usize,
    pub pages_kept: usize,
    /// Indices of pages dropped as blank.
    pub dropped_pages: Vec<usize>,
    pub upload: Option<UploadResult>,
    pub error_kind: Option<String>,
    pub error: Option<String>,
    /// Where the artifacts went when the job failed.
    pub quarantine_path: Option<PathBuf>,
}

impl JobSummary {
    pub fn succeeded(&self) -> bool {
        self.state == JobState::Succeeded
    }
}

/// Immediate answer to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartAck {
    Started,
    Busy,
}

/// Answer to a status query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub state: JobState,
    pub last_run: Option<JobSummary>,
}
