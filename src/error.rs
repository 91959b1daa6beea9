//! Error types for the docscan library.
//!
//! Errors are grouped by the boundary they come from, and by whether they end
//! the job:
//!
//! * [`ScanError`] — **Fatal**: the job cannot reach a successful end. It
//!   wraps [`DeviceError`] and [`DeliveryError`], plus local storage and
//!   configuration failures. A job that hits one of these transitions to
//!   `Failed` and its artifacts are quarantined.
//!
//! * [`FilterError`] — **Page-local**: a single page could not be analysed.
//!   The page is kept (never silently discarded) and the error is stored on
//!   the page's [`crate::job::PageImage`] for later inspection.
//!
//! [`DeviceError::NoMedia`] is the one device condition that is not fatal:
//! the controller turns it into an empty page set.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// All fatal errors returned by the docscan library.
#[derive(Debug, Error)]
pub enum ScanError {
    // ── Boundary errors ───────────────────────────────────────────────────
    /// The imaging device failed.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The document API rejected or never received the pages.
    #[error(transparent)]
    Delivery(#[from] DeliveryError),

    // ── Local errors ──────────────────────────────────────────────────────
    /// Job storage could not be created or written.
    #[error("Storage error at '{path}': {source}")]
    Storage {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The configuration file exists but could not be read or parsed.
    #[error("Failed to load configuration from '{path}': {detail}")]
    ConfigLoad { path: PathBuf, detail: String },

    /// Another job already holds the scanner.
    #[error("A scan job is already running")]
    Busy,

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// Stable machine-readable name, written to sidecars and telemetry.
    pub fn kind(&self) -> &'static str {
        match self {
            ScanError::Device(e) => e.kind(),
            ScanError::Delivery(e) => e.kind(),
            ScanError::Storage { .. } => "storage_error",
            ScanError::InvalidConfig(_) => "invalid_config",
            ScanError::ConfigLoad { .. } => "config_load",
            ScanError::Busy => "busy",
            ScanError::Internal(_) => "internal",
        }
    }

    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ScanError::Storage {
            path: path.into(),
            source,
        }
    }
}

/// Failures reported by the imaging device or its driver.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeviceError {
    /// The feeder had no paper. Not fatal: yields an empty page set.
    #[error("No media in the document feeder")]
    NoMedia,

    /// Another process holds the device.
    #[error("Scanner is busy: {detail}\nAnother process may be holding the device (scanbd, a previous scan).")]
    Busy { detail: String },

    /// The driver exited abnormally or reported a hardware fault.
    #[error("Scanner driver fault: {detail}")]
    DriverFault { detail: String },

    /// No capability string satisfies the requested logical source.
    #[error("Source '{requested}' is not supported by this device (available: {available:?})")]
    SourceUnsupported {
        requested: String,
        available: Vec<String>,
    },
}

impl DeviceError {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceError::NoMedia => "no_media",
            DeviceError::Busy { .. } => "device_busy",
            DeviceError::DriverFault { .. } => "driver_fault",
            DeviceError::SourceUnsupported { .. } => "source_unsupported",
        }
    }
}

/// A non-fatal error for a single page.
///
/// Stored on the page it belongs to; the page is kept.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
pub enum FilterError {
    /// The page could not be decoded, or decoded to zero pixels.
    #[error("Page {index}: unreadable image '{path}': {detail}")]
    UnreadableImage {
        index: usize,
        path: PathBuf,
        detail: String,
    },

    /// A colour-corrected page could not be written back.
    #[error("Page {index}: failed to rewrite '{path}': {detail}")]
    RewriteFailed {
        index: usize,
        path: PathBuf,
        detail: String,
    },
}

/// Failures delivering the page set to the document API.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// HTTP 401 or 403.
    #[error("Document API rejected credentials (HTTP {status}): {detail}\nCheck api.token in the configuration.")]
    AuthRejected { status: u16, detail: String },

    /// Any other non-2xx response.
    #[error("Document API returned HTTP {status}: {body}")]
    ServerError { status: u16, body: String },

    /// The request did not complete within the configured timeout.
    #[error("Upload timed out after {secs}s\nIncrease api.timeout_secs for large documents.")]
    Timeout { secs: u64 },

    /// Connection refused, DNS failure, or another transport error.
    #[error("Document API unreachable: {detail}")]
    NetworkUnreachable { detail: String },

    /// The request body could not be assembled locally.
    #[error("Failed to build upload payload: {detail}")]
    Payload { detail: String },
}

impl DeliveryError {
    /// Stable machine-readable name.
    pub fn kind(&self) -> &'static str {
        match self {
            DeliveryError::AuthRejected { .. } => "auth_rejected",
            DeliveryError::ServerError { .. } => "server_error",
            DeliveryError::Timeout { .. } => "timeout",
            DeliveryError::NetworkUnreachable { .. } => "network_unreachable",
            DeliveryError::Payload { .. } => "payload_error",
        }
    }
}
