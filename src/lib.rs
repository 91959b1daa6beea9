//! # docscan
//!
//! Capture a multi-page document from a SANE scanner, drop the blank pages,
//! and deliver what is left to a document API as one document.
//!
//! ## Pipeline Overview
//!
//! ```text
//! trigger (CLI / button / HTTP)
//!  │
//!  ├─ 0. Claim    single-flight CAS; a second trigger gets "busy"
//!  ├─ 1. Allocate job directory named after the start time
//!  ├─ 2. Capture  resolve ADF/Flatbed/Auto, batch scan via scanimage
//!  ├─ 3. Correct  optional channel reorder for drivers that swap RGB
//!  ├─ 4. Filter   luma-based blank detection, fail open
//!  ├─ 5. Deliver  multipart upload (pages or one zip), bounded by a timeout
//!  └─ 6. Finalize remove on success, quarantine with error.json on failure
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use docscan::{JobCoordinator, JobOverrides, LogicalSource, ScanConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ScanConfig::builder()
//!         .device("canon_dr:libusb:001:004")
//!         .api_url("https://docs.example.com")
//!         .workspace("office")
//!         .build()?;
//!     let coordinator = JobCoordinator::from_config(config)?;
//!
//!     let summary = coordinator
//!         .run_job(JobOverrides {
//!             source: Some(LogicalSource::Adf),
//!             ..Default::default()
//!         })
//!         .await?;
//!     eprintln!("{:?}: {} of {} pages delivered",
//!         summary.state, summary.pages_kept, summary.pages_captured);
//!     Ok(())
//! }
//! ```
//!
//! Hosts that must not block (a button listener, an HTTP handler) call
//! [`JobCoordinator::start_job`] instead and poll
//! [`JobCoordinator::status`] or [`JobCoordinator::subscribe`].
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `docscan` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when embedding the library:
//! ```toml
//! docscan = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod coordinator;
pub mod error;
pub mod job;
pub mod pipeline;
pub mod progress;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{
    ColorCorrection, ColorMode, CompressionMode, ImageFormat, LogicalSource, ScanConfig,
    ScanConfigBuilder,
};
pub use coordinator::JobCoordinator;
pub use error::{DeliveryError, DeviceError, FilterError, ScanError};
pub use job::{
    JobOverrides, JobParams, JobState, JobSummary, PageImage, ScanJob, StartAck, StatusReport,
    UploadResult,
};
pub use pipeline::deliver::{
    ConnectionCheck, DeliveryMetadata, DocumentSink, FailureReport, HttpDeliveryAgent,
};
pub use pipeline::device::{CaptureRequest, DeviceDescription, SaneDevice, ScanDevice};
pub use progress::{JobProgressCallback, NoopProgressCallback, ProgressCallback};
