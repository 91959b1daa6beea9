//! Progress-callback trait for scan job events.
//!
//! Attach an [`Arc<dyn JobProgressCallback>`] with
//! [`crate::JobCoordinator::with_progress`] to follow a job as it moves
//! through capture, classification and delivery. Callers can forward events
//! to a terminal spinner, a channel or a status LED without the library
//! knowing how.
//!
//! # Example
//!
//! ```rust
//! use docscan::JobProgressCallback;
//! use std::sync::atomic::{AtomicUsize, Ordering};
//!
//! struct BlankCounter(AtomicUsize);
//!
//! impl JobProgressCallback for BlankCounter {
//!     fn on_page_classified(&self, _index: usize, _total: usize, kept: bool) {
//!         if !kept {
//!             self.0.fetch_add(1, Ordering::SeqCst);
//!         }
//!     }
//! }
//! ```

use crate::job::JobSummary;
use std::sync::Arc;

/// Called by the coordinator as a job progresses.
///
/// All methods default to no-ops. Events for one job arrive in order from a
/// single task.
pub trait JobProgressCallback: Send + Sync {
    /// The job claimed the scanner and has a working directory.
    fn on_job_start(&self, job_id: &str) {
        let _ = job_id;
    }

    /// The device finished; `pages` files were captured.
    fn on_capture_complete(&self, pages: usize) {
        let _ = pages;
    }

    /// One page went through the blank filter.
    ///
    /// # Arguments
    /// * `index` — 1-based page index
    /// * `total` — pages captured
    /// * `kept`  — whether the page will be delivered
    fn on_page_classified(&self, index: usize, total: usize, kept: bool) {
        let _ = (index, total, kept);
    }

    /// Upload of `pages` pages is about to start.
    fn on_delivery_start(&self, pages: usize) {
        let _ = pages;
    }

    /// The job reached a terminal state.
    fn on_job_complete(&self, summary: &JobSummary) {
        let _ = summary;
    }
}

/// A no-op implementation; the default when no callback is attached.
pub struct NoopProgressCallback;

impl JobProgressCallback for NoopProgressCallback {}

/// Shared callback handle as stored by the coordinator.
pub type ProgressCallback = Arc<dyn JobProgressCallback>;
