//! Pipeline stages for a scan job.
//!
//! Each submodule owns one step and is testable on its own; the
//! [`crate::coordinator`] runs them in order.
//!
//! ## Data Flow
//!
//! ```text
//! artifacts ──▶ device ──▶ transform ──▶ filter ──▶ deliver ──▶ artifacts
//! (allocate)    (capture)  (channels)    (blank)    (upload)    (finalize)
//! ```
//!
//! 1. [`artifacts`] — job directory naming, removal and quarantine
//! 2. [`device`]    — source resolution and batch capture; the backend sits
//!    behind the `ScanDevice` trait
//! 3. [`transform`] — optional colour-channel correction, run in
//!    `spawn_blocking` because decoding is CPU-bound
//! 4. [`filter`]    — blank-page classification, also on the blocking pool
//! 5. [`deliver`]   — multipart upload and failure telemetry; the only stage
//!    with network I/O

pub mod artifacts;
pub mod deliver;
pub mod device;
pub mod filter;
pub mod transform;
