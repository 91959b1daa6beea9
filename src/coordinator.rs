//! The job coordinator: one scan at a time, start to finish.
//!
//! ## State machine
//!
//! ```text
//!            claim (CAS)                    delivery ok / nothing to deliver
//! Idle ───────────────▶ Running ──────────────────────────────────▶ Succeeded
//!  ▲ Succeeded/Failed      │                                              │
//!  └─── next claim ────────┴──── device / delivery / storage error ──▶ Failed
//! ```
//!
//! The state lives in an `AtomicU8`. A trigger is accepted only by a
//! compare-and-set from a non-`Running` value to `Running`; every other
//! trigger gets [`StartAck::Busy`] straight away. Nothing is queued.
//!
//! ## One job
//!
//! 1. allocate the job directory
//! 2. resolve the source and capture a batch
//! 3. colour-correct each page (page-local failures)
//! 4. classify each page (page-local failures, fail open)
//! 5. deliver the kept pages, if any
//! 6. finalize the directory: remove on success, quarantine on failure
//!
//! A job runs to a terminal state; there is no cancellation. A panic inside
//! the stages is caught, turned into a `Failed` job, and the guard is still
//! released.

use crate::config::ScanConfig;
use crate::error::{DeliveryError, ScanError};
use crate::job::{
    JobOverrides, JobParams, JobState, JobSummary, PageImage, ScanJob, StartAck, StatusReport,
    UploadResult,
};
use crate::pipeline::artifacts::{ArtifactManager, JobWorkspace};
use crate::pipeline::deliver::{DeliveryMetadata, DocumentSink, FailureReport, HttpDeliveryAgent};
use crate::pipeline::device::{CaptureRequest, DeviceController, SaneDevice, ScanDevice};
use crate::pipeline::{filter, transform};
use crate::progress::{NoopProgressCallback, ProgressCallback};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

struct Inner {
    config: ScanConfig,
    device: DeviceController,
    sink: Arc<dyn DocumentSink>,
    artifacts: ArtifactManager,
    state: AtomicU8,
    state_tx: watch::Sender<JobState>,
    last_run: Mutex<Option<JobSummary>>,
}

impl Inner {
    fn set_state(&self, state: JobState) {
        self.state.store(state.to_u8(), Ordering::SeqCst);
        self.state_tx.send_replace(state);
    }
}

/// Releases the claim if a job future is dropped before it finishes.
struct RunGuard {
    inner: Arc<Inner>,
    armed: bool,
}

impl RunGuard {
    fn release(mut self, state: JobState) {
        self.armed = false;
        self.inner.set_state(state);
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if self.armed {
            warn!("Scan job abandoned before completion; marking failed");
            self.inner.set_state(JobState::Failed);
        }
    }
}

/// Single-flight owner of the scan pipeline.
///
/// Cheap to clone; clones share the same state and guard.
#[derive(Clone)]
pub struct JobCoordinator {
    inner: Arc<Inner>,
    progress: ProgressCallback,
}

impl JobCoordinator {
    pub fn new(config: ScanConfig, device: Arc<dyn ScanDevice>, sink: Arc<dyn DocumentSink>) -> Self {
        let (state_tx, _) = watch::channel(JobState::Idle);
        let artifacts = ArtifactManager::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                config,
                device: DeviceController::new(device),
                sink,
                artifacts,
                state: AtomicU8::new(JobState::Idle.to_u8()),
                state_tx,
                last_run: Mutex::new(None),
            }),
            progress: Arc::new(NoopProgressCallback),
        }
    }

    /// Coordinator wired to the SANE backend and the HTTP delivery agent.
    pub fn from_config(config: ScanConfig) -> Result<Self, ScanError> {
        config.validate()?;
        let device = SaneDevice::from_config(&config)?;
        let sink = HttpDeliveryAgent::new(&config.api, &config.upload)?;
        Ok(Self::new(config, Arc::new(device), Arc::new(sink)))
    }

    /// Attach a progress callback.
    pub fn with_progress(mut self, progress: ProgressCallback) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &ScanConfig {
        &self.inner.config
    }

    pub fn device(&self) -> &DeviceController {
        &self.inner.device
    }

    pub fn state(&self) -> JobState {
        JobState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// Current state plus the summary of the last finished job.
    pub fn status(&self) -> StatusReport {
        let last_run = self
            .inner
            .last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        StatusReport {
            state: self.state(),
            last_run,
        }
    }

    /// Watch state transitions.
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.inner.state_tx.subscribe()
    }

    /// Trigger a job without waiting for it.
    ///
    /// Returns [`StartAck::Busy`] immediately when a job is running. Invalid
    /// overrides are rejected before the scanner is claimed. Must be called
    /// from within a Tokio runtime.
    pub fn start_job(&self, overrides: JobOverrides) -> Result<StartAck, ScanError> {
        overrides.validate()?;
        let handle = tokio::runtime::Handle::current();
        let Some(guard) = self.try_claim() else {
            info!("Scan trigger rejected: a job is already running");
            return Ok(StartAck::Busy);
        };
        let this = self.clone();
        handle.spawn(async move {
            this.execute(guard, overrides).await;
        });
        Ok(StartAck::Started)
    }

    /// Claim the scanner and run a job to completion on the current task.
    pub async fn run_job(&self, overrides: JobOverrides) -> Result<JobSummary, ScanError> {
        overrides.validate()?;
        let guard = self.try_claim().ok_or(ScanError::Busy)?;
        Ok(self.execute(guard, overrides).await)
    }

    fn try_claim(&self) -> Option<RunGuard> {
        let running = JobState::Running.to_u8();
        let mut current = self.inner.state.load(Ordering::SeqCst);
        loop {
            if current == running {
                return None;
            }
            match self.inner.state.compare_exchange(
                current,
                running,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => {
                    self.inner.state_tx.send_replace(JobState::Running);
                    info!("Scan job claimed ({:?} → Running)", JobState::from_u8(current));
                    return Some(RunGuard {
                        inner: self.inner.clone(),
                        armed: true,
                    });
                }
                Err(actual) => current = actual,
            }
        }
    }

    async fn execute(&self, guard: RunGuard, overrides: JobOverrides) -> JobSummary {
        let started_at = Utc::now();
        let clock = Instant::now();
        let params = JobParams::resolve(&self.inner.config, &overrides);

        let summary = match self.inner.artifacts.allocate(started_at) {
            Ok(workspace) => self.run_allocated(workspace, params, started_at, clock).await,
            Err(e) => {
                error!("Cannot allocate job storage: {}", e);
                let job_id = started_at.format("%Y-%m-%d-%H%M%S").to_string();
                let mut job = ScanJob::new(job_id, params, started_at);
                job.state = JobState::Failed;
                job.completed_at = Some(Utc::now());
                job.error = Some(e.to_string());
                self.report(&job, &e);
                summarize(&job, None, Some(&e), None, clock)
            }
        };

        *self
            .inner
            .last_run
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(summary.clone());
        guard.release(summary.state);
        info!(
            "Scan job {} finished: {:?} in {}ms",
            summary.job_id, summary.state, summary.duration_ms
        );
        self.progress.on_job_complete(&summary);
        summary
    }

    async fn run_allocated(
        &self,
        workspace: JobWorkspace,
        params: JobParams,
        started_at: DateTime<Utc>,
        clock: Instant,
    ) -> JobSummary {
        let mut job = ScanJob::new(workspace.id.clone(), params, started_at);
        info!(
            "Scan job {} started: source={} {}dpi {} {}",
            job.id,
            job.params.source,
            job.params.resolution,
            job.params.mode.as_sane(),
            job.params.format.as_sane()
        );
        self.progress.on_job_start(&job.id);

        let stages = AssertUnwindSafe(self.run_stages(&mut job, &workspace))
            .catch_unwind()
            .await;
        let result = match stages {
            Ok(result) => result,
            Err(panic) => Err(ScanError::Internal(format!(
                "scan job panicked: {}",
                panic_message(panic.as_ref())
            ))),
        };
        job.completed_at = Some(Utc::now());

        match result {
            Ok(upload) => {
                job.state = JobState::Succeeded;
                self.inner.artifacts.finalize(&workspace, &job, None);
                summarize(&job, upload, None, None, clock)
            }
            Err(e) => {
                job.state = JobState::Failed;
                job.error = Some(e.to_string());
                error!("Scan job {} failed [{}]: {}", job.id, e.kind(), e);
                self.report(&job, &e);
                let quarantine = self.inner.artifacts.finalize(&workspace, &job, Some(&e));
                let upload = match e {
                    ScanError::Delivery(ref d) => Some(failed_upload(d)),
                    _ => None,
                };
                summarize(&job, upload, Some(&e), quarantine, clock)
            }
        }
    }

    async fn run_stages(
        &self,
        job: &mut ScanJob,
        workspace: &JobWorkspace,
    ) -> Result<Option<UploadResult>, ScanError> {
        let config = &self.inner.config;

        // ── Step 1: Resolve source ───────────────────────────────────────
        job.concrete_source = self.inner.device.resolve(&job.params.source).await?;

        // ── Step 2: Capture ──────────────────────────────────────────────
        let request = CaptureRequest {
            source: job.concrete_source.clone(),
            resolution: job.params.resolution,
            mode: job.params.mode,
            format: job.params.format,
            output_dir: workspace.path.clone(),
            max_pages: config.scanner.max_pages,
            timeout: Duration::from_secs(config.scanner.capture_timeout_secs),
        };
        let files = self.inner.device.capture_batch(&request).await?;
        self.progress.on_capture_complete(files.len());
        if files.is_empty() {
            info!("Scan job {}: no pages captured, nothing to deliver", job.id);
            return Ok(None);
        }

        // ── Step 3: Colour correction ────────────────────────────────────
        let correction_failures = transform::correct_pages(
            &files,
            job.params.format,
            config.scanner.color_correction,
            config.upload.image_quality,
        )
        .await;

        // ── Step 4: Blank-page filter ────────────────────────────────────
        job.pages = filter::filter_pages(&files, job.params.skip_blank, &config.processing).await;
        // A correction error takes precedence over a classification error.
        for (index, err) in correction_failures {
            if let Some(page) = job.pages.get_mut(index - 1) {
                page.filter_error = Some(err);
            }
        }
        let total = job.pages.len();
        for page in &job.pages {
            self.progress.on_page_classified(page.index, total, page.kept);
        }

        let kept: Vec<PageImage> = job.kept_pages().cloned().collect();
        info!(
            "Scan job {}: {} of {} pages kept",
            job.id,
            kept.len(),
            total
        );
        if kept.is_empty() {
            info!("Scan job {}: every page was blank, nothing to deliver", job.id);
            return Ok(None);
        }
        if !job.params.upload {
            info!(
                "Scan job {}: upload disabled, {} pages left in {}",
                job.id,
                kept.len(),
                workspace.path.display()
            );
            return Ok(None);
        }

        // ── Step 5: Deliver ──────────────────────────────────────────────
        self.progress.on_delivery_start(kept.len());
        let metadata = DeliveryMetadata {
            doc_id: job.params.doc_id.clone(),
            meta: job.params.meta.clone(),
            document_type: job.params.document_type.clone(),
            properties: job.params.properties.clone(),
            format: job.params.format,
            work_dir: workspace.path.clone(),
        };
        let upload = self.inner.sink.deliver(&kept, &metadata).await?;
        info!(
            "Scan job {}: delivered {} pages (doc {:?})",
            job.id, upload.pages_added, upload.doc_id
        );
        Ok(Some(upload))
    }

    fn report(&self, job: &ScanJob, err: &ScanError) {
        let report = FailureReport {
            kind: err.kind().to_string(),
            message: err.to_string(),
            source: Some(
                job.concrete_source
                    .clone()
                    .unwrap_or_else(|| job.params.source.to_string()),
            ),
            device: self.inner.device.describe(),
            timestamp: Utc::now(),
        };
        debug!("Reporting failure of job {}", job.id);
        self.inner.sink.report_failure(report);
    }
}

fn failed_upload(err: &DeliveryError) -> UploadResult {
    let status = match err {
        DeliveryError::AuthRejected { status, .. } | DeliveryError::ServerError { status, .. } => {
            Some(*status)
        }
        _ => None,
    };
    UploadResult {
        status,
        doc_id: None,
        pages_added: 0,
        total_pages: None,
        error: Some(err.to_string()),
    }
}

fn summarize(
    job: &ScanJob,
    upload: Option<UploadResult>,
    error: Option<&ScanError>,
    quarantine_path: Option<PathBuf>,
    clock: Instant,
) -> JobSummary {
    JobSummary {
        job_id: job.id.clone(),
        state: job.state,
        started_at: job.started_at,
        completed_at: job.completed_at.unwrap_or_else(Utc::now),
        duration_ms: clock.elapsed().as_millis() as u64,
        source: job.concrete_source.clone(),
        pages_captured: job.pages.len(),
        pages_kept: job.kept_pages().count(),
        dropped_pages: job
            .pages
            .iter()
            .filter(|p| !p.kept)
            .map(|p| p.index)
            .collect(),
        upload,
        error_kind: error.map(|e| e.kind().to_string()),
        error: error.map(|e| e.to_string()),
        quarantine_path,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DeviceError;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicUsize;

    struct ScriptedDevice {
        sources: Vec<String>,
        pages: usize,
        panic_on_capture: bool,
    }

    #[async_trait]
    impl ScanDevice for ScriptedDevice {
        fn describe(&self) -> String {
            "scripted:0".into()
        }

        async fn query_sources(&self) -> Result<Vec<String>, DeviceError> {
            Ok(self.sources.clone())
        }

        async fn capture(&self, request: &CaptureRequest) -> Result<(), DeviceError> {
            if self.panic_on_capture {
                panic!("driver exploded");
            }
            if self.pages == 0 {
                return Err(DeviceError::NoMedia);
            }
            for n in 1..=self.pages {
                let img = image::RgbImage::from_fn(20, 20, |x, _| {
                    if x < 10 {
                        image::Rgb([0, 0, 0])
                    } else {
                        image::Rgb([255, 255, 255])
                    }
                });
                img.save(request.page_path(n)).map_err(|e| DeviceError::DriverFault {
                    detail: e.to_string(),
                })?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct CountingSink {
        delivered: AtomicUsize,
        reports: AtomicUsize,
    }

    #[async_trait]
    impl DocumentSink for CountingSink {
        async fn deliver(
            &self,
            pages: &[PageImage],
            _metadata: &DeliveryMetadata,
        ) -> Result<UploadResult, DeliveryError> {
            self.delivered.fetch_add(1, Ordering::SeqCst);
            Ok(UploadResult {
                status: Some(200),
                doc_id: Some("doc-1".into()),
                pages_added: pages.len(),
                total_pages: Some(pages.len()),
                error: None,
            })
        }

        fn report_failure(&self, _report: FailureReport) {
            self.reports.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn coordinator(
        root: &std::path::Path,
        device: ScriptedDevice,
        sink: Arc<CountingSink>,
    ) -> JobCoordinator {
        let config = ScanConfig::builder()
            .device("scripted:0")
            .temp_dir(root.join("tmp"))
            .failed_dir(root.join("failed"))
            .build()
            .unwrap();
        JobCoordinator::new(config, Arc::new(device), sink)
    }

    #[tokio::test]
    async fn successful_job_delivers_and_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec!["Flatbed".into(), "ADF Duplex".into()],
            pages: 2,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink.clone());

        let summary = coord.run_job(JobOverrides::default()).await.unwrap();
        assert_eq!(summary.state, JobState::Succeeded);
        assert_eq!(summary.source.as_deref(), Some("ADF Duplex"));
        assert_eq!(summary.pages_kept, 2);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        assert_eq!(coord.state(), JobState::Succeeded);
        assert_eq!(std::fs::read_dir(root.path().join("tmp")).unwrap().count(), 0);
        assert_eq!(coord.status().last_run.unwrap().job_id, summary.job_id);
    }

    #[tokio::test]
    async fn empty_feeder_succeeds_without_delivery() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec![],
            pages: 0,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink.clone());

        let summary = coord.run_job(JobOverrides::default()).await.unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.pages_captured, 0);
        assert_eq!(summary.source, None);
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn unsupported_source_fails_and_quarantines() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec!["Flatbed".into()],
            pages: 1,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink.clone());
        let overrides = JobOverrides {
            source: Some(crate::config::LogicalSource::Adf),
            ..Default::default()
        };

        let summary = coord.run_job(overrides).await.unwrap();
        assert_eq!(summary.state, JobState::Failed);
        assert_eq!(summary.error_kind.as_deref(), Some("source_unsupported"));
        let q = summary.quarantine_path.unwrap();
        assert!(q.join("error.json").exists());
        assert_eq!(sink.reports.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panic_releases_guard() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec![],
            pages: 1,
            panic_on_capture: true,
        };
        let coord = coordinator(root.path(), device, sink);

        let summary = coord.run_job(JobOverrides::default()).await.unwrap();
        assert_eq!(summary.state, JobState::Failed);
        assert!(summary.error.unwrap().contains("driver exploded"));
        assert_eq!(coord.state(), JobState::Failed);

        // The scanner can be claimed again.
        assert!(coord.try_claim().is_some());
    }

    #[tokio::test]
    async fn run_job_while_running_is_busy() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec![],
            pages: 0,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink);

        let guard = coord.try_claim().unwrap();
        assert!(matches!(
            coord.run_job(JobOverrides::default()).await,
            Err(ScanError::Busy)
        ));
        assert_eq!(coord.start_job(JobOverrides::default()).unwrap(), StartAck::Busy);
        guard.release(JobState::Idle);
        assert_eq!(coord.state(), JobState::Idle);
    }

    /// Writes a single undecodable page.
    struct GarbageDevice;

    #[async_trait]
    impl ScanDevice for GarbageDevice {
        fn describe(&self) -> String {
            "garbage:0".into()
        }

        async fn query_sources(&self) -> Result<Vec<String>, DeviceError> {
            Ok(Vec::new())
        }

        async fn capture(&self, request: &CaptureRequest) -> Result<(), DeviceError> {
            std::fs::write(request.page_path(1), b"not an image").map_err(|e| {
                DeviceError::DriverFault {
                    detail: e.to_string(),
                }
            })
        }
    }

    #[tokio::test]
    async fn correction_error_is_kept_on_the_page() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let config = ScanConfig::builder()
            .device("garbage:0")
            .color_correction(crate::config::ColorCorrection::SwapRb)
            .temp_dir(root.path().join("tmp"))
            .failed_dir(root.path().join("failed"))
            .build()
            .unwrap();
        let coord = JobCoordinator::new(config, Arc::new(GarbageDevice), sink.clone());

        let workspace = coord.inner.artifacts.allocate(Utc::now()).unwrap();
        let params = JobParams::resolve(coord.config(), &JobOverrides::default());
        let mut job = ScanJob::new(workspace.id.clone(), params, Utc::now());
        let upload = coord.run_stages(&mut job, &workspace).await.unwrap();

        // Fails open: the unreadable page is still delivered.
        assert!(upload.is_some());
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 1);
        let page = &job.pages[0];
        assert!(page.kept);
        let err = page.filter_error.as_ref().unwrap().to_string();
        assert!(err.contains("colour correction"), "{}", err);
    }

    #[tokio::test]
    async fn invalid_override_is_rejected_before_claim() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec![],
            pages: 1,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink.clone());
        let overrides = JobOverrides {
            resolution: Some(0),
            ..Default::default()
        };

        assert!(matches!(
            coord.run_job(overrides.clone()).await,
            Err(ScanError::InvalidConfig(_))
        ));
        assert!(matches!(
            coord.start_job(overrides),
            Err(ScanError::InvalidConfig(_))
        ));
        assert_eq!(coord.state(), JobState::Idle);
        assert!(coord.status().last_run.is_none());
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn no_upload_keeps_pages_without_delivery() {
        let root = tempfile::tempdir().unwrap();
        let sink = Arc::new(CountingSink::default());
        let device = ScriptedDevice {
            sources: vec![],
            pages: 2,
            panic_on_capture: false,
        };
        let coord = coordinator(root.path(), device, sink.clone());

        let summary = coord
            .run_job(JobOverrides {
                upload: Some(false),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(summary.succeeded());
        assert_eq!(summary.pages_kept, 2);
        assert!(summary.upload.is_none());
        assert_eq!(sink.delivered.load(Ordering::SeqCst), 0);
        let job_dir = root.path().join("tmp").join(&summary.job_id);
        assert_eq!(std::fs::read_dir(job_dir).unwrap().count(), 2);
    }

    #[test]
    fn failed_upload_keeps_status() {
        let u = failed_upload(&DeliveryError::ServerError {
            status: 502,
            body: "bad gateway".into(),
        });
        assert_eq!(u.status, Some(502));
        assert_eq!(u.pages_added, 0);
        assert!(u.error.unwrap().contains("502"));
    }
}
