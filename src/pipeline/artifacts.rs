//! Job-scoped storage: allocate, retire, quarantine.
//!
//! Every job gets its own directory under `storage.temp_dir`, named after its
//! UTC start time (`2024-05-01-093012`). The directory's fate is decided once,
//! in [`ArtifactManager::finalize`]:
//!
//! * success: removed, unless `keep_files` is set
//! * failure: moved intact under `storage.failed_dir` with an `error.json`
//!   sidecar describing what went wrong
//!
//! Quarantined directories are never deleted by this crate. The retention
//! sweep only looks at the temp root.

use crate::config::ScanConfig;
use crate::error::ScanError;
use crate::job::{JobParams, PageImage, ScanJob};
use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, error, info, warn};

/// File name of the failure descriptor written into quarantined directories.
pub const SIDECAR_FILE: &str = "error.json";

static RE_JOB_DIR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}-\d{6}(-\d+)?$").unwrap());

/// A job's working directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobWorkspace {
    pub id: String,
    pub path: PathBuf,
}

/// Contents of `error.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSidecar {
    pub job_id: String,
    pub kind: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub params: JobParams,
    pub pages: Vec<PageImage>,
}

/// Owns the temp and quarantine roots.
#[derive(Debug, Clone)]
pub struct ArtifactManager {
    temp_root: PathBuf,
    failed_root: PathBuf,
    retention: Duration,
}

impl ArtifactManager {
    pub fn new(temp_root: impl Into<PathBuf>, failed_root: impl Into<PathBuf>, retention: Duration) -> Self {
        Self {
            temp_root: temp_root.into(),
            failed_root: failed_root.into(),
            retention,
        }
    }

    pub fn from_config(config: &ScanConfig) -> Self {
        Self::new(
            &config.storage.temp_dir,
            &config.storage.failed_dir,
            Duration::from_secs(config.storage.temp_retention_hours * 3600),
        )
    }

    pub fn temp_root(&self) -> &Path {
        &self.temp_root
    }

    pub fn failed_root(&self) -> &Path {
        &self.failed_root
    }

    /// Create the working directory for a job started at `started_at`.
    ///
    /// The id is the timestamp, suffixed `-1`, `-2`, … when a temp or
    /// quarantine directory of that name already exists. Stale temp
    /// directories are swept first.
    pub fn allocate(&self, started_at: DateTime<Utc>) -> Result<JobWorkspace, ScanError> {
        std::fs::create_dir_all(&self.temp_root)
            .map_err(|e| ScanError::storage(&self.temp_root, e))?;

        let removed = self.sweep_stale(SystemTime::now());
        if removed > 0 {
            info!("Removed {} stale job directories", removed);
        }

        let base = started_at.format("%Y-%m-%d-%H%M%S").to_string();
        for attempt in 0u32.. {
            let id = if attempt == 0 {
                base.clone()
            } else {
                format!("{}-{}", base, attempt)
            };
            if self.failed_root.join(&id).exists() {
                continue;
            }
            let path = self.temp_root.join(&id);
            match std::fs::create_dir(&path) {
                Ok(()) => {
                    debug!("Allocated job directory {}", path.display());
                    return Ok(JobWorkspace { id, path });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(ScanError::storage(path, e)),
            }
        }
        Err(ScanError::Internal("job id space exhausted".into()))
    }

    /// Retire or quarantine the workspace. Returns the quarantine path when
    /// the job failed.
    ///
    /// Never fails: problems are logged and the job outcome stands.
    pub fn finalize(
        &self,
        workspace: &JobWorkspace,
        job: &ScanJob,
        failure: Option<&ScanError>,
    ) -> Option<PathBuf> {
        match failure {
            None => {
                self.retire(workspace, job.params.keep_files);
                None
            }
            Some(err) => Some(self.quarantine(workspace, job, err)),
        }
    }

    fn retire(&self, workspace: &JobWorkspace, keep_files: bool) {
        if keep_files {
            info!("Keeping job files in {}", workspace.path.display());
            return;
        }
        match std::fs::remove_dir_all(&workspace.path) {
            Ok(()) => debug!("Removed job directory {}", workspace.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                "Failed to remove job directory {}: {}",
                workspace.path.display(),
                e
            ),
        }
    }

    fn quarantine(&self, workspace: &JobWorkspace, job: &ScanJob, err: &ScanError) -> PathBuf {
        let dest = match self.move_to_quarantine(workspace) {
            Ok(dest) => {
                info!("Quarantined job {} → {}", workspace.id, dest.display());
                dest
            }
            Err(e) => {
                error!(
                    "Failed to quarantine {}: {}; leaving it in place",
                    workspace.path.display(),
                    e
                );
                workspace.path.clone()
            }
        };

        let pages = job
            .pages
            .iter()
            .map(|p| {
                let mut page = p.clone();
                if let Some(name) = p.path.file_name() {
                    page.path = dest.join(name);
                }
                page
            })
            .collect();

        let sidecar = ErrorSidecar {
            job_id: workspace.id.clone(),
            kind: err.kind().to_string(),
            error: err.to_string(),
            timestamp: Utc::now(),
            params: job.params.clone(),
            pages,
        };

        let sidecar_path = dest.join(SIDECAR_FILE);
        let written = serde_json::to_vec_pretty(&sidecar)
            .map_err(io::Error::other)
            .and_then(|json| std::fs::write(&sidecar_path, json));
        if let Err(e) = written {
            error!("Failed to write {}: {}", sidecar_path.display(), e);
        }
        dest
    }

    fn move_to_quarantine(&self, workspace: &JobWorkspace) -> io::Result<PathBuf> {
        std::fs::create_dir_all(&self.failed_root)?;

        let mut dest = self.failed_root.join(&workspace.id);
        let mut n = 1;
        while dest.exists() {
            dest = self.failed_root.join(format!("{}-{}", workspace.id, n));
            n += 1;
        }

        match std::fs::rename(&workspace.path, &dest) {
            Ok(()) => Ok(dest),
            Err(e) => {
                debug!("rename failed ({}), falling back to copy", e);
                copy_dir_recursive(&workspace.path, &dest)?;
                std::fs::remove_dir_all(&workspace.path)?;
                Ok(dest)
            }
        }
    }

    /// Remove temp job directories whose modification time is older than the
    /// retention window. Returns how many were removed.
    pub fn sweep_stale(&self, now: SystemTime) -> usize {
        let entries = match std::fs::read_dir(&self.temp_root) {
            Ok(entries) => entries,
            Err(_) => return 0,
        };

        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if path == self.failed_root {
                continue;
            }
            let name = entry.file_name();
            if !name.to_str().is_some_and(|n| RE_JOB_DIR.is_match(n)) {
                continue;
            }
            let Ok(meta) = entry.metadata() else { continue };
            if !meta.is_dir() {
                continue;
            }
            let age = meta
                .modified()
                .ok()
                .and_then(|m| now.duration_since(m).ok())
                .unwrap_or_default();
            if age >= self.retention {
                match std::fs::remove_dir_all(&path) {
                    Ok(()) => removed += 1,
                    Err(e) => warn!("Failed to sweep {}: {}", path.display(), e),
                }
            }
        }
        removed
    }
}

fn copy_dir_recursive(src: &Path, dst: &Path) -> io::Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_recursive(&entry.path(), &target)?;
        } else {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
