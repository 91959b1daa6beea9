//! Device control: resolve a logical source and capture a batch of pages.
//!
//! The hardware sits behind the [`ScanDevice`] trait. [`SaneDevice`] drives
//! the SANE `scanimage` CLI; tests and alternative backends plug in their own
//! implementation. [`DeviceController`] owns everything that is independent
//! of the backend: source resolution against the capability list, turning an
//! empty feeder into an empty page set, and collecting the numbered page
//! files in capture order.
//!
//! ## Source resolution
//!
//! Device naming quirks are isolated in one declarative table,
//! [`SOURCE_RULES`]: each logical name maps to an ordered list of
//! case-insensitive substrings, and the first capability containing the
//! earliest substring wins. An exact (case-insensitive) match on the
//! requested name always takes precedence.

use crate::config::{ColorMode, ImageFormat, LogicalSource, ScanConfig};
use crate::error::{DeviceError, ScanError};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Logical source → ordered substrings acceptable in a capability string.
pub const SOURCE_RULES: &[(&str, &[&str])] = &[
    ("adf", &["duplex", "front", "adf"]),
    ("flatbed", &["flatbed"]),
    ("auto", &["duplex", "front", "flatbed"]),
];

/// Everything a backend needs for one batch capture.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureRequest {
    /// Concrete source string; `None` uses the device default.
    pub source: Option<String>,
    pub resolution: u32,
    pub mode: ColorMode,
    pub format: ImageFormat,
    pub output_dir: PathBuf,
    pub max_pages: u32,
    pub timeout: Duration,
}

impl CaptureRequest {
    /// `printf`-style batch pattern, e.g. `<dir>/page_%03d.jpg`.
    pub fn batch_pattern(&self) -> PathBuf {
        self.output_dir
            .join(format!("page_%03d.{}", self.format.extension()))
    }

    /// Path of the `n`-th page (1-based) under the batch pattern.
    pub fn page_path(&self, n: usize) -> PathBuf {
        self.output_dir
            .join(format!("page_{:03}.{}", n, self.format.extension()))
    }
}

/// An imaging device that can report its sources and capture a batch.
///
/// `capture` writes pages named by [`CaptureRequest::page_path`] into the
/// output directory. It returns [`DeviceError::NoMedia`] when the feeder was
/// empty; the controller treats that as zero pages.
#[async_trait]
pub trait ScanDevice: Send + Sync {
    /// Human-readable device identifier for logs and telemetry.
    fn describe(&self) -> String;

    /// Device-specific source names; empty when the device has no source
    /// option.
    async fn query_sources(&self) -> Result<Vec<String>, DeviceError>;

    async fn capture(&self, request: &CaptureRequest) -> Result<(), DeviceError>;
}

/// Resolve a logical source against the device's capability list.
pub fn resolve_source(
    logical: &LogicalSource,
    available: &[String],
) -> Result<String, DeviceError> {
    let requested = logical.to_string();

    if let Some(exact) = available
        .iter()
        .find(|s| s.eq_ignore_ascii_case(&requested))
    {
        return Ok(exact.clone());
    }

    let rule_key = match logical {
        LogicalSource::Auto => Some("auto"),
        LogicalSource::Adf => Some("adf"),
        LogicalSource::Flatbed => Some("flatbed"),
        LogicalSource::Named(_) => None,
    };

    let patterns = rule_key.and_then(|key| {
        SOURCE_RULES
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, patterns)| *patterns)
    });

    if let Some(patterns) = patterns {
        for pattern in patterns {
            if let Some(hit) = available
                .iter()
                .find(|s| s.to_ascii_lowercase().contains(pattern))
            {
                return Ok(hit.clone());
            }
        }
    }

    Err(DeviceError::SourceUnsupported {
        requested,
        available: available.to_vec(),
    })
}

/// What a device reports about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescription {
    pub device: String,
    pub sources: Vec<String>,
}

impl DeviceDescription {
    /// Resolve against this capability list; `None` when it is empty.
    pub fn resolve(&self, logical: &LogicalSource) -> Result<Option<String>, DeviceError> {
        if self.sources.is_empty() {
            return Ok(None);
        }
        resolve_source(logical, &self.sources).map(Some)
    }
}

/// Backend-independent capture logic.
#[derive(Clone)]
pub struct DeviceController {
    device: Arc<dyn ScanDevice>,
}

impl DeviceController {
    pub fn new(device: Arc<dyn ScanDevice>) -> Self {
        Self { device }
    }

    pub fn describe(&self) -> String {
        self.device.describe()
    }

    pub async fn query_sources(&self) -> Result<Vec<String>, DeviceError> {
        self.device.query_sources().await
    }

    /// Device identifier plus its capability list.
    pub async fn describe_device(&self) -> Result<DeviceDescription, DeviceError> {
        let sources = self.device.query_sources().await?;
        debug!("Available sources: {:?}", sources);
        Ok(DeviceDescription {
            device: self.device.describe(),
            sources,
        })
    }

    /// Query the device and resolve `logical`.
    ///
    /// Returns `Ok(None)` when the device exposes no source option at all;
    /// capture then runs against the device default.
    pub async fn resolve(&self, logical: &LogicalSource) -> Result<Option<String>, DeviceError> {
        let description = self.describe_device().await?;
        let resolved = description.resolve(logical)?;
        match resolved {
            Some(ref concrete) => info!("Resolved source '{}' → '{}'", logical, concrete),
            None => info!(
                "Device reports no source option; using its default for '{}'",
                logical
            ),
        }
        Ok(resolved)
    }

    /// Run one batch capture and return the page files in capture order.
    ///
    /// An empty feeder yields an empty vector, not an error.
    pub async fn capture_batch(&self, request: &CaptureRequest) -> Result<Vec<PathBuf>, DeviceError> {
        info!(
            "Capturing: source={:?} {}dpi {} {} → {}",
            request.source,
            request.resolution,
            request.mode.as_sane(),
            request.format.as_sane(),
            request.output_dir.display()
        );

        match self.device.capture(request).await {
            Ok(()) => {}
            Err(DeviceError::NoMedia) => {
                info!("Feeder reported no media; nothing captured");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        }

        let pages = collect_pages(
            &request.output_dir,
            request.format,
            request.max_pages as usize,
        )
        .map_err(|e| DeviceError::DriverFault {
            detail: format!(
                "cannot list captured pages in '{}': {}",
                request.output_dir.display(),
                e
            ),
        })?;

        if pages.is_empty() {
            info!("Capture finished without producing pages");
        } else {
            info!("Captured {} pages", pages.len());
        }
        Ok(pages)
    }
}

static RE_PAGE_FILE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^page_(\d+)\.([A-Za-z]+)$").unwrap());

/// List `page_NNN.<ext>` files in numeric order, truncated to `max_pages`.
pub fn collect_pages(
    dir: &Path,
    format: ImageFormat,
    max_pages: usize,
) -> std::io::Result<Vec<PathBuf>> {
    let ext = format.extension();
    let mut numbered: Vec<(u64, PathBuf)> = Vec::new();

    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(caps) = RE_PAGE_FILE.captures(name) {
            if !caps[2].eq_ignore_ascii_case(ext) {
                continue;
            }
            if let Ok(n) = caps[1].parse::<u64>() {
                numbered.push((n, entry.path()));
            }
        }
    }

    numbered.sort_by_key(|(n, _)| *n);
    if numbered.len() > max_pages {
        warn!(
            "Device produced {} pages; keeping the first {} (max_pages)",
            numbered.len(),
            max_pages
        );
        numbered.truncate(max_pages);
    }
    Ok(numbered.into_iter().map(|(_, p)| p).collect())
}

// ── SANE backend ─────────────────────────────────────────────────────────

static RE_SOURCE_OPTION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^\s*--source\s+([^\[\n]+)").unwrap());

static RE_BUSY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)device\s+busy").unwrap());

static RE_END_OF_INPUT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(out of documents|no documents|feeder out|no more documents)").unwrap()
});

static RE_FAULT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)(error during device i/o|jammed|cover (is )?open|invalid argument|access to resource has been denied|out of memory)",
    )
    .unwrap()
});

/// Extract the source list from `scanimage -A` output.
///
/// Parses lines like `--source Flatbed|ADF Front|ADF Duplex [Flatbed]`.
pub fn parse_sources(options_text: &str) -> Vec<String> {
    RE_SOURCE_OPTION
        .captures(options_text)
        .map(|caps| {
            caps[1]
                .split('|')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// Interpret the exit status and diagnostics of a batch capture.
pub fn interpret_capture(
    exit_ok: bool,
    diagnostics: &str,
    pages_produced: usize,
) -> Result<(), DeviceError> {
    let detail = || first_line(diagnostics);

    if RE_BUSY.is_match(diagnostics) {
        return Err(DeviceError::Busy { detail: detail() });
    }
    if RE_FAULT.is_match(diagnostics) {
        return Err(DeviceError::DriverFault { detail: detail() });
    }

    let end_of_input = RE_END_OF_INPUT.is_match(diagnostics);
    if pages_produced == 0 && (end_of_input || exit_ok) {
        return Err(DeviceError::NoMedia);
    }
    if !exit_ok && !end_of_input {
        return Err(DeviceError::DriverFault {
            detail: if diagnostics.trim().is_empty() {
                "scanimage exited with a non-zero status".into()
            } else {
                detail()
            },
        });
    }
    Ok(())
}

fn first_line(text: &str) -> String {
    text.lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .unwrap_or("")
        .to_string()
}

/// [`ScanDevice`] backed by the SANE `scanimage` command.
#[derive(Debug, Clone)]
pub struct SaneDevice {
    device: String,
    program: String,
    query_timeout: Duration,
}

impl SaneDevice {
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            program: "scanimage".into(),
            query_timeout: Duration::from_secs(10),
        }
    }

    /// Build from configuration; the device identifier is required.
    pub fn from_config(config: &ScanConfig) -> Result<Self, ScanError> {
        if config.scanner.device.trim().is_empty() {
            return Err(ScanError::InvalidConfig(
                "scanner.device is not set\nList devices with `scanimage -L` and set scanner.device."
                    .into(),
            ));
        }
        Ok(Self::new(config.scanner.device.trim()))
    }

    /// Use a different executable (e.g. a wrapper script).
    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    /// Arguments for a batch capture, in invocation order.
    pub fn capture_args(&self, request: &CaptureRequest) -> Vec<String> {
        let mut args = vec![
            "-d".to_string(),
            self.device.clone(),
            "--resolution".to_string(),
            request.resolution.to_string(),
            "--mode".to_string(),
            request.mode.as_sane().to_string(),
        ];
        if let Some(ref source) = request.source {
            args.push("--source".to_string());
            args.push(source.clone());
        }
        args.push(format!("--format={}", request.format.as_sane()));
        args.push(format!("--batch={}", request.batch_pattern().display()));
        args.push(format!("--batch-count={}", request.max_pages));
        args
    }
}

#[async_trait]
impl ScanDevice for SaneDevice {
    fn describe(&self) -> String {
        self.device.clone()
    }

    async fn query_sources(&self) -> Result<Vec<String>, DeviceError> {
        let child = tokio::process::Command::new(&self.program)
            .args(["-d", &self.device, "-A"])
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.query_timeout, child)
            .await
            .map_err(|_| DeviceError::DriverFault {
                detail: format!(
                    "capability query timed out after {}s",
                    self.query_timeout.as_secs()
                ),
            })?
            .map_err(|e| DeviceError::DriverFault {
                detail: format!("failed to run {}: {}", self.program, e),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        if RE_BUSY.is_match(&stderr) {
            return Err(DeviceError::Busy {
                detail: first_line(&stderr),
            });
        }
        if !output.status.success() {
            return Err(DeviceError::DriverFault {
                detail: format!("capability query failed: {}", first_line(&stderr)),
            });
        }
        Ok(parse_sources(&stdout))
    }

    async fn capture(&self, request: &CaptureRequest) -> Result<(), DeviceError> {
        let args = self.capture_args(request);
        debug!("Scan command: {} {}", self.program, args.join(" "));

        let child = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(request.timeout, child)
            .await
            .map_err(|_| DeviceError::DriverFault {
                detail: format!("capture timed out after {}s", request.timeout.as_secs()),
            })?
            .map_err(|e| DeviceError::DriverFault {
                detail: format!("failed to run {}: {}", self.program, e),
            })?;

        let diagnostics = format!(
            "{}\n{}",
            String::from_utf8_lossy(&output.stderr),
            String::from_utf8_lossy(&output.stdout)
        );
        let produced = collect_pages(&request.output_dir, request.format, usize::MAX)
            .map(|p| p.len())
            .unwrap_or(0);

        debug!(
            "scanimage exited with {} after {} pages",
            output.status, produced
        );
        interpret_capture(output.status.success(), &diagnostics, produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn adf_prefers_duplex() {
        let available = caps(&["Flatbed", "ADF Front", "ADF Duplex"]);
        assert_eq!(
            resolve_source(&LogicalSource::Adf, &available).unwrap(),
            "ADF Duplex"
        );
    }

    #[test]
    fn adf_falls_back_to_front_then_any_adf() {
        let available = caps(&["Flatbed", "ADF Front", "ADF Back"]);
        assert_eq!(
            resolve_source(&LogicalSource::Adf, &available).unwrap(),
            "ADF Front"
        );
        let available = caps(&["Flatbed", "ADF Back"]);
        assert_eq!(
            resolve_source(&LogicalSource::Adf, &available).unwrap(),
            "ADF Back"
        );
    }

    #[test]
    fn adf_unsupported_on_flatbed_only_device() {
        let err = resolve_source(&LogicalSource::Adf, &caps(&["Flatbed"])).unwrap_err();
        assert_eq!(
            err,
            DeviceError::SourceUnsupported {
                requested: "ADF".into(),
                available: caps(&["Flatbed"]),
            }
        );
    }

    #[test]
    fn auto_order() {
        let all = caps(&["Flatbed", "ADF Front", "ADF Duplex"]);
        assert_eq!(resolve_source(&LogicalSource::Auto, &all).unwrap(), "ADF Duplex");
        let front = caps(&["Flatbed", "ADF Front"]);
        assert_eq!(resolve_source(&LogicalSource::Auto, &front).unwrap(), "ADF Front");
        let flat = caps(&["Flatbed"]);
        assert_eq!(resolve_source(&LogicalSource::Auto, &flat).unwrap(), "Flatbed");
        assert!(resolve_source(&LogicalSource::Auto, &caps(&["Transparency"])).is_err());
        // A plain feeder name is not on the Auto list.
        let plain = caps(&["Flatbed", "ADF"]);
        assert_eq!(resolve_source(&LogicalSource::Auto, &plain).unwrap(), "Flatbed");
    }

    #[test]
    fn exact_match_wins_case_insensitively() {
        let available = caps(&["Flatbed", "ADF Front", "ADF Duplex"]);
        let named = LogicalSource::Named("adf front".into());
        assert_eq!(resolve_source(&named, &available).unwrap(), "ADF Front");
        let adf_literal = caps(&["ADF", "ADF Duplex"]);
        assert_eq!(
            resolve_source(&LogicalSource::Adf, &adf_literal).unwrap(),
            "ADF"
        );
    }

    #[test]
    fn unknown_named_source_is_unsupported() {
        let named = LogicalSource::Named("Film".into());
        assert!(matches!(
            resolve_source(&named, &caps(&["Flatbed"])),
            Err(DeviceError::SourceUnsupported { .. })
        ));
    }

    #[test]
    fn empty_capability_list_uses_device_default() {
        let description = DeviceDescription {
            device: "test:0".into(),
            sources: Vec::new(),
        };
        assert_eq!(description.resolve(&LogicalSource::Adf), Ok(None));
        assert_eq!(
            description.resolve(&LogicalSource::Named("Film".into())),
            Ok(None)
        );
    }

    #[test]
    fn parse_scanimage_options() {
        let text = "All options specific to device `canon_dr:libusb:001:004':\n  Standard:\n    --source Flatbed|ADF Front|ADF Duplex [Flatbed]\n        Selects the scan source.\n    --mode Lineart|Gray|Color [Color]\n";
        assert_eq!(
            parse_sources(text),
            caps(&["Flatbed", "ADF Front", "ADF Duplex"])
        );
        assert!(parse_sources("    --mode Color [Color]\n").is_empty());
    }

    #[test]
    fn interpret_diagnostics() {
        assert_eq!(interpret_capture(true, "", 3), Ok(()));
        assert_eq!(
            interpret_capture(
                false,
                "scanimage: sane_start: Document feeder out of documents",
                0
            ),
            Err(DeviceError::NoMedia)
        );
        assert_eq!(
            interpret_capture(
                false,
                "scanimage: sane_start: Document feeder out of documents",
                4
            ),
            Ok(())
        );
        assert!(matches!(
            interpret_capture(false, "scanimage: open of device x failed: Device busy", 0),
            Err(DeviceError::Busy { .. })
        ));
        assert!(matches!(
            interpret_capture(true, "scanimage: sane_read: Error during device I/O", 2),
            Err(DeviceError::DriverFault { .. })
        ));
        assert!(matches!(
            interpret_capture(false, "", 0),
            Err(DeviceError::DriverFault { .. })
        ));
    }

    #[test]
    fn capture_args_use_jpg_extension_and_cap() {
        let dev = SaneDevice::new("test:0");
        let req = CaptureRequest {
            source: Some("ADF Duplex".into()),
            resolution: 300,
            mode: ColorMode::Gray,
            format: ImageFormat::Jpeg,
            output_dir: PathBuf::from("/tmp/job"),
            max_pages: 50,
            timeout: Duration::from_secs(60),
        };
        let args = dev.capture_args(&req);
        assert!(args.contains(&"--format=jpeg".to_string()));
        assert!(args.contains(&"--batch=/tmp/job/page_%03d.jpg".to_string()));
        assert!(args.contains(&"--batch-count=50".to_string()));
        let src = args.iter().position(|a| a == "--source").unwrap();
        assert_eq!(args[src + 1], "ADF Duplex");
        assert_eq!(req.page_path(7), PathBuf::from("/tmp/job/page_007.jpg"));
    }

    #[test]
    fn collect_pages_orders_numerically_and_caps() {
        let dir = tempfile::tempdir().unwrap();
        for name in ["page_010.png", "page_002.png", "page_001.png", "page_003.jpg", "notes.txt"] {
            std::fs::write(dir.path().join(name), b"x").unwrap();
        }
        let pages = collect_pages(dir.path(), ImageFormat::Png, 10).unwrap();
        let names: Vec<_> = pages
            .iter()
            .map(|p| p.file_name().unwrap().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["page_001.png", "page_002.png", "page_010.png"]);

        let capped = collect_pages(dir.path(), ImageFormat::Png, 2).unwrap();
        assert_eq!(capped.len(), 2);
    }

    #[test]
    fn from_config_requires_device() {
        assert!(SaneDevice::from_config(&ScanConfig::default()).is_err());
        let cfg = ScanConfig::builder().device("test:0").build().unwrap();
        assert_eq!(SaneDevice::from_config(&cfg).unwrap().describe(), "test:0");
    }
}
