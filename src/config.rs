//! Configuration types for scan jobs.
//!
//! All pipeline behaviour is controlled through [`ScanConfig`], either built
//! in code via [`ScanConfigBuilder`] or loaded from a YAML file with
//! [`ScanConfig::load`]. The file is split into the same sections the struct
//! has (`scanner`, `api`, `storage`, `processing`, `upload`) and every field
//! has a default, so a file only needs the keys it wants to change:
//!
//! ```yaml
//! scanner:
//!   device: "canon_dr:libusb:001:004"
//!   source: ADF
//! api:
//!   url: https://docs.example.com
//!   workspace: office
//!   token: s3cret
//! ```

use crate::error::ScanError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info};

/// Environment variable naming an explicit configuration file.
pub const CONFIG_ENV_VAR: &str = "DOCSCAN_CONFIG";

/// Locations searched, in order, when no path is given and
/// [`CONFIG_ENV_VAR`] is unset.
pub const DEFAULT_CONFIG_PATHS: &[&str] = &["./config/config.yaml", "/etc/docscan/config.yaml"];

/// Complete configuration for the scan pipeline.
///
/// # Example
/// ```rust
/// use docscan::{ScanConfig, LogicalSource};
///
/// let config = ScanConfig::builder()
///     .device("canon_dr:libusb:001:004")
///     .source(LogicalSource::Adf)
///     .resolution(300)
///     .api_url("https://docs.example.com")
///     .build()
///     .unwrap();
/// assert_eq!(config.scanner.resolution, 300);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    pub scanner: ScannerSettings,
    pub api: ApiSettings,
    pub storage: StorageSettings,
    pub processing: ProcessingSettings,
    pub upload: UploadSettings,
}

/// Device and capture parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerSettings {
    /// SANE device identifier, e.g. `canon_dr:libusb:001:004`.
    pub device: String,
    /// Capture resolution in DPI. Default: 300.
    pub resolution: u32,
    /// Default: Color.
    pub mode: ColorMode,
    /// Default: Auto.
    pub source: LogicalSource,
    /// Default: png.
    pub format: ImageFormat,
    /// Channel-order fix applied to every captured page. Default: none.
    pub color_correction: ColorCorrection,
    /// Safety cap on pages per batch. Default: 200.
    ///
    /// Not every feeder reliably reports "empty"; the cap bounds the capture
    /// regardless.
    pub max_pages: u32,
    /// Wall-clock bound on one batch capture. Default: 300.
    pub capture_timeout_secs: u64,
}

impl Default for ScannerSettings {
    fn default() -> Self {
        Self {
            device: String::new(),
            resolution: 300,
            mode: ColorMode::default(),
            source: LogicalSource::default(),
            format: ImageFormat::default(),
            color_correction: ColorCorrection::default(),
            max_pages: 200,
            capture_timeout_secs: 300,
        }
    }
}

/// Document API endpoint and credentials.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiSettings {
    /// Base URL, without the workspace segment.
    pub url: String,
    pub workspace: String,
    /// Bearer token. Empty means no `Authorization` header.
    pub token: String,
    /// Upload request timeout. Default: 30.
    pub timeout_secs: u64,
    /// Timeout for the best-effort failure report. Default: 5.
    pub telemetry_timeout_secs: u64,
}

impl Default for ApiSettings {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".into(),
            workspace: "default".into(),
            token: String::new(),
            timeout_secs: 30,
            telemetry_timeout_secs: 5,
        }
    }
}

impl fmt::Debug for ApiSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSettings")
            .field("url", &self.url)
            .field("workspace", &self.workspace)
            .field("token", &redact(&self.token))
            .field("timeout_secs", &self.timeout_secs)
            .field("telemetry_timeout_secs", &self.telemetry_timeout_secs)
            .finish()
    }
}

/// Job storage roots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageSettings {
    /// Parent of per-job working directories.
    pub temp_dir: PathBuf,
    /// Parent of quarantined (failed) job directories. Never swept.
    pub failed_dir: PathBuf,
    /// Keep the job directory after a successful upload.
    pub keep_files: bool,
    /// Stale working directories older than this are removed. Default: 168.
    pub temp_retention_hours: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            temp_dir: PathBuf::from("/tmp/docscan"),
            failed_dir: PathBuf::from("/tmp/docscan/failed"),
            keep_files: false,
            temp_retention_hours: 168,
        }
    }
}

/// Blank-page classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    /// Drop pages classified as blank. Default: true.
    pub skip_blank: bool,
    /// A page is kept when its non-white fraction exceeds this. Default: 0.03.
    pub blank_threshold: f64,
    /// Luma strictly below this counts as non-white. Default: 250.
    pub white_threshold: u8,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            skip_blank: true,
            blank_threshold: 0.03,
            white_threshold: 250,
        }
    }
}

/// Upload payload shaping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSettings {
    /// Default: individual.
    pub compression: CompressionMode,
    /// Deflate level for the zip bundle, 0–9. Default: 6.
    pub zip_compression_level: u8,
    /// JPEG quality used when a colour correction re-encodes a page. Default: 90.
    pub image_quality: u8,
}

impl Default for UploadSettings {
    fn default() -> Self {
        Self {
            compression: CompressionMode::default(),
            zip_compression_level: 6,
            image_quality: 90,
        }
    }
}

impl ScanConfig {
    /// Create a new builder starting from defaults.
    pub fn builder() -> ScanConfigBuilder {
        ScanConfigBuilder {
            config: Self::default(),
        }
    }

    /// Parse and validate a YAML configuration file.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| ScanError::ConfigLoad {
            path: path.to_path_buf(),
            detail: e.to_string(),
        })?;
        Self::from_yaml_str(&text).map_err(|e| match e {
            ScanError::ConfigLoad { detail, .. } => ScanError::ConfigLoad {
                path: path.to_path_buf(),
                detail,
            },
            other => other,
        })
    }

    /// Parse and validate YAML text. An empty document yields the defaults.
    pub fn from_yaml_str(text: &str) -> Result<Self, ScanError> {
        let config: ScanConfig = if text.trim().is_empty() {
            ScanConfig::default()
        } else {
            serde_yaml::from_str(text).map_err(|e| ScanError::ConfigLoad {
                path: PathBuf::new(),
                detail: e.to_string(),
            })?
        };
        config.validate()?;
        Ok(config)
    }

    /// Resolve and load the configuration.
    ///
    /// An explicit path must exist. Otherwise `$DOCSCAN_CONFIG` and then
    /// [`DEFAULT_CONFIG_PATHS`] are tried; when none exists the defaults are
    /// returned.
    pub fn load(explicit: Option<&Path>) -> Result<Self, ScanError> {
        if let Some(path) = explicit {
            info!("Loading configuration from {}", path.display());
            return Self::from_yaml_file(path);
        }

        match Self::discover() {
            Some(path) => {
                info!("Loading configuration from {}", path.display());
                Self::from_yaml_file(&path)
            }
            None => {
                debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    fn discover() -> Option<PathBuf> {
        if let Ok(env_path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(env_path);
            if p.exists() {
                return Some(p);
            }
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|p| p.exists())
    }

    /// Check every cross-field and range constraint.
    pub fn validate(&self) -> Result<(), ScanError> {
        let s = &self.scanner;
        check_resolution("scanner.resolution", s.resolution)?;
        if s.max_pages == 0 {
            return Err(ScanError::InvalidConfig(
                "scanner.max_pages must be ≥ 1".into(),
            ));
        }
        if s.capture_timeout_secs == 0 {
            return Err(ScanError::InvalidConfig(
                "scanner.capture_timeout_secs must be ≥ 1; captures are always bounded".into(),
            ));
        }
        if self.api.timeout_secs == 0 || self.api.telemetry_timeout_secs == 0 {
            return Err(ScanError::InvalidConfig(
                "api timeouts must be ≥ 1 second; requests are always bounded".into(),
            ));
        }
        if self.api.url.trim().is_empty() {
            return Err(ScanError::InvalidConfig("api.url must not be empty".into()));
        }
        let p = &self.processing;
        if !(0.0..=1.0).contains(&p.blank_threshold) {
            return Err(ScanError::InvalidConfig(format!(
                "processing.blank_threshold must be 0.0–1.0, got {}",
                p.blank_threshold
            )));
        }
        if p.white_threshold == 0 {
            return Err(ScanError::InvalidConfig(
                "processing.white_threshold must be 1–255".into(),
            ));
        }
        let u = &self.upload;
        if !(1..=100).contains(&u.image_quality) {
            return Err(ScanError::InvalidConfig(format!(
                "upload.image_quality must be 1–100, got {}",
                u.image_quality
            )));
        }
        if u.zip_compression_level > 9 {
            return Err(ScanError::InvalidConfig(format!(
                "upload.zip_compression_level must be 0–9, got {}",
                u.zip_compression_level
            )));
        }
        Ok(())
    }

    /// A copy safe to print: the API token is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.api.token = redact(&self.api.token).to_string();
        copy
    }
}

fn redact(token: &str) -> &'static str {
    if token.is_empty() {
        ""
    } else {
        "<redacted>"
    }
}

/// Capture resolutions SANE backends accept in practice.
pub const RESOLUTION_RANGE: std::ops::RangeInclusive<u32> = 50..=1200;

/// Range check shared by the config and per-trigger overrides.
pub(crate) fn check_resolution(field: &str, dpi: u32) -> Result<(), ScanError> {
    if RESOLUTION_RANGE.contains(&dpi) {
        return Ok(());
    }
    Err(ScanError::InvalidConfig(format!(
        "{} must be {}–{} DPI, got {}",
        field,
        RESOLUTION_RANGE.start(),
        RESOLUTION_RANGE.end(),
        dpi
    )))
}

/// Builder for [`ScanConfig`].
#[derive(Debug)]
pub struct ScanConfigBuilder {
    config: ScanConfig,
}

impl ScanConfigBuilder {
    /// Start from an already-loaded configuration.
    pub fn from_config(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn device(mut self, device: impl Into<String>) -> Self {
        self.config.scanner.device = device.into();
        self
    }

    pub fn resolution(mut self, dpi: u32) -> Self {
        self.config.scanner.resolution = dpi;
        self
    }

    pub fn mode(mut self, mode: ColorMode) -> Self {
        self.config.scanner.mode = mode;
        self
    }

    pub fn source(mut self, source: LogicalSource) -> Self {
        self.config.scanner.source = source;
        self
    }

    pub fn format(mut self, format: ImageFormat) -> Self {
        self.config.scanner.format = format;
        self
    }

    pub fn color_correction(mut self, correction: ColorCorrection) -> Self {
        self.config.scanner.color_correction = correction;
        self
    }

    pub fn max_pages(mut self, n: u32) -> Self {
        self.config.scanner.max_pages = n;
        self
    }

    pub fn capture_timeout_secs(mut self, secs: u64) -> Self {
        self.config.scanner.capture_timeout_secs = secs;
        self
    }

    pub fn api_url(mut self, url: impl Into<String>) -> Self {
        self.config.api.url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn workspace(mut self, workspace: impl Into<String>) -> Self {
        self.config.api.workspace = workspace.into();
        self
    }

    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.config.api.token = token.into();
        self
    }

    pub fn api_timeout_secs(mut self, secs: u64) -> Self {
        self.config.api.timeout_secs = secs;
        self
    }

    pub fn temp_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.temp_dir = dir.into();
        self
    }

    pub fn failed_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.storage.failed_dir = dir.into();
        self
    }

    pub fn keep_files(mut self, v: bool) -> Self {
        self.config.storage.keep_files = v;
        self
    }

    pub fn skip_blank(mut self, v: bool) -> Self {
        self.config.processing.skip_blank = v;
        self
    }

    pub fn blank_threshold(mut self, fraction: f64) -> Self {
        self.config.processing.blank_threshold = fraction;
        self
    }

    pub fn white_threshold(mut self, luma: u8) -> Self {
        self.config.processing.white_threshold = luma;
        self
    }

    pub fn compression(mut self, mode: CompressionMode) -> Self {
        self.config.upload.compression = mode;
        self
    }

    pub fn image_quality(mut self, quality: u8) -> Self {
        self.config.upload.image_quality = quality.clamp(1, 100);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ScanConfig, ScanError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

// ── Enums ────────────────────────────────────────────────────────────────

/// Requested paper source, before it is matched against the device.
///
/// `Named` carries a device-specific string (e.g. `"ADF Front"`) that must
/// match a capability exactly.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum LogicalSource {
    #[default]
    Auto,
    Adf,
    Flatbed,
    Named(String),
}

impl From<String> for LogicalSource {
    fn from(s: String) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => LogicalSource::Auto,
            "adf" => LogicalSource::Adf,
            "flatbed" => LogicalSource::Flatbed,
            _ => LogicalSource::Named(s.trim().to_string()),
        }
    }
}

impl From<LogicalSource> for String {
    fn from(s: LogicalSource) -> Self {
        s.to_string()
    }
}

impl FromStr for LogicalSource {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(LogicalSource::from(s.to_string()))
    }
}

impl fmt::Display for LogicalSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogicalSource::Auto => f.write_str("Auto"),
            LogicalSource::Adf => f.write_str("ADF"),
            LogicalSource::Flatbed => f.write_str("Flatbed"),
            LogicalSource::Named(s) => f.write_str(s),
        }
    }
}

/// Scanner colour mode, passed verbatim as `--mode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ColorMode {
    #[default]
    Color,
    Gray,
    Lineart,
}

impl ColorMode {
    pub fn as_sane(&self) -> &'static str {
        match self {
            ColorMode::Color => "Color",
            ColorMode::Gray => "Gray",
            ColorMode::Lineart => "Lineart",
        }
    }
}

/// Output image format of the capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    #[default]
    Png,
    Jpeg,
    Tiff,
}

impl ImageFormat {
    /// Value for `scanimage --format=`.
    pub fn as_sane(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpeg",
            ImageFormat::Tiff => "tiff",
        }
    }

    /// File extension `scanimage` writes for this format.
    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Tiff => "tiff",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Tiff => "image/tiff",
        }
    }

    /// Whether re-encoding loses information.
    pub fn is_lossy(&self) -> bool {
        matches!(self, ImageFormat::Jpeg)
    }
}

/// Channel reordering applied after capture.
///
/// Some ADF drivers deliver BGR data labelled as RGB; these modes undo that
/// without touching pixel values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ColorCorrection {
    #[default]
    None,
    SwapRb,
    SwapRg,
    SwapGb,
    /// (r, g, b) → (g, b, r)
    RotateLeft,
    /// (r, g, b) → (b, r, g)
    RotateRight,
    BgrToRgb,
}

/// How pages are packed into the upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionMode {
    /// One multipart part per page. (default)
    #[default]
    Individual,
    /// Multi-page sets are bundled into a single zip part.
    Zip,
}
