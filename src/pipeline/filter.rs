//! Blank-page classification.
//!
//! A page is converted to luma and every pixel strictly darker than
//! `white_threshold` counts as non-white. The page is kept when
//!
//! ```text
//! non_white_pixels / total_pixels > blank_threshold
//! ```
//!
//! The rule is a fraction, so the same threshold works at any resolution,
//! and it is monotonic: a page with more ink is never dropped when a page
//! with less ink is kept.
//!
//! Classification fails open. A page that cannot be decoded, or decodes to
//! zero pixels, is kept and carries a [`FilterError`].

use crate::config::ProcessingSettings;
use crate::error::FilterError;
use crate::job::PageImage;
use image::DynamicImage;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Result of analysing one page.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Classification {
    pub non_white_fraction: f64,
    pub kept: bool,
}

/// Decision rule on a precomputed fraction.
pub fn is_content(non_white_fraction: f64, blank_threshold: f64) -> bool {
    non_white_fraction > blank_threshold
}

/// Classify a decoded image. `None` when it has no pixels.
pub fn classify_image(
    img: &DynamicImage,
    white_threshold: u8,
    blank_threshold: f64,
) -> Option<Classification> {
    let luma = img.to_luma8();
    let total = luma.as_raw().len();
    if total == 0 {
        return None;
    }
    let non_white = luma.as_raw().iter().filter(|&&v| v < white_threshold).count();
    let fraction = non_white as f64 / total as f64;
    Some(Classification {
        non_white_fraction: fraction,
        kept: is_content(fraction, blank_threshold),
    })
}

fn decode(index: usize, path: &Path) -> Result<DynamicImage, FilterError> {
    let img = image::open(path).map_err(|e| FilterError::UnreadableImage {
        index,
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    if img.width() == 0 || img.height() == 0 {
        return Err(FilterError::UnreadableImage {
            index,
            path: path.to_path_buf(),
            detail: "image has zero size".into(),
        });
    }
    Ok(img)
}

/// Decode and classify one page file.
pub fn classify_file(
    index: usize,
    path: &Path,
    settings: &ProcessingSettings,
) -> Result<Classification, FilterError> {
    let img = decode(index, path)?;
    classify_image(&img, settings.white_threshold, settings.blank_threshold).ok_or_else(|| {
        FilterError::UnreadableImage {
            index,
            path: path.to_path_buf(),
            detail: "image has zero size".into(),
        }
    })
}

/// Detailed report for threshold tuning.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PageInspection {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub mean_luma: f64,
    pub non_white_fraction: f64,
    pub kept: bool,
}

/// Inspect an image file with the given thresholds.
pub fn inspect_page(path: &Path, settings: &ProcessingSettings) -> Result<PageInspection, FilterError> {
    let img = decode(0, path)?;
    let luma = img.to_luma8();
    let total = luma.as_raw().len();
    let sum: u64 = luma.as_raw().iter().map(|&v| v as u64).sum();
    let class = classify_image(&img, settings.white_threshold, settings.blank_threshold)
        .ok_or_else(|| FilterError::UnreadableImage {
            index: 0,
            path: path.to_path_buf(),
            detail: "image has zero size".into(),
        })?;
    Ok(PageInspection {
        path: path.to_path_buf(),
        width: img.width(),
        height: img.height(),
        mean_luma: sum as f64 / total as f64,
        non_white_fraction: class.non_white_fraction,
        kept: class.kept,
    })
}

/// Build the page list for a job, classifying each page when `skip_blank`
/// is set.
///
/// Output order equals input order. Classification runs on the blocking
/// pool, one page at a time.
pub async fn filter_pages(
    paths: &[PathBuf],
    skip_blank: bool,
    settings: &ProcessingSettings,
) -> Vec<PageImage> {
    let mut pages = Vec::with_capacity(paths.len());

    for (i, path) in paths.iter().enumerate() {
        let index = i + 1;
        let bytes = tokio::fs::metadata(path).await.map(|m| m.len()).unwrap_or(0);

        let mut page = PageImage {
            index,
            path: path.clone(),
            bytes,
            non_white_fraction: None,
            filter_error: None,
            kept: true,
        };

        if skip_blank {
            let task_path = path.clone();
            let task_settings = settings.clone();
            let outcome = tokio::task::spawn_blocking(move || {
                classify_file(index, &task_path, &task_settings)
            })
            .await
            .unwrap_or_else(|join| {
                Err(FilterError::UnreadableImage {
                    index,
                    path: path.clone(),
                    detail: format!("classification task failed: {}", join),
                })
            });

            match outcome {
                Ok(class) => {
                    page.non_white_fraction = Some(class.non_white_fraction);
                    page.kept = class.kept;
                    debug!(
                        "Page {}: non-white {:.4} → {}",
                        index,
                        class.non_white_fraction,
                        if class.kept { "kept" } else { "blank" }
                    );
                }
                Err(e) => {
                    warn!("{} (page kept)", e);
                    page.filter_error = Some(e);
                }
            }
        }

        pages.push(page);
    }

    pages
}
