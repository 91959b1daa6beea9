//! Post-capture colour correction.
//!
//! Some ADF drivers hand back BGR data labelled as RGB, or rotate the
//! channels on duplex backs. [`ColorCorrection`] reorders the channels of
//! every captured page once, in place, before the page filter sees it.
//!
//! The rewrite is atomic: the corrected image goes to a temp file in the same
//! directory and is renamed over the original. Lossless formats stay
//! lossless; JPEG is re-encoded at `upload.image_quality`.

use crate::config::{ColorCorrection, ImageFormat};
use crate::error::FilterError;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Output channel `i` takes input channel `order[i]`. `None` for identity.
pub fn channel_order(correction: ColorCorrection) -> Option<[usize; 3]> {
    match correction {
        ColorCorrection::None => None,
        ColorCorrection::SwapRb | ColorCorrection::BgrToRgb => Some([2, 1, 0]),
        ColorCorrection::SwapRg => Some([1, 0, 2]),
        ColorCorrection::SwapGb => Some([0, 2, 1]),
        ColorCorrection::RotateLeft => Some([1, 2, 0]),
        ColorCorrection::RotateRight => Some([2, 0, 1]),
    }
}

fn permute<T: Copy>(samples: &mut [T], stride: usize, order: [usize; 3]) {
    for px in samples.chunks_exact_mut(stride) {
        let src = [px[0], px[1], px[2]];
        px[0] = src[order[0]];
        px[1] = src[order[1]];
        px[2] = src[order[2]];
    }
}

/// Reorder the colour channels of `img` in place.
///
/// Returns `false` (and leaves the image alone) for identity corrections and
/// for grayscale images.
pub fn apply_correction(img: &mut DynamicImage, correction: ColorCorrection) -> bool {
    let Some(order) = channel_order(correction) else {
        return false;
    };
    match img {
        DynamicImage::ImageRgb8(buf) => permute(buf, 3, order),
        DynamicImage::ImageRgba8(buf) => permute(buf, 4, order),
        DynamicImage::ImageRgb16(buf) => permute(buf, 3, order),
        DynamicImage::ImageRgba16(buf) => permute(buf, 4, order),
        DynamicImage::ImageRgb32F(buf) => permute(buf, 3, order),
        DynamicImage::ImageRgba32F(buf) => permute(buf, 4, order),
        _ => return false,
    }
    true
}

/// Decode, correct and atomically rewrite one page file.
///
/// Returns whether the file was rewritten.
pub fn correct_page(
    index: usize,
    path: &Path,
    format: ImageFormat,
    correction: ColorCorrection,
    jpeg_quality: u8,
) -> Result<bool, FilterError> {
    if channel_order(correction).is_none() {
        return Ok(false);
    }

    let mut img = image::open(path).map_err(|e| FilterError::UnreadableImage {
        index,
        path: path.to_path_buf(),
        detail: format!("cannot decode for colour correction: {}", e),
    })?;

    if !apply_correction(&mut img, correction) {
        debug!("Page {}: grayscale, colour correction skipped", index);
        return Ok(false);
    }

    write_atomic(path, &img, format, jpeg_quality).map_err(|detail| {
        FilterError::RewriteFailed {
            index,
            path: path.to_path_buf(),
            detail,
        }
    })?;
    Ok(true)
}

fn write_atomic(
    path: &Path,
    img: &DynamicImage,
    format: ImageFormat,
    jpeg_quality: u8,
) -> Result<(), String> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| e.to_string())?;

    {
        let mut writer = BufWriter::new(tmp.as_file_mut());
        match format {
            ImageFormat::Jpeg => {
                let encoder = JpegEncoder::new_with_quality(&mut writer, jpeg_quality);
                DynamicImage::ImageRgb8(img.to_rgb8())
                    .write_with_encoder(encoder)
                    .map_err(|e| e.to_string())?;
            }
            ImageFormat::Png => img
                .write_to(&mut writer, image::ImageFormat::Png)
                .map_err(|e| e.to_string())?,
            ImageFormat::Tiff => img
                .write_to(&mut writer, image::ImageFormat::Tiff)
                .map_err(|e| e.to_string())?,
        }
        writer.flush().map_err(|e| e.to_string())?;
    }

    tmp.persist(path).map_err(|e| e.error.to_string())?;
    Ok(())
}

/// Correct every page on the blocking pool, in capture order.
///
/// Failures are page-local: the page is left as captured and the error is
/// returned alongside its index.
pub async fn correct_pages(
    pages: &[PathBuf],
    format: ImageFormat,
    correction: ColorCorrection,
    jpeg_quality: u8,
) -> Vec<(usize, FilterError)> {
    if channel_order(correction).is_none() {
        return Vec::new();
    }

    let mut failures = Vec::new();
    for (i, path) in pages.iter().enumerate() {
        let index = i + 1;
        let path = path.clone();
        let result = tokio::task::spawn_blocking(move || {
            correct_page(index, &path, format, correction, jpeg_quality)
        })
        .await;

        match result {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => {
                warn!("{}", e);
                failures.push((index, e));
            }
            Err(join) => {
                let e = FilterError::RewriteFailed {
                    index,
                    path: pages[i].clone(),
                    detail: format!("correction task failed: {}", join),
                };
                warn!("{}", e);
                failures.push((index, e));
            }
        }
    }
    debug!(
        "Colour correction {:?} applied to {} pages ({} failed)",
        correction,
        pages.len(),
        failures.len()
    );
    failures
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{GrayImage, Luma, Rgb, RgbImage};

    fn rgb(r: u8, g: u8, b: u8) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_pixel(2, 2, Rgb([r, g, b])))
    }

    fn first_pixel(img: &DynamicImage) -> [u8; 3] {
        img.to_rgb8().get_pixel(0, 0).0
    }

    #[test]
    fn channel_permutations() {
        let cases = [
            (ColorCorrection::SwapRb, [30, 20, 10]),
            (ColorCorrection::BgrToRgb, [30, 20, 10]),
            (ColorCorrection::SwapRg, [20, 10, 30]),
            (ColorCorrection::SwapGb, [10, 30, 20]),
            (ColorCorrection::RotateLeft, [20, 30, 10]),
            (ColorCorrection::RotateRight, [30, 10, 20]),
        ];
        for (correction, expected) in cases {
            let mut img = rgb(10, 20, 30);
            assert!(apply_correction(&mut img, correction));
            assert_eq!(first_pixel(&img), expected, "{:?}", correction);
        }
    }

    #[test]
    fn identity_and_grayscale_untouched() {
        let mut img = rgb(10, 20, 30);
        assert!(!apply_correction(&mut img, ColorCorrection::None));
        assert_eq!(first_pixel(&img), [10, 20, 30]);

        let mut gray = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([7])));
        assert!(!apply_correction(&mut gray, ColorCorrection::SwapRb));
    }

    #[test]
    fn png_rewrite_is_lossless() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page_001.png");
        rgb(1, 2, 3).save(&path).unwrap();

        let rewritten =
            correct_page(1, &path, ImageFormat::Png, ColorCorrection::SwapRb, 90).unwrap();
        assert!(rewritten);
        let back = image::open(&path).unwrap();
        assert_eq!(first_pixel(&back), [3, 2, 1]);

        // Only the page itself remains; the temp file was renamed over it.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn none_does_not_touch_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page_001.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert!(!correct_page(1, &path, ImageFormat::Png, ColorCorrection::None, 90).unwrap());
        assert_eq!(std::fs::read(&path).unwrap(), b"not an image");
    }

    #[test]
    fn unreadable_page_is_page_local_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("page_004.png");
        std::fs::write(&path, b"garbage").unwrap();
        let err = correct_page(4, &path, ImageFormat::Png, ColorCorrection::SwapRb, 90)
            .unwrap_err();
        assert!(matches!(err, FilterError::UnreadableImage { index: 4, .. }));
        assert_eq!(std::fs::read(&path).unwrap(), b"garbage");
    }

    #[test]
    fn jpeg_rewrite_reencodes_at_quality() {
        let dir = tempfile::tempdir().unwrap();
        let noisy = DynamicImage::ImageRgb8(RgbImage::from_fn(64, 64, |x, y| {
            Rgb([200, ((x * 7 + y * 13) % 256) as u8, ((x * y) % 64) as u8])
        }));
        let mut sizes = Vec::new();
        for quality in [95u8, 20] {
            let path = dir.path().join(format!("page_q{}.jpg", quality));
            let file = std::fs::File::create(&path).unwrap();
            noisy
                .write_with_encoder(JpegEncoder::new_with_quality(file, 95))
                .unwrap();

            assert!(
                correct_page(1, &path, ImageFormat::Jpeg, ColorCorrection::SwapRb, quality)
                    .unwrap()
            );
            assert_eq!(
                image::guess_format(&std::fs::read(&path).unwrap()).unwrap(),
                image::ImageFormat::Jpeg
            );
            let back = image::open(&path).unwrap().to_rgb8();
            // Red moved to blue; JPEG is lossy so allow some drift.
            let [r, _, b] = back.get_pixel(0, 0).0;
            assert!(b > 150, "blue channel {} after swap", b);
            assert!(r < 100, "red channel {} after swap", r);
            sizes.push(std::fs::metadata(&path).unwrap().len());
        }
        assert!(sizes[1] < sizes[0], "quality 20 should be smaller: {:?}", sizes);
    }

    #[tokio::test]
    async fn correct_pages_reports_failures_by_index() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("page_001.png");
        let bad = dir.path().join("page_002.png");
        rgb(9, 8, 7).save(&good).unwrap();
        std::fs::write(&bad, b"garbage").unwrap();

        let failures = correct_pages(
            &[good.clone(), bad],
            ImageFormat::Png,
            ColorCorrection::RotateRight,
            90,
        )
        .await;
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].0, 2);
        assert_eq!(first_pixel(&image::open(&good).unwrap()), [7, 9, 8]);
    }
}
