use image::imageops::FilterType;
use image::{DynamicImage, GrayImage, ImageDecoder, ImageReader};
use std::io::Cursor;
use thiserror::Error;

use crate::types::PreprocessStrategy;

#[derive(Debug, Error)]
pub enum PreprocessError {
    #[error("Failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to load image: {0}")]
    Load(#[from] image::ImageError),
    #[error("Failed to encode processed image: {0}")]
    Encode(String),
}

/// One pixel-level transform. The strategies below are fixed lists of these.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Step {
    /// Downscale so neither side exceeds this many pixels.
    Resize(u32),
    Grayscale,
    /// Percentile contrast stretch, e.g. (1.0, 99.0).
    Normalize { low_pct: f32, high_pct: f32 },
    /// Gaussian blur sigma.
    Denoise(f32),
    Sharpen { sigma: f32, threshold: i32 },
    /// `p * gain + offset`, clamped.
    Linear { gain: f32, offset: f32 },
    Gamma(f32),
    /// Hard binarization: `p >= level` becomes white.
    Threshold(u8),
}

const STANDARD: &[Step] = &[
    Step::Resize(1600),
    Step::Grayscale,
    Step::Normalize { low_pct: 1.0, high_pct: 99.0 },
    Step::Denoise(0.5),
    Step::Sharpen { sigma: 1.0, threshold: 1 },
    Step::Linear { gain: 1.2, offset: 0.0 },
];

const AGGRESSIVE: &[Step] = &[
    Step::Resize(1200),
    Step::Grayscale,
    Step::Normalize { low_pct: 5.0, high_pct: 95.0 },
    Step::Denoise(1.0),
    Step::Sharpen { sigma: 2.0, threshold: 0 },
    Step::Linear { gain: 1.5, offset: -20.0 },
    Step::Gamma(0.8),
];

const ADAPTIVE_THRESHOLD: &[Step] = &[
    Step::Resize(800),
    Step::Grayscale,
    Step::Normalize { low_pct: 1.0, high_pct: 99.0 },
    Step::Threshold(128),
    Step::Sharpen { sigma: 1.0, threshold: 0 },
];

/// The transform policy of a strategy, applied after auto-rotation.
pub fn steps(strategy: PreprocessStrategy) -> &'static [Step] {
    match strategy {
        PreprocessStrategy::Standard => STANDARD,
        PreprocessStrategy::Aggressive => AGGRESSIVE,
        PreprocessStrategy::AdaptiveThreshold => ADAPTIVE_THRESHOLD,
    }
}

/// Decode image bytes (JPEG / PNG / WEBP / …) and apply the EXIF orientation,
/// so phone photos taken sideways arrive upright.
pub fn load_oriented(data: &[u8]) -> Result<DynamicImage, PreprocessError> {
    let mut decoder = ImageReader::new(Cursor::new(data))
        .with_guessed_format()?
        .into_decoder()?;
    let orientation = decoder.orientation()?;
    let mut img = DynamicImage::from_decoder(decoder)?;
    img.apply_orientation(orientation);
    Ok(img)
}

/// Apply a strategy to an already-decoded image and return PNG bytes ready for OCR.
pub fn render(img: &DynamicImage, strategy: PreprocessStrategy) -> Result<Vec<u8>, PreprocessError> {
    encode_as_png(apply(img.clone(), steps(strategy)))
}

/// Decode, orient, and render in one go.
pub fn prepare_for_ocr_from_bytes(
    data: &[u8],
    strategy: PreprocessStrategy,
) -> Result<Vec<u8>, PreprocessError> {
    let img = load_oriented(data)?;
    encode_as_png(apply(img, steps(strategy)))
}

pub fn apply(img: DynamicImage, steps: &[Step]) -> DynamicImage {
    steps.iter().fold(img, |img, step| apply_step(img, *step))
}

fn apply_step(img: DynamicImage, step: Step) -> DynamicImage {
    match step {
        Step::Resize(max) => {
            if img.width() > max || img.height() > max {
                img.resize(max, max, FilterType::Lanczos3)
            } else {
                img
            }
        }
        Step::Grayscale => DynamicImage::ImageLuma8(img.to_luma8()),
        Step::Normalize { low_pct, high_pct } => {
            DynamicImage::ImageLuma8(normalize(img.to_luma8(), low_pct, high_pct))
        }
        Step::Denoise(sigma) => img.blur(sigma),
        Step::Sharpen { sigma, threshold } => img.unsharpen(sigma, threshold),
        Step::Linear { gain, offset } => map_luma(img, |p| p * gain + offset),
        Step::Gamma(gamma) => map_luma(img, |p| 255.0 * (p / 255.0).powf(gamma)),
        Step::Threshold(level) => {
            let level = level as f32;
            map_luma(img, |p| if p >= level { 255.0 } else { 0.0 })
        }
    }
}

fn map_luma(img: DynamicImage, f: impl Fn(f32) -> f32) -> DynamicImage {
    let mut gray = img.to_luma8();
    for p in gray.pixels_mut() {
        p[0] = f(p[0] as f32).round().clamp(0.0, 255.0) as u8;
    }
    DynamicImage::ImageLuma8(gray)
}

/// Stretch the `low_pct`..`high_pct` percentile band to the full 0..255 range.
fn normalize(gray: GrayImage, low_pct: f32, high_pct: f32) -> GrayImage {
    let total = gray.pixels().len();
    if total == 0 {
        return gray;
    }

    let mut histogram = [0usize; 256];
    for p in gray.pixels() {
        histogram[p[0] as usize] += 1;
    }
    let low = percentile(&histogram, total, low_pct);
    let high = percentile(&histogram, total, high_pct);

    if high <= low {
        // Uniform image, nothing to stretch.
        return gray;
    }

    let range = (high - low) as f32;
    let mut out = gray;
    for p in out.pixels_mut() {
        let v = (p[0].clamp(low, high) - low) as f32 * 255.0 / range;
        p[0] = v.round() as u8;
    }
    out
}

fn percentile(histogram: &[usize; 256], total: usize, pct: f32) -> u8 {
    let target = (((pct / 100.0) * total as f32).floor() as usize).min(total - 1);
    let mut seen = 0usize;
    for (value, count) in histogram.iter().enumerate() {
        seen += count;
        if seen > target {
            return value as u8;
        }
    }
    255
}

fn encode_as_png(img: DynamicImage) -> Result<Vec<u8>, PreprocessError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)
        .map_err(|e| PreprocessError::Encode(e.to_string()))?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma, Rgb, RgbImage};

    fn solid_gray(width: u32, height: u32, value: u8) -> DynamicImage {
        let img: GrayImage = ImageBuffer::from_fn(width, height, |_, _| Luma([value]));
        DynamicImage::ImageLuma8(img)
    }

    fn gradient_gray(width: u32, height: u32) -> DynamicImage {
        let img: GrayImage =
            ImageBuffer::from_fn(width, height, |x, _| Luma([(x * 255 / (width - 1)) as u8]));
        DynamicImage::ImageLuma8(img)
    }

    fn png_bytes(img: &DynamicImage) -> Vec<u8> {
        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png).unwrap();
        buf
    }

    #[test]
    fn normalize_uniform_image_is_unchanged() {
        let out = normalize(solid_gray(10, 10, 128).to_luma8(), 1.0, 99.0);
        assert!(out.pixels().all(|p| p[0] == 128));
    }

    #[test]
    fn normalize_stretches_narrow_band_to_full_range() {
        let img: GrayImage = ImageBuffer::from_fn(100, 1, |x, _| Luma([100 + (x / 2) as u8]));
        let out = normalize(img, 0.0, 100.0);
        let min = out.pixels().map(|p| p[0]).min().unwrap();
        let max = out.pixels().map(|p| p[0]).max().unwrap();
        assert_eq!(min, 0);
        assert_eq!(max, 255);
    }

    #[test]
    fn threshold_produces_binary_image() {
        let out = apply(gradient_gray(256, 2), &[Step::Threshold(128)]).to_luma8();
        assert!(out.pixels().all(|p| p[0] == 0 || p[0] == 255));
        assert_eq!(out.get_pixel(0, 0)[0], 0);
        assert_eq!(out.get_pixel(255, 0)[0], 255);
    }

    #[test]
    fn linear_and_gamma_clamp() {
        let out = apply(solid_gray(2, 2, 200), &[Step::Linear { gain: 1.5, offset: -20.0 }]);
        assert_eq!(out.to_luma8().get_pixel(0, 0)[0], 255);
        let out = apply(solid_gray(2, 2, 10), &[Step::Linear { gain: 1.5, offset: -20.0 }]);
        assert_eq!(out.to_luma8().get_pixel(0, 0)[0], 0);
        let out = apply(solid_gray(2, 2, 64), &[Step::Gamma(0.8)]);
        assert!(out.to_luma8().get_pixel(0, 0)[0] > 64);
    }

    #[test]
    fn strategies_shrink_progressively() {
        let big: RgbImage = ImageBuffer::from_fn(2000, 20, |x, _| Rgb([(x % 256) as u8, 0, 0]));
        let big = DynamicImage::ImageRgb8(big);
        let widths: Vec<u32> = PreprocessStrategy::LADDER
            .iter()
            .map(|s| apply(big.clone(), steps(*s)).width())
            .collect();
        assert_eq!(widths, vec![1600, 1200, 800]);
    }

    #[test]
    fn small_images_are_not_upscaled() {
        let out = apply(solid_gray(300, 200, 90), steps(PreprocessStrategy::Standard));
        assert_eq!((out.width(), out.height()), (300, 200));
    }

    #[test]
    fn every_strategy_outputs_grayscale_png() {
        let data = png_bytes(&gradient_gray(64, 32));
        for strategy in PreprocessStrategy::LADDER {
            let out = prepare_for_ocr_from_bytes(&data, strategy).unwrap();
            // PNG magic bytes: 0x89 0x50 0x4E 0x47
            assert_eq!(&out[..4], b"\x89PNG");
            let decoded = image::load_from_memory(&out).unwrap();
            assert_eq!(decoded.color(), image::ColorType::L8);
        }
    }

    #[test]
    fn garbage_bytes_fail_to_load() {
        assert!(load_oriented(b"definitely not an image").is_err());
    }
}
