// src/quality.rs
//
// Quality gate for biometric extraction: the crop must be large enough
// and in focus. Focus is the variance of the 4-neighbour Laplacian over
// the grayscale crop.

use crate::types::QualityConfig;
use image::{GrayImage, RgbImage};
use imageproc::filter::laplacian_filter;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum QualityVerdict {
    Pass { sharpness: f64 },
    TooSmall { width: u32, height: u32 },
    Blurry { sharpness: f64 },
}

impl QualityVerdict {
    pub fn passed(&self) -> bool {
        matches!(self, Self::Pass { .. })
    }
}

#[derive(Debug, Clone)]
pub struct QualityGate {
    min_size: u32,
    sharpness_threshold: f64,
}

impl QualityGate {
    pub fn new(config: &QualityConfig) -> Self {
        Self {
            min_size: config.min_crop_size,
            sharpness_threshold: config.sharpness_threshold,
        }
    }

    pub fn check(&self, crop: &RgbImage) -> QualityVerdict {
        let (width, height) = crop.dimensions();
        if width < self.min_size || height < self.min_size {
            return QualityVerdict::TooSmall { width, height };
        }

        let gray = image::imageops::grayscale(crop);
        let sharpness = laplacian_variance(&gray);
        if sharpness > self.sharpness_threshold {
            QualityVerdict::Pass { sharpness }
        } else {
            QualityVerdict::Blurry { sharpness }
        }
    }
}

/// Variance of the Laplacian response (kernel [0 1 0; 1 -4 1; 0 1 0]),
/// borders replicated. Returns 0 for empty images.
pub fn laplacian_variance(gray: &GrayImage) -> f64 {
    let (w, h) = gray.dimensions();
    if w == 0 || h == 0 {
        return 0.0;
    }

    let response = laplacian_filter(gray);
    let (sum, sum_sq) = response.pixels().fold((0.0, 0.0), |(sum, sum_sq), p| {
        let lap = p.0[0] as f64;
        (sum + lap, sum_sq + lap * lap)
    });

    let n = (w as u64 * h as u64) as f64;
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};

    fn checkerboard(size: u32, cell: u32) -> RgbImage {
        RgbImage::from_fn(size, size, |x, y| {
            if (x / cell + y / cell) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    #[test]
    fn test_flat_image_has_zero_variance() {
        let gray = GrayImage::from_pixel(32, 32, Luma([128]));
        assert_eq!(laplacian_variance(&gray), 0.0);
    }

    #[test]
    fn test_single_bright_pixel_response() {
        // One 255 pixel: responses are -1020 once and 255 four times.
        let mut gray = GrayImage::from_pixel(5, 5, Luma([0]));
        gray.put_pixel(2, 2, Luma([255]));
        let n = 25.0;
        let mean = (4.0 * 255.0 - 1020.0) / n;
        let expected = (1020.0f64.powi(2) + 4.0 * 255.0f64.powi(2)) / n - mean * mean;
        assert!((laplacian_variance(&gray) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_sharp_pattern_passes() {
        let gate = QualityGate::new(&QualityConfig::default());
        let verdict = gate.check(&checkerboard(64, 4));
        assert!(verdict.passed(), "got {:?}", verdict);
    }

    #[test]
    fn test_flat_crop_is_blurry() {
        let gate = QualityGate::new(&QualityConfig::default());
        let crop = RgbImage::from_pixel(64, 64, Rgb([90, 90, 90]));
        assert!(matches!(gate.check(&crop), QualityVerdict::Blurry { .. }));
    }

    #[test]
    fn test_small_crop_rejected_before_sharpness() {
        let gate = QualityGate::new(&QualityConfig::default());
        let verdict = gate.check(&checkerboard(30, 2));
        assert_eq!(
            verdict,
            QualityVerdict::TooSmall {
                width: 30,
                height: 30
            }
        );
    }
}
