// src/biometrics/appearance.rs
//
// Colour-histogram appearance signature. Crop is resized to a fixed
// 64x128 window, converted to HSV on OpenCV ranges (H in [0, 180),
// S and V in [0, 256)), binned 8x8x8 and L2-normalised.

use super::{AppearanceSignatureProvider, ExtractionFailure};
use crate::identity::Signature;
use crate::preprocessing::resize;
use image::RgbImage;

const WINDOW_W: u32 = 64;
const WINDOW_H: u32 = 128;
const BINS: usize = 8;

#[derive(Debug, Clone)]
pub struct HistogramAppearance {
    width: u32,
    height: u32,
}

impl Default for HistogramAppearance {
    fn default() -> Self {
        Self {
            width: WINDOW_W,
            height: WINDOW_H,
        }
    }
}

impl HistogramAppearance {
    pub fn dimensions() -> usize {
        BINS * BINS * BINS
    }
}

impl AppearanceSignatureProvider for HistogramAppearance {
    fn extract_appearance_signature(
        &self,
        crop: &RgbImage,
    ) -> Result<Signature, ExtractionFailure> {
        let (w, h) = crop.dimensions();
        if w == 0 || h == 0 {
            return Err(ExtractionFailure::EmptyCrop);
        }

        let resized = resize(crop, self.width, self.height);

        let mut hist = vec![0.0f32; BINS * BINS * BINS];
        for px in resized.as_raw().chunks_exact(3) {
            let (hue, sat, val) = rgb_to_hsv_cv(px[0], px[1], px[2]);
            let hb = (hue as usize * BINS / 180).min(BINS - 1);
            let sb = sat as usize * BINS / 256;
            let vb = val as usize * BINS / 256;
            hist[(hb * BINS + sb) * BINS + vb] += 1.0;
        }

        Ok(Signature::normalized(hist))
    }

    fn name(&self) -> &str {
        "histogram"
    }
}

/// 8-bit HSV with OpenCV conventions: H in [0, 180), S and V in [0, 255].
fn rgb_to_hsv_cv(r: u8, g: u8, b: u8) -> (u8, u8, u8) {
    let (r, g, b) = (r as f32, g as f32, b as f32);
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    let delta = max - min;

    let v = max;
    let s = if max > 0.0 { delta / max * 255.0 } else { 0.0 };

    let mut hue = if delta <= 0.0 {
        0.0
    } else if max == r {
        60.0 * (g - b) / delta
    } else if max == g {
        120.0 + 60.0 * (b - r) / delta
    } else {
        240.0 + 60.0 * (r - g) / delta
    };
    if hue < 0.0 {
        hue += 360.0;
    }

    let h = ((hue / 2.0).round() as u32 % 180) as u8;
    (h, s.round() as u8, v.round() as u8)
}
