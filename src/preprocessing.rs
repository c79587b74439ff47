// src/preprocessing.rs
//
// Pixel plumbing shared by the signature providers and the detector:
// triangle-filter resize, letterbox, and HWC u8 -> CHW f32 tensors.

use image::imageops::{self, FilterType};
use image::{Rgb, RgbImage};

/// Per-channel normalisation applied after scaling to [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Normalization {
    /// x / 255
    Unit,
    /// (x / 255 - mean) / std with ImageNet statistics
    ImageNet,
    /// (x - 127.5) / 128, the usual face-embedder convention
    Symmetric,
}

impl Normalization {
    fn apply(&self, value: u8, channel: usize) -> f32 {
        const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
        const STD: [f32; 3] = [0.229, 0.224, 0.225];
        match self {
            Self::Unit => value as f32 / 255.0,
            Self::ImageNet => (value as f32 / 255.0 - MEAN[channel]) / STD[channel],
            Self::Symmetric => (value as f32 - 127.5) / 128.0,
        }
    }
}

/// Resize an RGB image and convert it to a normalised CHW tensor.
pub fn preprocess(
    src: &RgbImage,
    dst_width: usize,
    dst_height: usize,
    norm: Normalization,
) -> Vec<f32> {
    let resized = resize(src, dst_width as u32, dst_height as u32);
    to_chw(resized.as_raw(), dst_width, dst_height, norm)
}

/// Triangle-filter resize. Empty sources give an all-black output.
pub fn resize(src: &RgbImage, width: u32, height: u32) -> RgbImage {
    if src.width() == 0 || src.height() == 0 {
        return RgbImage::new(width, height);
    }
    imageops::resize(src, width, height, FilterType::Triangle)
}

pub fn to_chw(hwc: &[u8], width: usize, height: usize, norm: Normalization) -> Vec<f32> {
    let mut output = vec![0.0f32; 3 * height * width];
    for c in 0..3 {
        for h in 0..height {
            for w in 0..width {
                let hwc_idx = (h * width + w) * 3 + c;
                let chw_idx = c * height * width + h * width + w;
                output[chw_idx] = norm.apply(hwc[hwc_idx], c);
            }
        }
    }
    output
}

/// Geometry of a letterboxed image: model coords = src * scale + pad.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Letterbox {
    pub scale: f32,
    pub pad_x: f32,
    pub pad_y: f32,
}

impl Letterbox {
    /// Map a model-space box back to source pixels.
    pub fn unmap(&self, b: [f32; 4]) -> [f32; 4] {
        [
            (b[0] - self.pad_x) / self.scale,
            (b[1] - self.pad_y) / self.scale,
            (b[2] - self.pad_x) / self.scale,
            (b[3] - self.pad_y) / self.scale,
        ]
    }
}

/// Fit the image inside a `target`x`target` gray (114) canvas, centred.
pub fn letterbox(src: &RgbImage, target: usize) -> (RgbImage, Letterbox) {
    let (src_w, src_h) = (src.width().max(1) as f32, src.height().max(1) as f32);
    let scale = (target as f32 / src_w).min(target as f32 / src_h);
    let scaled_w = ((src_w * scale).round() as usize).clamp(1, target);
    let scaled_h = ((src_h * scale).round() as usize).clamp(1, target);

    let pad_x = (target - scaled_w) as f32 / 2.0;
    let pad_y = (target - scaled_h) as f32 / 2.0;

    let resized = resize(src, scaled_w as u32, scaled_h as u32);
    let mut canvas = RgbImage::from_pixel(target as u32, target as u32, Rgb([114, 114, 114]));
    imageops::replace(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    (
        canvas,
        Letterbox {
            scale,
            pad_x,
            pad_y,
        },
    )
}
