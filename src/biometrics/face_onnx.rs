// src/biometrics/face_onnx.rs
//
// Two-stage face signature: an UltraFace-style detector (320x240, outputs
// scores [1, N, 2] and boxes [1, N, 4] in normalised coordinates) finds the
// best face in the person crop, then an embedder turns the face into an
// L2-normalised vector.

use super::{ExtractionFailure, FaceSignatureProvider};
use crate::identity::Signature;
use crate::preprocessing::{preprocess, Normalization};
use crate::types::FaceModelConfig;
use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, info};

const DETECTOR_WIDTH: usize = 320;
const DETECTOR_HEIGHT: usize = 240;

#[derive(Debug, Clone, Copy, PartialEq)]
struct FaceCandidate {
    score: f32,
    /// normalised [x1, y1, x2, y2]
    bbox: [f32; 4],
}

pub struct OnnxFaceProvider {
    detector: Mutex<Session>,
    embedder: Mutex<Session>,
    embed_size: usize,
    detection_floor: f32,
    min_detection_confidence: f32,
}

fn load_session(path: &str, threads: usize) -> Result<Session> {
    Session::builder()?
        .with_optimization_level(GraphOptimizationLevel::Level3)?
        .with_intra_threads(threads)?
        .commit_from_file(path)
        .with_context(|| format!("Failed to load model {}", path))
}

impl OnnxFaceProvider {
    pub fn new(config: &FaceModelConfig) -> Result<Self> {
        info!("Loading face detector: {}", config.detector_path);
        let detector = load_session(&config.detector_path, config.num_threads)?;
        info!("Loading face embedder: {}", config.embedder_path);
        let embedder = load_session(&config.embedder_path, config.num_threads)?;
        info!("✓ Face provider initialized (embed {}px)", config.embed_size);

        Ok(Self {
            detector: Mutex::new(detector),
            embedder: Mutex::new(embedder),
            embed_size: config.embed_size as usize,
            detection_floor: config.detection_floor,
            min_detection_confidence: config.min_detection_confidence,
        })
    }

    fn detect(&self, crop: &RgbImage) -> Result<Option<FaceCandidate>> {
        let input = preprocess(crop, DETECTOR_WIDTH, DETECTOR_HEIGHT, Normalization::Symmetric);
        let shape = [1, 3, DETECTOR_HEIGHT, DETECTOR_WIDTH];
        let value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self.detector.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![value])?;
        let (_, scores) = outputs[0].try_extract_tensor::<f32>()?;
        let (_, boxes) = outputs[1].try_extract_tensor::<f32>()?;
        Ok(best_candidate(scores, boxes, self.detection_floor))
    }

    fn embed(&self, face: &RgbImage) -> Result<Signature> {
        let input = preprocess(face, self.embed_size, self.embed_size, Normalization::Symmetric);
        let shape = [1, 3, self.embed_size, self.embed_size];
        let value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self.embedder.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(Signature::normalized(data.to_vec()))
    }
}

/// Highest face-class score at or above `floor`, if any.
fn best_candidate(scores: &[f32], boxes: &[f32], floor: f32) -> Option<FaceCandidate> {
    let n = (scores.len() / 2).min(boxes.len() / 4);
    let mut best: Option<FaceCandidate> = None;
    for i in 0..n {
        let score = scores[i * 2 + 1];
        if score < floor {
            continue;
        }
        if best.map_or(true, |b| score > b.score) {
            best = Some(FaceCandidate {
                score,
                bbox: [boxes[i * 4], boxes[i * 4 + 1], boxes[i * 4 + 2], boxes[i * 4 + 3]],
            });
        }
    }
    best
}

/// Cut the normalised face box out of the crop; None when it is empty.
fn crop_face(crop: &RgbImage, bbox: [f32; 4]) -> Option<RgbImage> {
    let (w, h) = (crop.width() as f32, crop.height() as f32);
    let x1 = (bbox[0].clamp(0.0, 1.0) * w) as u32;
    let y1 = (bbox[1].clamp(0.0, 1.0) * h) as u32;
    let x2 = (bbox[2].clamp(0.0, 1.0) * w).ceil() as u32;
    let y2 = (bbox[3].clamp(0.0, 1.0) * h).ceil() as u32;
    if x2 <= x1 || y2 <= y1 {
        return None;
    }
    Some(image::imageops::crop_imm(crop, x1, y1, x2 - x1, y2 - y1).to_image())
}

impl FaceSignatureProvider for OnnxFaceProvider {
    fn extract_face_signature(&self, crop: &RgbImage) -> Result<Signature, ExtractionFailure> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ExtractionFailure::EmptyCrop);
        }

        let Some(candidate) = self.detect(crop)? else {
            return Err(ExtractionFailure::NoFaceFound);
        };
        if candidate.score < self.min_detection_confidence {
            debug!("Face candidate {:.2} below minimum", candidate.score);
            return Err(ExtractionFailure::LowConfidence {
                score: candidate.score,
            });
        }

        let face = crop_face(crop, candidate.bbox).ok_or(ExtractionFailure::NoFaceFound)?;
        Ok(self.embed(&face)?)
    }

    fn name(&self) -> &str {
        "onnx_face"
    }
}
