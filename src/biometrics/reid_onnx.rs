// src/biometrics/reid_onnx.rs
//
// Person re-identification embedding (OSNet-style, 256x128 input with
// ImageNet normalisation) for the appearance fallback.

use super::{AppearanceSignatureProvider, ExtractionFailure};
use crate::identity::Signature;
use crate::preprocessing::{preprocess, Normalization};
use crate::types::ReidModelConfig;
use anyhow::{Context, Result};
use image::RgbImage;
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::sync::{Mutex, PoisonError};
use tracing::info;

pub struct OnnxAppearanceProvider {
    session: Mutex<Session>,
    input_width: usize,
    input_height: usize,
}

impl OnnxAppearanceProvider {
    pub fn new(config: &ReidModelConfig) -> Result<Self> {
        info!("Loading re-id model: {}", config.path);
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(config.num_threads)?
            .commit_from_file(&config.path)
            .with_context(|| format!("Failed to load re-id model {}", config.path))?;
        info!(
            "✓ Re-id provider initialized ({}x{})",
            config.input_width, config.input_height
        );

        Ok(Self {
            session: Mutex::new(session),
            input_width: config.input_width,
            input_height: config.input_height,
        })
    }

    fn embed(&self, crop: &RgbImage) -> Result<Signature> {
        let input = preprocess(crop, self.input_width, self.input_height, Normalization::ImageNet);
        let shape = [1, 3, self.input_height, self.input_width];
        let value = ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let mut session = self.session.lock().unwrap_or_else(PoisonError::into_inner);
        let outputs = session.run(ort::inputs![value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok(Signature::normalized(data.to_vec()))
    }
}

impl AppearanceSignatureProvider for OnnxAppearanceProvider {
    fn extract_appearance_signature(
        &self,
        crop: &RgbImage,
    ) -> Result<Signature, ExtractionFailure> {
        if crop.width() == 0 || crop.height() == 0 {
            return Err(ExtractionFailure::EmptyCrop);
        }
        let signature = self.embed(crop)?;
        if signature.is_empty() {
            return Err(ExtractionFailure::Provider("empty embedding".to_string()));
        }
        Ok(signature)
    }

    fn name(&self) -> &str {
        "onnx_reid"
    }
}
