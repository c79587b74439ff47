// src/biometrics/mod.rs
//
// Biometric providers: crop in, signature out. Every failure carries its
// reason so "no face in the crop" and "model crashed" stay distinguishable.

pub mod appearance;
#[cfg(feature = "onnx")]
pub mod face_onnx;
#[cfg(feature = "onnx")]
pub mod reid_onnx;

pub use appearance::HistogramAppearance;
#[cfg(feature = "onnx")]
pub use face_onnx::OnnxFaceProvider;
#[cfg(feature = "onnx")]
pub use reid_onnx::OnnxAppearanceProvider;

use crate::identity::Signature;
use crate::types::ModelConfig;
use anyhow::Result;
use image::RgbImage;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExtractionFailure {
    /// Zero-sized or otherwise degenerate input
    #[error("empty crop")]
    EmptyCrop,
    #[error("no face found")]
    NoFaceFound,
    /// Best face candidate scored below the configured minimum
    #[error("face confidence too low ({score:.2})")]
    LowConfidence { score: f32 },
    /// No provider configured for this signature kind
    #[error("provider unavailable")]
    Unavailable,
    #[error("provider error: {0}")]
    Provider(String),
}

impl From<anyhow::Error> for ExtractionFailure {
    fn from(e: anyhow::Error) -> Self {
        Self::Provider(format!("{:#}", e))
    }
}

pub trait FaceSignatureProvider: Send + Sync {
    fn extract_face_signature(&self, crop: &RgbImage) -> Result<Signature, ExtractionFailure>;

    fn name(&self) -> &str;
}

pub trait AppearanceSignatureProvider: Send + Sync {
    /// Fails only on degenerate input or a provider fault.
    fn extract_appearance_signature(&self, crop: &RgbImage)
        -> Result<Signature, ExtractionFailure>;

    fn name(&self) -> &str;
}

/// Face provider for deployments without a face model. Tracks then
/// resolve by appearance once their patience runs out.
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledFaceProvider;

impl FaceSignatureProvider for DisabledFaceProvider {
    fn extract_face_signature(&self, _crop: &RgbImage) -> Result<Signature, ExtractionFailure> {
        Err(ExtractionFailure::Unavailable)
    }

    fn name(&self) -> &str {
        "disabled"
    }
}

pub fn build_face_provider(models: &ModelConfig) -> Result<Arc<dyn FaceSignatureProvider>> {
    match &models.face {
        #[cfg(feature = "onnx")]
        Some(face) => Ok(Arc::new(OnnxFaceProvider::new(face)?)),
        #[cfg(not(feature = "onnx"))]
        Some(face) => {
            tracing::warn!(
                "models.face ({}) configured but built without the `onnx` feature; face matching disabled",
                face.embedder_path
            );
            Ok(Arc::new(DisabledFaceProvider))
        }
        None => {
            info!("No face model configured; identities resolve by appearance");
            Ok(Arc::new(DisabledFaceProvider))
        }
    }
}

pub fn build_appearance_provider(
    models: &ModelConfig,
) -> Result<Arc<dyn AppearanceSignatureProvider>> {
    match &models.reid {
        #[cfg(feature = "onnx")]
        Some(reid) => Ok(Arc::new(OnnxAppearanceProvider::new(reid)?)),
        #[cfg(not(feature = "onnx"))]
        Some(reid) => {
            tracing::warn!(
                "models.reid ({}) configured but built without the `onnx` feature; using colour histograms",
                reid.path
            );
            Ok(Arc::new(HistogramAppearance::default()))
        }
        None => Ok(Arc::new(HistogramAppearance::default())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reasons_are_distinct() {
        assert_ne!(ExtractionFailure::NoFaceFound, ExtractionFailure::Unavailable);
        assert_eq!(
            ExtractionFailure::LowConfidence { score: 0.42 }.to_string(),
            "face confidence too low (0.42)"
        );
        let from_err: ExtractionFailure = anyhow::anyhow!("session run failed").into();
        assert_eq!(from_err.to_string(), "provider error: session run failed");
    }

    #[test]
    fn test_default_providers_without_models() {
        let models = ModelConfig::default();
        let face = build_face_provider(&models).unwrap();
        assert_eq!(face.name(), "disabled");
        assert_eq!(
            face.extract_face_signature(&RgbImage::new(64, 64)),
            Err(ExtractionFailure::Unavailable)
        );
        assert_eq!(build_appearance_provider(&models).unwrap().name(), "histogram");
    }
}
