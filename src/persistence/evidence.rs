// src/persistence/evidence.rs
//
// Evidence crops for human audit: the crop that created an identity and
// the crop at the moment a violation was logged.

use crate::types::StorageConfig;
use anyhow::{Context, Result};
use chrono::Utc;
use image::codecs::jpeg::JpegEncoder;
use image::RgbImage;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::PathBuf;
use std::sync::{Mutex, PoisonError};
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvidenceCategory {
    FaceRegistration,
    AppearanceRegistration,
    Violation,
}

impl EvidenceCategory {
    fn prefix(&self) -> &'static str {
        match self {
            Self::FaceRegistration => "face",
            Self::AppearanceRegistration => "appearance",
            Self::Violation => "violation",
        }
    }
}

pub trait EvidenceSink: Send + Sync {
    /// Store the crop and return a reference to it.
    fn save(&self, category: EvidenceCategory, track_id: u32, crop: &RgbImage) -> Result<String>;

    /// Remove evidence whose record was never persisted. Best effort.
    fn discard(&self, evidence_ref: &str);
}

/// JPEG files under the configured faces / alerts directories.
pub struct DiskEvidenceSink {
    faces_dir: PathBuf,
    alerts_dir: PathBuf,
    quality: u8,
}

impl DiskEvidenceSink {
    pub fn new(config: &StorageConfig) -> Result<Self> {
        let faces_dir = PathBuf::from(&config.faces_dir);
        let alerts_dir = PathBuf::from(&config.alerts_dir);
        for dir in [&faces_dir, &alerts_dir] {
            fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create evidence dir {}", dir.display()))?;
        }
        Ok(Self {
            faces_dir,
            alerts_dir,
            quality: config.jpeg_quality.clamp(1, 100),
        })
    }
}

impl EvidenceSink for DiskEvidenceSink {
    fn save(&self, category: EvidenceCategory, track_id: u32, crop: &RgbImage) -> Result<String> {
        let dir = match category {
            EvidenceCategory::Violation => &self.alerts_dir,
            _ => &self.faces_dir,
        };
        let name = format!(
            "{}_{}_{}.jpg",
            category.prefix(),
            track_id,
            Utc::now().timestamp_millis()
        );
        let path = dir.join(name);

        let file = File::create(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        JpegEncoder::new_with_quality(&mut writer, self.quality)
            .encode_image(crop)
            .with_context(|| format!("Failed to encode {}", path.display()))?;

        Ok(path.to_string_lossy().into_owned())
    }

    fn discard(&self, evidence_ref: &str) {
        if let Err(e) = fs::remove_file(evidence_ref) {
            warn!("Could not remove orphaned evidence {}: {}", evidence_ref, e);
        }
    }
}

/// Keeps references only. Used by tests and dry runs.
#[derive(Default)]
pub struct MemoryEvidenceSink {
    saved: Mutex<Vec<String>>,
    discarded: Mutex<Vec<String>>,
}

impl MemoryEvidenceSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn saved(&self) -> Vec<String> {
        self.saved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn discarded(&self) -> Vec<String> {
        self.discarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl EvidenceSink for MemoryEvidenceSink {
    fn save(&self, category: EvidenceCategory, track_id: u32, _crop: &RgbImage) -> Result<String> {
        let mut saved = self.saved.lock().unwrap_or_else(PoisonError::into_inner);
        let evidence_ref = format!("mem://{}_{}_{}", category.prefix(), track_id, saved.len());
        saved.push(evidence_ref.clone());
        Ok(evidence_ref)
    }

    fn discard(&self, evidence_ref: &str) {
        self.discarded
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(evidence_ref.to_string());
    }
}
