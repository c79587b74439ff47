// src/types.rs

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub detection: DetectionConfig,
    pub quality: QualityConfig,
    pub identity: IdentityConfig,
    pub association: AssociationConfig,
    pub compliance: ComplianceConfig,
    pub storage: StorageConfig,
    pub runtime: RuntimeConfig,
    pub models: ModelConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Minimum confidence for a person detection to be processed
    pub person_confidence: f32,
    /// Minimum confidence for an equipment detection to be considered
    pub ppe_confidence: f32,
    /// Process every Nth frame delivered by the source
    pub frame_stride: u32,
    pub classes: ClassCatalogConfig,
    pub tracker: PersonTrackerConfig,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            person_confidence: 0.5,
            ppe_confidence: 0.5,
            frame_stride: 3,
            classes: ClassCatalogConfig::default(),
            tracker: PersonTrackerConfig::default(),
        }
    }
}

/// Maps raw detector labels onto the person class and equipment kinds.
/// Labels are compared lower-cased and trimmed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassCatalogConfig {
    pub person: Vec<String>,
    /// equipment kind -> raw label aliases
    pub equipment: BTreeMap<String, Vec<String>>,
}

impl Default for ClassCatalogConfig {
    fn default() -> Self {
        let mut equipment = BTreeMap::new();
        equipment.insert(
            "helmet".to_string(),
            vec!["helmet".to_string(), "hardhat".to_string()],
        );
        equipment.insert(
            "vest".to_string(),
            vec!["vest".to_string(), "safety vest".to_string()],
        );
        equipment.insert("mask".to_string(), vec!["mask".to_string()]);
        equipment.insert("boots".to_string(), vec!["boots".to_string()]);
        equipment.insert("gloves".to_string(), vec!["gloves".to_string()]);
        Self {
            person: vec!["person".to_string()],
            equipment,
        }
    }
}

/// Built-in IoU tracker, used when the detection source carries no track ids.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonTrackerConfig {
    pub min_iou: f32,
    /// Frames a track survives without a detection before deletion
    pub max_coast_frames: u32,
}

impl Default for PersonTrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.3,
            max_coast_frames: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityConfig {
    /// Minimum crop width and height in pixels
    pub min_crop_size: u32,
    /// Minimum Laplacian variance of the grayscale crop
    pub sharpness_threshold: f64,
}

impl Default for QualityConfig {
    fn default() -> Self {
        Self {
            min_crop_size: 40,
            sharpness_threshold: 80.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Frames a track waits for a usable face before appearance fallback
    pub patience_frames: u32,
    /// Cosine similarity a face signature must exceed to match
    pub face_threshold: f32,
    /// Cosine similarity an appearance signature must exceed to match
    pub appearance_threshold: f32,
    pub confirmation: ConfirmationConfig,
    /// Frames to wait after the first failed registration
    pub registration_backoff_frames: u64,
    /// Upper bound on the registration backoff
    pub max_registration_backoff_frames: u64,
    /// Attach the missing signature kind to a resolved identity
    pub enrich_signatures: bool,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            patience_frames: 25,
            face_threshold: 0.7,
            appearance_threshold: 0.65,
            confirmation: ConfirmationConfig::default(),
            registration_backoff_frames: 2,
            max_registration_backoff_frames: 64,
            enrich_signatures: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum ConfirmationConfig {
    /// Commit the first registry match
    #[default]
    Immediate,
    /// Collect `votes` registry matches and commit the most frequent
    MajorityVote { votes: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssociationMode {
    /// Per-class IoU thresholds
    #[default]
    Iou,
    /// Equipment box center strictly inside the person box
    CenterContainment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    pub mode: AssociationMode,
    /// equipment kind -> minimum IoU (exclusive)
    pub thresholds: BTreeMap<String, f32>,
    pub default_threshold: f32,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        let mut thresholds = BTreeMap::new();
        thresholds.insert("vest".to_string(), 0.4);
        thresholds.insert("helmet".to_string(), 0.01);
        thresholds.insert("boots".to_string(), 0.02);
        thresholds.insert("gloves".to_string(), 0.01);
        Self {
            mode: AssociationMode::Iou,
            thresholds,
            default_threshold: 0.01,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Equipment kinds every worker must wear
    pub required: Vec<String>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            required: vec![
                "helmet".to_string(),
                "vest".to_string(),
                "boots".to_string(),
                "gloves".to_string(),
            ],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub database_path: String,
    pub faces_dir: String,
    pub alerts_dir: String,
    pub jpeg_quality: u8,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database_path: "storage/ppe.db".to_string(),
            faces_dir: "storage/faces".to_string(),
            alerts_dir: "storage/alerts".to_string(),
            jpeg_quality: 85,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Process the persons of one frame on the rayon pool
    pub parallel_persons: bool,
    /// Reports buffered per subscriber before slow viewers start lagging
    pub fanout_capacity: usize,
    pub event_bus_capacity: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            parallel_persons: false,
            fanout_capacity: 16,
            event_bus_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub detector: Option<DetectorModelConfig>,
    pub face: Option<FaceModelConfig>,
    pub reid: Option<ReidModelConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorModelConfig {
    pub path: String,
    #[serde(default = "default_detector_input")]
    pub input_size: usize,
    /// Label of each output class, in model order
    pub class_names: Vec<String>,
    #[serde(default = "default_nms_iou")]
    pub nms_iou: f32,
    #[serde(default = "default_threads")]
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceModelConfig {
    /// UltraFace-style detector (scores + boxes outputs)
    pub detector_path: String,
    pub embedder_path: String,
    #[serde(default = "default_face_embed_size")]
    pub embed_size: u32,
    /// Candidates below this score are not faces at all
    #[serde(default = "default_face_floor")]
    pub detection_floor: f32,
    /// Best candidate must reach this score to be embedded
    #[serde(default = "default_face_min_conf")]
    pub min_detection_confidence: f32,
    #[serde(default = "default_threads")]
    pub num_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReidModelConfig {
    pub path: String,
    #[serde(default = "default_reid_width")]
    pub input_width: usize,
    #[serde(default = "default_reid_height")]
    pub input_height: usize,
    #[serde(default = "default_threads")]
    pub num_threads: usize,
}

fn default_detector_input() -> usize {
    640
}
fn default_nms_iou() -> f32 {
    0.45
}
fn default_threads() -> usize {
    4
}
fn default_face_embed_size() -> u32 {
    160
}
fn default_face_floor() -> f32 {
    0.3
}
fn default_face_min_conf() -> f32 {
    0.7
}
fn default_reid_width() -> usize {
    128
}
fn default_reid_height() -> usize {
    256
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Emit a session summary every N processed frames (0 disables)
    pub summary_every_frames: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "ppe_monitor=info,ort=warn".to_string(),
            summary_every_frames: 150,
        }
    }
}

// ============================================================================
// FRAME / DETECTION TYPES
// ============================================================================

/// [x1, y1, x2, y2] in pixel coordinates
pub type BBox = [f32; 4];

#[derive(Debug, Clone)]
pub struct Frame {
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub image: RgbImage,
}

impl Frame {
    pub fn new(frame_id: u64, timestamp_ms: f64, image: RgbImage) -> Self {
        Self {
            frame_id,
            timestamp_ms,
            image,
        }
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }
}

/// One detector output tuple. Person detections need a `track_id` to be resolved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub label: String,
    pub bbox: BBox,
    pub confidence: f32,
    #[serde(default)]
    pub track_id: Option<u32>,
}

impl Detection {
    pub fn new(label: impl Into<String>, bbox: BBox, confidence: f32) -> Self {
        Self {
            label: label.into(),
            bbox,
            confidence,
            track_id: None,
        }
    }

    pub fn with_track(mut self, track_id: u32) -> Self {
        self.track_id = Some(track_id);
        self
    }
}
