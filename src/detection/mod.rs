// src/detection/mod.rs
//
// Detection providers turn a frame into labelled, scored boxes; person
// boxes carry a tracker id. The class catalog maps raw labels onto
// `person` or an equipment kind, and `partition` splits one frame's
// output for the rest of the pipeline.

pub mod replay;
pub mod tracker;
#[cfg(feature = "onnx")]
pub mod yolo;

pub use replay::ReplayDetectionProvider;
pub use tracker::PersonTracker;
#[cfg(feature = "onnx")]
pub use yolo::YoloTrackingProvider;

use crate::ppe::EquipmentDetection;
use crate::types::{BBox, ClassCatalogConfig, Detection, DetectionConfig, Frame};
use anyhow::Result;
use std::collections::HashMap;
use tracing::debug;

pub trait DetectionProvider: Send {
    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>>;

    /// Forget all tracks. Called when the video source changes.
    fn reset(&mut self) {}

    fn name(&self) -> &str;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Category {
    Person,
    Equipment(String),
}

#[derive(Debug, Clone)]
pub struct ClassCatalog {
    labels: HashMap<String, Category>,
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

impl ClassCatalog {
    pub fn new(config: &ClassCatalogConfig) -> Self {
        let mut labels = HashMap::new();
        for (kind, aliases) in &config.equipment {
            labels.insert(normalize_label(kind), Category::Equipment(kind.clone()));
            for alias in aliases {
                labels.insert(normalize_label(alias), Category::Equipment(kind.clone()));
            }
        }
        for alias in &config.person {
            labels.insert(normalize_label(alias), Category::Person);
        }
        Self { labels }
    }

    /// None for labels the deployment does not care about.
    pub fn categorize(&self, label: &str) -> Option<&Category> {
        self.labels.get(&normalize_label(label))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PersonDetection {
    pub track_id: u32,
    pub bbox: BBox,
    pub confidence: f32,
}

#[derive(Debug, Clone, Default)]
pub struct FrameDetections {
    pub persons: Vec<PersonDetection>,
    pub equipment: Vec<EquipmentDetection>,
    /// Person boxes without a track id
    pub untracked: usize,
}

/// Split detector output into tracked persons and equipment. Persons
/// without a track id are dropped; a track id seen twice in one frame
/// keeps its most confident box.
pub fn partition(
    detections: &[Detection],
    catalog: &ClassCatalog,
    config: &DetectionConfig,
) -> FrameDetections {
    let mut out = FrameDetections::default();
    let mut by_track: HashMap<u32, usize> = HashMap::new();

    for det in detections {
        match catalog.categorize(&det.label) {
            Some(Category::Person) => {
                if det.confidence < config.person_confidence {
                    continue;
                }
                let Some(track_id) = det.track_id else {
                    out.untracked += 1;
                    continue;
                };
                let person = PersonDetection {
                    track_id,
                    bbox: det.bbox,
                    confidence: det.confidence,
                };
                match by_track.get(&track_id) {
                    Some(&idx) => {
                        if person.confidence > out.persons[idx].confidence {
                            out.persons[idx] = person;
                        }
                    }
                    None => {
                        by_track.insert(track_id, out.persons.len());
                        out.persons.push(person);
                    }
                }
            }
            Some(Category::Equipment(kind)) => {
                if det.confidence >= config.ppe_confidence {
                    out.equipment
                        .push(EquipmentDetection::new(kind.clone(), det.bbox, det.confidence));
                }
            }
            None => {}
        }
    }

    if out.untracked > 0 {
        debug!("Dropped {} person detections without track id", out.untracked);
    }
    out
}
