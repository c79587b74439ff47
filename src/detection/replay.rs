// src/detection/replay.rs
//
// Replays recorded detector + tracker output from a JSON-lines file:
//
//   {"frame": 0, "detections": [{"label": "person", "bbox": [..], "confidence": 0.9, "track_id": 4}, ...]}
//
// Frames without a record have no detections. Person boxes recorded
// without a track id can be handed to the built-in IoU tracker.

use super::{Category, ClassCatalog, DetectionProvider, PersonTracker};
use crate::types::{Detection, Frame};
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct ReplayRecord {
    frame: u64,
    #[serde(default)]
    detections: Vec<Detection>,
}

pub struct ReplayDetectionProvider {
    frames: BTreeMap<u64, Vec<Detection>>,
    catalog: ClassCatalog,
    tracker: Option<PersonTracker>,
}

impl ReplayDetectionProvider {
    pub fn open(path: &Path, catalog: ClassCatalog, tracker: Option<PersonTracker>) -> Result<Self> {
        let file = File::open(path)
            .with_context(|| format!("Failed to open replay file {}", path.display()))?;
        let provider = Self::from_reader(BufReader::new(file), catalog, tracker)
            .with_context(|| format!("Failed to read replay file {}", path.display()))?;
        info!(
            "Replay: {} frames of detections from {}",
            provider.frames.len(),
            path.display()
        );
        Ok(provider)
    }

    pub fn from_reader<R: BufRead>(
        reader: R,
        catalog: ClassCatalog,
        tracker: Option<PersonTracker>,
    ) -> Result<Self> {
        let mut frames = BTreeMap::new();
        for (line_no, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: ReplayRecord = serde_json::from_str(&line)
                .with_context(|| format!("line {}", line_no + 1))?;
            frames
                .entry(record.frame)
                .or_insert_with(Vec::new)
                .extend(record.detections);
        }
        Ok(Self {
            frames,
            catalog,
            tracker,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl DetectionProvider for ReplayDetectionProvider {
    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let mut detections = self
            .frames
            .get(&frame.frame_id)
            .cloned()
            .unwrap_or_default();

        if let Some(tracker) = self.tracker.as_mut() {
            let untracked: Vec<usize> = detections
                .iter()
                .enumerate()
                .filter(|(_, d)| {
                    d.track_id.is_none()
                        && self.catalog.categorize(&d.label) == Some(&Category::Person)
                })
                .map(|(i, _)| i)
                .collect();
            let boxes: Vec<_> = untracked.iter().map(|&i| detections[i].bbox).collect();
            let ids = tracker.update(&boxes);
            for (i, id) in untracked.into_iter().zip(ids) {
                detections[i].track_id = Some(id);
            }
        }

        Ok(detections)
    }

    fn reset(&mut self) {
        if let Some(tracker) = self.tracker.as_mut() {
            tracker.reset();
        }
    }

    fn name(&self) -> &str {
        "replay"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ClassCatalogConfig, PersonTrackerConfig};
    use image::RgbImage;
    use std::io::Cursor;

    const LOG: &str = r#"{"frame": 0, "detections": [{"label": "person", "bbox": [100, 100, 300, 500], "confidence": 0.9, "track_id": 7}, {"label": "helmet", "bbox": [120, 90, 220, 160], "confidence": 0.8}]}

{"frame": 2, "detections": [{"label": "person", "bbox": [0, 0, 50, 150], "confidence": 0.9}]}
{"frame": 3, "detections": [{"label": "person", "bbox": [2, 0, 52, 150], "confidence": 0.9}]}
"#;

    fn frame(id: u64) -> Frame {
        Frame::new(id, id as f64 * 40.0, RgbImage::new(4, 4))
    }

    fn catalog() -> ClassCatalog {
        ClassCatalog::new(&ClassCatalogConfig::default())
    }

    #[test]
    fn test_replays_recorded_frames() {
        let mut provider =
            ReplayDetectionProvider::from_reader(Cursor::new(LOG), catalog(), None).unwrap();
        assert_eq!(provider.frame_count(), 3);

        let dets = provider.detect_and_track(&frame(0)).unwrap();
        assert_eq!(dets.len(), 2);
        assert_eq!(dets[0].track_id, Some(7));
        assert_eq!(dets[1].track_id, None);

        assert!(provider.detect_and_track(&frame(1)).unwrap().is_empty());
        assert_eq!(provider.detect_and_track(&frame(2)).unwrap()[0].track_id, None);
    }

    #[test]
    fn test_tracker_fills_missing_ids() {
        let tracker = PersonTracker::new(PersonTrackerConfig::default());
        let mut provider =
            ReplayDetectionProvider::from_reader(Cursor::new(LOG), catalog(), Some(tracker))
                .unwrap();

        // Recorded ids and equipment are left alone.
        let dets = provider.detect_and_track(&frame(0)).unwrap();
        assert_eq!(dets[0].track_id, Some(7));
        assert_eq!(dets[1].track_id, None);

        let a = provider.detect_and_track(&frame(2)).unwrap()[0].track_id;
        let b = provider.detect_and_track(&frame(3)).unwrap()[0].track_id;
        assert!(a.is_some());
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_line_is_an_error() {
        let result = ReplayDetectionProvider::from_reader(
            Cursor::new("{\"frame\": \"zero\"}\n"),
            catalog(),
            None,
        );
        assert!(result.is_err());
    }
}
