// src/detection/yolo.rs
//
// YOLO PPE detector (ONNX, output [1, 4 + classes, N]) followed by the IoU
// person tracker. Class order comes from `models.detector.class_names`.

use super::{Category, ClassCatalog, DetectionProvider, PersonTracker};
use crate::geometry::iou;
use crate::preprocessing::{letterbox, to_chw, Normalization};
use crate::types::{Detection, DetectionConfig, DetectorModelConfig, Frame};
use anyhow::{bail, Context, Result};
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use tracing::{debug, info};

pub struct YoloTrackingProvider {
    session: Session,
    class_names: Vec<String>,
    input_size: usize,
    nms_iou: f32,
    min_confidence: f32,
    catalog: ClassCatalog,
    tracker: PersonTracker,
}

impl YoloTrackingProvider {
    pub fn new(model: &DetectorModelConfig, detection: &DetectionConfig) -> Result<Self> {
        info!("Loading YOLO model: {}", model.path);
        if model.class_names.is_empty() {
            bail!("models.detector.class_names must list the model's classes");
        }

        let session = Session::builder()?
            .with_execution_providers([CUDAExecutionProvider::default().with_device_id(0).build()])?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(model.num_threads)?
            .commit_from_file(&model.path)
            .with_context(|| format!("Failed to load detector {}", model.path))?;

        info!("✓ YOLO detector initialized ({} classes)", model.class_names.len());
        Ok(Self {
            session,
            class_names: model.class_names.clone(),
            input_size: model.input_size,
            nms_iou: model.nms_iou,
            min_confidence: detection.person_confidence.min(detection.ppe_confidence),
            catalog: ClassCatalog::new(&detection.classes),
            tracker: PersonTracker::new(detection.tracker.clone()),
        })
    }

    fn infer(&mut self, frame: &Frame) -> Result<(Vec<f32>, crate::preprocessing::Letterbox)> {
        let (canvas, lb) = letterbox(&frame.image, self.input_size);
        let input = to_chw(canvas.as_raw(), self.input_size, self.input_size, Normalization::Unit);

        let shape = [1, 3, self.input_size, self.input_size];
        let input_value =
            ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))?;

        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let (_, data) = outputs[0].try_extract_tensor::<f32>()?;
        Ok((data.to_vec(), lb))
    }

    fn postprocess(&self, output: &[f32], lb: crate::preprocessing::Letterbox) -> Vec<Detection> {
        let classes = self.class_names.len();
        let n = output.len() / (4 + classes);
        let mut detections = Vec::new();

        for i in 0..n {
            let cx = output[i];
            let cy = output[n + i];
            let w = output[n * 2 + i];
            let h = output[n * 3 + i];

            let mut max_conf = 0.0f32;
            let mut best_class = 0;
            for c in 0..classes {
                let conf = output[n * (4 + c) + i];
                if conf > max_conf {
                    max_conf = conf;
                    best_class = c;
                }
            }
            if max_conf < self.min_confidence {
                continue;
            }

            let bbox = lb.unmap([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
            detections.push(Detection::new(
                self.class_names[best_class].clone(),
                bbox,
                max_conf,
            ));
        }

        nms(detections, self.nms_iou)
    }
}

impl DetectionProvider for YoloTrackingProvider {
    fn detect_and_track(&mut self, frame: &Frame) -> Result<Vec<Detection>> {
        let (output, lb) = self.infer(frame)?;
        let mut detections = self.postprocess(&output, lb);

        let person_idx: Vec<usize> = detections
            .iter()
            .enumerate()
            .filter(|(_, d)| self.catalog.categorize(&d.label) == Some(&Category::Person))
            .map(|(i, _)| i)
            .collect();
        let boxes: Vec<_> = person_idx.iter().map(|&i| detections[i].bbox).collect();
        let ids = self.tracker.update(&boxes);
        for (i, id) in person_idx.into_iter().zip(ids) {
            detections[i].track_id = Some(id);
        }

        debug!("Frame {}: {} detections", frame.frame_id, detections.len());
        Ok(detections)
    }

    fn reset(&mut self) {
        self.tracker.reset();
    }

    fn name(&self) -> &str {
        "yolo"
    }
}

/// Per-label NMS: overlapping boxes of different classes (person + vest)
/// must both survive.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        let suppressed = keep
            .iter()
            .any(|k| k.label == det.label && iou(&k.bbox, &det.bbox) >= iou_threshold);
        if !suppressed {
            keep.push(det);
        }
    }
    keep
}
