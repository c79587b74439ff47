// src/ppe/association.rs
//
// Which equipment does this person wear in this frame? Small items
// (helmet, gloves) barely overlap a person box, so thresholds are per
// class. The equipped set is recomputed from scratch every frame.

use super::EquipmentDetection;
use crate::geometry::{contains_center, iou};
use crate::types::{AssociationConfig, AssociationMode, BBox};
use std::collections::{BTreeMap, BTreeSet};

#[derive(Debug, Clone)]
pub struct PpeAssociationEngine {
    mode: AssociationMode,
    thresholds: BTreeMap<String, f32>,
    default_threshold: f32,
}

impl PpeAssociationEngine {
    pub fn new(config: &AssociationConfig) -> Self {
        Self {
            mode: config.mode,
            thresholds: config.thresholds.clone(),
            default_threshold: config.default_threshold,
        }
    }

    pub fn threshold_for(&self, kind: &str) -> f32 {
        self.thresholds
            .get(kind)
            .copied()
            .unwrap_or(self.default_threshold)
    }

    pub fn associates(&self, person: &BBox, item: &EquipmentDetection) -> bool {
        match self.mode {
            AssociationMode::Iou => iou(person, &item.bbox) > self.threshold_for(&item.kind),
            AssociationMode::CenterContainment => contains_center(person, &item.bbox),
        }
    }

    pub fn equipped_for(&self, person: &BBox, equipment: &[EquipmentDetection]) -> BTreeSet<String> {
        equipment
            .iter()
            .filter(|item| self.associates(person, item))
            .map(|item| item.kind.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PERSON: BBox = [100.0, 100.0, 300.0, 500.0];

    fn engine(mode: AssociationMode) -> PpeAssociationEngine {
        PpeAssociationEngine::new(&AssociationConfig {
            mode,
            ..AssociationConfig::default()
        })
    }

    #[test]
    fn test_helmet_with_low_threshold_is_equipped() {
        let helmet = EquipmentDetection::new("helmet", [120.0, 90.0, 220.0, 160.0], 0.9);
        let iou_engine = engine(AssociationMode::Iou);
        assert!((iou_engine.threshold_for("helmet") - 0.01).abs() < 1e-6);
        assert_eq!(
            iou_engine.equipped_for(&PERSON, &[helmet.clone()]),
            BTreeSet::from(["helmet".to_string()])
        );
        // The legacy containment mode agrees on this box.
        assert!(engine(AssociationMode::CenterContainment).associates(&PERSON, &helmet));
    }

    #[test]
    fn test_vest_needs_substantial_overlap() {
        let iou_engine = engine(AssociationMode::Iou);
        // IoU 0.3 against the person box: below the 0.4 vest threshold.
        let small_vest = EquipmentDetection::new("vest", [150.0, 200.0, 250.0, 440.0], 0.9);
        assert!(iou_engine.equipped_for(&PERSON, &[small_vest]).is_empty());

        let big_vest = EquipmentDetection::new("vest", [110.0, 150.0, 290.0, 450.0], 0.9);
        assert!(iou_engine
            .equipped_for(&PERSON, &[big_vest])
            .contains("vest"));
    }

    #[test]
    fn test_unknown_kind_uses_default_threshold() {
        let iou_engine = engine(AssociationMode::Iou);
        assert!((iou_engine.threshold_for("mask") - 0.01).abs() < 1e-6);
    }

    #[test]
    fn test_far_equipment_is_ignored() {
        let iou_engine = engine(AssociationMode::Iou);
        let elsewhere = EquipmentDetection::new("helmet", [400.0, 90.0, 450.0, 140.0], 0.9);
        assert!(iou_engine.equipped_for(&PERSON, &[elsewhere]).is_empty());
    }

    #[test]
    fn test_equipped_set_is_per_frame() {
        let iou_engine = engine(AssociationMode::Iou);
        let helmet = EquipmentDetection::new("helmet", [120.0, 90.0, 220.0, 160.0], 0.9);
        let boots = EquipmentDetection::new("boots", [120.0, 440.0, 280.0, 500.0], 0.9);

        let frame_n = iou_engine.equipped_for(&PERSON, &[helmet.clone(), boots]);
        let frame_n1 = iou_engine.equipped_for(&PERSON, &[helmet]);
        assert_eq!(frame_n.len(), 2);
        assert_eq!(frame_n1, BTreeSet::from(["helmet".to_string()]));
    }
}
