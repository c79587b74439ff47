// src/ppe/mod.rs
//
// Equipment-to-person association and the one-shot violation decision.

pub mod association;
pub mod violation;

pub use association::PpeAssociationEngine;
pub use violation::{ViolationDecision, ViolationDeterminizer};

use crate::types::BBox;
use serde::{Deserialize, Serialize};

/// An equipment detection after class-catalog mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentDetection {
    pub kind: String,
    pub bbox: BBox,
    pub confidence: f32,
}

impl EquipmentDetection {
    pub fn new(kind: impl Into<String>, bbox: BBox, confidence: f32) -> Self {
        Self {
            kind: kind.into(),
            bbox,
            confidence,
        }
    }
}

/// Display grade of one person in one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComplianceLevel {
    Compliant,
    Partial,
    NonCompliant,
}

impl ComplianceLevel {
    pub fn grade(missing: usize, required: usize) -> Self {
        if missing == 0 {
            Self::Compliant
        } else if missing >= required {
            Self::NonCompliant
        } else {
            Self::Partial
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "compliant",
            Self::Partial => "partial",
            Self::NonCompliant => "non_compliant",
        }
    }
}
