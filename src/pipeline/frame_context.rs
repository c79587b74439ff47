// src/pipeline/frame_context.rs
//
// Everything one processed frame produced, in one place. Reports are
// shared as `Arc<FrameReport>` with every subscriber.

use super::event_bus::PipelineEvent;
use super::stats::SessionStats;
use crate::identity::IdentityId;
use crate::ppe::ComplianceLevel;
use crate::track_state::ResolutionPhase;
use crate::types::BBox;
use serde::Serialize;
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PersonReport {
    pub track_id: u32,
    pub bbox: BBox,
    pub identity: Option<IdentityId>,
    pub phase: ResolutionPhase,
    pub equipped: BTreeSet<String>,
    pub missing: BTreeSet<String>,
    pub compliance: ComplianceLevel,
    pub violation_logged: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FrameReport {
    /// Incremented on every session reset
    pub epoch: u64,
    pub frame_id: u64,
    pub timestamp_ms: f64,
    pub persons: Vec<PersonReport>,
    pub stats: SessionStats,
    pub events: Vec<PipelineEvent>,
}

impl FrameReport {
    pub fn person(&self, track_id: u32) -> Option<&PersonReport> {
        self.persons.iter().find(|p| p.track_id == track_id)
    }

    pub fn non_compliant(&self) -> impl Iterator<Item = &PersonReport> {
        self.persons
            .iter()
            .filter(|p| p.compliance != ComplianceLevel::Compliant)
    }

    /// Serialized as a single JSON line.
    pub fn to_json_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
