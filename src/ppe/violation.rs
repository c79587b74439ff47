// src/ppe/violation.rs
//
// missing = required - equipped, every frame. A violation is persisted at
// most once per track, only for resolved tracks, and the track's flag is
// set only after the store confirmed the write. A failed write leaves the
// flag unset so the next frame retries.

use super::ComplianceLevel;
use crate::identity::IdentityId;
use crate::persistence::{
    EvidenceCategory, EvidenceSink, NewViolation, PersistenceStore, ViolationEvent,
};
use crate::track_state::TrackState;
use anyhow::Result;
use chrono::Utc;
use image::RgbImage;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub enum ViolationDecision {
    Compliant,
    /// Non-compliant, but the track has no identity yet.
    Unattributed { missing: BTreeSet<String> },
    /// Non-compliant; this track's violation was already logged.
    AlreadyLogged { missing: BTreeSet<String> },
    Logged(ViolationEvent),
    /// Persisting failed; retried on the next evaluation.
    Deferred {
        missing: BTreeSet<String>,
        error: String,
    },
}

impl ViolationDecision {
    pub fn missing(&self) -> BTreeSet<String> {
        match self {
            Self::Compliant => BTreeSet::new(),
            Self::Unattributed { missing }
            | Self::AlreadyLogged { missing }
            | Self::Deferred { missing, .. } => missing.clone(),
            Self::Logged(event) => event.violated_items.clone(),
        }
    }
}

pub struct ViolationDeterminizer {
    required: BTreeSet<String>,
    store: Arc<dyn PersistenceStore>,
    evidence: Arc<dyn EvidenceSink>,
}

impl ViolationDeterminizer {
    pub fn new(
        required: impl IntoIterator<Item = String>,
        store: Arc<dyn PersistenceStore>,
        evidence: Arc<dyn EvidenceSink>,
    ) -> Self {
        Self {
            required: required.into_iter().collect(),
            store,
            evidence,
        }
    }

    pub fn required(&self) -> &BTreeSet<String> {
        &self.required
    }

    pub fn missing(&self, equipped: &BTreeSet<String>) -> BTreeSet<String> {
        self.required.difference(equipped).cloned().collect()
    }

    pub fn compliance(&self, missing: &BTreeSet<String>) -> ComplianceLevel {
        ComplianceLevel::grade(missing.len(), self.required.len())
    }

    pub fn evaluate(
        &self,
        state: &mut TrackState,
        equipped: &BTreeSet<String>,
        crop: &RgbImage,
    ) -> ViolationDecision {
        let missing = self.missing(equipped);
        if missing.is_empty() {
            return ViolationDecision::Compliant;
        }

        let Some(identity_id) = state.resolved_identity().cloned() else {
            return ViolationDecision::Unattributed { missing };
        };
        if state.violation_logged() {
            return ViolationDecision::AlreadyLogged { missing };
        }

        match self.persist(state.track_id, identity_id, equipped, &missing, crop) {
            Ok(event) => {
                state.mark_violation_logged();
                info!(
                    "🚨 Violation: track {} ({}) missing {:?}",
                    state.track_id,
                    event
                        .display_name
                        .as_deref()
                        .unwrap_or(event.identity_id.short()),
                    missing
                );
                ViolationDecision::Logged(event)
            }
            Err(e) => {
                warn!(
                    "⚠️  Track {}: violation not persisted, will retry: {:#}",
                    state.track_id, e
                );
                ViolationDecision::Deferred {
                    missing,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    fn persist(
        &self,
        track_id: u32,
        identity_id: IdentityId,
        equipped: &BTreeSet<String>,
        missing: &BTreeSet<String>,
        crop: &RgbImage,
    ) -> Result<ViolationEvent> {
        let evidence_ref = self
            .evidence
            .save(EvidenceCategory::Violation, track_id, crop)?;
        let result = self.store.log_violation(NewViolation {
            identity_id,
            track_id,
            equipped_items: equipped.clone(),
            violated_items: missing.clone(),
            evidence_ref: evidence_ref.clone(),
            timestamp: Utc::now(),
        });
        if result.is_err() {
            self.evidence.discard(&evidence_ref);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{InMemoryStore, MemoryEvidenceSink};
    use crate::ppe::{EquipmentDetection, PpeAssociationEngine};
    use crate::types::AssociationConfig;

    fn required() -> Vec<String> {
        ["helmet", "vest", "boots", "gloves"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    fn setup() -> (ViolationDeterminizer, Arc<InMemoryStore>, Arc<MemoryEvidenceSink>) {
        let store = Arc::new(InMemoryStore::new());
        let evidence = Arc::new(MemoryEvidenceSink::new());
        (
            ViolationDeterminizer::new(required(), store.clone(), evidence.clone()),
            store,
            evidence,
        )
    }

    fn resolved(track_id: u32) -> TrackState {
        let mut state = TrackState::new(track_id);
        state.resolve(IdentityId::new("w-000001"));
        state
    }

    fn set(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_helmet_only_scenario_logs_once() {
        let (determinizer, store, _) = setup();
        let engine = PpeAssociationEngine::new(&AssociationConfig::default());
        let person = [100.0, 100.0, 300.0, 500.0];
        let helmet = EquipmentDetection::new("helmet", [120.0, 90.0, 220.0, 160.0], 0.9);
        let equipped = engine.equipped_for(&person, &[helmet]);
        assert_eq!(equipped, set(&["helmet"]));

        let mut state = resolved(1);
        let crop = RgbImage::new(200, 400);
        let decision = determinizer.evaluate(&mut state, &equipped, &crop);
        let event = match decision {
            ViolationDecision::Logged(event) => event,
            other => panic!("expected a logged violation, got {:?}", other),
        };
        assert_eq!(event.violated_items, set(&["vest", "boots", "gloves"]));
        assert_eq!(event.equipped_items, set(&["helmet"]));
        assert!(state.violation_logged());

        for _ in 0..10 {
            let again = determinizer.evaluate(&mut state, &equipped, &crop);
            assert_eq!(
                again,
                ViolationDecision::AlreadyLogged {
                    missing: set(&["vest", "boots", "gloves"])
                }
            );
        }
        assert_eq!(store.violation_count(), 1);
    }

    #[test]
    fn test_unresolved_track_is_not_logged() {
        let (determinizer, store, evidence) = setup();
        let mut state = TrackState::new(5);
        let decision = determinizer.evaluate(&mut state, &set(&["helmet"]), &RgbImage::new(8, 8));
        assert!(matches!(decision, ViolationDecision::Unattributed { .. }));
        assert!(!state.violation_logged());
        assert_eq!(store.violation_count(), 0);
        assert!(evidence.saved().is_empty());
    }

    #[test]
    fn test_flag_flips_at_most_once_across_compliance_changes() {
        let (determinizer, store, _) = setup();
        let mut state = resolved(2);
        let crop = RgbImage::new(8, 8);
        let all = set(&["helmet", "vest", "boots", "gloves"]);

        assert_eq!(determinizer.evaluate(&mut state, &all, &crop), ViolationDecision::Compliant);
        assert!(!state.violation_logged());

        assert!(matches!(
            determinizer.evaluate(&mut state, &set(&["helmet"]), &crop),
            ViolationDecision::Logged(_)
        ));
        assert_eq!(determinizer.evaluate(&mut state, &all, &crop), ViolationDecision::Compliant);
        assert!(state.violation_logged());

        assert!(matches!(
            determinizer.evaluate(&mut state, &set(&["vest"]), &crop),
            ViolationDecision::AlreadyLogged { .. }
        ));
        assert_eq!(store.violation_count(), 1);
    }

    #[test]
    fn test_persist_failure_is_retried() {
        let (determinizer, store, evidence) = setup();
        let mut state = resolved(3);
        let crop = RgbImage::new(8, 8);
        let equipped = set(&["helmet", "vest"]);

        store.set_offline(true);
        let decision = determinizer.evaluate(&mut state, &equipped, &crop);
        assert!(matches!(decision, ViolationDecision::Deferred { .. }));
        assert!(!state.violation_logged());
        assert_eq!(evidence.discarded().len(), 1);

        store.set_offline(false);
        let decision = determinizer.evaluate(&mut state, &equipped, &crop);
        assert!(matches!(decision, ViolationDecision::Logged(_)));
        assert!(state.violation_logged());
        assert_eq!(store.violation_count(), 1);
    }

    #[test]
    fn test_missing_and_compliance() {
        let (determinizer, _, _) = setup();
        let missing = determinizer.missing(&set(&["helmet", "mask"]));
        assert_eq!(missing, set(&["vest", "boots", "gloves"]));
        assert_eq!(determinizer.compliance(&missing), ComplianceLevel::Partial);
        assert_eq!(
            determinizer.compliance(&determinizer.missing(&BTreeSet::new())),
            ComplianceLevel::NonCompliant
        );
    }
}
