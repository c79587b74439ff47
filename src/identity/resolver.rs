// src/identity/resolver.rs
//
// Per-track identity state machine, evaluated once per frame while the
// track is unresolved:
//
//   Unresolved ─┬─ crop passes gate ─→ face signature ─→ registry ─→ Resolved
//               └─ frames_seen > patience ─→ appearance ─→ registry ─→ Resolved
//
// Resolved is terminal. Extraction failures keep the track Unresolved and
// are retried on later frames. A failed registration starts a frame-based
// backoff; the track never receives a provisional id.

use super::{ConfirmationPolicy, IdentityId, IdentityRegistry, RegistryResolution, SignatureKind};
use crate::biometrics::{AppearanceSignatureProvider, ExtractionFailure, FaceSignatureProvider};
use crate::identity::Signature;
use crate::persistence::{EvidenceCategory, EvidenceSink};
use crate::quality::{QualityGate, QualityVerdict};
use crate::track_state::{ResolutionPhase, TrackState};
use crate::types::IdentityConfig;
use image::RgbImage;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Why the face step produced nothing this frame.
#[derive(Debug, Clone, PartialEq)]
pub enum FaceAttempt {
    Skipped(QualityVerdict),
    Failed(ExtractionFailure),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResolutionOutcome {
    /// Resolved on an earlier frame. `attached` names a signature kind
    /// added to the identity this frame.
    AlreadyResolved {
        id: IdentityId,
        attached: Option<SignatureKind>,
    },
    /// Resolved this frame.
    Resolved {
        id: IdentityId,
        kind: SignatureKind,
        registered: bool,
    },
    /// Matched, but the confirmation policy wants more votes.
    AwaitingConfirmation {
        candidate: IdentityId,
        kind: SignatureKind,
        votes: usize,
    },
    /// No usable signature this frame. `appearance` is None while the
    /// track is still within its patience window.
    Unresolved {
        face: FaceAttempt,
        appearance: Option<ExtractionFailure>,
    },
    /// Unmatched signature, but registration is backing off.
    BackingOff {
        kind: SignatureKind,
        retry_after_frame: u32,
    },
    RegistrationFailed {
        kind: SignatureKind,
        failures: u32,
        retry_after_frame: u32,
        error: String,
    },
}

impl ResolutionOutcome {
    pub fn identity(&self) -> Option<&IdentityId> {
        match self {
            Self::AlreadyResolved { id, .. } | Self::Resolved { id, .. } => Some(id),
            _ => None,
        }
    }
}

pub struct IdentityResolver {
    registry: Arc<IdentityRegistry>,
    face: Arc<dyn FaceSignatureProvider>,
    appearance: Arc<dyn AppearanceSignatureProvider>,
    evidence: Arc<dyn EvidenceSink>,
    policy: Box<dyn ConfirmationPolicy>,
    gate: QualityGate,
    config: IdentityConfig,
}

impl IdentityResolver {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        face: Arc<dyn FaceSignatureProvider>,
        appearance: Arc<dyn AppearanceSignatureProvider>,
        evidence: Arc<dyn EvidenceSink>,
        policy: Box<dyn ConfirmationPolicy>,
        gate: QualityGate,
        config: IdentityConfig,
    ) -> Self {
        info!(
            "Identity resolver: face={} appearance={} confirmation={} patience={}",
            face.name(),
            appearance.name(),
            policy.name(),
            config.patience_frames
        );
        Self {
            registry,
            face,
            appearance,
            evidence,
            policy,
            gate,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn step(&self, state: &mut TrackState, crop: &RgbImage) -> ResolutionOutcome {
        state.frames_seen = state.frames_seen.saturating_add(1);

        if let Some(id) = state.resolved_identity().cloned() {
            let attached = self.enrich(state, &id, crop);
            return ResolutionOutcome::AlreadyResolved { id, attached };
        }

        let verdict = self.gate.check(crop);
        let face = if verdict.passed() {
            state.phase = ResolutionPhase::FaceMatchAttempted;
            match self.face.extract_face_signature(crop) {
                Ok(signature) => return self.commit(state, signature, SignatureKind::Face, crop),
                Err(failure) => {
                    debug!("Track {}: face extraction failed: {}", state.track_id, failure);
                    FaceAttempt::Failed(failure)
                }
            }
        } else {
            FaceAttempt::Skipped(verdict)
        };

        if state.frames_seen <= self.config.patience_frames {
            return ResolutionOutcome::Unresolved {
                face,
                appearance: None,
            };
        }

        state.phase = ResolutionPhase::AppearanceMatchAttempted;
        match self.appearance.extract_appearance_signature(crop) {
            Ok(signature) => self.commit(state, signature, SignatureKind::Appearance, crop),
            Err(failure) => {
                debug!(
                    "Track {}: appearance extraction failed: {}",
                    state.track_id, failure
                );
                ResolutionOutcome::Unresolved {
                    face,
                    appearance: Some(failure),
                }
            }
        }
    }

    fn threshold(&self, kind: SignatureKind) -> f32 {
        match kind {
            SignatureKind::Face => self.config.face_threshold,
            SignatureKind::Appearance => self.config.appearance_threshold,
        }
    }

    fn commit(
        &self,
        state: &mut TrackState,
        signature: Signature,
        kind: SignatureKind,
        crop: &RgbImage,
    ) -> ResolutionOutcome {
        let threshold = self.threshold(kind);

        if state.frames_seen < state.retry_after_frame {
            // Registration is backing off, but an existing identity may still match.
            return match self.registry.find_match(&signature, kind, threshold) {
                Some(id) => self.confirm(state, id, kind),
                None => ResolutionOutcome::BackingOff {
                    kind,
                    retry_after_frame: state.retry_after_frame,
                },
            };
        }

        let category = match kind {
            SignatureKind::Face => EvidenceCategory::FaceRegistration,
            SignatureKind::Appearance => EvidenceCategory::AppearanceRegistration,
        };
        let track_id = state.track_id;
        let mut written: Option<String> = None;
        let result = self
            .registry
            .resolve_or_register(signature, kind, threshold, || {
                let evidence_ref = self.evidence.save(category, track_id, crop)?;
                written = Some(evidence_ref.clone());
                Ok(evidence_ref)
            });

        match result {
            Ok(RegistryResolution::Registered { id }) => {
                state.resolve(id.clone());
                info!(
                    "✅ Track {} resolved to new identity {} via {}",
                    track_id,
                    id.short(),
                    kind
                );
                ResolutionOutcome::Resolved {
                    id,
                    kind,
                    registered: true,
                }
            }
            Ok(RegistryResolution::Matched { id, .. }) => self.confirm(state, id, kind),
            Err(e) => {
                if let Some(evidence_ref) = written {
                    self.evidence.discard(&evidence_ref);
                }
                state.registration_failures = state.registration_failures.saturating_add(1);
                let backoff = self.backoff_frames(state.registration_failures);
                state.retry_after_frame = state.frames_seen.saturating_add(backoff);
                warn!(
                    "⚠️  Track {}: registration failed ({} so far), retry after frame {}: {:#}",
                    track_id, state.registration_failures, state.retry_after_frame, e
                );
                ResolutionOutcome::RegistrationFailed {
                    kind,
                    failures: state.registration_failures,
                    retry_after_frame: state.retry_after_frame,
                    error: format!("{:#}", e),
                }
            }
        }
    }

    fn confirm(
        &self,
        state: &mut TrackState,
        candidate: IdentityId,
        kind: SignatureKind,
    ) -> ResolutionOutcome {
        match self.policy.confirm(&mut state.ballot, candidate.clone()) {
            Some(id) => {
                state.resolve(id.clone());
                info!(
                    "✅ Track {} resolved to {} via {} match",
                    state.track_id,
                    id.short(),
                    kind
                );
                ResolutionOutcome::Resolved {
                    id,
                    kind,
                    registered: false,
                }
            }
            None => ResolutionOutcome::AwaitingConfirmation {
                candidate,
                kind,
                votes: state.ballot.len(),
            },
        }
    }

    /// Doubling backoff from the configured base, capped.
    fn backoff_frames(&self, failures: u32) -> u32 {
        let base = self.config.registration_backoff_frames.max(1);
        let shift = failures.saturating_sub(1).min(32);
        let frames = base
            .saturating_mul(1u64 << shift)
            .min(self.config.max_registration_backoff_frames.max(base));
        u32::try_from(frames).unwrap_or(u32::MAX)
    }

    /// Attach the identity's missing signature kind from this crop, at most
    /// once per track.
    fn enrich(&self, state: &mut TrackState, id: &IdentityId, crop: &RgbImage) -> Option<SignatureKind> {
        if !self.config.enrich_signatures || state.enriched {
            return None;
        }
        let identity = self.registry.get(id)?;
        let missing = match (identity.face_signature.is_some(), identity.appearance_signature.is_some()) {
            (true, true) => {
                state.enriched = true;
                return None;
            }
            (true, false) => SignatureKind::Appearance,
            (false, _) => SignatureKind::Face,
        };

        let signature = match missing {
            SignatureKind::Face => {
                if !self.gate.check(crop).passed() {
                    return None;
                }
                self.face.extract_face_signature(crop).ok()?
            }
            SignatureKind::Appearance => self.appearance.extract_appearance_signature(crop).ok()?,
        };

        match self
            .registry
            .attach_signature(id, signature, missing, self.threshold(missing))
        {
            Ok(attached) => {
                state.enriched = true;
                attached.then_some(missing)
            }
            Err(e) => {
                warn!("Track {}: could not attach {} signature: {:#}", state.track_id, missing, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{ImmediateCommit, MajorityVote};
    use crate::persistence::{InMemoryStore, MemoryEvidenceSink, PersistenceStore};
    use crate::types::QualityConfig;
    use image::Rgb;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Returns queued results in order, then `NoFaceFound`.
    struct ScriptedFace {
        script: Mutex<VecDeque<Result<Signature, ExtractionFailure>>>,
        calls: Mutex<usize>,
    }

    impl ScriptedFace {
        fn new(script: Vec<Result<Signature, ExtractionFailure>>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> usize {
            *self.calls.lock().unwrap()
        }
    }

    impl FaceSignatureProvider for ScriptedFace {
        fn extract_face_signature(&self, _crop: &RgbImage) -> Result<Signature, ExtractionFailure> {
            *self.calls.lock().unwrap() += 1;
            self.script
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or(Err(ExtractionFailure::NoFaceFound))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct FixedAppearance(Signature);

    impl AppearanceSignatureProvider for FixedAppearance {
        fn extract_appearance_signature(
            &self,
            crop: &RgbImage,
        ) -> Result<Signature, ExtractionFailure> {
            if crop.width() == 0 {
                return Err(ExtractionFailure::EmptyCrop);
            }
            Ok(self.0.clone())
        }

        fn name(&self) -> &str {
            "fixed"
        }
    }

    struct Harness {
        resolver: IdentityResolver,
        store: Arc<InMemoryStore>,
        face: Arc<ScriptedFace>,
        evidence: Arc<MemoryEvidenceSink>,
    }

    fn harness(
        face_script: Vec<Result<Signature, ExtractionFailure>>,
        policy: Box<dyn ConfirmationPolicy>,
        config: IdentityConfig,
    ) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let registry = Arc::new(IdentityRegistry::new(store.clone()));
        let face = Arc::new(ScriptedFace::new(face_script));
        let evidence = Arc::new(MemoryEvidenceSink::new());
        let resolver = IdentityResolver::new(
            registry,
            face.clone(),
            Arc::new(FixedAppearance(Signature::new(vec![0.0, 1.0, 0.0]))),
            evidence.clone(),
            policy,
            QualityGate::new(&QualityConfig::default()),
            config,
        );
        Harness {
            resolver,
            store,
            face,
            evidence,
        }
    }

    fn sharp_crop() -> RgbImage {
        RgbImage::from_fn(64, 64, |x, y| {
            if (x / 4 + y / 4) % 2 == 0 {
                Rgb([255, 255, 255])
            } else {
                Rgb([0, 0, 0])
            }
        })
    }

    fn blurry_crop() -> RgbImage {
        RgbImage::from_pixel(64, 64, Rgb([120, 120, 120]))
    }

    fn face(cos: f32) -> Result<Signature, ExtractionFailure> {
        Ok(Signature::new(vec![cos, (1.0 - cos * cos).sqrt()]))
    }

    fn config(patience: u32) -> IdentityConfig {
        IdentityConfig {
            patience_frames: patience,
            ..IdentityConfig::default()
        }
    }

    #[test]
    fn test_face_registers_then_rematches() {
        let h = harness(vec![face(1.0), face(0.82)], Box::new(ImmediateCommit), config(25));

        let mut first = TrackState::new(1);
        let outcome = h.resolver.step(&mut first, &sharp_crop());
        let id = match outcome {
            ResolutionOutcome::Resolved {
                id,
                kind: SignatureKind::Face,
                registered: true,
            } => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_eq!(h.evidence.saved().len(), 1);

        let mut second = TrackState::new(2);
        let outcome = h.resolver.step(&mut second, &sharp_crop());
        assert_eq!(
            outcome,
            ResolutionOutcome::Resolved {
                id: id.clone(),
                kind: SignatureKind::Face,
                registered: false
            }
        );
        assert_eq!(h.resolver.registry().len(), 1);
        assert_eq!(h.store.identity_count(), 1);
        assert_eq!(h.evidence.saved().len(), 1);
    }

    #[test]
    fn test_appearance_fallback_waits_for_patience() {
        let patience = 5;
        let h = harness(vec![], Box::new(ImmediateCommit), config(patience));
        let mut state = TrackState::new(3);

        for frame in 1..=patience {
            let outcome = h.resolver.step(&mut state, &blurry_crop());
            assert!(
                matches!(
                    outcome,
                    ResolutionOutcome::Unresolved {
                        face: FaceAttempt::Skipped(QualityVerdict::Blurry { .. }),
                        appearance: None
                    }
                ),
                "frame {}: {:?}",
                frame,
                outcome
            );
            assert!(!state.is_resolved());
        }

        let outcome = h.resolver.step(&mut state, &blurry_crop());
        assert!(matches!(
            outcome,
            ResolutionOutcome::Resolved {
                kind: SignatureKind::Appearance,
                registered: true,
                ..
            }
        ));
        assert_eq!(state.frames_seen, patience + 1);
        // Blurry crops never reach the face provider.
        assert_eq!(h.face.calls(), 0);
    }

    #[test]
    fn test_face_failure_is_retried() {
        let h = harness(
            vec![
                Err(ExtractionFailure::NoFaceFound),
                Err(ExtractionFailure::LowConfidence { score: 0.4 }),
                face(1.0),
            ],
            Box::new(ImmediateCommit),
            config(25),
        );
        let mut state = TrackState::new(1);

        let first = h.resolver.step(&mut state, &sharp_crop());
        assert_eq!(
            first,
            ResolutionOutcome::Unresolved {
                face: FaceAttempt::Failed(ExtractionFailure::NoFaceFound),
                appearance: None
            }
        );
        assert_eq!(state.phase, ResolutionPhase::FaceMatchAttempted);

        let second = h.resolver.step(&mut state, &sharp_crop());
        assert!(matches!(
            second,
            ResolutionOutcome::Unresolved {
                face: FaceAttempt::Failed(ExtractionFailure::LowConfidence { .. }),
                ..
            }
        ));

        let third = h.resolver.step(&mut state, &sharp_crop());
        assert!(matches!(third, ResolutionOutcome::Resolved { .. }));
        assert_eq!(state.phase, ResolutionPhase::Resolved);
    }

    #[test]
    fn test_resolved_identity_never_changes() {
        let h = harness(vec![face(1.0), face(0.0)], Box::new(ImmediateCommit), config(25));
        let mut state = TrackState::new(1);
        let id = h.resolver.step(&mut state, &sharp_crop()).identity().cloned().unwrap();

        for _ in 0..5 {
            let outcome = h.resolver.step(&mut state, &sharp_crop());
            assert_eq!(outcome.identity(), Some(&id));
        }
        assert_eq!(state.resolved_identity(), Some(&id));
        assert_eq!(h.resolver.registry().len(), 1);
    }

    #[test]
    fn test_registration_failure_stays_unresolved_with_backoff() {
        let h = harness(
            vec![face(1.0), face(1.0), face(1.0), face(1.0)],
            Box::new(ImmediateCommit),
            config(25),
        );
        h.store.set_offline(true);
        let mut state = TrackState::new(1);

        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert!(matches!(
            outcome,
            ResolutionOutcome::RegistrationFailed {
                failures: 1,
                retry_after_frame: 3,
                ..
            }
        ));
        assert!(!state.is_resolved());
        // Evidence of a registration that never happened is discarded.
        assert_eq!(h.evidence.discarded(), h.evidence.saved());

        // Frame 2 is inside the backoff window: no write attempted.
        let attempts = h.store.write_attempts();
        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert_eq!(
            outcome,
            ResolutionOutcome::BackingOff {
                kind: SignatureKind::Face,
                retry_after_frame: 3
            }
        );
        assert_eq!(h.store.write_attempts(), attempts);

        h.store.set_offline(false);
        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert!(matches!(
            outcome,
            ResolutionOutcome::Resolved {
                registered: true,
                ..
            }
        ));
        assert_eq!(h.store.identity_count(), 1);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let h = harness(vec![], Box::new(ImmediateCommit), config(25));
        assert_eq!(h.resolver.backoff_frames(1), 2);
        assert_eq!(h.resolver.backoff_frames(2), 4);
        assert_eq!(h.resolver.backoff_frames(3), 8);
        assert_eq!(h.resolver.backoff_frames(10), 64);
        assert_eq!(h.resolver.backoff_frames(100), 64);
    }

    #[test]
    fn test_majority_vote_delays_commit() {
        let h = harness(
            vec![face(1.0), face(0.95), face(0.9), face(0.93)],
            Box::new(MajorityVote::new(3)),
            config(25),
        );
        let mut enrolling = TrackState::new(1);
        let id = h
            .resolver
            .step(&mut enrolling, &sharp_crop())
            .identity()
            .cloned()
            .unwrap();

        let mut state = TrackState::new(2);
        for votes in 1..=2 {
            let outcome = h.resolver.step(&mut state, &sharp_crop());
            assert_eq!(
                outcome,
                ResolutionOutcome::AwaitingConfirmation {
                    candidate: id.clone(),
                    kind: SignatureKind::Face,
                    votes
                }
            );
            assert!(!state.is_resolved());
        }
        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert_eq!(outcome.identity(), Some(&id));
        assert!(state.ballot.is_empty());
        assert_eq!(h.resolver.registry().len(), 1);
    }

    #[test]
    fn test_enrichment_attaches_missing_kind_once() {
        let h = harness(vec![face(1.0)], Box::new(ImmediateCommit), config(25));
        let mut state = TrackState::new(1);
        let id = h.resolver.step(&mut state, &sharp_crop()).identity().cloned().unwrap();

        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert_eq!(
            outcome,
            ResolutionOutcome::AlreadyResolved {
                id: id.clone(),
                attached: Some(SignatureKind::Appearance)
            }
        );
        assert!(state.enriched);

        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert_eq!(
            outcome,
            ResolutionOutcome::AlreadyResolved {
                id: id.clone(),
                attached: None
            }
        );
        let stored = &h.store.list_identities().unwrap()[0];
        assert_eq!(stored.appearance_signature, Some(Signature::new(vec![0.0, 1.0, 0.0])));
        assert!(stored.face_signature.is_some());
    }

    #[test]
    fn test_enrichment_skips_face_already_enrolled_elsewhere() {
        let h = harness(vec![face(1.0), face(0.99)], Box::new(ImmediateCommit), config(2));

        let mut by_face = TrackState::new(1);
        let first = h.resolver.step(&mut by_face, &sharp_crop()).identity().cloned().unwrap();

        // Same worker, no usable face until patience runs out.
        let mut by_appearance = TrackState::new(2);
        let mut outcome = h.resolver.step(&mut by_appearance, &blurry_crop());
        while !by_appearance.is_resolved() {
            outcome = h.resolver.step(&mut by_appearance, &blurry_crop());
        }
        let second = match outcome {
            ResolutionOutcome::Resolved {
                id,
                kind: SignatureKind::Appearance,
                registered: true,
            } => id,
            other => panic!("unexpected {:?}", other),
        };
        assert_ne!(first, second);

        let outcome = h.resolver.step(&mut by_appearance, &sharp_crop());
        assert_eq!(
            outcome,
            ResolutionOutcome::AlreadyResolved {
                id: second.clone(),
                attached: None
            }
        );
        let with_face: Vec<IdentityId> = h
            .store
            .list_identities()
            .unwrap()
            .into_iter()
            .filter(|i| i.face_signature.is_some())
            .map(|i| i.id)
            .collect();
        assert_eq!(with_face, vec![first]);
    }

    #[test]
    fn test_enrichment_can_be_disabled() {
        let config = IdentityConfig {
            enrich_signatures: false,
            ..IdentityConfig::default()
        };
        let h = harness(vec![face(1.0)], Box::new(ImmediateCommit), config);
        let mut state = TrackState::new(1);
        h.resolver.step(&mut state, &sharp_crop());
        let outcome = h.resolver.step(&mut state, &sharp_crop());
        assert!(matches!(
            outcome,
            ResolutionOutcome::AlreadyResolved { attached: None, .. }
        ));
        assert!(h.store.list_identities().unwrap()[0]
            .appearance_signature
            .is_none());
    }
}
