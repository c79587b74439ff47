// src/pipeline/session.rs
//
// One owned pipeline session: a frame source, the per-session track state
// and aggregate counts, and the long-lived identity registry. Frames are
// processed strictly one after another; the persons of a frame may run
// on the rayon pool because each works on its own checked-out track state
// and the registry serializes find-then-register.

use super::event_bus::{EventBus, PipelineEvent};
use super::frame_context::{FrameReport, PersonReport};
use super::metrics::{MetricsSummary, PipelineMetrics};
use super::stats::{SessionAggregator, SessionStats};
use crate::biometrics::{AppearanceSignatureProvider, FaceSignatureProvider};
use crate::detection::{partition, ClassCatalog, DetectionProvider, PersonDetection};
use crate::geometry::clamp_to_frame;
use crate::identity::{policy_from_config, IdentityRegistry, IdentityResolver, ResolutionOutcome};
use crate::persistence::{EvidenceSink, PersistenceStore, ViolationEvent};
use crate::ppe::{EquipmentDetection, PpeAssociationEngine, ViolationDecision, ViolationDeterminizer};
use crate::quality::QualityGate;
use crate::source::FrameSource;
use crate::track_state::{TrackState, TrackStateStore};
use crate::types::{Config, Frame};
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use image::RgbImage;
use rayon::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// External collaborators of a session.
pub struct SessionComponents {
    pub detector: Box<dyn DetectionProvider>,
    pub face: Arc<dyn FaceSignatureProvider>,
    pub appearance: Arc<dyn AppearanceSignatureProvider>,
    pub store: Arc<dyn PersistenceStore>,
    pub evidence: Arc<dyn EvidenceSink>,
}

#[derive(Debug)]
pub enum StepOutcome {
    Processed(FrameReport),
    /// Frame dropped by the stride or by a detector failure.
    Skipped { frame_id: u64 },
    /// No source, or the source has no more frames.
    Exhausted,
}

struct PersonOutcome {
    resolution: ResolutionOutcome,
    equipped: BTreeSet<String>,
    missing: BTreeSet<String>,
    decision: ViolationDecision,
}

pub struct PipelineSession {
    config: Config,
    detector: Box<dyn DetectionProvider>,
    catalog: ClassCatalog,
    resolver: IdentityResolver,
    association: PpeAssociationEngine,
    determinizer: ViolationDeterminizer,
    store: Arc<dyn PersistenceStore>,
    tracks: TrackStateStore,
    aggregator: SessionAggregator,
    events: EventBus,
    metrics: PipelineMetrics,
    source: Option<Box<dyn FrameSource>>,
    epoch: u64,
    started_at: DateTime<Utc>,
    frames_received: u64,
}

impl PipelineSession {
    pub fn create(config: Config, components: SessionComponents) -> Result<Self> {
        config.validate()?;

        let registry = Arc::new(
            IdentityRegistry::load(components.store.clone())
                .context("Registry warm start failed")?,
        );
        let resolver = IdentityResolver::new(
            registry,
            components.face,
            components.appearance,
            components.evidence.clone(),
            policy_from_config(&config.identity.confirmation),
            QualityGate::new(&config.quality),
            config.identity.clone(),
        );
        let determinizer = ViolationDeterminizer::new(
            config.compliance.required.iter().cloned(),
            components.store.clone(),
            components.evidence,
        );

        info!(
            "✓ Session created: detector={} required={:?} stride={} parallel={}",
            components.detector.name(),
            determinizer.required(),
            config.detection.frame_stride,
            config.runtime.parallel_persons
        );

        Ok(Self {
            catalog: ClassCatalog::new(&config.detection.classes),
            association: PpeAssociationEngine::new(&config.association),
            events: EventBus::new(config.runtime.event_bus_capacity),
            detector: components.detector,
            resolver,
            determinizer,
            store: components.store,
            tracks: TrackStateStore::new(),
            aggregator: SessionAggregator::new(),
            metrics: PipelineMetrics::new(),
            source: None,
            epoch: 0,
            started_at: Utc::now(),
            frames_received: 0,
            config,
        })
    }

    /// Replace the frame source. The old source is dropped and the session
    /// reset before the new source delivers its first frame.
    pub fn set_source(&mut self, source: Box<dyn FrameSource>) {
        info!("🎥 Source set: {}", source.name());
        self.source = None;
        self.reset();
        self.source = Some(source);
    }

    /// New session epoch: track state, aggregate counts and the tracker are
    /// cleared. The identity registry survives.
    pub fn reset(&mut self) {
        self.tracks.reset();
        self.aggregator.reset();
        self.detector.reset();
        self.events.drain();
        self.frames_received = 0;
        self.started_at = Utc::now();
        self.epoch += 1;
        self.events
            .publish(PipelineEvent::SessionReset { epoch: self.epoch });
        info!("🔄 Session reset (epoch {})", self.epoch);
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn has_source(&self) -> bool {
        self.source.is_some()
    }

    /// Drop the current source without starting a new epoch.
    pub fn close_source(&mut self) {
        self.source = None;
    }

    /// Pull one frame from the source and process it. Errors come only
    /// from the source itself.
    pub fn step(&mut self) -> Result<StepOutcome> {
        let Some(source) = self.source.as_mut() else {
            return Ok(StepOutcome::Exhausted);
        };
        let Some(frame) = source.next_frame()? else {
            info!("Source {} exhausted", source.name());
            self.source = None;
            return Ok(StepOutcome::Exhausted);
        };

        Ok(match self.process_frame(&frame) {
            Some(report) => StepOutcome::Processed(report),
            None => StepOutcome::Skipped {
                frame_id: frame.frame_id,
            },
        })
    }

    /// Drive the current source to its end. Returns the number of frames
    /// processed.
    pub fn run_to_end(&mut self, mut on_report: impl FnMut(&FrameReport)) -> Result<u64> {
        let mut processed = 0;
        loop {
            match self.step()? {
                StepOutcome::Processed(report) => {
                    processed += 1;
                    on_report(&report);
                }
                StepOutcome::Skipped { .. } => {}
                StepOutcome::Exhausted => return Ok(processed),
            }
        }
    }

    /// Process one frame. None when the frame is skipped; skipped frames
    /// never touch track state.
    pub fn process_frame(&mut self, frame: &Frame) -> Option<FrameReport> {
        self.metrics.inc(&self.metrics.total_frames);

        let index = self.frames_received;
        self.frames_received += 1;
        if index % u64::from(self.config.detection.frame_stride.max(1)) != 0 {
            self.metrics.inc(&self.metrics.frames_skipped);
            return None;
        }

        if frame.width() == 0 || frame.height() == 0 {
            debug!("Frame {} is empty, skipped", frame.frame_id);
            self.metrics.inc(&self.metrics.frames_skipped);
            return None;
        }

        let detect_start = Instant::now();
        let detections = match self.detector.detect_and_track(frame) {
            Ok(d) => d,
            Err(e) => {
                warn!("Detector failed on frame {}, skipped: {:#}", frame.frame_id, e);
                self.metrics.inc(&self.metrics.detector_errors);
                self.metrics.inc(&self.metrics.frames_skipped);
                return None;
            }
        };
        self.metrics.set_timing(
            &self.metrics.detection_time_us,
            detect_start.elapsed().as_micros() as u64,
        );

        let split = partition(&detections, &self.catalog, &self.config.detection);

        self.aggregator.begin_frame();
        for item in &split.equipment {
            self.aggregator.record_equipment(&item.kind);
        }

        let mut work: Vec<(PersonDetection, RgbImage, TrackState)> = Vec::new();
        for person in split.persons {
            let Some((x, y, w, h)) = clamp_to_frame(&person.bbox, frame.width(), frame.height())
            else {
                debug!("Track {}: box outside frame, dropped", person.track_id);
                self.metrics.inc(&self.metrics.crops_dropped);
                continue;
            };
            let crop = image::imageops::crop_imm(&frame.image, x, y, w, h).to_image();
            let state = self.tracks.checkout(person.track_id);
            work.push((person, crop, state));
        }

        let persons_start = Instant::now();
        let workers_in_frame = work.len();
        let results: Vec<(PersonDetection, TrackState, PersonOutcome)> = {
            let ctx = PersonContext {
                resolver: &self.resolver,
                association: &self.association,
                determinizer: &self.determinizer,
                equipment: &split.equipment,
            };
            if self.config.runtime.parallel_persons && work.len() > 1 {
                work.into_par_iter()
                    .map(|(person, crop, mut state)| {
                        let outcome = ctx.process(&mut state, &person, &crop);
                        (person, state, outcome)
                    })
                    .collect()
            } else {
                work.into_iter()
                    .map(|(person, crop, mut state)| {
                        let outcome = ctx.process(&mut state, &person, &crop);
                        (person, state, outcome)
                    })
                    .collect()
            }
        };
        self.metrics.set_timing(
            &self.metrics.persons_time_us,
            persons_start.elapsed().as_micros() as u64,
        );

        let mut persons = Vec::with_capacity(results.len());
        for (person, state, outcome) in results {
            self.record(&state, &outcome);
            persons.push(PersonReport {
                track_id: person.track_id,
                bbox: person.bbox,
                identity: state.resolved_identity().cloned(),
                phase: state.phase,
                compliance: self.determinizer.compliance(&outcome.missing),
                equipped: outcome.equipped,
                missing: outcome.missing,
                violation_logged: state.violation_logged(),
            });
            self.tracks.checkin(state);
        }

        self.aggregator
            .finish_frame(workers_in_frame, self.tracks.len());
        self.metrics.inc(&self.metrics.frames_processed);
        self.metrics
            .add(&self.metrics.persons_processed, workers_in_frame as u64);
        self.log_summary();

        Some(FrameReport {
            epoch: self.epoch,
            frame_id: frame.frame_id,
            timestamp_ms: frame.timestamp_ms,
            persons,
            stats: self.aggregator.snapshot(),
            events: self.events.drain(),
        })
    }

    fn record(&mut self, state: &TrackState, outcome: &PersonOutcome) {
        let track_id = state.track_id;
        match &outcome.resolution {
            ResolutionOutcome::Resolved {
                id,
                kind,
                registered,
            } => {
                let event = if *registered {
                    self.metrics.inc(&self.metrics.identities_registered);
                    PipelineEvent::IdentityRegistered {
                        track_id,
                        identity_id: id.clone(),
                        kind: *kind,
                    }
                } else {
                    self.metrics.inc(&self.metrics.identities_matched);
                    PipelineEvent::IdentityResolved {
                        track_id,
                        identity_id: id.clone(),
                        kind: *kind,
                    }
                };
                self.events.publish(event);
            }
            ResolutionOutcome::AlreadyResolved {
                id,
                attached: Some(kind),
            } => self.events.publish(PipelineEvent::SignatureAttached {
                track_id,
                identity_id: id.clone(),
                kind: *kind,
            }),
            ResolutionOutcome::RegistrationFailed {
                kind,
                failures,
                error,
                ..
            } => {
                self.metrics.inc(&self.metrics.registration_failures);
                self.events.publish(PipelineEvent::RegistrationFailed {
                    track_id,
                    kind: *kind,
                    failures: *failures,
                    error: error.clone(),
                });
            }
            _ => {}
        }

        match &outcome.decision {
            ViolationDecision::Logged(event) => {
                self.aggregator.record_violation();
                self.metrics.inc(&self.metrics.violations_logged);
                self.events
                    .publish(PipelineEvent::ViolationLogged(event.clone()));
            }
            ViolationDecision::Deferred { missing, error } => {
                self.metrics.inc(&self.metrics.violations_deferred);
                self.events.publish(PipelineEvent::ViolationDeferred {
                    track_id,
                    missing: missing.clone(),
                    error: error.clone(),
                });
            }
            _ => {}
        }
    }

    fn log_summary(&self) {
        let every = self.config.logging.summary_every_frames;
        let stats = self.aggregator.snapshot();
        if every == 0 || stats.frames_processed % every != 0 {
            return;
        }
        info!(
            "📊 Epoch {} frame {}: {} tracks ({} resolved), {} identities, {} violations, {:.1} fps",
            self.epoch,
            stats.frames_processed,
            self.tracks.len(),
            self.tracks.resolved_count(),
            self.resolver.registry().len(),
            stats.violation_count,
            self.metrics.fps()
        );
    }

    pub fn stats(&self) -> SessionStats {
        self.aggregator.snapshot()
    }

    pub fn track(&self, track_id: u32) -> Option<&TrackState> {
        self.tracks.get(track_id)
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        self.resolver.registry()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Violations logged since this session epoch started, newest first.
    pub fn recent_violations(&self, limit: usize) -> Result<Vec<ViolationEvent>> {
        self.store.list_recent_violations(self.started_at, limit)
    }

    pub fn teardown(mut self) -> MetricsSummary {
        self.source = None;
        let summary = self.metrics.summary();
        info!(
            "Session closed: {} frames processed ({} skipped), {} identities registered, {} violations",
            summary.frames_processed,
            summary.frames_skipped,
            summary.identities_registered,
            summary.violations_logged
        );
        summary
    }
}

/// Shared, read-only view of the session used by per-person work.
struct PersonContext<'a> {
    resolver: &'a IdentityResolver,
    association: &'a PpeAssociationEngine,
    determinizer: &'a ViolationDeterminizer,
    equipment: &'a [EquipmentDetection],
}

impl PersonContext<'_> {
    fn process(&self, state: &mut TrackState, person: &PersonDetection, crop: &RgbImage) -> PersonOutcome {
        let resolution = self.resolver.step(state, crop);
        let equipped = self.association.equipped_for(&person.bbox, self.equipment);
        let missing = self.determinizer.missing(&equipped);
        let decision = self.determinizer.evaluate(state, &equipped, crop);
        PersonOutcome {
            resolution,
            equipped,
            missing,
            decision,
        }
    }
}
