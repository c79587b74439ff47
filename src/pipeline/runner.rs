// src/pipeline/runner.rs
//
// Owns the session on a dedicated thread. Commands arrive over an mpsc
// channel and are applied between frames, so a source switch never lands
// in the middle of one. Every processed frame is broadcast to all
// subscribers; viewers never touch the capture handle. Viewers that fall
// behind the fan-out capacity skip frames, recorders never do.

use super::frame_context::FrameReport;
use super::metrics::{MetricsSummary, PipelineMetrics};
use super::session::{PipelineSession, StepOutcome};
use crate::source::FrameSource;
use anyhow::{anyhow, Context, Result};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, error, info};

pub enum RunnerCommand {
    SetSource(Box<dyn FrameSource>),
    Reset,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    /// Waiting for a source
    Idle,
    Running { epoch: u64 },
    /// The epoch's source ran out after `frames` processed frames.
    Finished { epoch: u64, frames: u64 },
    Stopped,
}

type Recorders = Arc<Mutex<Vec<mpsc::UnboundedSender<Arc<FrameReport>>>>>;

pub struct SessionRunner {
    commands: mpsc::UnboundedSender<RunnerCommand>,
    reports: broadcast::Sender<Arc<FrameReport>>,
    recorders: Recorders,
    state: watch::Receiver<RunnerState>,
    metrics: PipelineMetrics,
    handle: Option<JoinHandle<MetricsSummary>>,
}

impl SessionRunner {
    pub fn spawn(session: PipelineSession, fanout_capacity: usize) -> Result<Self> {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (reports, _) = broadcast::channel(fanout_capacity.max(1));
        let (state_tx, state) = watch::channel(RunnerState::Idle);
        let metrics = session.metrics().clone();
        let recorders: Recorders = Arc::default();

        let report_tx = reports.clone();
        let loop_recorders = recorders.clone();
        let handle = std::thread::Builder::new()
            .name("ppe-frame-loop".to_string())
            .spawn(move || frame_loop(session, command_rx, report_tx, loop_recorders, state_tx))
            .context("Failed to spawn frame loop thread")?;

        info!("✓ Frame loop started");
        Ok(Self {
            commands,
            reports,
            recorders,
            state,
            metrics,
            handle: Some(handle),
        })
    }

    pub fn set_source(&self, source: Box<dyn FrameSource>) -> Result<()> {
        self.send(RunnerCommand::SetSource(source))
    }

    pub fn reset(&self) -> Result<()> {
        self.send(RunnerCommand::Reset)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<FrameReport>> {
        self.reports.subscribe()
    }

    /// Every report from the next processed frame on, in order. Unbounded;
    /// the channel closes once the frame loop has stopped.
    pub fn record(&self) -> mpsc::UnboundedReceiver<Arc<FrameReport>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.recorders
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    pub fn state(&self) -> watch::Receiver<RunnerState> {
        self.state.clone()
    }

    pub fn metrics(&self) -> &PipelineMetrics {
        &self.metrics
    }

    /// Stop the loop after the current frame and wait for it.
    pub fn shutdown(mut self) -> Result<MetricsSummary> {
        // The loop may already be gone; joining reports how it ended.
        let _ = self.commands.send(RunnerCommand::Shutdown);
        let handle = self
            .handle
            .take()
            .ok_or_else(|| anyhow!("frame loop already joined"))?;
        handle
            .join()
            .map_err(|_| anyhow!("frame loop thread panicked"))
    }

    fn send(&self, command: RunnerCommand) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| anyhow!("frame loop is not running"))
    }
}

fn frame_loop(
    mut session: PipelineSession,
    mut commands: mpsc::UnboundedReceiver<RunnerCommand>,
    reports: broadcast::Sender<Arc<FrameReport>>,
    recorders: Recorders,
    state: watch::Sender<RunnerState>,
) -> MetricsSummary {
    let mut processed = 0u64;

    loop {
        // Idle: block until there is something to do.
        let next = if session.has_source() {
            commands.try_recv().ok()
        } else {
            match commands.blocking_recv() {
                Some(command) => Some(command),
                None => break,
            }
        };

        match next {
            Some(RunnerCommand::Shutdown) => break,
            Some(RunnerCommand::SetSource(source)) => {
                session.set_source(source);
                processed = 0;
                state.send_replace(RunnerState::Running {
                    epoch: session.epoch(),
                });
                continue;
            }
            Some(RunnerCommand::Reset) => {
                session.reset();
                processed = 0;
                if session.has_source() {
                    state.send_replace(RunnerState::Running {
                        epoch: session.epoch(),
                    });
                }
                continue;
            }
            None => {}
        }

        match session.step() {
            Ok(StepOutcome::Processed(report)) => {
                processed += 1;
                let report = Arc::new(report);
                recorders
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .retain(|tx| tx.send(report.clone()).is_ok());
                if reports.send(report).is_err() {
                    debug!("No report subscribers");
                }
            }
            Ok(StepOutcome::Skipped { .. }) => {}
            Ok(StepOutcome::Exhausted) => {
                state.send_replace(RunnerState::Finished {
                    epoch: session.epoch(),
                    frames: processed,
                });
            }
            Err(e) => {
                error!("Frame source failed, stopping it: {:#}", e);
                session.close_source();
                state.send_replace(RunnerState::Finished {
                    epoch: session.epoch(),
                    frames: processed,
                });
            }
        }
    }

    state.send_replace(RunnerState::Stopped);
    session.teardown()
}
