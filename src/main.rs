// src/main.rs

use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use ppe_monitor::biometrics::{build_appearance_provider, build_face_provider};
use ppe_monitor::detection::{ClassCatalog, DetectionProvider, PersonTracker, ReplayDetectionProvider};
use ppe_monitor::persistence::{
    DiskEvidenceSink, EvidenceSink, InMemoryStore, MemoryEvidenceSink, PersistenceStore, SqliteStore,
};
use ppe_monitor::pipeline::{
    FrameReport, PipelineSession, RunnerState, SessionComponents, SessionRunner,
};
use ppe_monitor::source::open_source;
use ppe_monitor::Config;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ppe-monitor")]
#[command(about = "PPE compliance monitoring with durable worker identities", long_about = None)]
#[command(version)]
struct Cli {
    /// YAML configuration file
    #[arg(short, long, global = true, default_value = "config.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Process a video file or a directory of images.
    Run {
        #[arg(short, long)]
        source: PathBuf,
        /// Replay recorded detections (JSON lines) instead of running the detector
        #[arg(long)]
        detections: Option<PathBuf>,
        /// Write one JSON frame report per line to this file
        #[arg(long)]
        report: Option<PathBuf>,
        /// Frame rate assumed for image directories
        #[arg(long, default_value_t = 25.0)]
        fps: f64,
        /// Keep identities and violations in memory only
        #[arg(long)]
        no_db: bool,
    },

    /// List registered workers.
    Workers,

    /// List recent violations, newest first.
    Violations {
        #[arg(long, default_value_t = 60)]
        since_minutes: i64,
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

fn load_config(path: &Path) -> Result<Config> {
    if path.exists() {
        return Config::load(path);
    }
    let config = Config::default();
    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli.config)?;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    if !cli.config.exists() {
        warn!("{} not found, using built-in defaults", cli.config.display());
    }

    match cli.command {
        Command::Run {
            source,
            detections,
            report,
            fps,
            no_db,
        } => run(config, &source, detections.as_deref(), report.as_deref(), fps, no_db).await,
        Command::Workers => list_workers(&config),
        Command::Violations {
            since_minutes,
            limit,
        } => list_violations(&config, since_minutes, limit),
    }
}

fn build_detector(config: &Config, detections: Option<&Path>) -> Result<Box<dyn DetectionProvider>> {
    if let Some(path) = detections {
        let catalog = ClassCatalog::new(&config.detection.classes);
        let tracker = PersonTracker::new(config.detection.tracker.clone());
        return Ok(Box::new(ReplayDetectionProvider::open(path, catalog, Some(tracker))?));
    }

    match &config.models.detector {
        #[cfg(feature = "onnx")]
        Some(model) => Ok(Box::new(ppe_monitor::detection::YoloTrackingProvider::new(
            model,
            &config.detection,
        )?)),
        #[cfg(not(feature = "onnx"))]
        Some(_) => bail!("models.detector needs a build with the `onnx` feature; use --detections to replay"),
        None => bail!("No detector: configure models.detector or pass --detections"),
    }
}

fn open_store(config: &Config) -> Result<Arc<dyn PersistenceStore>> {
    let path = Path::new(&config.storage.database_path);
    Ok(Arc::new(SqliteStore::open(path)?))
}

fn write_report(writer: &mut Option<BufWriter<File>>, report: &FrameReport) -> Result<()> {
    if let Some(w) = writer.as_mut() {
        writeln!(w, "{}", report.to_json_line()?)?;
    }
    Ok(())
}

async fn run(
    config: Config,
    source: &Path,
    detections: Option<&Path>,
    report: Option<&Path>,
    fps: f64,
    no_db: bool,
) -> Result<()> {
    info!("🦺 PPE monitor starting");

    let detector = build_detector(&config, detections)?;
    let face = build_face_provider(&config.models)?;
    let appearance = build_appearance_provider(&config.models)?;

    let (store, evidence): (Arc<dyn PersistenceStore>, Arc<dyn EvidenceSink>) = if no_db {
        info!("In-memory store: nothing will be persisted");
        (Arc::new(InMemoryStore::new()), Arc::new(MemoryEvidenceSink::new()))
    } else {
        (open_store(&config)?, Arc::new(DiskEvidenceSink::new(&config.storage)?))
    };

    let fanout = config.runtime.fanout_capacity;
    let session = PipelineSession::create(
        config,
        SessionComponents {
            detector,
            face,
            appearance,
            store,
            evidence,
        },
    )?;
    let runner = SessionRunner::spawn(session, fanout)?;
    // Recorded, not subscribed: the report file must hold every frame.
    let mut reports = runner.record();
    let mut state = runner.state();

    let mut writer = match report {
        Some(path) => Some(BufWriter::new(
            File::create(path).with_context(|| format!("Failed to create {}", path.display()))?,
        )),
        None => None,
    };

    runner.set_source(open_source(source, fps)?)?;

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                warn!("Interrupted, stopping");
                break;
            }
            received = reports.recv() => match received {
                Some(report) => write_report(&mut writer, &report)?,
                None => break,
            },
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                if matches!(current, RunnerState::Finished { .. } | RunnerState::Stopped) {
                    break;
                }
            }
        }
    }

    let summary = tokio::task::spawn_blocking(move || runner.shutdown()).await??;

    // The frame loop has stopped; drain what it recorded before that.
    while let Some(report) = reports.recv().await {
        write_report(&mut writer, &report)?;
    }
    if let Some(mut w) = writer {
        w.flush()?;
    }
    info!("Summary:\n{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn list_workers(config: &Config) -> Result<()> {
    let store = open_store(config)?;
    let identities = store.list_identities()?;
    println!("{} registered workers", identities.len());
    for identity in identities {
        let kinds: Vec<&str> = [
            identity.face_signature.as_ref().map(|_| "face"),
            identity.appearance_signature.as_ref().map(|_| "appearance"),
        ]
        .into_iter()
        .flatten()
        .collect();
        println!(
            "{}  {:<20}  {:<16}  {}  {}",
            identity.id,
            identity.display_name,
            kinds.join("+"),
            identity.created_at.format("%Y-%m-%d %H:%M:%S"),
            identity.evidence_ref
        );
    }
    Ok(())
}

fn list_violations(config: &Config, since_minutes: i64, limit: usize) -> Result<()> {
    let store = open_store(config)?;
    let since = Utc::now() - Duration::minutes(since_minutes.max(0));
    let violations = store.list_recent_violations(since, limit)?;
    println!(
        "{} violations in the last {} minutes",
        violations.len(),
        since_minutes
    );
    for v in violations {
        let missing: Vec<&str> = v.violated_items.iter().map(String::as_str).collect();
        println!(
            "{}  {:<20}  track {:<4}  missing {:<24}  {}",
            v.timestamp.format("%Y-%m-%d %H:%M:%S"),
            v.display_name.as_deref().unwrap_or(v.identity_id.as_str()),
            v.track_id,
            missing.join(", "),
            v.evidence_ref
        );
    }
    Ok(())
}
