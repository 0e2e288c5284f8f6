use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use facelog_core::{
    DetectorOptions, FrameMatcher, LoadPolicy, Metric, OnnxEncoder, ReferenceSet,
};
use facelog_hw::{Camera, ReplaySource, VideoSource};
use serde::Serialize;
use std::future::Future;
use std::path::PathBuf;
use tokio::sync::oneshot;
use tracing_subscriber::EnvFilter;

mod config;
mod render;
mod session;

use config::Config;
use render::OverlayRenderer;
use session::{CaptureSession, SessionOptions, SessionReport, StopReason, StopSignal};

#[derive(Parser)]
#[command(
    name = "facelog",
    version,
    about = "Recognize known faces on a camera feed and log when each was first seen"
)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture frames and log attendance until stopped (default)
    Run(RunArgs),
    /// Load the reference images and list the people found
    References(ReferenceArgs),
    /// List V4L2 capture devices
    Devices,
}

#[derive(Args, Default)]
struct RunArgs {
    /// Directory of reference images, one person per file
    #[arg(long)]
    known_faces: Option<PathBuf>,
    /// Attendance CSV to write on exit
    #[arg(short, long)]
    output: Option<PathBuf>,
    /// V4L2 device path
    #[arg(long)]
    camera: Option<String>,
    /// Replay images from a directory instead of the camera
    #[arg(long)]
    replay: Option<PathBuf>,
    /// Directory containing the ONNX models
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Distance metric: euclidean or cosine
    #[arg(long)]
    metric: Option<Metric>,
    /// Match only faces strictly closer than this distance
    #[arg(long)]
    threshold: Option<f32>,
    /// Shrink frames by this factor before detection
    #[arg(long)]
    downsample: Option<u32>,
    /// Fail if any reference image has no usable face
    #[arg(long)]
    strict: bool,
    /// Save the latest annotated frame to this file
    #[arg(long)]
    snapshot: Option<PathBuf>,
    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(dir) = &self.known_faces {
            config.known_faces_dir = dir.clone();
        }
        if let Some(path) = &self.output {
            config.attendance_path = path.clone();
        }
        if let Some(device) = &self.camera {
            config.camera_device = device.clone();
        }
        if let Some(dir) = &self.replay {
            config.replay_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.model_dir {
            config.model_dir = dir.clone();
        }
        if let Some(metric) = self.metric {
            config.metric = metric;
        }
        if let Some(threshold) = self.threshold {
            config.distance_threshold = threshold;
        }
        if let Some(factor) = self.downsample {
            config.downsample_factor = factor;
        }
        if self.strict {
            config.strict_references = true;
        }
        if let Some(path) = &self.snapshot {
            config.snapshot_path = Some(path.clone());
        }
        if let Some(max) = self.max_frames {
            config.max_frames = Some(max);
        }
    }
}

#[derive(Args)]
struct ReferenceArgs {
    /// Directory of reference images
    #[arg(long)]
    known_faces: Option<PathBuf>,
    /// Directory containing the ONNX models
    #[arg(long)]
    model_dir: Option<PathBuf>,
    /// Fail if any reference image has no usable face
    #[arg(long)]
    strict: bool,
    /// Print as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct ReferenceSummary<'a> {
    label: &'a str,
    dim: usize,
    model_version: Option<&'a str>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run(RunArgs::default())) {
        Commands::Run(args) => {
            args.apply(&mut config);
            config.validate()?;
            run(config, args.json).await
        }
        Commands::References(args) => {
            if let Some(dir) = args.known_faces {
                config.known_faces_dir = dir;
            }
            if let Some(dir) = args.model_dir {
                config.model_dir = dir;
            }
            if args.strict {
                config.strict_references = true;
            }
            config.validate()?;
            list_references(&config, args.json)
        }
        Commands::Devices => {
            list_devices();
            Ok(())
        }
    }
}

async fn run(config: Config, json: bool) -> Result<()> {
    // Models and references are loaded before capture starts so a bad
    // setup fails without touching the camera.
    let mut encoder = load_encoder(&config)?;
    let references = load_references(&config, &mut encoder)?;
    if references.is_empty() {
        tracing::warn!("no reference faces loaded; every face will be reported as Unknown");
    }
    let matcher = FrameMatcher::new(references, config.metric, config.distance_threshold);

    let stop = StopSignal::new();
    spawn_stdin_watcher(stop.clone());

    let (reply_tx, reply_rx) = oneshot::channel();
    let session_stop = stop.clone();
    std::thread::Builder::new()
        .name("facelog-capture".into())
        .spawn(move || {
            let result = capture(&config, encoder, matcher, session_stop);
            let _ = reply_tx.send(result);
        })
        .context("failed to spawn capture thread")?;

    tracing::info!("capturing; press q then Enter, or Ctrl-C, to stop");

    let reply = match await_capture(reply_rx, &stop, wait_for_interrupt).await {
        Shutdown::Finished(reply) => reply,
        Shutdown::Forced => {
            tracing::warn!("second interrupt; exiting without writing attendance");
            std::process::exit(FORCED_EXIT_CODE);
        }
    };
    let report = reply.map_err(|_| anyhow!("capture thread exited without a report"))??;

    print_report(&report, json)?;

    if let StopReason::CaptureFailed(message) = &report.stop_reason {
        bail!("capture failed: {message}");
    }
    Ok(())
}

/// Runs on the capture thread: open the source, then drive the session to completion.
fn capture(
    config: &Config,
    encoder: OnnxEncoder,
    matcher: FrameMatcher,
    stop: StopSignal,
) -> Result<SessionReport> {
    let source: Box<dyn VideoSource> = match &config.replay_dir {
        Some(dir) => Box::new(
            ReplaySource::open(dir)
                .with_context(|| format!("failed to open replay directory {}", dir.display()))?,
        ),
        None => {
            let mut camera = Camera::open(
                &config.camera_device,
                config.capture_width,
                config.capture_height,
            )
            .with_context(|| format!("failed to open camera {}", config.camera_device))?;
            camera.warm_up(config.warmup_frames)?;
            Box::new(camera)
        }
    };

    let renderer = OverlayRenderer::new(config.snapshot_path.clone())
        .context("failed to set up overlay renderer")?;
    let options = SessionOptions {
        attendance_path: config.attendance_path.clone(),
        downsample_factor: config.downsample_factor,
        max_frames: config.max_frames,
    };

    let mut session = CaptureSession::new(source, encoder, renderer, matcher, options, stop);
    let report = session.run()?;
    tracing::debug!(state = ?session.state(), frames = report.frames, "capture thread finished");
    Ok(report)
}

/// Exit status after a second interrupt, as for a process killed by SIGINT.
const FORCED_EXIT_CODE: i32 = 130;

/// How waiting on the capture thread ended.
enum Shutdown<T> {
    /// The capture thread replied (or hung up).
    Finished(T),
    /// A second interrupt arrived while the capture thread was still stopping.
    Forced,
}

/// Wait for the capture thread's reply.
///
/// The first interrupt triggers `stop` and keeps waiting for the session to
/// flush. A second one gives up on the thread, which may be stuck in a
/// blocking device read.
async fn await_capture<T, F, Fut>(
    mut reply_rx: oneshot::Receiver<T>,
    stop: &StopSignal,
    mut interrupt: F,
) -> Shutdown<Result<T, oneshot::error::RecvError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    tokio::select! {
        reply = &mut reply_rx => return Shutdown::Finished(reply),
        _ = interrupt() => {}
    }

    tracing::info!("interrupt received; stopping capture (Ctrl-C again to force quit)");
    stop.trigger();

    tokio::select! {
        reply = &mut reply_rx => Shutdown::Finished(reply),
        _ = interrupt() => Shutdown::Forced,
    }
}

/// Resolves on Ctrl-C. If the handler cannot be installed, never resolves.
async fn wait_for_interrupt() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "cannot listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Trigger `stop` when a line reading `q` arrives on stdin.
///
/// Runs on a detached thread; a blocking stdin read must not hold up runtime shutdown.
fn spawn_stdin_watcher(stop: StopSignal) {
    let spawned = std::thread::Builder::new()
        .name("facelog-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lines() {
                match line {
                    Ok(line) if line.trim().eq_ignore_ascii_case("q") => {
                        tracing::info!("quit requested");
                        stop.trigger();
                        return;
                    }
                    Ok(_) => {}
                    Err(_) => return,
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!(error = %e, "stdin watcher unavailable; use Ctrl-C to stop");
    }
}

fn load_encoder(config: &Config) -> Result<OnnxEncoder> {
    let options = DetectorOptions {
        confidence_threshold: config.detection_confidence,
        ..DetectorOptions::default()
    };
    OnnxEncoder::load(
        &config.scrfd_model_path(),
        &config.arcface_model_path(),
        options,
    )
    .with_context(|| format!("failed to load models from {}", config.model_dir.display()))
}

fn load_references(config: &Config, encoder: &mut OnnxEncoder) -> Result<ReferenceSet> {
    let policy = if config.strict_references {
        LoadPolicy::Strict
    } else {
        LoadPolicy::Lenient
    };
    ReferenceSet::load_dir(&config.known_faces_dir, encoder, policy).with_context(|| {
        format!(
            "failed to load reference faces from {}",
            config.known_faces_dir.display()
        )
    })
}

fn list_references(config: &Config, json: bool) -> Result<()> {
    let mut encoder = load_encoder(config)?;
    let references = load_references(config, &mut encoder)?;

    let summaries: Vec<ReferenceSummary> = references
        .entries()
        .iter()
        .map(|entry| ReferenceSummary {
            label: &entry.label,
            dim: entry.embedding.dim(),
            model_version: entry.embedding.model_version.as_deref(),
        })
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(());
    }

    if summaries.is_empty() {
        println!("No reference faces in {}", config.known_faces_dir.display());
        return Ok(());
    }
    println!("{:<24} {:>5}", "NAME", "DIM");
    for summary in &summaries {
        println!("{:<24} {:>5}", summary.label, summary.dim);
    }
    Ok(())
}

fn list_devices() {
    let devices = Camera::list_devices();
    if devices.is_empty() {
        println!("No V4L2 capture devices found");
        return;
    }
    for device in devices {
        println!(
            "{}  {} (driver: {}, bus: {})",
            device.path, device.name, device.driver, device.bus
        );
    }
}

fn print_report(report: &SessionReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }

    println!(
        "{} frame(s) processed, stopped: {:?}",
        report.frames, report.stop_reason
    );
    println!(
        "{} attendee(s) written to {}",
        report.records.len(),
        report.attendance_path.display()
    );
    for record in &report.records {
        println!("  {:<24} {}", record.label, record.formatted_time());
    }
    Ok(())
}
