use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rollcall_core::roster::reference_images;
use rollcall_core::{AttendanceSession, EnrollError, Headcount, Identity, OnnxAnalyzer, RosterStore};
use rollcall_hw::Camera;
use rollcall_report::PdfReport;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tracing_subscriber::EnvFilter;

mod config;
mod controller;

use config::Config;
use controller::{ControllerError, SessionController};

#[derive(Parser)]
#[command(name = "rollcall", about = "Face-recognition attendance taking")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Add a person to the roster
    Enroll {
        /// Name to enroll under (also the reference image file name)
        #[arg(short, long)]
        name: String,
        /// Use this image instead of capturing from the camera
        #[arg(short, long)]
        image: Option<PathBuf>,
    },
    /// Run an attendance session and write today's report
    Take {
        /// Stop after this many seconds instead of waiting for Ctrl-C
        #[arg(short, long)]
        duration: Option<u64>,
    },
    /// List enrolled people
    List {
        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// List video capture devices
    Devices,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "command failed");
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Enroll { name, image } => enroll(&config, &name, image.as_deref()),
        Commands::Take { duration } => take(&config, duration.map(Duration::from_secs)).await,
        Commands::List { json } => list(&config, json),
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No video capture devices found");
            }
            for dev in devices {
                println!("{}  {} ({}, {})", dev.path, dev.name, dev.driver, dev.bus);
            }
            Ok(())
        }
    }
}

fn load_analyzer(config: &Config) -> Result<OnnxAnalyzer> {
    let analyzer = OnnxAnalyzer::load(&config.model_dir)
        .with_context(|| format!("failed to load models from {}", config.model_dir.display()))?;
    tracing::info!(dir = %config.model_dir.display(), "models loaded");
    Ok(analyzer)
}

fn open_camera(config: &Config) -> Result<Camera> {
    let camera = Camera::open(&config.camera_device, config.frame_width, config.frame_height)
        .with_context(|| format!("camera {} unavailable", config.camera_device))?;
    tracing::info!(
        device = %config.camera_device,
        width = camera.width,
        height = camera.height,
        fourcc = ?camera.fourcc,
        "camera opened"
    );
    camera.discard_frames(config.warmup_frames);
    Ok(camera)
}

fn enroll(config: &Config, name: &str, from_file: Option<&Path>) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let mut store = RosterStore::load(&config.roster_dir, &mut analyzer)?;

    match from_file {
        Some(path) => {
            let reference = image::open(path)
                .with_context(|| format!("failed to read {}", path.display()))?
                .to_rgb8();
            store.enroll(name, &reference, &mut analyzer)?;
        }
        None => enroll_from_camera(config, &mut store, name, &mut analyzer)?,
    }

    println!("Enrolled {} ({} people on the roster)", name.trim(), store.roster().len());
    Ok(())
}

/// Grab frames until one holds a face or the attempts run out.
fn enroll_from_camera(
    config: &Config,
    store: &mut RosterStore,
    name: &str,
    analyzer: &mut OnnxAnalyzer,
) -> Result<()> {
    let camera = open_camera(config)?;
    println!("Look at the camera...");

    for attempt in 1..=config.enroll_attempts {
        let frame = camera.capture_frame()?;
        if frame.is_dark {
            tracing::debug!(attempt, "dark frame skipped");
            continue;
        }
        match store.enroll(name, &frame.image, analyzer) {
            Ok(_) => return Ok(()),
            Err(EnrollError::NoFaceDetected) => {
                tracing::debug!(attempt, "no face in frame");
            }
            Err(e) => return Err(e.into()),
        }
    }

    Err(EnrollError::NoFaceDetected)
        .with_context(|| format!("no face seen in {} frames", config.enroll_attempts))
}

async fn take(config: &Config, limit: Option<Duration>) -> Result<()> {
    let mut analyzer = load_analyzer(config)?;
    let store = RosterStore::load(&config.roster_dir, &mut analyzer)?;
    if store.roster().is_empty() {
        tracing::warn!(dir = %config.roster_dir.display(), "roster is empty; nobody can be marked present");
    }

    let session = AttendanceSession::new(store.roster().clone(), config.tolerance);
    let camera = open_camera(config)?;
    let mut controller = SessionController::new(camera, analyzer, session, config.downsample_factor);

    println!("Taking attendance. Press Ctrl-C to finish.");
    let outcome = poll(&mut controller, config.tick_interval(), limit).await;

    let today = chrono::Local::now().date_naive();
    let written = std::fs::create_dir_all(&config.report_dir)
        .with_context(|| format!("failed to create report directory {}", config.report_dir.display()))
        .and_then(|()| {
            let report = PdfReport::daily(&config.report_dir, today);
            Ok(controller.complete(&report, today)?)
        });

    match written {
        Ok(done) => {
            print_attendance(done.headcount, &done.present);
            println!("Report written to {}", done.report.display());
        }
        Err(e) => {
            controller.close();
            print_attendance(controller.headcount(), &controller.present());
            return Err(e.context("attendance was not saved to a report"));
        }
    }

    outcome.map_err(Into::into)
}

fn print_attendance(headcount: Headcount, present: &[Identity]) {
    println!("Present: {headcount}");
    for identity in present {
        println!("  {identity}");
    }
}

/// Tick at a fixed interval until Ctrl-C, the optional time limit, or a
/// fatal camera error.
async fn poll<S, A>(
    controller: &mut SessionController<S, A>,
    tick: Duration,
    limit: Option<Duration>,
) -> Result<(), ControllerError>
where
    S: rollcall_hw::FrameSource,
    A: rollcall_core::FaceAnalyzer,
{
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let deadline = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                tracing::info!("interrupted; finishing session");
                return Ok(());
            }
            _ = &mut deadline => {
                tracing::info!("time limit reached; finishing session");
                return Ok(());
            }
            _ = interval.tick() => match controller.tick() {
                Ok(tick) => {
                    tracing::trace!(matched = tick.overlays.len(), skipped = tick.skipped, "tick");
                    for event in &tick.events {
                        println!(
                            "{} present at {} ({})",
                            event.identity,
                            event.at.format("%H:%M:%S"),
                            controller.headcount()
                        );
                    }
                }
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => tracing::warn!(error = %e, "frame skipped"),
            },
        }
    }
}

#[derive(Serialize)]
struct RosterEntry {
    name: String,
    image: PathBuf,
}

fn list(config: &Config, json: bool) -> Result<()> {
    let entries: Vec<RosterEntry> = if config.roster_dir.is_dir() {
        reference_images(&config.roster_dir)?
            .into_iter()
            .map(|(identity, image)| RosterEntry {
                name: identity.to_string(),
                image,
            })
            .collect()
    } else {
        Vec::new()
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&entries)?);
    } else if entries.is_empty() {
        println!("No one enrolled");
    } else {
        for entry in &entries {
            println!("{}  {}", entry.name, entry.image.display());
        }
    }
    Ok(())
}
