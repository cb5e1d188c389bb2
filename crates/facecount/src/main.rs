use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use facecount_core::{CandidateFuser, FusionPolicy, Precedence, Rect};
use facecount_hw::Camera;
use serde::Deserialize;
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod config;
mod display;
mod overlay;
mod session;

use config::{Config, SinkKind};
use session::{ExitReason, Session, SessionSummary};

#[derive(Parser)]
#[command(name = "facecount", about = "Count faces in a live camera feed with two fused detectors")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the frame loop until the stream ends or Ctrl-C
    Run(RunArgs),
    /// List V4L2 capture devices
    Devices,
    /// Fuse two candidate sets given as JSON and print the result
    Fuse {
        /// {"primary": [{"x":..,"y":..,"width":..,"height":..}], "secondary": [...]}
        json: String,
        /// Visit the secondary set first
        #[arg(long)]
        secondary_first: bool,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,
    /// Camera device path or directory of images
    #[arg(short, long)]
    source: Option<String>,
    #[arg(long, value_enum)]
    sink: Option<SinkKind>,
    /// Snapshot output path
    #[arg(short, long)]
    output: Option<PathBuf>,
    #[arg(long)]
    max_frames: Option<u64>,
    /// Run both detectors concurrently
    #[arg(long)]
    parallel: bool,
    /// Print the session summary as JSON
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Deserialize)]
struct FuseRequest {
    primary: Vec<Rect>,
    #[serde(default)]
    secondary: Vec<Rect>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No V4L2 capture devices found");
            }
            for d in devices {
                println!("{}  {} ({}, {})", d.path, d.name, d.driver, d.bus);
            }
            Ok(())
        }
        Commands::Fuse {
            json,
            secondary_first,
        } => {
            let fused = fuse_json(&json, secondary_first)?;
            println!("{}", serde_json::to_string_pretty(&fused)?);
            Ok(())
        }
    }
}

fn build_config(args: &RunArgs) -> Result<Config> {
    let mut config = Config::load(args.config.as_deref())?;
    config.apply_env()?;

    if let Some(source) = &args.source {
        config.source = source.clone();
    }
    if let Some(sink) = args.sink {
        config.sink = sink;
    }
    if let Some(output) = &args.output {
        config.snapshot_path = output.clone();
    }
    if args.max_frames.is_some() {
        config.max_frames = args.max_frames;
    }
    if args.parallel {
        config.parallel_detectors = true;
    }

    config.validate()?;
    Ok(config)
}

async fn run(args: RunArgs) -> Result<()> {
    let config = build_config(&args)?;
    tracing::info!(source = %config.source, sink = ?config.sink, "facecount starting");

    let (stop_handle, stop) = display::stop_channel();
    let session = Session::open(&config, stop)?;

    let frame_loop = std::thread::Builder::new()
        .name("facecount-loop".into())
        .spawn(move || session.run())
        .context("failed to spawn frame loop thread")?;

    let ctrl_c_handle = stop_handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, stopping after current frame");
            ctrl_c_handle.request();
        }
    });

    let summary = tokio::task::spawn_blocking(move || frame_loop.join())
        .await?
        .map_err(|_| anyhow::anyhow!("frame loop panicked"))?;
    drop(stop_handle);

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }
    Ok(())
}

fn print_summary(summary: &SessionSummary) {
    let exit = match &summary.exit {
        ExitReason::StreamEnded => "stream ended".to_string(),
        ExitReason::StopRequested => "stop requested".to_string(),
        ExitReason::FrameLimitReached => "frame limit reached".to_string(),
        ExitReason::FrameFailure {
            iteration,
            stage,
            message,
        } => format!("frame {iteration} failed at {stage:?}: {message}"),
    };
    println!("Frames processed: {}", summary.frames_processed);
    println!("Faces (last frame): {}", summary.faces_last_frame);
    println!("Faces (max): {}", summary.max_faces);
    println!("Frame latency (max): {}ms", summary.max_frame_latency_ms);
    println!("Exit: {exit}");
    println!(
        "Duration: {:.2}s",
        (summary.ended_at - summary.started_at).num_milliseconds() as f64 / 1000.0
    );
}

fn fuse_json(json: &str, secondary_first: bool) -> Result<Vec<Rect>> {
    let request: FuseRequest = serde_json::from_str(json).context("invalid fuse request")?;
    let policy = FusionPolicy {
        precedence: if secondary_first {
            Precedence::SecondaryFirst
        } else {
            Precedence::PrimaryFirst
        },
        ..FusionPolicy::default()
    };
    Ok(CandidateFuser::new(policy).fuse(&request.primary, &request.secondary)?)
}
