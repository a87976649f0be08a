use anyhow::{Context, Result};
use clap::Parser;
use device_pilot::{pilot, PilotConfig};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "device-pilot")]
#[command(about = "Motion and light triggered event capture from a dual-stream RTSP camera")]
#[command(version)]
struct Args {
    /// Pre-roll duration in seconds
    #[arg(long = "pre-roll", value_name = "SEC")]
    pre_roll: Option<f64>,

    /// Cooldown duration in seconds
    #[arg(long, value_name = "SEC")]
    cooldown: Option<f64>,

    /// Motion threshold 0-1
    #[arg(long, value_name = "FRACTION")]
    motion_threshold: Option<f64>,

    /// Light jump threshold 0-255
    #[arg(long = "light-threshold", value_name = "DELTA")]
    light_threshold: Option<f64>,

    /// HLS buffer directory
    #[arg(long, value_name = "PATH")]
    buffer_dir: Option<PathBuf>,

    /// Session scratch directory
    #[arg(long, value_name = "PATH")]
    sessions_dir: Option<PathBuf>,

    /// Evidence output directory
    #[arg(long, value_name = "PATH")]
    evidence_dir: Option<PathBuf>,

    /// Main RTSP stream URL (high-res, recorded)
    #[arg(long = "rtsp-main", value_name = "URL")]
    rtsp_main: Option<String>,

    /// Sub RTSP stream URL (low-res, analyzed)
    #[arg(long = "rtsp-sub", value_name = "URL")]
    rtsp_sub: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn init_tracing(verbose: bool) {
    let default = if verbose {
        "device_pilot=debug,info"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Environment first, CLI flags on top.
fn build_config(args: Args) -> Result<PilotConfig> {
    let mut config = PilotConfig::from_env().context("failed to read environment")?;

    if let Some(v) = args.pre_roll {
        config.pre_roll_seconds = v;
    }
    if let Some(v) = args.cooldown {
        config.cooldown_seconds = v;
    }
    if let Some(v) = args.motion_threshold {
        config.motion_threshold = v;
    }
    if let Some(v) = args.light_threshold {
        config.light_jump_threshold = v;
    }
    if let Some(v) = args.buffer_dir {
        config.buffer_dir = v;
    }
    if let Some(v) = args.sessions_dir {
        config.sessions_dir = v;
    }
    if let Some(v) = args.evidence_dir {
        config.evidence_dir = v;
    }
    if let Some(v) = args.rtsp_main {
        config.rtsp_url_main = v;
    }
    if let Some(v) = args.rtsp_sub {
        config.rtsp_url_sub = v;
    }
    config.verbose = args.verbose;

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.verbose);

    let config = match build_config(args) {
        Ok(config) => config,
        Err(e) => {
            error!("configuration error: {e:#}");
            std::process::exit(1);
        }
    };

    if let Err(e) = pilot::run(config).await {
        error!("fatal: {e:#}");
        std::process::exit(2);
    }
}
