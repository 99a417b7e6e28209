// src/main.rs - Limb host running the control core against the loopback robot
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use limb_rs::actions::StaticActionCatalog;
use limb_rs::command::Crc32Codec;
use limb_rs::config::{self, Config};
use limb_rs::mode::{ControlMode, LocalModeSwitcher};
use limb_rs::transport::LoopbackTransport;
use limb_rs::{ControlHandle, JointId, Limb};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Limb host CLI
#[derive(Parser, Debug)]
#[command(name = "limb-host", about = "Runs the joint-control core against a simulated robot.")]
struct Cli {
    /// Path to a TOML config file (defaults apply when omitted)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Maximum log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: tracing::Level,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    run_for_s: Option<f64>,

    /// Seconds between status reports
    #[arg(long, default_value_t = 1.0)]
    status_every_s: f64,

    /// Run a short arm motion sequence after startup
    #[arg(long)]
    demo: bool,
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    // Initialize logging
    tracing_subscriber::fmt().with_max_level(cli.log_level).init();

    tracing::info!("Starting limb-host {}", env!("CARGO_PKG_VERSION"));

    let config = match cli.config {
        Some(ref path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            config::load_config(&path).map_err(|e| {
                tracing::error!("Failed to load config from '{}': {}", path, e);
                Box::new(e) as BoxError
            })?
        }
        None => {
            tracing::info!("No config file given, using defaults");
            Config::default()
        }
    };
    tracing::info!(
        "Tick period {:?}, initial mode {}, {} gain and {} limit overrides",
        config.control.tick_period(),
        config.mode.initial,
        config.gains.len(),
        config.limits.len()
    );

    let transport = Arc::new(LoopbackTransport::new(config.loopback.clone(), Arc::new(Crc32Codec)));
    let mut limb = Limb::new(
        config,
        transport,
        Arc::new(StaticActionCatalog::default()),
        Arc::new(LocalModeSwitcher),
    )
    .map_err(|e| {
        tracing::error!("Failed to initialize limb: {}", e);
        Box::new(e) as BoxError
    })?;

    if let Err(e) = limb.start().await {
        tracing::error!("Failed to start control core: {}", e);
        let _ = limb.shutdown().await;
        return Err(Box::new(e) as BoxError);
    }
    let handle = limb.handle();

    if cli.demo {
        let demo_handle = handle.clone();
        tokio::spawn(async move {
            if let Err(e) = run_demo(&demo_handle).await {
                tracing::error!("Demo sequence aborted: {}", e);
            }
        });
    }

    let mut report = tokio::time::interval(Duration::from_secs_f64(cli.status_every_s.max(0.01)));
    let deadline = async {
        match cli.run_for_s {
            Some(secs) => tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Ctrl-C received");
                break;
            }
            _ = &mut deadline => {
                tracing::info!("Run duration elapsed");
                break;
            }
            _ = report.tick() => {
                match serde_json::to_string(&handle.status()) {
                    Ok(json) => tracing::info!("status {}", json),
                    Err(e) => tracing::warn!("Failed to serialize status: {}", e),
                }
            }
        }
    }

    limb.shutdown().await?;
    tracing::info!("limb-host exited cleanly");
    Ok(())
}

/// Raise both arms in low-level mode, put them back, then hand control to
/// the action catalog.
async fn run_demo(handle: &ControlHandle) -> Result<(), BoxError> {
    let joint = |name: &str| JointId::from_name(name).ok_or_else(|| format!("unknown joint '{}'", name));

    handle.request_mode(ControlMode::LowLevel).await?;
    let raise = [
        (joint("left_shoulder_pitch")?, -1.2),
        (joint("right_shoulder_pitch")?, -1.2),
        (joint("left_elbow")?, -0.8),
        (joint("right_elbow")?, -0.8),
    ];
    let trajectory = handle.begin_trajectory(&raise, 2.0).await?;
    tokio::time::sleep(trajectory.duration() + Duration::from_millis(500)).await;

    let lower: Vec<_> = raise.iter().map(|(joint, _)| (*joint, 0.0)).collect();
    let trajectory = handle.begin_trajectory(&lower, 2.0).await?;
    tokio::time::sleep(trajectory.duration()).await;

    handle.request_mode(ControlMode::HighLevel).await?;
    handle.execute_named_action("release arm").await?;
    tracing::info!("Demo sequence complete");
    Ok(())
}
