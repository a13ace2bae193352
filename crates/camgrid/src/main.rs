use std::fs::{self, OpenOptions};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use camgrid::config::Config;
use camgrid::perf::PerfController;
use camgrid::supervisor::Supervisor;
use camgrid::Shutdown;
use camgrid_capture::evict::kill_device_holders;
use camgrid_capture::manager::Manager;
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, fmt};

/// Multi-camera monitoring engine for in-vehicle single-board hosts.
#[derive(Parser, Debug)]
#[command(name = "camgrid", disable_version_flag = true)]
struct Args {
    /// Print version and build information, then exit.
    #[arg(long, short = 'v')]
    version: bool,

    /// Path to config.ini (default: ./config.ini or $CAMERA_DASHBOARD_CONFIG).
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    if args.version {
        println!("camgrid {}", env!("CARGO_PKG_VERSION"));
        println!("  build time: {}", env!("CAMGRID_BUILD_TIME"));
        println!("  target:     {}", env!("CAMGRID_BUILD_TARGET"));
        return Ok(());
    }

    let cfg = Config::load(args.config.as_deref());
    init_logging(&cfg).context("logging setup failed")?;

    info!(
        "camgrid {} starting: {}x{} @ {} fps, dynamic={}, slots={}",
        env!("CARGO_PKG_VERSION"),
        cfg.capture_width,
        cfg.capture_height,
        cfg.capture_fps,
        cfg.dynamic_fps,
        cfg.slot_count,
    );

    let (ok, warnings) = cfg.validate();
    if !ok {
        warn!("configuration validation failed");
    }
    for warning in &warnings {
        warn!("config: {warning}");
    }

    let shutdown = Shutdown::new();
    {
        let shutdown = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            if shutdown.trigger() {
                info!("shutdown signal received, cleaning up");
            }
        })
        .context("failed to install signal handler")?;
    }

    // Clear stray holders (stale decoder children from a previous run)
    // before the first open.
    if cfg.kill_device_holders {
        for node in (0u32..=10).step_by(2) {
            let path = PathBuf::from(format!("/dev/video{node}"));
            if path.exists() {
                kill_device_holders(&path, true);
            }
        }
    }

    let manager = Arc::new(Manager::new(cfg.capture_settings(), cfg.slot_count));
    let controller = PerfController::new(Arc::clone(&manager), &cfg, Arc::clone(&shutdown));
    let supervisor = Arc::new(Supervisor::new(
        Arc::clone(&manager),
        &cfg,
        Arc::clone(&shutdown),
    ));

    // Discovery and staggered worker startup can take seconds; run them off
    // the main thread, bounded by a recovery boundary so a panicking
    // initialization leaves an empty camera set instead of aborting.
    {
        let manager = Arc::clone(&manager);
        let supervisor = Arc::clone(&supervisor);
        let controller = Arc::clone(&controller);
        thread::Builder::new()
            .name("camera-init".into())
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    manager.initialize();
                    if let Err(e) = manager.start() {
                        warn!("camera startup aborted: {e}");
                    }
                    // Hand the slots to the supervisor even after a failed
                    // start, so hot-plug recovery stays armed.
                    supervisor.adopt_cameras();
                    controller.start();
                }));
                if result.is_err() {
                    error!("camera initialization panicked; continuing without cameras");
                }
            })
            .context("failed to spawn camera initialization")?;
    }

    supervisor.start();

    while !shutdown.is_triggered() {
        thread::sleep(Duration::from_millis(200));
    }

    supervisor.stop();
    controller.stop();
    manager.stop();
    info!("shutdown complete: all workers stopped, decoder children reaped");
    Ok(())
}

/// Install the tracing subscriber: env-filtered, optional stdout layer,
/// optional append-only file layer. Rotation is left to the host.
fn init_logging(cfg: &Config) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.log_level.clone()));

    let file_layer = match open_log_file(cfg) {
        Ok(file) => Some(fmt::layer().with_writer(Arc::new(file)).with_ansi(false)),
        Err(e) => {
            eprintln!("camgrid: cannot open log file: {e}");
            None
        }
    };
    let stdout_layer = cfg.log_to_stdout.then(fmt::layer);

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stdout_layer)
        .try_init()
        .map_err(|e| anyhow::anyhow!("{e}"))?;
    Ok(())
}

fn open_log_file(cfg: &Config) -> std::io::Result<std::fs::File> {
    if let Some(parent) = cfg.log_file.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    OpenOptions::new().create(true).append(true).open(&cfg.log_file)
}
