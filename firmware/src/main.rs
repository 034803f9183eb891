//! # Pit Controller Daemon
//!
//! Entry point wiring the store, hardware, control loops, alert engine,
//! telemetry publisher, and the WebSocket surface together.
//!
//! ## Operational Modes
//!
//! - **Normal operation**: real sensors and relay, active control available
//! - **Simulation mode**: no hardware access (--simulate flag or SIM_MODE)
//! - **Fallback**: hardware requested but unavailable; affected channels run
//!   simulated and a hardware_fallback alert is raised
//!
//! ## Startup Sequence
//!
//! 1. Parse CLI, initialize logging
//! 2. Open the store, seed the settings row from the environment on first
//!    boot (the row is authoritative afterwards)
//! 3. Initialize the controller (hardware, channels, active session)
//! 4. Spawn the monitoring loop, telemetry publisher, and the web surface
//! 5. Start active control if requested, then wait for shutdown signals

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::runtime::Runtime;
use tokio::signal;
use tokio::sync::{broadcast, RwLock};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use anyhow::{Context, Result};
use clap::Parser;
use config_types::EnvConfig;

use pitmaster_firmware::comms::{create_app_router, AppState};
use pitmaster_firmware::controller::Controller;
use pitmaster_firmware::db::Store;
use pitmaster_firmware::telemetry::TelemetryPublisher;
use pitmaster_firmware::{LOOP_INTERVAL, VERSION};

// Command-Line Interface Definition

/// Pit temperature controller daemon
#[derive(Parser, Debug)]
#[command(name = "pitmasterd")]
#[command(version = VERSION)]
#[command(about = "Temperature controller daemon for offset and pellet smokers")]
struct Cli {
    /// Run in simulation mode (no hardware access)
    #[arg(long)]
    simulate: bool,

    /// Path to the local store (overrides DB_PATH)
    #[arg(long, value_name = "FILE")]
    db_path: Option<PathBuf>,

    /// Bind address for the WebSocket/health surface
    #[arg(long, default_value = "0.0.0.0:8765")]
    listen: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Log to file instead of stdout
    #[arg(long, value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Begin active control immediately instead of monitoring only
    #[arg(long)]
    start_control: bool,
}

// Initialization Sequence

/// Initializes the logging system.
fn init_logging(log_level: &str, log_file: Option<PathBuf>) -> Result<()> {
    let filter = EnvFilter::try_new(log_level).context("Invalid log level")?;

    let subscriber = tracing_subscriber::registry().with(filter);

    if let Some(file_path) = log_file {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)
            .context("Failed to open log file")?;

        let file_layer = fmt::layer().with_writer(Arc::new(file)).with_ansi(false);
        subscriber.with(file_layer).init();
    } else {
        let stdout_layer = fmt::layer().with_writer(std::io::stdout);
        subscriber.with(stdout_layer).init();
    }

    Ok(())
}

/// Creates the tokio runtime for the daemon.
fn create_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("pitmasterd")
        .worker_threads(2)
        .build()
        .context("Failed to build async runtime")
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // Environment first so CLI flags can override it.
    let mut config = match EnvConfig::from_env() {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("Configuration error: {e}");
            return ExitCode::FAILURE;
        }
    };
    if cli.simulate {
        config.sim_mode = true;
    }
    if let Some(path) = &cli.db_path {
        config.db_path = path.clone();
    }
    if let Some(level) = &cli.log_level {
        config.log_level = level.clone();
    }
    if let Some(file) = &cli.log_file {
        config.log_file = Some(file.clone());
    }

    if let Err(e) = init_logging(&config.log_level, config.log_file.clone()) {
        eprintln!("Failed to initialize logging: {e}");
        return ExitCode::FAILURE;
    }

    info!("Pit controller daemon v{VERSION}");
    if config.sim_mode {
        warn!("Running in SIMULATION mode - no hardware will be accessed");
    }

    let runtime = match create_runtime() {
        Ok(rt) => rt,
        Err(e) => {
            error!("Failed to create runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    runtime.block_on(async {
        match run_daemon(cli, config).await {
            Ok(_) => {
                info!("Daemon shutdown complete");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!("Daemon error: {e:?}");
                ExitCode::FAILURE
            }
        }
    })
}

/// Main daemon execution flow.
async fn run_daemon(cli: Cli, config: EnvConfig) -> Result<()> {
    // Store and settings. The environment seeds the row once; afterwards the
    // row in the store is the single source of truth.
    let store = Store::open(&config.db_path)
        .await
        .context("Failed to open store")?;
    let mut settings_row = store
        .ensure_settings(&config)
        .await
        .context("Failed to load settings")?;

    // A --simulate flag wins over a stored sim_mode=false for this run.
    if cli.simulate {
        settings_row.sim_mode = true;
    }

    let publisher = TelemetryPublisher::new();
    let controller = Controller::initialize(store.clone(), &settings_row, publisher.sender())
        .await
        .context("Failed to initialize controller")?;
    let controller = Arc::new(RwLock::new(controller));

    let (shutdown_tx, _) = broadcast::channel::<()>(1);

    // Monitoring loop: always on from boot.
    let monitor_task = tokio::spawn(run_monitoring_loop(
        controller.clone(),
        shutdown_tx.subscribe(),
    ));

    // Control loop: ticks only while the controller is running.
    let control_task = tokio::spawn(run_control_loop(
        controller.clone(),
        shutdown_tx.subscribe(),
    ));

    // Telemetry publisher.
    let telemetry_task = tokio::spawn(
        publisher
            .clone()
            .run(controller.clone(), shutdown_tx.subscribe()),
    );

    // Web surface.
    let app_state = AppState {
        controller: controller.clone(),
        publisher: publisher.clone(),
    };
    let router = create_app_router(app_state, &config.allowed_origins);
    let listener = tokio::net::TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Telemetry surface listening on ws://{}/ws", cli.listen);

    let server_shutdown = shutdown_tx.subscribe();
    let server_task = tokio::spawn(async move {
        let mut shutdown = server_shutdown;
        let serve = axum::serve(listener, router).with_graceful_shutdown(async move {
            shutdown.recv().await.ok();
        });
        if let Err(e) = serve.await {
            error!("Web surface error: {e}");
        }
    });

    if cli.start_control {
        controller.write().await.start().await.ok();
    }

    info!("Daemon initialized and ready");

    // Wait for a shutdown signal.
    wait_for_signal().await;
    info!("Shutdown signal received, stopping");

    // Active control off (relay de-energized) before tasks wind down.
    {
        let mut guard = controller.write().await;
        if guard.is_running() {
            guard.stop().await.ok();
        }
    }
    shutdown_tx.send(()).ok();

    // Give tasks a bounded window to finish.
    let drain = async {
        monitor_task.await.ok();
        control_task.await.ok();
        telemetry_task.await.ok();
        server_task.await.ok();
    };
    if tokio::time::timeout(Duration::from_secs(10), drain).await.is_err() {
        warn!("Shutdown timeout, forcing exit");
    }

    Ok(())
}

// Periodic Tasks

/// Monitoring body: refreshes sensor readings every second from boot.
async fn run_monitoring_loop(
    controller: Arc<RwLock<Controller>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    info!("Temperature monitoring started (always-on)");
    let mut interval = tokio::time::interval(LOOP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                controller.write().await.poll_sensors(Instant::now()).await;
            }
            _ = shutdown.recv() => {
                info!("Monitoring loop stopping");
                break;
            }
        }
    }
}

/// Control body: runs one tick per second while active control is enabled,
/// sleeping out the remainder of each period.
async fn run_control_loop(
    controller: Arc<RwLock<Controller>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        let tick_start = Instant::now();

        {
            let mut guard = controller.write().await;
            if guard.is_running() {
                guard.tick(tick_start).await;
            }
        }

        let remaining = LOOP_INTERVAL.saturating_sub(tick_start.elapsed());
        tokio::select! {
            _ = tokio::time::sleep(remaining) => {}
            _ = shutdown.recv() => {
                info!("Control loop stopping");
                break;
            }
        }
    }
}

// Signal Handling

/// Blocks until SIGTERM or SIGINT arrives.
async fn wait_for_signal() {
    let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
        .expect("Failed to setup SIGTERM handler");
    let mut sigint = signal::unix::signal(signal::unix::SignalKind::interrupt())
        .expect("Failed to setup SIGINT handler");

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM"),
        _ = sigint.recv() => info!("Received SIGINT"),
    }
}
