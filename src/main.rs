//! Classroom attendance controller
//!
//! Runs on the classroom device: wakes on motion, reads student cards,
//! photographs the student and records attendance with the backend.
//!
//! Module structure:
//! - `domain/` - Core types (DeviceState, Event, ClassInfo, Session)
//! - `io/` - External interfaces (range sensor, PN532, camera, recognizer, backend)
//! - `services/` - Business logic (Dispatcher, AttendanceCoordinator, pollers, worker pool)
//! - `infra/` - Infrastructure (Config, Metrics, logging, shutdown)

use anyhow::Context;
use attendance_controller::domain::create_event_queue;
use attendance_controller::infra::{
    init_tracing, BackendLogLayer, Config, LogRecord, Metrics, Shutdown,
};
use attendance_controller::io::{
    BackendClient, CameraService, CommandCamera, CommandRecognizer, HttpBackend, LogForwarder,
    Pn532Reader, SerialRangeSensor,
};
use attendance_controller::services::{
    AttendanceCoordinator, AttendanceSettings, CardPoller, DevicePeripherals, Dispatcher,
    DispatcherTimings, PollerSettings, ProximityMonitor, ProximitySettings, RecognitionPipeline,
    WorkerPool,
};
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Classroom attendance controller
#[derive(Parser, Debug)]
#[command(name = "attendance-controller", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE or config/device.toml)
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    // Configuration problems are reported before logging exists
    let config_path = Config::resolve_config_path(args.config.as_deref());
    let config = match Config::load(&config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("attendance-controller: {:#}", e);
            std::process::exit(1);
        }
    };

    let metrics = Arc::new(Metrics::new());
    let (log_tx, log_rx) = mpsc::channel(config.forward_queue());
    let backend_layer = config
        .forward_level()
        .map(|level| BackendLogLayer::new(log_tx, level).with_metrics(metrics.clone()));
    init_tracing(backend_layer);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        git_hash = env!("GIT_HASH"),
        "attendance-controller starting"
    );
    info!(
        config_file = %config.config_file(),
        room = %config.room(),
        backend_url = %config.backend_url(),
        proximity_device = %config.proximity().device,
        nfc_device = %config.nfc().device,
        workers = %config.recognition().workers,
        clip_buffer = %config.camera().clip_buffer,
        prometheus_port = %config.prometheus_port(),
        "config_loaded"
    );

    let exit_code = match run(config, metrics, log_rx).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %format!("{:#}", e), "startup_failed");
            1
        }
    };

    info!(exit_code = %exit_code, "attendance-controller shutdown complete");
    std::process::exit(exit_code);
}

async fn run(
    config: Config,
    metrics: Arc<Metrics>,
    log_rx: mpsc::Receiver<LogRecord>,
) -> anyhow::Result<i32> {
    let shutdown = Shutdown::new();
    let grace = config.shutdown_grace();

    let backend: Arc<dyn BackendClient> = Arc::new(
        HttpBackend::new(config.backend_url(), config.api_key(), config.room(), config.backend_timeout())
            .context("failed to build backend client")?,
    );

    // Log forwarder runs first so startup events reach the backend
    let forwarder = LogForwarder::new(backend.clone(), log_rx, shutdown.clone());
    let forwarder_handle = tokio::spawn(forwarder.run(shutdown.subscribe()));

    let camera_config = config.camera();
    let camera = Arc::new(CameraService::new(
        camera_config,
        Arc::new(CommandCamera::new(camera_config.capture_command.clone())),
    ));

    let (events, event_rx) = create_event_queue();

    // Recognition pool
    let recognition_config = config.recognition();
    let pipeline = RecognitionPipeline::new(
        Arc::new(CommandRecognizer::new(recognition_config)),
        backend.clone(),
        camera.clone(),
        events.clone(),
        metrics.clone(),
        shutdown.clone(),
        camera_config.clip_on_flag,
    );
    let pool = Arc::new(WorkerPool::new(
        Arc::new(pipeline),
        recognition_config.workers,
        recognition_config.queue_depth,
    ));

    let mut tasks: Vec<JoinHandle<()>> = Vec::new();

    // Dispatcher owns the state machine and the attendance coordinator
    let coordinator = AttendanceCoordinator::new(
        backend.clone(),
        camera.clone(),
        pool.clone(),
        metrics.clone(),
        shutdown.clone(),
        AttendanceSettings::from_config(&config),
    );
    let (peripherals, power_rx) = DevicePeripherals::new(camera.clone());
    let dispatcher = Dispatcher::new(
        peripherals,
        coordinator,
        DispatcherTimings::from_config(&config),
        metrics.clone(),
    );
    tasks.push(tokio::spawn(dispatcher.run(event_rx, shutdown.subscribe())));

    // Sensor loops
    let proximity = ProximityMonitor::new(
        SerialRangeSensor::new(config.proximity()),
        ProximitySettings::from_config(config.proximity()),
        events.clone(),
        metrics.clone(),
    );
    tasks.push(tokio::spawn(proximity.run(shutdown.subscribe())));

    let poller = CardPoller::new(
        Pn532Reader::new(config.nfc()),
        power_rx,
        PollerSettings::from_config(config.nfc()),
        events,
        metrics.clone(),
    );
    tasks.push(tokio::spawn(poller.run(shutdown.subscribe())));

    // Start Prometheus metrics HTTP server (if port > 0)
    let prometheus_port = config.prometheus_port();
    if prometheus_port > 0 {
        let prom_metrics = metrics.clone();
        let prom_room = config.room().to_string();
        let prom_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            if let Err(e) = attendance_controller::io::prometheus::start_metrics_server(
                prometheus_port,
                prom_metrics,
                prom_room,
                prom_shutdown,
            )
            .await
            {
                error!(error = %e, "prometheus_server_error");
            }
        });
    }

    // Periodic metrics summary
    let reporter_metrics = metrics.clone();
    let mut reporter_shutdown = shutdown.subscribe();
    let metrics_interval = config.metrics_interval_secs();
    tasks.push(tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            tokio::select! {
                _ = interval.tick() => reporter_metrics.report().log(),
                _ = reporter_shutdown.changed() => break,
            }
        }
    }));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => info!("shutdown_signal_received"),
        _ = shutdown.wait() => {}
    }
    shutdown.trigger();

    for handle in tasks {
        if tokio::time::timeout(grace, handle).await.is_err() {
            warn!("task_stop_timeout");
        }
    }
    pool.shutdown(grace).await;
    if let Err(e) = camera.turn_off().await {
        warn!(error = %e, "camera_off_failed");
    }
    metrics.report().log();

    if tokio::time::timeout(grace, forwarder_handle).await.is_err() {
        warn!("log_forwarder_stop_timeout");
    }

    Ok(match shutdown.fatal_reason() {
        Some(reason) => {
            error!(reason = %reason, "exiting_on_fatal_error");
            1
        }
        None => 0,
    })
}
