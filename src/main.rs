mod backend;
mod buffer;
mod config;
mod discovery;
mod gate;
mod logging;
mod poller;
mod protocol;
mod retry;
mod sensor_client;
mod simulation;
mod state;
mod types;
mod upload;
mod watchdog;

use std::io;
use std::sync::atomic::Ordering;
use std::sync::{Arc, mpsc};
use std::thread;
use std::time::Duration;

use log::LevelFilter;

use crate::backend::{
    DashboardSink, Endpoints, HttpBackend, LogDashboard, ProcessReboot, RebootReason, Rebooter, ReqwestBackend,
};
use crate::config::{GatewayConfig, LOG_BUFFER_CAPACITY, LWD_TIMEOUT_MS, POLLER_GATE_WAIT_MS, QUIESCENCE_TIMEOUT_MS};
use crate::gate::Pipeline;
use crate::logging::{emit, run_logger};
use crate::poller::{Poller, run_main_loop};
use crate::retry::{RetryWorker, run_retry_worker};
use crate::sensor_client::{ClientSettings, SensorClient};
use crate::simulation::SimulatedNode;
use crate::state::GatewayState;
use crate::types::{EventData, EventID, Log, LogSource};
use crate::upload::{UploadWorker, run_upload_worker};
use crate::watchdog::{LoopWatchdog, WatchdogContext, run_watchdog};

/// Platform reset code for the boot widget; the supervisor that restarts us
/// after a reboot exit passes the code it observed.
fn reset_code() -> i32 {
    std::env::var("GATEWAY_RESET_REASON")
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(1)
}

fn log_summary(state: &GatewayState, pipeline: &Pipeline) {
    let uploads = &state.uploads;
    log::info!(
        "uploads: posted {} failed {} reconciled {} requeued {} lost {}",
        uploads.posted.load(Ordering::Relaxed),
        uploads.failed.load(Ordering::Relaxed),
        uploads.reconciled.load(Ordering::Relaxed),
        uploads.requeued.load(Ordering::Relaxed),
        uploads.lost.load(Ordering::Relaxed),
    );

    for (name, metrics) in [("retry", &pipeline.retry_queue.metrics), ("upload", &pipeline.upload_queue.metrics)] {
        log::info!(
            "{} queue: enqueued {} rejected {} high water {}",
            name,
            metrics.enqueued.load(Ordering::Relaxed),
            metrics.rejected.load(Ordering::Relaxed),
            metrics.high_water.load(Ordering::Relaxed),
        );
    }
}

fn main() -> io::Result<()> {
    env_logger::Builder::new()
        .filter_level(LevelFilter::Trace)
        .parse_default_env()
        .init();

    let config = GatewayConfig::load_or_default();
    if std::env::var_os("RUST_LOG").is_none() {
        log::set_max_level(config.logging.level.parse().unwrap_or(LevelFilter::Info));
    }

    let state = Arc::new(GatewayState::new());
    let pipeline = Pipeline::new();

    let (log_tx, log_rx) = mpsc::sync_channel::<Log>(LOG_BUFFER_CAPACITY);

    let log_file = config.logging.file.clone();
    let logger_handle = thread::Builder::new()
        .name("logger".to_string())
        .spawn(move || run_logger(log_rx, &log_file))?;

    let (http, _simulated_nodes): (Arc<dyn HttpBackend>, Vec<SimulatedNode>) = if config.simulation.enabled {
        let (nodes, backend) = simulation::start(&config.simulation, config.network.node_port)?;
        emit(
            &log_tx,
            LogSource::Simulation,
            EventID::Startup,
            EventData::Inventory { nodes: nodes.len() },
            state.uptime_ms(),
        );
        (Arc::new(backend) as Arc<dyn HttpBackend>, nodes)
    } else {
        (Arc::new(ReqwestBackend::new().map_err(io::Error::other)?) as Arc<dyn HttpBackend>, Vec::new())
    };

    let dashboard: Arc<dyn DashboardSink> = Arc::new(LogDashboard);
    let rebooter: Arc<dyn Rebooter> = Arc::new(ProcessReboot { state: Arc::clone(&state) });

    if !dashboard.is_connected() {
        rebooter.reboot(RebootReason::CloudDisconnect);
    }

    {
        let state = Arc::clone(&state);
        ctrlc::set_handler(move || state.is_running.store(false, Ordering::SeqCst))
            .map_err(io::Error::other)?;
    }

    let endpoints = Endpoints::from(&config.backend);
    let timing = config.timing;
    let client = SensorClient {
        state: Arc::clone(&state),
        pipeline: pipeline.clone(),
        dashboard: Arc::clone(&dashboard),
        log_tx: log_tx.clone(),
        settings: ClientSettings::from(&config),
    };

    let watchdog = Arc::new(LoopWatchdog::new(LWD_TIMEOUT_MS, state.uptime_ms()));
    let poller = Poller {
        client: client.clone(),
        http: Arc::clone(&http),
        endpoints: endpoints.clone(),
        watchdog: Arc::clone(&watchdog),
        gate_wait: Duration::from_millis(POLLER_GATE_WAIT_MS),
    };

    poller.seed_counters();
    poller.publish_boot_stamp(reset_code());

    let retry_worker = RetryWorker {
        client,
        http: Arc::clone(&http),
        endpoints: endpoints.clone(),
        mac_address: config.device.mac_address.clone(),
    };
    let retry_handle = thread::Builder::new()
        .name("retry_worker".to_string())
        .spawn(move || run_retry_worker(retry_worker))?;

    let upload_worker = UploadWorker {
        state: Arc::clone(&state),
        pipeline: pipeline.clone(),
        http,
        endpoints,
        log_tx: log_tx.clone(),
        stagger: Duration::from_millis(timing.upload_stagger_ms),
        pace: Duration::from_millis(timing.upload_pace_ms),
    };
    let upload_handle = thread::Builder::new()
        .name("upload_worker".to_string())
        .spawn(move || run_upload_worker(upload_worker))?;

    let watchdog_ctx = WatchdogContext {
        state: Arc::clone(&state),
        pipeline: pipeline.clone(),
        dashboard,
        rebooter,
        log_tx: log_tx.clone(),
        quiescence_timeout: Duration::from_millis(QUIESCENCE_TIMEOUT_MS),
    };
    thread::Builder::new()
        .name("loop_watchdog".to_string())
        .spawn(move || run_watchdog(watchdog, watchdog_ctx))?;

    emit(&log_tx, LogSource::Main, EventID::Startup, EventData::None, state.uptime_ms());

    run_main_loop(&poller);

    // Stopped: let the workers finish what is queued, then park them.
    let quiesced = pipeline.wait_quiescent(Duration::from_millis(QUIESCENCE_TIMEOUT_MS), &state, &log_tx);
    state.workers_running.store(false, Ordering::SeqCst);
    drop(quiesced);

    if retry_handle.join().is_err() || upload_handle.join().is_err() {
        log::error!("a worker thread panicked");
    }

    emit(&log_tx, LogSource::Main, EventID::Shutdown, state.counters.snapshot(), state.uptime_ms());
    log_summary(&state, &pipeline);

    drop(poller);
    drop(log_tx); // Drop Sender so the Receiver Know There is No More Logs

    if logger_handle.join().is_err() {
        log::error!("logger thread panicked");
    }
    Ok(())
}
