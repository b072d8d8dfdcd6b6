use crate::config::LOGGING_PRIORITY;
use crate::state::apply_task_priority;
use crate::types::{Event, EventData, EventID, Log, LogSource};
use log::Level;
use std::fmt::Write as FmtWrite;
use std::fs::{File, OpenOptions};
use std::io::Write as IoWrite;
use std::sync::mpsc::{Receiver, SyncSender};

/// Non-blocking: a full log channel drops the record rather than stalling a worker.
pub fn emit(log_tx: &SyncSender<Log>, source: LogSource, event_id: EventID, data: EventData, timestamp: u64) {
    let _ = log_tx.try_send(Log {
        source,
        event: Event { event_id, data, timestamp },
    });
}

fn level_of(event_id: EventID) -> Level {
    match event_id {
        EventID::RowAccepted | EventID::UploadPosted | EventID::RetryQueued | EventID::TickCompleted => Level::Debug,

        EventID::DiscoveryFailed
        | EventID::ConnectFailed
        | EventID::ReadTimeout
        | EventID::CrcMismatch
        | EventID::UnknownSensor
        | EventID::UploadQueueFull
        | EventID::BodyTooLong
        | EventID::RetryRequeued
        | EventID::RetryQueueFull
        | EventID::UploadFailed
        | EventID::UploadRequeued
        | EventID::QuiescenceTimeout
        | EventID::PriorityRejected => Level::Warn,

        EventID::RetryQueueTripped
        | EventID::RollbackExhausted
        | EventID::UploadLost
        | EventID::WatchdogTripped
        | EventID::Reboot => Level::Error,

        _ => Level::Info,
    }
}

pub fn format_log(log: &Log, format_buffer: &mut String) {
    let source_str = match log.source {
        LogSource::Poller => "POLLER",
        LogSource::SensorClient => "SENSOR",
        LogSource::RetryWorker => "RETRY",
        LogSource::UploadWorker => "UPLOAD",
        LogSource::Watchdog => "LWD",
        LogSource::Gate => "GATE",
        LogSource::Simulation => "SIM",
        LogSource::Main => "MAIN",
    };

    let event_str = match log.event.event_id {
        EventID::Startup => "Gateway Initialized",
        EventID::Shutdown => "Shutdown",
        EventID::BootStamp => "Boot Stamp Published",
        EventID::CounterSeed => "Counters Seeded From Back-end",
        EventID::PriorityRejected => "Thread Priority Not Applied",

        EventID::DiscoveryFailed => "Discovery Failed",
        EventID::InventoryChanged => "Inventory Changed",
        EventID::TickCompleted => "Poll Tick Completed",

        EventID::ConnectFailed => "Failed To Connect",
        EventID::ReadTimeout => "Client Timeout",
        EventID::CrcMismatch => "CRC Invalid",
        EventID::RowAccepted => "Row Accepted",
        EventID::UnknownSensor => "Unknown Sensor Code",
        EventID::UploadQueueFull => "Upload Queue Full",
        EventID::BodyTooLong => "Form Body Too Long",

        EventID::RetryQueued => "Retry Queued",
        EventID::RetryRecovered => "Recovered Network Fail",
        EventID::RetryRequeued => "Retry Requeued",
        EventID::RetryQueueTripped => "Retry Queue Tripped",
        EventID::RetryQueueFull => "Retry Queue Full",

        EventID::UploadPosted => "Row Posted",
        EventID::UploadFailed => "POST Failed",
        EventID::RollbackSucceeded => "Rollback Succeeded",
        EventID::RollbackExhausted => "Rollback Exhausted",
        EventID::UploadRequeued => "Upload Requeued",
        EventID::UploadLost => "Upload Lost",

        EventID::WatchdogTripped => "Loop Watchdog Tripped",
        EventID::Quiescent => "Queues Quiescent",
        EventID::QuiescenceTimeout => "Queue Timeout",
        EventID::Reboot => "Reboot",
    };

    let _ = write!(format_buffer, "[Gateway] [{:>6}]\tEvent: [{:>30}]\t", source_str, event_str);

    match log.event.data {
        EventData::Node { addr, command } => {
            let _ = write!(format_buffer, "NODE: [{} {}]\t", addr, command);
        }
        EventData::Row { addr, code, row_id } => {
            let _ = write!(format_buffer, "ROW: [{} code {} id {}]\t", addr, code, row_id);
        }
        EventData::Http { status } => {
            let _ = write!(format_buffer, "HTTP: [{}]\t", status);
        }
        EventData::Rollback { key, attempts } => {
            let _ = write!(format_buffer, "ROLLBACK: [key {} after {} attempt(s)]\t", key, attempts);
        }
        EventData::Queue { depth, capacity } => {
            let _ = write!(format_buffer, "QUEUE: [{}/{}]\t", depth, capacity);
        }
        EventData::Counters { pass, fail, recovered, retry } => {
            let _ = write!(
                format_buffer,
                "COUNTERS: [pass {} fail {} recovered {} retry {}]\t",
                pass, fail, recovered, retry
            );
        }
        EventData::Inventory { nodes } => {
            let _ = write!(format_buffer, "NODES: [{}]\t", nodes);
        }
        EventData::Stall { elapsed_ms } => {
            let _ = write!(format_buffer, "STALL: [{}ms]\t", elapsed_ms);
        }
        EventData::Value { value } => {
            let _ = write!(format_buffer, "VALUE: [{}]\t", value);
        }
        EventData::None => {}
    }

    let _ = write!(format_buffer, "Time: [{} uptime ms]", log.event.timestamp);
}

pub fn run_logger(log_rx: Receiver<Log>, path: &str) {
    if let Err(e) = apply_task_priority(LOGGING_PRIORITY) {
        log::debug!("logger priority not applied: {}", e);
    }

    let mut format_buffer = String::with_capacity(256);
    let mut file: Option<File> = match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(e) => {
            log::warn!("log file {} unavailable: {}", path, e);
            None
        }
    };

    while let Ok(log) = log_rx.recv() {
        format_buffer.clear();
        format_log(&log, &mut format_buffer);

        log::log!(target: "gateway", level_of(log.event.event_id), "{}", format_buffer);

        if let Some(f) = file.as_mut() {
            if let Err(e) = writeln!(f, "{}", format_buffer) {
                log::error!("Failed to write to disk: {}", e);
                file = None;
            }
        }
    }
}
