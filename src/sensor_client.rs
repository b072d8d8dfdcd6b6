use std::io::{ErrorKind, Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::backend::DashboardSink;
use crate::buffer::QueueFull;
use crate::config::{DRAIN_IDLE_MS, GatewayConfig, LinkCipher, RESPONSE_BUFFER_LEN, Timing};
use crate::gate::Pipeline;
use crate::logging::emit;
use crate::protocol::{FrameError, Row, RowFields, parse_frame};
use crate::state::GatewayState;
use crate::types::{
    EventData, EventID, FormBody, Log, LogSource, RetryDescriptor, SensorCommand, SensorKind, UploadItem, WidgetValue,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Poller calls: failures are deferred to the retry queue and counted.
    Normal,
    /// Retry-worker calls: no retry enqueue, no failure count, no widgets.
    Recovery,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProbeError {
    #[error("failed to connect")]
    ConnectFail,
    #[error("timed out waiting for the node")]
    Timeout,
    #[error("bad response: {0}")]
    BadCrc(#[from] FrameError),
}

#[derive(Debug, Clone)]
pub struct ClientSettings {
    pub node_port: u16,
    pub cipher: LinkCipher,
    pub timing: Timing,
    pub api_key: String,
    pub location: String,
}

impl From<&GatewayConfig> for ClientSettings {
    fn from(config: &GatewayConfig) -> Self {
        Self {
            node_port: config.network.node_port,
            cipher: config.network.cipher,
            timing: config.timing,
            api_key: config.backend.api_key.clone(),
            location: config.backend.location.clone(),
        }
    }
}

/// One request/response round-trip to a sensor node. Cheap to clone; every
/// call owns its socket and response buffer, so callers on different tasks
/// do not interfere.
#[derive(Clone)]
pub struct SensorClient {
    pub state: Arc<GatewayState>,
    pub pipeline: Pipeline,
    pub dashboard: Arc<dyn DashboardSink>,
    pub log_tx: SyncSender<Log>,
    pub settings: ClientSettings,
}

fn is_timeout(kind: ErrorKind) -> bool {
    matches!(kind, ErrorKind::WouldBlock | ErrorKind::TimedOut)
}

impl SensorClient {
    /// Returns the number of rows accepted.
    pub fn probe(&self, addr: Ipv4Addr, command: SensorCommand, mode: Mode) -> Result<usize, ProbeError> {
        let mut buf = [0u8; RESPONSE_BUFFER_LEN];

        let len = match self.exchange(addr, command, &mut buf) {
            Ok(len) => len,
            Err(ProbeError::Timeout) => {
                thread::sleep(Duration::from_millis(self.settings.timing.timeout_backoff_ms));
                self.defer(addr, command, mode, EventID::ReadTimeout, "Client Timeout ");
                return Err(ProbeError::Timeout);
            }
            Err(e) => {
                self.defer(addr, command, mode, EventID::ConnectFailed, "failed to connect ");
                return Err(e);
            }
        };

        let cleartext = match self.settings.cipher {
            LinkCipher::None => &buf[..len],
        };

        let frame = match parse_frame(cleartext) {
            Ok(frame) => frame,
            Err(e) => {
                self.defer(addr, command, mode, EventID::CrcMismatch, "CRC invalid ");
                return Err(ProbeError::BadCrc(e));
            }
        };
        log::trace!("{}: frame crc {:x}, {} row(s)", addr, frame.crc, frame.rows().len());

        let mut accepted = 0;
        for row in frame.rows() {
            let code = row.sensor_code();
            if code == 0 {
                break;
            }

            let Some(kind) = SensorKind::from_code(code) else {
                emit(
                    &self.log_tx,
                    LogSource::SensorClient,
                    EventID::UnknownSensor,
                    EventData::Row { addr, code, row_id: row.row_id() },
                    self.state.uptime_ms(),
                );
                break;
            };

            self.accept_row(addr, kind, row, mode);
            accepted += 1;
        }

        Ok(accepted)
    }

    fn exchange(
        &self,
        addr: Ipv4Addr,
        command: SensorCommand,
        buf: &mut [u8; RESPONSE_BUFFER_LEN],
    ) -> Result<usize, ProbeError> {
        let timing = &self.settings.timing;
        let target = SocketAddr::from((addr, self.settings.node_port));

        let mut stream = TcpStream::connect_timeout(&target, Duration::from_millis(timing.connect_timeout_ms))
            .map_err(|_| ProbeError::ConnectFail)?;
        let _ = stream.set_nodelay(true);
        let _ = stream.set_write_timeout(Some(Duration::from_millis(timing.connect_timeout_ms)));

        stream
            .write_all(format!("{}\n", command).as_bytes())
            .map_err(|_| ProbeError::ConnectFail)?;

        let read_timeout = Duration::from_millis(command.read_timeout_ms(timing).max(1));
        let _ = stream.set_read_timeout(Some(read_timeout));

        // Last byte stays NUL.
        let limit = RESPONSE_BUFFER_LEN - 1;
        let mut len = match stream.read(&mut buf[..limit]) {
            Ok(0) => return Err(ProbeError::Timeout),
            Ok(n) => n,
            Err(e) if is_timeout(e.kind()) => return Err(ProbeError::Timeout),
            Err(_) => return Err(ProbeError::ConnectFail),
        };

        let _ = stream.set_read_timeout(Some(Duration::from_millis(DRAIN_IDLE_MS)));
        while len < limit {
            match stream.read(&mut buf[len..limit]) {
                Ok(0) => break,
                Ok(n) => len += n,
                Err(_) => break,
            }
        }

        Ok(len)
    }

    /// Failure bookkeeping for normal-mode calls; recovery calls leave it to the retry worker.
    /// A read timeout is always reported in `lastMsg`.
    fn defer(&self, addr: Ipv4Addr, command: SensorCommand, mode: Mode, event_id: EventID, msg: &str) {
        let now = self.state.uptime_ms();
        emit(&self.log_tx, LogSource::SensorClient, event_id, EventData::Node { addr, command }, now);

        if mode == Mode::Recovery {
            if event_id == EventID::ReadTimeout {
                self.state.set_last_msg(format!("{}{}", msg, addr));
            }
            return;
        }

        let retry_queue = &self.pipeline.retry_queue;
        match retry_queue.try_push(RetryDescriptor::probe(addr, command)) {
            Ok(()) => emit(
                &self.log_tx,
                LogSource::SensorClient,
                EventID::RetryQueued,
                EventData::Queue { depth: retry_queue.len(), capacity: retry_queue.capacity },
                now,
            ),
            Err(QueueFull(_)) => emit(
                &self.log_tx,
                LogSource::SensorClient,
                EventID::RetryQueueFull,
                EventData::Node { addr, command },
                now,
            ),
        }

        self.state.counters.fail_socket.fetch_add(1, Ordering::Relaxed);
        self.state.set_last_msg(format!("{}{}", msg, addr));
    }

    fn accept_row(&self, addr: Ipv4Addr, kind: SensorKind, row: &Row, mode: Mode) {
        let now = self.state.uptime_ms();
        let pass = self.state.counters.pass_socket.fetch_add(1, Ordering::Relaxed) + 1;

        emit(
            &self.log_tx,
            LogSource::SensorClient,
            EventID::RowAccepted,
            EventData::Row { addr, code: kind as i32, row_id: row.row_id() },
            now,
        );

        match self.upload_item(kind, row, pass) {
            Ok(item) => {
                if self.pipeline.upload_queue.try_push(item).is_err() {
                    emit(
                        &self.log_tx,
                        LogSource::SensorClient,
                        EventID::UploadQueueFull,
                        EventData::Row { addr, code: kind as i32, row_id: item.key },
                        now,
                    );
                }
            }
            Err(len) => emit(
                &self.log_tx,
                LogSource::SensorClient,
                EventID::BodyTooLong,
                EventData::Value { value: len as i64 },
                now,
            ),
        }

        if mode == Mode::Normal {
            let values = [row.value1(), row.value2()];
            for (slot, value) in kind.slots().iter().zip(values) {
                self.dashboard.update_widget(*slot, WidgetValue::Float(value));
            }
        }
    }

    /// Form body for the logging back-end; `Err` carries the oversize length.
    fn upload_item(&self, kind: SensorKind, row: &Row, pass: u32) -> Result<UploadItem, usize> {
        let form = format!(
            "api_key={}&sensor={}&location={}&value1={:.2}&value2={:.2}&value3={}",
            self.settings.api_key,
            kind.name(),
            self.settings.location,
            row.value1(),
            row.value2(),
            pass
        );

        let body = FormBody::new(&form).map_err(|_| form.len())?;
        Ok(UploadItem { body, key: row.row_id(), requeued: false })
    }
}
