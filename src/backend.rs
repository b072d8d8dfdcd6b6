//! Collaborators outside the pipeline: the logging back-end (HTTP), the cloud
//! dashboard and the reboot hook.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;
use thiserror::Error;

use crate::config::{BackendConfig, HTTP_TIMEOUT_MS, REBOOT_EXIT_CODE};
use crate::state::GatewayState;
use crate::types::{Slot, WidgetValue};

#[derive(Debug, Error)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

/// Blocking HTTP client. Not re-entrant: callers serialise through the http gate.
pub trait HttpBackend: Send + Sync {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError>;
    fn post_form(&self, url: &str, form: &str) -> Result<HttpResponse, HttpError>;
}

pub trait DashboardSink: Send + Sync {
    fn is_connected(&self) -> bool;
    fn update_widget(&self, slot: Slot, value: WidgetValue);
    /// Named cloud event, e.g. the watchdog's pre-reboot notice.
    fn log_event(&self, name: &str, description: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootReason {
    LoopStall,
    WatchdogCorrupted,
    CloudDisconnect,
}

impl fmt::Display for RebootReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RebootReason::LoopStall => "main loop stalled",
            RebootReason::WatchdogCorrupted => "watchdog cell corrupted",
            RebootReason::CloudDisconnect => "cloud connection failed",
        })
    }
}

pub trait Rebooter: Send + Sync {
    fn reboot(&self, reason: RebootReason);
}

/// Logging back-end URLs, all derived from one base.
#[derive(Debug, Clone)]
pub struct Endpoints {
    base: String,
}

impl Endpoints {
    pub fn new(base_url: &str) -> Self {
        Self { base: base_url.trim_end_matches('/').to_string() }
    }

    pub fn row_count(&self) -> String {
        format!("{}/rows.php", self.base)
    }

    pub fn discovery(&self) -> String {
        format!("{}/ip.php", self.base)
    }

    pub fn post_row(&self) -> String {
        format!("{}/post-esp-data.php", self.base)
    }

    pub fn rollback(&self, key: i32) -> String {
        format!("{}/delete.php?key={}", self.base, key)
    }

    pub fn retire_device(&self, mac: &str) -> String {
        format!("{}/deleteMAC.php?key='{}'", self.base, mac)
    }
}

impl From<&BackendConfig> for Endpoints {
    fn from(config: &BackendConfig) -> Self {
        Endpoints::new(&config.base_url)
    }
}

pub struct ReqwestBackend {
    client: reqwest::blocking::Client,
}

impl ReqwestBackend {
    pub fn new() -> Result<Self, HttpError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_millis(HTTP_TIMEOUT_MS))
            .build()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn finish(response: reqwest::blocking::Response) -> Result<HttpResponse, HttpError> {
        let status = response.status().as_u16();
        let body = response.text().map_err(|e| HttpError::Transport(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

impl HttpBackend for ReqwestBackend {
    fn get(&self, url: &str) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Self::finish(response)
    }

    fn post_form(&self, url: &str, form: &str) -> Result<HttpResponse, HttpError> {
        let response = self
            .client
            .post(url)
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form.to_owned())
            .send()
            .map_err(|e| HttpError::Transport(e.to_string()))?;
        Self::finish(response)
    }
}

/// Dashboard stand-in that writes widget updates to the log.
pub struct LogDashboard;

impl DashboardSink for LogDashboard {
    fn is_connected(&self) -> bool {
        true
    }

    fn update_widget(&self, slot: Slot, value: WidgetValue) {
        match value {
            WidgetValue::Float(v) => log::debug!(target: "dashboard", "{} <- {:.2}", slot, v),
            WidgetValue::Int(v) => log::debug!(target: "dashboard", "{} <- {}", slot, v),
            WidgetValue::Text(v) => log::debug!(target: "dashboard", "{} <- {:?}", slot, v),
        }
    }

    fn log_event(&self, name: &str, description: &str) {
        log::warn!(target: "dashboard", "event {}: {}", name, description);
    }
}

/// Ends the process with a distinct code so the supervisor restarts it.
pub struct ProcessReboot {
    pub state: Arc<GatewayState>,
}

impl Rebooter for ProcessReboot {
    fn reboot(&self, reason: RebootReason) {
        log::error!("rebooting: {}", reason);
        self.state.is_running.store(false, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(200)); // let the logger drain
        std::process::exit(REBOOT_EXIT_CODE);
    }
}

/// Platform reset-reason codes, as shown on the boot widget.
pub fn reset_reason_name(code: i32) -> &'static str {
    match code {
        1 => "POWERON_RESET",
        3 => "SW_RESET",
        4 => "OWDT_RESET",
        5 => "DEEPSLEEP_RESET",
        6 => "SDIO_RESET",
        7 => "TG0WDT_SYS_RESET",
        8 => "TG1WDT_SYS_RESET",
        9 => "RTCWDT_SYS_RESET",
        10 => "INTRUSION_RESET",
        11 => "TGWDT_CPU_RESET",
        12 => "SW_CPU_RESET",
        13 => "RTCWDT_CPU_RESET",
        14 => "EXT_CPU_RESET",
        15 => "RTCWDT_BROWN_OUT_RESET",
        16 => "RTCWDT_RTC_RESET",
        _ => "NO_MEAN",
    }
}
