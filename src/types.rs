use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;
use thiserror::Error;

use crate::config::{Timing, UPLOAD_BODY_LEN};

#[derive(Debug, Eq, PartialEq, Clone, Copy)]
#[repr(u16)]
pub enum EventID {
    // System
    Startup = 101,
    Shutdown = 102,
    BootStamp = 103,
    CounterSeed = 104,
    PriorityRejected = 105,

    // Poller
    DiscoveryFailed = 201,
    InventoryChanged = 202,
    TickCompleted = 203,

    // Sensor link
    ConnectFailed = 301,
    ReadTimeout = 302,
    CrcMismatch = 303,
    RowAccepted = 304,
    UnknownSensor = 305,
    UploadQueueFull = 306,
    BodyTooLong = 307,

    // Retry worker
    RetryQueued = 401,
    RetryRecovered = 402,
    RetryRequeued = 403,
    RetryQueueTripped = 404,
    RetryQueueFull = 405,

    // Upload worker
    UploadPosted = 501,
    UploadFailed = 502,
    RollbackSucceeded = 503,
    RollbackExhausted = 504,
    UploadRequeued = 505,
    UploadLost = 506,

    // Lifecycle
    WatchdogTripped = 601,
    Quiescent = 602,
    QuiescenceTimeout = 603,
    Reboot = 604,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum EventData {
    None,
    Node { addr: Ipv4Addr, command: SensorCommand },
    Row { addr: Ipv4Addr, code: i32, row_id: i32 },
    Http { status: u16 },
    Rollback { key: i32, attempts: u32 },
    Queue { depth: usize, capacity: usize },
    Counters { pass: u32, fail: u32, recovered: u32, retry: u32 },
    Inventory { nodes: usize },
    Stall { elapsed_ms: u64 },
    Value { value: i64 },
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Event {
    pub event_id: EventID,
    pub data: EventData,
    pub timestamp: u64,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LogSource {
    Poller = 1,
    SensorClient = 2,
    RetryWorker = 3,
    UploadWorker = 4,
    Watchdog = 5,
    Gate = 6,
    Simulation = 7,
    Main = 8,
}

#[derive(Debug)]
pub struct Log {
    pub source: LogSource,
    pub event: Event,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorCommand {
    All,
    Blk,
    Rst,
    Tst,
}

impl SensorCommand {
    pub fn as_str(&self) -> &'static str {
        match self {
            SensorCommand::All => "ALL",
            SensorCommand::Blk => "BLK",
            SensorCommand::Rst => "RST",
            SensorCommand::Tst => "TST",
        }
    }

    /// `BLK` starts a long-running test on the node, so it gets the long read window.
    pub fn read_timeout_ms(&self, timing: &Timing) -> u64 {
        match self {
            SensorCommand::Blk => timing.long_read_timeout_ms,
            _ => timing.read_timeout_ms,
        }
    }
}

impl FromStr for SensorCommand {
    type Err = FieldError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "ALL" => Ok(SensorCommand::All),
            "BLK" => Ok(SensorCommand::Blk),
            "RST" => Ok(SensorCommand::Rst),
            "TST" => Ok(SensorCommand::Tst),
            _ => Err(FieldError::UnknownCommand),
        }
    }
}

impl fmt::Display for SensorCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FieldError {
    #[error("field is {len} bytes, limit is {max}")]
    TooLong { len: usize, max: usize },
    #[error("field contains non-printable bytes")]
    NotPrintable,
    #[error("unknown sensor command")]
    UnknownCommand,
}

/// Inline, NUL-terminated text of at most `N - 1` printable ASCII bytes.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedStr<const N: usize> {
    bytes: [u8; N],
}

impl<const N: usize> FixedStr<N> {
    pub fn new(text: &str) -> Result<Self, FieldError> {
        if text.len() >= N {
            return Err(FieldError::TooLong { len: text.len(), max: N - 1 });
        }
        if !text.bytes().all(|b| b.is_ascii_graphic() || b == b' ') {
            return Err(FieldError::NotPrintable);
        }

        let mut bytes = [0u8; N];
        bytes[..text.len()].copy_from_slice(text.as_bytes());
        Ok(Self { bytes })
    }

    pub fn len(&self) -> usize {
        self.bytes.iter().position(|&b| b == 0).unwrap_or(N)
    }

    pub fn as_str(&self) -> &str {
        // Constructor admits ASCII only.
        std::str::from_utf8(&self.bytes[..self.len()]).unwrap_or_default()
    }
}

impl<const N: usize> fmt::Debug for FixedStr<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkKind {
    SensorProbe,
}

/// Everything needed to re-run a failed sensor transaction. Plain `Copy` data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDescriptor {
    pub kind: WorkKind,
    pub addr: Ipv4Addr,
    pub command: SensorCommand,
}

impl RetryDescriptor {
    pub fn probe(addr: Ipv4Addr, command: SensorCommand) -> Self {
        Self { kind: WorkKind::SensorProbe, addr, command }
    }
}

pub type FormBody = FixedStr<UPLOAD_BODY_LEN>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UploadItem {
    pub body: FormBody,
    /// Row id the back-end uses to address a rollback deletion.
    pub key: i32,
    pub requeued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Virtual(u8),
    Gauge,
}

impl Slot {
    pub const PASS_SOCKET: Slot = Slot::Virtual(7);
    pub const RECOVERED_SOCKET: Slot = Slot::Virtual(19);
    pub const FAIL_SOCKET: Slot = Slot::Virtual(20);
    pub const BOOT_STAMP: Slot = Slot::Virtual(25);
    pub const RESET_REASON: Slot = Slot::Virtual(26);
    pub const RETRY: Slot = Slot::Virtual(34);
    pub const LAST_MSG: Slot = Slot::Virtual(39);
    pub const TERMINAL: Slot = Slot::Virtual(42);
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Virtual(pin) => write!(f, "V{}", pin),
            Slot::Gauge => f.write_str("gauge"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum WidgetValue {
    Float(f32),
    Int(i64),
    Text(String),
}

/// Sensor code carried in the first field of every payload row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum SensorKind {
    Ds1 = 28,
    Sht = 44,
    Adc = 48,
    Bmp280 = 58,
    Bme280 = 76,
    Bmp390 = 77,
}

impl SensorKind {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            28 => Some(SensorKind::Ds1),
            44 => Some(SensorKind::Sht),
            48 => Some(SensorKind::Adc),
            58 => Some(SensorKind::Bmp280),
            76 => Some(SensorKind::Bme280),
            77 => Some(SensorKind::Bmp390),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            SensorKind::Ds1 => "DS1",
            SensorKind::Sht => "SHT",
            SensorKind::Adc => "ADC",
            SensorKind::Bmp280 => "BMP280",
            SensorKind::Bme280 => "BME280",
            SensorKind::Bmp390 => "BMP390",
        }
    }

    /// Dashboard slots for value1, value2. The only place sensor widgets are bound.
    pub fn slots(&self) -> &'static [Slot] {
        match self {
            SensorKind::Bme280 | SensorKind::Sht => &[Slot::Virtual(4), Slot::Virtual(5)],
            SensorKind::Bmp280 | SensorKind::Bmp390 => &[Slot::Virtual(6)],
            SensorKind::Ds1 => &[Slot::Virtual(15)],
            SensorKind::Adc => &[Slot::Gauge],
        }
    }
}
