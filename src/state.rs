use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use crate::discovery::Inventory;
use crate::types::EventData;
use thread_priority::{ThreadPriority, ThreadPriorityValue, set_current_thread_priority};

/// Process-wide gateway state shared by every task.
#[derive(Debug)]
pub struct GatewayState {
    // Control Flags
    pub is_running: AtomicBool,
    /// Cleared after the main loop stops and the queues have drained.
    pub workers_running: AtomicBool,

    // Clock
    pub boot_time: Instant,

    pub counters: Counters,
    pub uploads: UploadStats,

    last_msg: Mutex<String>,
    inventory: RwLock<Arc<Inventory>>,
}

/// Sensor-link counters. `pass_socket`/`fail_socket` are written by the sensor
/// client, `retry`/`recovered_socket` by the retry worker only.
#[derive(Debug, Default)]
pub struct Counters {
    pub pass_socket: AtomicU32,
    pub fail_socket: AtomicU32,
    pub recovered_socket: AtomicU32,
    pub retry: AtomicU32,
}

/// Upload-worker tallies. A re-enqueue is counted apart from the final outcome.
#[derive(Debug, Default)]
pub struct UploadStats {
    pub posted: AtomicU32,
    pub failed: AtomicU32,
    pub reconciled: AtomicU32,
    pub requeued: AtomicU32,
    pub lost: AtomicU32,
}

impl Counters {
    pub fn snapshot(&self) -> EventData {
        EventData::Counters {
            pass: self.pass_socket.load(Ordering::Relaxed),
            fail: self.fail_socket.load(Ordering::Relaxed),
            recovered: self.recovered_socket.load(Ordering::Relaxed),
            retry: self.retry.load(Ordering::Relaxed),
        }
    }
}

impl GatewayState {
    pub fn new() -> Self {
        Self {
            is_running: AtomicBool::new(true),
            workers_running: AtomicBool::new(true),
            boot_time: Instant::now(),
            counters: Counters::default(),
            uploads: UploadStats::default(),
            last_msg: Mutex::new(String::new()),
            inventory: RwLock::new(Arc::new(Inventory::default())),
        }
    }

    pub fn uptime_ms(&self) -> u64 {
        self.boot_time.elapsed().as_millis() as u64 // Assumes Uptime never goes above 64 bits
    }

    pub fn set_last_msg(&self, msg: String) {
        *self.last_msg.lock().unwrap_or_else(PoisonError::into_inner) = msg;
    }

    pub fn last_msg(&self) -> String {
        self.last_msg.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Current inventory snapshot. Readers keep the `Arc` they got even if the
    /// poller swaps in a new one mid-use.
    pub fn inventory(&self) -> Arc<Inventory> {
        Arc::clone(&self.inventory.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn replace_inventory(&self, inventory: Inventory) -> Arc<Inventory> {
        let fresh = Arc::new(inventory);
        let mut slot = self.inventory.write().unwrap_or_else(PoisonError::into_inner);
        std::mem::replace(&mut *slot, Arc::clone(&fresh))
    }
}

/// Applies a cross-platform priority to the calling thread. Unprivileged hosts
/// may refuse; callers log and carry on.
pub fn apply_task_priority(priority: u8) -> Result<(), String> {
    let value = ThreadPriorityValue::try_from(priority).map_err(|e| format!("{:?}", e))?;
    set_current_thread_priority(ThreadPriority::Crossplatform(value)).map_err(|e| format!("{:?}", e))
}
