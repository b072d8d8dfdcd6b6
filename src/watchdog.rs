//! Loop watchdog. The main loop must call `feed()` at least every
//! `LWD_TIMEOUT_MS`; a separate ticker thread checks it and reboots through
//! the quiescence gate when it stalls.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;

use crate::backend::{DashboardSink, RebootReason, Rebooter};
use crate::config::{WATCHDOG_PRIORITY, WATCHDOG_TICK_MS};
use crate::gate::Pipeline;
use crate::logging::emit;
use crate::state::{GatewayState, apply_task_priority};
use crate::types::{EventData, EventID, Log, LogSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trip {
    Stalled { elapsed_ms: u64 },
    /// `lwd_timeout - lwd_time` no longer equals the configured window.
    Corrupted,
}

impl Trip {
    pub fn reason(&self) -> RebootReason {
        match self {
            Trip::Stalled { .. } => RebootReason::LoopStall,
            Trip::Corrupted => RebootReason::WatchdogCorrupted,
        }
    }
}

#[derive(Debug)]
pub struct LoopWatchdog {
    lwd_time: AtomicU64,
    lwd_timeout: AtomicU64,
    window_ms: u64,
}

impl LoopWatchdog {
    pub fn new(window_ms: u64, now: u64) -> Self {
        Self {
            lwd_time: AtomicU64::new(now),
            lwd_timeout: AtomicU64::new(now + window_ms),
            window_ms,
        }
    }

    pub fn feed(&self, now: u64) {
        self.lwd_time.store(now, Ordering::SeqCst);
        self.lwd_timeout.store(now + self.window_ms, Ordering::SeqCst);
    }

    fn cells(&self) -> (u64, u64) {
        (self.lwd_time.load(Ordering::SeqCst), self.lwd_timeout.load(Ordering::SeqCst))
    }

    pub fn check(&self, now: u64) -> Result<(), Trip> {
        let (mut fed, mut deadline) = self.cells();

        // A feed landing between the two loads leaves the cells one store
        // apart; only a mismatch seen twice counts.
        if deadline.wrapping_sub(fed) != self.window_ms {
            (fed, deadline) = self.cells();
            if deadline.wrapping_sub(fed) != self.window_ms {
                return Err(Trip::Corrupted);
            }
        }

        let elapsed_ms = now.saturating_sub(fed);
        if elapsed_ms > self.window_ms {
            return Err(Trip::Stalled { elapsed_ms });
        }
        Ok(())
    }

    #[cfg(test)]
    fn corrupt(&self, deadline: u64) {
        self.lwd_timeout.store(deadline, Ordering::SeqCst);
    }
}

/// What the watchdog needs to announce and carry out a reboot.
pub struct WatchdogContext {
    pub state: Arc<GatewayState>,
    pub pipeline: Pipeline,
    pub dashboard: Arc<dyn DashboardSink>,
    pub rebooter: Arc<dyn Rebooter>,
    pub log_tx: SyncSender<Log>,
    pub quiescence_timeout: Duration,
}

impl WatchdogContext {
    /// Announces the trip, gives in-flight work a bounded chance to drain,
    /// then reboots whether or not it did.
    pub fn fire(&self, trip: Trip) {
        let now = self.state.uptime_ms();
        let data = match trip {
            Trip::Stalled { elapsed_ms } => EventData::Stall { elapsed_ms },
            Trip::Corrupted => EventData::None,
        };

        emit(&self.log_tx, LogSource::Watchdog, EventID::WatchdogTripped, data, now);
        self.dashboard
            .log_event("loop_watchdog", &format!("rebooting: {}", trip.reason()));

        // Workers stay parked through the reboot when the drain succeeded.
        let hold = self
            .pipeline
            .wait_quiescent(self.quiescence_timeout, &self.state, &self.log_tx);

        emit(
            &self.log_tx,
            LogSource::Watchdog,
            EventID::Reboot,
            EventData::Value { value: hold.is_some() as i64 },
            self.state.uptime_ms(),
        );
        self.rebooter.reboot(trip.reason());
        drop(hold);
    }
}

pub fn run_watchdog(watchdog: Arc<LoopWatchdog>, ctx: WatchdogContext) {
    if let Err(e) = apply_task_priority(WATCHDOG_PRIORITY) {
        emit(
            &ctx.log_tx,
            LogSource::Watchdog,
            EventID::PriorityRejected,
            EventData::Value { value: WATCHDOG_PRIORITY as i64 },
            ctx.state.uptime_ms(),
        );
        log::debug!("watchdog priority: {}", e);
    }

    while ctx.state.is_running.load(Ordering::Relaxed) {
        thread::sleep(Duration::from_millis(WATCHDOG_TICK_MS));

        if let Err(trip) = watchdog.check(ctx.state.uptime_ms()) {
            ctx.fire(trip);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FakeDashboard, FakeRebooter};
    use crate::config::LWD_TIMEOUT_MS;
    use crate::types::{RetryDescriptor, SensorCommand};
    use std::net::Ipv4Addr;
    use std::sync::mpsc::{self, Receiver};
    use std::time::Instant;

    fn context(timeout: Duration) -> (WatchdogContext, Arc<FakeDashboard>, Arc<FakeRebooter>, Receiver<Log>) {
        let (log_tx, log_rx) = mpsc::sync_channel(64);
        let dashboard = Arc::new(FakeDashboard::default());
        let rebooter = Arc::new(FakeRebooter::default());
        let ctx = WatchdogContext {
            state: Arc::new(GatewayState::new()),
            pipeline: Pipeline::new(),
            dashboard: dashboard.clone(),
            rebooter: rebooter.clone(),
            log_tx,
            quiescence_timeout: timeout,
        };
        (ctx, dashboard, rebooter, log_rx)
    }

    #[test]
    fn fed_loop_passes() {
        let watchdog = LoopWatchdog::new(LWD_TIMEOUT_MS, 0);
        watchdog.feed(10_000);
        assert_eq!(watchdog.check(25_000), Ok(()));
    }

    #[test]
    fn sixteen_seconds_unfed_stalls() {
        let watchdog = LoopWatchdog::new(LWD_TIMEOUT_MS, 1_000);
        assert_eq!(watchdog.check(17_000), Err(Trip::Stalled { elapsed_ms: 16_000 }));
    }

    #[test]
    fn corrupted_cell_trips() {
        let watchdog = LoopWatchdog::new(LWD_TIMEOUT_MS, 0);
        watchdog.corrupt(3);
        assert_eq!(watchdog.check(1), Err(Trip::Corrupted));
    }

    #[test]
    fn fire_announces_then_reboots_even_when_not_quiescent() {
        let (ctx, dashboard, rebooter, logs) = context(Duration::from_millis(50));
        ctx.pipeline
            .retry_queue
            .try_push(RetryDescriptor::probe(Ipv4Addr::LOCALHOST, SensorCommand::All))
            .unwrap();

        let watchdog = LoopWatchdog::new(LWD_TIMEOUT_MS, 0);
        let trip = watchdog.check(16_000).unwrap_err();
        let started = Instant::now();
        ctx.fire(trip);

        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(*dashboard.events.lock().unwrap(), vec!["loop_watchdog".to_string()]);
        assert_eq!(*rebooter.reasons.lock().unwrap(), vec![RebootReason::LoopStall]);

        let ids: Vec<EventID> = logs.try_iter().map(|l| l.event.event_id).collect();
        assert_eq!(ids, vec![EventID::WatchdogTripped, EventID::QuiescenceTimeout, EventID::Reboot]);
    }

    #[test]
    fn fire_on_idle_pipeline_drains_first() {
        let (ctx, _dashboard, rebooter, logs) = context(Duration::from_millis(50));

        ctx.fire(Trip::Corrupted);

        assert_eq!(*rebooter.reasons.lock().unwrap(), vec![RebootReason::WatchdogCorrupted]);
        assert!(!ctx.pipeline.http_gate.is_engaged());
        let ids: Vec<EventID> = logs.try_iter().map(|l| l.event.event_id).collect();
        assert_eq!(ids, vec![EventID::WatchdogTripped, EventID::Quiescent, EventID::Reboot]);
    }
}
