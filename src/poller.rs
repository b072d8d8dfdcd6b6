use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use crate::backend::{Endpoints, HttpBackend, reset_reason_name};
use crate::config::MAIN_MS;
use crate::discovery::parse_listing;
use crate::gate::Engaged;
use crate::logging::emit;
use crate::sensor_client::{Mode, SensorClient};
use crate::types::{EventData, EventID, LogSource, SensorCommand, Slot, WidgetValue};
use crate::watchdog::LoopWatchdog;

/// Periodic discovery and fan-out over the sensor nodes.
pub struct Poller {
    pub client: SensorClient,
    pub http: Arc<dyn HttpBackend>,
    pub endpoints: Endpoints,
    pub watchdog: Arc<LoopWatchdog>,
    /// Longest a tick waits on an in-progress upload request before skipping.
    pub gate_wait: Duration,
}

const GATE_SLICE: Duration = Duration::from_millis(500);

impl Poller {
    /// Waits up to `gate_wait` for the http gate, feeding the watchdog each slice.
    fn engage_http(&self) -> Option<Engaged<'_>> {
        let state = &self.client.state;
        let deadline = Instant::now() + self.gate_wait;

        loop {
            self.watchdog.feed(state.uptime_ms());
            let slice = deadline.saturating_duration_since(Instant::now()).min(GATE_SLICE);
            if let Some(held) = self.client.pipeline.http_gate.engage_timeout(slice) {
                self.watchdog.feed(state.uptime_ms());
                return Some(held);
            }
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    fn discovery_body(&self) -> Option<String> {
        let Some(_http) = self.engage_http() else {
            log::warn!("http gate busy for {:?}, skipping discovery", self.gate_wait);
            return None;
        };
        match self.http.get(&self.endpoints.discovery()) {
            Ok(response) if !response.body.trim().is_empty() => Some(response.body),
            _ => None,
        }
    }

    /// One poll cycle. Best-effort: nothing here fails the caller. Returns the
    /// number of nodes probed.
    pub fn tick(&self) -> usize {
        let state = &self.client.state;
        let log_tx = &self.client.log_tx;

        let Some(body) = self.discovery_body() else {
            emit(log_tx, LogSource::Poller, EventID::DiscoveryFailed, EventData::None, state.uptime_ms());
            return 0;
        };

        let inventory = match parse_listing(&body) {
            Ok(inventory) => inventory,
            Err(e) => {
                log::warn!("discovery listing rejected: {}", e);
                emit(log_tx, LogSource::Poller, EventID::DiscoveryFailed, EventData::None, state.uptime_ms());
                return 0;
            }
        };

        let changed = !state.inventory().same_names(&inventory);
        if changed {
            self.client
                .dashboard
                .update_widget(Slot::TERMINAL, WidgetValue::Text(inventory.listing()));
            emit(
                log_tx,
                LogSource::Poller,
                EventID::InventoryChanged,
                EventData::Inventory { nodes: inventory.len() },
                state.uptime_ms(),
            );
        }
        state.replace_inventory(inventory);

        let inventory = state.inventory();
        for node in inventory.nodes() {
            self.watchdog.feed(state.uptime_ms());
            // Failures are already queued for recovery by the client.
            let _ = self.client.probe(node.addr, SensorCommand::All, Mode::Normal);
        }

        self.publish_counters();
        inventory.len()
    }

    pub fn publish_counters(&self) {
        let state = &self.client.state;
        let counters = &state.counters;
        let dashboard = &self.client.dashboard;

        let slots = [
            (Slot::PASS_SOCKET, &counters.pass_socket),
            (Slot::FAIL_SOCKET, &counters.fail_socket),
            (Slot::RECOVERED_SOCKET, &counters.recovered_socket),
            (Slot::RETRY, &counters.retry),
        ];
        for (slot, counter) in slots {
            dashboard.update_widget(slot, WidgetValue::Int(counter.load(Ordering::Relaxed) as i64));
        }
        dashboard.update_widget(Slot::LAST_MSG, WidgetValue::Text(state.last_msg()));

        emit(
            &self.client.log_tx,
            LogSource::Poller,
            EventID::TickCompleted,
            counters.snapshot(),
            state.uptime_ms(),
        );
    }

    /// Seeds `passSocket` from the back-end row count so it stays continuous across reboots.
    pub fn seed_counters(&self) {
        let state = &self.client.state;

        let response = {
            let _http = self.client.pipeline.http_gate.engage();
            self.http.get(&self.endpoints.row_count())
        };

        let rows = match response {
            Ok(r) if r.status == 200 => r.body.trim().parse::<u32>().ok(),
            _ => None,
        };

        if let Some(rows) = rows {
            state.counters.pass_socket.store(rows, Ordering::Relaxed);
            emit(
                &self.client.log_tx,
                LogSource::Poller,
                EventID::CounterSeed,
                EventData::Value { value: rows as i64 },
                state.uptime_ms(),
            );
        }
    }

    pub fn publish_boot_stamp(&self, reset_code: i32) {
        let stamp = format!("{} 0x{:02x}", chrono::Local::now().format("%m/%d/%Y %H:%M"), reset_code);
        let dashboard = &self.client.dashboard;

        dashboard.update_widget(Slot::BOOT_STAMP, WidgetValue::Text(stamp));
        dashboard.update_widget(
            Slot::RESET_REASON,
            WidgetValue::Text(reset_reason_name(reset_code).to_string()),
        );
        emit(
            &self.client.log_tx,
            LogSource::Poller,
            EventID::BootStamp,
            EventData::Value { value: reset_code as i64 },
            self.client.state.uptime_ms(),
        );
    }
}

/// Main loop: feeds the loop watchdog and fires a poll tick every period.
pub fn run_main_loop(poller: &Poller) {
    let state = &poller.client.state;
    let interval = poller.client.settings.timing.poll_period_ms;
    let mut next_wake_time = state.uptime_ms();

    while state.is_running.load(Ordering::Relaxed) {
        let now = state.uptime_ms();
        poller.watchdog.feed(now);

        if now >= next_wake_time {
            poller.tick();
            next_wake_time += interval;

            // A tick that overran its period is not made up for.
            let now = state.uptime_ms();
            if next_wake_time < now {
                next_wake_time = now + interval;
            }
        }

        thread::sleep(Duration::from_millis(MAIN_MS.min(interval.max(1))));
    }
}
