use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread;
use std::time::Duration;

use crate::backend::{Endpoints, HttpBackend};
use crate::buffer::QueueFull;
use crate::config::{RETRY_PRIORITY, WORKER_IDLE_MS};
use crate::logging::emit;
use crate::sensor_client::{Mode, SensorClient};
use crate::state::apply_task_priority;
use crate::types::{EventData, EventID, LogSource, RetryDescriptor, WorkKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    Recovered,
    Requeued,
    /// Re-enqueue was rejected: the device was retired and the queue reset.
    Tripped,
}

pub struct RetryWorker {
    pub client: SensorClient,
    pub http: Arc<dyn HttpBackend>,
    pub endpoints: Endpoints,
    pub mac_address: String,
}

impl RetryWorker {
    /// Runs one dequeued descriptor to completion and settles it.
    pub fn process(&self, descriptor: RetryDescriptor) -> RetryOutcome {
        let outcome = self.attempt(descriptor);

        if outcome == RetryOutcome::Tripped {
            self.trip();
        }

        self.client.pipeline.retry_queue.settle();
        outcome
    }

    fn attempt(&self, descriptor: RetryDescriptor) -> RetryOutcome {
        let client = &self.client;
        let counters = &client.state.counters;
        let queue = &client.pipeline.retry_queue;

        let _sensor = client.pipeline.sensor_gate.engage();
        thread::sleep(Duration::from_millis(client.settings.timing.retry_pace_ms));

        counters.retry.fetch_add(1, Ordering::Relaxed);
        let result = match descriptor.kind {
            WorkKind::SensorProbe => client.probe(descriptor.addr, descriptor.command, Mode::Recovery),
        };

        let now = client.state.uptime_ms();
        let node = EventData::Node { addr: descriptor.addr, command: descriptor.command };

        if result.is_ok() {
            counters.recovered_socket.fetch_add(1, Ordering::Relaxed);
            emit(&client.log_tx, LogSource::RetryWorker, EventID::RetryRecovered, node, now);
            return RetryOutcome::Recovered;
        }

        match queue.try_push(descriptor) {
            Ok(()) => {
                emit(&client.log_tx, LogSource::RetryWorker, EventID::RetryRequeued, node, now);
                RetryOutcome::Requeued
            }
            Err(QueueFull(_)) => RetryOutcome::Tripped,
        }
    }

    /// Circuit breaker: retire this device server-side and drop the backlog.
    /// Runs after the sensor gate is released so only the quiescence gate ever
    /// holds both gates.
    fn trip(&self) {
        let client = &self.client;

        let retired = {
            let _http = client.pipeline.http_gate.engage();
            self.http.get(&self.endpoints.retire_device(&self.mac_address))
        };
        if let Err(e) = retired {
            log::warn!("deleteMAC request failed: {}", e);
        }

        let dropped = client.pipeline.retry_queue.clear();
        emit(
            &client.log_tx,
            LogSource::RetryWorker,
            EventID::RetryQueueTripped,
            EventData::Queue { depth: dropped, capacity: client.pipeline.retry_queue.capacity },
            client.state.uptime_ms(),
        );
    }
}

pub fn run_retry_worker(worker: RetryWorker) {
    let state = Arc::clone(&worker.client.state);

    if let Err(e) = apply_task_priority(RETRY_PRIORITY) {
        emit(
            &worker.client.log_tx,
            LogSource::RetryWorker,
            EventID::PriorityRejected,
            EventData::Value { value: RETRY_PRIORITY as i64 },
            state.uptime_ms(),
        );
        log::debug!("retry worker priority: {}", e);
    }

    while state.workers_running.load(Ordering::Relaxed) {
        let Some(descriptor) = worker
            .client
            .pipeline
            .retry_queue
            .pop_timeout(Duration::from_millis(WORKER_IDLE_MS))
        else {
            continue;
        };

        worker.process(descriptor);
    }
}
