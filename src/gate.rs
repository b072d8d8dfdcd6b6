use std::sync::mpsc::SyncSender;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::buffer::BoundedQueue;
use crate::config::{QUIESCENCE_POLL_MS, RETRY_QUEUE_CAPACITY, UPLOAD_QUEUE_CAPACITY};
use crate::logging::emit;
use crate::state::GatewayState;
use crate::types::{EventData, EventID, Log, LogSource, RetryDescriptor, UploadItem};

/// Marks a worker as busy on a shared resource.
///
/// The retry worker holds the sensor gate for one probe; HTTP callers hold
/// the http gate for a single request. The quiescence check engages both
/// gates to keep workers parked.
pub struct WorkerGate {
    engaged: Mutex<bool>,
    released: Condvar,
}

pub struct Engaged<'a> {
    gate: &'a WorkerGate,
}

impl WorkerGate {
    pub fn new() -> Self {
        Self { engaged: Mutex::new(false), released: Condvar::new() }
    }

    /// Blocks until the gate is free, then holds it until the guard drops.
    pub fn engage(&self) -> Engaged<'_> {
        let mut engaged = self.engaged.lock().unwrap_or_else(PoisonError::into_inner);
        while *engaged {
            engaged = self.released.wait(engaged).unwrap_or_else(PoisonError::into_inner);
        }
        *engaged = true;
        Engaged { gate: self }
    }

    /// Like `engage`, but gives up once `timeout` passes with the gate held elsewhere.
    pub fn engage_timeout(&self, timeout: Duration) -> Option<Engaged<'_>> {
        let engaged = self.engaged.lock().unwrap_or_else(PoisonError::into_inner);
        let (mut engaged, _) = self
            .released
            .wait_timeout_while(engaged, timeout, |engaged| *engaged)
            .unwrap_or_else(PoisonError::into_inner);

        if *engaged {
            return None;
        }
        *engaged = true;
        Some(Engaged { gate: self })
    }

    pub fn is_engaged(&self) -> bool {
        *self.engaged.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn disengage(&self) {
        *self.engaged.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.released.notify_one();
    }
}

impl Drop for Engaged<'_> {
    fn drop(&mut self) {
        self.gate.disengage();
    }
}

/// The two queues and the gates of the workers that drain them.
#[derive(Clone)]
pub struct Pipeline {
    pub retry_queue: Arc<BoundedQueue<RetryDescriptor>>,
    pub upload_queue: Arc<BoundedQueue<UploadItem>>,
    pub sensor_gate: Arc<WorkerGate>,
    pub http_gate: Arc<WorkerGate>,
}

/// Proof of quiescence: both gates stay engaged while this is alive.
pub struct Quiesced<'a> {
    _http: Engaged<'a>,
    _sensor: Engaged<'a>,
}

impl Pipeline {
    pub fn new() -> Self {
        Self {
            retry_queue: Arc::new(BoundedQueue::new(RETRY_QUEUE_CAPACITY)),
            upload_queue: Arc::new(BoundedQueue::new(UPLOAD_QUEUE_CAPACITY)),
            sensor_gate: Arc::new(WorkerGate::new()),
            http_gate: Arc::new(WorkerGate::new()),
        }
    }

    pub fn is_idle(&self) -> bool {
        self.retry_queue.is_idle() && self.upload_queue.is_idle()
    }

    /// Polls every `QUIESCENCE_POLL_MS` until both queues are drained and no
    /// worker holds an item, then parks both workers by holding their gates.
    /// Returns `None` if `timeout` passes with work still pending.
    pub fn wait_quiescent(
        &self,
        timeout: Duration,
        state: &GatewayState,
        log_tx: &SyncSender<Log>,
    ) -> Option<Quiesced<'_>> {
        self.wait_quiescent_every(timeout, Duration::from_millis(QUIESCENCE_POLL_MS), state, log_tx)
    }

    pub fn wait_quiescent_every(
        &self,
        timeout: Duration,
        poll: Duration,
        state: &GatewayState,
        log_tx: &SyncSender<Log>,
    ) -> Option<Quiesced<'_>> {
        let start = Instant::now();

        loop {
            if self.is_idle() {
                let http = self.http_gate.engage();
                let sensor = self.sensor_gate.engage();

                // A producer may have slipped an item in before the gates closed.
                if self.is_idle() {
                    emit(log_tx, LogSource::Gate, EventID::Quiescent, EventData::None, state.uptime_ms());
                    return Some(Quiesced { _http: http, _sensor: sensor });
                }
            }

            if start.elapsed() >= timeout {
                emit(
                    log_tx,
                    LogSource::Gate,
                    EventID::QuiescenceTimeout,
                    EventData::Queue {
                        depth: self.retry_queue.len() + self.upload_queue.len(),
                        capacity: self.retry_queue.capacity + self.upload_queue.capacity,
                    },
                    state.uptime_ms(),
                );
                return None;
            }

            thread::sleep(poll.min(timeout.saturating_sub(start.elapsed())));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SensorCommand;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::mpsc;

    fn descriptor() -> RetryDescriptor {
        RetryDescriptor::probe(Ipv4Addr::new(10, 0, 0, 1), SensorCommand::All)
    }

    #[test]
    fn gate_blocks_second_engager_until_release() {
        let gate = Arc::new(WorkerGate::new());
        let first = gate.engage();
        let entered = Arc::new(AtomicBool::new(false));

        let waiter = {
            let gate = Arc::clone(&gate);
            let entered = Arc::clone(&entered);
            thread::spawn(move || {
                let _held = gate.engage();
                entered.store(true, Ordering::SeqCst);
            })
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!entered.load(Ordering::SeqCst));
        drop(first);
        waiter.join().unwrap();
        assert!(entered.load(Ordering::SeqCst));
        assert!(!gate.is_engaged());
    }

    #[test]
    fn engage_timeout_gives_up_on_a_held_gate() {
        let gate = WorkerGate::new();
        let held = gate.engage();

        let started = Instant::now();
        assert!(gate.engage_timeout(Duration::from_millis(30)).is_none());
        assert!(started.elapsed() >= Duration::from_millis(30));

        drop(held);
        let again = gate.engage_timeout(Duration::from_millis(30));
        assert!(again.is_some());
        assert!(gate.is_engaged());
    }

    #[test]
    fn times_out_while_a_queue_holds_work() {
        let pipeline = Pipeline::new();
        let state = GatewayState::new();
        let (tx, rx) = mpsc::sync_channel(16);
        pipeline.retry_queue.try_push(descriptor()).unwrap();

        let started = Instant::now();
        let held = pipeline.wait_quiescent_every(
            Duration::from_millis(60),
            Duration::from_millis(10),
            &state,
            &tx,
        );

        assert!(held.is_none());
        assert!(started.elapsed() < Duration::from_millis(500));
        assert_eq!(rx.try_recv().unwrap().event.event_id, EventID::QuiescenceTimeout);
    }

    #[test]
    fn popped_but_unsettled_item_is_not_quiescent() {
        let pipeline = Pipeline::new();
        let state = GatewayState::new();
        let (tx, _rx) = mpsc::sync_channel(16);
        pipeline.retry_queue.try_push(descriptor()).unwrap();
        let _item = pipeline.retry_queue.pop_timeout(Duration::from_millis(10)).unwrap();

        assert!(pipeline.retry_queue.is_empty());
        assert!(pipeline
            .wait_quiescent_every(Duration::from_millis(30), Duration::from_millis(5), &state, &tx)
            .is_none());

        pipeline.retry_queue.settle();
        let held = pipeline
            .wait_quiescent_every(Duration::from_millis(30), Duration::from_millis(5), &state, &tx)
            .unwrap();
        assert!(pipeline.sensor_gate.is_engaged());
        assert!(pipeline.http_gate.is_engaged());
        drop(held);
        assert!(!pipeline.sensor_gate.is_engaged());
    }

    #[test]
    fn running_workers_drain_to_quiescence() {
        use crate::backend::Endpoints;
        use crate::backend::fakes::{FakeHttp, ok};
        use crate::protocol::encode_frame;
        use crate::retry::{RetryWorker, run_retry_worker};
        use crate::sensor_client::tests::test_client;
        use crate::simulation::{NodeBehaviour, spawn_node};
        use crate::types::FormBody;
        use crate::upload::{UploadWorker, run_upload_worker};

        let node = spawn_node(
            "127.0.0.1:0".parse().unwrap(),
            NodeBehaviour::Fixed(encode_frame("28,21.5,0,0,3")),
        )
        .unwrap();
        let (client, _dashboard, _logs) = test_client(node.port());
        let http = Arc::new(FakeHttp::new(Box::new(|_| ok(200, "1"))));
        let state = Arc::clone(&client.state);
        let pipeline = client.pipeline.clone();
        let log_tx = client.log_tx.clone();

        for _ in 0..3 {
            pipeline
                .retry_queue
                .try_push(RetryDescriptor::probe(Ipv4Addr::LOCALHOST, SensorCommand::All))
                .unwrap();
        }
        for key in 0..2 {
            let body = FormBody::new("api_key=k&sensor=DS1&location=HOME&value1=1.00&value2=0.00&value3=1").unwrap();
            pipeline.upload_queue.try_push(UploadItem { body, key, requeued: false }).unwrap();
        }

        let retry = RetryWorker {
            client,
            http: http.clone(),
            endpoints: Endpoints::new("http://logger"),
            mac_address: "24:6F:28:AA:BB:CC".to_string(),
        };
        let upload = UploadWorker {
            state: Arc::clone(&state),
            pipeline: pipeline.clone(),
            http: http.clone(),
            endpoints: Endpoints::new("http://logger"),
            log_tx: log_tx.clone(),
            stagger: Duration::ZERO,
            pace: Duration::from_millis(1),
        };
        let retry_handle = thread::spawn(move || run_retry_worker(retry));
        let upload_handle = thread::spawn(move || run_upload_worker(upload));

        let started = Instant::now();
        let held = pipeline.wait_quiescent(Duration::from_secs(10), &state, &log_tx).unwrap();

        assert!(started.elapsed() < Duration::from_secs(10));
        assert!(pipeline.retry_queue.is_empty());
        assert!(pipeline.upload_queue.is_empty());
        assert!(pipeline.sensor_gate.is_engaged());
        assert!(pipeline.http_gate.is_engaged());
        assert_eq!(state.counters.recovered_socket.load(Ordering::Relaxed), 3);
        assert_eq!(http.posts().len(), 5);

        state.workers_running.store(false, Ordering::SeqCst);
        drop(held);
        retry_handle.join().unwrap();
        upload_handle.join().unwrap();
    }
}
