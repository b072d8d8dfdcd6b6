use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::sync::mpsc::SyncSender;
use std::thread;
use std::time::Duration;

use crate::backend::{Endpoints, HttpBackend};
use crate::config::{ROLLBACK_ATTEMPTS, UPLOAD_PRIORITY, WORKER_IDLE_MS};
use crate::gate::Pipeline;
use crate::logging::emit;
use crate::state::{GatewayState, apply_task_priority};
use crate::types::{EventData, EventID, Log, LogSource, UploadItem};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    Posted,
    /// POST failed, the rollback GET removed the server-side row.
    Reconciled,
    Requeued,
    Lost,
}

pub struct UploadWorker {
    pub state: Arc<GatewayState>,
    pub pipeline: Pipeline,
    pub http: Arc<dyn HttpBackend>,
    pub endpoints: Endpoints,
    pub log_tx: SyncSender<Log>,
    pub stagger: Duration,
    pub pace: Duration,
}

/// Row id from a `<id>|...` POST response.
pub fn response_id(body: &str) -> Option<i64> {
    body.split('|').next()?.trim().parse().ok()
}

impl UploadWorker {
    /// POSTs one dequeued item, compensating on failure, and settles it.
    ///
    /// The http gate is held per request only; the stagger and pace sleeps
    /// leave it free for discovery and the retry worker.
    pub fn process(&self, item: UploadItem) -> UploadOutcome {
        thread::sleep(self.stagger);
        let outcome = self.post(item);
        thread::sleep(self.pace);

        self.pipeline.upload_queue.settle();
        outcome
    }

    fn gated<T>(&self, request: impl FnOnce(&dyn HttpBackend) -> T) -> T {
        let _http = self.pipeline.http_gate.engage();
        request(self.http.as_ref())
    }

    fn post(&self, item: UploadItem) -> UploadOutcome {
        let stats = &self.state.uploads;
        let url = self.endpoints.post_row();

        match self.gated(|http| http.post_form(&url, item.body.as_str())) {
            Ok(response) => {
                stats.posted.fetch_add(1, Ordering::Relaxed);
                let data = match response_id(&response.body) {
                    Some(id) => EventData::Value { value: id },
                    None => EventData::Http { status: response.status },
                };
                emit(&self.log_tx, LogSource::UploadWorker, EventID::UploadPosted, data, self.state.uptime_ms());
                UploadOutcome::Posted
            }
            Err(e) => {
                stats.failed.fetch_add(1, Ordering::Relaxed);
                log::debug!("POST for key {} failed: {}", item.key, e);
                emit(
                    &self.log_tx,
                    LogSource::UploadWorker,
                    EventID::UploadFailed,
                    EventData::Rollback { key: item.key, attempts: 0 },
                    self.state.uptime_ms(),
                );

                if self.rollback(item.key) {
                    stats.reconciled.fetch_add(1, Ordering::Relaxed);
                    UploadOutcome::Reconciled
                } else {
                    self.requeue(item)
                }
            }
        }
    }

    /// Up to `ROLLBACK_ATTEMPTS` deletes of the row, spaced by the upload pace.
    fn rollback(&self, key: i32) -> bool {
        let url = self.endpoints.rollback(key);

        for attempt in 1..=ROLLBACK_ATTEMPTS {
            if attempt > 1 {
                thread::sleep(self.pace);
            }

            if matches!(self.gated(|http| http.get(&url)), Ok(r) if r.status == 200) {
                emit(
                    &self.log_tx,
                    LogSource::UploadWorker,
                    EventID::RollbackSucceeded,
                    EventData::Rollback { key, attempts: attempt },
                    self.state.uptime_ms(),
                );
                return true;
            }
        }

        emit(
            &self.log_tx,
            LogSource::UploadWorker,
            EventID::RollbackExhausted,
            EventData::Rollback { key, attempts: ROLLBACK_ATTEMPTS },
            self.state.uptime_ms(),
        );
        false
    }

    fn requeue(&self, item: UploadItem) -> UploadOutcome {
        let stats = &self.state.uploads;
        let now = self.state.uptime_ms();

        if !item.requeued && self.pipeline.upload_queue.try_push(UploadItem { requeued: true, ..item }).is_ok() {
            stats.requeued.fetch_add(1, Ordering::Relaxed);
            emit(
                &self.log_tx,
                LogSource::UploadWorker,
                EventID::UploadRequeued,
                EventData::Value { value: item.key as i64 },
                now,
            );
            return UploadOutcome::Requeued;
        }

        stats.lost.fetch_add(1, Ordering::Relaxed);
        emit(
            &self.log_tx,
            LogSource::UploadWorker,
            EventID::UploadLost,
            EventData::Value { value: item.key as i64 },
            now,
        );
        UploadOutcome::Lost
    }
}

pub fn run_upload_worker(worker: UploadWorker) {
    if let Err(e) = apply_task_priority(UPLOAD_PRIORITY) {
        emit(
            &worker.log_tx,
            LogSource::UploadWorker,
            EventID::PriorityRejected,
            EventData::Value { value: UPLOAD_PRIORITY as i64 },
            worker.state.uptime_ms(),
        );
        log::debug!("upload worker priority: {}", e);
    }

    while worker.state.workers_running.load(Ordering::Relaxed) {
        let Some(item) = worker
            .pipeline
            .upload_queue
            .pop_timeout(Duration::from_millis(WORKER_IDLE_MS))
        else {
            continue;
        };

        worker.process(item);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fakes::{FakeHttp, ok, transport};
    use crate::backend::{HttpError, HttpResponse};
    use crate::types::FormBody;
    use std::sync::Mutex;
    use std::sync::mpsc::{self, Receiver};

    fn worker_with(http: Arc<FakeHttp>) -> (UploadWorker, Receiver<Log>) {
        let (log_tx, log_rx) = mpsc::sync_channel(1024);
        let worker = UploadWorker {
            state: Arc::new(GatewayState::new()),
            pipeline: Pipeline::new(),
            http,
            endpoints: Endpoints::new("http://logger"),
            log_tx,
            stagger: Duration::ZERO,
            pace: Duration::from_millis(1),
        };
        (worker, log_rx)
    }

    fn item(key: i32) -> UploadItem {
        UploadItem {
            body: FormBody::new(&format!("api_key=k&sensor=BME280&location=HOME&value1=1.00&value2=2.00&value3={}", key))
                .unwrap(),
            key,
            requeued: false,
        }
    }

    fn run(worker: &UploadWorker, item: UploadItem) -> UploadOutcome {
        worker.pipeline.upload_queue.try_push(item).unwrap();
        let popped = worker.pipeline.upload_queue.pop_timeout(Duration::from_millis(10)).unwrap();
        worker.process(popped)
    }

    /// GET responder that fails the first `failures` rollback calls.
    fn flaky_rollback(failures: usize) -> Box<dyn Fn(&str) -> Result<HttpResponse, HttpError> + Send + Sync> {
        let calls = Mutex::new(0usize);
        Box::new(move |_| {
            let mut calls = calls.lock().unwrap();
            *calls += 1;
            if *calls <= failures { transport() } else { ok(200, "1") }
        })
    }

    #[test]
    fn successful_post_is_counted_once() {
        let http = Arc::new(FakeHttp::new(Box::new(|_| ok(200, ""))));
        let (worker, logs) = worker_with(http.clone());

        assert_eq!(run(&worker, item(42)), UploadOutcome::Posted);
        assert_eq!(http.posts().len(), 1);
        assert!(http.gets().is_empty());
        assert_eq!(worker.state.uploads.posted.load(Ordering::Relaxed), 1);
        assert!(worker.pipeline.upload_queue.is_idle());
        assert!(!worker.pipeline.http_gate.is_engaged());

        let posted = logs.try_iter().find(|l| l.event.event_id == EventID::UploadPosted).unwrap();
        assert_eq!(posted.event.data, EventData::Value { value: 7 });
    }

    #[test]
    fn transport_failures_are_reconciled_by_rollback() {
        let http = Arc::new(FakeHttp::new(flaky_rollback(2)));
        http.script_posts(vec![transport(), transport(), transport()]);
        let (worker, _logs) = worker_with(http.clone());

        for key in [10, 11, 12] {
            assert_eq!(run(&worker, item(key)), UploadOutcome::Reconciled);
        }

        let stats = &worker.state.uploads;
        assert_eq!(stats.failed.load(Ordering::Relaxed), 3);
        assert_eq!(stats.reconciled.load(Ordering::Relaxed), 3);
        assert_eq!(stats.posted.load(Ordering::Relaxed), 0);
        // No duplicate uploads.
        assert_eq!(http.posts().len(), 3);
        assert!(worker.pipeline.upload_queue.is_empty());

        let gets = http.gets();
        assert_eq!(gets.len(), 5);
        assert_eq!(gets[0], "http://logger/delete.php?key=10");
        assert_eq!(gets[2], "http://logger/delete.php?key=10");
        assert_eq!(gets[3], "http://logger/delete.php?key=11");
        assert_eq!(gets[4], "http://logger/delete.php?key=12");
    }

    #[test]
    fn exhausted_rollback_requeues_once_then_drops() {
        let http = Arc::new(FakeHttp::new(Box::new(|_| ok(500, ""))));
        http.script_posts(vec![transport(), transport()]);
        let (worker, _logs) = worker_with(http.clone());

        assert_eq!(run(&worker, item(5)), UploadOutcome::Requeued);
        assert_eq!(http.gets().len(), ROLLBACK_ATTEMPTS as usize);

        let again = worker.pipeline.upload_queue.pop_timeout(Duration::from_millis(10)).unwrap();
        assert!(again.requeued);
        assert_eq!(again.key, 5);
        assert_eq!(worker.process(again), UploadOutcome::Lost);

        let stats = &worker.state.uploads;
        assert_eq!(stats.requeued.load(Ordering::Relaxed), 1);
        assert_eq!(stats.lost.load(Ordering::Relaxed), 1);
        assert_eq!(http.gets().len(), 2 * ROLLBACK_ATTEMPTS as usize);
        assert!(worker.pipeline.upload_queue.is_idle());
    }

    #[test]
    fn requeue_into_full_queue_is_lost() {
        let http = Arc::new(FakeHttp::new(Box::new(|_| transport())));
        http.script_posts(vec![transport()]);
        let (worker, _logs) = worker_with(http);

        worker.pipeline.upload_queue.try_push(item(1)).unwrap();
        let popped = worker.pipeline.upload_queue.pop_timeout(Duration::from_millis(10)).unwrap();
        while worker.pipeline.upload_queue.try_push(item(2)).is_ok() {}

        assert_eq!(worker.process(popped), UploadOutcome::Lost);
        assert_eq!(worker.state.uploads.lost.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn gate_is_free_between_rollback_requests() {
        let http = Arc::new(FakeHttp::new(Box::new(|_| transport())));
        http.script_posts(vec![transport()]);
        let (mut worker, _logs) = worker_with(http.clone());
        worker.pace = Duration::from_millis(100);
        let worker = Arc::new(worker);

        worker.pipeline.upload_queue.try_push(item(9)).unwrap();
        let popped = worker.pipeline.upload_queue.pop_timeout(Duration::from_millis(10)).unwrap();
        let runner = {
            let worker = Arc::clone(&worker);
            thread::spawn(move || worker.process(popped))
        };

        // Mid-rollback, another caller gets the gate within one request.
        while http.gets().is_empty() {
            thread::sleep(Duration::from_millis(1));
        }
        let started = std::time::Instant::now();
        let held = worker.pipeline.http_gate.engage_timeout(Duration::from_millis(150));
        assert!(held.is_some());
        assert!(started.elapsed() < Duration::from_millis(150));
        assert!(!worker.pipeline.upload_queue.is_idle());
        drop(held);

        assert_eq!(runner.join().unwrap(), UploadOutcome::Requeued);
        assert!(!worker.pipeline.http_gate.is_engaged());
    }

    #[test]
    fn response_id_reads_leading_field() {
        assert_eq!(response_id("1377|New record created"), Some(1377));
        assert_eq!(response_id("error"), None);
        assert_eq!(response_id(""), None);
    }
}
