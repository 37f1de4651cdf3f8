use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::{Duration, Instant},
};

use anyhow::Context;
use futures::StreamExt;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{
    generation::Generator,
    job::{event_kind, round3, JobEvent, JobRecord, StatsRecord},
    jobs::JobStateStore,
    queue::JobQueue,
    skin::{PixelSkinEstimator, SkinEstimator},
};

/// External sink for failures caught at the worker boundary.
pub trait ErrorReporter: Send + Sync {
    fn capture(&self, job_id: Option<Uuid>, err: &anyhow::Error);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl ErrorReporter for TracingReporter {
    fn capture(&self, job_id: Option<Uuid>, err: &anyhow::Error) {
        tracing::error!(target: "error_tracking", job_id = ?job_id, error = ?err, "worker failure captured");
    }
}

struct ActiveJob {
    id: Uuid,
    cancel: CancellationToken,
    discard: bool,
}

#[derive(Default)]
struct WorkerState {
    busy: AtomicBool,
    active: Mutex<Option<ActiveJob>>,
}

/// Read side of the worker's in-memory state. Only the [`Worker`] itself marks
/// jobs as started or finished; everyone else can observe and request a cancel.
#[derive(Clone, Default)]
pub struct WorkerHandle {
    state: Arc<WorkerState>,
}

impl WorkerHandle {
    fn active(&self) -> MutexGuard<'_, Option<ActiveJob>> {
        self.state
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_busy(&self) -> bool {
        self.state.busy.load(Ordering::SeqCst)
    }

    pub fn current_job(&self) -> Option<Uuid> {
        self.active().as_ref().map(|job| job.id)
    }

    /// Signals the running job to stop. Returns false when `id` is not the running job.
    pub fn request_cancel(&self, id: Uuid) -> bool {
        self.stop(id, false)
    }

    /// Like [`WorkerHandle::request_cancel`], but the worker drops the job's record
    /// instead of writing it back as canceled.
    pub fn request_discard(&self, id: Uuid) -> bool {
        self.stop(id, true)
    }

    fn stop(&self, id: Uuid, discard: bool) -> bool {
        match self.active().as_mut() {
            Some(job) if job.id == id => {
                job.discard |= discard;
                job.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    fn discarded(&self) -> bool {
        self.active().as_ref().is_some_and(|job| job.discard)
    }

    fn begin(&self, id: Uuid) -> CancellationToken {
        let cancel = CancellationToken::new();
        *self.active() = Some(ActiveJob {
            id,
            cancel: cancel.clone(),
            discard: false,
        });
        self.state.busy.store(true, Ordering::SeqCst);
        cancel
    }

    fn finish(&self) {
        self.state.busy.store(false, Ordering::SeqCst);
        *self.active() = None;
    }
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub idle_interval: Duration,
    pub calculate_skin: bool,
    pub output_dir: PathBuf,
}

enum Step {
    Event(Value),
    Exhausted,
    Canceled,
}

pub struct Worker {
    queue: JobQueue,
    jobs: JobStateStore,
    generator: Arc<dyn Generator>,
    skin: Arc<dyn SkinEstimator>,
    reporter: Arc<dyn ErrorReporter>,
    settings: WorkerSettings,
    handle: WorkerHandle,
}

impl Worker {
    pub fn new(
        queue: JobQueue,
        jobs: JobStateStore,
        generator: Arc<dyn Generator>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            queue,
            jobs,
            generator,
            skin: Arc::new(PixelSkinEstimator),
            reporter: Arc::new(TracingReporter),
            settings,
            handle: WorkerHandle::default(),
        }
    }

    pub fn with_skin_estimator(mut self, skin: Arc<dyn SkinEstimator>) -> Self {
        self.skin = skin;
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn ErrorReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    pub fn handle(&self) -> WorkerHandle {
        self.handle.clone()
    }

    /// Drains the queue until `shutdown` fires. A job in flight always runs to the end.
    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!("starting background worker task");
        if let Err(err) = self.jobs.set_idle().await {
            tracing::warn!(error = %err, "could not reset worker status");
        }

        while !shutdown.is_cancelled() {
            match self.process_next().await {
                Ok(true) => continue,
                Ok(false) => {}
                Err(err) => {
                    tracing::error!(error = ?err, "failed to fetch next job");
                    self.reporter.capture(None, &err);
                }
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.idle_interval) => {}
            }
        }
        tracing::info!("background worker stopped");
    }

    /// Runs the job at the head of the queue, if any. Returns whether one was taken.
    pub async fn process_next(&self) -> anyhow::Result<bool> {
        let Some(job) = self
            .queue
            .dequeue_one()
            .await
            .context("dequeue pending job")?
        else {
            return Ok(false);
        };

        let job_id = job.uuid;
        // Claimed before the stored record is read: a cancel that misses the queue
        // entry either reaches this token or has already written the record.
        let cancel = self.handle.begin(job_id);
        if let Err(err) = self.run_claimed(job_id, &cancel).await {
            tracing::error!(job_id = %job_id, error = ?err, "an exception occurred in the background worker");
            self.reporter.capture(Some(job_id), &err);
            self.mark_failed(job, &err).await;
        }
        self.cleanup().await;
        Ok(true)
    }

    async fn run_claimed(&self, job_id: Uuid, cancel: &CancellationToken) -> anyhow::Result<()> {
        let job = match self.jobs.get(job_id).await.context("load dequeued job")? {
            Some(stored) if stored.event == JobEvent::Queued => stored,
            Some(stored) => {
                tracing::info!(job_id = %job_id, event = %stored.event, "skipping job that is no longer queued");
                return Ok(());
            }
            None => {
                tracing::info!(job_id = %job_id, "skipping job whose record is gone");
                return Ok(());
            }
        };
        self.execute(job, cancel).await
    }

    async fn execute(&self, mut job: JobRecord, cancel: &CancellationToken) -> anyhow::Result<()> {
        tracing::info!(job_id = %job.uuid, prompt = job.prompt().unwrap_or_default(), "working on job");
        self.jobs.set_working(job.uuid).await?;

        let started = Instant::now();
        let mut events = self.generator.request(job.generation_params());
        let mut raw = Vec::new();
        let mut result = None;

        loop {
            let step = tokio::select! {
                biased;
                _ = cancel.cancelled() => Step::Canceled,
                next = events.next() => next.map_or(Step::Exhausted, Step::Event),
            };
            let event = match step {
                Step::Event(event) => event,
                Step::Exhausted => break,
                Step::Canceled => {
                    drop(events);
                    return self.finish_canceled(job, raw).await;
                }
            };

            job.apply_progress(&event)?;
            self.jobs
                .set_status(&json!({ "uuid": job.uuid, "status": event }))
                .await?;
            if event_kind(&event) == Some("result") {
                result = Some(event.clone());
            }
            raw.push(event);
            self.jobs.put(&job).await?;
        }

        let elapsed = started.elapsed();
        match result {
            Some(result) => {
                job.transition(JobEvent::Done)?;
                job.result = Some(result);
            }
            None => {
                job.transition(JobEvent::Error)?;
                job.message
                    .get_or_insert_with(|| "generation backend returned no result".to_string());
            }
        }
        job.raw = Some(raw);
        self.jobs.put(&job).await?;

        self.record_stats(&job, elapsed).await?;
        tracing::info!(
            job_id = %job.uuid,
            event = %job.event,
            took_secs = elapsed.as_secs_f64(),
            "finished working on job"
        );
        Ok(())
    }

    async fn finish_canceled(&self, mut job: JobRecord, raw: Vec<Value>) -> anyhow::Result<()> {
        if self.handle.discarded() {
            self.jobs.delete(job.uuid).await?;
            tracing::info!(job_id = %job.uuid, "job deleted while running");
            return Ok(());
        }
        job.transition(JobEvent::Canceled)?;
        job.raw = Some(raw);
        self.jobs.put(&job).await?;
        tracing::info!(job_id = %job.uuid, "job canceled while running");
        Ok(())
    }

    async fn record_stats(&self, job: &JobRecord, elapsed: Duration) -> anyhow::Result<()> {
        let stats = StatsRecord {
            skin: round3(self.skin_ratio(job).await.clamp(0.0, 100.0)),
            charlen: job.prompt().map_or(0, |prompt| prompt.chars().count()),
            processtime: round3(elapsed.as_secs_f64()),
            queuesize: self.queue.len().await?,
        };
        self.jobs.put_stats(&stats).await?;
        Ok(())
    }

    async fn skin_ratio(&self, job: &JobRecord) -> f64 {
        if !self.settings.calculate_skin {
            return 0.0;
        }
        let Some(path) = job.image_file(&self.settings.output_dir) else {
            return 0.0;
        };
        let estimator = self.skin.clone();
        match tokio::task::spawn_blocking(move || estimator.estimate(&path)).await {
            Ok(Ok(ratio)) => ratio,
            Ok(Err(err)) => {
                tracing::warn!(job_id = %job.uuid, error = %err, "skin estimate failed");
                0.0
            }
            Err(err) => {
                tracing::warn!(job_id = %job.uuid, error = %err, "skin estimate task aborted");
                0.0
            }
        }
    }

    /// Best-effort `error` write for a job that failed after leaving the queue.
    /// Falls back to the dequeued copy when the stored record cannot be read.
    async fn mark_failed(&self, dequeued: JobRecord, err: &anyhow::Error) {
        let job_id = dequeued.uuid;
        if self.handle.discarded() {
            if let Err(store_err) = self.jobs.delete(job_id).await {
                tracing::warn!(job_id = %job_id, error = %store_err, "could not drop discarded job");
            }
            return;
        }
        let mut job = match self.jobs.get(job_id).await {
            Ok(Some(job)) => job,
            Ok(None) => return,
            Err(store_err) => {
                tracing::warn!(job_id = %job_id, error = %store_err, "could not load failed job, using dequeued copy");
                dequeued
            }
        };
        if job.transition(JobEvent::Error).is_err() {
            return;
        }
        job.message = Some(format!("{err:#}"));
        if let Err(store_err) = self.jobs.put(&job).await {
            tracing::warn!(job_id = %job_id, error = %store_err, "could not mark job as failed");
        }
    }

    async fn cleanup(&self) {
        if let Err(err) = self.jobs.clear_working().await {
            tracing::warn!(error = %err, "could not clear working marker");
        }
        if let Err(err) = self.jobs.set_idle().await {
            tracing::warn!(error = %err, "could not reset worker status");
        }
        self.handle.finish();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicUsize, Mutex as StdMutex};

    use async_trait::async_trait;
    use futures::stream;
    use serde_json::Map;

    use super::*;
    use crate::{
        config::KeyExpiry,
        generation::EventStream,
        job::Initiator,
        jobs::IDLE_STATUS,
        store::{keys, KeyValueStore, MemoryStore, Store, StoreError},
    };

    struct Scripted {
        events: Vec<Value>,
        hang: bool,
        seen: StdMutex<Vec<Map<String, Value>>>,
    }

    impl Scripted {
        fn new(events: Vec<Value>) -> Self {
            Self {
                events,
                hang: false,
                seen: StdMutex::new(Vec::new()),
            }
        }

        fn hanging(events: Vec<Value>) -> Self {
            Self {
                hang: true,
                ..Self::new(events)
            }
        }
    }

    impl Generator for Scripted {
        fn request(&self, params: Map<String, Value>) -> EventStream {
            self.seen.lock().unwrap().push(params);
            let events = stream::iter(self.events.clone());
            if self.hang {
                events.chain(stream::pending()).boxed()
            } else {
                events.boxed()
            }
        }
    }

    struct FixedSkin(f64);

    impl SkinEstimator for FixedSkin {
        fn estimate(&self, _path: &std::path::Path) -> anyhow::Result<f64> {
            Ok(self.0)
        }
    }

    #[derive(Default)]
    struct Recording(StdMutex<Vec<Option<Uuid>>>);

    impl ErrorReporter for Recording {
        fn capture(&self, job_id: Option<Uuid>, _err: &anyhow::Error) {
            self.0.lock().unwrap().push(job_id);
        }
    }

    struct Harness {
        queue: JobQueue,
        jobs: JobStateStore,
        worker: Worker,
    }

    fn harness(generator: Arc<dyn Generator>) -> Harness {
        let store = Store::memory();
        let queue = JobQueue::new(store.clone());
        let jobs = JobStateStore::new(store, KeyExpiry::default());
        let worker = Worker::new(
            queue.clone(),
            jobs.clone(),
            generator,
            WorkerSettings {
                idle_interval: Duration::from_millis(5),
                calculate_skin: true,
                output_dir: PathBuf::from("/outputs"),
            },
        )
        .with_skin_estimator(Arc::new(FixedSkin(12.34567)));
        Harness { queue, jobs, worker }
    }

    async fn submit(h: &Harness, prompt: &str) -> JobRecord {
        let mut params = Map::new();
        params.insert("prompt".into(), json!(prompt));
        let job = JobRecord::new(params, Initiator::Api);
        h.jobs.create(&job).await.unwrap();
        h.queue.enqueue(&job).await.unwrap();
        job
    }

    fn happy_events() -> Vec<Value> {
        vec![
            json!({"event": "step", "step": 1}),
            json!({"event": "step", "step": 2}),
            json!({"event": "upscaling-started"}),
            json!({"event": "result", "url": "outputs/img-samples/1.png", "seed": 42}),
        ]
    }

    #[tokio::test]
    async fn idle_queue_processes_nothing() {
        let h = harness(Arc::new(Scripted::new(vec![])));
        assert!(!h.worker.process_next().await.unwrap());
    }

    #[tokio::test]
    async fn completed_job_has_result_raw_and_stats() {
        let generator = Arc::new(Scripted::new(happy_events()));
        let h = harness(generator.clone());
        let job = submit(&h, "cat").await;

        assert!(h.worker.process_next().await.unwrap());

        let done = h.jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(done.event, JobEvent::Done);
        assert_eq!(done.result.as_ref().unwrap()["url"], "outputs/img-samples/1.png");
        assert_eq!(done.raw.as_ref().unwrap().len(), 4);

        let forwarded = &generator.seen.lock().unwrap()[0];
        assert_eq!(forwarded["prompt"], "cat");
        for key in ["event", "uuid", "initiator", "timestamp"] {
            assert!(!forwarded.contains_key(key));
        }

        let stats = h.jobs.take_stats().await.unwrap().unwrap();
        assert_eq!(stats.charlen, 3);
        assert_eq!(stats.skin, 12.346);
        assert_eq!(stats.queuesize, 0);

        assert!(h.jobs.working().await.unwrap().is_none());
        assert_eq!(h.jobs.status().await.unwrap().unwrap()["status"], IDLE_STATUS);
        assert!(!h.worker.handle().is_busy());
        assert!(h.worker.handle().current_job().is_none());
    }

    #[tokio::test]
    async fn backend_error_ends_in_error_state() {
        let h = harness(Arc::new(Scripted::new(vec![json!({
            "error": "Generation backend returned a http-status code of 500"
        })])));
        let job = submit(&h, "cat").await;

        h.worker.process_next().await.unwrap();

        let failed = h.jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(failed.event, JobEvent::Error);
        assert!(failed.result.is_none());
        let raw = failed.raw.unwrap();
        assert_eq!(raw.len(), 1);
        assert!(raw[0]["error"].as_str().unwrap().contains("500"));
        assert!(failed.message.unwrap().contains("500"));
    }

    #[tokio::test]
    async fn jobs_run_in_submission_order() {
        let generator = Arc::new(Scripted::new(happy_events()));
        let h = harness(generator.clone());
        for prompt in ["A", "B", "C"] {
            submit(&h, prompt).await;
        }
        while h.worker.process_next().await.unwrap() {}

        let prompts: Vec<String> = generator
            .seen
            .lock()
            .unwrap()
            .iter()
            .map(|params| params["prompt"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(prompts, vec!["A", "B", "C"]);
    }

    #[tokio::test]
    async fn canceling_running_job_stops_it() {
        let generator = Arc::new(Scripted::hanging(vec![json!({"event": "step", "step": 1})]));
        let h = harness(generator);
        let job = submit(&h, "cat").await;
        let handle = h.worker.handle();
        let jobs = h.jobs.clone();

        let worker = h.worker;
        let task = tokio::spawn(async move { worker.process_next().await });

        for _ in 0..200 {
            let current = jobs.get(job.uuid).await.unwrap().unwrap();
            if current.event == JobEvent::Generating {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.is_busy());
        assert_eq!(handle.current_job(), Some(job.uuid));
        assert!(!handle.request_cancel(Uuid::new_v4()));
        assert!(handle.request_cancel(job.uuid));

        task.await.unwrap().unwrap();
        let canceled = jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(canceled.event, JobEvent::Canceled);
        assert!(canceled.result.is_none());
        assert!(!handle.is_busy());
        assert!(jobs.working().await.unwrap().is_none());
        assert!(jobs.take_stats().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn canceled_pending_job_is_skipped() {
        let generator = Arc::new(Scripted::new(happy_events()));
        let h = harness(generator.clone());
        let job = submit(&h, "cat").await;
        let mut stored = h.jobs.get(job.uuid).await.unwrap().unwrap();
        stored.transition(JobEvent::Canceled).unwrap();
        h.jobs.put(&stored).await.unwrap();

        assert!(h.worker.process_next().await.unwrap());
        assert!(generator.seen.lock().unwrap().is_empty());
        assert_eq!(h.jobs.get(job.uuid).await.unwrap().unwrap().event, JobEvent::Canceled);
    }

    /// Memory backend with injectable command failures.
    #[derive(Default)]
    struct Faulty {
        inner: MemoryStore,
        reject_working_marker: bool,
        failing_job_reads: AtomicUsize,
    }

    #[async_trait]
    impl KeyValueStore for Faulty {
        async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
            let fail_read = key.starts_with("job-")
                && self
                    .failing_job_reads
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if fail_read {
                return Err(StoreError::Command("connection reset".into()));
            }
            self.inner.get(key).await
        }
        async fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.inner.set(key, value).await
        }
        async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
            if self.reject_working_marker && key == keys::CURRENT_WORKING {
                return Err(StoreError::Command("READONLY replica".into()));
            }
            self.inner.set_ex(key, value, ttl).await
        }
        async fn delete(&self, key: &str) -> Result<(), StoreError> {
            self.inner.delete(key).await
        }
        async fn list_push_front(&self, key: &str, value: String) -> Result<(), StoreError> {
            self.inner.list_push_front(key, value).await
        }
        async fn list_pop_back(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.list_pop_back(key).await
        }
        async fn list_pop_front(&self, key: &str) -> Result<Option<String>, StoreError> {
            self.inner.list_pop_front(key).await
        }
        async fn list_range(&self, key: &str) -> Result<Vec<String>, StoreError> {
            self.inner.list_range(key).await
        }
        async fn list_remove(&self, key: &str, value: &str) -> Result<usize, StoreError> {
            self.inner.list_remove(key, value).await
        }
        async fn keys(&self, pattern: &str) -> Result<Vec<String>, StoreError> {
            self.inner.keys(pattern).await
        }
    }

    struct FaultyHarness {
        queue: JobQueue,
        jobs: JobStateStore,
        worker: Worker,
        reporter: Arc<Recording>,
    }

    async fn faulty_harness(backend: Faulty) -> (FaultyHarness, JobRecord) {
        let store = Store::new(Arc::new(backend));
        let queue = JobQueue::new(store.clone());
        let jobs = JobStateStore::new(store, KeyExpiry::default());
        let reporter = Arc::new(Recording::default());
        let worker = Worker::new(
            queue.clone(),
            jobs.clone(),
            Arc::new(Scripted::new(happy_events())),
            WorkerSettings {
                idle_interval: Duration::from_millis(5),
                calculate_skin: false,
                output_dir: PathBuf::from("/outputs"),
            },
        )
        .with_reporter(reporter.clone());

        let job = JobRecord::new(Map::new(), Initiator::Api);
        jobs.create(&job).await.unwrap();
        queue.enqueue(&job).await.unwrap();
        let harness = FaultyHarness {
            queue,
            jobs,
            worker,
            reporter,
        };
        (harness, job)
    }

    #[tokio::test]
    async fn failures_are_reported_and_cleaned_up() {
        let (h, job) = faulty_harness(Faulty {
            reject_working_marker: true,
            ..Faulty::default()
        })
        .await;

        assert!(h.worker.process_next().await.unwrap());

        assert_eq!(h.reporter.0.lock().unwrap().as_slice(), &[Some(job.uuid)]);
        let failed = h.jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(failed.event, JobEvent::Error);
        assert!(failed.message.unwrap().contains("READONLY"));
        assert!(h.jobs.working().await.unwrap().is_none());
        assert_eq!(h.jobs.status().await.unwrap().unwrap()["status"], IDLE_STATUS);
        assert!(!h.worker.handle().is_busy());
    }

    #[tokio::test]
    async fn unreadable_record_after_dequeue_ends_in_error() {
        let (h, job) = faulty_harness(Faulty {
            failing_job_reads: AtomicUsize::new(1),
            ..Faulty::default()
        })
        .await;

        assert!(h.worker.process_next().await.unwrap());

        assert!(h.queue.is_empty().await.unwrap());
        assert_eq!(h.reporter.0.lock().unwrap().as_slice(), &[Some(job.uuid)]);
        let failed = h.jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(failed.event, JobEvent::Error);
        assert!(failed.message.unwrap().contains("connection reset"));
        assert!(!h.worker.handle().is_busy());
    }

    #[tokio::test]
    async fn record_falls_back_to_dequeued_copy_when_store_stays_down() {
        let (h, job) = faulty_harness(Faulty {
            failing_job_reads: AtomicUsize::new(2),
            ..Faulty::default()
        })
        .await;

        assert!(h.worker.process_next().await.unwrap());

        let failed = h.jobs.get(job.uuid).await.unwrap().unwrap();
        assert_eq!(failed.event, JobEvent::Error);
    }

    #[tokio::test]
    async fn discarding_running_job_drops_its_record() {
        let h = harness(Arc::new(Scripted::hanging(vec![json!({"event": "step", "step": 1})])));
        let job = submit(&h, "cat").await;
        let handle = h.worker.handle();
        let jobs = h.jobs.clone();

        let worker = h.worker;
        let task = tokio::spawn(async move { worker.process_next().await });

        for _ in 0..200 {
            let current = jobs.get(job.uuid).await.unwrap().unwrap();
            if current.event == JobEvent::Generating {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(handle.request_discard(job.uuid));

        task.await.unwrap().unwrap();
        assert!(jobs.get(job.uuid).await.unwrap().is_none());
        assert!(!handle.is_busy());
        assert!(!handle.request_discard(job.uuid));
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let h = harness(Arc::new(Scripted::new(happy_events())));
        let job = submit(&h, "cat").await;
        let jobs = h.jobs.clone();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(h.worker.run(shutdown.clone()));

        for _ in 0..200 {
            if jobs.get(job.uuid).await.unwrap().unwrap().event == JobEvent::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        shutdown.cancel();
        task.await.unwrap();
        assert_eq!(jobs.get(job.uuid).await.unwrap().unwrap().event, JobEvent::Done);
    }
}
