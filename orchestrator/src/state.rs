use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use futures::stream::BoxStream;
use serde::Serialize;
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    config::Config,
    generation::LatencyTracker,
    job::{Initiator, JobEvent, JobPosition, JobRecord, StatsRecord},
    jobs::JobStateStore,
    queue::{JobQueue, QueueEntry},
    store::Store,
    streamer::StatusStreamer,
    telemetry::TelemetryCache,
    worker::WorkerHandle,
};

#[derive(Debug, Serialize)]
pub struct SubmitJobResponse {
    pub status: &'static str,
    pub uuid: Uuid,
    pub job: Value,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub status: CancelStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CancelStatus {
    CancellationRequested,
    Removed,
    AlreadyCompleted,
    NotFound,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: Option<Value>,
    pub working: Option<Uuid>,
    pub nvidia: Value,
    pub queuesize: usize,
    pub avg_response_time: f64,
}

#[derive(Clone)]
pub struct AppState {
    inner: Arc<StateInner>,
}

struct StateInner {
    jobs: JobStateStore,
    queue: JobQueue,
    worker: WorkerHandle,
    latency: LatencyTracker,
    telemetry: TelemetryCache,
    streamer: StatusStreamer,
    output_dir: PathBuf,
}

impl AppState {
    pub fn new(
        cfg: &Config,
        store: Store,
        worker: WorkerHandle,
        latency: LatencyTracker,
        telemetry: TelemetryCache,
    ) -> Self {
        let jobs = JobStateStore::new(store.clone(), cfg.expiry);
        let queue = JobQueue::new(store);
        let streamer = StatusStreamer::new(
            jobs.clone(),
            queue.clone(),
            worker.clone(),
            telemetry.clone(),
            cfg.stream_poll(),
        );
        Self {
            inner: Arc::new(StateInner {
                jobs,
                queue,
                worker,
                latency,
                telemetry,
                streamer,
                output_dir: cfg.reporting.output_dir.clone(),
            }),
        }
    }

    pub async fn create_job(
        &self,
        mut params: Map<String, Value>,
        initiator: Initiator,
    ) -> anyhow::Result<SubmitJobResponse> {
        if initiator == Initiator::Web {
            params.remove("initimg_name");
            for field in ["fit", "progress_images"] {
                if let Some(value) = params.get_mut(field) {
                    *value = Value::Bool(value.as_str() == Some("on"));
                }
            }
        }

        let job = JobRecord::new(params, initiator);
        self.inner.jobs.create(&job).await.context("store new job")?;
        self.inner.queue.enqueue(&job).await.context("enqueue new job")?;
        tracing::info!(job_id = %job.uuid, initiator = ?initiator, "job queued");

        let position = self.position_of(job.uuid).await?;
        let mut body = serde_json::to_value(&job)?;
        body["queuepos"] = json!(position);
        Ok(SubmitJobResponse {
            status: "OK",
            uuid: job.uuid,
            job: body,
        })
    }

    /// Stored record, with its queue position attached while it is still pending.
    pub async fn job_details(&self, id: Uuid) -> anyhow::Result<Option<Value>> {
        let Some(job) = self.inner.jobs.get(id).await? else {
            return Ok(None);
        };
        let mut body = serde_json::to_value(&job)?;
        if job.event == JobEvent::Queued {
            body["queue"] = json!(self.position_of(id).await?);
        }
        Ok(Some(body))
    }

    pub async fn cancel_job(&self, id: Uuid) -> anyhow::Result<CancelStatus> {
        let Some(mut job) = self.inner.jobs.get(id).await? else {
            return Ok(CancelStatus::NotFound);
        };
        if job.event.is_terminal() {
            return Ok(CancelStatus::AlreadyCompleted);
        }
        if self.inner.worker.request_cancel(id) {
            tracing::info!(job_id = %id, "cancellation requested for running job");
            return Ok(CancelStatus::CancellationRequested);
        }

        let removed = self.inner.queue.remove(id).await?;
        job.transition(JobEvent::Canceled)?;
        self.inner.jobs.put(&job).await?;
        // The worker may have taken the job between the two checks.
        if removed == 0 && self.inner.worker.request_cancel(id) {
            tracing::info!(job_id = %id, "job started before it could be dequeued, cancellation requested");
            return Ok(CancelStatus::CancellationRequested);
        }
        tracing::info!(job_id = %id, removed, "pending job canceled");
        Ok(CancelStatus::Removed)
    }

    /// Drops the job's record and queue entries. A running job is stopped and its
    /// record is not written back.
    pub async fn delete_job(&self, id: Uuid) -> anyhow::Result<()> {
        let running = self.inner.worker.request_discard(id);
        let removed = self.inner.queue.remove(id).await?;
        self.inner.jobs.delete(id).await?;
        let running = running || self.inner.worker.request_discard(id);
        tracing::info!(job_id = %id, removed, running, "job deleted");
        Ok(())
    }

    pub async fn list_queue(&self) -> anyhow::Result<Vec<QueueEntry>> {
        Ok(self.inner.queue.list().await?)
    }

    pub async fn status(&self) -> anyhow::Result<StatusResponse> {
        Ok(StatusResponse {
            status: self.inner.jobs.status().await?,
            working: self.inner.jobs.working().await?,
            nvidia: self.inner.telemetry.snapshot().await,
            queuesize: self.inner.queue.len().await?,
            avg_response_time: self.inner.latency.average(),
        })
    }

    pub async fn gpu(&self) -> Value {
        self.inner.telemetry.snapshot().await
    }

    /// Influx line protocol for the last finished job; each stats record is reported once.
    pub async fn telegraf_line(&self) -> anyhow::Result<String> {
        let line = match self.inner.jobs.take_stats().await? {
            Some(StatsRecord {
                skin,
                charlen,
                processtime,
                ..
            }) => {
                let queuesize = self.inner.queue.len().await?;
                format!(
                    "dreaming skin={skin:?},charlen={charlen},processtime={processtime:?},queuesize={queuesize}"
                )
            }
            None => "dreaming skin=0.0,charlen=0,processtime=0,queuesize=0".to_string(),
        };
        Ok(line)
    }

    pub fn stream(&self, id: Uuid) -> BoxStream<'static, String> {
        self.inner.streamer.stream(id)
    }

    /// Path of the finished image for `id`, if the job is done and the file exists.
    pub async fn image_path(&self, id: Uuid) -> anyhow::Result<Option<PathBuf>> {
        let Some(job) = self.inner.jobs.get(id).await? else {
            return Ok(None);
        };
        let Some(path) = job.image_file(&self.inner.output_dir) else {
            return Ok(None);
        };
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(path)),
            Ok(false) => Ok(None),
            Err(err) => Err(err).with_context(|| format!("check {}", path.display())),
        }
    }

    async fn position_of(&self, id: Uuid) -> anyhow::Result<JobPosition> {
        Ok(self
            .inner
            .queue
            .position_of(id, self.inner.worker.is_busy())
            .await?)
    }
}
