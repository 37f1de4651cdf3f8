use std::time::Duration;

use futures::{stream::BoxStream, StreamExt};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    job::{JobEvent, JobPosition, JobRecord},
    jobs::JobStateStore,
    queue::JobQueue,
    telemetry::{gpu_summary, TelemetryCache},
    worker::WorkerHandle,
};

/// One rendered stream line and whether the stream ends after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Frame {
    pub body: Value,
    pub terminal: bool,
}

impl Frame {
    fn error(message: impl Into<String>) -> Self {
        Self {
            body: json!({ "event": "error", "message": message.into() }),
            terminal: true,
        }
    }

    fn into_line(self) -> String {
        let mut line = self.body.to_string();
        line.push('\n');
        line
    }
}

/// Relays a job's stored state to one subscriber as newline-delimited JSON,
/// re-reading it every `interval` until a terminal state shows up.
#[derive(Clone)]
pub struct StatusStreamer {
    jobs: JobStateStore,
    queue: JobQueue,
    worker: WorkerHandle,
    telemetry: TelemetryCache,
    interval: Duration,
}

struct Cursor {
    streamer: StatusStreamer,
    id: Uuid,
    ticks: u64,
    finished: bool,
}

impl StatusStreamer {
    pub fn new(
        jobs: JobStateStore,
        queue: JobQueue,
        worker: WorkerHandle,
        telemetry: TelemetryCache,
        interval: Duration,
    ) -> Self {
        Self {
            jobs,
            queue,
            worker,
            telemetry,
            interval,
        }
    }

    pub fn stream(&self, id: Uuid) -> BoxStream<'static, String> {
        let cursor = Cursor {
            streamer: self.clone(),
            id,
            ticks: 0,
            finished: false,
        };
        futures::stream::unfold(cursor, |mut cursor| async move {
            if cursor.finished {
                return None;
            }
            if cursor.ticks > 0 {
                tokio::time::sleep(cursor.streamer.interval).await;
            }
            cursor.ticks += 1;

            let frame = cursor.streamer.tick(cursor.id).await;
            cursor.finished = frame.terminal;
            Some((frame.into_line(), cursor))
        })
        .boxed()
    }

    /// Produces the frame for the job's current stored state.
    pub async fn tick(&self, id: Uuid) -> Frame {
        let job = match self.jobs.get(id).await {
            Ok(Some(job)) => job,
            Ok(None) => return Frame::error(format!("Failed to find uuid {id}")),
            Err(err) => {
                tracing::error!(job_id = %id, error = %err, "failed to read job for stream");
                return Frame::error(format!("Failed to read uuid {id}: {err}"));
            }
        };
        let position = match self.queue.position_of(id, self.worker.is_busy()).await {
            Ok(position) => position,
            Err(err) => {
                tracing::warn!(job_id = %id, error = %err, "failed to compute queue position");
                JobPosition {
                    pos: 0,
                    total: 0,
                    working: self.worker.is_busy(),
                }
            }
        };
        let gpu = gpu_summary(&self.telemetry.snapshot().await);
        render(&job, &position, gpu)
    }
}

/// Client-facing view of a stored job record.
pub fn render(job: &JobRecord, position: &JobPosition, gpu: Value) -> Frame {
    let mut body = match serde_json::to_value(job) {
        Ok(Value::Object(body)) => body,
        Ok(_) | Err(_) => return Frame::error(format!("Failed to render uuid {}", job.uuid)),
    };
    body.remove("initimg");
    body.insert("jobpos".into(), json!(position));
    body.insert("gpu".into(), gpu);

    let terminal = match &job.event {
        JobEvent::Done => {
            body.remove("raw");
            if let Some(Value::Object(result)) = body.remove("result") {
                body.extend(result);
            }
            body.insert("event".into(), json!("result"));
            true
        }
        JobEvent::Canceled | JobEvent::Error => true,
        JobEvent::Generating => {
            body.insert("event".into(), json!("step"));
            false
        }
        JobEvent::Queued | JobEvent::Upscaling(_) => false,
    };

    Frame {
        body: Value::Object(body),
        terminal,
    }
}
