use std::{
    fmt,
    path::{Path, PathBuf},
};

use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Keys owned by the job record itself; never forwarded to the backend.
pub const RESERVED_KEYS: [&str; 8] = [
    "uuid",
    "initiator",
    "event",
    "timestamp",
    "step",
    "raw",
    "result",
    "message",
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobEvent {
    Queued,
    Generating,
    /// Any `upscaling*` sub-state reported by the backend, kept verbatim.
    Upscaling(String),
    Done,
    Canceled,
    Error,
}

impl JobEvent {
    pub fn as_str(&self) -> &str {
        match self {
            JobEvent::Queued => "queued",
            JobEvent::Generating => "generating",
            JobEvent::Upscaling(stage) => stage,
            JobEvent::Done => "done",
            JobEvent::Canceled => "canceled",
            JobEvent::Error => "error",
        }
    }

    pub fn parse(value: &str) -> anyhow::Result<Self> {
        match value {
            "queued" => Ok(JobEvent::Queued),
            "generating" => Ok(JobEvent::Generating),
            "done" => Ok(JobEvent::Done),
            "canceled" => Ok(JobEvent::Canceled),
            "error" => Ok(JobEvent::Error),
            stage if stage.starts_with("upscaling") => Ok(JobEvent::Upscaling(stage.to_string())),
            other => Err(anyhow!("unknown job event: {other}")),
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobEvent::Done | JobEvent::Canceled | JobEvent::Error)
    }

    pub fn can_transition_to(&self, next: &JobEvent) -> bool {
        if self.is_terminal() {
            return false;
        }
        !matches!(next, JobEvent::Queued)
    }
}

impl fmt::Display for JobEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for JobEvent {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for JobEvent {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        JobEvent::parse(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Api,
    Web,
}

#[derive(Debug, thiserror::Error)]
#[error("job {id} cannot move from {from} to {to}")]
pub struct InvalidTransition {
    pub id: Uuid,
    pub from: JobEvent,
    pub to: JobEvent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub uuid: Uuid,
    pub initiator: Initiator,
    pub event: JobEvent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<i64>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Generation parameters as submitted; passed through untouched apart from clamping.
    #[serde(flatten)]
    pub params: Map<String, Value>,
}

impl JobRecord {
    pub fn new(mut params: Map<String, Value>, initiator: Initiator) -> Self {
        for key in RESERVED_KEYS {
            params.remove(key);
        }
        Self {
            uuid: Uuid::new_v4(),
            initiator,
            event: JobEvent::Queued,
            step: None,
            timestamp: Utc::now(),
            raw: None,
            result: None,
            message: None,
            params,
        }
    }

    pub fn prompt(&self) -> Option<&str> {
        self.params.get("prompt").and_then(Value::as_str)
    }

    pub fn generation_params(&self) -> Map<String, Value> {
        self.params.clone()
    }

    pub fn transition(&mut self, next: JobEvent) -> Result<(), InvalidTransition> {
        if !self.event.can_transition_to(&next) {
            return Err(InvalidTransition {
                id: self.uuid,
                from: self.event.clone(),
                to: next,
            });
        }
        self.event = next;
        Ok(())
    }

    /// Folds one backend progress event into the record's state.
    pub fn apply_progress(&mut self, event: &Value) -> Result<(), InvalidTransition> {
        match event_kind(event) {
            Some("step") => {
                self.transition(JobEvent::Generating)?;
                self.step = event.get("step").and_then(Value::as_i64);
            }
            Some(stage) if stage.starts_with("upscaling") => {
                self.transition(JobEvent::Upscaling(stage.to_string()))?;
                self.step = Some(0);
            }
            _ => {}
        }
        if let Some(message) = event.get("error").and_then(Value::as_str) {
            self.message = Some(message.to_string());
        }
        Ok(())
    }

    /// Location of the finished image inside `output_dir`, derived from the result url.
    pub fn image_file(&self, output_dir: &Path) -> Option<PathBuf> {
        let url = self.result.as_ref()?.get("url")?.as_str()?;
        let name = Path::new(url).file_name()?;
        Some(output_dir.join(name))
    }
}

pub fn event_kind(event: &Value) -> Option<&str> {
    event.get("event").and_then(Value::as_str)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPosition {
    pub pos: usize,
    pub total: usize,
    pub working: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatsRecord {
    pub skin: f64,
    pub charlen: usize,
    pub processtime: f64,
    pub queuesize: usize,
}

pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
