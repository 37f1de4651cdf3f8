use std::{
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
    time::Duration,
};

use anyhow::{anyhow, bail, Context};
use quick_xml::{events::Event, Reader};
use serde_json::{json, Map, Value};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Latest GPU snapshot. Holds `null` until the first poll completes, the parsed
/// report afterwards, or an error string when collection failed.
#[derive(Debug, Clone, Default)]
pub struct TelemetryCache {
    inner: Arc<RwLock<Value>>,
}

impl TelemetryCache {
    pub async fn snapshot(&self) -> Value {
        self.inner.read().await.clone()
    }

    async fn store(&self, snapshot: Value) {
        *self.inner.write().await = snapshot;
    }
}

pub struct TelemetryPoller {
    command: PathBuf,
    interval: Duration,
    cache: TelemetryCache,
}

impl TelemetryPoller {
    pub fn new(command: PathBuf, interval: Duration) -> Self {
        Self {
            command,
            interval,
            cache: TelemetryCache::default(),
        }
    }

    pub fn cache(&self) -> TelemetryCache {
        self.cache.clone()
    }

    pub async fn poll_once(&self) {
        let command = self.command.clone();
        let snapshot = tokio::task::spawn_blocking(move || collect(&command))
            .await
            .unwrap_or_else(|err| failure(anyhow!("collector task aborted: {err}")));
        self.cache.store(snapshot).await;
    }

    pub async fn run(self, shutdown: CancellationToken) {
        tracing::info!(command = %self.command.display(), "starting gpu telemetry task");
        loop {
            self.poll_once().await;
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        tracing::info!("gpu telemetry task stopped");
    }
}

fn collect(command: &Path) -> Value {
    match run_command(command) {
        Ok(report) => report,
        Err(err) => failure(err),
    }
}

fn run_command(command: &Path) -> anyhow::Result<Value> {
    let output = Command::new(command)
        .args(["-x", "-q"])
        .output()
        .with_context(|| format!("spawn {}", command.display()))?;
    if !output.status.success() {
        bail!(
            "{} exited with {}: {}",
            command.display(),
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    xml_to_json(&String::from_utf8_lossy(&output.stdout))
}

fn failure(err: anyhow::Error) -> Value {
    tracing::error!(error = %err, "failed to execute nvidia-smi");
    Value::String(format!("Executing nvidia-smi failed: {err}"))
}

#[derive(Default)]
struct Node {
    fields: Map<String, Value>,
    text: String,
}

impl Node {
    fn insert(&mut self, name: String, value: Value) {
        match self.fields.get_mut(&name) {
            Some(Value::Array(items)) => items.push(value),
            Some(existing) => {
                let first = existing.take();
                *existing = Value::Array(vec![first, value]);
            }
            None => {
                self.fields.insert(name, value);
            }
        }
    }

    fn into_value(mut self) -> Value {
        if self.fields.is_empty() {
            return if self.text.is_empty() {
                Value::Null
            } else {
                Value::String(self.text)
            };
        }
        if !self.text.is_empty() {
            self.fields.insert("#text".to_string(), Value::String(self.text));
        }
        Value::Object(self.fields)
    }
}

fn open_node(start: &quick_xml::events::BytesStart<'_>) -> anyhow::Result<(String, Node)> {
    let name = String::from_utf8_lossy(start.name().as_ref()).into_owned();
    let mut node = Node::default();
    for attr in start.attributes() {
        let attr = attr?;
        let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
        node.fields
            .insert(key, Value::String(attr.unescape_value()?.into_owned()));
    }
    Ok((name, node))
}

/// Converts an XML document into nested JSON objects. Text-only elements become
/// strings, repeated siblings become arrays and attributes are keyed `@name`.
pub fn xml_to_json(xml: &str) -> anyhow::Result<Value> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut stack: Vec<(String, Node)> = vec![(String::new(), Node::default())];
    loop {
        match reader.read_event()? {
            Event::Start(start) => stack.push(open_node(&start)?),
            Event::Empty(start) => {
                let (name, node) = open_node(&start)?;
                let parent = stack.last_mut().context("element outside document")?;
                parent.1.insert(name, node.into_value());
            }
            Event::Text(text) => {
                if let Some((_, node)) = stack.last_mut() {
                    node.text.push_str(&text.unescape()?);
                }
            }
            Event::CData(data) => {
                if let Some((_, node)) = stack.last_mut() {
                    node.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                }
            }
            Event::End(_) => {
                let (name, node) = stack.pop().context("unbalanced closing tag")?;
                let parent = stack.last_mut().context("unbalanced closing tag")?;
                parent.1.insert(name, node.into_value());
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let (_, root) = stack.pop().context("empty document")?;
    if !stack.is_empty() {
        bail!("unclosed element in document");
    }
    Ok(root.into_value())
}

/// Compact GPU view attached to streamed job updates.
pub fn gpu_summary(snapshot: &Value) -> Value {
    let gpu = match snapshot.pointer("/nvidia_smi_log/gpu") {
        Some(Value::Array(gpus)) => gpus.first().cloned().unwrap_or(Value::Null),
        Some(gpu) => gpu.clone(),
        None => Value::Null,
    };
    let field = |path: &str| gpu.pointer(path).cloned().unwrap_or(Value::Null);
    json!({
        "temp": field("/temperature/gpu_temp"),
        "power": field("/power_readings/power_draw"),
        "util": field("/utilization/gpu_util"),
        "pci": {
            "tx_util": field("/pci/tx_util"),
            "rx_util": field("/pci/rx_util"),
        }
    })
}
