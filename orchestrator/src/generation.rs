use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};

use futures::{stream::BoxStream, StreamExt};
use serde_json::{json, Map, Value};

use crate::job::round3;

const LATENCY_WINDOW: usize = 10;

pub type EventStream = BoxStream<'static, Value>;

/// Anything that can turn a parameter set into a finite stream of progress events.
pub trait Generator: Send + Sync {
    fn request(&self, params: Map<String, Value>) -> EventStream;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GenerationLimits {
    pub max_steps: i64,
    pub max_iterations: i64,
}

impl Default for GenerationLimits {
    fn default() -> Self {
        Self {
            max_steps: 85,
            max_iterations: 1,
        }
    }
}

fn default_params() -> [(&'static str, Value); 12] {
    [
        ("sampler_name", json!("k_lms")),
        ("width", json!(512)),
        ("height", json!(512)),
        ("cfg_scale", json!(7)),
        ("steps", json!(50)),
        ("iterations", json!(1)),
        ("seed", json!(-1)),
        ("strength", json!(0.75)),
        ("gfpgan_strength", json!(0.8)),
        ("upscale_level", json!(2)),
        ("upscale_strength", json!(0.75)),
        ("fit", json!("on")),
    ]
}

/// Fills defaults, clamps steps and iterations, and maps a blank seed to -1 (random).
pub fn prepare_params(mut params: Map<String, Value>, limits: &GenerationLimits) -> Map<String, Value> {
    for (key, value) in default_params() {
        params.entry(key).or_insert(value);
    }
    clamp(&mut params, "steps", limits.max_steps);
    clamp(&mut params, "iterations", limits.max_iterations);

    let blank_seed = match params.get("seed") {
        Some(Value::String(seed)) => seed.trim().is_empty(),
        Some(Value::Null) => true,
        _ => false,
    };
    if blank_seed {
        params.insert("seed".to_string(), json!(-1));
    }
    params
}

fn clamp(params: &mut Map<String, Value>, key: &str, ceiling: i64) {
    let Some(current) = params.get(key).and_then(numeric) else {
        return;
    };
    if current > ceiling {
        params.insert(key.to_string(), json!(ceiling));
    }
}

fn numeric(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<f64>().ok().map(|f| f as i64),
        _ => None,
    }
}

#[derive(Debug, Default)]
struct LatencyWindow {
    samples: VecDeque<Duration>,
    last: Option<Duration>,
}

/// Rolling record of the last ten request durations.
#[derive(Debug, Clone, Default)]
pub struct LatencyTracker {
    inner: Arc<Mutex<LatencyWindow>>,
}

impl LatencyTracker {
    pub fn record(&self, took: Duration) {
        let mut window = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        window.samples.push_back(took);
        if window.samples.len() > LATENCY_WINDOW {
            window.samples.pop_front();
        }
        window.last = Some(took);
    }

    /// Mean of the window in seconds, rounded to three decimals.
    pub fn average(&self) -> f64 {
        let window = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if window.samples.is_empty() {
            return 0.0;
        }
        let total: f64 = window.samples.iter().map(Duration::as_secs_f64).sum();
        round3(total / window.samples.len() as f64)
    }

    pub fn last(&self) -> Option<Duration> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner).last
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .samples
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct GenerationClient {
    endpoint: String,
    client: reqwest::Client,
    limits: GenerationLimits,
    latency: LatencyTracker,
}

impl GenerationClient {
    pub fn new(endpoint: &str, limits: GenerationLimits) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            client: reqwest::Client::new(),
            limits,
            latency: LatencyTracker::default(),
        }
    }

    pub fn latency(&self) -> LatencyTracker {
        self.latency.clone()
    }

    pub fn average_latency(&self) -> f64 {
        self.latency.average()
    }

    pub fn last_duration(&self) -> Option<Duration> {
        self.latency.last()
    }
}

impl Generator for GenerationClient {
    fn request(&self, params: Map<String, Value>) -> EventStream {
        let params = prepare_params(params, &self.limits);
        let phase = Phase::Connect {
            client: self.client.clone(),
            endpoint: self.endpoint.clone(),
            params,
            latency: self.latency.clone(),
        };
        futures::stream::unfold(phase, Phase::advance).boxed()
    }
}

enum Phase {
    Connect {
        client: reqwest::Client,
        endpoint: String,
        params: Map<String, Value>,
        latency: LatencyTracker,
    },
    Streaming {
        body: BoxStream<'static, reqwest::Result<Vec<u8>>>,
        lines: LineBuffer,
        started: Instant,
        latency: LatencyTracker,
    },
    Finished,
}

impl Phase {
    async fn advance(mut self) -> Option<(Value, Phase)> {
        loop {
            match self {
                Phase::Connect {
                    client,
                    endpoint,
                    params,
                    latency,
                } => {
                    let mut logged = params.clone();
                    logged.remove("initimg");
                    let logged = Value::Object(logged);
                    tracing::info!(%endpoint, params = %logged, "dispatching generation request");

                    let started = Instant::now();
                    let response = match client.post(&endpoint).json(&params).send().await {
                        Ok(response) => response,
                        Err(err) => {
                            tracing::error!(%endpoint, error = %err, "generation request failed");
                            let event = error_event(format!("Generation backend unreachable: {err}"));
                            return Some((event, Phase::Finished));
                        }
                    };

                    let status = response.status();
                    if !status.is_success() {
                        tracing::error!(%endpoint, status = status.as_u16(), "generation backend rejected request");
                        let event = error_event(format!(
                            "Generation backend returned a http-status code of {}",
                            status.as_u16()
                        ));
                        return Some((event, Phase::Finished));
                    }

                    let body = response
                        .bytes_stream()
                        .map(|chunk| chunk.map(|bytes| bytes.to_vec()))
                        .boxed();
                    self = Phase::Streaming {
                        body,
                        lines: LineBuffer::default(),
                        started,
                        latency,
                    };
                }
                Phase::Streaming {
                    mut body,
                    mut lines,
                    started,
                    latency,
                } => loop {
                    if let Some(line) = lines.next_line() {
                        let next = Phase::Streaming {
                            body,
                            lines,
                            started,
                            latency,
                        };
                        return Some((decode_line(&line), next));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => lines.push(&chunk),
                        Some(Err(err)) => {
                            tracing::error!(error = %err, "generation stream interrupted");
                            let event = error_event(format!("Generation stream interrupted: {err}"));
                            return Some((event, Phase::Finished));
                        }
                        None => {
                            let took = started.elapsed();
                            latency.record(took);
                            tracing::info!(took_secs = took.as_secs_f64(), "generation request finished");
                            return lines
                                .take_remainder()
                                .map(|line| (decode_line(&line), Phase::Finished));
                        }
                    }
                },
                Phase::Finished => return None,
            }
        }
    }
}

fn error_event(message: String) -> Value {
    json!({ "error": message })
}

fn decode_line(line: &[u8]) -> Value {
    serde_json::from_slice(line).unwrap_or_else(|err| {
        tracing::warn!(error = %err, line = %String::from_utf8_lossy(line), "malformed backend line");
        error_event(format!("Malformed line from generation backend: {err}"))
    })
}

/// Accumulates raw bytes and hands out complete newline-terminated lines.
#[derive(Debug, Default)]
struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    fn next_line(&mut self) -> Option<Vec<u8>> {
        loop {
            let newline = self.buf.iter().position(|b| *b == b'\n')?;
            let mut line: Vec<u8> = self.buf.drain(..=newline).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if !line.iter().all(u8::is_ascii_whitespace) {
                return Some(line);
            }
        }
    }

    fn take_remainder(&mut self) -> Option<Vec<u8>> {
        let rest = std::mem::take(&mut self.buf);
        if rest.iter().all(u8::is_ascii_whitespace) {
            None
        } else {
            Some(rest)
        }
    }
}
