use std::{path::PathBuf, str::FromStr, time::Duration};

use anyhow::Context;

use crate::generation::GenerationLimits;

#[derive(Debug, Clone)]
pub struct Config {
    pub redis_url: String,
    pub backend_url: String,
    pub bind_addr: String,
    pub limits: GenerationLimits,
    pub expiry: KeyExpiry,
    pub reporting: Reporting,
    pub telemetry: TelemetrySettings,
    pub worker_idle_ms: u64,
    pub stream_poll_ms: u64,
}

/// Expiry windows applied to keys in the shared store.
#[derive(Debug, Clone, Copy)]
pub struct KeyExpiry {
    /// Status and working singletons; keep low so a dead worker is noticed quickly.
    pub working_ttl_secs: u64,
    pub job_ttl_secs: u64,
    pub pending_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct Reporting {
    pub calculate_skin: bool,
    pub output_dir: PathBuf,
}

#[derive(Debug, Clone)]
pub struct TelemetrySettings {
    pub nvidia_smi_path: PathBuf,
    pub interval_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            backend_url: "http://localhost:9090/".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            limits: GenerationLimits::default(),
            expiry: KeyExpiry::default(),
            reporting: Reporting {
                calculate_skin: true,
                output_dir: PathBuf::from("outputs/img-samples"),
            },
            telemetry: TelemetrySettings {
                nvidia_smi_path: PathBuf::from("/usr/bin/nvidia-smi"),
                interval_ms: 1000,
            },
            worker_idle_ms: 100,
            stream_poll_ms: 1000,
        }
    }
}

impl Default for KeyExpiry {
    fn default() -> Self {
        Self {
            working_ttl_secs: 300,
            job_ttl_secs: 3600,
            pending_ttl_secs: 12000,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            redis_url: env_or("REDIS_URL", defaults.redis_url)?,
            backend_url: env_or("SD_URL", defaults.backend_url)?,
            bind_addr: env_or("BIND_ADDR", defaults.bind_addr)?,
            limits: GenerationLimits {
                max_steps: env_or("MAX_STEPS", defaults.limits.max_steps)?,
                max_iterations: env_or("MAX_ITERATIONS", defaults.limits.max_iterations)?,
            },
            expiry: KeyExpiry {
                working_ttl_secs: env_or("WORKING_TTL_SECS", defaults.expiry.working_ttl_secs)?,
                job_ttl_secs: env_or("JOB_TTL_SECS", defaults.expiry.job_ttl_secs)?,
                pending_ttl_secs: env_or("PENDING_TTL_SECS", defaults.expiry.pending_ttl_secs)?,
            },
            reporting: Reporting {
                calculate_skin: env_or("CALCULATE_SKIN", defaults.reporting.calculate_skin)?,
                output_dir: env_or("OUTPUT_DIR", defaults.reporting.output_dir)?,
            },
            telemetry: TelemetrySettings {
                nvidia_smi_path: env_or("NVIDIA_SMI_PATH", defaults.telemetry.nvidia_smi_path)?,
                interval_ms: env_or("TELEMETRY_INTERVAL_MS", defaults.telemetry.interval_ms)?,
            },
            worker_idle_ms: env_or("WORKER_IDLE_MS", defaults.worker_idle_ms)?,
            stream_poll_ms: env_or("STREAM_POLL_MS", defaults.stream_poll_ms)?,
        })
    }

    pub fn worker_idle(&self) -> Duration {
        Duration::from_millis(self.worker_idle_ms)
    }

    pub fn stream_poll(&self) -> Duration {
        Duration::from_millis(self.stream_poll_ms)
    }
}

impl KeyExpiry {
    pub fn working_ttl(&self) -> Duration {
        Duration::from_secs(self.working_ttl_secs)
    }

    pub fn job_ttl(&self) -> Duration {
        Duration::from_secs(self.job_ttl_secs)
    }

    pub fn pending_ttl(&self) -> Duration {
        Duration::from_secs(self.pending_ttl_secs)
    }
}

impl TelemetrySettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

fn env_or<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .with_context(|| format!("invalid value for {name}: {raw:?}")),
        _ => Ok(default),
    }
}
