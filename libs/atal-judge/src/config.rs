// Runtime configuration for the judge core
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Tunables for the runner, registry and poller.
///
/// Every field can be overridden from the environment, see [`JudgeConfig::from_env`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Parent of the per-token working directories.
    pub work_root: PathBuf,
    /// Number of concurrent executions.
    pub workers: usize,
    /// Requests allowed to wait for a worker before `submit` applies backpressure.
    pub queue_capacity: usize,
    /// Headroom for container cold start on top of the program's own limit.
    pub startup_buffer: Duration,
    /// Subtracted from the measured wall time before the limit comparison.
    /// Rough by nature: tuned to one runtime's typical start latency.
    pub container_overhead: Duration,
    /// Floor for the adjusted time so a run never reports zero.
    pub time_epsilon: Duration,
    pub compile_timeout: Duration,
    /// Max processes/threads inside a container.
    pub pids_limit: i64,
    /// CPU share of one container, in cores.
    pub cpus: f64,
    pub max_output_bytes: usize,
    /// Largest file a program may write (RLIMIT_FSIZE). Beyond it the
    /// program gets SIGXFSZ.
    pub max_file_bytes: i64,
    pub max_source_bytes: usize,
    /// Terminal records older than this are swept. Zero disables the sweep.
    pub status_ttl: Duration,
    pub sweep_interval: Duration,
    /// Kill still-running executions when a poller gives up on them.
    pub cancel_on_poll_timeout: bool,
    /// Optional JSON file overriding the built-in execution plans.
    pub languages_file: Option<PathBuf>,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("atal-judge"),
            workers: 4,
            queue_capacity: 64,
            startup_buffer: Duration::from_secs(5),
            container_overhead: Duration::from_millis(500),
            time_epsilon: Duration::from_millis(1),
            compile_timeout: Duration::from_secs(30),
            pids_limit: 64,
            cpus: 1.0,
            max_output_bytes: 10 * 1024 * 1024,
            max_file_bytes: 64 * 1024 * 1024,
            max_source_bytes: 1024 * 1024,
            status_ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            cancel_on_poll_timeout: true,
            languages_file: None,
        }
    }
}

impl JudgeConfig {
    /// Defaults, overridden by any `ATAL_*` variables that are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_millis() as u64).map_or(default, Duration::from_millis)
        };
        let secs = |key: &str, default: Duration| {
            parse_or(&lookup, key, default.as_secs()).map_or(default, Duration::from_secs)
        };

        Self {
            work_root: lookup("ATAL_WORK_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_root),
            workers: parse_or(&lookup, "ATAL_WORKERS", defaults.workers)
                .unwrap_or(defaults.workers)
                .max(1),
            queue_capacity: parse_or(&lookup, "ATAL_QUEUE_CAPACITY", defaults.queue_capacity)
                .unwrap_or(defaults.queue_capacity)
                .max(1),
            startup_buffer: millis("ATAL_STARTUP_BUFFER_MS", defaults.startup_buffer),
            container_overhead: millis("ATAL_CONTAINER_OVERHEAD_MS", defaults.container_overhead),
            time_epsilon: defaults.time_epsilon,
            compile_timeout: millis("ATAL_COMPILE_TIMEOUT_MS", defaults.compile_timeout),
            pids_limit: parse_or(&lookup, "ATAL_PIDS_LIMIT", defaults.pids_limit)
                .unwrap_or(defaults.pids_limit),
            cpus: parse_or(&lookup, "ATAL_CPUS", defaults.cpus)
                .filter(|c| c.is_finite() && *c > 0.0)
                .unwrap_or(defaults.cpus),
            max_output_bytes: parse_or(&lookup, "ATAL_MAX_OUTPUT_BYTES", defaults.max_output_bytes)
                .unwrap_or(defaults.max_output_bytes),
            max_file_bytes: parse_or(&lookup, "ATAL_MAX_FILE_BYTES", defaults.max_file_bytes)
                .filter(|b| *b > 0)
                .unwrap_or(defaults.max_file_bytes),
            max_source_bytes: defaults.max_source_bytes,
            status_ttl: secs("ATAL_STATUS_TTL_SECS", defaults.status_ttl),
            sweep_interval: secs("ATAL_SWEEP_INTERVAL_SECS", defaults.sweep_interval),
            cancel_on_poll_timeout: parse_or(
                &lookup,
                "ATAL_CANCEL_ON_POLL_TIMEOUT",
                defaults.cancel_on_poll_timeout,
            )
            .unwrap_or(defaults.cancel_on_poll_timeout),
            languages_file: lookup("ATAL_LANGUAGES_FILE").map(PathBuf::from),
        }
    }

    /// Docker's `NanoCpus` for [`JudgeConfig::cpus`].
    pub fn nano_cpus(&self) -> i64 {
        (self.cpus * 1e9) as i64
    }
}

// A malformed value is logged and replaced by the default rather than
// refusing to start.
fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> Option<T> {
    match lookup(key) {
        None => Some(default),
        Some(raw) => match raw.trim().to_lowercase().parse::<T>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!(key, value = %raw, "Ignoring malformed configuration value");
                None
            }
        },
    }
}
