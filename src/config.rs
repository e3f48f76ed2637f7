use std::str::FromStr;
use std::time::Duration;

/// Runtime configuration, read from the environment with per-field
/// defaults. Invalid values log a warning and fall back to the default.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// HTTP listen port (`PORT`).
    pub port: u16,
    /// Number of workers in the pool (`WORKER_POOL_SIZE`).
    pub worker_pool_size: usize,
    /// Hard cap on jobs held in the store (`QUEUE_MAX_SIZE`).
    pub queue_max_size: usize,
    /// Default attempt limit for new jobs (`MAX_JOB_ATTEMPTS`).
    pub max_job_attempts: u32,
    /// Base of the exponential backoff (`RETRY_BACKOFF_BASE_MS`).
    pub retry_backoff_base: Duration,
    /// Additive backoff jitter fraction, at most 0.1
    /// (`RETRY_BACKOFF_JITTER`). Zero keeps delays exact.
    pub retry_jitter: f64,
    /// Scheduler poll interval (`POLL_INTERVAL_MS`).
    pub poll_interval: Duration,
    /// Health summary log interval (`HEALTH_REPORT_INTERVAL_SECS`).
    pub health_report_interval: Duration,
    /// Global graceful-shutdown deadline (`SHUTDOWN_TIMEOUT_SECS`).
    pub shutdown_timeout: Duration,
    /// How long a worker may take to signal readiness
    /// (`WORKER_READY_TIMEOUT_SECS`).
    pub worker_ready_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            worker_pool_size: 4,
            queue_max_size: 10_000,
            max_job_attempts: 3,
            retry_backoff_base: Duration::from_millis(1000),
            retry_jitter: 0.0,
            poll_interval: Duration::from_millis(1000),
            health_report_interval: Duration::from_secs(60),
            shutdown_timeout: Duration::from_secs(30),
            worker_ready_timeout: Duration::from_secs(5),
        }
    }
}

impl ServiceConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            port: env_parse("PORT", defaults.port),
            worker_pool_size: env_parse("WORKER_POOL_SIZE", defaults.worker_pool_size).max(1),
            queue_max_size: env_parse("QUEUE_MAX_SIZE", defaults.queue_max_size).max(1),
            max_job_attempts: env_parse("MAX_JOB_ATTEMPTS", defaults.max_job_attempts).max(1),
            retry_backoff_base: Duration::from_millis(env_parse(
                "RETRY_BACKOFF_BASE_MS",
                defaults.retry_backoff_base.as_millis() as u64,
            )),
            retry_jitter: env_parse("RETRY_BACKOFF_JITTER", defaults.retry_jitter)
                .clamp(0.0, 0.1),
            poll_interval: Duration::from_millis(env_parse(
                "POLL_INTERVAL_MS",
                defaults.poll_interval.as_millis() as u64,
            )),
            health_report_interval: Duration::from_secs(env_parse(
                "HEALTH_REPORT_INTERVAL_SECS",
                defaults.health_report_interval.as_secs(),
            )),
            shutdown_timeout: Duration::from_secs(env_parse(
                "SHUTDOWN_TIMEOUT_SECS",
                defaults.shutdown_timeout.as_secs(),
            )),
            worker_ready_timeout: Duration::from_secs(env_parse(
                "WORKER_READY_TIMEOUT_SECS",
                defaults.worker_ready_timeout.as_secs(),
            )),
        }
    }
}

fn env_parse<T: FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => match raw.parse() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!(var = name, value = %raw, "Invalid value, using default");
                default
            }
        },
        Err(_) => default,
    }
}
