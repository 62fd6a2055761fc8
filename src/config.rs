//! Configuration types.

use std::time::Duration;

use crate::error::ConfigError;
use crate::threads::HistoryPolicy;

/// Runtime configuration for the job core and its HTTP surface.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Port the HTTP server binds to.
    pub port: u16,
    /// Jobs running longer than this are failed with a timeout error (None = unbounded).
    pub execution_timeout: Option<Duration>,
    /// Terminal jobs older than this are evicted.
    pub job_ttl: Duration,
    /// How often the eviction sweep runs.
    pub eviction_interval: Duration,
    /// Per-job stream buffer; subscribers further behind than this are dropped.
    pub stream_capacity: usize,
    /// History bound applied before each chat turn.
    pub history_policy: HistoryPolicy,
    /// Maximum number of non-terminal jobs (0 = unlimited).
    pub max_active_jobs: usize,
    /// Delay between tokens emitted by the built-in echo pipeline.
    pub echo_token_delay: Duration,
    /// System message seeded into new and reset threads.
    pub system_prompt: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            port: 8080,
            execution_timeout: None,
            job_ttl: Duration::from_secs(3600), // 1 hour
            eviction_interval: Duration::from_secs(60),
            stream_capacity: 256,
            history_policy: HistoryPolicy::MaxTokens(49_500),
            max_active_jobs: 0,
            echo_token_delay: Duration::from_millis(25),
            system_prompt: None,
        }
    }
}

impl RuntimeConfig {
    /// Build config from `CREW_RUNNER_*` environment variables, falling back
    /// to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build config from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let port = parse_or(&lookup, "CREW_RUNNER_PORT", defaults.port)?;

        let execution_timeout = parse_opt::<u64, _>(&lookup, "CREW_RUNNER_EXECUTION_TIMEOUT_SECS")?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let job_ttl = Duration::from_secs(parse_or(
            &lookup,
            "CREW_RUNNER_JOB_TTL_SECS",
            defaults.job_ttl.as_secs(),
        )?);

        let eviction_interval = Duration::from_secs(parse_or(
            &lookup,
            "CREW_RUNNER_EVICTION_INTERVAL_SECS",
            defaults.eviction_interval.as_secs(),
        )?);
        if eviction_interval.is_zero() {
            return Err(invalid("CREW_RUNNER_EVICTION_INTERVAL_SECS", "must be positive"));
        }

        let stream_capacity = parse_or(
            &lookup,
            "CREW_RUNNER_STREAM_CAPACITY",
            defaults.stream_capacity,
        )?;
        if stream_capacity == 0 {
            return Err(invalid("CREW_RUNNER_STREAM_CAPACITY", "must be positive"));
        }

        let max_messages = parse_opt::<usize, _>(&lookup, "CREW_RUNNER_HISTORY_MAX_MESSAGES")?;
        let max_tokens = parse_opt::<usize, _>(&lookup, "CREW_RUNNER_HISTORY_MAX_TOKENS")?;
        let history_policy = match (max_messages, max_tokens) {
            (Some(_), Some(_)) => {
                return Err(ConfigError::Conflict(
                    "set only one of CREW_RUNNER_HISTORY_MAX_MESSAGES and CREW_RUNNER_HISTORY_MAX_TOKENS"
                        .to_string(),
                ));
            }
            (Some(n), None) => HistoryPolicy::MaxMessages(n),
            (None, Some(t)) => HistoryPolicy::MaxTokens(t),
            (None, None) => defaults.history_policy,
        };

        let max_active_jobs = parse_or(
            &lookup,
            "CREW_RUNNER_MAX_ACTIVE_JOBS",
            defaults.max_active_jobs,
        )?;

        let echo_token_delay = Duration::from_millis(parse_or(
            &lookup,
            "CREW_RUNNER_ECHO_DELAY_MS",
            defaults.echo_token_delay.as_millis() as u64,
        )?);

        let system_prompt = lookup("CREW_RUNNER_SYSTEM_PROMPT")
            .map(|prompt| prompt.trim().to_string())
            .filter(|prompt| !prompt.is_empty());

        Ok(Self {
            port,
            execution_timeout,
            job_ttl,
            eviction_interval,
            stream_capacity,
            history_policy,
            max_active_jobs,
            echo_token_delay,
            system_prompt,
        })
    }
}

fn invalid(key: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.to_string(),
        message: message.into(),
    }
}

fn parse_opt<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| invalid(key, e.to_string())),
        _ => Ok(None),
    }
}

fn parse_or<T, F>(lookup: &F, key: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}
