//! Runtime configuration assembled from the command line.
use std::time::Duration;

use crate::errors::ConfigError;
use crate::lifecycle::DEFAULT_DRAIN_GRACE;
use crate::listener::SocketSpec;
use crate::logging::LogFormat;
use crate::script::ScriptPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub socket: SocketSpec,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
    /// Concurrent subprocess limit; ≤ 0 means unbounded.
    pub workers: i64,
    pub forward_stderr: bool,
    pub log_format: LogFormat,
    pub drain_grace: Duration,
    pub script_policy: ScriptPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            socket: SocketSpec::Stdin,
            idle_timeout: None,
            workers: 1,
            forward_stderr: false,
            log_format: LogFormat::Json,
            drain_grace: DEFAULT_DRAIN_GRACE,
            script_policy: ScriptPolicy::default(),
        }
    }
}

impl Config {
    /// Worker limit as a count, `None` when unbounded.
    pub fn worker_limit(&self) -> Option<usize> {
        usize::try_from(self.workers).ok().filter(|&w| w > 0)
    }
}

/// Parse a duration: a bare integer is seconds, anything else goes through
/// humantime ("90s", "5m", "1h 30m").
pub fn parse_duration(value: &str) -> Result<Duration, ConfigError> {
    let v = value.trim();
    if let Ok(secs) = v.parse::<i64>() {
        return Ok(Duration::from_secs(secs.max(0) as u64));
    }
    humantime::parse_duration(v).map_err(|e| ConfigError::InvalidDuration {
        value: value.to_string(),
        reason: e.to_string(),
    })
}

/// Idle timeout from its textual form; zero (or negative) disables it.
pub fn parse_idle_timeout(value: &str) -> Result<Option<Duration>, ConfigError> {
    let d = parse_duration(value)?;
    Ok(if d.is_zero() { None } else { Some(d) })
}
