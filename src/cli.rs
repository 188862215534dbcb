use clap::Parser;

use fcgiwrap::{parse_duration, parse_idle_timeout, Config, LogFormat, ScriptPolicy, SocketSpec};

/// FastCGI to CGI bridge: runs one CGI script per FastCGI request.
#[derive(Parser, Debug, Clone)]
#[command(name = "fcgiwrap", version, about)]
pub(crate) struct Cli {
    /// Socket to listen on: '' (inherited on stdin), unix:<path> or tcp:<host:port>
    #[arg(short = 's', long, env = "FCGIWRAP_SOCKET", default_value = "")]
    pub(crate) socket: String,

    /// Exit after this long without requests (seconds or e.g. 90s, 5m); 0 disables
    #[arg(short = 't', long, env = "FCGIWRAP_TIMEOUT", default_value = "0", allow_hyphen_values = true)]
    pub(crate) timeout: String,

    /// Maximum number of concurrently running scripts; 0 or less means unbounded
    #[arg(short = 'w', long, env = "FCGIWRAP_WORKERS", default_value_t = 1, allow_negative_numbers = true)]
    pub(crate) workers: i64,

    /// Forward script stderr to the web server instead of our own stderr
    #[arg(short = 'f', long = "forward-stderr")]
    pub(crate) forward_stderr: bool,

    /// Log output format
    #[arg(long = "log-format", value_enum, env = "FCGIWRAP_LOG_FORMAT", default_value_t = LogFormat::Json)]
    pub(crate) log_format: LogFormat,

    /// How long to wait for running scripts when shutting down
    #[arg(long = "drain-grace", default_value = "30s")]
    pub(crate) drain_grace: String,

    /// Accept SCRIPT_FILENAME without DOCUMENT_ROOT (no containment check)
    #[arg(long = "allow-unrooted-script-filename")]
    pub(crate) allow_unrooted_script_filename: bool,
}

impl Cli {
    pub(crate) fn to_config(&self) -> anyhow::Result<Config> {
        Ok(Config {
            socket: self.socket.parse::<SocketSpec>()?,
            idle_timeout: parse_idle_timeout(&self.timeout)?,
            workers: self.workers,
            forward_stderr: self.forward_stderr,
            log_format: self.log_format,
            drain_grace: parse_duration(&self.drain_grace)?,
            script_policy: ScriptPolicy {
                allow_unrooted: self.allow_unrooted_script_filename,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_defaults() {
        let cli = Cli::try_parse_from(["fcgiwrap"]).unwrap();
        let cfg = cli.to_config().unwrap();
        assert_eq!(cfg.socket, SocketSpec::Stdin);
        assert_eq!(cfg.idle_timeout, None);
        assert_eq!(cfg.workers, 1);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg.drain_grace, Duration::from_secs(30));
        assert!(!cfg.script_policy.allow_unrooted);
    }

    #[test]
    fn test_flags() {
        let cli = Cli::try_parse_from([
            "fcgiwrap",
            "-s",
            "tcp:127.0.0.1:9000",
            "-t",
            "90s",
            "-w",
            "-1",
            "-f",
            "--log-format",
            "text",
        ])
        .unwrap();
        let cfg = cli.to_config().unwrap();
        assert_eq!(cfg.socket, SocketSpec::Tcp("127.0.0.1:9000".to_string()));
        assert_eq!(cfg.idle_timeout, Some(Duration::from_secs(90)));
        assert_eq!(cfg.worker_limit(), None);
        assert!(cfg.forward_stderr);
        assert_eq!(cfg.log_format, LogFormat::Text);
    }

    #[test]
    fn test_bad_socket_is_config_error() {
        let cli = Cli::try_parse_from(["fcgiwrap", "--socket", "udp:1.2.3.4:1"]).unwrap();
        let err = cli.to_config().unwrap_err();
        assert!(err.to_string().contains("invalid socket URL"));
    }
}
