//! Error types for the bridge.
//!
//! Mapping guide:
//! - ConfigError is fatal at startup (exit code 1).
//! - ScriptError rejects a single request with 403; the server keeps running.
//! - RunError::Spawn and PreambleError reject a single request with 502.
//! - RunError::Input aborts a single request; its subprocess is killed.
//!
//! Display strings are user-visible (they end up in error response bodies and
//! logs), so each validation failure carries its own distinct phrase.
use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Startup/configuration failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid socket URL '{0}' (expected '', unix:<path> or tcp:<host:port>)")]
    InvalidSocket(String),

    #[error("invalid duration '{value}': {reason}")]
    InvalidDuration { value: String, reason: String },

    #[error("listen {kind} on {addr} failed: {source}")]
    Bind {
        kind: &'static str,
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("stdin is not a listening socket: {0}")]
    StdinNotSocket(String),
}

/// Script resolution/validation failures (request rejected, nothing spawned).
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("missing document root: DOCUMENT_ROOT not defined but needs to be")]
    MissingDocumentRoot,

    #[error("missing script name: SCRIPT_NAME not defined but needs to be")]
    MissingScriptName,

    #[error("document root must be absolute: {0}")]
    RelativeDocumentRoot(PathBuf),

    #[error("script path must be absolute: {0}")]
    NotAbsolute(PathBuf),

    #[error("script path ({path}) outside document root ({root})")]
    OutsideDocumentRoot { path: PathBuf, root: PathBuf },

    #[error("script not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to lstat script {path}: {source}")]
    Inspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("symlinks unsupported: {0}")]
    Symlink(PathBuf),

    #[error("script is not a regular file: {0}")]
    NotRegularFile(PathBuf),

    #[error("script not executable: {0}")]
    NotExecutable(PathBuf),

    #[error("FCGI_CHDIR must be absolute: {0}")]
    ChdirNotAbsolute(PathBuf),

    #[error("FCGI_CHDIR stat failed for {path}: {source}")]
    ChdirInspect {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("FCGI_CHDIR is not a directory: {0}")]
    ChdirNotDirectory(PathBuf),
}

/// Failures while running a validated script.
#[derive(Debug, Error)]
pub enum RunError {
    #[error("failed to start CGI {path}: {source}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("reading request body failed: {0}")]
    Input(#[source] io::Error),
}

/// The script's response preamble could not be read.
#[derive(Debug, Error)]
pub enum PreambleError {
    #[error("CGI output ended before the end of the header block")]
    Truncated,

    #[error("CGI header line is not valid UTF-8: {0}")]
    InvalidHeader(String),

    #[error("error reading CGI headers: {0}")]
    Io(#[from] io::Error),
}
