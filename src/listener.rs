/*!
Transport setup and the accept loop.

Socket specs:
- "" uses the listening socket inherited on stdin (fd 0),
- "unix:<path>" binds a Unix socket, replacing a stale file at `path`,
- "tcp:<host:port>" binds TCP.

The accept loop polls a nonblocking listener so it can observe the running
flag; each connection is handed to the caller in blocking mode.
*/
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream};
use std::os::fd::FromRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use nix::sys::socket::{getsockname, AddressFamily, SockaddrLike, SockaddrStorage};

use crate::errors::ConfigError;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const STDIN_FD: i32 = 0;

/// Parsed `--socket` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketSpec {
    Stdin,
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for SocketSpec {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(SocketSpec::Stdin);
        }
        if let Some(path) = s.strip_prefix("unix:") {
            if path.is_empty() {
                return Err(ConfigError::InvalidSocket(s.to_string()));
            }
            return Ok(SocketSpec::Unix(PathBuf::from(path)));
        }
        if let Some(hp) = s.strip_prefix("tcp:") {
            if hp.is_empty() {
                return Err(ConfigError::InvalidSocket(s.to_string()));
            }
            return Ok(SocketSpec::Tcp(hp.to_string()));
        }
        Err(ConfigError::InvalidSocket(s.to_string()))
    }
}

impl fmt::Display for SocketSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketSpec::Stdin => write!(f, "stdin"),
            SocketSpec::Unix(p) => write!(f, "unix:{}", p.display()),
            SocketSpec::Tcp(hp) => write!(f, "tcp:{hp}"),
        }
    }
}

/// A bound listening socket.
#[derive(Debug)]
pub enum Listener {
    Unix {
        inner: UnixListener,
        /// Socket file we created and must remove at shutdown.
        path: Option<PathBuf>,
    },
    Tcp(TcpListener),
}

impl Listener {
    pub fn bind(spec: &SocketSpec) -> Result<Self, ConfigError> {
        match spec {
            SocketSpec::Stdin => {
                tracing::info!("using stdin for FastCGI socket");
                Self::from_stdin()
            }
            SocketSpec::Unix(path) => {
                match std::fs::remove_file(path) {
                    Ok(()) => tracing::debug!(path = %path.display(), "removed stale socket file"),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => tracing::warn!(path = %path.display(), error = %e, "cannot remove stale socket file"),
                }
                let inner = UnixListener::bind(path).map_err(|e| ConfigError::Bind {
                    kind: "unix",
                    addr: path.display().to_string(),
                    source: e,
                })?;
                tracing::info!(path = %path.display(), "listening on unix socket");
                Ok(Listener::Unix {
                    inner,
                    path: Some(path.clone()),
                })
            }
            SocketSpec::Tcp(hp) => {
                let inner = TcpListener::bind(hp.as_str()).map_err(|e| ConfigError::Bind {
                    kind: "tcp",
                    addr: hp.clone(),
                    source: e,
                })?;
                tracing::info!(hostport = %hp, "listening on tcp socket");
                Ok(Listener::Tcp(inner))
            }
        }
    }

    /// Adopt the listening socket passed on fd 0.
    pub fn from_stdin() -> Result<Self, ConfigError> {
        let addr: SockaddrStorage =
            getsockname(STDIN_FD).map_err(|e| ConfigError::StdinNotSocket(e.to_string()))?;
        let fd = nix::unistd::dup(STDIN_FD).map_err(|e| ConfigError::StdinNotSocket(e.to_string()))?;
        match addr.family() {
            // SAFETY: `fd` is a fresh duplicate owned by nobody else.
            Some(AddressFamily::Unix) => Ok(Listener::Unix {
                inner: unsafe { UnixListener::from_raw_fd(fd) },
                path: None,
            }),
            Some(AddressFamily::Inet) | Some(AddressFamily::Inet6) => {
                Ok(Listener::Tcp(unsafe { TcpListener::from_raw_fd(fd) }))
            }
            other => {
                let _ = nix::unistd::close(fd);
                Err(ConfigError::StdinNotSocket(format!(
                    "unsupported address family {other:?}"
                )))
            }
        }
    }

    /// Socket file to remove at shutdown, if this listener created one.
    pub fn socket_path(&self) -> Option<&Path> {
        match self {
            Listener::Unix { path, .. } => path.as_deref(),
            Listener::Tcp(_) => None,
        }
    }

    pub fn local_addr_string(&self) -> String {
        match self {
            Listener::Unix { inner, .. } => inner
                .local_addr()
                .ok()
                .and_then(|a| a.as_pathname().map(|p| format!("unix:{}", p.display())))
                .unwrap_or_else(|| "unix:(unnamed)".to_string()),
            Listener::Tcp(inner) => inner
                .local_addr()
                .map(|a| format!("tcp:{a}"))
                .unwrap_or_else(|_| "tcp:(unknown)".to_string()),
        }
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Listener::Unix { inner, .. } => inner.set_nonblocking(on),
            Listener::Tcp(inner) => inner.set_nonblocking(on),
        }
    }

    fn accept(&self) -> io::Result<Stream> {
        match self {
            Listener::Unix { inner, .. } => inner.accept().map(|(s, _)| Stream::Unix(s)),
            Listener::Tcp(inner) => inner.accept().map(|(s, _)| Stream::Tcp(s)),
        }
    }

    /// Remove the socket file, if any.
    pub fn remove_socket_file(&self) {
        if let Some(p) = self.socket_path() {
            remove_socket_file(p);
        }
    }
}

/// Remove a socket file created at startup. Missing files are fine.
pub fn remove_socket_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::debug!(path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(path = %path.display(), error = %e, "failed to remove socket file"),
    }
}

/// One accepted connection.
#[derive(Debug)]
pub enum Stream {
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Stream {
    pub fn try_clone(&self) -> io::Result<Stream> {
        match self {
            Stream::Unix(s) => s.try_clone().map(Stream::Unix),
            Stream::Tcp(s) => s.try_clone().map(Stream::Tcp),
        }
    }

    pub fn shutdown(&self, how: Shutdown) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.shutdown(how),
            Stream::Tcp(s) => s.shutdown(how),
        }
    }

    fn set_nonblocking(&self, on: bool) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.set_nonblocking(on),
            Stream::Tcp(s) => s.set_nonblocking(on),
        }
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.read(buf),
            Stream::Tcp(s) => s.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Stream::Unix(s) => s.write(buf),
            Stream::Tcp(s) => s.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Stream::Unix(s) => s.flush(),
            Stream::Tcp(s) => s.flush(),
        }
    }
}

/// Errors after which accepting can simply be retried.
fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::Interrupted | io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    ) || matches!(
        e.raw_os_error(),
        Some(libc::EMFILE) | Some(libc::ENFILE) | Some(libc::ENOBUFS) | Some(libc::ENOMEM)
    )
}

/// Accept until `running` is cleared. `Err` means the listener failed for good.
pub fn accept_loop<F>(listener: &Listener, running: &AtomicBool, mut on_conn: F) -> io::Result<()>
where
    F: FnMut(Stream),
{
    listener.set_nonblocking(true)?;
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok(stream) => {
                if let Err(e) = stream.set_nonblocking(false) {
                    tracing::warn!(error = %e, "dropping connection");
                    continue;
                }
                on_conn(stream);
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) if is_transient(&e) => {
                tracing::warn!(error = %e, "accept error; retrying");
                thread::sleep(ACCEPT_POLL);
            }
            Err(e) => {
                tracing::error!(error = %e, "accept failed");
                return Err(e);
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_socket_spec() {
        assert_eq!("".parse::<SocketSpec>().unwrap(), SocketSpec::Stdin);
        assert_eq!(
            "unix:/run/fcgiwrap.sock".parse::<SocketSpec>().unwrap(),
            SocketSpec::Unix(PathBuf::from("/run/fcgiwrap.sock"))
        );
        assert_eq!(
            "tcp:127.0.0.1:9000".parse::<SocketSpec>().unwrap(),
            SocketSpec::Tcp("127.0.0.1:9000".to_string())
        );
        for bad in ["http://x", "unix:", "tcp:", "/run/x.sock"] {
            let err = bad.parse::<SocketSpec>().unwrap_err();
            assert!(err.to_string().contains("invalid socket URL"), "{bad}: {err}");
        }
    }

    #[test]
    fn test_display_round_trips_prefix() {
        let spec = SocketSpec::Tcp("[::1]:9000".to_string());
        assert_eq!(spec.to_string(), "tcp:[::1]:9000");
    }

    #[test]
    fn test_unix_bind_replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"leftover").unwrap();
        let l = Listener::bind(&SocketSpec::Unix(path.clone())).unwrap();
        assert_eq!(l.socket_path(), Some(path.as_path()));
        l.remove_socket_file();
        assert!(!path.exists());
        // second removal is a no-op
        l.remove_socket_file();
    }

    #[test]
    fn test_accept_loop_stops_when_flag_cleared() {
        let l = Listener::bind(&SocketSpec::Tcp("127.0.0.1:0".to_string())).unwrap();
        let running = AtomicBool::new(false);
        let mut seen = 0;
        accept_loop(&l, &running, |_| seen += 1).unwrap();
        assert_eq!(seen, 0);
    }
}
