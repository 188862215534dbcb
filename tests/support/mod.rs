/*!
Test support helpers shared across integration tests.

- write_script(dir, name, body): executable shell script
- FcgiClient: minimal blocking FastCGI client (one request at a time)
- RecordingWriter: in-memory ResponseWriter
- start_server(config, inner): server on a background thread
*/
#![allow(dead_code)]

use std::io::{self, Read, Write};
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use fcgiwrap::fcgi::record::{
    encode_pair, read_record, write_record, write_stream, BeginRequest, RecordType, ROLE_RESPONDER,
};
use fcgiwrap::{
    CgiResponder, Config, Handler, InheritedEnv, ResponseHeaders, ResponseWriter, ScriptPolicy,
    Server, ShutdownHandle, ShutdownReason, SocketSpec, StderrMode,
};

/// Write an executable `#!/bin/sh` script.
pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).expect("chmod script");
    path
}

/// Environment for scripts started in tests: enough PATH for coreutils.
pub fn test_env(extra: &[(&str, &str)]) -> InheritedEnv {
    let mut vars = vec![("PATH".to_string(), "/usr/local/bin:/usr/bin:/bin".to_string())];
    vars.extend(extra.iter().map(|(k, v)| (k.to_string(), v.to_string())));
    InheritedEnv::from_vars(vars)
}

pub fn responder(extra_env: &[(&str, &str)], forward_stderr: bool) -> Arc<dyn Handler> {
    Arc::new(CgiResponder::new(
        test_env(extra_env),
        ScriptPolicy::default(),
        StderrMode::from_forward_flag(forward_stderr),
    ))
}

/// Unix-socket config inside `dir`.
pub fn unix_config(dir: &Path) -> Config {
    Config {
        socket: SocketSpec::Unix(dir.join("fcgi.sock")),
        ..Config::default()
    }
}

pub struct RunningServer {
    pub socket: PathBuf,
    pub handle: ShutdownHandle,
    pub thread: JoinHandle<ShutdownReason>,
}

impl RunningServer {
    pub fn client(&self) -> FcgiClient {
        FcgiClient::connect(&self.socket)
    }

    pub fn stop(self) -> ShutdownReason {
        self.handle.shutdown();
        self.thread.join().expect("server thread")
    }
}

/// Bind and serve on a background thread. `config.socket` must be a unix socket.
pub fn start_server(config: Config, inner: Arc<dyn Handler>) -> RunningServer {
    let socket = match &config.socket {
        SocketSpec::Unix(p) => p.clone(),
        other => panic!("test servers listen on unix sockets, got {other}"),
    };
    let server = Server::bind_with(config, inner).expect("bind server");
    let handle = server.shutdown_handle();
    let thread = thread::spawn(move || server.serve().expect("serve"));
    RunningServer {
        socket,
        handle,
        thread,
    }
}

/// Decoded response of one FastCGI request.
#[derive(Debug, Default)]
pub struct FcgiResponse {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub app_status: u32,
    pub protocol_status: u8,
}

impl FcgiResponse {
    /// Header block and body split at the first blank line.
    pub fn split(&self) -> (String, Vec<u8>) {
        let pos = self
            .stdout
            .windows(4)
            .position(|w| w == b"\r\n\r\n")
            .expect("header terminator in response");
        (
            String::from_utf8_lossy(&self.stdout[..pos + 2]).into_owned(),
            self.stdout[pos + 4..].to_vec(),
        )
    }

    pub fn header(&self, name: &str) -> Option<String> {
        let (head, _) = self.split();
        head.lines().find_map(|l| {
            let (k, v) = l.split_once(':')?;
            k.trim()
                .eq_ignore_ascii_case(name)
                .then(|| v.trim().to_string())
        })
    }

    pub fn status(&self) -> u16 {
        self.header("Status")
            .and_then(|s| s.split_whitespace().next().map(str::to_string))
            .and_then(|s| s.parse().ok())
            .unwrap_or(200)
    }

    pub fn body_string(&self) -> String {
        String::from_utf8_lossy(&self.split().1).into_owned()
    }
}

pub struct FcgiClient {
    stream: UnixStream,
}

impl FcgiClient {
    pub fn connect(path: &Path) -> Self {
        let stream = UnixStream::connect(path).expect("connect to fcgi socket");
        stream
            .set_read_timeout(Some(Duration::from_secs(20)))
            .expect("read timeout");
        FcgiClient { stream }
    }

    pub fn begin(&mut self, id: u16, role: u16, keep_conn: bool) -> io::Result<()> {
        let body = BeginRequest { role, keep_conn }.encode();
        write_record(&mut self.stream, RecordType::BeginRequest, id, &body)
    }

    pub fn send_params(&mut self, id: u16, params: &[(&str, &str)]) -> io::Result<()> {
        let mut buf = Vec::new();
        for (k, v) in params {
            encode_pair(&mut buf, k.as_bytes(), v.as_bytes());
        }
        write_stream(&mut self.stream, RecordType::Params, id, &buf)?;
        write_record(&mut self.stream, RecordType::Params, id, &[])
    }

    pub fn send_stdin(&mut self, id: u16, body: &[u8]) -> io::Result<()> {
        write_stream(&mut self.stream, RecordType::Stdin, id, body)
    }

    pub fn end_stdin(&mut self, id: u16) -> io::Result<()> {
        write_record(&mut self.stream, RecordType::Stdin, id, &[])
    }

    pub fn abort(&mut self, id: u16) -> io::Result<()> {
        write_record(&mut self.stream, RecordType::AbortRequest, id, &[])
    }

    pub fn raw(&mut self) -> &mut UnixStream {
        &mut self.stream
    }

    /// Collect records for `id` until its END_REQUEST.
    pub fn read_response(&mut self, id: u16) -> io::Result<FcgiResponse> {
        let mut resp = FcgiResponse::default();
        loop {
            let rec = read_record(&mut self.stream)?.ok_or_else(|| {
                io::Error::new(io::ErrorKind::UnexpectedEof, "connection closed before END_REQUEST")
            })?;
            if rec.request_id != id {
                continue;
            }
            match rec.kind {
                RecordType::Stdout => resp.stdout.extend_from_slice(&rec.content),
                RecordType::Stderr => resp.stderr.extend_from_slice(&rec.content),
                RecordType::EndRequest => {
                    let c = &rec.content;
                    resp.app_status = u32::from_be_bytes([c[0], c[1], c[2], c[3]]);
                    resp.protocol_status = c[4];
                    return Ok(resp);
                }
                _ => {}
            }
        }
    }

    /// Full responder request: BEGIN, PARAMS, STDIN, then wait for the response.
    pub fn request(&mut self, id: u16, params: &[(&str, &str)], body: &[u8]) -> FcgiResponse {
        self.begin(id, ROLE_RESPONDER, true).expect("begin");
        self.send_params(id, params).expect("params");
        self.send_stdin(id, body).expect("stdin");
        self.end_stdin(id).expect("end stdin");
        self.read_response(id).expect("response")
    }
}

/// Params for a script under `root`.
pub fn cgi_params<'a>(root: &'a str, script_name: &'a str) -> Vec<(&'a str, &'a str)> {
    vec![
        ("GATEWAY_INTERFACE", "CGI/1.1"),
        ("REQUEST_METHOD", "GET"),
        ("DOCUMENT_ROOT", root),
        ("SCRIPT_NAME", script_name),
        ("QUERY_STRING", "a=1"),
    ]
}

/// In-memory response writer.
#[derive(Default)]
pub struct RecordingWriter {
    pub status: Option<u16>,
    pub headers: ResponseHeaders,
    pub body: Vec<u8>,
    pub stderr: Arc<Mutex<Vec<u8>>>,
}

impl ResponseWriter for RecordingWriter {
    fn write_head(&mut self, status: u16, headers: &ResponseHeaders) -> io::Result<()> {
        self.status = Some(status);
        self.headers = headers.clone();
        Ok(())
    }

    fn write_body(&mut self, buf: &[u8]) -> io::Result<()> {
        self.body.extend_from_slice(buf);
        Ok(())
    }

    fn stderr_sink(&self) -> Box<dyn Write + Send> {
        Box::new(SharedSink(self.stderr.clone()))
    }
}

struct SharedSink(Arc<Mutex<Vec<u8>>>);

impl Write for SharedSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// Poll `cond` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Read everything currently readable until EOF (used for close detection).
pub fn read_to_eof(stream: &mut UnixStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    stream.read_to_end(&mut out)?;
    Ok(out)
}
