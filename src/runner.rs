/*!
Process runner and stream proxy.

One `Job` per request: the script is spawned with exactly the merged
environment, then
- the request body is copied into stdin on its own thread,
- stdout is parsed (preamble) and streamed (body) on the request thread,
- stderr is either forwarded over the response's diagnostic stream or inherited,
- a watcher kills the child if the request is cancelled.

Each script leads its own process group so a kill also reaches whatever it
forked, and terminal signals aimed at the bridge do not hit it. The child is
always reaped. Kills go through `KillSwitch`, which is disarmed before the reap
so a signal can never hit a recycled pid.
*/
use std::io::{self, BufRead, BufReader, Read, Write};
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, ChildStdout, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::env::EnvironmentSet;
use crate::errors::RunError;
use crate::gateway::{respond_error, CancelToken, Completion, GatewayRequest, ResponseWriter};
use crate::response::read_preamble;
use crate::script::{ScriptDescriptor, WorkDir};

const CANCEL_POLL: Duration = Duration::from_millis(25);
const COPY_BUF: usize = 16 * 1024;
/// ETXTBSY: the script is still open for writing somewhere (typically a fork in flight).
const SPAWN_BUSY_RETRIES: usize = 10;

/// Where the script's stderr goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StderrMode {
    /// Over the response's diagnostic stream (FCGI_STDERR records), not mixed
    /// into the response body on stdout.
    Forward,
    /// To the bridge's own stderr.
    Inherit,
}

impl StderrMode {
    pub fn from_forward_flag(forward: bool) -> Self {
        if forward {
            StderrMode::Forward
        } else {
            StderrMode::Inherit
        }
    }
}

/// Sends SIGKILL to the child's process group only while the child is known not to be reaped.
#[derive(Debug)]
struct KillSwitch {
    pid: Pid,
    armed: Mutex<bool>,
}

impl KillSwitch {
    fn new(pid: u32) -> Self {
        KillSwitch {
            pid: Pid::from_raw(pid as i32),
            armed: Mutex::new(true),
        }
    }

    fn kill(&self, reason: &str) {
        let armed = self.armed.lock().unwrap_or_else(|e| e.into_inner());
        if *armed {
            tracing::debug!(pid = self.pid.as_raw(), reason, "killing CGI process");
            let _ = killpg(self.pid, Signal::SIGKILL);
        }
    }

    fn disarm(&self) {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner()) = false;
    }

    fn is_armed(&self) -> bool {
        *self.armed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// One in-flight execution.
struct Job<'a> {
    script: &'a ScriptDescriptor,
    child: Child,
    started: Instant,
    switch: Arc<KillSwitch>,
}

impl Job<'_> {
    fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Disarm kills and wait for the child.
    fn reap(mut self) -> io::Result<ExitStatus> {
        self.switch.disarm();
        let status = self.child.wait();
        tracing::debug!(
            pid = self.child.id(),
            script = %self.script.path.display(),
            elapsed_ms = self.started.elapsed().as_millis() as u64,
            "CGI process finished"
        );
        status
    }
}

fn build_command(script: &ScriptDescriptor, env: &EnvironmentSet, stderr: StderrMode) -> Command {
    let mut cmd = Command::new(&script.path);
    cmd.env_clear()
        .envs(env.iter())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .process_group(0);
    match stderr {
        StderrMode::Forward => cmd.stderr(Stdio::piped()),
        StderrMode::Inherit => cmd.stderr(Stdio::inherit()),
    };
    if let WorkDir::Path(dir) = &script.workdir {
        cmd.current_dir(dir);
    }
    cmd
}

fn spawn(cmd: &mut Command) -> io::Result<Child> {
    let mut attempts = 0usize;
    loop {
        match cmd.spawn() {
            Ok(c) => return Ok(c),
            Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) && attempts < SPAWN_BUSY_RETRIES => {
                attempts += 1;
                thread::sleep(Duration::from_millis(20));
            }
            Err(e) => return Err(e),
        }
    }
}

enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Copy until EOF, telling reader-side failures apart from writer-side ones.
fn copy_body<R: Read + ?Sized, W: Write>(src: &mut R, dst: &mut W) -> Result<u64, CopyError> {
    let mut buf = vec![0u8; COPY_BUF];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => return Ok(total),
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        dst.write_all(&buf[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
}

/// Run a validated script for one request and proxy its output into `w`.
pub fn run_script(
    script: &ScriptDescriptor,
    env: &EnvironmentSet,
    req: GatewayRequest,
    w: &mut dyn ResponseWriter,
    stderr: StderrMode,
) -> Completion {
    let GatewayRequest {
        params: _,
        mut body,
        cancel,
    } = req;

    let mut cmd = build_command(script, env, stderr);
    let mut child = match spawn(&mut cmd) {
        Ok(c) => c,
        Err(source) => {
            let err = RunError::Spawn {
                path: script.path.clone(),
                source,
            };
            tracing::error!(error = %err, "failed to start CGI");
            let _ = respond_error(w, 502, &err.to_string());
            return Completion::Rejected;
        }
    };
    let switch = Arc::new(KillSwitch::new(child.id()));
    tracing::debug!(pid = child.id(), script = %script.path.display(), "CGI process started");

    // stdin: independent of stdout so a script that writes before reading cannot deadlock us
    let input_failed = Arc::new(AtomicBool::new(false));
    if let Some(mut stdin) = child.stdin.take() {
        let switch_cl = switch.clone();
        let failed_cl = input_failed.clone();
        thread::spawn(move || {
            match copy_body(&mut *body, &mut stdin) {
                Ok(n) => tracing::trace!(bytes = n, "request body copied"),
                Err(CopyError::Read(e)) => {
                    let err = RunError::Input(e);
                    tracing::warn!(error = %err, "aborting request");
                    failed_cl.store(true, Ordering::SeqCst);
                    switch_cl.kill("request body failed");
                }
                Err(CopyError::Write(e)) => {
                    tracing::debug!(error = %e, "script stopped reading stdin");
                }
            }
            drop(stdin);
        });
    }

    let watcher = spawn_cancel_watcher(switch.clone(), cancel.clone());

    let stderr_fwd: Option<JoinHandle<()>> = match (stderr, child.stderr.take()) {
        (StderrMode::Forward, Some(mut se)) => {
            let mut sink = w.stderr_sink();
            Some(thread::spawn(move || {
                if let Err(e) = io::copy(&mut se, &mut sink) {
                    tracing::debug!(error = %e, "forwarding CGI stderr stopped");
                }
                let _ = sink.flush();
            }))
        }
        _ => None,
    };

    let mut job = Job {
        script,
        child,
        started: Instant::now(),
        switch,
    };
    let pid = job.pid();

    let outcome = match job.child.stdout.take() {
        Some(stdout) => proxy_stdout(stdout, w, &job.switch, &input_failed),
        None => Completion::Aborted,
    };

    let status = job.reap();
    let _ = watcher.join();
    if let Some(h) = stderr_fwd {
        let _ = h.join();
    }

    match status {
        Ok(st) => {
            let code = exit_code(st);
            if !st.success() {
                tracing::warn!(pid, status = %st, "CGI exited with error");
            }
            match outcome {
                Completion::Exited(_)
                    if cancel.is_cancelled() || input_failed.load(Ordering::SeqCst) =>
                {
                    Completion::Aborted
                }
                Completion::Exited(_) => Completion::Exited(code),
                other => other,
            }
        }
        Err(e) => {
            tracing::error!(pid, error = %e, "waiting for CGI process failed");
            outcome
        }
    }
}

fn spawn_cancel_watcher(switch: Arc<KillSwitch>, cancel: CancelToken) -> JoinHandle<()> {
    thread::spawn(move || {
        while switch.is_armed() {
            if cancel.is_cancelled() {
                switch.kill("request cancelled");
                return;
            }
            thread::sleep(CANCEL_POLL);
        }
    })
}

/// Parse the preamble, send the head, stream the body. Returns `Exited(0)`
/// as a placeholder on success; the caller fills in the real status.
fn proxy_stdout(
    stdout: ChildStdout,
    w: &mut dyn ResponseWriter,
    switch: &KillSwitch,
    input_failed: &AtomicBool,
) -> Completion {
    let mut reader = BufReader::with_capacity(COPY_BUF, stdout);

    let headers = match read_preamble(&mut reader) {
        Ok(h) => h,
        Err(e) => {
            switch.kill("malformed response preamble");
            if input_failed.load(Ordering::SeqCst) {
                return Completion::Aborted;
            }
            tracing::warn!(error = %e, "error reading CGI headers");
            let _ = respond_error(w, 502, "Bad Gateway");
            return Completion::Rejected;
        }
    };

    if let Err(e) = w.write_head(200, &headers) {
        tracing::warn!(error = %e, "writing response head failed");
        switch.kill("client gone");
        return Completion::Aborted;
    }

    loop {
        if input_failed.load(Ordering::SeqCst) {
            return Completion::Aborted;
        }
        let n = match reader.fill_buf() {
            Ok([]) => return Completion::Exited(0),
            Ok(chunk) => {
                if let Err(e) = w.write_body(chunk) {
                    tracing::warn!(error = %e, "error copying CGI body");
                    switch.kill("client gone");
                    return Completion::Aborted;
                }
                chunk.len()
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(error = %e, "error reading CGI body");
                switch.kill("stdout read failed");
                return Completion::Aborted;
            }
        };
        reader.consume(n);
    }
}

/// Exit code, or 128 + signal for signal deaths.
fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(1)
}
