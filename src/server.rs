/*!
Wires listener, FastCGI transport, admission control and lifecycle together.

`Server::serve` blocks through the whole lifecycle:
Running (accepting) -> Draining (accept loop stopped, bounded wait for jobs)
-> Terminated (socket file removed). It returns why Running ended; exiting the
process is left to the caller.
*/
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::thread;

use anyhow::anyhow;

use crate::admission::{ActiveJobs, AdmissionState, Dispatcher};
use crate::config::Config;
use crate::env::InheritedEnv;
use crate::errors::ConfigError;
use crate::fcgi::FcgiService;
use crate::gateway::Handler;
use crate::lifecycle::{IdleTimer, Lifecycle, LifecycleEvent, LifecycleState, ShutdownReason};
use crate::listener::{accept_loop, remove_socket_file, Listener};
use crate::responder::CgiResponder;
use crate::runner::StderrMode;

/// Asks a running server to shut down.
#[derive(Debug, Clone)]
pub struct ShutdownHandle(Sender<LifecycleEvent>);

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.0.send(LifecycleEvent::Terminate);
    }
}

pub struct Server {
    config: Config,
    listener: Listener,
    local_addr: String,
    socket_path: Option<PathBuf>,
    service: FcgiService,
    lifecycle: Arc<Lifecycle>,
    running: Arc<AtomicBool>,
    events_tx: Sender<LifecycleEvent>,
    events_rx: Receiver<LifecycleEvent>,
}

impl Server {
    /// Bind the configured socket and serve CGI scripts with the filtered host environment.
    pub fn bind(config: Config) -> Result<Self, ConfigError> {
        let responder = CgiResponder::new(
            InheritedEnv::from_host(),
            config.script_policy,
            StderrMode::from_forward_flag(config.forward_stderr),
        );
        Self::bind_with(config, Arc::new(responder))
    }

    /// Bind the configured socket and serve requests with `inner` behind admission control.
    pub fn bind_with(config: Config, inner: Arc<dyn Handler>) -> Result<Self, ConfigError> {
        let listener = Listener::bind(&config.socket)?;
        let local_addr = listener.local_addr_string();
        let socket_path = listener.socket_path().map(|p| p.to_path_buf());

        let idle = Arc::new(IdleTimer::new(config.idle_timeout));
        let jobs = Arc::new(ActiveJobs::new());
        let running = Arc::new(AtomicBool::new(true));
        let admission = Arc::new(AdmissionState::new(jobs.clone(), config.workers, idle.clone()));
        let handler: Arc<dyn Handler> = Arc::new(Dispatcher::new(admission, inner));
        let service = FcgiService::new(handler, config.worker_limit());
        let lifecycle = Arc::new(Lifecycle::new(idle, jobs, running.clone()));
        let (events_tx, events_rx) = channel();

        Ok(Server {
            config,
            listener,
            local_addr,
            socket_path,
            service,
            lifecycle,
            running,
            events_tx,
            events_rx,
        })
    }

    /// Bound address, e.g. "tcp:127.0.0.1:9000" or "unix:/run/fcgiwrap.sock".
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle(self.events_tx.clone())
    }

    /// Run until shutdown; returns why Running ended.
    pub fn serve(self) -> anyhow::Result<ShutdownReason> {
        let Server {
            config,
            listener,
            local_addr,
            socket_path,
            service,
            lifecycle,
            running,
            events_tx,
            events_rx,
        } = self;

        tracing::info!(
            addr = %local_addr,
            workers = config.workers,
            idle_timeout = ?config.idle_timeout,
            forward_stderr = config.forward_stderr,
            "fcgiwrap ready"
        );

        let running_cl = running.clone();
        let accept_tx = events_tx.clone();
        let acceptor = thread::Builder::new()
            .name("fcgi-accept".to_string())
            .spawn(move || {
                let res = accept_loop(&listener, &running_cl, |stream| {
                    let svc = service.clone();
                    thread::spawn(move || svc.serve_connection(stream));
                });
                // listener drops (closes) here
                let _ = accept_tx.send(LifecycleEvent::TransportClosed(res.err()));
            })?;

        let reason = lifecycle.wait_for_shutdown(&events_rx);
        match &reason {
            ShutdownReason::TransportFailed(e) => {
                tracing::error!(error = %e, "transport failed; draining")
            }
            other => tracing::info!(reason = %other, "shutting down"),
        }

        running.store(false, Ordering::SeqCst);
        acceptor
            .join()
            .map_err(|_| anyhow!("accept loop panicked"))?;

        lifecycle.drain(config.drain_grace);
        if let Some(p) = &socket_path {
            remove_socket_file(p);
        }
        lifecycle.terminate();
        debug_assert_eq!(lifecycle.state(), LifecycleState::Terminated);
        tracing::info!("fcgiwrap stopped");
        Ok(reason)
    }
}
