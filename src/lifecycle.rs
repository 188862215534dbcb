/*!
Idle lifecycle: Running -> Draining -> Terminated.

- `IdleTimer` is a sliding deadline refreshed on every admission and completion.
  A non-positive timeout disarms it for good.
- `Lifecycle::wait_for_shutdown` blocks in Running until the idle window expires
  with no active jobs, a termination signal arrives, or the transport reports it
  is gone. An expiry while jobs are in flight re-arms the window.
- `Lifecycle::drain` stops the accept loop and waits, bounded, for in-flight jobs.
  It never kills them.
*/
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::admission::ActiveJobs;
use crate::signals;

/// Upper bound on how long the controller sleeps between checks.
const TICK: Duration = Duration::from_millis(50);

/// Default bound on the Draining wait.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(30);

/// Sliding idle deadline.
#[derive(Debug)]
pub struct IdleTimer {
    period: Option<Duration>,
    deadline: Mutex<Option<Instant>>,
}

impl IdleTimer {
    /// Armed for `period` from now; `None` or zero never fires.
    pub fn new(period: Option<Duration>) -> Self {
        let period = period.filter(|p| !p.is_zero());
        IdleTimer {
            period,
            deadline: Mutex::new(period.map(|p| Instant::now() + p)),
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    pub fn period(&self) -> Option<Duration> {
        self.period
    }

    /// Restart the window at the full period.
    pub fn refresh(&self) {
        if let Some(p) = self.period {
            let mut d = self.deadline.lock().unwrap_or_else(|e| e.into_inner());
            *d = Some(Instant::now() + p);
        }
    }

    /// Time left until expiry; `None` when disarmed.
    pub fn remaining(&self) -> Option<Duration> {
        let d = self.deadline.lock().unwrap_or_else(|e| e.into_inner());
        d.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn expired(&self) -> bool {
        self.remaining().map(|r| r.is_zero()).unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Running,
    Draining,
    Terminated,
}

/// Events the transport side reports to the controller.
#[derive(Debug)]
pub enum LifecycleEvent {
    /// The accept loop ended; `Some` carries the fatal error.
    TransportClosed(Option<io::Error>),
    /// External request to shut down.
    Terminate,
}

/// Why Running ended.
#[derive(Debug)]
pub enum ShutdownReason {
    IdleTimeout,
    Signal(i32),
    Requested,
    TransportClosed,
    TransportFailed(io::Error),
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::IdleTimeout => write!(f, "idle timeout reached with no active jobs"),
            ShutdownReason::Signal(sig) => write!(f, "received signal {sig}"),
            ShutdownReason::Requested => write!(f, "shutdown requested"),
            ShutdownReason::TransportClosed => write!(f, "transport closed"),
            ShutdownReason::TransportFailed(e) => write!(f, "transport failed: {e}"),
        }
    }
}

/// Owner of the shutdown state machine.
#[derive(Debug)]
pub struct Lifecycle {
    idle: Arc<IdleTimer>,
    jobs: Arc<ActiveJobs>,
    running: Arc<AtomicBool>,
    state: Mutex<LifecycleState>,
}

impl Lifecycle {
    /// `running` is the accept loop's flag; it is cleared when draining starts.
    pub fn new(idle: Arc<IdleTimer>, jobs: Arc<ActiveJobs>, running: Arc<AtomicBool>) -> Self {
        Lifecycle {
            idle,
            jobs,
            running,
            state: Mutex::new(LifecycleState::Running),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: LifecycleState) {
        let mut s = self.state.lock().unwrap_or_else(|e| e.into_inner());
        tracing::debug!(from = ?*s, to = ?next, "lifecycle transition");
        *s = next;
    }

    /// Block while Running; returns once a shutdown trigger fires and the state is Draining.
    pub fn wait_for_shutdown(&self, events: &Receiver<LifecycleEvent>) -> ShutdownReason {
        let reason = self.run_until_trigger(events);
        self.set_state(LifecycleState::Draining);
        reason
    }

    fn run_until_trigger(&self, events: &Receiver<LifecycleEvent>) -> ShutdownReason {
        loop {
            if let Some(sig) = signals::pending() {
                return ShutdownReason::Signal(sig);
            }
            let wait = self.idle.remaining().map(|r| r.min(TICK)).unwrap_or(TICK);
            match events.recv_timeout(wait) {
                Ok(LifecycleEvent::Terminate) => return ShutdownReason::Requested,
                Ok(LifecycleEvent::TransportClosed(None)) => return ShutdownReason::TransportClosed,
                Ok(LifecycleEvent::TransportClosed(Some(e))) => {
                    return ShutdownReason::TransportFailed(e)
                }
                Err(RecvTimeoutError::Disconnected) => return ShutdownReason::TransportClosed,
                Err(RecvTimeoutError::Timeout) => {}
            }
            if self.idle.expired() {
                let active = self.jobs.count();
                if active == 0 {
                    return ShutdownReason::IdleTimeout;
                }
                tracing::debug!(active, "idle timeout fired with active jobs; re-arming");
                self.idle.refresh();
            }
        }
    }

    /// Stop accepting and wait up to `grace` for admitted jobs. Returns true if all finished.
    pub fn drain(&self, grace: Duration) -> bool {
        if self.state() == LifecycleState::Running {
            self.set_state(LifecycleState::Draining);
        }
        self.running.store(false, Ordering::SeqCst);
        let active = self.jobs.count();
        if active > 0 {
            tracing::info!(active, grace = ?grace, "waiting for active handlers");
        }
        let done = self.jobs.wait_idle(grace);
        if done {
            tracing::info!("all handlers completed");
        } else {
            tracing::warn!(
                remaining = self.jobs.count(),
                "timeout waiting for handlers to finish"
            );
        }
        done
    }

    pub fn terminate(&self) {
        self.set_state(LifecycleState::Terminated);
    }
}
