/*!
Admission control and per-request dispatch.

Every request passes through `dispatch` in a fixed order:
1. enter the active-job count (also the drain-wait group),
2. refresh the idle timer,
3. take a worker token when a limit is configured, giving up on cancellation,
4. run the inner handler,
5. release the token, leave the job count, refresh the idle timer.

Step 5 is carried by RAII guards so it also runs when the inner handler unwinds.
*/
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::gateway::{CancelToken, Completion, GatewayRequest, Handler, ResponseWriter};
use crate::lifecycle::IdleTimer;

/// How often a blocked token waiter re-checks its cancellation token.
const CANCEL_POLL: Duration = Duration::from_millis(25);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // A panicking job must not wedge admission for everybody else.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Count of admitted, not yet completed jobs; doubles as the drain-wait group.
#[derive(Debug, Default)]
pub struct ActiveJobs {
    count: Mutex<usize>,
    idle: Condvar,
}

impl ActiveJobs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a job; it is deregistered when the guard drops.
    pub fn enter(self: &Arc<Self>) -> JobGuard {
        *lock(&self.count) += 1;
        JobGuard { jobs: self.clone() }
    }

    pub fn count(&self) -> usize {
        *lock(&self.count)
    }

    /// Wait until no job is active. Returns false if `timeout` elapsed first.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = lock(&self.count);
        while *count > 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            count = match self.idle.wait_timeout(count, deadline - now) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
        true
    }
}

/// Membership of one job in `ActiveJobs`.
#[derive(Debug)]
pub struct JobGuard {
    jobs: Arc<ActiveJobs>,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        let mut count = lock(&self.jobs.count);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.jobs.idle.notify_all();
        }
    }
}

/// Counting semaphore bounding concurrent subprocesses.
#[derive(Debug)]
pub struct TokenPool {
    capacity: usize,
    available: Mutex<usize>,
    released: Condvar,
}

/// Acquisition gave up because the request was cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl TokenPool {
    /// Pool with `workers` tokens, or `None` for an unbounded configuration (≤ 0).
    pub fn for_workers(workers: i64) -> Option<Self> {
        usize::try_from(workers)
            .ok()
            .filter(|&w| w > 0)
            .map(TokenPool::new)
    }

    pub fn new(capacity: usize) -> Self {
        TokenPool {
            capacity,
            available: Mutex::new(capacity),
            released: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        *lock(&self.available)
    }

    /// Block until a token is free or `cancel` fires.
    pub fn acquire(&self, cancel: &CancelToken) -> Result<Permit<'_>, Cancelled> {
        let mut available = lock(&self.available);
        loop {
            if cancel.is_cancelled() {
                return Err(Cancelled);
            }
            if *available > 0 {
                *available -= 1;
                return Ok(Permit { pool: self });
            }
            available = match self.released.wait_timeout(available, CANCEL_POLL) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// A held worker token; returned to the pool on drop.
#[derive(Debug)]
pub struct Permit<'a> {
    pool: &'a TokenPool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        *lock(&self.pool.available) += 1;
        self.pool.released.notify_one();
    }
}

/// Shared admission state handed to every dispatch.
#[derive(Debug)]
pub struct AdmissionState {
    pub jobs: Arc<ActiveJobs>,
    pub tokens: Option<TokenPool>,
    pub idle: Arc<IdleTimer>,
}

impl AdmissionState {
    pub fn new(jobs: Arc<ActiveJobs>, workers: i64, idle: Arc<IdleTimer>) -> Self {
        AdmissionState {
            jobs,
            tokens: TokenPool::for_workers(workers),
            idle,
        }
    }
}

/// Run one request through admission control and the inner handler.
pub fn dispatch(
    state: &AdmissionState,
    inner: &dyn Handler,
    req: GatewayRequest,
    w: &mut dyn ResponseWriter,
) -> Completion {
    // Refreshes the idle window on every exit path, after the job has left the count.
    struct Finish<'a>(&'a IdleTimer);
    impl Drop for Finish<'_> {
        fn drop(&mut self) {
            self.0.refresh();
        }
    }

    let _finish = Finish(&state.idle);
    let _job = state.jobs.enter();
    state.idle.refresh();

    let _permit = match &state.tokens {
        Some(pool) => {
            tracing::debug!(available = pool.available(), "waiting for worker slot");
            match pool.acquire(&req.cancel) {
                Ok(p) => Some(p),
                Err(Cancelled) => {
                    tracing::warn!("request cancelled while waiting for worker slot");
                    return Completion::Aborted;
                }
            }
        }
        None => None,
    };

    inner.serve(req, w)
}

/// `Handler` wrapper that applies `dispatch` around an inner handler.
pub struct Dispatcher<H> {
    state: Arc<AdmissionState>,
    inner: H,
}

impl<H: Handler> Dispatcher<H> {
    pub fn new(state: Arc<AdmissionState>, inner: H) -> Self {
        Dispatcher { state, inner }
    }

    pub fn state(&self) -> &Arc<AdmissionState> {
        &self.state
    }
}

impl<H: Handler> Handler for Dispatcher<H> {
    fn serve(&self, req: GatewayRequest, w: &mut dyn ResponseWriter) -> Completion {
        dispatch(&self.state, &self.inner, req, w)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_for_non_positive_workers() {
        assert!(TokenPool::for_workers(0).is_none());
        assert!(TokenPool::for_workers(-3).is_none());
        assert_eq!(TokenPool::for_workers(4).map(|p| p.capacity()), Some(4));
    }

    #[test]
    fn test_permit_returns_token_on_drop() {
        let pool = TokenPool::new(1);
        let cancel = CancelToken::new();
        {
            let _p = pool.acquire(&cancel).expect("first token");
            assert_eq!(pool.available(), 0);
        }
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_acquire_gives_up_on_cancel() {
        let pool = TokenPool::new(1);
        let held = pool.acquire(&CancelToken::new()).unwrap();
        let cancel = CancelToken::new();
        let c2 = cancel.clone();
        let t = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(60));
            c2.cancel();
        });
        assert_eq!(pool.acquire(&cancel).unwrap_err(), Cancelled);
        t.join().unwrap();
        drop(held);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_wait_idle_times_out_while_job_active() {
        let jobs = Arc::new(ActiveJobs::new());
        let guard = jobs.enter();
        assert_eq!(jobs.count(), 1);
        assert!(!jobs.wait_idle(Duration::from_millis(50)));
        drop(guard);
        assert_eq!(jobs.count(), 0);
        assert!(jobs.wait_idle(Duration::from_millis(10)));
    }
}
