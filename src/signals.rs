//! SIGINT/SIGTERM handling: the handler only records the signal; the lifecycle
//! controller polls `pending()`.
use std::sync::atomic::{AtomicI32, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};

static PENDING: AtomicI32 = AtomicI32::new(0);

extern "C" fn record_signal(sig: i32) {
    PENDING.store(sig, Ordering::SeqCst);
}

/// Install the termination handlers.
pub fn install() -> nix::Result<()> {
    let act = SigAction::new(
        SigHandler::Handler(record_signal),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only performs an atomic store.
    unsafe {
        signal::sigaction(Signal::SIGINT, &act)?;
        signal::sigaction(Signal::SIGTERM, &act)?;
    }
    Ok(())
}

/// Last termination signal received, if any.
pub fn pending() -> Option<i32> {
    match PENDING.load(Ordering::SeqCst) {
        0 => None,
        sig => Some(sig),
    }
}
