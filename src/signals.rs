//! Signal-to-event bridge (spec.md §5, §9).
//!
//! The child-exit signal handler does one thing only: increment a
//! process-wide atomic counter. All actual reaping happens synchronously
//! after `poll` returns, in `worker::reap_jobs`.

use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};

static REAPABLE: AtomicU64 = AtomicU64::new(0);

extern "C" fn on_sigchld(_: libc::c_int) {
    REAPABLE.fetch_add(1, Ordering::SeqCst);
}

/// Install the SIGCHLD handler. Must be called once during startup.
pub fn install_sigchld_handler() -> nix::Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(on_sigchld),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGCHLD, &action) }?;
    Ok(())
}

/// Ignore SIGTERM, as emergency shutdown does before broadcasting SIGTERM to
/// the whole process group (spec.md §4.5.10, to avoid killing ourselves).
pub fn ignore_sigterm() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());
    unsafe { sigaction(Signal::SIGTERM, &action) }?;
    Ok(())
}

pub fn reapable_count() -> u64 {
    REAPABLE.load(Ordering::SeqCst)
}

pub fn reset_reapable() {
    REAPABLE.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reapable_counter_starts_at_zero_or_higher_and_resets() {
        reset_reapable();
        assert_eq!(reapable_count(), 0);
        REAPABLE.fetch_add(3, Ordering::SeqCst);
        assert_eq!(reapable_count(), 3);
        reset_reapable();
        assert_eq!(reapable_count(), 0);
    }
}
