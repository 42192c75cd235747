//! Typed error for worker startup failure.
//!
//! Modeled on the teacher's `JobNotFound`-downcast-to-exit-code pattern in
//! `main.rs`, but as a closed enum matched directly rather than downcast
//! through `anyhow::Error`. Every *runtime* condition spec.md §7 names
//! (spawn failure, protocol leniency, master disconnect) is handled inline
//! inside the event loop — an `error_msg` frame, silent leniency, or
//! `WorkerContext::emergency_shutdown` — and never surfaces through this
//! type; only a failure before the event loop can run does.
//! `WorkerContext::run` itself returns a bare exit code, not a `Result`,
//! because by the time the loop is running, every failure path already
//! knows its own exit code and calls `emergency_shutdown` or
//! `std::process::exit` directly rather than bubbling an error up to `main`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkerError {
    /// Startup failed before the event loop could run: bad `--fd`, signal
    /// handler installation, or master-socket configuration. Maps to exit
    /// code 2 (spec.md §6.1).
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

impl WorkerError {
    /// Map to the process exit code spec.md §6.1 assigns this condition.
    pub fn exit_code(&self) -> i32 {
        match self {
            WorkerError::Fatal(_) => 2,
        }
    }
}
