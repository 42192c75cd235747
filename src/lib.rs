//! monitor-worker — core library.
//!
//! A single-threaded, event-driven worker process: accepts command
//! execution requests from a controlling master over a connected socket,
//! spawns each as a child process, multiplexes its stdout/stderr, enforces
//! per-job timeouts, reaps terminated children, and returns a structured
//! result record back to the master.

pub mod codec;
pub mod config;
pub mod error;
pub mod job;
pub mod multiplex;
pub mod registry;
pub mod scheduler;
pub mod signals;
pub mod spawn;
pub mod worker;

use std::os::fd::RawFd;

use error::WorkerError;

/// Start up and run the worker to completion against the already-connected
/// socket `fd`. `chdir_override` stands in for the invoking user's home
/// directory in tests (spec.md §6.1).
pub fn run(fd: RawFd, chdir_override: Option<&str>) -> Result<i32, WorkerError> {
    let config = config::Config::resolve();
    let ctx = worker::WorkerContext::startup(fd, chdir_override, config)?;
    Ok(ctx.run())
}
