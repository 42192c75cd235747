//! Tunable configuration.
//!
//! Resolution order, mirroring `resolve_root`'s precedence chain in the
//! teacher's `jobstore.rs` (CLI flag, then environment, then default),
//! adapted here to this crate's numeric tunables: built-in default, then a
//! `WORKER_*` environment variable override, then an explicit constructor
//! argument (used by tests) — the explicit argument wins when present.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    /// Bound on the process-wide inbound read buffer (spec.md §4.5.3).
    pub iocache_capacity: usize,
    /// Socket send buffer size set on the master socket (spec.md §4.5.1).
    pub send_buffer: usize,
    /// Socket receive buffer size set on the master socket (spec.md §4.5.1).
    pub recv_buffer: usize,
    /// Scratch read size for `gather_output` (spec.md §4.4).
    pub scratch_read: usize,
    /// Applied when a request omits `timeout` or sends zero (spec.md §3).
    pub default_timeout: Duration,
    /// Retry interval once a job has been marked STALE (spec.md §4.5.6).
    pub stale_retry: Duration,
    /// Retry interval for the first STALE transition (spec.md §4.5.6).
    pub timed_out_retry: Duration,
    /// Slack added to the computed poll timeout so a job is never fired
    /// before its deadline (spec.md §4.5.2).
    pub poll_slack: Duration,
    /// Expected fanout capacity (spec.md §4.2).
    pub fanout_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            iocache_capacity: 512 * 1024,
            send_buffer: 256 * 1024,
            recv_buffer: 256 * 1024,
            scratch_read: 4 * 1024,
            default_timeout: Duration::from_secs(60),
            stale_retry: Duration::from_secs(5),
            timed_out_retry: Duration::from_secs(1),
            poll_slack: Duration::from_millis(5),
            fanout_capacity: crate::registry::DEFAULT_CAPACITY,
        }
    }
}

impl Config {
    /// Resolve from built-in defaults, overridden by `WORKER_*` environment
    /// variables where present. Unparsable overrides are ignored (the
    /// default is kept) rather than treated as fatal.
    pub fn resolve() -> Self {
        let mut cfg = Config::default();
        if let Some(v) = env_usize("WORKER_IOCACHE_BYTES") {
            cfg.iocache_capacity = v;
        }
        if let Some(v) = env_usize("WORKER_SEND_BUFFER_BYTES") {
            cfg.send_buffer = v;
        }
        if let Some(v) = env_usize("WORKER_RECV_BUFFER_BYTES") {
            cfg.recv_buffer = v;
        }
        if let Some(v) = env_usize("WORKER_SCRATCH_READ_BYTES") {
            cfg.scratch_read = v;
        }
        if let Some(v) = env_u64("WORKER_DEFAULT_TIMEOUT_SECS") {
            cfg.default_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_u64("WORKER_STALE_RETRY_SECS") {
            cfg.stale_retry = Duration::from_secs(v);
        }
        if let Some(v) = env_usize("WORKER_FANOUT_CAPACITY") {
            cfg.fanout_capacity = v;
        }
        cfg
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_matches_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.iocache_capacity, 512 * 1024);
        assert_eq!(cfg.send_buffer, 256 * 1024);
        assert_eq!(cfg.recv_buffer, 256 * 1024);
        assert_eq!(cfg.scratch_read, 4096);
        assert_eq!(cfg.default_timeout, Duration::from_secs(60));
        assert_eq!(cfg.fanout_capacity, 4096);
    }

    #[test]
    fn env_override_wins_over_default() {
        // SAFETY: test-only; not run in parallel with other env-mutating tests.
        unsafe {
            std::env::set_var("WORKER_IOCACHE_BYTES", "1024");
        }
        let cfg = Config::resolve();
        unsafe {
            std::env::remove_var("WORKER_IOCACHE_BYTES");
        }
        assert_eq!(cfg.iocache_capacity, 1024);
    }

    #[test]
    fn unparsable_env_override_falls_back_to_default() {
        unsafe {
            std::env::set_var("WORKER_IOCACHE_BYTES", "not-a-number");
        }
        let cfg = Config::resolve();
        unsafe {
            std::env::remove_var("WORKER_IOCACHE_BYTES");
        }
        assert_eq!(cfg.iocache_capacity, Config::default().iocache_capacity);
    }
}
