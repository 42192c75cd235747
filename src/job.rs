//! The job record: the central entity the rest of the crate revolves around.

use std::os::fd::{OwnedFd, RawFd};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::codec::KvVec;
use crate::scheduler::Handle;

/// A job's lifecycle state. ACTIVE is the initial state; STALE is entered
/// when the job has been finalized (timed out) but its child has not yet
/// been reaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Stale,
}

/// One of a job's two output descriptors plus its accumulated bytes.
///
/// The descriptor is `None` once closed; spec.md's `-1` sentinel becomes
/// `Option::None` here rather than a magic raw-fd value.
#[derive(Default)]
pub struct OutputStream {
    fd: Option<OwnedFd>,
    pub buf: Vec<u8>,
}

impl OutputStream {
    pub fn new(fd: OwnedFd) -> Self {
        OutputStream {
            fd: Some(fd),
            buf: Vec::new(),
        }
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        use std::os::fd::AsRawFd;
        self.fd.as_ref().map(|f| f.as_raw_fd())
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    /// Close the descriptor. Idempotent.
    pub fn close(&mut self) {
        self.fd = None;
    }
}

/// Wall-clock timestamp with microsecond precision, as spec.md §3/§6 requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Timestamp {
    pub secs: i64,
    pub micros: i64,
}

impl Timestamp {
    pub fn now() -> Self {
        let d = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp {
            secs: d.as_secs() as i64,
            micros: d.subsec_micros() as i64,
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.secs * 1_000_000 + self.micros
    }

    pub fn as_secs_f64(&self) -> f64 {
        self.secs as f64 + self.micros as f64 / 1_000_000.0
    }

    /// Render as `<sec>.<usec>` with six-digit microseconds, per spec.md §6.
    pub fn to_wire(self) -> String {
        format!("{}.{:06}", self.secs, self.micros)
    }
}

/// `rusage` fields the response carries on a clean finalization, per
/// spec.md §4.5.8/§6.
#[derive(Debug, Clone, Copy, Default)]
pub struct RUsageSnapshot {
    pub ru_utime: f64,
    pub ru_stime: f64,
    pub ru_minflt: i64,
    pub ru_majflt: i64,
    pub ru_inblock: i64,
    pub ru_oublock: i64,
}

impl RUsageSnapshot {
    pub fn from_libc(ru: &libc::rusage) -> Self {
        RUsageSnapshot {
            ru_utime: ru.ru_utime.tv_sec as f64 + ru.ru_utime.tv_usec as f64 / 1_000_000.0,
            ru_stime: ru.ru_stime.tv_sec as f64 + ru.ru_stime.tv_usec as f64 / 1_000_000.0,
            ru_minflt: ru.ru_minflt as i64,
            ru_majflt: ru.ru_majflt as i64,
            ru_inblock: ru.ru_inblock as i64,
            ru_oublock: ru.ru_oublock as i64,
        }
    }
}

/// The reason a job was killed, carried through to the response's `error_code`
/// when the job did not simply exit on its own (spec.md §4.5.6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillReason {
    TimedOut,
    Stale,
}

impl KillReason {
    pub fn wire_code(self) -> &'static str {
        match self {
            KillReason::TimedOut => "timeout",
            KillReason::Stale => "timeout",
        }
    }
}

pub struct Job {
    /// Opaque to the worker; carried through to the response unchanged.
    pub job_id: Vec<u8>,
    pub command: String,
    pub timeout_secs: u64,
    pub request: KvVec,
    pub pid: u32,
    pub out_std: OutputStream,
    pub out_err: OutputStream,
    pub wait_status: i32,
    pub rusage: Option<RUsageSnapshot>,
    pub start: Timestamp,
    pub stop: Option<Timestamp>,
    pub scheduler_handle: Option<Handle>,
    pub state: JobState,
    pub finalized: bool,
}

impl Job {
    pub fn new(job_id: Vec<u8>, command: String, timeout_secs: u64, request: KvVec, start: Timestamp) -> Self {
        Job {
            job_id,
            command,
            timeout_secs,
            request,
            pid: 0,
            out_std: OutputStream::default(),
            out_err: OutputStream::default(),
            wait_status: 0,
            rusage: None,
            start,
            stop: None,
            scheduler_handle: None,
            state: JobState::Active,
            finalized: false,
        }
    }

    pub fn job_id_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.job_id)
    }
}
