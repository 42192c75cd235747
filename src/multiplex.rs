//! I/O multiplexer adapter: a thin layer over `poll(2)` plus the
//! `gather_output` contract (spec.md §4.4).
//!
//! Built directly on raw `libc::poll` rather than a safe wrapper so that
//! every syscall this crate touches for process control (`poll`, `wait4`,
//! `kill`) goes through the same FFI surface; see DESIGN.md.

use std::os::fd::RawFd;

use crate::job::OutputStream;
use crate::registry::JobKey;

/// What a registered descriptor belongs to, per spec.md §9's "dynamic
/// dispatch" design note: a closed enum, not function pointers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollTarget {
    Master,
    JobStdout(JobKey),
    JobStderr(JobKey),
}

/// One descriptor's readiness result after a `poll` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ready {
    pub target: PollTarget,
    pub readable: bool,
    pub hung_up: bool,
}

/// Build the pollfd set and target list together so revents can be mapped
/// back to their tag after `poll` returns.
pub struct PollSet {
    fds: Vec<libc::pollfd>,
    targets: Vec<PollTarget>,
}

impl PollSet {
    pub fn new() -> Self {
        PollSet {
            fds: Vec::new(),
            targets: Vec::new(),
        }
    }

    pub fn register(&mut self, fd: RawFd, target: PollTarget) {
        self.fds.push(libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        });
        self.targets.push(target);
    }

    pub fn is_empty(&self) -> bool {
        self.fds.is_empty()
    }

    /// Block up to `timeout_ms` (-1 = until any event) and return the set of
    /// descriptors that became ready.
    pub fn poll(&mut self, timeout_ms: i32) -> std::io::Result<Vec<Ready>> {
        loop {
            let ret = unsafe {
                libc::poll(self.fds.as_mut_ptr(), self.fds.len() as libc::nfds_t, timeout_ms)
            };
            if ret < 0 {
                let err = std::io::Error::last_os_error();
                if err.kind() == std::io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err);
            }
            let mut ready = Vec::with_capacity(ret.max(0) as usize);
            for (pfd, target) in self.fds.iter().zip(self.targets.iter()) {
                if pfd.revents == 0 {
                    continue;
                }
                ready.push(Ready {
                    target: *target,
                    readable: pfd.revents & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) != 0,
                    hung_up: pfd.revents & (libc::POLLHUP | libc::POLLERR | libc::POLLNVAL) != 0,
                });
            }
            return Ok(ready);
        }
    }
}

const SCRATCH_SIZE: usize = 4096;

/// Outcome of one `gather_output` call, used by the caller to decide whether
/// to probe for completion (spec.md §4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatherOutcome {
    /// More data may arrive later; descriptor left open.
    Pending,
    /// Descriptor closed (EOF, error, or `final=true` was requested).
    Closed,
}

/// Read into a 4 KiB scratch buffer in a loop, per spec.md §4.4's contract:
/// - `n > 0`: append to the job's buffer, keep looping.
/// - `EINTR`: retry immediately.
/// - `EAGAIN`/`EWOULDBLOCK`: return, more data later.
/// - any other error, `n == 0`, or `final == true`: close and return.
pub fn gather_output(stream: &mut OutputStream, final_flag: bool) -> GatherOutcome {
    if final_flag {
        stream.close();
        return GatherOutcome::Closed;
    }
    let Some(fd) = stream.raw_fd() else {
        return GatherOutcome::Closed;
    };
    let mut scratch = [0u8; SCRATCH_SIZE];
    loop {
        let n = unsafe {
            libc::read(
                fd,
                scratch.as_mut_ptr() as *mut libc::c_void,
                scratch.len(),
            )
        };
        if n > 0 {
            stream.buf.extend_from_slice(&scratch[..n as usize]);
            continue;
        }
        if n == 0 {
            stream.close();
            return GatherOutcome::Closed;
        }
        let err = std::io::Error::last_os_error();
        match err.kind() {
            std::io::ErrorKind::Interrupted => continue,
            std::io::ErrorKind::WouldBlock => return GatherOutcome::Pending,
            _ => {
                stream.close();
                return GatherOutcome::Closed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::fd::FromRawFd;

    fn pipe_pair() -> (std::os::fd::OwnedFd, std::os::fd::OwnedFd) {
        let mut fds = [0i32; 2];
        let ret = unsafe { libc::pipe(fds.as_mut_ptr()) };
        assert_eq!(ret, 0);
        unsafe {
            (
                std::os::fd::OwnedFd::from_raw_fd(fds[0]),
                std::os::fd::OwnedFd::from_raw_fd(fds[1]),
            )
        }
    }

    fn set_nonblocking(fd: &std::os::fd::OwnedFd) {
        use std::os::fd::AsRawFd;
        let raw = fd.as_raw_fd();
        unsafe {
            let flags = libc::fcntl(raw, libc::F_GETFL, 0);
            libc::fcntl(raw, libc::F_SETFL, flags | libc::O_NONBLOCK);
        }
    }

    #[test]
    fn gather_output_returns_pending_on_eagain() {
        let (read_end, _write_end) = pipe_pair();
        set_nonblocking(&read_end);
        let mut stream = OutputStream::new(read_end);
        let outcome = gather_output(&mut stream, false);
        assert_eq!(outcome, GatherOutcome::Pending);
        assert!(stream.is_open());
    }

    #[test]
    fn gather_output_reads_available_bytes() {
        let (read_end, write_end) = pipe_pair();
        set_nonblocking(&read_end);
        use std::io::Write;
        let mut f = std::fs::File::from(write_end);
        f.write_all(b"hello").unwrap();
        drop(f);
        let mut stream = OutputStream::new(read_end);
        let _ = gather_output(&mut stream, false);
        assert_eq!(stream.buf, b"hello");
    }

    #[test]
    fn gather_output_closes_on_eof() {
        let (read_end, write_end) = pipe_pair();
        set_nonblocking(&read_end);
        drop(write_end);
        let mut stream = OutputStream::new(read_end);
        let outcome = gather_output(&mut stream, false);
        assert_eq!(outcome, GatherOutcome::Closed);
        assert!(!stream.is_open());
    }

    #[test]
    fn gather_output_final_always_closes() {
        let (read_end, _write_end) = pipe_pair();
        set_nonblocking(&read_end);
        let mut stream = OutputStream::new(read_end);
        let outcome = gather_output(&mut stream, true);
        assert_eq!(outcome, GatherOutcome::Closed);
        assert!(!stream.is_open());
    }
}
