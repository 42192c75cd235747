//! The lifecycle controller: the top-level event loop (spec.md §4.5).
//!
//! Ties together the codec, registry, scheduler, multiplexer, spawn
//! adapter and signal bridge into the single worker-context value spec.md
//! §9 recommends in place of true module-scope mutables.

use std::io;
use std::os::fd::RawFd;

use crate::codec::{self, KvVec};
use crate::config::Config;
use crate::error::WorkerError;
use crate::job::{Job, JobState, KillReason, OutputStream, Timestamp};
use crate::multiplex::{self, GatherOutcome, PollSet, PollTarget};
use crate::registry::{JobKey, Registry};
use crate::scheduler::TimeoutScheduler;
use crate::signals;
use crate::spawn;

#[derive(Default)]
struct Counters {
    started: u64,
    running: u64,
    timeouts: u64,
}

pub struct WorkerContext {
    master_fd: RawFd,
    registry: Registry,
    scheduler: TimeoutScheduler<JobKey>,
    iocache: Vec<u8>,
    config: Config,
    counters: Counters,
}

enum ReceiveOutcome {
    Continue,
    MasterClosed,
}

enum Wait4Outcome {
    Reaped { status: i32, rusage: libc::rusage },
    NotYet,
    NoChild,
}

/// Non-blocking wait for `target_pid` (`-1` meaning any child), retrying on
/// `EINTR` and treating any other unexpected errno as "not yet" rather than
/// risking a false "reaped".
fn wait4_nonblocking(target_pid: i32) -> Wait4Outcome {
    loop {
        let mut status: i32 = 0;
        let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
        let ret = unsafe { libc::wait4(target_pid, &mut status, libc::WNOHANG, &mut rusage) };
        if ret > 0 {
            return Wait4Outcome::Reaped { status, rusage };
        }
        if ret == 0 {
            return Wait4Outcome::NotYet;
        }
        let err = io::Error::last_os_error();
        if err.kind() == io::ErrorKind::Interrupted {
            continue;
        }
        if err.raw_os_error() == Some(libc::ECHILD) {
            return Wait4Outcome::NoChild;
        }
        return Wait4Outcome::NotYet;
    }
}

fn scrub_nul(buf: &mut Vec<u8>) {
    if let Some(pos) = buf.iter().position(|&b| b == 0) {
        buf.truncate(pos);
    }
}

fn find_value<'a>(kv: &'a KvVec, key: &[u8]) -> Option<&'a Vec<u8>> {
    kv.iter().find(|(k, _)| k.as_slice() == key).map(|(_, v)| v)
}

fn chdir_to_home_or_root(chdir_override: Option<&str>) {
    let target = chdir_override
        .map(std::path::PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(std::path::PathBuf::from));
    let ok = target
        .as_ref()
        .is_some_and(|p| std::env::set_current_dir(p).is_ok());
    if !ok {
        if let Err(e) = std::env::set_current_dir("/") {
            tracing::warn!(error = %e, "chdir to / failed");
        }
    }
}

fn set_cloexec(fd: RawFd) {
    use nix::fcntl::{fcntl, FcntlArg, FdFlag};
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFD) {
        let mut fdflags = FdFlag::from_bits_truncate(flags);
        fdflags.insert(FdFlag::FD_CLOEXEC);
        let _ = fcntl(fd, FcntlArg::F_SETFD(fdflags));
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflags))?;
    Ok(())
}

fn set_socket_buffers(fd: RawFd, send: usize, recv: usize) {
    unsafe {
        let send_i: libc::c_int = send as libc::c_int;
        let recv_i: libc::c_int = recv as libc::c_int;
        let optlen = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &send_i as *const _ as *const libc::c_void,
            optlen,
        );
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_RCVBUF,
            &recv_i as *const _ as *const libc::c_void,
            optlen,
        );
    }
}

fn reap_wnohang_all() {
    loop {
        let mut status: i32 = 0;
        let ret = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if ret <= 0 {
            break;
        }
    }
}

impl WorkerContext {
    /// Startup per spec.md §4.5.1: chdir, process-group leadership, the
    /// SIGCHLD bridge, close-on-exec and non-blocking mode plus buffer
    /// sizes on the master socket.
    pub fn startup(master_fd: RawFd, chdir_override: Option<&str>, config: Config) -> Result<Self, WorkerError> {
        chdir_to_home_or_root(chdir_override);

        if unsafe { libc::setpgid(0, 0) } != 0 {
            let err = io::Error::last_os_error();
            tracing::warn!(error = %err, "setpgid failed; continuing in inherited process group");
        }

        signals::install_sigchld_handler()
            .map_err(|e| WorkerError::Fatal(anyhow::anyhow!("installing SIGCHLD handler: {e}")))?;

        set_cloexec(libc::STDOUT_FILENO);
        set_cloexec(libc::STDERR_FILENO);
        set_cloexec(master_fd);
        set_nonblocking(master_fd)
            .map_err(|e| WorkerError::Fatal(anyhow::anyhow!("setting master socket non-blocking: {e}")))?;
        set_socket_buffers(master_fd, config.send_buffer, config.recv_buffer);

        let iocache_prealloc = config.iocache_capacity.min(64 * 1024);
        Ok(WorkerContext {
            master_fd,
            registry: Registry::with_capacity(config.fanout_capacity),
            scheduler: TimeoutScheduler::new(),
            iocache: Vec::with_capacity(iocache_prealloc),
            config,
            counters: Counters::default(),
        })
    }

    /// Run the event loop (spec.md §4.5.2) to completion. Returns only on the
    /// rare path where the descriptor set empties without a master-disconnect
    /// or fatal-I/O trigger; the common exits go through `emergency_shutdown`,
    /// which terminates the process directly.
    pub fn run(mut self) -> i32 {
        loop {
            let poll_time_ms = self.compute_poll_time();
            let mut pollset = self.build_pollset();
            if pollset.is_empty() {
                break;
            }
            let ready = match pollset.poll(poll_time_ms) {
                Ok(r) => r,
                Err(e) => {
                    tracing::error!(error = %e, "poll failed");
                    self.emergency_shutdown(2);
                }
            };

            let mut master_event = false;
            for r in ready {
                match r.target {
                    PollTarget::Master => master_event = true,
                    PollTarget::JobStdout(key) => self.handle_job_io(key, true),
                    PollTarget::JobStderr(key) => self.handle_job_io(key, false),
                }
            }

            if master_event {
                if let ReceiveOutcome::MasterClosed = self.receive_command() {
                    self.emergency_shutdown(0);
                }
            }

            if signals::reapable_count() > 0 {
                self.reap_jobs();
            }
        }
        0
    }

    fn build_pollset(&self) -> PollSet {
        let mut ps = PollSet::new();
        ps.register(self.master_fd, PollTarget::Master);
        for (key, job) in self.registry.iter() {
            if let Some(fd) = job.out_std.raw_fd() {
                ps.register(fd, PollTarget::JobStdout(key));
            }
            if let Some(fd) = job.out_err.raw_fd() {
                ps.register(fd, PollTarget::JobStderr(key));
            }
        }
        ps
    }

    /// Steps 1-2 of the event loop: walk the scheduler, firing every job
    /// whose deadline (plus slack) has already passed, and return the
    /// millisecond timeout for the next `poll` call.
    fn compute_poll_time(&mut self) -> i32 {
        loop {
            let Some((handle, key, deadline)) = self.scheduler.peek() else {
                return -1;
            };
            let now = Timestamp::now().as_micros();
            let delta_ms = (deadline - now) / 1000;
            let slacked = delta_ms + self.config.poll_slack.as_millis() as i64;
            if slacked > 0 {
                return slacked.min(i32::MAX as i64) as i32;
            }

            let Some(job) = self.registry.lookup_by_key(key) else {
                self.scheduler.remove(handle);
                continue;
            };
            let reason = if job.state == JobState::Stale {
                KillReason::Stale
            } else {
                KillReason::TimedOut
            };
            self.kill_job(key, reason);
        }
    }

    fn handle_job_io(&mut self, key: JobKey, is_stdout: bool) {
        let Some(job) = self.registry.lookup_by_key_mut(key) else {
            return;
        };
        let stream: &mut OutputStream = if is_stdout { &mut job.out_std } else { &mut job.out_err };
        if multiplex::gather_output(stream, false) != GatherOutcome::Closed {
            return;
        }
        // spec.md §4.4: on close, probe completion with a non-blocking wait.
        let Some(job) = self.registry.lookup_by_key(key) else {
            return;
        };
        let pid = job.pid;
        if let Wait4Outcome::Reaped { status, rusage } = wait4_nonblocking(pid as i32) {
            self.record_wait(key, status, rusage);
            let stale = self.registry.lookup_by_key(key).map(|j| j.state) == Some(JobState::Stale);
            if !stale {
                self.finish_job(key, None);
            }
            self.destroy_job(key);
        }
    }

    /// spec.md §4.5.3.
    fn receive_command(&mut self) -> ReceiveOutcome {
        loop {
            let space = self.config.iocache_capacity.saturating_sub(self.iocache.len());
            if space == 0 {
                break;
            }
            let want = space.min(self.config.scratch_read);
            let mut buf = vec![0u8; want];
            let n = unsafe { libc::read(self.master_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n > 0 {
                let n = n as usize;
                self.iocache.extend_from_slice(&buf[..n]);
                if n < want {
                    break;
                }
                continue;
            }
            if n == 0 {
                return ReceiveOutcome::MasterClosed;
            }
            let err = io::Error::last_os_error();
            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => break,
                _ => return ReceiveOutcome::MasterClosed,
            }
        }

        let (frames, consumed) = codec::decode(&self.iocache);
        self.iocache.drain(..consumed);
        for kv in frames {
            self.spawn_job(kv);
        }
        ReceiveOutcome::Continue
    }

    /// spec.md §4.5.4.
    fn spawn_job(&mut self, kv: KvVec) {
        let command = find_value(&kv, b"command").map(|v| String::from_utf8_lossy(v).into_owned());
        let job_id = find_value(&kv, b"job_id").cloned().unwrap_or_default();
        let timeout = find_value(&kv, b"timeout")
            .and_then(|v| std::str::from_utf8(v).ok())
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|&t| t != 0)
            .unwrap_or(self.config.default_timeout.as_secs());

        let Some(command) = command else {
            self.send_error(Some(&job_id), "missing command");
            return;
        };

        let start = Timestamp::now();
        let deadline = start.as_micros() + (timeout as i64) * 1_000_000;
        let job = Job::new(job_id.clone(), command.clone(), timeout, kv, start);
        let key = self.registry.insert_pending(job);
        let handle = self.scheduler.add(deadline, key);
        if let Some(j) = self.registry.lookup_by_key_mut(key) {
            j.scheduler_handle = Some(handle);
        }

        match spawn::start_cmd(&command) {
            Ok(spawned) => {
                if let Some(j) = self.registry.lookup_by_key_mut(key) {
                    j.out_std = OutputStream::new(spawned.stdout);
                    j.out_err = OutputStream::new(spawned.stderr);
                }
                self.registry.attach_pid(key, spawned.pid);
                self.counters.started += 1;
                self.counters.running += 1;
            }
            Err(e) => {
                tracing::warn!(job_id = %String::from_utf8_lossy(&job_id), error = %e, "spawn failed");
                self.send_error(Some(&job_id), &format!("spawn failed: {e}"));
                self.scheduler.remove(handle);
                self.registry.remove(key);
            }
        }
    }

    /// spec.md §4.5.6.
    fn kill_job(&mut self, key: JobKey, reason: KillReason) {
        let Some(pid) = self.registry.lookup_by_key(key).map(|j| j.pid) else {
            return;
        };

        if reason == KillReason::TimedOut {
            if let Wait4Outcome::Reaped { status, rusage } = wait4_nonblocking(pid as i32) {
                self.record_wait(key, status, rusage);
                self.finish_job(key, None);
                self.destroy_job(key);
                self.counters.timeouts += 1;
                return;
            }
        }

        if unsafe { libc::kill(-(pid as i32), libc::SIGKILL) } != 0 {
            let err = io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::warn!(pid, error = %err, "SIGKILL to process group failed");
            }
        }

        // Bounded immediate retries rather than an unbounded wait loop — see
        // DESIGN.md's Open Question resolutions.
        const KILL_WAIT_SPINS: u32 = 16;
        for _ in 0..KILL_WAIT_SPINS {
            match wait4_nonblocking(pid as i32) {
                Wait4Outcome::Reaped { status, rusage } => {
                    self.record_wait(key, status, rusage);
                    let was_stale = self.registry.lookup_by_key(key).map(|j| j.state) == Some(JobState::Stale);
                    if !was_stale {
                        self.finish_job(key, Some(reason));
                    }
                    self.destroy_job(key);
                    return;
                }
                Wait4Outcome::NoChild => {
                    self.destroy_job(key);
                    return;
                }
                Wait4Outcome::NotYet => continue,
            }
        }

        // Still not reaped: uninterruptible sleep. Reschedule.
        let retry_after = if reason == KillReason::Stale {
            let pid_str = self.registry.lookup_by_key(key).map(|j| j.job_id_lossy().into_owned());
            let _ = codec::send_log(
                self.master_fd,
                &format!(
                    "job {} (pid {pid}) still not reaped; retrying in {:.0}s",
                    pid_str.as_deref().unwrap_or("?"),
                    self.config.stale_retry.as_secs_f64()
                ),
            );
            self.config.stale_retry
        } else {
            tracing::warn!(pid, "child not reaped after SIGKILL; marking stale");
            if let Some(job) = self.registry.lookup_by_key_mut(key) {
                job.state = JobState::Stale;
            }
            self.finish_job(key, Some(KillReason::TimedOut));
            self.config.timed_out_retry
        };

        if let Some(old_handle) = self.registry.lookup_by_key(key).and_then(|j| j.scheduler_handle) {
            self.scheduler.remove(old_handle);
        }
        let deadline = Timestamp::now().as_micros() + retry_after.as_micros() as i64;
        let new_handle = self.scheduler.add(deadline, key);
        if let Some(job) = self.registry.lookup_by_key_mut(key) {
            job.scheduler_handle = Some(new_handle);
        }
    }

    /// spec.md §4.5.7. Calls `wait4(-1, ...)` directly (rather than through
    /// `wait4_nonblocking`, which does not surface the reaped PID) so each
    /// reaped child can be matched against the registry immediately.
    fn reap_jobs(&mut self) {
        loop {
            if signals::reapable_count() == 0 {
                return;
            }
            let mut status: i32 = 0;
            let mut rusage: libc::rusage = unsafe { std::mem::zeroed() };
            let ret = unsafe { libc::wait4(-1, &mut status, libc::WNOHANG, &mut rusage) };
            if ret > 0 {
                let pid = ret as u32;
                if let Some(key) = self.registry.key_for_pid(pid) {
                    self.record_wait(key, status, rusage);
                    let stale = self.registry.lookup_by_key(key).map(|j| j.state) == Some(JobState::Stale);
                    if !stale {
                        self.finish_job(key, None);
                    }
                    self.destroy_job(key);
                }
                continue;
            }
            if ret == 0 {
                signals::reset_reapable();
                return;
            }
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            // ECHILD or any other unexpected errno: nothing left to reap.
            signals::reset_reapable();
            return;
        }
    }

    fn record_wait(&mut self, key: JobKey, status: i32, rusage: libc::rusage) {
        if let Some(job) = self.registry.lookup_by_key_mut(key) {
            job.wait_status = status;
            job.rusage = Some(crate::job::RUsageSnapshot::from_libc(&rusage));
        }
    }

    /// spec.md §4.5.8.
    fn finish_job(&mut self, key: JobKey, reason: Option<KillReason>) {
        let Some(job) = self.registry.lookup_by_key_mut(key) else {
            return;
        };
        debug_assert!(!job.finalized, "job finalized more than once");

        multiplex::gather_output(&mut job.out_std, true);
        multiplex::gather_output(&mut job.out_err, true);
        scrub_nul(&mut job.out_std.buf);
        scrub_nul(&mut job.out_err.buf);

        job.stop = Some(Timestamp::now());
        let runtime = job.stop.unwrap().as_secs_f64() - job.start.as_secs_f64();

        let mut response: KvVec = job
            .request
            .iter()
            .filter(|(k, _)| k.as_slice() != b"env")
            .cloned()
            .collect();
        response.push((b"wait_status".to_vec(), job.wait_status.to_string().into_bytes()));
        response.push((b"start".to_vec(), job.start.to_wire().into_bytes()));
        response.push((b"stop".to_vec(), job.stop.unwrap().to_wire().into_bytes()));
        response.push((b"runtime".to_vec(), format!("{runtime:.6}").into_bytes()));

        match reason {
            None => {
                response.push((b"exited_ok".to_vec(), b"1".to_vec()));
                if let Some(ru) = job.rusage {
                    response.push((b"ru_utime".to_vec(), format!("{:.6}", ru.ru_utime).into_bytes()));
                    response.push((b"ru_stime".to_vec(), format!("{:.6}", ru.ru_stime).into_bytes()));
                    response.push((b"ru_minflt".to_vec(), ru.ru_minflt.to_string().into_bytes()));
                    response.push((b"ru_majflt".to_vec(), ru.ru_majflt.to_string().into_bytes()));
                    response.push((b"ru_inblock".to_vec(), ru.ru_inblock.to_string().into_bytes()));
                    response.push((b"ru_oublock".to_vec(), ru.ru_oublock.to_string().into_bytes()));
                }
            }
            Some(r) => {
                response.push((b"exited_ok".to_vec(), b"0".to_vec()));
                response.push((b"error_code".to_vec(), r.wire_code().as_bytes().to_vec()));
            }
        }
        response.push((b"outerr".to_vec(), job.out_err.buf.clone()));
        response.push((b"outstd".to_vec(), job.out_std.buf.clone()));
        job.finalized = true;

        self.send_or_exit(&response);
    }

    /// spec.md §4.5.9.
    fn destroy_job(&mut self, key: JobKey) {
        if let Some(job) = self.registry.remove(key) {
            if let Some(handle) = job.scheduler_handle {
                self.scheduler.remove(handle);
            }
            if job.pid != 0 {
                self.counters.running = self.counters.running.saturating_sub(1);
            }
        }
    }

    fn send_error(&mut self, job_id: Option<&[u8]>, msg: &str) {
        let mut kv: KvVec = Vec::new();
        if let Some(id) = job_id {
            if !id.is_empty() {
                kv.push((b"job_id".to_vec(), id.to_vec()));
            }
        }
        kv.push((b"error_msg".to_vec(), msg.as_bytes().to_vec()));
        self.send_or_exit(&kv);
    }

    /// A broken-pipe write to the master is a disconnect, not a fresh fault:
    /// route it through the same emergency-shutdown procedure as the
    /// read-side disconnect (spec.md §4.5.10, §7) so any children still
    /// running at the moment the write failed are killed and reaped rather
    /// than leaked by a bare process exit.
    fn send_or_exit(&mut self, kv: &KvVec) {
        if let Err(e) = codec::send_kv(self.master_fd, kv) {
            tracing::error!(error = %e, "write to master failed");
            self.emergency_shutdown(1);
        }
    }

    /// spec.md §4.5.10: triggered by master disconnect (exit 0) or a fatal
    /// internal error (any other code).
    fn emergency_shutdown(&mut self, code: i32) -> ! {
        tracing::warn!(
            code,
            started = self.counters.started,
            running = self.counters.running,
            timeouts = self.counters.timeouts,
            "emergency shutdown"
        );
        let _ = signals::ignore_sigterm();
        unsafe {
            libc::kill(0, libc::SIGTERM);
        }
        reap_wnohang_all();
        std::thread::sleep(std::time::Duration::from_secs(1));
        while let Some((_, key, _)) = self.scheduler.pop() {
            if let Some(job) = self.registry.lookup_by_key(key) {
                if job.pid != 0 {
                    unsafe {
                        libc::kill(-(job.pid as i32), libc::SIGKILL);
                    }
                }
            }
        }
        std::thread::sleep(std::time::Duration::from_secs(1));
        reap_wnohang_all();
        std::process::exit(code);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_nul_truncates_at_first_embedded_nul() {
        let mut buf = b"hello\0world".to_vec();
        scrub_nul(&mut buf);
        assert_eq!(buf, b"hello");
    }

    #[test]
    fn scrub_nul_is_noop_without_embedded_nul() {
        let mut buf = b"clean output\n".to_vec();
        scrub_nul(&mut buf);
        assert_eq!(buf, b"clean output\n");
    }

    #[test]
    fn find_value_locates_first_matching_key() {
        let kv: KvVec = vec![
            (b"job_id".to_vec(), b"7".to_vec()),
            (b"command".to_vec(), b"/bin/true".to_vec()),
        ];
        assert_eq!(find_value(&kv, b"command"), Some(&b"/bin/true".to_vec()));
        assert_eq!(find_value(&kv, b"missing"), None);
    }
}
