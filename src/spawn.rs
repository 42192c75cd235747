//! The spawn adapter (`start_cmd`, spec.md §4.5.5).
//!
//! Forks and execs the child through `/bin/sh -c <command>`, placing it
//! into its own process group so it can later be killed as a group, and
//! returns its two output descriptors already set non-blocking.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

pub struct SpawnedChild {
    pub pid: u32,
    pub stdout: OwnedFd,
    pub stderr: OwnedFd,
}

/// Spawn `command` via the platform shell, matching the "shell-safe textual
/// command line" phrasing in spec.md §6: the out-of-scope plugin library
/// produces a string meant for shell interpretation, not an argv vector.
pub fn start_cmd(command: &str) -> io::Result<SpawnedChild> {
    let mut cmd = Command::new("/bin/sh");
    cmd.arg("-c").arg(command);
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    // SAFETY: setpgid(0, 0) is async-signal-safe and touches only the
    // calling (post-fork, pre-exec) process.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    let stdout: OwnedFd = child.stdout.take().expect("stdout piped").into();
    let stderr: OwnedFd = child.stderr.take().expect("stderr piped").into();

    set_nonblocking(stdout.as_raw_fd())?;
    set_nonblocking(stderr.as_raw_fd())?;

    // `child` is intentionally dropped here without waiting: this worker
    // reaps exclusively through `wait4` in `worker::reap_jobs`, never
    // through `std::process::Child::wait`.
    std::mem::drop(child);

    Ok(SpawnedChild { pid, stdout, stderr })
}

fn set_nonblocking(fd: std::os::fd::RawFd) -> io::Result<()> {
    use nix::fcntl::{fcntl, FcntlArg, OFlag};
    let flags = fcntl(fd, FcntlArg::F_GETFL)?;
    let mut oflags = OFlag::from_bits_truncate(flags);
    oflags.insert(OFlag::O_NONBLOCK);
    fcntl(fd, FcntlArg::F_SETFL(oflags))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn start_cmd_spawns_and_pipes_output() {
        let spawned = start_cmd("echo hi").expect("spawn");
        assert!(spawned.pid > 0);
        std::thread::sleep(std::time::Duration::from_millis(50));
        let mut out = String::new();
        let mut f = std::fs::File::from(spawned.stdout);
        // Non-blocking read may return WouldBlock; retry briefly.
        for _ in 0..20 {
            match f.read_to_string(&mut out) {
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    std::thread::sleep(std::time::Duration::from_millis(10));
                }
                Err(e) => panic!("unexpected error: {e}"),
            }
        }
        assert_eq!(out, "hi\n");
        unsafe {
            libc::waitpid(spawned.pid as libc::pid_t, std::ptr::null_mut(), 0);
        }
    }

    #[test]
    fn spawned_child_is_its_own_process_group_leader() {
        let spawned = start_cmd("sleep 0.2").expect("spawn");
        let pgid = unsafe { libc::getpgid(spawned.pid as libc::pid_t) };
        assert_eq!(pgid, spawned.pid as libc::pid_t);
        unsafe {
            libc::kill(spawned.pid as libc::pid_t, libc::SIGKILL);
            libc::waitpid(spawned.pid as libc::pid_t, std::ptr::null_mut(), 0);
        }
    }
}
