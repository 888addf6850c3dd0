use std::fs::File;
use std::io;
use std::mem;
use std::os::unix::io::AsRawFd;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::{Child, Command, ExitStatus};
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::Mutex;
use tracing::{debug, error};

use crate::daemon::{Branch, Daemon};
use crate::error::{DaemonError, DaemonResult};
use crate::exit_hook;
use crate::pidfile::PidFile;
use crate::reaper;
use crate::signals::Signal;
use crate::stdio::{self, StdStream};

/// Classic double-fork daemonization.
///
/// With `exit_caller` the original process leaves through `_exit(0)`;
/// otherwise it gets [`Branch::Caller`] back and must `_exit` itself later.
/// Failures after the first fork end the child with status 1, which runs the
/// exit hooks and so removes the PID file.
pub(crate) fn start(daemon: &Daemon, exit_caller: bool) -> DaemonResult<Branch<()>> {
    let pid_file = PidFile::acquire(&daemon.pid_file, false)?;
    let mut shielded = daemon.shielded_fds.clone();
    if let Some(file) = pid_file.file() {
        shielded.push(file.as_raw_fd());
    }

    let pid_file = Arc::new(Mutex::new(pid_file));
    let cleanup = Arc::clone(&pid_file);
    let hook = exit_hook::register(move || cleanup.lock().release());

    // Fork 1
    super::flush_std();
    match unsafe { perform_fork() } {
        Ok(Fork::Parent) => {
            if exit_caller {
                exit_immediately(0);
            }
            return Ok(Branch::Caller);
        }
        Ok(Fork::Child) => {}
        Err(e) => {
            exit_hook::unregister(hook);
            pid_file.lock().release();
            return Err(e);
        }
    }

    if let Err(e) = detach(daemon, &pid_file, &shielded) {
        error!(error = %e, "daemonization failed after the first fork");
        std::process::exit(1);
    }
    Ok(Branch::Daemon(()))
}

fn detach(daemon: &Daemon, pid_file: &Mutex<PidFile>, shielded: &[i32]) -> DaemonResult<()> {
    std::env::set_current_dir(&daemon.directory)
        .map_err(|source| DaemonError::Syscall { call: "chdir", source })?;

    // New Session
    if unsafe { libc::setsid() } < 0 {
        return Err(DaemonError::last_os("setsid"));
    }
    set_umask(daemon.umask);

    // Fork 2: the grandchild can never reacquire a controlling terminal.
    super::flush_std();
    if let Fork::Parent = unsafe { perform_fork()? } {
        exit_immediately(0);
    }

    pid_file.lock().write_current()?;
    close_all_except(shielded, daemon.fd_fallback_limit);
    stdio::redirect_streams(&daemon.streams)?;

    debug!(pid = std::process::id(), "daemon detached");
    Ok(())
}

enum Fork {
    Parent,
    Child,
}

unsafe fn perform_fork() -> DaemonResult<Fork> {
    match unsafe { libc::fork() } {
        pid if pid < 0 => Err(DaemonError::last_os("fork")),
        0 => Ok(Fork::Child),
        _ => Ok(Fork::Parent),
    }
}

/// Closes every descriptor from 3 up to the descriptor limit, except
/// `shielded`.
///
/// The limit is the hard `RLIMIT_NOFILE`, else the soft one, else
/// `fallback_limit` when both are unlimited.
pub(crate) fn close_all_except(shielded: &[i32], fallback_limit: i32) {
    let stop = descriptor_limit(fallback_limit);
    for (low, high) in reaper::make_ranges(3, stop, shielded.iter().copied()) {
        close_range(low, high);
    }
}

fn descriptor_limit(fallback_limit: i32) -> i32 {
    let mut limit = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(libc::RLIMIT_NOFILE, &mut limit) } != 0 {
        return fallback_limit;
    }

    let chosen = if limit.rlim_max != libc::RLIM_INFINITY {
        limit.rlim_max
    } else if limit.rlim_cur != libc::RLIM_INFINITY {
        limit.rlim_cur
    } else {
        return fallback_limit;
    };
    i32::try_from(chosen).unwrap_or(i32::MAX)
}

fn close_range(low: i32, high: i32) {
    #[cfg(target_os = "linux")]
    {
        let closed = unsafe {
            libc::syscall(
                libc::SYS_close_range,
                low as libc::c_uint,
                (high - 1) as libc::c_uint,
                0 as libc::c_uint,
            )
        };
        if closed == 0 {
            return;
        }
    }

    for fd in low..high {
        // EBADF for descriptors that were never open is expected.
        unsafe { libc::close(fd) };
    }
}

pub(crate) fn set_umask(mask: u32) {
    unsafe { libc::umask(mask as libc::mode_t) };
}

/// Takes a non-blocking exclusive `flock`. `Ok(false)` means another
/// process holds it.
pub(crate) fn try_lock_exclusive(file: &File) -> io::Result<bool> {
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::EWOULDBLOCK) {
        Ok(false)
    } else {
        Err(err)
    }
}

pub(crate) fn send_signal(pid: u32, signum: i32) -> io::Result<()> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "PID out of range"))?;
    if unsafe { libc::kill(pid, signum) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn kill_process(pid: u32) -> io::Result<()> {
    send_signal(pid, libc::SIGKILL)
}

/// Tells the shielding worker that the daemon is up.
pub(crate) fn notify_ready(worker: u32) -> DaemonResult<()> {
    send_signal(worker, signal_hook::consts::SIGUSR1)
        .map_err(|source| DaemonError::Syscall { call: "kill", source })
}

/// Flag raised when [`notify_ready`] reaches this process.
pub(crate) fn arm_ready_flag() -> io::Result<Arc<AtomicBool>> {
    let ready = Arc::new(AtomicBool::new(false));
    signal_hook::flag::register(signal_hook::consts::SIGUSR1, Arc::clone(&ready))?;
    Ok(ready)
}

/// Starts the child in its own session.
pub(crate) fn detach_command(command: &mut Command) {
    unsafe {
        command.pre_exec(|| {
            if libc::setsid() < 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Puts INT, TERM and ABRT back to their default actions; ignored
/// dispositions survive `exec`.
pub(crate) fn reset_signal_dispositions() {
    for signal in Signal::ALL {
        unsafe { libc::signal(signal.number(), libc::SIG_DFL) };
    }
}

/// Blocks until `child` has exited without reaping it, so its PID cannot be
/// reused while the caller still refers to it.
pub(crate) fn await_exit(child: &Child) -> io::Result<()> {
    let mut info: libc::siginfo_t = unsafe { mem::zeroed() };
    loop {
        let rc = unsafe {
            libc::waitid(
                libc::P_PID,
                child.id() as libc::id_t,
                &mut info,
                libc::WEXITED | libc::WNOWAIT,
            )
        };
        if rc == 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

/// The signal a sentinel's exit status stands for.
pub(crate) fn received_signal(status: ExitStatus) -> i32 {
    status.signal().or_else(|| status.code()).unwrap_or(0)
}

pub(crate) fn has_std_streams() -> bool {
    (0..=2).any(|fd| unsafe { libc::fcntl(fd, libc::F_GETFD) } != -1)
}

pub(crate) fn replace_std_stream(stream: StdStream, file: &File) -> DaemonResult<()> {
    let target = match stream {
        StdStream::Stdin => libc::STDIN_FILENO,
        StdStream::Stdout => libc::STDOUT_FILENO,
        StdStream::Stderr => libc::STDERR_FILENO,
    };
    if unsafe { libc::dup2(file.as_raw_fd(), target) } < 0 {
        return Err(DaemonError::last_os("dup2"));
    }
    Ok(())
}

/// Leaves without running exit hooks or flushing anything but Rust's
/// standard streams.
pub(crate) fn exit_immediately(code: i32) -> ! {
    super::flush_std();
    unsafe { libc::_exit(code) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Stdio;

    #[test]
    fn descriptor_limit_is_positive() {
        assert!(descriptor_limit(1024) > 3);
    }

    #[test]
    fn lock_is_exclusive_across_descriptions() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let first = File::open(file.path()).unwrap();
        let second = File::open(file.path()).unwrap();
        assert!(try_lock_exclusive(&first).unwrap());
        assert!(!try_lock_exclusive(&second).unwrap());
    }

    #[test]
    fn killed_child_reports_sigkill_and_stays_waitable() {
        let mut child = Command::new("sleep")
            .arg("30")
            .stdin(Stdio::null())
            .spawn()
            .unwrap();
        kill_process(child.id()).unwrap();
        await_exit(&child).unwrap();

        let status = child.wait().unwrap();
        assert_eq!(received_signal(status), libc::SIGKILL);
    }

    #[test]
    fn plain_exit_code_is_used_without_a_signal() {
        let status = Command::new("sh").args(["-c", "exit 15"]).status().unwrap();
        assert_eq!(received_signal(status), 15);
    }
}
