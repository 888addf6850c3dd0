//! Platform back-ends. Both expose the same set of process primitives; the
//! unix one also carries the double-fork engine.

#[cfg(unix)]
pub(crate) mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub(crate) use unix::{
    arm_ready_flag, await_exit, detach_command, exit_immediately, has_std_streams, kill_process,
    notify_ready, received_signal, replace_std_stream, reset_signal_dispositions, send_signal,
    set_umask, try_lock_exclusive,
};
#[cfg(windows)]
pub(crate) use windows::{
    arm_ready_flag, await_exit, detach_command, exit_immediately, has_std_streams, kill_process,
    notify_ready, received_signal, replace_std_stream, reset_signal_dispositions, send_signal,
    set_umask, try_lock_exclusive,
};

/// Flushes Rust's buffered standard streams so their contents are not
/// duplicated into a forked child or lost by `_exit`.
pub(crate) fn flush_std() {
    use std::io::Write;
    let _ = std::io::stdout().flush();
    let _ = std::io::stderr().flush();
}
