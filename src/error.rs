use std::io;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Error type for every daemonization and signal-handling operation.
///
/// Everything except the signal variants is terminal for the daemonization
/// call that produced it: the process is never left half-daemonized.
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Standard IO errors (file creation, piping, etc.)
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The PID file is already held by another instance.
    ///
    /// Safe to retry once the competing instance has exited.
    #[error("daemon is already running (PID file {} exists)", path.display())]
    AlreadyRunning { path: PathBuf },

    /// The running installation cannot re-invoke itself.
    #[error("daemonization capability missing: {0}")]
    Capability(String),

    /// The spawned daemon never reported readiness.
    #[error("timed out after {0:?} waiting for the daemon to signal readiness")]
    StartupTimeout(Duration),

    /// The daemon creation worker ended without the readiness status.
    #[error("daemon creation worker exited prematurely ({0})")]
    WorkerExited(String),

    /// A system call failed (fork, setsid, dup2, ...).
    #[error("syscall '{call}' failed: {source}")]
    Syscall {
        call: &'static str,
        #[source]
        source: io::Error,
    },

    /// The payload envelope could not be encoded or decoded.
    #[error("payload envelope error: {0}")]
    Envelope(String),

    /// The PID file does not contain a process identifier.
    #[error("invalid PID file contents: {0:?}")]
    InvalidPid(String),

    /// The requested strategy does not exist on this platform.
    #[error("unsupported on this platform: {0}")]
    Unsupported(&'static str),

    /// The API was driven in an order it does not allow.
    #[error("usage error: {0}")]
    Usage(&'static str),

    #[error(transparent)]
    Signal(#[from] SignalError),

    /// (Windows) Specific Win32 API error code.
    #[cfg(windows)]
    #[error("Win32 API error code: {0}")]
    Win32(u32),
}

/// Errors raised by the signal handling layer.
#[derive(Debug, Error)]
pub enum SignalError {
    #[error("signal handler is already running")]
    AlreadyStarted,

    #[error("failed to install handler for signal {signum}: {source}")]
    Install {
        signum: i32,
        #[source]
        source: io::Error,
    },

    /// Previous handlers could not be put back; defaults were forced instead.
    #[error("failed to restore handler for signal {signum}: {source}")]
    Restore {
        signum: i32,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Injection(#[from] InjectionError),

    #[error("signal listener failed: {0}")]
    Listener(String),
}

/// A received signal could not be delivered to the main thread.
///
/// This is an internal fatal error: the listener stops when it sees one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("failed to raise signal {signum} in the main thread: target has finished")]
pub struct InjectionError {
    pub signum: i32,
}

impl From<bincode::Error> for DaemonError {
    fn from(err: bincode::Error) -> Self {
        DaemonError::Envelope(err.to_string())
    }
}

impl DaemonError {
    pub(crate) fn last_os(call: &'static str) -> Self {
        DaemonError::Syscall {
            call,
            source: io::Error::last_os_error(),
        }
    }
}

/// A specialized Result type for forkish operations.
pub type DaemonResult<T> = Result<T, DaemonError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locking_error_names_the_path() {
        let err = DaemonError::AlreadyRunning {
            path: PathBuf::from("/run/app.pid"),
        };
        assert!(err.to_string().contains("/run/app.pid"));
    }

    #[test]
    fn signal_errors_convert() {
        let err: DaemonError = SignalError::from(InjectionError { signum: 15 }).into();
        assert!(matches!(
            err,
            DaemonError::Signal(SignalError::Injection(InjectionError { signum: 15 }))
        ));
    }
}
