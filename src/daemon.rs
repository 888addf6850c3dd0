use std::cell::Cell;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::platform::Strategy;
use crate::roles::{self, Role};
use crate::spawn::{self, Invocation};
use crate::stdio::StreamTargets;
use crate::sys;

/// Which side of a daemonization a process ended up on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Branch<A> {
    /// The original process. It must end soon without cleaning up.
    Caller,
    /// The daemon, holding the pass-through arguments.
    Daemon(A),
}

impl<A> Branch<A> {
    pub fn is_daemon(&self) -> bool {
        matches!(self, Branch::Daemon(_))
    }

    pub fn into_daemon(self) -> Option<A> {
        match self {
            Branch::Daemon(args) => Some(args),
            Branch::Caller => None,
        }
    }

    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Branch<B> {
        match self {
            Branch::Caller => Branch::Caller,
            Branch::Daemon(args) => Branch::Daemon(f(args)),
        }
    }
}

/// Main constructor to configure and launch the daemon process.
///
/// Everything that follows the first fork or spawn must already be decided
/// here, and all of it happens before any other thread is started.
#[derive(Debug, Clone)]
pub struct Daemon {
    pub(crate) pid_file: PathBuf,
    pub(crate) directory: PathBuf,
    pub(crate) streams: StreamTargets,
    pub(crate) umask: u32,
    pub(crate) shielded_fds: Vec<i32>,
    pub(crate) fd_fallback_limit: i32,
    pub(crate) startup_timeout: Duration,
    pub(crate) strip_cmd_args: bool,
    pub(crate) rescript: Option<Invocation>,
    pub(crate) strategy: Strategy,
}

impl Daemon {
    /// Creates a new configuration around the PID file at `pid_file`.
    ///
    /// # Defaults
    /// - Working directory: the current directory
    /// - Stdio: the null device
    /// - Umask: `0o027` (Unix)
    /// - Descriptor fallback limit: `1024` (Unix)
    /// - Startup timeout: 30 seconds (spawn strategy)
    /// - Strategy: [`Strategy::detect`]
    pub fn new<P: Into<PathBuf>>(pid_file: P) -> Self {
        Daemon {
            pid_file: pid_file.into(),
            directory: PathBuf::from("."),
            streams: StreamTargets::devnull(),
            umask: 0o027,
            shielded_fds: Vec::new(),
            fd_fallback_limit: 1024,
            startup_timeout: Duration::from_secs(30),
            strip_cmd_args: false,
            rescript: None,
            strategy: Strategy::detect(),
        }
    }

    // --- Public Getters ---

    pub fn pid_file_path(&self) -> &Path {
        &self.pid_file
    }

    pub fn working_directory_path(&self) -> &Path {
        &self.directory
    }

    pub fn stream_targets(&self) -> &StreamTargets {
        &self.streams
    }

    pub fn selected_strategy(&self) -> Strategy {
        self.strategy
    }

    // --- Builder Methods ---

    /// Sets the working directory for the daemon.
    pub fn working_directory<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.directory = path.into();
        self
    }

    /// Sets where standard input is read from.
    pub fn stdin<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.streams.stdin = path.into();
        self
    }

    /// Sets where standard output is appended to.
    pub fn stdout<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.streams.stdout = path.into();
        self
    }

    /// Sets where standard error is appended to.
    pub fn stderr<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.streams.stderr = path.into();
        self
    }

    pub fn streams(mut self, targets: StreamTargets) -> Self {
        self.streams = targets;
        self
    }

    /// (Unix) Sets the umask for the daemon process.
    pub fn umask(mut self, mask: u32) -> Self {
        self.umask = mask;
        self
    }

    /// (Unix) Keeps descriptor `fd` open across daemonization.
    pub fn shield_fd(mut self, fd: i32) -> Self {
        self.shielded_fds.push(fd);
        self
    }

    pub fn shield_fds<I: IntoIterator<Item = i32>>(mut self, fds: I) -> Self {
        self.shielded_fds.extend(fds);
        self
    }

    /// (Unix) Upper bound for descriptor closing when the descriptor limit is
    /// unlimited.
    pub fn fd_fallback_limit(mut self, limit: i32) -> Self {
        self.fd_fallback_limit = limit;
        self
    }

    /// How long the spawn strategy waits for the daemon to report readiness.
    pub fn startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    /// Spawned daemons get no command-line arguments instead of the caller's.
    pub fn strip_cmd_args(mut self, strip: bool) -> Self {
        self.strip_cmd_args = strip;
        self
    }

    /// Starts the spawned daemon as `program args...` instead of re-running
    /// the current command line.
    pub fn rescript<P, I, S>(mut self, program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<std::ffi::OsString>,
    {
        self.rescript = Some(Invocation::new(program, args));
        self
    }

    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Validates the configuration and makes every path absolute.
    ///
    /// Checks that the PID file directory exists and that the strategy is
    /// available on this platform.
    pub fn build(mut self) -> DaemonResult<Self> {
        if !self.strategy.is_available() {
            return Err(DaemonError::Unsupported("fork-based daemonization"));
        }

        self.pid_file = std::path::absolute(&self.pid_file)?;
        if self.pid_file.parent().is_some_and(|dir| !dir.exists()) {
            return Err(DaemonError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "PID file directory does not exist",
            )));
        }
        self.directory = std::path::absolute(&self.directory)?;
        self.streams = self.streams.absolute()?;
        if let Some(rescript) = &mut self.rescript {
            rescript.program = std::path::absolute(&rescript.program)?;
        }
        Ok(self)
    }

    /// Daemonizes and returns `args` in the daemon. The calling process never
    /// returns from a successful call.
    ///
    /// Call before starting any thread or async runtime.
    pub fn daemonize<A>(self, args: A) -> DaemonResult<A>
    where
        A: Serialize + DeserializeOwned,
    {
        match self.run(args, true)? {
            Branch::Daemon(args) => Ok(args),
            Branch::Caller => sys::exit_immediately(0),
        }
    }

    fn run<A>(self, args: A, exit_caller: bool) -> DaemonResult<Branch<A>>
    where
        A: Serialize + DeserializeOwned,
    {
        roles::helper_main();
        let daemon = self.build()?;
        match daemon.strategy {
            Strategy::Fork => daemon.fork(args, exit_caller),
            Strategy::Spawn => spawn::daemonize(&daemon, args, exit_caller),
        }
    }

    #[cfg(unix)]
    fn fork<A>(&self, args: A, exit_caller: bool) -> DaemonResult<Branch<A>> {
        Ok(sys::unix::start(self, exit_caller)?.map(|()| args))
    }

    #[cfg(not(unix))]
    fn fork<A>(&self, _args: A, _exit_caller: bool) -> DaemonResult<Branch<A>> {
        Err(DaemonError::Unsupported("fork-based daemonization"))
    }
}

/// Scoped daemonization that lets setup code run exactly once.
///
/// ```no_run
/// use forkish::{Branch, Daemon, Daemonizer};
///
/// forkish::helper_main();
/// Daemonizer::scope(|d| {
///     if d.is_setup() {
///         // Runs in the original process only.
///     }
///     match d.daemonize(Daemon::new("/tmp/app.pid"), 8080u16)? {
///         Branch::Caller => Ok(()),
///         Branch::Daemon(port) => {
///             println!("serving on {port}");
///             Ok(())
///         }
///     }
/// })
/// .unwrap();
/// ```
///
/// When the closure returns in the caller branch the process exits with
/// status `0`, or `2` if the closure failed or panicked.
#[derive(Debug)]
pub struct Daemonizer {
    setup: bool,
    used: Cell<bool>,
    caller: Cell<bool>,
}

impl Daemonizer {
    pub fn scope<T, F>(body: F) -> DaemonResult<T>
    where
        F: FnOnce(&Daemonizer) -> DaemonResult<T>,
    {
        let daemonizer = Daemonizer {
            setup: !matches!(Role::detect(), Role::Daemon(_)),
            used: Cell::new(false),
            caller: Cell::new(false),
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| body(&daemonizer)));

        if daemonizer.caller.get() {
            let code = match &outcome {
                Ok(Ok(_)) => 0,
                Ok(Err(e)) => {
                    error!(error = %e, "daemonization scope failed in the caller");
                    eprintln!("{e}");
                    2
                }
                Err(_) => 2,
            };
            sys::exit_immediately(code);
        }

        if !daemonizer.used.get() {
            warn!("daemonization scope closed without calling daemonize");
        }
        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// `true` unless this process is a spawned daemon re-running `main`.
    pub fn is_setup(&self) -> bool {
        self.setup
    }

    /// Daemonizes without ending the caller; see [`Branch`].
    pub fn daemonize<A>(&self, daemon: Daemon, args: A) -> DaemonResult<Branch<A>>
    where
        A: Serialize + DeserializeOwned,
    {
        if self.used.replace(true) {
            return Err(DaemonError::Usage("daemonize called twice in one scope"));
        }
        let branch = daemon.run(args, false)?;
        if matches!(branch, Branch::Caller) {
            self.caller.set(true);
        }
        Ok(branch)
    }
}
