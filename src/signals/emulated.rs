//! Signal delivery through sentinel processes.
//!
//! A listener thread keeps one sentinel alive at a time and records its PID
//! in the PID file, so [`crate::pidfile::send`] hits the sentinel. When the
//! sentinel dies its exit status names the signal, the handler runs on the
//! listener thread, and a fresh sentinel takes its place.

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::thread::{self, JoinHandle, ThreadId};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::error::{DaemonResult, SignalError};
use crate::exit_hook::{self, HookId};
use crate::pidfile;
use crate::roles;
use crate::signals::{PendingSignal, SignalRegistry, injection_failure};
use crate::sys;

#[derive(Default)]
struct State {
    /// The live sentinel. Only killed while recorded here, so never after
    /// it has been reaped.
    sentinel: Option<u32>,
    /// First sentinel recorded and not yet torn down.
    started: bool,
    /// Listener fully unwound.
    stopped: bool,
    stop_requested: bool,
    failure: Option<SignalError>,
    listener: Option<ThreadId>,
}

struct Shared {
    pid_file: PathBuf,
    state: Mutex<State>,
    changed: Condvar,
}

impl Shared {
    fn request_stop(&self) {
        let mut state = self.state.lock();
        state.stop_requested = true;
        if let Some(pid) = state.sentinel
            && let Err(e) = sys::kill_process(pid)
        {
            debug!(pid, error = %e, "failed to kill sentinel");
        }
    }

    fn on_listener_thread(&self) -> bool {
        self.state.lock().listener == Some(thread::current().id())
    }

    fn wait_stopped(&self) {
        let mut state = self.state.lock();
        while !state.stopped {
            self.changed.wait(&mut state);
        }
    }

    /// Runs at process exit. A handler that exits the process runs this on
    /// the listener thread, which can never unwind to `stopped`; the daemon
    /// PID is restored directly instead.
    fn exit_teardown(&self, pending: &PendingSignal) {
        self.request_stop();
        if self.on_listener_thread() {
            if let Err(e) = pidfile::overwrite(&self.pid_file, process::id()) {
                warn!(error = %e, "failed to restore the daemon PID");
            }
        } else {
            self.wait_stopped();
        }
        pending.close();
    }
}

#[derive(Default)]
struct Ops {
    listener: Option<JoinHandle<()>>,
    hook: Option<HookId>,
}

pub(super) struct SentinelDelivery {
    shared: Arc<Shared>,
    ops: Mutex<Ops>,
}

impl SentinelDelivery {
    pub(super) fn new(pid_file: PathBuf) -> Self {
        SentinelDelivery {
            shared: Arc::new(Shared {
                pid_file,
                state: Mutex::new(State {
                    stopped: true,
                    ..State::default()
                }),
                changed: Condvar::new(),
            }),
            ops: Mutex::new(Ops::default()),
        }
    }

    /// Starts the listener and blocks until the first sentinel is recorded.
    pub(super) fn start(
        &self,
        registry: &SignalRegistry,
        pending: Arc<PendingSignal>,
    ) -> DaemonResult<()> {
        let mut ops = self.ops.lock();
        if ops.listener.is_some() {
            return Err(SignalError::AlreadyStarted.into());
        }

        *self.shared.state.lock() = State::default();

        let shared = Arc::clone(&self.shared);
        let registry = registry.clone();
        let handle = thread::Builder::new()
            .name("forkish-signals".into())
            .spawn(move || listen(&shared, &registry))?;

        let mut state = self.shared.state.lock();
        while !state.started && !state.stopped {
            self.shared.changed.wait(&mut state);
        }
        if !state.started {
            let failure = state
                .failure
                .take()
                .unwrap_or_else(|| SignalError::Listener("listener ended during startup".into()));
            drop(state);
            let _ = handle.join();
            return Err(failure.into());
        }
        drop(state);

        let shared = Arc::clone(&self.shared);
        ops.hook = Some(exit_hook::register(move || shared.exit_teardown(&pending)));
        ops.listener = Some(handle);
        debug!("emulated signal listener running");
        Ok(())
    }

    /// Stops the listener and waits for teardown.
    ///
    /// From a handler running on the listener thread only the request is
    /// made; a later `stop` from another thread reaps the listener.
    pub(super) fn stop(&self) -> DaemonResult<()> {
        if self.shared.on_listener_thread() {
            self.shared.request_stop();
            return Ok(());
        }

        let mut ops = self.ops.lock();
        let Some(handle) = ops.listener.take() else {
            return Ok(());
        };
        if let Some(hook) = ops.hook.take() {
            exit_hook::unregister(hook);
        }

        self.shared.request_stop();
        self.shared.wait_stopped();
        if handle.join().is_err() {
            return Err(SignalError::Listener("listener thread panicked".into()).into());
        }
        match self.shared.state.lock().failure.take() {
            Some(failure) => Err(failure.into()),
            None => Ok(()),
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.shared.state.lock().started
    }
}

fn listen(shared: &Shared, registry: &SignalRegistry) {
    shared.state.lock().listener = Some(thread::current().id());
    let outcome = run(shared, registry);
    if let Err(e) = &outcome {
        error!(error = %e, "signal listener stopped");
    }

    if let Err(e) = pidfile::overwrite(&shared.pid_file, process::id()) {
        warn!(error = %e, "failed to restore the daemon PID");
    }

    let mut state = shared.state.lock();
    state.failure = outcome.err();
    state.sentinel = None;
    state.listener = None;
    state.started = false;
    state.stopped = true;
    shared.changed.notify_all();
}

fn run(shared: &Shared, registry: &SignalRegistry) -> Result<(), SignalError> {
    loop {
        let mut sentinel = roles::sentinel_command()
            .and_then(|mut command| command.spawn())
            .map_err(|e| SignalError::Listener(format!("failed to spawn sentinel: {e}")))?;
        let pid = sentinel.id();

        {
            let mut state = shared.state.lock();
            if state.stop_requested {
                let _ = sentinel.kill();
                let _ = sentinel.wait();
                return Ok(());
            }
            if let Err(e) = pidfile::overwrite(&shared.pid_file, pid) {
                let _ = sentinel.kill();
                let _ = sentinel.wait();
                return Err(SignalError::Listener(format!("failed to record sentinel: {e}")));
            }
            state.sentinel = Some(pid);
            if !state.started {
                state.started = true;
                shared.changed.notify_all();
            }
        }
        debug!(pid, "sentinel recorded");

        let waited = sys::await_exit(&sentinel);
        let stopping = {
            let mut state = shared.state.lock();
            state.sentinel = None;
            state.stop_requested
        };
        let status = waited
            .and_then(|()| sentinel.wait())
            .map_err(|e| SignalError::Listener(format!("failed to wait for sentinel: {e}")))?;
        if stopping {
            return Ok(());
        }

        let signum = sys::received_signal(status);
        debug!(signum, "sentinel reported a signal");
        if let Err(err) = registry.dispatch(signum) {
            if let Some(failure) = injection_failure(err.as_ref()) {
                return Err(failure.into());
            }
            error!(signum, error = %err, "signal handler failed");
        }
    }
}
