//! Termination-signal handling shared by both platforms.
//!
//! Handlers are registered per [`Signal`] in a [`SignalRegistry`] and looked
//! up afresh on every delivery, so they can be swapped while the handler is
//! running. Delivery is either native (`sigaction` on unix) or emulated with
//! disposable sentinel processes; see [`SignalHandler`].

mod emulated;
mod interrupt;
#[cfg(unix)]
mod native;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use once_cell::sync::Lazy;
use signal_hook::consts::{SIGABRT, SIGINT, SIGTERM};
use thiserror::Error;
use tracing::warn;

use crate::error::DaemonResult;
use crate::platform::Strategy;

pub use interrupt::{Interrupt, PendingSignal};

/// Sentinel numeric value meaning "ignore this signal".
pub const IGNORE_SIGNAL: i32 = 1793;

/// The three termination-class signals the handler manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Int,
    Term,
    Abrt,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Int, Signal::Term, Signal::Abrt];

    /// Platform numeric value.
    pub const fn number(self) -> i32 {
        match self {
            Signal::Int => SIGINT,
            Signal::Term => SIGTERM,
            Signal::Abrt => SIGABRT,
        }
    }

    pub fn from_number(signum: i32) -> Option<Self> {
        Signal::ALL.into_iter().find(|s| s.number() == signum)
    }
}

impl From<Signal> for i32 {
    fn from(signal: Signal) -> i32 {
        signal.number()
    }
}

impl TryFrom<i32> for Signal {
    type Error = i32;

    fn try_from(signum: i32) -> Result<Self, i32> {
        Signal::from_number(signum).ok_or(signum)
    }
}

/// Raised by the default handler when a signal arrives.
///
/// Daemon code receives it from [`SignalHandler::check`] or
/// [`SignalHandler::wait`] and can propagate it with `?`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ReceivedSignal {
    #[error("received SIGINT")]
    Int,
    #[error("received SIGTERM")]
    Term,
    #[error("received SIGABRT")]
    Abrt,
    #[error("received signal {0}")]
    Other(i32),
}

impl ReceivedSignal {
    pub fn from_signum(signum: i32) -> Self {
        match Signal::from_number(signum) {
            Some(signal) => signal.into(),
            None => ReceivedSignal::Other(signum),
        }
    }

    pub fn signum(self) -> i32 {
        match self {
            ReceivedSignal::Int => SIGINT,
            ReceivedSignal::Term => SIGTERM,
            ReceivedSignal::Abrt => SIGABRT,
            ReceivedSignal::Other(signum) => signum,
        }
    }

    pub fn signal(self) -> Option<Signal> {
        Signal::from_number(self.signum())
    }
}

impl From<Signal> for ReceivedSignal {
    fn from(signal: Signal) -> Self {
        match signal {
            Signal::Int => ReceivedSignal::Int,
            Signal::Term => ReceivedSignal::Term,
            Signal::Abrt => ReceivedSignal::Abrt,
        }
    }
}

impl From<ReceivedSignal> for i32 {
    fn from(signal: ReceivedSignal) -> i32 {
        signal.signum()
    }
}

impl PartialEq<i32> for ReceivedSignal {
    fn eq(&self, other: &i32) -> bool {
        self.signum() == *other
    }
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A signal handler: called with the numeric signal.
pub type Callback = Arc<dyn Fn(i32) -> HandlerResult + Send + Sync>;

/// What to do when a signal arrives.
#[derive(Clone, Default)]
pub enum HandlerSpec {
    /// Raise the matching [`ReceivedSignal`] in the main thread.
    #[default]
    Default,
    /// Do nothing.
    Ignore,
    Custom(Callback),
}

impl HandlerSpec {
    pub fn custom<F>(handler: F) -> Self
    where
        F: Fn(i32) -> HandlerResult + Send + Sync + 'static,
    {
        HandlerSpec::Custom(Arc::new(handler))
    }

    /// Maps the numeric ignore sentinel to [`HandlerSpec::Ignore`].
    pub fn from_code(code: Option<i32>) -> Option<Self> {
        match code {
            None => Some(HandlerSpec::Default),
            Some(IGNORE_SIGNAL) => Some(HandlerSpec::Ignore),
            Some(_) => None,
        }
    }
}

impl fmt::Debug for HandlerSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandlerSpec::Default => f.write_str("Default"),
            HandlerSpec::Ignore => f.write_str("Ignore"),
            HandlerSpec::Custom(_) => f.write_str("Custom(Fn)"),
        }
    }
}

static NOOP: Lazy<Callback> = Lazy::new(|| {
    let noop: Callback = Arc::new(|_: i32| -> HandlerResult { Ok(()) });
    noop
});

/// The shared no-op handler.
pub fn noop() -> Callback {
    Arc::clone(&NOOP)
}

/// Resolves a spec to the callable it stands for.
pub fn normalize(spec: HandlerSpec, default: &Callback) -> Callback {
    match spec {
        HandlerSpec::Default => Arc::clone(default),
        HandlerSpec::Ignore => noop(),
        HandlerSpec::Custom(handler) => handler,
    }
}

#[derive(Clone)]
struct HandlerTable {
    int: Callback,
    term: Callback,
    abrt: Callback,
}

impl HandlerTable {
    fn slot(&self, signal: Signal) -> &Callback {
        match signal {
            Signal::Int => &self.int,
            Signal::Term => &self.term,
            Signal::Abrt => &self.abrt,
        }
    }

    fn slot_mut(&mut self, signal: Signal) -> &mut Callback {
        match signal {
            Signal::Int => &mut self.int,
            Signal::Term => &mut self.term,
            Signal::Abrt => &mut self.abrt,
        }
    }
}

/// Handler slots for SIGINT, SIGTERM and SIGABRT.
#[derive(Clone)]
pub struct SignalRegistry {
    table: Arc<ArcSwap<HandlerTable>>,
    default: Callback,
}

impl SignalRegistry {
    /// Creates a registry with every slot set to `default`.
    pub fn new(default: Callback) -> Self {
        let table = HandlerTable {
            int: Arc::clone(&default),
            term: Arc::clone(&default),
            abrt: Arc::clone(&default),
        };
        SignalRegistry {
            table: Arc::new(ArcSwap::from_pointee(table)),
            default,
        }
    }

    pub fn set(&self, signal: Signal, spec: HandlerSpec) {
        let handler = normalize(spec, &self.default);
        self.table.rcu(|table| {
            let mut table = HandlerTable::clone(table);
            *table.slot_mut(signal) = Arc::clone(&handler);
            table
        });
    }

    pub fn get(&self, signal: Signal) -> Callback {
        Arc::clone(self.table.load().slot(signal))
    }

    /// Puts the default handler back.
    pub fn clear(&self, signal: Signal) {
        self.set(signal, HandlerSpec::Default);
    }

    pub fn default_handler(&self) -> &Callback {
        &self.default
    }

    /// Runs the current handler for `signum`; unknown numbers go to the
    /// default handler.
    pub fn dispatch(&self, signum: i32) -> HandlerResult {
        let handler = match Signal::from_number(signum) {
            Some(signal) => self.get(signal),
            None => Arc::clone(&self.default),
        };
        handler(signum)
    }
}

impl fmt::Debug for SignalRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalRegistry").finish_non_exhaustive()
    }
}

enum Delivery {
    #[cfg(unix)]
    Native(native::NativeDelivery),
    Emulated(emulated::SentinelDelivery),
}

/// Routes SIGINT, SIGTERM and SIGABRT to registered handlers.
///
/// With the default handler a signal becomes a [`ReceivedSignal`] that the
/// main thread picks up through [`check`](Self::check) or
/// [`wait`](Self::wait). Create the handler on the main thread.
///
/// Under [`Strategy::Spawn`] the PID file records the current sentinel
/// process rather than the daemon itself; [`crate::pidfile::send`] still
/// reaches the handler. Call [`crate::helper_main`] first thing in `main`
/// so sentinels can start.
pub struct SignalHandler {
    registry: SignalRegistry,
    pending: Arc<PendingSignal>,
    pid_file: PathBuf,
    delivery: Delivery,
}

impl SignalHandler {
    /// Creates a handler for the detected platform strategy.
    pub fn new<P: Into<PathBuf>>(pid_file: P) -> DaemonResult<Self> {
        Self::with_strategy(pid_file, Strategy::detect())
    }

    pub fn with_strategy<P: Into<PathBuf>>(pid_file: P, strategy: Strategy) -> DaemonResult<Self> {
        let pid_file = pid_file.into();
        let pending = Arc::new(PendingSignal::for_current_thread());
        let raise_in_main: Arc<dyn Interrupt> = pending.clone();
        let default: Callback = Arc::new(move |signum: i32| -> HandlerResult {
            raise_in_main.interrupt(ReceivedSignal::from_signum(signum))?;
            Ok(())
        });
        let registry = SignalRegistry::new(default);

        let delivery = match strategy {
            #[cfg(unix)]
            Strategy::Fork => Delivery::Native(native::NativeDelivery::new()),
            #[cfg(not(unix))]
            Strategy::Fork => return Err(crate::DaemonError::Unsupported("native signal delivery")),
            Strategy::Spawn => {
                Delivery::Emulated(emulated::SentinelDelivery::new(pid_file.clone()))
            }
        };

        Ok(SignalHandler {
            registry,
            pending,
            pid_file,
            delivery,
        })
    }

    /// Sets the handler for `signal`; takes effect on the next delivery.
    pub fn set(&self, signal: Signal, spec: HandlerSpec) {
        self.registry.set(signal, spec);
    }

    pub fn get(&self, signal: Signal) -> Callback {
        self.registry.get(signal)
    }

    pub fn clear(&self, signal: Signal) {
        self.registry.clear(signal);
    }

    pub fn registry(&self) -> &SignalRegistry {
        &self.registry
    }

    pub fn pid_file(&self) -> &Path {
        &self.pid_file
    }

    /// Starts delivering signals. Starting twice without stopping is an
    /// error.
    pub fn start(&self) -> DaemonResult<()> {
        match &self.delivery {
            #[cfg(unix)]
            Delivery::Native(native) => native.start(&self.registry),
            Delivery::Emulated(emulated) => {
                emulated.start(&self.registry, Arc::clone(&self.pending))
            }
        }
    }

    /// Stops delivering signals and restores the previous state. Safe to
    /// call repeatedly.
    pub fn stop(&self) -> DaemonResult<()> {
        match &self.delivery {
            #[cfg(unix)]
            Delivery::Native(native) => native.stop(),
            Delivery::Emulated(emulated) => emulated.stop(),
        }
    }

    pub fn is_running(&self) -> bool {
        match &self.delivery {
            #[cfg(unix)]
            Delivery::Native(native) => native.is_running(),
            Delivery::Emulated(emulated) => emulated.is_running(),
        }
    }

    /// Returns the signal raised by a default handler since the last call,
    /// if any.
    pub fn check(&self) -> Result<(), ReceivedSignal> {
        match self.pending.take() {
            Some(signal) => Err(signal),
            None => Ok(()),
        }
    }

    /// Blocks until a default handler raises a signal or `timeout` passes.
    /// `None` waits indefinitely.
    pub fn wait(&self, timeout: Option<Duration>) -> Result<(), ReceivedSignal> {
        match self.pending.wait(timeout) {
            Some(signal) => Err(signal),
            None => Ok(()),
        }
    }
}

impl Drop for SignalHandler {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop signal handler");
        }
    }
}

impl fmt::Debug for SignalHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalHandler")
            .field("pid_file", &self.pid_file)
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

/// The injection failure inside a handler error, if that is what it is.
pub(crate) fn injection_failure(
    err: &(dyn std::error::Error + Send + Sync + 'static),
) -> Option<crate::error::InjectionError> {
    err.downcast_ref::<crate::error::InjectionError>().copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn recorder() -> (Callback, Arc<Mutex<Vec<i32>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Callback = Arc::new(move |signum: i32| -> HandlerResult {
            sink.lock().unwrap().push(signum);
            Ok(())
        });
        (handler, seen)
    }

    #[test]
    fn normalization() {
        let (default, _) = recorder();
        let (custom, _) = recorder();

        assert!(Arc::ptr_eq(&normalize(HandlerSpec::Default, &default), &default));
        assert!(Arc::ptr_eq(&normalize(HandlerSpec::Ignore, &default), &noop()));
        assert!(Arc::ptr_eq(
            &normalize(HandlerSpec::Custom(custom.clone()), &default),
            &custom
        ));
    }

    #[test]
    fn ignore_code_maps_to_ignore() {
        assert!(matches!(
            HandlerSpec::from_code(Some(IGNORE_SIGNAL)),
            Some(HandlerSpec::Ignore)
        ));
        assert!(matches!(HandlerSpec::from_code(None), Some(HandlerSpec::Default)));
        assert!(HandlerSpec::from_code(Some(3)).is_none());
    }

    #[test]
    fn dispatch_reaches_only_the_matching_slot() {
        let (default, defaults) = recorder();
        let registry = SignalRegistry::new(default);
        let mut logs = Vec::new();
        for signal in Signal::ALL {
            let (handler, seen) = recorder();
            registry.set(signal, HandlerSpec::Custom(handler));
            logs.push(seen);
        }

        for signal in Signal::ALL {
            registry.dispatch(signal.number()).unwrap();
        }

        for (signal, seen) in Signal::ALL.iter().zip(&logs) {
            assert_eq!(*seen.lock().unwrap(), vec![signal.number()]);
        }
        assert!(defaults.lock().unwrap().is_empty());
    }

    #[test]
    fn unknown_numbers_use_the_default() {
        let (default, defaults) = recorder();
        let registry = SignalRegistry::new(default);
        registry.set(Signal::Term, HandlerSpec::Ignore);

        registry.dispatch(99).unwrap();
        registry.dispatch(Signal::Term.number()).unwrap();
        assert_eq!(*defaults.lock().unwrap(), vec![99]);
    }

    #[test]
    fn clearing_restores_default() {
        let (default, _) = recorder();
        let registry = SignalRegistry::new(default.clone());
        registry.set(Signal::Int, HandlerSpec::Ignore);
        registry.clear(Signal::Int);
        assert!(Arc::ptr_eq(&registry.get(Signal::Int), &default));
    }

    #[test]
    fn received_signal_converts_both_ways() {
        let term = ReceivedSignal::from_signum(SIGTERM);
        assert_eq!(term, ReceivedSignal::Term);
        assert_eq!(i32::from(term), SIGTERM);
        assert!(term == SIGTERM);
        assert_eq!(term.signal(), Some(Signal::Term));
        assert_eq!(ReceivedSignal::from_signum(99), ReceivedSignal::Other(99));
        assert_eq!(Signal::try_from(99), Err(99));
    }
}
