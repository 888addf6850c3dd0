//! Native delivery through `sigaction`.
//!
//! Each installed handler is a trampoline that looks up the registry's
//! current handler at delivery time. Only one registry can be installed
//! per process.

use std::io;
use std::mem;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{DaemonResult, SignalError};
use crate::signals::{Signal, SignalRegistry};

static ACTIVE: Lazy<ArcSwapOption<SignalRegistry>> = Lazy::new(ArcSwapOption::empty);
static INSTALL_LOCK: Mutex<()> = parking_lot::const_mutex(());

extern "C" fn trampoline(signum: libc::c_int) {
    // Handler errors have nowhere to go from signal context.
    if let Some(registry) = &*ACTIVE.load() {
        let _ = registry.dispatch(signum);
    }
}

pub(super) struct NativeDelivery {
    previous: Mutex<Option<Vec<(i32, libc::sigaction)>>>,
}

impl NativeDelivery {
    pub(super) fn new() -> Self {
        NativeDelivery {
            previous: Mutex::new(None),
        }
    }

    pub(super) fn start(&self, registry: &SignalRegistry) -> DaemonResult<()> {
        let _installing = INSTALL_LOCK.lock();
        let mut previous = self.previous.lock();
        if previous.is_some() || ACTIVE.load().is_some() {
            return Err(SignalError::AlreadyStarted.into());
        }

        ACTIVE.store(Some(Arc::new(registry.clone())));

        let mut saved = Vec::with_capacity(Signal::ALL.len());
        for signal in Signal::ALL {
            let signum = signal.number();
            match install(signum) {
                Ok(old) => saved.push((signum, old)),
                Err(source) => {
                    for (signum, old) in saved.iter().rev() {
                        let _ = restore(*signum, old);
                    }
                    ACTIVE.store(None);
                    return Err(SignalError::Install { signum, source }.into());
                }
            }
        }

        *previous = Some(saved);
        debug!("installed native signal handlers");
        Ok(())
    }

    pub(super) fn stop(&self) -> DaemonResult<()> {
        let _installing = INSTALL_LOCK.lock();
        let Some(saved) = self.previous.lock().take() else {
            return Ok(());
        };

        let mut failure = None;
        for (signum, old) in &saved {
            if let Err(source) = restore(*signum, old) {
                failure.get_or_insert(SignalError::Restore {
                    signum: *signum,
                    source,
                });
            }
        }

        if failure.is_some() {
            warn!("could not restore previous signal handlers; forcing defaults");
            for (signum, _) in &saved {
                // SAFETY: SIG_DFL is always a valid disposition.
                unsafe { libc::signal(*signum, libc::SIG_DFL) };
            }
        }

        ACTIVE.store(None);
        debug!("restored previous signal handlers");
        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    pub(super) fn is_running(&self) -> bool {
        self.previous.lock().is_some()
    }
}

fn install(signum: i32) -> io::Result<libc::sigaction> {
    let handler: extern "C" fn(libc::c_int) = trampoline;
    // SAFETY: both structs are plain C data, fully initialised before use.
    unsafe {
        let mut action: libc::sigaction = mem::zeroed();
        action.sa_sigaction = handler as libc::sighandler_t;
        action.sa_flags = libc::SA_RESTART;
        libc::sigemptyset(&mut action.sa_mask);

        let mut old: libc::sigaction = mem::zeroed();
        if libc::sigaction(signum, &action, &mut old) != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(old)
    }
}

fn restore(signum: i32, old: &libc::sigaction) -> io::Result<()> {
    // SAFETY: `old` was filled in by a previous sigaction call.
    if unsafe { libc::sigaction(signum, old, std::ptr::null_mut()) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}
