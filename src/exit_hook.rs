//! Process-exit hooks.
//!
//! Hooks run when the process leaves through `exit` (returning from `main`
//! or `std::process::exit`), never through `_exit`. The fork branches that
//! must not clean up rely on that.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Once;
use std::sync::atomic::{AtomicU64, Ordering};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::{debug, warn};

type Hook = Box<dyn FnOnce() + Send>;

static HOOKS: Lazy<Mutex<Vec<(HookId, Hook)>>> = Lazy::new(|| Mutex::new(Vec::new()));
static NEXT_ID: AtomicU64 = AtomicU64::new(1);
static INSTALL: Once = Once::new();

/// Handle used to withdraw a registered hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HookId(u64);

/// Registers `hook` to run at normal process exit. Hooks run last-in,
/// first-out.
pub fn register<F>(hook: F) -> HookId
where
    F: FnOnce() + Send + 'static,
{
    INSTALL.call_once(|| {
        // SAFETY: `run_hooks` is a plain extern "C" fn with no arguments.
        if unsafe { libc::atexit(run_hooks) } != 0 {
            warn!("atexit registration failed; shutdown hooks will not run");
        }
    });

    let id = HookId(NEXT_ID.fetch_add(1, Ordering::Relaxed));
    HOOKS.lock().push((id, Box::new(hook)));
    id
}

/// Removes a hook; unknown ids are ignored.
pub fn unregister(id: HookId) {
    HOOKS.lock().retain(|(hook_id, _)| *hook_id != id);
}

/// Runs and drains every registered hook now.
fn run_now() {
    let hooks = std::mem::take(&mut *HOOKS.lock());
    for (id, hook) in hooks.into_iter().rev() {
        if panic::catch_unwind(AssertUnwindSafe(hook)).is_err() {
            warn!(hook = id.0, "exit hook panicked");
        }
    }
}

extern "C" fn run_hooks() {
    debug!("running exit hooks");
    run_now();
}
