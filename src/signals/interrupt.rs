//! Raising a received signal in the main thread.
//!
//! Rust has no way to throw into another thread, so delivery is
//! cooperative: the handler parks the signal in a slot and unparks the
//! target thread, which surfaces it at its next `check` or `wait`.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::thread::{self, Thread};
use std::time::{Duration, Instant};

use crate::error::InjectionError;
use crate::signals::ReceivedSignal;

const EMPTY: i64 = i64::MIN;
const PARK_SLICE: Duration = Duration::from_millis(50);

/// Interrupts a target thread's current operation with a typed cause.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self, cause: ReceivedSignal) -> Result<(), InjectionError>;
}

/// Pending-signal slot owned by one target thread.
///
/// `interrupt` only touches atomics and `Thread::unpark`, so it may run from
/// a signal trampoline.
#[derive(Debug)]
pub struct PendingSignal {
    slot: AtomicI64,
    closed: AtomicBool,
    target: Thread,
}

impl PendingSignal {
    /// Targets the calling thread.
    pub fn for_current_thread() -> Self {
        PendingSignal {
            slot: AtomicI64::new(EMPTY),
            closed: AtomicBool::new(false),
            target: thread::current(),
        }
    }

    /// Removes and returns the pending signal.
    pub fn take(&self) -> Option<ReceivedSignal> {
        match self.slot.swap(EMPTY, Ordering::AcqRel) {
            EMPTY => None,
            signum => Some(ReceivedSignal::from_signum(signum as i32)),
        }
    }

    /// Waits for a signal for at most `timeout` (`None`: forever).
    pub fn wait(&self, timeout: Option<Duration>) -> Option<ReceivedSignal> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            if let Some(signal) = self.take() {
                return Some(signal);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    (deadline - now).min(PARK_SLICE)
                }
                None => PARK_SLICE,
            };
            thread::park_timeout(slice);
        }
    }

    /// Marks the target as finished; later interrupts fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl Interrupt for PendingSignal {
    fn interrupt(&self, cause: ReceivedSignal) -> Result<(), InjectionError> {
        let signum = cause.signum();
        if self.is_closed() {
            return Err(InjectionError { signum });
        }
        // The earliest unconsumed signal wins; later ones coalesce into it.
        let _ = self.slot.compare_exchange(
            EMPTY,
            i64::from(signum),
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        self.target.unpark();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn take_empties_the_slot() {
        let pending = PendingSignal::for_current_thread();
        pending.interrupt(ReceivedSignal::Term).unwrap();
        assert_eq!(pending.take(), Some(ReceivedSignal::Term));
        assert_eq!(pending.take(), None);
    }

    #[test]
    fn wait_wakes_on_interrupt_from_another_thread() {
        let pending = Arc::new(PendingSignal::for_current_thread());
        let remote = Arc::clone(&pending);
        let sender = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.interrupt(ReceivedSignal::Int).unwrap();
        });

        let got = pending.wait(Some(Duration::from_secs(5)));
        sender.join().unwrap();
        assert_eq!(got, Some(ReceivedSignal::Int));
    }

    #[test]
    fn first_unconsumed_signal_is_kept() {
        let pending = PendingSignal::for_current_thread();
        pending.interrupt(ReceivedSignal::Int).unwrap();
        pending.interrupt(ReceivedSignal::Term).unwrap();
        assert_eq!(pending.take(), Some(ReceivedSignal::Int));
        assert_eq!(pending.take(), None);

        pending.interrupt(ReceivedSignal::Term).unwrap();
        assert_eq!(pending.take(), Some(ReceivedSignal::Term));
    }

    #[test]
    fn wait_times_out() {
        let pending = PendingSignal::for_current_thread();
        assert_eq!(pending.wait(Some(Duration::from_millis(10))), None);
    }

    #[test]
    fn closed_target_rejects_injection() {
        let pending = PendingSignal::for_current_thread();
        pending.close();
        let err = pending.interrupt(ReceivedSignal::Abrt).unwrap_err();
        assert_eq!(err.signum, ReceivedSignal::Abrt.signum());
    }
}
