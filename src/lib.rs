//! # forkish
//!
//! **forkish** turns the running program into a daemon and routes SIGINT,
//! SIGTERM and SIGABRT to handlers, on unix and Windows alike, with a PID
//! file as the single point of contact.
//!
//! On unix daemonization is the classic double fork. Where `fork` does not
//! exist the program is re-invoked through a shielding worker and resumes
//! from a serialized envelope; signals are then emulated with sentinel
//! processes whose PID is what the PID file records. Pick the behaviour
//! with [`Strategy`]; [`Strategy::detect`] chooses the native one.
//!
//! Programs that may use [`Strategy::Spawn`] must call [`helper_main`]
//! first thing in `main`.
//!
//! ```no_run
//! use forkish::signals::SignalHandler;
//! use forkish::Daemon;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     forkish::helper_main();
//!     let port: u16 = Daemon::new("/tmp/app.pid").daemonize(8080)?;
//!
//!     let handler = SignalHandler::new("/tmp/app.pid")?;
//!     handler.start()?;
//!     println!("serving on {port}");
//!     loop {
//!         handler.wait(Some(std::time::Duration::from_secs(1)))?;
//!     }
//! }
//! ```

mod daemon;
mod error;
pub mod exit_hook;
mod payload;
pub mod pidfile;
mod platform;
#[cfg(unix)]
mod reaper;
mod roles;
pub mod signals;
mod spawn;
pub mod stdio;
mod sys;

// Re-export public types to keep the API flat
pub use daemon::{Branch, Daemon, Daemonizer};
pub use error::{DaemonError, DaemonResult, InjectionError, SignalError};
pub use pidfile::PidFile;
pub use platform::Strategy;
pub use roles::{READY_EXIT_CODE, Role, helper_main};
pub use signals::{ReceivedSignal, Signal, SignalHandler};
pub use spawn::Invocation;
pub use stdio::StreamTargets;
