//! Process roles selected through environment flags.
//!
//! A program using [`crate::Strategy::Spawn`] is re-invoked in three helper
//! roles besides its normal one. The flag names the role and, where a role
//! needs input, carries the path of its payload channel.

use std::env;
use std::io;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;

use tracing::error;

use crate::spawn;
use crate::sys;

/// Set on the spawned daemon; value is its payload channel.
pub(crate) const INVOKE_DAEMON: &str = "__FORKISH_INVOKE_DAEMON__";
/// Set on the shielding worker; value is its payload channel.
pub(crate) const CREATE_DAEMON: &str = "__FORKISH_CREATE_DAEMON__";
/// Set on signal sentinels.
pub(crate) const CREATE_SIGHANDLER: &str = "__FORKISH_CREATE_SIGHANDLER__";

const FLAGS: [&str; 3] = [INVOKE_DAEMON, CREATE_DAEMON, CREATE_SIGHANDLER];

/// Exit status of a shielding worker whose daemon reported readiness.
pub const READY_EXIT_CODE: i32 = 93;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Role {
    /// Ordinary invocation.
    Caller,
    /// Spawned daemon resuming from the envelope at this path.
    Daemon(PathBuf),
    /// Shielding worker reading its envelope from this path.
    Worker(PathBuf),
    /// Disposable signal sentinel.
    Sentinel,
}

impl Role {
    pub fn detect() -> Self {
        if env::var_os(CREATE_SIGHANDLER).is_some() {
            Role::Sentinel
        } else if let Some(path) = env::var_os(CREATE_DAEMON) {
            Role::Worker(path.into())
        } else if let Some(path) = env::var_os(INVOKE_DAEMON) {
            Role::Daemon(path.into())
        } else {
            Role::Caller
        }
    }
}

/// Strips every role flag from the environment `command` will inherit.
pub(crate) fn clean_env(command: &mut Command) -> &mut Command {
    for flag in FLAGS {
        command.env_remove(flag);
    }
    command
}

/// Runs the helper role this process was started for and exits; returns
/// immediately in any other role.
///
/// Call this first thing in `main` of any program that uses
/// [`crate::Strategy::Spawn`], before parsing arguments or starting threads.
pub fn helper_main() {
    match Role::detect() {
        Role::Worker(channel) => {
            let code = spawn::run_worker(&channel).unwrap_or_else(|e| {
                error!(error = %e, "daemon creation worker failed");
                eprintln!("forkish worker: {e}");
                1
            });
            std::process::exit(code);
        }
        Role::Sentinel => sentinel(),
        Role::Caller | Role::Daemon(_) => {}
    }
}

/// Command that starts a sentinel for the running executable.
pub(crate) fn sentinel_command() -> io::Result<Command> {
    let mut command = Command::new(env::current_exe()?);
    clean_env(&mut command)
        .env(CREATE_SIGHANDLER, "1")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    Ok(command)
}

fn sentinel() -> ! {
    sys::reset_signal_dispositions();
    loop {
        thread::park();
    }
}
