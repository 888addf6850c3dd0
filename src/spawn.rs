//! Daemonization without `fork`.
//!
//! The caller hands the daemon's configuration to a shielding worker
//! through a payload channel. The worker starts the real daemon detached
//! and waits. The daemon resumes from its own envelope and then reports
//! readiness to the worker, which exits with [`READY_EXIT_CODE`]. The
//! caller only ever waits on the worker, so an interrupt aimed at the
//! spawning chain lands on a disposable process.
//!
//! The PID file changes hands along the way: the caller creates it, the
//! worker writes its PID, and the daemon finally writes its own.

use std::env;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::{self, Child, Command, ExitStatus, Stdio};
use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::daemon::{Branch, Daemon};
use crate::error::{DaemonError, DaemonResult};
use crate::exit_hook;
use crate::payload::{self, PayloadChannel};
use crate::pidfile::{self, PidFile};
use crate::roles::{self, READY_EXIT_CODE, Role};
use crate::stdio::{self, StreamTargets};
use crate::sys;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Program and arguments the spawned daemon is started with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub program: PathBuf,
    pub args: Vec<OsString>,
}

impl Invocation {
    pub fn new<P, I, S>(program: P, args: I) -> Self
    where
        P: Into<PathBuf>,
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Invocation {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// Everything the daemon needs to pick up where the caller left off.
#[derive(Debug, Serialize, Deserialize)]
struct ResumeState {
    pid_file: PathBuf,
    directory: PathBuf,
    streams: StreamTargets,
    umask: u32,
    args: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct WorkerEnvelope {
    spawner: u32,
    daemon_channel: PathBuf,
    invocation: Invocation,
    resume: ResumeState,
}

#[derive(Debug, Serialize, Deserialize)]
struct DaemonEnvelope {
    /// Process to notify once the daemon is up.
    parent: u32,
    resume: ResumeState,
}

/// Entry point for [`crate::Strategy::Spawn`].
///
/// In the spawned daemon this resumes from the envelope and returns the
/// pass-through arguments. Anywhere else it launches the daemon and either
/// exits (`exit_caller`) or returns [`Branch::Caller`].
pub(crate) fn daemonize<A>(daemon: &Daemon, args: A, exit_caller: bool) -> DaemonResult<Branch<A>>
where
    A: Serialize + DeserializeOwned,
{
    if let Role::Daemon(channel) = Role::detect() {
        let bytes = resume(&channel)?;
        return Ok(Branch::Daemon(bincode::deserialize(&bytes)?));
    }

    launch(daemon, &args)?;
    if exit_caller {
        sys::exit_immediately(0);
    }
    Ok(Branch::Caller)
}

fn launch<A: Serialize>(daemon: &Daemon, args: &A) -> DaemonResult<()> {
    let helper = env::current_exe()
        .map_err(|e| DaemonError::Capability(format!("cannot locate the running executable: {e}")))?;
    let invocation = invocation(daemon, &helper);
    check_capability(&helper, &invocation)?;

    let mut pid_file = PidFile::acquire(&daemon.pid_file, false)?;
    // The worker and then the daemon take it over by path.
    pid_file.close();

    let outcome = hand_off(daemon, &helper, invocation, args);
    if outcome.is_err() {
        pid_file.release();
    }
    outcome
}

fn invocation(daemon: &Daemon, helper: &Path) -> Invocation {
    if let Some(rescript) = &daemon.rescript {
        return rescript.clone();
    }
    let args = if daemon.strip_cmd_args {
        Vec::new()
    } else {
        env::args_os().skip(1).collect()
    };
    Invocation::new(helper, args)
}

fn check_capability(helper: &Path, invocation: &Invocation) -> DaemonResult<()> {
    if !helper.is_file() {
        return Err(DaemonError::Capability(format!(
            "helper executable {} is missing",
            helper.display()
        )));
    }
    if !invocation.program.is_file() {
        return Err(DaemonError::Capability(format!(
            "daemon program {} is missing",
            invocation.program.display()
        )));
    }
    Ok(())
}

fn hand_off<A: Serialize>(
    daemon: &Daemon,
    helper: &Path,
    invocation: Invocation,
    args: &A,
) -> DaemonResult<()> {
    let worker_channel = PayloadChannel::create()?;
    let daemon_channel = PayloadChannel::create()?;

    worker_channel.seal(&WorkerEnvelope {
        spawner: process::id(),
        daemon_channel: daemon_channel.path().to_path_buf(),
        invocation,
        resume: ResumeState {
            pid_file: daemon.pid_file.clone(),
            directory: daemon.directory.clone(),
            streams: daemon.streams.clone(),
            umask: daemon.umask,
            args: bincode::serialize(args)?,
        },
    })?;

    let mut command = Command::new(helper);
    roles::clean_env(&mut command)
        .env(roles::CREATE_DAEMON, worker_channel.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null());
    let mut worker = command.spawn()?;
    debug!(worker = worker.id(), "spawned daemon creation worker");

    let status = wait_with_timeout(&mut worker, daemon.startup_timeout)?;
    if status.code() != Some(READY_EXIT_CODE) {
        return Err(DaemonError::WorkerExited(status.to_string()));
    }

    info!(pid_file = %daemon.pid_file.display(), "daemon reported readiness");
    Ok(())
}

fn wait_with_timeout(worker: &mut Child, timeout: Duration) -> DaemonResult<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = worker.try_wait()? {
            return Ok(status);
        }
        if Instant::now() >= deadline {
            warn!(?timeout, "daemon did not report readiness in time");
            let _ = worker.kill();
            let _ = worker.wait();
            return Err(DaemonError::StartupTimeout(timeout));
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Body of the shielding worker. Returns the worker's exit status.
pub(crate) fn run_worker(channel: &Path) -> DaemonResult<i32> {
    let envelope: WorkerEnvelope = payload::unseal(channel)?;
    let me = process::id();
    debug!(spawner = envelope.spawner, "daemon creation worker started");

    pidfile::overwrite(&envelope.resume.pid_file, me)?;
    payload::seal(
        &envelope.daemon_channel,
        &DaemonEnvelope {
            parent: me,
            resume: envelope.resume,
        },
    )?;

    let ready = sys::arm_ready_flag()?;

    let mut command = Command::new(&envelope.invocation.program);
    command.args(&envelope.invocation.args);
    roles::clean_env(&mut command)
        .env(roles::INVOKE_DAEMON, &envelope.daemon_channel)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    sys::detach_command(&mut command);
    let mut daemon = command.spawn()?;
    debug!(daemon = daemon.id(), "spawned daemon");

    loop {
        if ready.load(Ordering::SeqCst) {
            return Ok(READY_EXIT_CODE);
        }
        if let Some(status) = daemon.try_wait()? {
            warn!(%status, "daemon exited before reporting readiness");
            return Ok(1);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Daemon side: applies the envelope, takes over the PID file and notifies
/// the worker. Returns the serialized pass-through arguments.
fn resume(channel: &Path) -> DaemonResult<Vec<u8>> {
    let DaemonEnvelope { parent, resume } = payload::unseal(channel)?;

    stdio::redirect_streams(&resume.streams)?;
    env::set_current_dir(&resume.directory)?;
    sys::set_umask(resume.umask);

    pidfile::overwrite(&resume.pid_file, process::id())?;
    let pid_file = resume.pid_file.clone();
    exit_hook::register(move || pidfile::remove_quietly(&pid_file));

    sys::notify_ready(parent)?;
    info!(pid = process::id(), "daemon resumed");
    Ok(resume.args)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_program_is_a_capability_error() {
        let helper = env::current_exe().unwrap();
        let invocation = Invocation::new("/definitely/not/here", Vec::<String>::new());
        let err = check_capability(&helper, &invocation).unwrap_err();
        assert!(matches!(err, DaemonError::Capability(_)));
    }

    #[test]
    fn stripped_invocation_has_no_arguments() {
        let helper = env::current_exe().unwrap();
        let daemon = Daemon::new("app.pid").strip_cmd_args(true);
        let invocation = invocation(&daemon, &helper);
        assert_eq!(invocation.program, helper);
        assert!(invocation.args.is_empty());
    }

    #[test]
    fn rescript_overrides_the_invocation() {
        let helper = env::current_exe().unwrap();
        let daemon = Daemon::new("app.pid").rescript("/usr/bin/env", ["true"]);
        let invocation = invocation(&daemon, &helper);
        assert_eq!(invocation, Invocation::new("/usr/bin/env", ["true"]));
    }

    #[test]
    fn daemon_envelope_survives_the_channel() {
        let channel = PayloadChannel::create().unwrap();
        channel
            .seal(&DaemonEnvelope {
                parent: 17,
                resume: ResumeState {
                    pid_file: "/run/app.pid".into(),
                    directory: "/".into(),
                    streams: StreamTargets::devnull(),
                    umask: 0o027,
                    args: bincode::serialize(&("port", 8080u16)).unwrap(),
                },
            })
            .unwrap();

        let read: DaemonEnvelope = payload::unseal(channel.path()).unwrap();
        assert_eq!(read.parent, 17);
        let args: (String, u16) = bincode::deserialize(&read.resume.args).unwrap();
        assert_eq!(args, ("port".to_string(), 8080));
    }
}
