use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::DaemonResult;
use crate::sys;

/// Path of the platform's null device.
#[cfg(unix)]
pub const NULL_DEVICE: &str = "/dev/null";
#[cfg(windows)]
pub const NULL_DEVICE: &str = "NUL";

/// One of the three standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

/// Where the standard streams go once the daemon is detached.
///
/// The same path may serve several roles; it is then opened once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamTargets {
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
}

impl Default for StreamTargets {
    fn default() -> Self {
        Self::devnull()
    }
}

impl StreamTargets {
    /// Sends every stream to the null device. Default option.
    pub fn devnull() -> Self {
        StreamTargets {
            stdin: PathBuf::from(NULL_DEVICE),
            stdout: PathBuf::from(NULL_DEVICE),
            stderr: PathBuf::from(NULL_DEVICE),
        }
    }

    fn target(&self, stream: StdStream) -> &Path {
        match stream {
            StdStream::Stdin => &self.stdin,
            StdStream::Stdout => &self.stdout,
            StdStream::Stderr => &self.stderr,
        }
    }

    pub(crate) fn absolute(self) -> io::Result<Self> {
        Ok(StreamTargets {
            stdin: absolute_target(self.stdin)?,
            stdout: absolute_target(self.stdout)?,
            stderr: absolute_target(self.stderr)?,
        })
    }
}

fn absolute_target(path: PathBuf) -> io::Result<PathBuf> {
    if path.as_os_str() == NULL_DEVICE {
        Ok(path)
    } else {
        std::path::absolute(path)
    }
}

/// Minimal access a target needs for the union of its roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    ReadWrite,
}

impl Access {
    fn for_stream(stream: StdStream) -> Self {
        match stream {
            StdStream::Stdin => Access::Read,
            StdStream::Stdout | StdStream::Stderr => Access::Write,
        }
    }

    fn union(self, other: Access) -> Self {
        if self == other { self } else { Access::ReadWrite }
    }

    fn open(self, path: &Path) -> io::Result<File> {
        let mut options = OpenOptions::new();
        match self {
            Access::Read => options.read(true),
            Access::Write => options.append(true),
            Access::ReadWrite => options.read(true).append(true),
        };
        options.open(path)
    }
}

/// One distinct target with the roles it serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenPlan {
    pub path: PathBuf,
    pub access: Access,
    pub roles: Vec<StdStream>,
}

/// Groups the targets by path, in first-seen order.
pub fn plan(targets: &StreamTargets) -> Vec<OpenPlan> {
    let mut plans: Vec<OpenPlan> = Vec::with_capacity(3);
    for stream in [StdStream::Stdin, StdStream::Stdout, StdStream::Stderr] {
        let path = targets.target(stream);
        let access = Access::for_stream(stream);
        match plans.iter_mut().find(|plan| plan.path == path) {
            Some(plan) => {
                plan.access = plan.access.union(access);
                plan.roles.push(stream);
            }
            None => plans.push(OpenPlan {
                path: path.to_path_buf(),
                access,
                roles: vec![stream],
            }),
        }
    }
    plans
}

/// Points the process's standard streams at `targets`, creating missing
/// files first.
pub fn redirect_streams(targets: &StreamTargets) -> DaemonResult<()> {
    let mut opened = Vec::with_capacity(3);
    for plan in plan(targets) {
        if !plan.path.exists() {
            OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(false)
                .open(&plan.path)?;
        }
        let file = plan.access.open(&plan.path)?;
        opened.push((plan, file));
    }

    if sys::has_std_streams() {
        let _ = io::stdout().flush();
        let _ = io::stderr().flush();
    } else {
        debug!("process has no standard streams; installing fresh ones");
    }

    for (plan, file) in &opened {
        for stream in &plan.roles {
            sys::replace_std_stream(*stream, file)?;
        }
        debug!(path = %plan.path.display(), roles = ?plan.roles, "redirected");
    }

    // The intermediate descriptors close here.
    drop(opened);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn targets(stdin: &str, stdout: &str, stderr: &str) -> StreamTargets {
        StreamTargets {
            stdin: stdin.into(),
            stdout: stdout.into(),
            stderr: stderr.into(),
        }
    }

    #[test]
    fn distinct_targets_open_separately() {
        let plans = plan(&targets("/in", "/out", "/err"));
        let accesses: Vec<_> = plans.iter().map(|p| p.access).collect();
        assert_eq!(accesses, vec![Access::Read, Access::Write, Access::Write]);
    }

    #[test]
    fn shared_input_and_output_opens_once_read_write() {
        let plans = plan(&targets("/shared", "/shared", "/err"));
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[0].access, Access::ReadWrite);
        assert_eq!(plans[0].roles, vec![StdStream::Stdin, StdStream::Stdout]);
    }

    #[test]
    fn shared_outputs_stay_write_only() {
        let plans = plan(&targets("/in", "/log", "/log"));
        assert_eq!(plans.len(), 2);
        assert_eq!(plans[1].access, Access::Write);
        assert_eq!(plans[1].roles, vec![StdStream::Stdout, StdStream::Stderr]);
    }

    #[test]
    fn devnull_is_a_single_read_write_target() {
        let plans = plan(&StreamTargets::devnull());
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].access, Access::ReadWrite);
    }
}
