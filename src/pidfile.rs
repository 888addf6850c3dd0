//! PID file lock and record.
//!
//! The file holds one decimal process identifier followed by a newline. Its
//! content changes whenever the "signaling identity" changes: the spawned
//! daemon, the shielding worker and the emulated signal listener all write
//! into it over a daemon's lifetime, so readers should not assume it is
//! stable before the daemon is confirmed active.
//!
//! On unix the handle also holds a non-blocking `flock`. Windows has no
//! portable equivalent, so there the mere existence of the file is treated
//! as the lock. That is a weaker guarantee: a stale file from a crashed
//! daemon blocks startup until removed or overridden with `force`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DaemonError, DaemonResult};
use crate::sys;

/// An acquired PID file.
#[derive(Debug)]
pub struct PidFile {
    path: PathBuf,
    file: Option<File>,
}

impl PidFile {
    /// Opens `path` read-write, creating it.
    ///
    /// Fails with [`DaemonError::AlreadyRunning`] if the file already exists,
    /// unless `force` is set, in which case the existing file is reused.
    pub fn acquire<P: AsRef<Path>>(path: P, force: bool) -> DaemonResult<Self> {
        let path = path.as_ref().to_path_buf();

        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                if !force {
                    return Err(DaemonError::AlreadyRunning { path });
                }
                warn!(
                    path = %path.display(),
                    "PID file already exists; it will be overwritten once daemonization succeeds"
                );
                OpenOptions::new().read(true).write(true).open(&path)?
            }
            Err(e) => return Err(e.into()),
        };

        if !sys::try_lock_exclusive(&file)? {
            return Err(DaemonError::AlreadyRunning { path });
        }

        debug!(path = %path.display(), "acquired PID file");
        Ok(PidFile {
            path,
            file: Some(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open handle, if the file has not been closed or released.
    pub fn file(&self) -> Option<&File> {
        self.file.as_ref()
    }

    /// Replaces the file contents with `pid` and a trailing newline.
    pub fn write_pid(&mut self, pid: u32) -> DaemonResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or(DaemonError::Usage("PID file handle already closed"))?;
        write_record(file, pid)?;
        Ok(())
    }

    /// Records the current process.
    pub fn write_current(&mut self) -> DaemonResult<()> {
        self.write_pid(std::process::id())
    }

    /// Drops the handle but leaves the file in place.
    ///
    /// Used when ownership of the file passes to another process.
    pub fn close(&mut self) {
        self.file = None;
    }

    /// Closes the handle and deletes the file. Errors are swallowed, so
    /// calling this more than once is harmless.
    pub fn release(&mut self) {
        self.file = None;
        remove_quietly(&self.path);
    }
}

fn write_record(file: &mut File, pid: u32) -> io::Result<()> {
    file.seek(SeekFrom::Start(0))?;
    file.set_len(0)?;
    writeln!(file, "{pid}")?;
    file.flush()
}

/// Overwrites the PID file at `path` without holding a lock on it, creating
/// it if needed.
pub fn overwrite<P: AsRef<Path>>(path: P, pid: u32) -> io::Result<()> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    write_record(&mut file, pid)
}

/// Reads the process identifier stored at `path`.
pub fn read_pid<P: AsRef<Path>>(path: P) -> DaemonResult<u32> {
    let mut contents = String::new();
    File::open(path)?.read_to_string(&mut contents)?;
    contents
        .trim()
        .parse()
        .map_err(|_| DaemonError::InvalidPid(contents))
}

/// Sends `signal` to the process recorded in the PID file.
///
/// On Windows any non-zero signal terminates the target with the signal
/// number as its exit status, which is what the emulated signal listener
/// decodes.
pub fn send<P, S>(path: P, signal: S) -> DaemonResult<()>
where
    P: AsRef<Path>,
    S: Into<i32>,
{
    let pid = read_pid(path)?;
    let signum = signal.into();
    debug!(pid, signum, "sending signal");
    sys::send_signal(pid, signum).map_err(DaemonError::from)
}

/// Reports whether the process in the PID file can be signalled.
///
/// This is an approximate liveness check: a process that exited very
/// recently may still answer.
pub fn ping<P: AsRef<Path>>(path: P) -> bool {
    send(path, 0).is_ok()
}

/// Deletes `path`, ignoring a file that is already gone.
pub(crate) fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "removed PID file"),
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!(path = %path.display(), "PID file was removed before cleanup")
        }
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove PID file"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn acquire_release_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");

        let mut pid_file = PidFile::acquire(&path, false).unwrap();
        assert!(path.exists());

        let second = PidFile::acquire(&path, false);
        assert!(matches!(second, Err(DaemonError::AlreadyRunning { .. })));

        pid_file.release();
        assert!(!path.exists());
        pid_file.release();
    }

    #[test]
    fn write_replaces_longer_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");
        fs::write(&path, "garbage that is much longer than a pid\n\n\n").unwrap();

        let mut pid_file = PidFile::acquire(&path, true).unwrap();
        pid_file.write_pid(42).unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "42\n");
        assert_eq!(read_pid(&path).unwrap(), 42);
    }

    #[test]
    fn overwrite_creates_and_truncates() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");

        overwrite(&path, 123456).unwrap();
        overwrite(&path, 7).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "7\n");
    }

    #[test]
    fn write_after_close_is_a_usage_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");

        let mut pid_file = PidFile::acquire(&path, false).unwrap();
        pid_file.close();
        assert!(path.exists());
        assert!(matches!(pid_file.write_current(), Err(DaemonError::Usage(_))));
    }

    #[test]
    fn read_pid_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");
        fs::write(&path, "not a pid").unwrap();
        assert!(matches!(read_pid(&path), Err(DaemonError::InvalidPid(_))));
    }

    #[test]
    fn ping_finds_ourselves() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("app.pid");
        overwrite(&path, std::process::id()).unwrap();
        assert!(ping(&path));
        assert!(!ping(dir.path().join("missing.pid")));
    }
}
