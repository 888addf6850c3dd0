//! One-shot channel for handing a serialized envelope to a spawned process.
//!
//! The channel is a uniquely named file inside a private temporary
//! directory. Dropping the channel overwrites the file with zeros, removes
//! it and then removes the directory, so the envelope cannot be read back
//! after the hand-off. Every channel gets a fresh random name, which is what
//! makes concurrent use safe.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rand::Rng;
use rand::distributions::Alphanumeric;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tempfile::TempDir;
use tracing::{debug, error};

use crate::error::{DaemonError, DaemonResult};

/// Bumped whenever an envelope layout changes.
pub const ENVELOPE_VERSION: u16 = 1;

const STEM_LEN: usize = 22;

#[derive(Serialize, Deserialize)]
struct Sealed<T> {
    version: u16,
    body: T,
}

#[derive(Debug)]
pub struct PayloadChannel {
    dir: Option<TempDir>,
    path: PathBuf,
}

impl PayloadChannel {
    /// Creates the private directory and an empty channel file.
    pub fn create() -> DaemonResult<Self> {
        let dir = tempfile::Builder::new().prefix("forkish-").tempdir()?;
        let stem: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(STEM_LEN)
            .map(char::from)
            .collect();
        let path = dir.path().join(stem);
        File::create(&path)?;

        debug!(path = %path.display(), "opened payload channel");
        Ok(PayloadChannel {
            dir: Some(dir),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `body` into the channel.
    pub fn seal<T: Serialize>(&self, body: &T) -> DaemonResult<()> {
        seal(&self.path, body)
    }

    fn shred(&self) -> io::Result<()> {
        let mut file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        let len = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;
        io::copy(&mut io::repeat(0).take(len), &mut file)?;
        file.sync_all()?;
        drop(file);
        fs::remove_file(&self.path)
    }
}

impl Drop for PayloadChannel {
    fn drop(&mut self) {
        if let Err(e) = self.shred() {
            error!(path = %self.path.display(), error = %e, "failed to shred payload channel");
        }
        if let Some(dir) = self.dir.take()
            && let Err(e) = dir.close()
        {
            error!(error = %e, "failed to remove payload directory");
        }
    }
}

/// Writes a versioned envelope to `path`, replacing what was there.
pub fn seal<T: Serialize>(path: &Path, body: &T) -> DaemonResult<()> {
    let bytes = bincode::serialize(&Sealed {
        version: ENVELOPE_VERSION,
        body,
    })?;
    let mut file = OpenOptions::new()
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(&bytes)?;
    file.flush()?;
    Ok(())
}

/// Reads the envelope at `path`.
pub fn unseal<T: DeserializeOwned>(path: &Path) -> DaemonResult<T> {
    let bytes = fs::read(path)?;
    let sealed: Sealed<T> = bincode::deserialize(&bytes)?;
    if sealed.version != ENVELOPE_VERSION {
        return Err(DaemonError::Envelope(format!(
            "unsupported envelope version {} (expected {ENVELOPE_VERSION})",
            sealed.version
        )));
    }
    Ok(sealed.body)
}
