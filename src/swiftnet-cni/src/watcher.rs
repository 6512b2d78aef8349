//! Deferred-delete queue
//!
//! When the address manager is unreachable during a DEL, the release is
//! parked in a well-known directory on the host: one file per pending
//! release, filename carrying the pod interface id, contents carrying the
//! container id. A separate process drains the directory and re-issues
//! each release once the service is reachable again. An enqueue that
//! returns success guarantees the release will be retried at least once.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use tracing::info;

/// Queue directory drained by the deferred-delete loop
pub const DELETE_QUEUE_DIR: &str = "/var/run/swiftnet/cni/deleteIDs";

/// Lock file for concurrent plugin invocations
const LOCK_FILE: &str = ".lock";

/// Sink for releases that could not be completed synchronously
pub trait DeleteWatcher {
    fn enqueue(&self, pod_interface_id: &str, container_id: &str) -> io::Result<()>;
}

/// Filesystem-backed queue with crash-safe enqueue
pub struct FsDeleteWatcher {
    dir: PathBuf,
}

impl FsDeleteWatcher {
    pub fn new() -> Self {
        Self {
            dir: PathBuf::from(DELETE_QUEUE_DIR),
        }
    }

    pub fn with_dir(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn with_queue_lock<T>(&self, f: impl FnOnce() -> io::Result<T>) -> io::Result<T> {
        fs::create_dir_all(&self.dir)?;

        let lock_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(self.dir.join(LOCK_FILE))?;
        lock_file.lock_exclusive()?;

        let result = f();

        lock_file.unlock()?;
        result
    }

    fn write_pending(&self, path: &Path, pod_interface_id: &str, container_id: &str) -> io::Result<()> {
        // temp file plus rename keeps half-written entries invisible to
        // the drainer; create_new catches a racing enqueue
        let tmp_path = self.dir.join(format!(".{}.tmp", pod_interface_id));

        let mut tmp = match OpenOptions::new().create_new(true).write(true).open(&tmp_path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => return Ok(()),
            Err(e) => return Err(e),
        };

        let result = tmp
            .write_all(container_id.as_bytes())
            .and_then(|_| tmp.sync_all())
            .and_then(|_| fs::rename(&tmp_path, path));

        if result.is_err() {
            let _ = fs::remove_file(&tmp_path);
        }
        result
    }
}

impl Default for FsDeleteWatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteWatcher for FsDeleteWatcher {
    fn enqueue(&self, pod_interface_id: &str, container_id: &str) -> io::Result<()> {
        self.with_queue_lock(|| {
            let path = self.dir.join(pod_interface_id);

            // an entry already queued for this interface is success
            if path.exists() {
                return Ok(());
            }

            self.write_pending(&path, pod_interface_id, container_id)?;
            info!(
                pod_interface_id,
                container_id, "queued release for deferred delete"
            );
            Ok(())
        })
    }
}
