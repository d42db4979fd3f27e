use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::RwLock;
use tracing::{debug, info, warn};
use tsq_types::QueryFingerprint;

/// The directory query caches are written to.
///
/// Cache files are placed in a sub directory of `root` named after the time it was created.
/// Rotating swaps in a fresh sub directory and deletes the previous one, which bounds the disk
/// space held by caches that were never cleaned up.
#[derive(Debug)]
pub struct CacheDirectory {
    root: PathBuf,
    current: RwLock<PathBuf>,
}

impl CacheDirectory {
    /// Create the root and an initial cache directory beneath it.
    pub fn new(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        let current = next_dir_name(&root, None);
        fs::create_dir_all(&current)?;
        info!(path = ?current, "using query cache directory");
        Ok(Self {
            root,
            current: RwLock::new(current),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The current cache directory. It is re-created if something removed it.
    pub fn cache_dir(&self) -> io::Result<PathBuf> {
        let current = self.current.read().clone();
        fs::create_dir_all(&current)?;
        Ok(current)
    }

    /// Base path (no extension) of the cache files for `fingerprint`.
    pub fn file_base(&self, fingerprint: &QueryFingerprint) -> io::Result<PathBuf> {
        Ok(self.cache_dir()?.join(fingerprint.file_stem()))
    }

    /// Switch to a new cache directory and delete the old one.
    ///
    /// The old directory is deleted on a background thread; with `wait` the call blocks until
    /// the deletion finished. Failures are logged and never surface to callers.
    pub fn rotate(&self, wait: bool) {
        let previous = {
            let mut current = self.current.write();
            let next = next_dir_name(&self.root, Some(current.as_path()));
            if let Err(error) = fs::create_dir_all(&next) {
                warn!(%error, path = ?next, "failed to create query cache directory");
                return;
            }
            std::mem::replace(&mut *current, next)
        };
        debug!(path = ?previous, "rotated query cache directory");

        let cleanup = std::thread::Builder::new()
            .name("tsq-cache-cleanup".to_string())
            .spawn(move || remove_cache_dir(&previous));
        match cleanup {
            Ok(handle) if wait => {
                if handle.join().is_err() {
                    warn!("query cache cleanup thread panicked");
                }
            }
            Ok(_) => {}
            Err(error) => warn!(%error, "failed to spawn query cache cleanup thread"),
        }
    }

    /// Rotate every `interval` on a background thread until the returned handle is dropped.
    pub fn spawn_rotation(self: &Arc<Self>, interval: Duration) -> io::Result<RotationHandle> {
        let (stop_tx, stop_rx) = crossbeam_channel::bounded(0);
        let dir = Arc::clone(self);
        let thread = std::thread::Builder::new()
            .name("tsq-cache-rotation".to_string())
            .spawn(move || rotation_loop(&dir, interval, &stop_rx))?;
        Ok(RotationHandle {
            stop: Some(stop_tx),
            thread: Some(thread),
        })
    }
}

fn rotation_loop(dir: &CacheDirectory, interval: Duration, stop: &Receiver<()>) {
    loop {
        match stop.recv_timeout(interval) {
            Err(RecvTimeoutError::Timeout) => dir.rotate(false),
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    debug!("query cache rotation stopped");
}

fn remove_cache_dir(path: &Path) {
    match fs::remove_dir_all(path) {
        Ok(()) => debug!(?path, "removed query cache directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(error) => warn!(%error, ?path, "failed to remove query cache directory"),
    }
}

/// A sub directory of `root` named by the current time in milliseconds, distinct from
/// `previous` and from anything already on disk.
fn next_dir_name(root: &Path, previous: Option<&Path>) -> PathBuf {
    let mut millis = chrono::Utc::now().timestamp_millis();
    loop {
        let candidate = root.join(millis.to_string());
        if Some(candidate.as_path()) != previous && !candidate.exists() {
            return candidate;
        }
        millis += 1;
    }
}

/// Stops periodic cache directory rotation when dropped.
#[derive(Debug)]
pub struct RotationHandle {
    stop: Option<Sender<()>>,
    thread: Option<JoinHandle<()>>,
}

impl Drop for RotationHandle {
    fn drop(&mut self) {
        drop(self.stop.take());
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("query cache rotation thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tsq_types::TagFilter;

    #[test_log::test]
    fn rotate_replaces_directory() {
        let root = TempDir::new().unwrap();
        let dir = CacheDirectory::new(root.path()).unwrap();
        let first = dir.cache_dir().unwrap();
        fs::write(first.join("stale.data"), b"x").unwrap();

        dir.rotate(true);

        let second = dir.cache_dir().unwrap();
        assert_ne!(first, second);
        assert!(second.starts_with(root.path()));
        assert!(second.exists());
        assert!(!first.exists());
    }

    #[test]
    fn cache_dir_is_recreated() {
        let root = TempDir::new().unwrap();
        let dir = CacheDirectory::new(root.path().join("cache")).unwrap();
        let current = dir.cache_dir().unwrap();
        fs::remove_dir_all(&current).unwrap();
        assert_eq!(dir.cache_dir().unwrap(), current);
        assert!(current.exists());
    }

    #[test]
    fn file_base_uses_fingerprint_stem() {
        let root = TempDir::new().unwrap();
        let dir = CacheDirectory::new(root.path()).unwrap();
        let fingerprint = QueryFingerprint::new("cpu", 0, 10, &TagFilter::new());
        let base = dir.file_base(&fingerprint).unwrap();
        assert_eq!(base.parent().unwrap(), dir.cache_dir().unwrap());
        assert_eq!(
            base.file_name().unwrap().to_str().unwrap(),
            fingerprint.file_stem()
        );
    }

    #[test]
    fn periodic_rotation_stops_on_drop() {
        let root = TempDir::new().unwrap();
        let dir = Arc::new(CacheDirectory::new(root.path()).unwrap());
        let first = dir.cache_dir().unwrap();

        let handle = dir.spawn_rotation(Duration::from_millis(10)).unwrap();
        let deadline = std::time::Instant::now() + Duration::from_secs(10);
        while dir.cache_dir().unwrap() == first {
            assert!(std::time::Instant::now() < deadline, "directory never rotated");
            std::thread::sleep(Duration::from_millis(5));
        }
        drop(handle);

        let settled = dir.cache_dir().unwrap();
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(dir.cache_dir().unwrap(), settled);
    }
}
