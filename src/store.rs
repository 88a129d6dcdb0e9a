use std::collections::HashSet;
use std::fs;
use std::io;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::{Builder, TempDir};

use crate::domain::Locator;
use crate::error::MirrorError;

const STAGING_PREFIX: &str = ".ena-mirror-staging";

/// The mirror tree on disk: `<mirror_base>/<locator path>`.
#[derive(Debug, Clone)]
pub struct MirrorStore {
    mirror_base: Utf8PathBuf,
    locks: Arc<PathLocks>,
}

impl MirrorStore {
    pub fn new(mirror_base: Utf8PathBuf) -> Self {
        Self {
            mirror_base,
            locks: Arc::new(PathLocks::default()),
        }
    }

    pub fn mirror_base(&self) -> &Utf8Path {
        &self.mirror_base
    }

    pub fn mirror_path(&self, locator: &Locator) -> Utf8PathBuf {
        self.mirror_base.join(locator.relative_path())
    }

    pub fn ensure_mirror_base(&self) -> Result<(), MirrorError> {
        fs::create_dir_all(self.mirror_base.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))
    }

    /// Blocks until no other holder works on `path`.
    pub fn lock(&self, path: &Utf8Path) -> PathGuard<'_> {
        self.locks.lock(path)
    }

    pub fn ensure_parent(path: &Utf8Path) -> Result<(), MirrorError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path()).map_err(|err| {
                MirrorError::Filesystem(format!("create {parent}: {err}"))
            })?;
        }
        Ok(())
    }

    /// Private directory next to `destination`, removed when dropped.
    pub fn staging_dir(destination: &Utf8Path) -> Result<TempDir, MirrorError> {
        let parent = destination
            .parent()
            .ok_or_else(|| MirrorError::Filesystem("invalid destination path".to_string()))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(parent.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))
    }

    pub fn remove_if_exists(path: &Utf8Path) -> Result<bool, MirrorError> {
        match fs::remove_file(path.as_std_path()) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(MirrorError::Filesystem(format!("remove {path}: {err}"))),
        }
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), MirrorError> {
        Self::ensure_parent(path)?;
        let tmp_path = path.with_extension("tmp");
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(())
    }
}

/// Per-destination mutual exclusion for fetch/verify/replace cycles.
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<HashSet<Utf8PathBuf>>,
    released: Condvar,
}

impl PathLocks {
    pub fn lock(&self, path: &Utf8Path) -> PathGuard<'_> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while held.contains(path) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(PoisonError::into_inner);
        }
        held.insert(path.to_path_buf());
        PathGuard {
            locks: self,
            path: path.to_path_buf(),
        }
    }
}

pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    path: Utf8PathBuf,
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut held = self
            .locks
            .held
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        held.remove(&self.path);
        self.locks.released.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;
    use std::time::Duration;

    use super::*;

    #[test]
    fn mirror_path_resolves_dot_segments() {
        let store = MirrorStore::new(Utf8PathBuf::from("/data/ena"));
        let locator: Locator = "ftp.sra.ebi.ac.uk/vol1/fastq/ERR1/../ERR1/ERR1.fastq.gz"
            .parse()
            .unwrap();
        assert_eq!(
            store.mirror_path(&locator),
            Utf8PathBuf::from("/data/ena/vol1/fastq/ERR1/ERR1.fastq.gz")
        );
    }

    #[test]
    fn same_path_is_serialized() {
        let locks = PathLocks::default();
        let active = AtomicUsize::new(0);
        let peak = AtomicUsize::new(0);
        let path = Utf8PathBuf::from("/data/ena/x.fastq.gz");

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    let _guard = locks.lock(&path);
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(5));
                    active.fetch_sub(1, Ordering::SeqCst);
                });
            }
        });

        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn remove_missing_file_is_not_an_error() {
        let temp = tempfile::tempdir().unwrap();
        let path = Utf8PathBuf::from_path_buf(temp.path().join("absent")).unwrap();
        assert!(!MirrorStore::remove_if_exists(&path).unwrap());
    }
}
