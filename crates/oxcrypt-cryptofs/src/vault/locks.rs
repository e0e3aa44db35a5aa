//! Locks serializing changes to directory listings.
//!
//! Every operation that adds, removes or renames an entry in a directory
//! listing takes the lock keyed by the ciphertext storage path of that
//! directory. Operations touching two listings (moves) take both locks in
//! lexicographic path order, so two opposite moves cannot deadlock.
//!
//! Readers never lock: a listing change is a single rename or create on the
//! storage backend, which readers observe either before or after.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use tracing::trace;

/// Lazily created per-directory mutexes.
#[derive(Debug, Default)]
pub struct DirectoryLocks {
    locks: DashMap<PathBuf, Arc<Mutex<()>>>,
}

impl DirectoryLocks {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    fn lock_for(&self, storage_dir: &Path) -> Arc<Mutex<()>> {
        self.locks
            .entry(storage_dir.to_path_buf())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Run `f` while holding the locks of all `storage_dirs`.
    ///
    /// Duplicates are locked once. Locks are released when `f` returns, and
    /// a lock nobody else holds or waits for is dropped from the map.
    pub fn with_locked<R>(&self, storage_dirs: &[&Path], f: impl FnOnce() -> R) -> R {
        let mut sorted: Vec<&Path> = storage_dirs.to_vec();
        sorted.sort();
        sorted.dedup();

        let result = {
            let locks: Vec<Arc<Mutex<()>>> = sorted.iter().map(|dir| self.lock_for(dir)).collect();
            // The mutexes guard no data, so a poisoned one is still usable
            let _guards: Vec<MutexGuard<'_, ()>> = locks
                .iter()
                .map(|lock| lock.lock().unwrap_or_else(PoisonError::into_inner))
                .collect();
            trace!(count = sorted.len(), "Directory locks held");
            f()
        };

        // Cloning a lock out of the map holds the same shard, so a count of
        // one here means no other thread can be about to use it
        for dir in &sorted {
            self.locks.remove_if(*dir, |_, lock| Arc::strong_count(lock) == 1);
        }
        result
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}
