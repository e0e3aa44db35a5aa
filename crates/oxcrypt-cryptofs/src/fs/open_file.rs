use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use lru::LruCache;
use zeroize::Zeroizing;

use super::{ContentContext, ContentError};
use crate::crypto::content::{FileHeader, NONCE_SIZE};

/// Cleartext of one chunk, as cached between reads and writes.
pub(crate) struct CachedChunk {
    pub data: Zeroizing<Vec<u8>>,
    pub dirty: bool,
}

impl CachedChunk {
    pub fn clean(data: Zeroizing<Vec<u8>>) -> Self {
        Self { data, dirty: false }
    }

    pub fn zeroed(len: usize) -> Self {
        Self {
            data: Zeroizing::new(vec![0u8; len]),
            dirty: true,
        }
    }
}

/// Mutable state of an open file, guarded by [`OpenFile::lock`].
///
/// For every chunk index below `chunk_count(size)` either the chunk is in
/// `chunks`, or storage holds a valid chunk of exactly the length that `size`
/// implies for it.
pub(crate) struct FileState {
    /// Current ciphertext location. Changes when the file is moved while open.
    pub path: PathBuf,
    pub header: FileHeader,
    /// False for a zero-length ciphertext file that has not been written yet.
    pub header_written: bool,
    /// Cleartext size as seen by handles.
    pub size: u64,
    /// Cleartext size last written to storage.
    pub persisted_size: u64,
    pub chunks: LruCache<u64, CachedChunk>,
    /// False until the opener that registered the file has read its header.
    /// A file that never becomes loaded is dropped from the registry.
    pub loaded: bool,
    pub deleted: bool,
    /// Set once the filesystem is closed; all later use fails.
    pub closed: bool,
}

impl FileState {
    pub fn context(&self) -> ContentContext {
        ContentContext::new(self.path.clone())
    }

    pub fn dirty_count(&self) -> usize {
        self.chunks.iter().filter(|(_, c)| c.dirty).count()
    }

    /// Whether handles see content that storage does not hold yet.
    pub fn has_unflushed(&self) -> bool {
        self.size != self.persisted_size || self.dirty_count() > 0
    }

    /// Drop cached changes and fall back to what storage holds.
    pub fn discard_unflushed(&mut self) {
        self.chunks.clear();
        self.size = self.persisted_size;
    }

    pub fn finish_loading(&mut self, header: FileHeader, header_written: bool, size: u64) {
        self.header = header;
        self.header_written = header_written;
        self.size = size;
        self.persisted_size = size;
        self.loaded = true;
    }
}

/// One ciphertext file shared by all of its open handles.
pub(crate) struct OpenFile {
    state: Mutex<FileState>,
    /// Number of live handles. Only changed while holding the registry entry
    /// (on open) or the state lock (on release).
    openers: AtomicUsize,
}

impl OpenFile {
    /// A registry entry for `path` whose header is still being read, owned by
    /// one opener. See [`FileState::finish_loading`].
    pub fn loading(path: PathBuf, cache_capacity: NonZeroUsize) -> Self {
        Self {
            state: Mutex::new(FileState {
                path,
                header: FileHeader::new([0u8; NONCE_SIZE], [0u8; 32]),
                header_written: false,
                size: 0,
                persisted_size: 0,
                chunks: LruCache::new(cache_capacity),
                loaded: false,
                deleted: false,
                closed: false,
            }),
            openers: AtomicUsize::new(1),
        }
    }

    /// Lock the state. A poisoned lock means a panic mid-update, so the cache
    /// may be inconsistent with storage and is not handed out.
    pub fn lock(&self, context: impl FnOnce() -> ContentContext) -> Result<MutexGuard<'_, FileState>, ContentError> {
        self.state
            .lock()
            .map_err(|_| ContentError::Poisoned { context: context() })
    }

    /// Lock the state for teardown, where a poisoned cache is simply dropped.
    pub fn lock_for_teardown(&self) -> MutexGuard<'_, FileState> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn acquire(&self) {
        self.openers.fetch_add(1, Ordering::SeqCst);
    }

    /// Returns the number of handles left.
    pub fn release(&self) -> usize {
        self.openers.fetch_sub(1, Ordering::SeqCst).saturating_sub(1)
    }

    pub fn openers(&self) -> usize {
        self.openers.load(Ordering::SeqCst)
    }
}
