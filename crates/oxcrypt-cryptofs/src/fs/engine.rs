//! Chunked content engine with shared open files.
//!
//! All handles on the same ciphertext path share one [`OpenFile`]: one chunk
//! cache, one lock, one view of the file size. Reads decrypt and authenticate
//! whole chunks on a cache miss. Writes modify cached cleartext and mark the
//! chunk dirty; encryption happens on [`flush`](ContentChunkCipherEngine::flush),
//! on the last [`close`](ContentChunkCipherEngine::close), or when a dirty
//! chunk is evicted from the cache.
//!
//! Lock order is always file state first, registry second.

use std::fmt;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, MutexGuard};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tracing::{debug, info, instrument, trace, warn};
use zeroize::Zeroizing;

use super::layout::ChunkLayout;
use super::open_file::{CachedChunk, FileState, OpenFile};
use super::{ContentContext, ContentError};
use crate::crypto::content::{CHUNK_OVERHEAD, FileHeader, HEADER_SIZE};
use crate::crypto::{CryptoError, Cryptor};
use crate::readonly::ReadonlyFlag;
use crate::storage::StorageBackend;

type OpenFiles = Arc<DashMap<PathBuf, Arc<OpenFile>>>;

/// Access requested when opening a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    ReadWrite,
}

impl OpenMode {
    pub fn is_writable(self) -> bool {
        matches!(self, OpenMode::ReadWrite)
    }
}

/// One opener's reference to an open file.
///
/// Pass it back to [`ContentChunkCipherEngine::close`] to flush. Dropping it
/// instead abandons it; if it was the last handle, unflushed changes are
/// discarded.
pub struct FileHandle {
    id: u64,
    opened_path: PathBuf,
    mode: OpenMode,
    file: Arc<OpenFile>,
    open_files: OpenFiles,
    released: bool,
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileHandle")
            .field("id", &self.id)
            .field("path", &self.opened_path)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl FileHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Ciphertext path the handle was opened on.
    pub fn path(&self) -> &Path {
        &self.opened_path
    }

    fn context(&self) -> ContentContext {
        ContentContext::new(self.opened_path.clone())
    }
}

impl Drop for FileHandle {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let mut state = self.file.lock_for_teardown();
        if self.file.release() == 0 {
            let dirty = state.dirty_count();
            if dirty > 0 {
                warn!(
                    handle = self.id,
                    path = %state.path.display(),
                    dirty,
                    "Handle abandoned without close, discarding unflushed chunks"
                );
            }
            // Chunks already spilled to storage under cache pressure stay written
            state.chunks.clear();
            state.size = state.persisted_size;
            let path = state.path.clone();
            self.open_files
                .remove_if(&path, |_, f| Arc::ptr_eq(f, &self.file) && f.openers() == 0);
        }
    }
}

/// Encrypts and decrypts file content in independently authenticated chunks.
pub struct ContentChunkCipherEngine {
    storage: Arc<dyn StorageBackend>,
    cryptor: Arc<Cryptor>,
    readonly: Arc<ReadonlyFlag>,
    layout: ChunkLayout,
    cache_capacity: NonZeroUsize,
    open_files: OpenFiles,
    next_handle: AtomicU64,
}

impl fmt::Debug for ContentChunkCipherEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContentChunkCipherEngine")
            .field("layout", &self.layout)
            .field("cache_capacity", &self.cache_capacity)
            .field("open_files", &self.open_files.len())
            .finish_non_exhaustive()
    }
}

impl ContentChunkCipherEngine {
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        cryptor: Arc<Cryptor>,
        readonly: Arc<ReadonlyFlag>,
        chunk_size: usize,
        cache_capacity: usize,
    ) -> Self {
        Self {
            storage,
            cryptor,
            readonly,
            layout: ChunkLayout::new(chunk_size),
            cache_capacity: NonZeroUsize::new(cache_capacity).unwrap_or(NonZeroUsize::MIN),
            open_files: Arc::new(DashMap::new()),
            next_handle: AtomicU64::new(1),
        }
    }

    pub fn layout(&self) -> ChunkLayout {
        self.layout
    }

    #[cfg(test)]
    fn with_registry_shards(mut self, shards: usize) -> Self {
        self.open_files = Arc::new(DashMap::with_shard_amount(shards));
        self
    }

    /// Number of distinct files currently open.
    pub fn open_file_count(&self) -> usize {
        self.open_files.len()
    }

    fn ensure_open(&self) -> Result<(), ContentError> {
        if self.cryptor.is_destroyed() {
            return Err(CryptoError::VaultClosed.into());
        }
        Ok(())
    }

    fn lock<'h>(&self, handle: &'h FileHandle) -> Result<MutexGuard<'h, FileState>, ContentError> {
        let state = handle.file.lock(|| handle.context())?;
        if state.closed {
            return Err(CryptoError::VaultClosed.into());
        }
        if state.deleted {
            return Err(ContentError::Deleted {
                context: state.context(),
            });
        }
        Ok(state)
    }

    fn check_writable(&self, handle: &FileHandle, operation: &'static str) -> Result<(), ContentError> {
        self.readonly.check(operation)?;
        if !handle.mode.is_writable() {
            return Err(ContentError::NotWritable {
                context: handle.context(),
            });
        }
        Ok(())
    }

    /// Open the ciphertext file at `path`, sharing state with existing openers.
    #[instrument(level = "debug", skip(self, path), fields(path = %path.display()))]
    pub fn open(&self, path: &Path, mode: OpenMode) -> Result<FileHandle, ContentError> {
        self.ensure_open()?;
        if mode.is_writable() {
            self.readonly.check("open file for writing")?;
        }

        let file = loop {
            if let Some(file) = self.register_opener(path)? {
                break file;
            }
        };

        let id = self.next_handle.fetch_add(1, Ordering::Relaxed);
        debug!(handle = id, openers = file.openers(), "File opened");
        Ok(FileHandle {
            id,
            opened_path: path.to_path_buf(),
            mode,
            file,
            open_files: Arc::clone(&self.open_files),
            released: false,
        })
    }

    /// Join or create the shared [`OpenFile`] for `path`.
    ///
    /// The registry shard is only held to look up or insert the entry. The
    /// creating opener reads the header afterwards with the new file's state
    /// locked, so concurrent openers, moves and deletes of the same path wait
    /// for it. Returns `None` when the file we joined failed to load; the
    /// caller retries.
    fn register_opener(&self, path: &Path) -> Result<Option<Arc<OpenFile>>, ContentError> {
        let file = match self.open_files.entry(path.to_path_buf()) {
            Entry::Occupied(entry) => {
                let file = Arc::clone(entry.get());
                file.acquire();
                file
            }
            Entry::Vacant(entry) => {
                let file = Arc::new(OpenFile::loading(path.to_path_buf(), self.cache_capacity));
                // Nobody else can hold the fresh file's lock yet
                let mut state = file.lock_for_teardown();
                entry.insert(Arc::clone(&file));

                let loaded = self.load(path);
                match loaded {
                    Ok((header, header_written, size)) => {
                        state.finish_loading(header, header_written, size);
                        drop(state);
                        return Ok(Some(file));
                    }
                    Err(e) => {
                        file.release();
                        self.open_files.remove_if(path, |_, f| Arc::ptr_eq(f, &file));
                        drop(state);
                        return Err(e);
                    }
                }
            }
        };

        let state = match file.lock(|| ContentContext::new(path)) {
            Ok(state) => state,
            Err(e) => {
                file.release();
                return Err(e);
            }
        };
        let loaded = state.loaded;
        drop(state);
        if loaded {
            Ok(Some(file))
        } else {
            file.release();
            trace!(path = %path.display(), "Joined a file that failed to load, retrying");
            Ok(None)
        }
    }

    fn load(&self, path: &Path) -> Result<(FileHeader, bool, u64), ContentError> {
        let context = ContentContext::new(path);
        let attrs = self
            .storage
            .attributes(path)?
            .filter(|attrs| !attrs.is_dir)
            .ok_or_else(|| ContentError::NotFound {
                context: context.clone(),
            })?;

        let size = self.layout.cleartext_size(attrs.len).ok_or_else(|| {
            warn!(path = %path.display(), len = attrs.len, "Ciphertext length is not a valid chunk layout");
            ContentError::Malformed {
                context: context.clone(),
                reason: format!("ciphertext length {} does not match any chunk layout", attrs.len),
            }
        })?;

        let (header, header_written) = if attrs.len == 0 {
            (self.cryptor.new_file_header()?, false)
        } else {
            let mut buf = [0u8; HEADER_SIZE];
            let n = self.storage.read_at(path, 0, &mut buf)?;
            if n < HEADER_SIZE {
                return Err(ContentError::Malformed {
                    context,
                    reason: format!("header truncated to {n} bytes"),
                });
            }
            let header = self.cryptor.decrypt_header(&buf).map_err(|e| {
                warn!(path = %path.display(), error = %e, "File header failed authentication");
                ContentError::from_crypto(e, context)
            })?;
            (header, true)
        };

        trace!(size, "Loaded file header");
        Ok((header, header_written, size))
    }

    /// Read up to `len` bytes at `offset`. Returns fewer bytes only at end of file.
    #[instrument(level = "trace", skip(self, handle), fields(handle = handle.id))]
    pub fn read(&self, handle: &FileHandle, offset: u64, len: usize) -> Result<Vec<u8>, ContentError> {
        self.ensure_open()?;
        let mut state = self.lock(handle)?;
        if len == 0 || offset >= state.size {
            return Ok(Vec::new());
        }

        let end = state.size.min(offset.saturating_add(len as u64));
        let mut out = Vec::with_capacity((end - offset) as usize);
        let mut pos = offset;
        while pos < end {
            let index = self.layout.chunk_index(pos);
            let start = self.layout.chunk_start(index);
            let from = (pos - start) as usize;
            let to = (end - start).min(self.layout.chunk_size()) as usize;
            let chunk = self.chunk_mut(&mut state, index, true)?;
            out.extend_from_slice(&chunk.data[from..to]);
            pos = start + to as u64;
        }
        Ok(out)
    }

    /// Write `data` at `offset`, growing the file (zero-filled) if needed.
    #[instrument(level = "trace", skip(self, handle, data), fields(handle = handle.id, len = data.len()))]
    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize, ContentError> {
        self.ensure_open()?;
        self.check_writable(handle, "write")?;
        let mut state = self.lock(handle)?;
        if data.is_empty() {
            return Ok(0);
        }
        if offset > state.size {
            self.grow(&mut state, offset)?;
        }

        let chunk_size = self.layout.chunk_size() as usize;
        let mut written = 0;
        while written < data.len() {
            let pos = offset + written as u64;
            let index = self.layout.chunk_index(pos);
            let within = (pos - self.layout.chunk_start(index)) as usize;
            let take = (chunk_size - within).min(data.len() - written);
            let end = within + take;

            // A fully overwritten chunk need not be read first
            let whole_chunk = within == 0 && take == chunk_size;
            let chunk = self.chunk_mut(&mut state, index, !whole_chunk)?;
            if chunk.data.len() < end {
                chunk.data.resize(end, 0);
            }
            chunk.data[within..end].copy_from_slice(&data[written..written + take]);
            chunk.dirty = true;

            written += take;
            let reached = pos + take as u64;
            if reached > state.size {
                state.size = reached;
            }
        }
        Ok(written)
    }

    /// Shrink or grow the file to `new_size` cleartext bytes.
    #[instrument(level = "debug", skip(self, handle), fields(handle = handle.id))]
    pub fn truncate(&self, handle: &FileHandle, new_size: u64) -> Result<(), ContentError> {
        self.ensure_open()?;
        self.check_writable(handle, "truncate")?;
        let mut state = self.lock(handle)?;

        if new_size > state.size {
            return self.grow(&mut state, new_size);
        }
        if new_size == state.size {
            return Ok(());
        }

        let keep = self.layout.chunk_count(new_size);
        let stale: Vec<u64> = state
            .chunks
            .iter()
            .map(|(index, _)| *index)
            .filter(|index| *index >= keep)
            .collect();
        for index in stale {
            state.chunks.pop(&index);
        }

        if new_size % self.layout.chunk_size() != 0 {
            let index = self.layout.chunk_index(new_size);
            let len = self.layout.chunk_len(index, new_size);
            let chunk = self.chunk_mut(&mut state, index, true)?;
            chunk.data.truncate(len);
            chunk.dirty = true;
        }
        state.size = new_size;
        Ok(())
    }

    /// Extend the file to `new_size` with zeros. Every chunk whose content
    /// changes becomes dirty, so the gap is written on the next flush.
    fn grow(&self, state: &mut FileState, new_size: u64) -> Result<(), ContentError> {
        let old_size = state.size;
        if old_size % self.layout.chunk_size() != 0 {
            let index = self.layout.chunk_index(old_size);
            let len = self.layout.chunk_len(index, new_size);
            let chunk = self.chunk_mut(state, index, true)?;
            chunk.data.resize(len, 0);
            chunk.dirty = true;
        }

        for index in self.layout.chunk_count(old_size)..self.layout.chunk_count(new_size) {
            let len = self.layout.chunk_len(index, new_size);
            let chunk = self.chunk_mut(state, index, false)?;
            chunk.data.clear();
            chunk.data.resize(len, 0);
            chunk.dirty = true;
        }

        state.size = new_size;
        trace!(old_size, new_size, "File grown");
        Ok(())
    }

    /// Cached chunk `index`, loading it from storage when `load_existing` is
    /// set and it is not cached. Without `load_existing` a missing chunk
    /// starts out empty.
    fn chunk_mut<'s>(
        &self,
        state: &'s mut FileState,
        index: u64,
        load_existing: bool,
    ) -> Result<&'s mut CachedChunk, ContentError> {
        let mut loaded = None;
        if !state.chunks.contains(&index) {
            let data = if load_existing {
                self.read_chunk(state, index)?
            } else {
                Zeroizing::new(Vec::with_capacity(self.layout.chunk_size() as usize))
            };
            self.make_room(state)?;
            loaded = Some(CachedChunk::clean(data));
        }
        Ok(state
            .chunks
            .get_or_insert_mut(index, || loaded.unwrap_or_else(|| CachedChunk::zeroed(0))))
    }

    fn read_chunk(&self, state: &FileState, index: u64) -> Result<Zeroizing<Vec<u8>>, ContentError> {
        let len = self.layout.chunk_len(index, state.size);
        if len == 0 {
            return Ok(Zeroizing::new(Vec::new()));
        }

        let context = || state.context().with_chunk(index);
        let mut ciphertext = vec![0u8; len + CHUNK_OVERHEAD];
        let n = self
            .storage
            .read_at(&state.path, self.layout.ciphertext_offset(index), &mut ciphertext)?;
        if n < ciphertext.len() {
            warn!(path = %state.path.display(), chunk = index, "Chunk truncated on storage");
            return Err(ContentError::Malformed {
                context: context(),
                reason: format!("expected {} ciphertext bytes, found {n}", ciphertext.len()),
            });
        }

        let cleartext = self
            .cryptor
            .decrypt_chunk(&ciphertext, index, &state.header)
            .map_err(|e| {
                warn!(path = %state.path.display(), chunk = index, "Chunk failed authentication");
                ContentError::from_crypto(e, context())
            })?;
        trace!(chunk = index, len, "Chunk decrypted");
        Ok(cleartext)
    }

    /// Evict the least recently used chunk if the cache is full, writing it
    /// out first if dirty.
    ///
    /// On a read-only mount nothing is written: the least recently used clean
    /// chunk goes instead, and if every cached chunk is dirty the cache grows.
    /// Writes are rejected by then, so the dirty set cannot grow with it.
    fn make_room(&self, state: &mut FileState) -> Result<(), ContentError> {
        let cap = state.chunks.cap();
        if state.chunks.len() < cap.get() {
            return Ok(());
        }
        if self.readonly.is_set() {
            let clean = state
                .chunks
                .iter()
                .rev()
                .find(|(_, chunk)| !chunk.dirty)
                .map(|(index, _)| *index);
            match clean {
                Some(index) => {
                    state.chunks.pop(&index);
                }
                None => {
                    state.chunks.resize(cap.saturating_add(1));
                    trace!(capacity = cap.get() + 1, "Chunk cache grown to keep unflushed chunks");
                }
            }
            return Ok(());
        }
        let Some((index, chunk)) = state.chunks.pop_lru() else {
            return Ok(());
        };
        if chunk.dirty {
            let spilled = self
                .ensure_header(state)
                .and_then(|()| self.write_chunk(&state.path, &state.header, index, &chunk.data));
            if let Err(e) = spilled {
                state.chunks.push(index, chunk);
                return Err(e);
            }
            trace!(chunk = index, "Dirty chunk written on eviction");
        }
        Ok(())
    }

    fn ensure_header(&self, state: &mut FileState) -> Result<(), ContentError> {
        if !state.header_written {
            let bytes = self.cryptor.encrypt_header(&state.header)?;
            self.storage.write_at(&state.path, 0, &bytes)?;
            state.header_written = true;
        }
        Ok(())
    }

    /// Encrypt `data` under a fresh nonce and store it as chunk `index`.
    fn write_chunk(
        &self,
        path: &Path,
        header: &FileHeader,
        index: u64,
        data: &[u8],
    ) -> Result<(), ContentError> {
        let ciphertext = self.cryptor.encrypt_chunk(data, index, header)?;
        self.storage
            .write_at(path, self.layout.ciphertext_offset(index), &ciphertext)?;
        Ok(())
    }

    fn flush_state(&self, state: &mut FileState) -> Result<(), ContentError> {
        if state.deleted || state.closed || !state.loaded {
            return Ok(());
        }
        // Under the latch an empty file that never got a header keeps none
        let changed = state.has_unflushed();
        if !changed && (state.header_written || self.readonly.is_set()) {
            return Ok(());
        }
        self.readonly.check("flush")?;
        let dirty = state.dirty_count();

        self.ensure_header(state)?;
        {
            let FileState {
                chunks, path, header, ..
            } = &mut *state;
            for (index, chunk) in chunks.iter_mut() {
                if chunk.dirty {
                    self.write_chunk(path, header, *index, &chunk.data)?;
                    chunk.dirty = false;
                }
            }
        }

        if state.size != state.persisted_size {
            self.storage
                .set_len(&state.path, self.layout.ciphertext_size(state.size))?;
            state.persisted_size = state.size;
        }
        debug!(path = %state.path.display(), chunks = dirty, size = state.size, "File flushed");
        Ok(())
    }

    /// Write every dirty chunk and record the current length on storage.
    #[instrument(level = "debug", skip(self, handle), fields(handle = handle.id))]
    pub fn flush(&self, handle: &FileHandle) -> Result<(), ContentError> {
        self.ensure_open()?;
        let mut state = self.lock(handle)?;
        self.flush_state(&mut state)
    }

    /// Current cleartext size, including unflushed writes.
    pub fn size(&self, handle: &FileHandle) -> Result<u64, ContentError> {
        self.ensure_open()?;
        Ok(self.lock(handle)?.size)
    }

    /// Release a handle. The last handle of a file flushes it and drops its cache.
    #[instrument(level = "debug", skip(self, handle), fields(handle = handle.id))]
    pub fn close(&self, mut handle: FileHandle) -> Result<(), ContentError> {
        handle.released = true;
        let vault_open = self.ensure_open();

        let file = Arc::clone(&handle.file);
        let mut state = match file.lock(|| handle.context()) {
            Ok(state) => state,
            Err(e) => {
                // Nothing trustworthy to flush; just let go of the file
                let state = file.lock_for_teardown();
                if file.release() == 0 {
                    let path = state.path.clone();
                    self.open_files.remove_if(&path, |_, f| Arc::ptr_eq(f, &file));
                }
                return vault_open.and(Err(e));
            }
        };

        let remaining = file.release();
        if remaining > 0 {
            debug!(remaining, "Handle closed, file still open");
            return vault_open;
        }

        let flushed = self.flush_or_discard(&mut state);
        if let Err(e) = &flushed {
            warn!(path = %state.path.display(), error = %e, "Flush on close failed");
        }
        state.chunks.clear();
        let path = state.path.clone();
        self.open_files
            .remove_if(&path, |_, f| Arc::ptr_eq(f, &file) && f.openers() == 0);
        debug!("Last handle closed");
        vault_open.and(flushed)
    }

    /// Flush for teardown. Once the mount is read-only, unflushed changes are
    /// dropped instead of written.
    fn flush_or_discard(&self, state: &mut FileState) -> Result<(), ContentError> {
        if self.readonly.is_set() && state.loaded && !state.deleted && state.has_unflushed() {
            warn!(
                path = %state.path.display(),
                dirty = state.dirty_count(),
                "Mount is read-only, discarding unflushed changes"
            );
            state.discard_unflushed();
            return Ok(());
        }
        self.flush_state(state)
    }

    /// Forget the open file at `path` after its entry was deleted.
    pub(crate) fn mark_deleted(&self, path: &Path) {
        let Some(file) = self.open_files.get(path).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let mut state = file.lock_for_teardown();
        if !state.loaded {
            return;
        }
        state.deleted = true;
        state.chunks.clear();
        self.open_files.remove_if(path, |_, f| Arc::ptr_eq(f, &file));
        debug!(path = %path.display(), openers = file.openers(), "Open file marked deleted");
    }

    /// Follow a file entry that was moved while open.
    pub(crate) fn relocate(&self, from: &Path, to: &Path) {
        let Some(file) = self.open_files.get(from).map(|entry| Arc::clone(entry.value())) else {
            return;
        };
        let mut state = file.lock_for_teardown();
        if state.path != from || !state.loaded {
            return;
        }
        self.open_files.remove_if(from, |_, f| Arc::ptr_eq(f, &file));
        self.open_files.insert(to.to_path_buf(), Arc::clone(&file));
        state.path = to.to_path_buf();
        debug!(from = %from.display(), to = %to.display(), "Open file relocated");
    }

    /// Flush every open file and drop all cached cleartext.
    ///
    /// Afterwards every handle fails with a vault-closed error. Returns the
    /// first flush failure, after attempting all files.
    pub(crate) fn shutdown(&self) -> Result<(), ContentError> {
        let files: Vec<Arc<OpenFile>> = self
            .open_files
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut first_error = None;
        for file in &files {
            let mut state = match file.lock(ContentContext::default) {
                Ok(state) => state,
                Err(_) => file.lock_for_teardown(),
            };
            if let Err(e) = self.flush_or_discard(&mut state) {
                warn!(path = %state.path.display(), error = %e, "Flush on shutdown failed");
                first_error.get_or_insert(e);
            }
            state.chunks.clear();
            state.closed = true;
        }
        info!(files = files.len(), "Open files flushed");
        first_error.map_or(Ok(()), Err)
    }
}
