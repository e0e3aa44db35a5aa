//! Chunked file content encryption and open-file management.

mod engine;
pub mod layout;
mod open_file;

pub use engine::{ContentChunkCipherEngine, FileHandle, OpenMode};
pub use layout::ChunkLayout;

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::crypto::CryptoError;
use crate::error::ErrorKind;
use crate::readonly::ReadOnlyViolation;
use crate::storage::StorageError;

/// Where a content failure happened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContentContext {
    /// Ciphertext file on storage.
    pub path: PathBuf,
    /// Chunk index, for chunk-level failures.
    pub chunk: Option<u64>,
}

impl ContentContext {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            chunk: None,
        }
    }

    #[must_use]
    pub fn with_chunk(mut self, chunk: u64) -> Self {
        self.chunk = Some(chunk);
        self
    }
}

impl fmt::Display for ContentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.chunk {
            Some(chunk) => write!(f, "chunk {chunk} of {:?}", self.path.display()),
            None => write!(f, "{:?}", self.path.display()),
        }
    }
}

#[derive(Error, Debug)]
pub enum ContentError {
    /// **[INTEGRITY VIOLATION]** A header or chunk failed authentication.
    #[error("[INTEGRITY VIOLATION] Authentication failed for {context}: {source}")]
    Integrity {
        context: ContentContext,
        #[source]
        source: CryptoError,
    },

    /// **[INTEGRITY VIOLATION]** The ciphertext has an impossible length.
    #[error("[INTEGRITY VIOLATION] Malformed ciphertext for {context}: {reason}")]
    Malformed {
        context: ContentContext,
        reason: String,
    },

    #[error("No such file: {context}")]
    NotFound { context: ContentContext },

    #[error("Handle for {context} is not open for writing")]
    NotWritable { context: ContentContext },

    #[error("File {context} was deleted while open")]
    Deleted { context: ContentContext },

    #[error("File state for {context} is unusable after a panic in another thread")]
    Poisoned { context: ContentContext },

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    ReadOnly(#[from] ReadOnlyViolation),
}

impl ContentError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ContentError::Integrity { .. } | ContentError::Malformed { .. } => ErrorKind::Integrity,
            ContentError::NotFound { .. } | ContentError::Deleted { .. } => ErrorKind::NotFound,
            ContentError::NotWritable { .. } => ErrorKind::InvalidInput,
            ContentError::Poisoned { .. } => ErrorKind::Storage,
            ContentError::Storage(e) => e.kind(),
            ContentError::Crypto(e) => e.kind(),
            ContentError::ReadOnly(e) => e.kind(),
        }
    }

    /// Classify a cipher failure: authentication and format problems become
    /// integrity errors with `context`, anything else passes through.
    pub(crate) fn from_crypto(source: CryptoError, context: ContentContext) -> Self {
        match source {
            CryptoError::HeaderAuthentication
            | CryptoError::ChunkAuthentication { .. }
            | CryptoError::NameAuthentication { .. }
            | CryptoError::Malformed { .. } => ContentError::Integrity { context, source },
            other => ContentError::Crypto(other),
        }
    }
}
