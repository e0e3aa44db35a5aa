//! Mount-wide mutation gate.
//!
//! The flag is set once when the filesystem is opened (or later, by tooling that
//! downgrades a mount) and is never cleared again for the lifetime of that mount.
//! Every mutating entry point calls [`ReadonlyFlag::check`] before touching storage.

use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tracing::{debug, info};

use crate::error::ErrorKind;

/// Returned by a mutating operation attempted while the readonly flag is set.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Refusing to {operation}: vault is mounted read-only")]
pub struct ReadOnlyViolation {
    /// Short description of the rejected operation, e.g. `"create directory"`.
    pub operation: &'static str,
}

impl ReadOnlyViolation {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::ReadOnlyViolation
    }
}

/// Irreversible readonly latch shared by all components of one mount.
#[derive(Debug, Default)]
pub struct ReadonlyFlag {
    set: AtomicBool,
}

impl ReadonlyFlag {
    /// Create a flag in the given initial state.
    pub fn new(readonly: bool) -> Self {
        Self {
            set: AtomicBool::new(readonly),
        }
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Acquire)
    }

    /// Latch the flag. Calling this more than once has no further effect.
    pub fn set(&self) {
        if !self.set.swap(true, Ordering::AcqRel) {
            info!("Vault switched to read-only mode");
        }
    }

    /// Fail with [`ReadOnlyViolation`] if the flag is set.
    #[inline]
    pub fn check(&self, operation: &'static str) -> Result<(), ReadOnlyViolation> {
        if self.is_set() {
            debug!(operation, "Rejected mutation on read-only vault");
            Err(ReadOnlyViolation { operation })
        } else {
            Ok(())
        }
    }
}
