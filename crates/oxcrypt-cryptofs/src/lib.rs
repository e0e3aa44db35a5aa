//! Encrypted filesystem core for Cryptomator-format vaults.
//!
//! Maps cleartext paths and file contents onto an encrypted on-disk layout
//! (vault format 7, `SIV_CTRMAC`). The mount adapter on top talks to
//! [`CryptoFileSystem`]; everything below it is usable on its own.

pub mod config;
pub mod crypto;
pub mod error;
pub mod filesystem;
pub mod fs;
pub mod readonly;
pub mod storage;
pub mod vault;

// Re-export commonly used types at crate root
pub use config::CryptoFsProperties;
pub use error::{CryptoFsError, ErrorKind};
pub use filesystem::CryptoFileSystem;
pub use fs::{FileHandle, OpenMode};
pub use readonly::ReadonlyFlag;
pub use storage::{FileStore, LocalStorage, StorageBackend};
pub use vault::{EntryKind, VaultPath};
