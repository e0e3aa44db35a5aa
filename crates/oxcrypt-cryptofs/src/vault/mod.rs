//! Vault-level abstractions: key material, cipher suites and directory mapping

pub mod dirs;
pub mod locks;
pub mod masterkey_file;
pub mod path;
pub mod provisioner;
pub mod suite;

pub use dirs::{CiphertextDirectory, DirectoryError, DirectoryIdMapper, EntryKind};
pub use locks::DirectoryLocks;
pub use masterkey_file::{MasterKeyFile, ScryptCost};
pub use path::{DirectoryId, VaultPath};
pub use provisioner::{MasterkeyError, MasterkeyProvisioner, backup_file_name, backup_file_suffix};
pub use suite::{
    ContentCipher, CryptorProvider, FilenameCipher, UnsupportedFormatError, VAULT_VERSION,
    VaultCipherSuite,
};
