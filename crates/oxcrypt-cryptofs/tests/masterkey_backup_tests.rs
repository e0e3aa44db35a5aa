//! Masterkey provisioning and backup behaviour of a mounted vault.

mod common;

use std::sync::Arc;

use common::{FailingStorage, TestVault};
use oxcrypt_cryptofs::{CryptoFileSystem, CryptoFsProperties, ErrorKind, StorageBackend};

#[test]
fn test_first_open_creates_identical_backup() {
    let vault = TestVault::new();
    let backup = vault.backup_path();
    assert!(!backup.exists());

    let fs = vault.open();
    fs.close().unwrap();

    let key_file = std::fs::read(vault.masterkey_path()).unwrap();
    assert_eq!(std::fs::read(&backup).unwrap(), key_file);
}

#[test]
fn test_reopen_leaves_backup_untouched() {
    let vault = TestVault::new();
    vault.open().close().unwrap();
    let backup = vault.backup_path();
    let before = std::fs::read(&backup).unwrap();

    // A storage that cannot write backups still mounts when the backup matches
    let fs = vault
        .open_with_storage(&vault.properties(), Arc::new(FailingStorage::failing_backups()))
        .unwrap();
    fs.close().unwrap();

    assert_eq!(std::fs::read(&backup).unwrap(), before);
}

#[test]
fn test_matching_backup_is_verified_when_rewrite_fails() {
    let vault = TestVault::new();
    vault.open().close().unwrap();
    let backup = vault.backup_path();
    let before = std::fs::read(&backup).unwrap();

    // The up-to-date check cannot read the backup, so a rewrite is attempted,
    // fails, and the existing backup is compared instead
    let storage = Arc::new(FailingStorage::failing_backups().with_failed_backup_reads(1));
    let fs = vault
        .open_with_storage(&vault.properties(), Arc::clone(&storage) as Arc<dyn StorageBackend>)
        .unwrap();
    assert_eq!(storage.backup_reads(), 2);
    fs.close().unwrap();

    assert_eq!(std::fs::read(&backup).unwrap(), before);
}

#[test]
fn test_unreadable_backup_on_unwritable_storage_reports_write_failure() {
    let vault = TestVault::new();
    vault.open().close().unwrap();

    let storage = Arc::new(FailingStorage::failing_backups().with_failed_backup_reads(2));
    let err = vault
        .open_with_storage(&vault.properties(), Arc::clone(&storage) as Arc<dyn StorageBackend>)
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert_eq!(storage.backup_reads(), 2);
}

#[test]
fn test_mismatched_backup_on_unwritable_storage_is_integrity_violation() {
    let vault = TestVault::new();
    let backup = vault.backup_path();
    std::fs::write(&backup, b"not the key file").unwrap();
    let key_file = std::fs::read(vault.masterkey_path()).unwrap();

    let err = vault
        .open_with_storage(&vault.properties(), Arc::new(FailingStorage::failing_backups()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("INTEGRITY VIOLATION"));

    // Nothing was lost or overwritten
    assert_eq!(std::fs::read(vault.masterkey_path()).unwrap(), key_file);
    assert_eq!(std::fs::read(&backup).unwrap(), b"not the key file");
}

#[test]
fn test_missing_backup_on_unwritable_storage_reports_write_failure() {
    let vault = TestVault::new();
    let err = vault
        .open_with_storage(&vault.properties(), Arc::new(FailingStorage::failing_backups()))
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
    assert!(!vault.backup_path().exists());
}

#[test]
fn test_mismatched_backup_is_replaced_on_writable_storage() {
    let vault = TestVault::new();
    let backup = vault.backup_path();
    std::fs::write(&backup, b"stale").unwrap();

    vault.open().close().unwrap();

    let key_file = std::fs::read(vault.masterkey_path()).unwrap();
    assert_eq!(std::fs::read(&backup).unwrap(), key_file);
}

#[test]
fn test_readonly_mount_skips_backup() {
    let vault = TestVault::new();
    let fs = vault
        .open_with_storage(
            &vault.readonly_properties(),
            Arc::new(FailingStorage::failing_all_writes()),
        )
        .unwrap();
    assert!(fs.is_readonly());
    fs.close().unwrap();
    assert!(!vault.backup_path().exists());
}

#[test]
fn test_wrong_passphrase_is_configuration_error() {
    let vault = TestVault::new();
    let properties = CryptoFsProperties::builder()
        .passphrase("wrong")
        .build()
        .unwrap();
    let err = CryptoFileSystem::open(vault.root(), &properties).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert!(!vault.backup_path().exists());
}

#[test]
fn test_wrong_pepper_is_configuration_error() {
    let vault = TestVault::new();
    let properties = CryptoFsProperties::builder()
        .passphrase(common::TEST_PASSPHRASE)
        .pepper(b"pepper".to_vec())
        .build()
        .unwrap();
    let err = CryptoFileSystem::open(vault.root(), &properties).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_unknown_format_version_is_unsupported() {
    let vault = TestVault::new();
    let properties = CryptoFsProperties::builder()
        .passphrase(common::TEST_PASSPHRASE)
        .vault_format_version(99)
        .build()
        .unwrap();
    let err = CryptoFileSystem::open(vault.root(), &properties).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedFormat);
}

#[test]
fn test_malformed_key_file_is_configuration_error() {
    let vault = TestVault::new();
    std::fs::write(vault.masterkey_path(), b"{ not json").unwrap();
    let err = CryptoFileSystem::open(vault.root(), &vault.properties()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Configuration);
}

#[test]
fn test_missing_key_file_is_storage_error() {
    let vault = TestVault::new();
    std::fs::remove_file(vault.masterkey_path()).unwrap();
    let err = CryptoFileSystem::open(vault.root(), &vault.properties()).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Storage);
}
