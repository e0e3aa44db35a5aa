//! File content encryption through the mounted filesystem.

mod common;

use std::path::PathBuf;

use common::TestVault;
use oxcrypt_cryptofs::fs::ChunkLayout;
use oxcrypt_cryptofs::{CryptoFileSystem, CryptoFsProperties, ErrorKind, OpenMode, VaultPath};
use proptest::prelude::*;

const SMALL_CHUNK: usize = 64;

fn small_chunk_properties() -> CryptoFsProperties {
    CryptoFsProperties::builder()
        .passphrase(common::TEST_PASSPHRASE)
        .chunk_size(SMALL_CHUNK)
        .chunk_cache_capacity(2)
        .build()
        .unwrap()
}

fn open_small(vault: &TestVault) -> CryptoFileSystem {
    CryptoFileSystem::open(vault.root(), &small_chunk_properties()).unwrap()
}

fn write_file(fs: &CryptoFileSystem, path: &str, data: &[u8]) -> PathBuf {
    let handle = fs.create_file(path).unwrap();
    assert_eq!(fs.write(&handle, 0, data).unwrap(), data.len());
    fs.close_file(handle).unwrap();
    fs.directory_mapper()
        .ciphertext_file_path(&VaultPath::new(path))
        .unwrap()
}

fn read_file(fs: &CryptoFileSystem, path: &str) -> Result<Vec<u8>, oxcrypt_cryptofs::CryptoFsError> {
    let handle = fs.open_file(path, OpenMode::Read)?;
    let size = fs.file_size(&handle)?;
    let data = fs.read(&handle, 0, usize::try_from(size).unwrap());
    fs.close_file(handle)?;
    data
}

#[test]
fn test_content_survives_remount() {
    let vault = TestVault::new();
    let data: Vec<u8> = (0..100_000u32).map(|i| (i % 251) as u8).collect();
    {
        let fs = vault.open();
        write_file(&fs, "/big.bin", &data);
    }
    let fs = vault.open();
    assert_eq!(read_file(&fs, "/big.bin").unwrap(), data);
}

#[test]
fn test_ciphertext_length_matches_layout() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let layout = ChunkLayout::new(SMALL_CHUNK);

    for len in [0usize, 1, 63, 64, 65, 128, 200] {
        let name = format!("/f{len}");
        let ciphertext = write_file(&fs, &name, &vec![0xAB; len]);
        let actual = std::fs::metadata(&ciphertext).unwrap().len();
        assert_eq!(actual, layout.ciphertext_size(len as u64), "cleartext length {len}");
    }
}

#[test]
fn test_same_content_encrypts_differently() {
    let vault = TestVault::new();
    let fs = vault.open();
    let a = write_file(&fs, "/a", b"identical content");
    let b = write_file(&fs, "/b", b"identical content");
    assert_ne!(std::fs::read(a).unwrap(), std::fs::read(b).unwrap());
}

#[test]
fn test_tampered_chunk_fails_authentication() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let layout = ChunkLayout::new(SMALL_CHUNK);
    let ciphertext = write_file(&fs, "/t", &[7u8; 3 * SMALL_CHUNK]);

    let mut bytes = std::fs::read(&ciphertext).unwrap();
    let offset = usize::try_from(layout.ciphertext_offset(1)).unwrap() + 20;
    bytes[offset] ^= 0x01;
    std::fs::write(&ciphertext, &bytes).unwrap();

    let handle = fs.open_file("/t", OpenMode::Read).unwrap();
    // The untouched chunk still reads
    assert_eq!(fs.read(&handle, 0, SMALL_CHUNK).unwrap(), vec![7u8; SMALL_CHUNK]);
    let err = fs.read(&handle, SMALL_CHUNK as u64, 1).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    assert!(err.to_string().contains("chunk 1"));
    fs.close_file(handle).unwrap();
}

#[test]
fn test_reordered_chunks_fail_authentication() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let layout = ChunkLayout::new(SMALL_CHUNK);
    let mut data = vec![1u8; SMALL_CHUNK];
    data.extend(vec![2u8; SMALL_CHUNK]);
    let ciphertext = write_file(&fs, "/r", &data);

    let mut bytes = std::fs::read(&ciphertext).unwrap();
    let start = usize::try_from(layout.ciphertext_offset(0)).unwrap();
    let chunk = usize::try_from(layout.ciphertext_chunk_size()).unwrap();
    let (first, second) = bytes[start..start + 2 * chunk].split_at_mut(chunk);
    first.swap_with_slice(second);
    std::fs::write(&ciphertext, &bytes).unwrap();

    assert_eq!(read_file(&fs, "/r").unwrap_err().kind(), ErrorKind::Integrity);
}

#[test]
fn test_swapped_header_fails_authentication() {
    let vault = TestVault::new();
    let fs = vault.open();
    let a = write_file(&fs, "/a", b"first file");
    let b = write_file(&fs, "/b", b"second file");

    let header_len = usize::try_from(ChunkLayout::new(SMALL_CHUNK).ciphertext_offset(0)).unwrap();
    let mut a_bytes = std::fs::read(&a).unwrap();
    let b_bytes = std::fs::read(&b).unwrap();
    a_bytes[..header_len].copy_from_slice(&b_bytes[..header_len]);
    std::fs::write(&a, &a_bytes).unwrap();

    assert_eq!(read_file(&fs, "/a").unwrap_err().kind(), ErrorKind::Integrity);
    assert_eq!(read_file(&fs, "/b").unwrap(), b"second file");
}

#[test]
fn test_torn_final_chunk_is_rejected() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let ciphertext = write_file(&fs, "/torn", &[9u8; SMALL_CHUNK + 40]);

    let len = std::fs::metadata(&ciphertext).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&ciphertext).unwrap();
    file.set_len(len - 10).unwrap();
    drop(file);

    let handle = fs.open_file("/torn", OpenMode::Read).unwrap();
    let err = fs.read(&handle, SMALL_CHUNK as u64, 10).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
    fs.close_file(handle).unwrap();
}

#[test]
fn test_impossible_length_is_rejected_on_open() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let ciphertext = write_file(&fs, "/short", &[1u8; 10]);

    // Leave the header plus a stub shorter than any chunk's overhead
    let layout = ChunkLayout::new(SMALL_CHUNK);
    let file = std::fs::OpenOptions::new().write(true).open(&ciphertext).unwrap();
    file.set_len(layout.ciphertext_offset(0) + 20).unwrap();
    drop(file);

    let err = fs.open_file("/short", OpenMode::Read).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Integrity);
}

#[test]
fn test_empty_file_reads_empty() {
    let vault = TestVault::new();
    let fs = vault.open();
    let handle = fs.create_file("/empty").unwrap();
    fs.close_file(handle).unwrap();
    assert!(read_file(&fs, "/empty").unwrap().is_empty());
}

#[test]
fn test_sparse_write_zero_fills_gap() {
    let vault = TestVault::new();
    let fs = open_small(&vault);
    let handle = fs.create_file("/sparse").unwrap();
    fs.write(&handle, 150, b"tail").unwrap();
    assert_eq!(fs.file_size(&handle).unwrap(), 154);
    fs.close_file(handle).unwrap();

    let data = read_file(&fs, "/sparse").unwrap();
    assert!(data[..150].iter().all(|&b| b == 0));
    assert_eq!(&data[150..], b"tail");
}

#[test]
fn test_moved_open_file_keeps_its_handle() {
    let vault = TestVault::new();
    let fs = vault.open();
    fs.create_directory("/dir").unwrap();
    let handle = fs.create_file("/before.txt").unwrap();
    fs.write(&handle, 0, b"moving").unwrap();

    fs.move_entry("/before.txt", "/dir/after.txt").unwrap();
    fs.write(&handle, 6, b" along").unwrap();
    fs.close_file(handle).unwrap();

    assert_eq!(fs.entry_kind("/before.txt").unwrap(), None);
    assert_eq!(read_file(&fs, "/dir/after.txt").unwrap(), b"moving along");
}

#[test]
fn test_deleted_open_file_rejects_further_use() {
    let vault = TestVault::new();
    let fs = vault.open();
    let handle = fs.create_file("/gone").unwrap();
    fs.write(&handle, 0, b"data").unwrap();

    fs.delete_file("/gone").unwrap();
    assert_eq!(fs.read(&handle, 0, 4).unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(fs.entry_kind("/gone").unwrap(), None);
    let _ = fs.close_file(handle);
    assert_eq!(fs.entry_kind("/gone").unwrap(), None);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_written_bytes_read_back(
        data in prop::collection::vec(any::<u8>(), 0..600),
        split in 0usize..600,
    ) {
        let vault = TestVault::new();
        let fs = open_small(&vault);
        let split = split.min(data.len());

        // Two writes at different offsets, then read back after remount
        let handle = fs.create_file("/p").unwrap();
        fs.write(&handle, split as u64, &data[split..]).unwrap();
        fs.write(&handle, 0, &data[..split]).unwrap();
        fs.close_file(handle).unwrap();
        fs.close().unwrap();

        let fs = open_small(&vault);
        prop_assert_eq!(read_file(&fs, "/p").unwrap(), data);
    }

    #[test]
    fn prop_any_flipped_bit_is_detected(
        len in 1usize..300,
        position in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        let vault = TestVault::new();
        let fs = open_small(&vault);
        let ciphertext = write_file(&fs, "/x", &vec![0x5A; len]);

        let mut bytes = std::fs::read(&ciphertext).unwrap();
        let at = position.index(bytes.len());
        bytes[at] ^= 1 << bit;
        std::fs::write(&ciphertext, &bytes).unwrap();

        let err = read_file(&fs, "/x").unwrap_err();
        prop_assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}
