//! Thread-safety of a single mounted filesystem shared between threads.
//!
//! Focus areas:
//! - Writes to disjoint chunks of one file through separate handles all land
//! - Writes to the same chunk are serialized, never interleaved
//! - Competing directory mutations have exactly one winner

mod common;

use std::sync::Barrier;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use common::TestVault;
use oxcrypt_cryptofs::{CryptoFileSystem, CryptoFsProperties, ErrorKind, OpenMode};

const CHUNK: usize = 128;
const THREADS: usize = 8;

fn open(vault: &TestVault) -> CryptoFileSystem {
    let properties = CryptoFsProperties::builder()
        .passphrase(common::TEST_PASSPHRASE)
        .chunk_size(CHUNK)
        .chunk_cache_capacity(3)
        .build()
        .unwrap();
    CryptoFileSystem::open(vault.root(), &properties).unwrap()
}

#[test]
fn test_disjoint_chunk_writes_are_all_visible() {
    let vault = TestVault::new();
    let fs = open(&vault);
    let handle = fs.create_file("/shared.bin").unwrap();
    fs.close_file(handle).unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for t in 0..THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                let handle = fs.open_file("/shared.bin", OpenMode::ReadWrite).unwrap();
                barrier.wait();
                let fill = vec![t as u8 + 1; CHUNK];
                fs.write(&handle, (t * CHUNK) as u64, &fill).unwrap();
                fs.close_file(handle).unwrap();
            });
        }
    });

    let handle = fs.open_file("/shared.bin", OpenMode::Read).unwrap();
    let data = fs.read(&handle, 0, THREADS * CHUNK).unwrap();
    assert_eq!(data.len(), THREADS * CHUNK);
    for (t, chunk) in data.chunks(CHUNK).enumerate() {
        assert!(chunk.iter().all(|&b| b == t as u8 + 1), "chunk {t} was lost");
    }
    fs.close_file(handle).unwrap();
}

#[test]
fn test_same_chunk_writes_never_interleave() {
    let vault = TestVault::new();
    let fs = open(&vault);
    let handle = fs.create_file("/contended.bin").unwrap();
    fs.close_file(handle).unwrap();

    let barrier = Barrier::new(THREADS);
    thread::scope(|s| {
        for t in 0..THREADS {
            let fs = &fs;
            let barrier = &barrier;
            s.spawn(move || {
                let handle = fs.open_file("/contended.bin", OpenMode::ReadWrite).unwrap();
                barrier.wait();
                for _ in 0..20 {
                    // Straddles a chunk boundary so one write touches two chunks
                    fs.write(&handle, (CHUNK / 2) as u64, &[t as u8; CHUNK]).unwrap();
                }
                fs.close_file(handle).unwrap();
            });
        }
    });

    let handle = fs.open_file("/contended.bin", OpenMode::Read).unwrap();
    let data = fs.read(&handle, (CHUNK / 2) as u64, CHUNK).unwrap();
    assert_eq!(data.len(), CHUNK);
    assert!(data.iter().all(|&b| b == data[0]), "writes were interleaved");
    fs.close_file(handle).unwrap();
}

#[test]
fn test_concurrent_readers_see_the_same_bytes() {
    let vault = TestVault::new();
    let fs = open(&vault);
    let content: Vec<u8> = (0..5 * CHUNK).map(|i| (i % 256) as u8).collect();
    let handle = fs.create_file("/read.bin").unwrap();
    fs.write(&handle, 0, &content).unwrap();
    fs.close_file(handle).unwrap();

    thread::scope(|s| {
        for _ in 0..THREADS {
            let fs = &fs;
            let content = &content;
            s.spawn(move || {
                let handle = fs.open_file("/read.bin", OpenMode::Read).unwrap();
                for _ in 0..10 {
                    assert_eq!(&fs.read(&handle, 0, content.len()).unwrap(), content);
                }
                fs.close_file(handle).unwrap();
            });
        }
    });
}

#[test]
fn test_competing_directory_creation_has_one_winner() {
    let vault = TestVault::new();
    let fs = open(&vault);
    let created = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for _ in 0..THREADS {
            let (fs, created, barrier) = (&fs, &created, &barrier);
            s.spawn(move || {
                barrier.wait();
                match fs.create_directory("/race") {
                    Ok(_) => {
                        created.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => assert_eq!(e.kind(), ErrorKind::AlreadyExists),
                }
            });
        }
    });

    assert_eq!(created.load(Ordering::SeqCst), 1);
    fs.directory_mapper()
        .resolve(&oxcrypt_cryptofs::VaultPath::new("/race"))
        .unwrap();
}

#[test]
fn test_competing_moves_have_one_winner() {
    let vault = TestVault::new();
    let fs = open(&vault);
    let id = fs.create_directory("/origin").unwrap();
    let moved = AtomicUsize::new(0);
    let barrier = Barrier::new(THREADS);

    thread::scope(|s| {
        for t in 0..THREADS {
            let (fs, moved, barrier) = (&fs, &moved, &barrier);
            s.spawn(move || {
                barrier.wait();
                match fs.move_entry("/origin", format!("/target-{t}")) {
                    Ok(()) => {
                        moved.fetch_add(1, Ordering::SeqCst);
                    }
                    Err(e) => assert_eq!(e.kind(), ErrorKind::NotFound),
                }
            });
        }
    });

    assert_eq!(moved.load(Ordering::SeqCst), 1);
    let survivors: Vec<_> = (0..THREADS)
        .filter_map(|t| {
            fs.directory_mapper()
                .resolve(&oxcrypt_cryptofs::VaultPath::new(format!("/target-{t}")))
                .ok()
        })
        .collect();
    assert_eq!(survivors.len(), 1);
    assert_eq!(survivors[0].dir_id, id);
}

#[test]
fn test_parallel_creation_in_one_parent() {
    let vault = TestVault::new();
    let fs = open(&vault);
    fs.create_directory("/parent").unwrap();

    thread::scope(|s| {
        for t in 0..THREADS {
            let fs = &fs;
            s.spawn(move || {
                fs.create_directory(format!("/parent/dir-{t}")).unwrap();
                let handle = fs.create_file(format!("/parent/file-{t}")).unwrap();
                fs.write(&handle, 0, format!("file {t}").as_bytes()).unwrap();
                fs.close_file(handle).unwrap();
            });
        }
    });

    for t in 0..THREADS {
        let handle = fs.open_file(format!("/parent/file-{t}"), OpenMode::Read).unwrap();
        assert_eq!(fs.read(&handle, 0, 64).unwrap(), format!("file {t}").as_bytes());
        fs.close_file(handle).unwrap();
    }
}
