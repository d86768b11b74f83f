//! Crash recovery tests over the filesystem backend.
//!
//! Each test builds a log with committed database roots, simulates a
//! crash by mutilating the on-disk state directly, reopens, and verifies
//! that recovery lands on the last committed root (or wipes, when asked
//! to). Crash simulation leaks the live log so its clean-close path never
//! runs.

use std::time::Duration;

use sediment_store::log::backend::{FileDataReader, FileDataWriter};
use sediment_store::log::loggable::{BTREE_LEAF, DATABASE_ROOT_TYPE};
use sediment_store::log::startup::BackupMetadata;
use sediment_store::log::{Log, LogConfig};
use sediment_store::{CacheConfig, CacheSizing, Error, NULL_ADDRESS};

const PAGE: usize = 256;
const FILE: u64 = 2048;

fn config() -> LogConfig {
    LogConfig {
        page_size: PAGE,
        file_length_bound: FILE,
        cache: CacheConfig { sizing: CacheSizing::Bytes(128 * 1024), ..Default::default() },
        lock_timeout: Duration::from_millis(200),
        ..Default::default()
    }
}

fn open(dir: &std::path::Path, config: LogConfig) -> Result<Log, Error> {
    Log::open(
        Box::new(FileDataReader::new(dir)?),
        Box::new(FileDataWriter::new(dir)?),
        config,
    )
}

/// Leaks the log so neither `close` nor `Drop` cleanup runs, simulating a
/// process kill. The directory lock file stays behind, as it would after
/// a real crash, so crashed reopens must tolerate it.
fn crash(log: Log) {
    std::mem::forget(log);
}

/// Removes a stale lock file left behind by a simulated crash.
fn unlock(dir: &std::path::Path) {
    let _ = std::fs::remove_file(dir.join("sediment.lck"));
}

/// Writes `batches` commits of a few records each, ending each with a
/// database root naming the batch's first record. Returns the payload
/// roots in commit order.
fn write_batches(log: &Log, batches: usize) -> Vec<u64> {
    let mut roots = Vec::new();
    for batch in 0..batches {
        let mut guard = log.begin_write().unwrap();
        let first = guard
            .write(BTREE_LEAF, 1, format!("batch {batch} record zero").as_bytes())
            .unwrap();
        for i in 1..5u8 {
            guard.write(BTREE_LEAF, 1, &vec![batch as u8 ^ i; 60]).unwrap();
        }
        guard.write_database_root(first).unwrap();
        guard.commit().unwrap();
        roots.push(first);
    }
    roots
}

#[test]
fn torn_tail_truncates_to_last_complete_root() {
    let dir = tempfile::tempdir().unwrap();
    let roots;
    {
        let log = open(dir.path(), config()).unwrap();
        roots = write_batches(&log, 6);
        crash(log);
    }
    unlock(dir.path());

    // Tear the tail segment at an offset inside the last batch.
    let files = {
        let reader = FileDataReader::new(dir.path()).unwrap();
        sediment_store::DataReader::block_addresses(&reader).unwrap()
    };
    let last_file = *files.last().unwrap();
    let path = dir.path().join(format!("{last_file:016x}.sed"));
    let len = std::fs::metadata(&path).unwrap().len();
    let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
    file.set_len(len - 97).unwrap();
    drop(file);

    let log = open(dir.path(), config()).unwrap();
    // Recovery lands on one of the committed roots, never in between.
    assert!(roots.contains(&log.root_address()), "unexpected root {:#x}", log.root_address());
    // The recovered root's record is readable.
    let loggable = log.read(log.root_address()).unwrap();
    assert_eq!(loggable.type_id, BTREE_LEAF);

    // The log keeps working.
    let mut guard = log.begin_write().unwrap();
    let addr = guard.write(BTREE_LEAF, 1, b"post recovery").unwrap();
    guard.commit().unwrap();
    assert_eq!(log.read(addr).unwrap().data(), b"post recovery");
}

#[test]
fn torn_tail_at_every_cut_recovers_to_a_committed_root() {
    // The CrashTest pattern: kill at many byte offsets, reopen each time.
    let dir = tempfile::tempdir().unwrap();
    let roots;
    {
        let log = open(dir.path(), config()).unwrap();
        roots = write_batches(&log, 3);
        crash(log);
    }
    unlock(dir.path());

    let path = dir.path().join(format!("{:016x}.sed", 0u64));
    let pristine = std::fs::read(&path).unwrap();
    let dirty_meta =
        sediment_store::log::startup::StartupMetadata::new(PAGE.trailing_zeros() as u8, FILE);

    for cut in (PAGE..pristine.len()).step_by(119) {
        std::fs::write(&path, &pristine[..cut]).unwrap();
        // A fresh (never cleanly closed) metadata image forces the scan;
        // the previous iteration's clean close would otherwise pin a high
        // address past the cut.
        std::fs::write(dir.path().join("startup.meta"), dirty_meta.to_bytes()).unwrap();

        let log = open(dir.path(), config()).unwrap();
        assert!(
            log.root_address() == NULL_ADDRESS || roots.contains(&log.root_address()),
            "cut {cut}: unexpected root {:#x}",
            log.root_address()
        );
        log.close().unwrap();
    }

    // Full image recovers the last root.
    std::fs::write(&path, &pristine).unwrap();
    let meta =
        sediment_store::log::startup::StartupMetadata::new(PAGE.trailing_zeros() as u8, FILE);
    std::fs::write(dir.path().join("startup.meta"), meta.to_bytes()).unwrap();
    let log = open(dir.path(), config()).unwrap();
    assert_eq!(log.root_address(), *roots.last().unwrap());
}

#[test]
fn flipped_byte_is_detected_and_truncated() {
    let dir = tempfile::tempdir().unwrap();
    let roots;
    {
        let log = open(dir.path(), config()).unwrap();
        roots = write_batches(&log, 4);
        crash(log);
    }
    unlock(dir.path());

    // Flip one byte in the middle of the first segment's third page.
    let path = dir.path().join(format!("{:016x}.sed", 0u64));
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[2 * PAGE + 33] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let log = open(dir.path(), config()).unwrap();
    let recovered = log.root_address();
    assert!(roots.contains(&recovered));
    assert!(recovered < (2 * PAGE) as u64, "root past the corrupted page survived");
}

#[test]
fn clear_invalid_log_wipes_instead_of_truncating() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = open(dir.path(), config()).unwrap();
        write_batches(&log, 2);
        crash(log);
    }
    unlock(dir.path());

    let path = dir.path().join(format!("{:016x}.sed", 0u64));
    let mut bytes = std::fs::read(&path).unwrap();
    bytes[10] ^= 0xff;
    std::fs::write(&path, &bytes).unwrap();

    let log = open(dir.path(), LogConfig { clear_invalid_log: true, ..config() }).unwrap();
    assert_eq!(log.high_address(), 0);
    assert_eq!(log.root_address(), NULL_ADDRESS);
    assert!(log.file_addresses().is_empty());
}

#[test]
fn corrupted_primary_metadata_slot_falls_back() {
    let dir = tempfile::tempdir().unwrap();
    {
        let log = open(dir.path(), config()).unwrap();
        write_batches(&log, 2);
        log.close().unwrap();
    }

    // Corrupt the primary slot's checksum in the startup metadata; the
    // secondary slot must carry the open (possibly via a rescan).
    let meta_path = dir.path().join("startup.meta");
    let mut bytes = std::fs::read(&meta_path).unwrap();
    let primary = (bytes[15] & 1) as usize;
    let slot_base = 16 + primary * 64;
    bytes[slot_base + 40] ^= 0xff;
    std::fs::write(&meta_path, &bytes).unwrap();

    let log = open(dir.path(), config()).unwrap();
    assert!(log.high_address() > 0);
}

#[test]
fn backup_metadata_restores_to_recorded_offset() {
    let dir = tempfile::tempdir().unwrap();
    let early_root;
    {
        let log = open(dir.path(), config()).unwrap();
        let roots = write_batches(&log, 8);
        early_root = roots[0];
        log.close().unwrap();
    }

    // Pin the restore point to the end of the first segment's first two
    // pages and drop everything later.
    let backup = BackupMetadata { last_file_address: 0, last_file_offset: 2 * PAGE as u64 };
    std::fs::write(dir.path().join("backup.meta"), backup.to_bytes()).unwrap();

    let log = open(dir.path(), config()).unwrap();
    assert_eq!(log.file_addresses(), vec![0]);
    assert!(log.high_address() <= 2 * PAGE as u64);
    assert_eq!(log.root_address(), early_root);
    // The backup record is consumed.
    assert!(!dir.path().join("backup.meta").exists());
}

#[test]
fn backup_offset_past_file_length_is_ignored() {
    let dir = tempfile::tempdir().unwrap();
    let last_root;
    {
        let log = open(dir.path(), config()).unwrap();
        last_root = *write_batches(&log, 2).last().unwrap();
        log.close().unwrap();
    }

    let backup = BackupMetadata { last_file_address: 0, last_file_offset: FILE * 10 };
    std::fs::write(dir.path().join("backup.meta"), backup.to_bytes()).unwrap();

    let log = open(dir.path(), config()).unwrap();
    assert_eq!(log.root_address(), last_root);
}

#[test]
fn second_open_fails_while_locked() {
    let dir = tempfile::tempdir().unwrap();
    let log = open(dir.path(), config()).unwrap();

    let err = open(dir.path(), config()).unwrap_err();
    assert!(matches!(err, Error::LockFailed { .. }), "got {err:?}");

    log.close().unwrap();
    let reopened = open(dir.path(), config()).unwrap();
    reopened.close().unwrap();
}

#[test]
fn clean_close_reopens_without_scan_artifacts() {
    let dir = tempfile::tempdir().unwrap();
    let last_root;
    {
        let log = open(dir.path(), config()).unwrap();
        last_root = *write_batches(&log, 3).last().unwrap();
        log.close().unwrap();
    }

    let log = open(dir.path(), config()).unwrap();
    assert_eq!(log.root_address(), last_root);
    // No truncation temp files survive a clean cycle.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "tmp"))
        .collect();
    assert!(leftovers.is_empty(), "temp files left behind: {leftovers:?}");

    // All committed records are readable after the fast-path open.
    let mut iter = log.iterator(0);
    let mut db_roots = 0;
    while let Some(loggable) = iter.next() {
        let loggable = loggable.unwrap();
        if loggable.type_id == DATABASE_ROOT_TYPE {
            db_roots += 1;
        }
    }
    assert_eq!(db_roots, 3);
}
