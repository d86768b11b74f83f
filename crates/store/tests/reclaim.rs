//! End-to-end reclaim: overwrite everything, copy the oldest segment's
//! live records forward, drop the segment, and verify the full scan still
//! returns the latest values.

use std::collections::BTreeMap;
use std::sync::Arc;

use sediment_store::log::backend::MemoryStorage;
use sediment_store::log::{Log, LogConfig};
use sediment_store::reclaim::reclaim_segment;
use sediment_store::tree::btree::{BTree, BTreeMutable};
use sediment_store::tree::patricia::{PatriciaTree, PatriciaTreeMutable};
use sediment_store::{
    Address, BalancePolicy, CacheConfig, CacheSizing, RemoveBlockKind, Tree, TreeMutable,
    NULL_ADDRESS,
};

const PAGE: usize = 256;
const FILE: u64 = 2048;
const STRUCTURE: u64 = 3;

fn test_log() -> Arc<Log> {
    let storage = MemoryStorage::new();
    let config = LogConfig {
        page_size: PAGE,
        file_length_bound: FILE,
        cache: CacheConfig { sizing: CacheSizing::Bytes(512 * 1024), ..Default::default() },
        no_lock: true,
        sync_on_commit: false,
        ..Default::default()
    };
    Arc::new(Log::open(Box::new(storage.reader()), Box::new(storage.writer()), config).unwrap())
}

fn policy() -> BalancePolicy {
    BalancePolicy { max_bottom: 8, max_internal: 8, merge_threshold: 3 }
}

fn commit_save(log: &Arc<Log>, tree: &mut dyn TreeMutable) -> Address {
    let mut guard = log.begin_write().unwrap();
    let root = tree.save(&mut guard).unwrap();
    guard.write_database_root(root).unwrap();
    guard.commit().unwrap();
    root
}

fn key(i: u32) -> Vec<u8> {
    format!("key/{i:05}").into_bytes()
}

#[test]
fn btree_reclaim_frees_oldest_segment() {
    let log = test_log();
    let mut root = NULL_ADDRESS;

    // Insert in batches, then overwrite the even keys, leaving the odd
    // ones live in the oldest segment so the reclaim has work to do.
    for round in 0..2u8 {
        for chunk in 0..10u32 {
            let tree =
                BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
            let mut mutable = BTreeMutable::new(&tree).unwrap();
            for i in chunk * 30..(chunk + 1) * 30 {
                if round == 1 && i % 2 == 1 {
                    continue;
                }
                mutable.put(&key(i), format!("value {i} round {round}").as_bytes()).unwrap();
            }
            root = commit_save(&log, &mut mutable);
        }
    }

    let files = log.file_addresses();
    assert!(files.len() > 2, "expected several segments, got {files:?}");
    let oldest = files[0];

    let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
    let mut mutable = BTreeMutable::new(&tree).unwrap();
    reclaim_segment(&mut mutable, &log, oldest).unwrap();
    root = commit_save(&log, &mut mutable);

    // Nothing reachable from the new root lives in the reclaimed segment.
    let reclaimed = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
    let stragglers: Vec<Address> = reclaimed
        .addresses()
        .unwrap()
        .into_iter()
        .filter(|a| a - a % FILE == oldest)
        .collect();
    assert!(stragglers.is_empty(), "records left in segment: {stragglers:?}");

    log.remove_file(oldest, RemoveBlockKind::Delete).unwrap();

    // The full scan still returns every latest value.
    let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
    assert_eq!(tree.size(), 300);
    let mut cursor = tree.open_cursor();
    let mut count = 0u32;
    while let Some((k, v)) = cursor.next().unwrap() {
        let round = if count % 2 == 0 { 1 } else { 0 };
        assert_eq!(k, key(count));
        assert_eq!(v, format!("value {count} round {round}").into_bytes());
        count += 1;
    }
    assert_eq!(count, 300);
}

#[test]
fn btree_reclaim_preserves_duplicates() {
    let log = test_log();
    let mut root = NULL_ADDRESS;

    for batch in 0..6u32 {
        let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, true, policy()).unwrap();
        let mut mutable = BTreeMutable::new(&tree).unwrap();
        for i in 0..20u32 {
            mutable.put(&key(i), format!("dup {batch:02}/{i:02}").as_bytes()).unwrap();
        }
        root = commit_save(&log, &mut mutable);
    }

    let oldest = log.file_addresses()[0];
    let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, true, policy()).unwrap();
    let before: BTreeMap<(Vec<u8>, Vec<u8>), ()> = {
        let mut cursor = tree.open_cursor();
        let mut out = BTreeMap::new();
        while let Some(pair) = cursor.next().unwrap() {
            out.insert(pair, ());
        }
        out
    };
    assert_eq!(before.len(), 120);

    let mut mutable = BTreeMutable::new(&tree).unwrap();
    reclaim_segment(&mut mutable, &log, oldest).unwrap();
    root = commit_save(&log, &mut mutable);

    let reclaimed = BTree::open(Arc::clone(&log), STRUCTURE, root, true, policy()).unwrap();
    let stragglers: Vec<Address> = reclaimed
        .addresses()
        .unwrap()
        .into_iter()
        .filter(|a| a - a % FILE == oldest)
        .collect();
    assert!(stragglers.is_empty(), "records left in segment: {stragglers:?}");

    log.remove_file(oldest, RemoveBlockKind::Delete).unwrap();

    let after: BTreeMap<(Vec<u8>, Vec<u8>), ()> = {
        let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, true, policy()).unwrap();
        let mut cursor = tree.open_cursor();
        let mut out = BTreeMap::new();
        while let Some(pair) = cursor.next().unwrap() {
            out.insert(pair, ());
        }
        out
    };
    assert_eq!(before, after, "reclaim changed the key/value multiset");
}

#[test]
fn patricia_reclaim_frees_oldest_segment() {
    let log = test_log();
    let mut root = NULL_ADDRESS;

    for round in 0..2u8 {
        for chunk in 0..8u32 {
            let tree = PatriciaTree::open(Arc::clone(&log), STRUCTURE, root, false).unwrap();
            let mut mutable = PatriciaTreeMutable::new(&tree);
            for i in chunk * 25..(chunk + 1) * 25 {
                if round == 1 && i % 2 == 1 {
                    continue;
                }
                mutable.put(&key(i), format!("value {i} round {round}").as_bytes()).unwrap();
            }
            root = commit_save(&log, &mut mutable);
        }
    }

    let files = log.file_addresses();
    assert!(files.len() > 2, "expected several segments, got {files:?}");
    let oldest = files[0];

    let tree = PatriciaTree::open(Arc::clone(&log), STRUCTURE, root, false).unwrap();
    let mut mutable = PatriciaTreeMutable::new(&tree);
    reclaim_segment(&mut mutable, &log, oldest).unwrap();
    root = commit_save(&log, &mut mutable);

    let reclaimed = PatriciaTree::open(Arc::clone(&log), STRUCTURE, root, false).unwrap();
    let stragglers: Vec<Address> = reclaimed
        .addresses()
        .unwrap()
        .into_iter()
        .filter(|a| a - a % FILE == oldest)
        .collect();
    assert!(stragglers.is_empty(), "records left in segment: {stragglers:?}");

    log.remove_file(oldest, RemoveBlockKind::Delete).unwrap();

    let tree = PatriciaTree::open(Arc::clone(&log), STRUCTURE, root, false).unwrap();
    assert_eq!(tree.size(), 200);
    let mut cursor = tree.open_cursor();
    let mut count = 0u32;
    while let Some((k, v)) = cursor.next().unwrap() {
        let round = if count % 2 == 0 { 1 } else { 0 };
        assert_eq!(k, key(count));
        assert_eq!(v, format!("value {count} round {round}").into_bytes());
        count += 1;
    }
    assert_eq!(count, 200);
}

#[test]
fn reclaiming_every_old_segment_preserves_content() {
    let log = test_log();
    let mut root = NULL_ADDRESS;

    for round in 0..3u8 {
        let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
        let mut mutable = BTreeMutable::new(&tree).unwrap();
        for i in 0..120u32 {
            mutable.put(&key(i), format!("r{round} v{i}").as_bytes()).unwrap();
        }
        root = commit_save(&log, &mut mutable);
    }

    // Reclaim every segment below the one holding the current root.
    let root_segment = root - root % FILE;
    let candidates: Vec<Address> =
        log.file_addresses().into_iter().filter(|&f| f < root_segment).collect();
    for segment in candidates {
        let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
        let mut mutable = BTreeMutable::new(&tree).unwrap();
        reclaim_segment(&mut mutable, &log, segment).unwrap();
        root = commit_save(&log, &mut mutable);

        let check = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
        assert!(
            !check.addresses().unwrap().iter().any(|a| a - a % FILE == segment),
            "segment {segment:#x} still referenced"
        );
        log.remove_file(segment, RemoveBlockKind::Delete).unwrap();
    }

    let tree = BTree::open(Arc::clone(&log), STRUCTURE, root, false, policy()).unwrap();
    assert_eq!(tree.size(), 120);
    for i in 0..120u32 {
        assert_eq!(
            tree.get(&key(i)).unwrap(),
            Some(format!("r2 v{i}").into_bytes()),
            "key {i} lost"
        );
    }
}
