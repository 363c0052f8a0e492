#![allow(clippy::expect_used, clippy::unwrap_used)]

use bufferdb::storage::PartitionStore;
use bufferdb::{BufferedBTree, IndexConfig, SyncStrategy};
use tempfile::tempdir;

const STRATEGIES: [SyncStrategy; 2] = [SyncStrategy::Coarse, SyncStrategy::Optimistic];

fn tag(key: u64) -> String {
    format!("Value{key}")
}

fn open_tree(
    dir: &std::path::Path,
    buffer_size: usize,
    strategy: SyncStrategy,
) -> BufferedBTree<u64, String> {
    let config = IndexConfig::new(buffer_size, 4, dir).with_strategy(strategy);
    BufferedBTree::with_config(config).expect("create tree")
}

#[test]
fn test_reference_scenario() {
    for strategy in STRATEGIES {
        let dir = tempdir().expect("create temp dir");
        let tree = open_tree(dir.path(), 3, strategy);

        for key in [10u64, 5, 3, 7, 12, 11, 15, 14, 17, 20] {
            tree.insert(key, tag(key)).expect("insert");
            tree.check_invariants().expect("valid after insert");
        }
        assert_eq!(tree.search(&7).expect("search"), Some(tag(7)));
        assert_eq!(tree.search(&8).expect("search"), None);

        assert!(tree.delete(&3).expect("delete 3"));
        assert!(tree.delete(&10).expect("delete 10"));
        tree.check_invariants().expect("valid after delete");

        assert_eq!(tree.search(&3).expect("search"), None);
        assert_eq!(tree.search(&10).expect("search"), None);
        assert_eq!(tree.search(&5).expect("search"), Some(tag(5)));
        assert_eq!(tree.len(), 8);
    }
}

#[test]
fn test_sorted_inserts_split_correctly() {
    for strategy in STRATEGIES {
        let dir = tempdir().expect("create temp dir");
        let tree = open_tree(dir.path(), 3, strategy);

        for key in 1..=25u64 {
            tree.insert(key, tag(key)).expect("insert");
            let root = tree.snapshot().expect("snapshot").expect("non-empty");
            assert!(root.keys.len() <= 3, "root overfull after inserting {key}");
            tree.check_invariants().expect("valid tree");
        }

        let keys: Vec<u64> = tree
            .entries()
            .expect("entries")
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        assert_eq!(keys, (1..=25).collect::<Vec<_>>());
    }
}

#[test]
fn test_deletes_collapse_to_single_node() {
    for strategy in STRATEGIES {
        let dir = tempdir().expect("create temp dir");
        let tree = open_tree(dir.path(), 3, strategy);
        for key in 1..=40u64 {
            tree.insert(key, tag(key)).expect("insert");
        }
        assert!(tree.height().expect("height") > 2);

        for key in 2..=40u64 {
            assert!(tree.delete(&key).expect("delete"));
            tree.check_invariants().expect("valid tree");
        }

        let root = tree.snapshot().expect("snapshot").expect("one key left");
        assert_eq!(root.parent, None);
        assert!(root.children.is_empty());
        assert_eq!(root.keys, vec![1]);
        assert_eq!(tree.height().expect("height"), 1);
        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.search(&1).expect("search"), Some(tag(1)));
    }
}

#[test]
fn test_insert_then_delete_without_flush() {
    let dir = tempdir().expect("create temp dir");
    let tree = open_tree(dir.path(), 4, SyncStrategy::Coarse);
    for key in 0..30u64 {
        tree.insert(key, tag(key)).expect("insert");
    }
    tree.insert(100, tag(100)).expect("insert");
    assert!(tree.delete(&100).expect("delete"));
    assert_eq!(tree.search(&100).expect("search"), None);
    assert_eq!(tree.len(), 30);
}

#[test]
fn test_flushed_entries_survive_reopen() {
    let dir = tempdir().expect("create temp dir");
    {
        let tree = open_tree(dir.path(), 3, SyncStrategy::Optimistic);
        for key in 0..40u64 {
            tree.insert(key, tag(key)).expect("insert");
        }
        tree.flush().expect("flush");
    }

    let reopened = open_tree(dir.path(), 3, SyncStrategy::Optimistic);
    assert!(reopened.is_empty(), "the tree itself is not persisted");
    for key in 0..40u64 {
        assert_eq!(reopened.store().get(&key).expect("get"), Some(tag(key)));
    }
    assert_eq!(reopened.store().get(&99).expect("get"), None);
}

#[test]
fn test_store_returns_first_recorded_value() {
    let dir = tempdir().expect("create temp dir");
    let tree = open_tree(dir.path(), 3, SyncStrategy::Coarse);

    tree.insert(42, "original".to_string()).expect("insert");
    tree.flush().expect("flush");
    tree.insert(42, "replacement".to_string()).expect("insert again");
    tree.flush().expect("flush");

    // The store that appended both records serves the latest from cache.
    assert_eq!(
        tree.store().get(&42).expect("get"),
        Some("replacement".to_string())
    );

    // A fresh store scans the log and stops at the first record.
    let fresh: PartitionStore<u64, String> =
        PartitionStore::open(4, dir.path(), false).expect("open store");
    assert_eq!(fresh.get(&42).expect("get"), Some("original".to_string()));
    let partition = fresh.partition_of(&42);
    let records: Vec<String> = fresh
        .scan_partition(partition)
        .expect("scan")
        .into_iter()
        .filter(|(key, _)| *key == 42)
        .map(|(_, value)| value)
        .collect();
    assert_eq!(records, vec!["original".to_string(), "replacement".to_string()]);
}

#[test]
fn test_delete_does_not_retract_flushed_records() {
    let dir = tempdir().expect("create temp dir");
    let tree = open_tree(dir.path(), 3, SyncStrategy::Coarse);
    tree.insert(8, tag(8)).expect("insert");
    tree.flush().expect("flush");
    assert!(tree.delete(&8).expect("delete"));

    assert_eq!(tree.search(&8).expect("search"), None);
    assert_eq!(tree.store().get(&8).expect("get"), Some(tag(8)));
}

#[test]
fn test_deleting_one_duplicate_still_flushes_the_other() {
    for strategy in STRATEGIES {
        let dir = tempdir().expect("create temp dir");
        {
            let tree = open_tree(dir.path(), 3, strategy);
            tree.insert(5, "a".to_string()).expect("insert");
            tree.insert(5, "b".to_string()).expect("insert");
            assert!(tree.delete(&5).expect("delete"));
            assert_eq!(tree.entries().expect("entries"), vec![(5, "b".to_string())]);
            assert_eq!(tree.buffered_len().expect("buffered"), 1);

            tree.flush().expect("flush");
            assert_eq!(tree.buffered_len().expect("buffered"), 0);
            assert_eq!(tree.store().get(&5).expect("get"), Some("b".to_string()));
        }

        let fresh: PartitionStore<u64, String> =
            PartitionStore::open(4, dir.path(), false).expect("reopen store");
        assert_eq!(fresh.get(&5).expect("get"), Some("b".to_string()));
    }
}

#[test]
fn test_string_keys() {
    let dir = tempdir().expect("create temp dir");
    let tree: BufferedBTree<String, Vec<u8>> =
        BufferedBTree::new(3, 2, dir.path()).expect("create tree");
    for word in ["pear", "apple", "fig", "kiwi", "banana", "cherry", "date"] {
        tree.insert(word.to_string(), word.as_bytes().to_vec())
            .expect("insert");
    }
    tree.check_invariants().expect("valid tree");
    assert_eq!(
        tree.search(&"kiwi".to_string()).expect("search"),
        Some(b"kiwi".to_vec())
    );
    let first = tree.entries().expect("entries").into_iter().next();
    assert_eq!(first.map(|(key, _)| key), Some("apple".to_string()));
}
