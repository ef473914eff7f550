use std::collections::BTreeSet;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tempfile::tempdir;

use super::*;
use crate::config::StoreConfig;
use crate::storage::{DocLog, Document, FaultConfig, FileManager, MemoryDisk};
use crate::testing::{MemoryResolver, init_tracing, memory_group, open_memory_group};

type MemoryTrie<'a, 'r> = HbTrie<'a, &'r MemoryResolver>;

const SKEW_KEYS: [&[u8]; 22] = [
    b"aaaaaaa_",
    b"aaaaaaa_aaaaaaa_",
    b"aaaaaaa_aaaaaaa_aaaaaaa_",
    b"bbbbbbb_",
    b"bbbbbbb_bbbbbbb_",
    b"bbbbbbb_bbbbccc_",
    b"ccccccc_",
    b"ccccccc_aaa",
    b"ccccccc_aa",
    b"dddddd_d",
    b"dddddd_ddddddd_d",
    b"dddddd_ddddddd_ddddddd_ddddaaa_",
    b"dddddd_ddddddd_dbddddb_",
    b"dddddd_ddddddd_dcddddc_",
    b"dddddd_ddddddd_ddddddd_ddddbbb_",
    b"dddddd_ddddddd_dedddde_temp1",
    b"dddddd_ddddddd_dfddddf_temp2",
    b"dddddd_ddddddd_dgddddg_temp3",
    b"dddddd_ddddddd_dhddddh_temp4",
    b"dddddd_ddddddd_diddddi_",
    b"dddddd_ddddddd_djddddj_",
    b"dddddd_ddddddd_dkddddk_",
];

fn trie_config(compact: bool, leaf_height_limit: usize) -> TrieConfig {
    TrieConfig {
        compact,
        leaf_height_limit,
        ..TrieConfig::default()
    }
}

fn insert_key(trie: &mut MemoryTrie<'_, '_>, resolver: &MemoryResolver, key: &[u8]) -> Vec<u8> {
    let value = resolver.push(key);
    trie.insert(key, &value).expect("insert");
    value
}

fn scan<R: KeyResolver>(trie: &mut HbTrie<'_, R>, start: Option<&[u8]>) -> Vec<Vec<u8>> {
    trie.iter(start)
        .expect("iter")
        .map(|entry| entry.expect("entry").0)
        .collect()
}

fn sorted_from(keys: &[&[u8]], start: &[u8]) -> Vec<Vec<u8>> {
    let set: BTreeSet<Vec<u8>> = keys
        .iter()
        .filter(|key| **key >= start)
        .map(|key| key.to_vec())
        .collect();
    set.into_iter().collect()
}

/// Repeat every character `width - 1` times followed by `_`.
fn expand_key(key: &str, width: usize) -> Vec<u8> {
    key.bytes()
        .flat_map(|b| std::iter::repeat_n(b, width - 1).chain(std::iter::once(b'_')))
        .collect()
}

#[test]
fn test_basic_document_lookup() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let docs = DocLog::open(&dir.path().join("docs.log")).expect("open log");
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &docs, TrieConfig::default()).expect("trie");

    let keys: Vec<Vec<u8>> = ["aaaa", "aaab", "aaac", "aba", "aaba", "bbbb", "aaac"]
        .iter()
        .map(|key| expand_key(key, 8))
        .collect();
    for (i, key) in keys.iter().enumerate() {
        let document = Document::new(
            key.clone(),
            format!("metadata_{i:03}"),
            format!("body_{i:03}"),
        );
        let offset = docs.append(&document).expect("append");
        trie.insert(key, &offset.to_le_bytes()).expect("insert");
    }
    trie.remove(&keys[0]).expect("remove");

    assert!(matches!(trie.find(&keys[0]), Err(HbTrieError::KeyNotFound)));
    for (i, key) in keys.iter().enumerate().skip(1) {
        let value = trie.find(key).expect("find");
        let offset = read_reference(&value).expect("offset");
        let document = docs.read(offset).expect("read document");

        // The second "aaac" replaced the first
        let expected = if i == 2 { 6 } else { i };
        assert_eq!(&document.key, key);
        assert_eq!(document.meta, format!("metadata_{expected:03}").into_bytes());
        assert_eq!(document.body, format!("body_{expected:03}").into_bytes());
    }

    let expected: BTreeSet<Vec<u8>> = keys[1..].iter().cloned().collect();
    assert_eq!(scan(&mut trie, None), expected.into_iter().collect::<Vec<_>>());
}

#[test]
fn test_update_returns_old_value() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    let first = insert_key(&mut trie, &resolver, b"some-long-key");
    insert_key(&mut trie, &resolver, b"some-long-key-2");

    let second = resolver.push(b"some-long-key");
    let old = trie.insert(b"some-long-key", &second).expect("update");
    assert_eq!(old, Some(first));
    assert_eq!(trie.find(b"some-long-key").expect("find"), second);

    // Same value again changes nothing
    let old = trie.insert(b"some-long-key", &second).expect("update");
    assert_eq!(old, Some(second.clone()));
    assert_eq!(trie.stats().expect("stats").keys, 2);
    assert_eq!(trie.find(b"some-long-key").expect("find"), second);
}

#[test]
fn test_remove_semantics() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    assert!(matches!(trie.remove(b"absent"), Err(HbTrieError::KeyNotFound)));

    let keep = insert_key(&mut trie, &resolver, b"prefix-shared-1");
    let gone = insert_key(&mut trie, &resolver, b"prefix-shared-2");
    let root = trie.root();

    assert!(matches!(
        trie.remove(b"prefix-shared-3"),
        Err(HbTrieError::KeyNotFound)
    ));
    assert!(matches!(trie.remove(b"prefix"), Err(HbTrieError::KeyNotFound)));
    assert_eq!(trie.root(), root);
    assert_eq!(trie.stats().expect("stats").keys, 2);

    assert_eq!(trie.remove(b"prefix-shared-2").expect("remove"), gone);
    assert!(matches!(
        trie.find(b"prefix-shared-2"),
        Err(HbTrieError::KeyNotFound)
    ));
    assert!(matches!(
        trie.remove(b"prefix-shared-2"),
        Err(HbTrieError::KeyNotFound)
    ));
    assert_eq!(trie.find(b"prefix-shared-1").expect("find"), keep);

    // The group collapsed back into a single value
    let stats = trie.stats().expect("stats");
    assert_eq!(stats.levels, 1);
    assert_eq!(stats.values, 1);
}

#[test]
fn test_skew_compact_with_leaf_limit() {
    init_tracing();
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");
    trie.set_compact(true).expect("set compact");
    trie.set_leaf_height_limit(1).expect("set limit");

    let values: Vec<Vec<u8>> = SKEW_KEYS
        .iter()
        .map(|key| insert_key(&mut trie, &resolver, key))
        .collect();
    for (key, value) in SKEW_KEYS.iter().zip(&values) {
        assert_eq!(&trie.find(key).expect("find"), value);
    }

    // Every group fits a meta-section, so no level is ever added
    assert_eq!(
        trie.stats().expect("stats"),
        TrieStats {
            levels: 1,
            max_depth: 0,
            values: 4,
            meta_sections: 4,
            meta_entries: 18,
            leaf_trees: 0,
            leaf_entries: 0,
            keys: 22,
        }
    );

    assert_eq!(scan(&mut trie, None), sorted_from(&SKEW_KEYS, b""));
    let start: &[u8] = b"aaaaaaa_aaaaaaa_a";
    assert_eq!(
        scan(&mut trie, Some(start)),
        sorted_from(&SKEW_KEYS, start)
    );

    assert_eq!(trie.remove(SKEW_KEYS[6]).expect("remove"), values[6]);
    assert!(matches!(
        trie.remove(b"aaaaaaa_a"),
        Err(HbTrieError::KeyNotFound)
    ));
    assert_eq!(trie.remove(SKEW_KEYS[4]).expect("remove"), values[4]);

    for i in [3, 1, 16] {
        let old = trie.insert(SKEW_KEYS[i], &values[i]).expect("update");
        assert_eq!(old.as_ref(), Some(&values[i]));
    }

    let remaining: Vec<&[u8]> = SKEW_KEYS
        .iter()
        .enumerate()
        .filter(|(i, _)| *i != 4 && *i != 6)
        .map(|(_, key)| *key)
        .collect();
    let expected = sorted_from(&remaining, b"");
    assert_eq!(scan(&mut trie, None), expected);

    let mut iter = trie.iter(None).expect("iter");
    let mut seen = Vec::new();
    loop {
        match iter.next_value_only() {
            Ok(value) => seen.push(value),
            Err(HbTrieError::IteratorExhausted) => break,
            Err(e) => panic!("scan failed: {e}"),
        }
    }
    iter.free();

    let expected_values: Vec<Vec<u8>> = expected
        .iter()
        .map(|key| {
            let index = SKEW_KEYS
                .iter()
                .position(|k| *k == key.as_slice())
                .expect("known key");
            values[index].clone()
        })
        .collect();
    assert_eq!(seen, expected_values);

    let stats = trie.stats().expect("stats");
    assert_eq!(stats.keys, 20);
    assert_eq!(stats.meta_sections, 3);
}

#[test]
fn test_skew_layout_without_compaction() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, trie_config(false, 0)).expect("trie");
    for key in SKEW_KEYS {
        insert_key(&mut trie, &resolver, key);
    }

    // Root, one sub-level per group, and two more levels for the "d" keys
    let stats = trie.stats().expect("stats");
    assert_eq!(stats.levels, 7);
    assert_eq!(stats.max_depth, 3);
    assert_eq!(stats.values, 22);
    assert_eq!(stats.meta_sections + stats.leaf_trees, 0);

    assert_eq!(scan(&mut trie, None), sorted_from(&SKEW_KEYS, b""));
    for start in [
        &b"aaaaaaa_aaaaaaa_a"[..],
        b"bbbbbbb_bbbbc",
        b"dddddd_ddddddd_dd",
        b"dddddd_ddddddd_ddddddd_ddddab",
        b"dddddd_ddddddd_dfddddf_temp",
        b"zzz",
    ] {
        assert_eq!(
            scan(&mut trie, Some(start)),
            sorted_from(&SKEW_KEYS, start),
            "scan from {:?}",
            String::from_utf8_lossy(start)
        );
    }

    // Removing down to one key folds a sub-level back into its parent
    trie.remove(SKEW_KEYS[4]).expect("remove");
    assert_eq!(trie.stats().expect("stats").levels, 6);
    trie.remove(SKEW_KEYS[11]).expect("remove");
    assert_eq!(trie.stats().expect("stats").levels, 5);

    assert!(trie.find(SKEW_KEYS[5]).is_ok());
    assert!(trie.find(SKEW_KEYS[14]).is_ok());
    assert!(trie.blocks().stale_pages() >= 2);
}

#[test]
fn test_leaf_height_limit_flattens_groups() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, trie_config(false, 1)).expect("trie");
    let values: Vec<Vec<u8>> = SKEW_KEYS
        .iter()
        .map(|key| insert_key(&mut trie, &resolver, key))
        .collect();

    assert_eq!(
        trie.stats().expect("stats"),
        TrieStats {
            levels: 1,
            max_depth: 0,
            values: 4,
            meta_sections: 0,
            meta_entries: 0,
            leaf_trees: 4,
            leaf_entries: 18,
            keys: 22,
        }
    );

    // In-place update inside a leaf tree
    let new_value = resolver.push(SKEW_KEYS[16]);
    let old = trie.insert(SKEW_KEYS[16], &new_value).expect("update");
    assert_eq!(old, Some(values[16].clone()));
    assert_eq!(trie.find(SKEW_KEYS[16]).expect("find"), new_value);
    assert_eq!(trie.stats().expect("stats").leaf_entries, 18);

    assert_eq!(
        scan(&mut trie, Some(b"dddddd_ddddddd_dd".as_slice())),
        sorted_from(&SKEW_KEYS, b"dddddd_ddddddd_dd")
    );

    // A leaf tree left with one key becomes a plain value
    trie.remove(SKEW_KEYS[4]).expect("remove");
    let stats = trie.stats().expect("stats");
    assert_eq!(stats.leaf_trees, 3);
    assert_eq!(stats.values, 5);
    assert_eq!(trie.find(SKEW_KEYS[5]).expect("find"), values[5]);
}

#[test]
fn test_meta_section_bursts_and_collapses() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, trie_config(true, 0)).expect("trie");

    let key = |i: usize| format!("group-a-{i:04}-{}", "x".repeat(40)).into_bytes();
    let mut count = 0;
    while trie.stats().expect("stats").levels <= 1 {
        insert_key(&mut trie, &resolver, &key(count));
        count += 1;
        assert!(count < 100, "meta-section never burst");
    }
    let stats = trie.stats().expect("stats");
    assert_eq!(stats.keys, count);
    assert_eq!(stats.meta_sections, 0);

    for i in 0..count {
        assert!(trie.find(&key(i)).is_ok(), "key {i}");
    }

    // One removal brings the group back under the meta-section capacity
    trie.remove(&key(0)).expect("remove");
    let stats = trie.stats().expect("stats");
    assert_eq!(stats.levels, 1);
    assert_eq!(stats.meta_sections, 1);
    assert_eq!(stats.meta_entries, count - 1);
    for i in 1..count {
        assert!(trie.find(&key(i)).is_ok(), "key {i}");
    }
}

#[test]
fn test_random_keys_across_configurations() {
    init_tracing();
    for (compact, limit) in [(false, 0), (true, 0), (false, 2), (true, 1)] {
        let mut rng = StdRng::seed_from_u64(42);
        let mut set = BTreeSet::new();
        while set.len() < 1200 {
            let len = rng.random_range(0..40);
            let key: Vec<u8> = (0..len).map(|_| rng.random_range(b'a'..=b'd')).collect();
            set.insert(key);
        }
        let mut keys: Vec<Vec<u8>> = set.iter().cloned().collect();
        keys.shuffle(&mut rng);

        let resolver = MemoryResolver::new();
        let mut blocks = memory_group();
        let config = TrieConfig {
            chunk_size: 4,
            ..trie_config(compact, limit)
        };
        let mut trie = HbTrie::new(&mut blocks, &resolver, config).expect("trie");

        let values: Vec<Vec<u8>> = keys
            .iter()
            .map(|key| insert_key(&mut trie, &resolver, key))
            .collect();
        for (key, value) in keys.iter().zip(&values) {
            assert_eq!(&trie.find(key).expect("find"), value, "{compact} {limit}");
        }
        assert_eq!(trie.stats().expect("stats").keys, keys.len());

        let all: Vec<&[u8]> = keys.iter().map(Vec::as_slice).collect();
        assert_eq!(scan(&mut trie, None), sorted_from(&all, b""));
        for _ in 0..20 {
            let start = &keys[rng.random_range(0..keys.len())];
            let start = &start[..rng.random_range(0..=start.len())];
            assert_eq!(scan(&mut trie, Some(start)), sorted_from(&all, start));
        }

        let (removed, kept) = keys.split_at(keys.len() / 2);
        for key in removed {
            trie.remove(key).expect("remove");
        }
        for key in removed {
            assert!(matches!(trie.find(key), Err(HbTrieError::KeyNotFound)));
        }
        let kept_keys: Vec<&[u8]> = kept.iter().map(Vec::as_slice).collect();
        assert_eq!(scan(&mut trie, None), sorted_from(&kept_keys, b""));

        for key in kept {
            trie.remove(key).expect("remove");
        }
        let stats = trie.stats().expect("stats");
        assert_eq!(stats.keys, 0);
        assert_eq!(stats.levels, 1, "{compact} {limit}");
        assert!(scan(&mut trie, None).is_empty());
    }
}

#[test]
fn test_empty_and_zero_padded_keys() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    let keys: [&[u8]; 4] = [b"", b"\0", b"\0\0\0\0\0\0\0\0", b"\0\0\0\0\0\0\0\0\0"];
    let values: Vec<Vec<u8>> = keys
        .iter()
        .map(|key| insert_key(&mut trie, &resolver, key))
        .collect();
    for (key, value) in keys.iter().zip(&values) {
        assert_eq!(&trie.find(key).expect("find"), value);
    }
    assert_eq!(scan(&mut trie, None), sorted_from(&keys, b""));
}

#[test]
fn test_iterator_exhaustion_is_sticky() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    let mut iter = trie.iter(None).expect("iter");
    assert!(matches!(iter.next_entry(), Err(HbTrieError::IteratorExhausted)));
    drop(iter);

    insert_key(&mut trie, &resolver, b"only");
    let mut iter = trie.iter(None).expect("iter");
    let (key, _) = iter.next_entry().expect("entry");
    assert_eq!(key, b"only");
    assert!(matches!(iter.next_entry(), Err(HbTrieError::IteratorExhausted)));
    assert!(matches!(iter.next_value_only(), Err(HbTrieError::IteratorExhausted)));
    assert!(iter.next().is_none());
    drop(iter);

    let mut iter = trie.iter(Some(b"zzz".as_slice())).expect("iter");
    assert!(matches!(iter.next_entry(), Err(HbTrieError::IteratorExhausted)));
}

#[test]
fn test_iterator_releases_cursors() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, trie_config(false, 2)).expect("trie");
    for key in SKEW_KEYS {
        insert_key(&mut trie, &resolver, key);
    }

    let mut iter = trie
        .iter(Some(b"dddddd_ddddddd_dd".as_slice()))
        .expect("iter");
    iter.next_entry().expect("entry");
    assert!(iter.open_cursors() >= 2);
    iter.free();
    assert_eq!(trie.blocks().open_cursors(), 0);

    let count = trie.iter(None).expect("iter").count();
    assert_eq!(count, SKEW_KEYS.len());
    assert_eq!(trie.blocks().open_cursors(), 0);
}

#[test]
fn test_flags_freeze_after_first_insert() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    trie.set_compact(true).expect("set compact");
    trie.set_compact(false).expect("set compact");
    insert_key(&mut trie, &resolver, b"k");

    assert!(matches!(trie.set_compact(true), Err(HbTrieError::FlagsFrozen)));
    assert!(matches!(
        trie.set_leaf_height_limit(3),
        Err(HbTrieError::FlagsFrozen)
    ));
    assert!(!trie.config().compact);
}

#[test]
fn test_argument_validation() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();

    let bad = TrieConfig {
        chunk_size: 0,
        ..TrieConfig::default()
    };
    assert!(matches!(
        HbTrie::new(&mut blocks, &resolver, bad),
        Err(HbTrieError::Config(_))
    ));

    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");
    assert!(matches!(trie.find(b"k"), Err(HbTrieError::KeyNotFound)));

    let long = vec![b'k'; MAX_KEY_LEN + 1];
    assert!(matches!(
        trie.insert(&long, &[0; 8]),
        Err(HbTrieError::KeyTooLong(_))
    ));
    assert!(matches!(
        trie.insert(b"k", &[0; 7]),
        Err(HbTrieError::InvalidValueSize {
            expected: 8,
            actual: 7
        })
    ));
    assert_eq!(trie.root(), 0);

    let longest = vec![b'k'; MAX_KEY_LEN];
    let value = resolver.push(&longest);
    trie.insert(&longest, &value).expect("insert longest key");
    assert_eq!(trie.find(&longest).expect("find"), value);
}

#[test]
fn test_resolver_mismatch_is_fatal() {
    let resolver = MemoryResolver::new();
    let mut blocks = memory_group();
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    // The value resolves to a key with a different first chunk
    let wrong = resolver.push(b"zzzzzzzz-elsewhere");
    trie.insert(b"abcdefgh-one", &wrong).expect("insert");
    let root = trie.root();

    let err = trie.find(b"abcdefgh-one").expect_err("mismatch");
    assert!(matches!(err, HbTrieError::ResolverMismatch));
    assert!(err.is_fatal());

    let value = resolver.push(b"abcdefgh-two");
    assert!(matches!(
        trie.insert(b"abcdefgh-two", &value),
        Err(HbTrieError::ResolverMismatch)
    ));
    assert_eq!(trie.root(), root);
    assert!(!trie.blocks().in_flight());
}

#[test]
fn test_failed_operation_leaves_trie_untouched() {
    init_tracing();
    let disk = MemoryDisk::new(7);
    let resolver = MemoryResolver::new();
    let mut blocks = open_memory_group(&disk, StoreConfig { cache_blocks: 0 });
    let mut trie = HbTrie::new(&mut blocks, &resolver, TrieConfig::default()).expect("trie");

    let keys: [&[u8]; 3] = [b"alpha", b"beta", b"alphabet-soup"];
    let values: Vec<Vec<u8>> = keys
        .iter()
        .map(|key| insert_key(&mut trie, &resolver, key))
        .collect();
    trie.commit().expect("commit");
    let root = trie.root();

    // Two reads find the level entry, the third fails after a sub-level
    // has been staged
    disk.set_fault_config(FaultConfig {
        fail_reads_after: Some(2),
        ..FaultConfig::default()
    });
    let value = resolver.push(b"alphabet-city");
    let err = trie
        .insert(b"alphabet-city", &value)
        .expect_err("read fault");
    assert!(matches!(err, HbTrieError::Block(_)));
    assert!(err.is_fatal());
    assert_eq!(trie.root(), root);
    assert!(!trie.blocks().in_flight());
    assert_eq!(trie.blocks().pending_blocks(), 0);

    disk.set_fault_config(FaultConfig::no_faults());
    for (key, expected) in keys.iter().zip(&values) {
        assert_eq!(&trie.find(key).expect("find"), expected);
    }
    assert!(matches!(
        trie.find(b"alphabet-city"),
        Err(HbTrieError::KeyNotFound)
    ));

    assert_eq!(trie.insert(b"alphabet-city", &value).expect("retry"), None);
    assert_eq!(trie.find(b"alphabet-city").expect("find"), value);
}

#[test]
fn test_uncommitted_inserts_lost_on_crash() {
    let disk = MemoryDisk::new(11);
    let resolver = MemoryResolver::new();
    let committed: Vec<Vec<u8>> = (0..300).map(|i| format!("committed/{i:05}").into_bytes()).collect();
    let lost: Vec<Vec<u8>> = (0..300).map(|i| format!("lost/{i:05}").into_bytes()).collect();

    {
        let mut blocks = open_memory_group(&disk, StoreConfig::default());
        let mut trie = HbTrie::new(&mut blocks, &resolver, trie_config(true, 0)).expect("trie");
        for key in &committed {
            insert_key(&mut trie, &resolver, key);
        }
        trie.commit().expect("commit");
        for key in &lost {
            insert_key(&mut trie, &resolver, key);
        }
    }
    disk.crash();

    let mut blocks = open_memory_group(&disk, StoreConfig::default());
    let mut trie = HbTrie::open(&mut blocks, &resolver, TrieConfig::default()).expect("open");
    assert!(trie.config().compact);
    for key in &committed {
        assert!(trie.find(key).is_ok());
    }
    for key in &lost {
        assert!(matches!(trie.find(key), Err(HbTrieError::KeyNotFound)));
    }
    assert_eq!(trie.stats().expect("stats").keys, committed.len());
}

#[test]
fn test_commit_and_reopen_file_store() {
    init_tracing();
    let dir = tempdir().expect("tempdir");
    let index_path = dir.path().join("index.hbt");
    let docs = DocLog::open(&dir.path().join("docs.log")).expect("open log");
    let config = TrieConfig {
        leaf_height_limit: 2,
        ..TrieConfig::default()
    };

    let mut rng = StdRng::seed_from_u64(3);
    let mut set = BTreeSet::new();
    while set.len() < 500 {
        let len = rng.random_range(1..32);
        let key: Vec<u8> = (0..len).map(|_| rng.random_range(b'!'..=b'~')).collect();
        set.insert(key);
    }
    let keys: Vec<Vec<u8>> = set.into_iter().collect();

    {
        let file = FileManager::create(&index_path).expect("create file");
        let mut blocks = BlockGroup::open(file, &StoreConfig::default()).expect("open group");
        let mut trie = HbTrie::new(&mut blocks, &docs, config).expect("trie");

        for (i, key) in keys.iter().enumerate() {
            let document = Document::new(key.clone(), "m", format!("body_{i}"));
            let offset = docs.append(&document).expect("append");
            trie.insert(key, &offset.to_le_bytes()).expect("insert");
        }
        // Point every key at a second version of its document
        for (i, key) in keys.iter().enumerate() {
            let document = Document::new(key.clone(), "me", format!("body2_{i}"));
            let offset = docs.append(&document).expect("append");
            let old = trie.insert(key, &offset.to_le_bytes()).expect("update");
            assert!(old.is_some());
        }
        docs.sync().expect("sync log");
        trie.commit().expect("commit");
    }

    let file = FileManager::open(&index_path).expect("open file");
    let mut blocks = BlockGroup::open(file, &StoreConfig::default()).expect("open group");
    let mut trie = HbTrie::open(&mut blocks, &docs, TrieConfig::default()).expect("open trie");
    assert_eq!(trie.config(), &config);

    for (i, key) in keys.iter().enumerate() {
        let value = trie.find(key).expect("find");
        let document = docs
            .read(read_reference(&value).expect("offset"))
            .expect("read document");
        assert_eq!(&document.key, key);
        assert_eq!(document.meta, b"me");
        assert_eq!(document.body, format!("body2_{i}").into_bytes());
    }
    assert_eq!(scan(&mut trie, None), keys);
}
