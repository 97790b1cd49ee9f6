use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;
use tempfile::TempDir;

use crate::closure::KVClosure;
use crate::closure::OpResult;
use crate::error::Status;
use crate::error::StoreError;
use crate::lock::Acquirer;
use crate::lock::FIRST_TIME_SUCCESS;
use crate::lock::KEEP_LEASE_FAIL;
use crate::lock::KEEP_LEASE_SUCCESS;
use crate::lock::NEW_ACQUIRE_SUCCESS;
use crate::lock::REENTRANT_SUCCESS;
use crate::operation::KVEntry;
use crate::operation::KVOperation;
use crate::storage::rocks::RocksDBOptions;
use crate::storage::rocks::RocksKVStore;
use crate::storage::rocks::SstColumnFamily;
use crate::storage::snapshot::LocalFileMeta;
use crate::storage::BatchRawKVStore;
use crate::storage::KVState;

fn new_store(dir: &TempDir, fast_snapshot: bool) -> Arc<RocksKVStore> {
    let mut opts = RocksDBOptions::new(dir.path().join("db"));
    opts.fast_snapshot = fast_snapshot;
    RocksKVStore::open(opts).expect("open store")
}

type Results = Arc<Mutex<Vec<Result<OpResult, Status>>>>;

fn recording_state(op: KVOperation, results: &Results) -> KVState {
    let results = results.clone();
    KVState::of(
        op,
        Some(KVClosure::new(Box::new(move |res| {
            results.lock().push(res);
        }))),
    )
}

#[test]
fn test_put_get_delete_round_trip() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    store.put(b"a", b"1")?;
    assert_eq!(Some(b"1".to_vec()), store.get(b"a")?);

    store.delete(b"a")?;
    assert_eq!(None, store.get(b"a")?);
    Ok(())
}

#[test]
fn test_get_and_put_returns_previous_value() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    assert_eq!(None, store.get_and_put(b"k", b"v1")?);
    assert_eq!(Some(b"v1".to_vec()), store.get_and_put(b"k", b"v2")?);
    assert_eq!(Some(b"v2".to_vec()), store.get(b"k")?);
    Ok(())
}

#[test]
fn test_put_if_absent() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    assert_eq!(None, store.put_if_absent(b"k", b"v1")?);
    assert_eq!(Some(b"v1".to_vec()), store.put_if_absent(b"k", b"v2")?);
    assert_eq!(Some(b"v1".to_vec()), store.get(b"k")?);
    Ok(())
}

#[test]
fn test_put_list_and_multi_get() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    store.put_list(&[
        KVEntry::new(b"a".to_vec(), b"1".to_vec()),
        KVEntry::new(b"b".to_vec(), b"2".to_vec()),
    ])?;
    let map = store.multi_get(&[b"a".to_vec(), b"b".to_vec(), b"c".to_vec()])?;
    assert_eq!(Some(&Some(b"1".to_vec())), map.get(b"a".as_slice()));
    assert_eq!(Some(&Some(b"2".to_vec())), map.get(b"b".as_slice()));
    assert_eq!(Some(&None), map.get(b"c".as_slice()));
    Ok(())
}

#[test]
fn test_scan_half_open_range() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    for key in [b"a", b"b", b"c", b"d"] {
        store.put(key, key)?;
    }
    let entries = store.scan(Some(b"b"), Some(b"d"), 0)?;
    assert_eq!(2, entries.len());
    assert_eq!(b"b".to_vec(), entries[0].key);
    assert_eq!(b"b".to_vec(), entries[0].value);
    assert_eq!(b"c".to_vec(), entries[1].key);

    let limited = store.scan(None, None, 3)?;
    assert_eq!(3, limited.len());
    Ok(())
}

#[test]
fn test_delete_range() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    for key in [b"a", b"b", b"c", b"d"] {
        store.put(key, key)?;
    }
    store.delete_range(b"b", b"d")?;
    assert_eq!(Some(b"a".to_vec()), store.get(b"a")?);
    assert_eq!(None, store.get(b"b")?);
    assert_eq!(None, store.get(b"c")?);
    assert_eq!(Some(b"d".to_vec()), store.get(b"d")?);
    Ok(())
}

#[test]
fn test_merge_appends_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    store.merge(b"list", b"1")?;
    store.merge(b"list", b"2")?;
    let merged = store.get(b"list")?.expect("merged value");
    assert_eq!(b"1,2".to_vec(), merged);
    Ok(())
}

#[test]
fn test_sequence_ranges_are_disjoint_and_resettable() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    let s1 = store.get_sequence(b"s", 10)?;
    assert_eq!((0, 10), (s1.start, s1.end));
    let s2 = store.get_sequence(b"s", 5)?;
    assert_eq!((10, 15), (s2.start, s2.end));

    store.reset_sequence(b"s")?;
    let s3 = store.get_sequence(b"s", 3)?;
    assert_eq!((0, 3), (s3.start, s3.end));
    Ok(())
}

#[test]
fn test_sequence_saturates_at_i64_max() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    let s1 = store.get_sequence(b"s", i64::MAX)?;
    assert_eq!(i64::MAX as u64, s1.end);
    // saturated: further steps hand out empty ranges, never wrap
    let s2 = store.get_sequence(b"s", 5)?;
    assert_eq!(i64::MAX as u64, s2.start);
    assert_eq!(i64::MAX as u64, s2.end);
    Ok(())
}

#[test]
fn test_lock_reentrant_acquire_and_release() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    // first acquisition issues fencing token 1
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 100))?;
    assert!(owner.success);
    assert_eq!(1, owner.fencing_token);
    assert_eq!(1, owner.acquires);
    assert_eq!(FIRST_TIME_SUCCESS, owner.remaining_millis);

    // reentrant: same token, acquires bumped
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 500))?;
    assert!(owner.success);
    assert_eq!(1, owner.fencing_token);
    assert_eq!(2, owner.acquires);
    assert_eq!(REENTRANT_SUCCESS, owner.remaining_millis);

    let owner = store.release_lock_with(b"k", &Acquirer::new("A", 1000, 600))?;
    assert!(owner.success);
    assert_eq!(1, owner.acquires);

    let owner = store.release_lock_with(b"k", &Acquirer::new("A", 1000, 700))?;
    assert!(owner.success);
    assert_eq!(0, owner.acquires);
    // the record is gone: releasing again is an idempotent success
    let owner = store.release_lock_with(b"k", &Acquirer::new("A", 1000, 800))?;
    assert!(owner.success);
    assert_eq!(0, owner.acquires);
    Ok(())
}

#[test]
fn test_lock_contention_and_preemption() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 100))?;
    assert!(owner.success);
    assert_eq!(1, owner.fencing_token);

    // B arrives while A's lease is valid
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("B", 1000, 500))?;
    assert!(!owner.success);
    assert_eq!("A", owner.id);
    assert_eq!(600, owner.remaining_millis);

    // B preempts after A's lease expired; new fencing token
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("B", 1000, 1500))?;
    assert!(owner.success);
    assert_eq!(2, owner.fencing_token);
    assert_eq!(NEW_ACQUIRE_SUCCESS, owner.remaining_millis);
    Ok(())
}

#[test]
fn test_keep_lease_semantics() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    // keeping a lease that was never granted fails and writes nothing
    let owner = store.try_lock_with(b"k", true, &Acquirer::new("A", 1000, 100))?;
    assert!(!owner.success);
    assert_eq!(KEEP_LEASE_FAIL, owner.remaining_millis);

    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 100))?;
    assert!(owner.success);
    let token = owner.fencing_token;

    // keep-lease extends the deadline without a new token or acquire
    let owner = store.try_lock_with(b"k", true, &Acquirer::new("A", 1000, 900))?;
    assert!(owner.success);
    assert_eq!(KEEP_LEASE_SUCCESS, owner.remaining_millis);
    assert_eq!(token, owner.fencing_token);
    assert_eq!(1, owner.acquires);
    assert_eq!(1900, owner.deadline_millis);

    // keep-lease on an expired lock fails without clearing the record
    let owner = store.try_lock_with(b"k", true, &Acquirer::new("A", 1000, 5000))?;
    assert!(!owner.success);
    assert_eq!(KEEP_LEASE_FAIL, owner.remaining_millis);
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("B", 1000, 5000))?;
    assert!(owner.success);
    assert_eq!(NEW_ACQUIRE_SUCCESS, owner.remaining_millis);
    Ok(())
}

#[test]
fn test_wrong_acquirer_cannot_release() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 100))?;
    assert!(owner.success);

    let owner = store.release_lock_with(b"k", &Acquirer::new("B", 1000, 200))?;
    assert!(!owner.success);
    assert_eq!("A", owner.id);
    assert_eq!(1, owner.acquires);

    // A still holds it
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 300))?;
    assert!(owner.success);
    assert_eq!(2, owner.acquires);
    Ok(())
}

#[test]
fn test_fencing_tokens_survive_restart() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    {
        let store = new_store(&dir, true);
        let owner = store.try_lock_with(b"k", false, &Acquirer::new("A", 1000, 100))?;
        assert_eq!(1, owner.fencing_token);
        store.shutdown();
    }
    let store = new_store(&dir, true);
    // preempt after expiry on the reopened store
    let owner = store.try_lock_with(b"k", false, &Acquirer::new("B", 1000, 9000))?;
    assert!(owner.success);
    assert_eq!(2, owner.fencing_token);
    Ok(())
}

#[test]
fn test_batch_put_completes_all_closures() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let states = (0..300u32)
        .map(|i| {
            recording_state(
                KVOperation::Put {
                    key: format!("k{:04}", i).into_bytes(),
                    value: b"v".to_vec(),
                },
                &results,
            )
        })
        .collect();
    store.batch_put(states);

    let results = results.lock();
    assert_eq!(300, results.len());
    assert!(results.iter().all(|r| r.is_ok()));
    assert_eq!(Some(b"v".to_vec()), store.get(b"k0299")?);
    Ok(())
}

#[test]
fn test_batch_get_sequence_duplicate_keys_stay_disjoint() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let states = (0..3)
        .map(|_| {
            recording_state(
                KVOperation::GetSequence {
                    seq_key: b"s".to_vec(),
                    step: 10,
                },
                &results,
            )
        })
        .collect();
    store.batch_get_sequence(states);

    let results = results.lock();
    let mut ranges = Vec::new();
    for res in results.iter() {
        match res {
            Ok(OpResult::Sequence(seq)) => ranges.push((seq.start, seq.end)),
            other => panic!("unexpected result: {:?}", other),
        }
    }
    assert_eq!(vec![(0, 10), (10, 20), (20, 30)], ranges);
    assert_eq!((30, 35), {
        let s = store.get_sequence(b"s", 5)?;
        (s.start, s.end)
    });
    Ok(())
}

#[test]
fn test_batch_get_and_put_chains_previous_values() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);
    let results: Results = Arc::new(Mutex::new(Vec::new()));

    let states = vec![
        recording_state(
            KVOperation::GetAndPut {
                key: b"k".to_vec(),
                value: b"v1".to_vec(),
            },
            &results,
        ),
        recording_state(
            KVOperation::GetAndPut {
                key: b"k".to_vec(),
                value: b"v2".to_vec(),
            },
            &results,
        ),
    ];
    store.batch_get_and_put(states);

    let results = results.lock();
    assert_eq!(
        vec![
            Ok(OpResult::Value(None)),
            Ok(OpResult::Value(Some(b"v1".to_vec()))),
        ],
        *results
    );
    assert_eq!(Some(b"v2".to_vec()), store.get(b"k")?);
    Ok(())
}

#[test]
fn test_fast_snapshot_save_and_load() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    store.put(b"a", b"1")?;
    store.put(b"b", b"2")?;
    let snapshot_path = dir.path().join("snapshot").join("kv");
    std::fs::create_dir_all(snapshot_path.parent().unwrap())?;
    let meta = store.on_snapshot_save(&snapshot_path)?;
    assert!(meta.is_none(), "fast snapshots carry no file meta");

    // state diverges after the snapshot
    store.put(b"a", b"dirty")?;
    store.put(b"c", b"3")?;

    let version = store.database_version();
    store.on_snapshot_load(&snapshot_path, &LocalFileMeta::default())?;
    assert_eq!(version + 1, store.database_version());

    assert_eq!(Some(b"1".to_vec()), store.get(b"a")?);
    assert_eq!(Some(b"2".to_vec()), store.get(b"b")?);
    assert_eq!(None, store.get(b"c")?);
    Ok(())
}

#[test]
fn test_backup_snapshot_save_and_load() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, false);

    store.put(b"a", b"1")?;
    let backup_path = dir.path().join("backup").join("kv");
    let meta = store
        .on_snapshot_save(&backup_path)?
        .expect("backup snapshots carry a descriptor");
    assert!(meta.user_meta.is_some());

    store.put(b"a", b"dirty")?;
    store.put(b"b", b"2")?;

    store.on_snapshot_load(&backup_path, &meta)?;
    assert_eq!(Some(b"1".to_vec()), store.get(b"a")?);
    assert_eq!(None, store.get(b"b")?);
    Ok(())
}

#[test]
fn test_local_iterator_is_invalidated_by_reopen() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    for i in 0..10u8 {
        store.put(&[i], &[i])?;
    }
    let mut iter = store.clone().local_iterator();
    assert_eq!(vec![0u8], iter.next().unwrap()?.key);

    // snapshot load reopens the database underneath the iterator
    let snapshot_path = dir.path().join("snap").join("kv");
    std::fs::create_dir_all(snapshot_path.parent().unwrap())?;
    store.on_snapshot_save(&snapshot_path)?;
    store.on_snapshot_load(&snapshot_path, &LocalFileMeta::default())?;

    // the buffered stride may still drain, but a refill must fail
    let outcome = iter.find(|item| item.is_err());
    match outcome {
        Some(Err(StoreError::IteratorInvalidated { .. })) => {}
        other => panic!("expected invalidated iterator, got {:?}", other.map(|r| r.map(|e| e.key))),
    }
    Ok(())
}

#[test]
fn test_local_iterator_yields_all_entries_in_order() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    // more entries than one refill stride
    for i in 0..250u32 {
        store.put(format!("k{:04}", i).as_bytes(), b"v")?;
    }
    let keys: Vec<Vec<u8>> = store
        .clone()
        .local_iterator()
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|e| e.key)
        .collect();
    assert_eq!(250, keys.len());
    assert!(keys.windows(2).all(|w| w[0] < w[1]));
    Ok(())
}

#[test]
fn test_approximate_count_and_jump_over() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);

    for i in 0..500u32 {
        store.put(format!("k{:04}", i).as_bytes(), b"v")?;
    }
    let count = store.approximate_keys_in_range(None, None)?;
    assert_eq!(500, count);

    let key = store
        .jump_over(Some(b"k0000"), 100)?
        .expect("jump lands on a key");
    assert_eq!(b"k0099".to_vec(), key);
    Ok(())
}

#[test]
fn test_sst_dump_and_ingest_between_stores() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let store = new_store(&dir, true);
    for i in 0..50u32 {
        store.put(format!("k{:02}", i).as_bytes(), b"v")?;
    }
    store.get_sequence(b"seq", 7)?;

    let sst_dir = TempDir::new()?;
    let table: HashMap<SstColumnFamily, PathBuf> = [
        (SstColumnFamily::Default, sst_dir.path().join("default.sst")),
        (SstColumnFamily::Locking, sst_dir.path().join("lock.sst")),
    ]
    .into_iter()
    .collect();
    store.create_sst_files(&table, Some(b"k10"), Some(b"k20"))?;
    // the locking family was empty, so no file was produced
    assert!(!sst_dir.path().join("lock.sst").exists());

    let seq_table: HashMap<SstColumnFamily, PathBuf> =
        [(SstColumnFamily::Sequence, sst_dir.path().join("seq.sst"))]
            .into_iter()
            .collect();
    store.create_sst_files(&seq_table, None, None)?;

    let dir2 = TempDir::new()?;
    let target = new_store(&dir2, true);
    target.ingest_sst_files(&table)?;
    target.ingest_sst_files(&seq_table)?;
    assert_eq!(Some(b"v".to_vec()), target.get(b"k10")?);
    assert_eq!(Some(b"v".to_vec()), target.get(b"k19")?);
    assert_eq!(None, target.get(b"k20")?);
    let seq = target.get_sequence(b"seq", 1)?;
    assert_eq!(7, seq.start);
    Ok(())
}
