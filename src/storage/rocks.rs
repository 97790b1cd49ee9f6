//! Local KV store based on RocksDB.
//!
//! One instance per region, with four column families: `default` for user
//! data, plus dedicated families for sequences, lock records and the
//! fencing counter.
//!
//! Concurrency policy: the engine itself is thread-safe, so the outer
//! read-write lock only excludes lifecycle events. Everything except
//! snapshot save/load, restore and shutdown holds the read side; lifecycle
//! transitions (which close and reopen the database) hold the write side
//! and bump the database version, invalidating outstanding iterators.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyerror::AnyError;
use parking_lot::RwLock;
use rocksdb::backup::BackupEngine;
use rocksdb::backup::BackupEngineOptions;
use rocksdb::backup::RestoreOptions;
use rocksdb::checkpoint::Checkpoint;
use rocksdb::BlockBasedOptions;
use rocksdb::ColumnFamily;
use rocksdb::ColumnFamilyDescriptor;
use rocksdb::DBCompressionType;
use rocksdb::Direction;
use rocksdb::Env;
use rocksdb::IngestExternalFileOptions;
use rocksdb::IteratorMode;
use rocksdb::MergeOperands;
use rocksdb::Options;
use rocksdb::SstFileWriter;
use rocksdb::WriteBatch;
use rocksdb::WriteOptions;
use rocksdb::DB;

use crate::closure::OpResult;
use crate::codec::default_serializer;
use crate::codec::Serializer;
use crate::error::RaftError;
use crate::error::Status;
use crate::error::StoreError;
use crate::lock::Acquirer;
use crate::lock::Owner;
use crate::lock::FIRST_TIME_SUCCESS;
use crate::lock::KEEP_LEASE_FAIL;
use crate::lock::KEEP_LEASE_SUCCESS;
use crate::lock::NEW_ACQUIRE_SUCCESS;
use crate::lock::REENTRANT_SUCCESS;
use crate::operation::KVEntry;
use crate::operation::KVOperation;
use crate::operation::Sequence;
use crate::storage::be_u64;
use crate::storage::fail_all;
use crate::storage::read_be_u64;
use crate::storage::set_failure;
use crate::storage::set_success;
use crate::storage::snapshot::LocalFileMeta;
use crate::storage::snapshot::RocksBackupInfo;
use crate::storage::BatchRawKVStore;
use crate::storage::KVState;
use crate::storage::KVStateList;
use crate::storage::NodeExecutor;
use crate::storage::LOCK_FENCING_KEY;
use crate::storage::MAX_BATCH_WRITE_SIZE;

pub const CF_DEFAULT: &str = "default";
pub const CF_SEQUENCE: &str = "RHEA_SEQUENCE";
pub const CF_LOCKING: &str = "RHEA_LOCKING";
pub const CF_FENCING: &str = "RHEA_FENCING";

/// Keys buffered per lock acquisition by [`RocksKVIterator`].
const ITERATOR_STRIDE: usize = 100;

/// Stride for approximate counting; the upper bound is only checked once
/// per stride, which is fine for an approximation.
const COUNT_STRIDE: usize = 100;

/// Column families eligible for SST dump/ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SstColumnFamily {
    Default,
    Sequence,
    Locking,
    Fencing,
}

impl SstColumnFamily {
    fn cf_name(self) -> &'static str {
        match self {
            SstColumnFamily::Default => CF_DEFAULT,
            SstColumnFamily::Sequence => CF_SEQUENCE,
            SstColumnFamily::Locking => CF_LOCKING,
            SstColumnFamily::Fencing => CF_FENCING,
        }
    }
}

/// Engine tuning knobs. Defaults follow the RocksDB tuning guide for a
/// level-compaction write-heavy workload.
#[derive(Debug, Clone)]
pub struct RocksDBOptions {
    pub db_path: PathBuf,
    /// Sync every write to disk. Raft already persists the log, so the
    /// default is `false`.
    pub sync: bool,
    /// Fast snapshots use a hard-link checkpoint; otherwise an incremental
    /// backup set is produced.
    pub fast_snapshot: bool,
    pub max_open_files: i32,
    pub max_background_jobs: i32,
    pub max_log_file_size: usize,
    pub write_buffer_size: usize,
    pub max_write_buffer_number: i32,
    pub min_write_buffer_number_to_merge: i32,
    pub memtable_memory_budget: usize,
    pub level0_file_num_compaction_trigger: i32,
    pub level0_slowdown_writes_trigger: i32,
    pub level0_stop_writes_trigger: i32,
    pub max_bytes_for_level_base: u64,
    pub target_file_size_base: u64,
    pub block_size: usize,
}

impl RocksDBOptions {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        RocksDBOptions {
            db_path: db_path.into(),
            sync: false,
            fast_snapshot: false,
            max_open_files: 1024,
            max_background_jobs: 6,
            max_log_file_size: 64 << 20,
            write_buffer_size: 64 << 20,
            max_write_buffer_number: 3,
            min_write_buffer_number_to_merge: 1,
            memtable_memory_budget: 512 << 20,
            level0_file_num_compaction_trigger: 10,
            level0_slowdown_writes_trigger: 20,
            level0_stop_writes_trigger: 40,
            max_bytes_for_level_base: 512 << 20,
            target_file_size_base: 64 << 20,
            block_size: 4 << 10,
        }
    }
}

/// Thread-safe facade over one RocksDB instance.
pub struct RocksKVStore {
    state: RwLock<Option<DB>>,
    database_version: AtomicU64,
    opts: RocksDBOptions,
    serializer: Arc<dyn Serializer>,
    node_executor: Option<Arc<dyn NodeExecutor>>,
}

fn string_append_merge(
    _key: &[u8],
    existing: Option<&[u8]>,
    operands: &MergeOperands,
) -> Option<Vec<u8>> {
    let mut result = Vec::new();
    if let Some(v) = existing {
        result.extend_from_slice(v);
    }
    for operand in operands {
        if !result.is_empty() {
            result.push(b',');
        }
        result.extend_from_slice(operand);
    }
    Some(result)
}

fn cf<'a>(db: &'a DB, name: &'static str) -> Result<&'a ColumnFamily, StoreError> {
    db.cf_handle(name).ok_or(StoreError::MissingColumnFamily(name))
}

fn mismatch_status() -> Status {
    Status::new(RaftError::IllegalOp, "operation does not match batch kind")
}

fn complete_one(st: &mut KVState, res: Result<OpResult, StoreError>) {
    match res {
        Ok(data) => set_success(st.done.take(), data),
        Err(e) => set_failure(st.done.take(), e.to_status()),
    }
}

impl RocksKVStore {
    /// Open (or create) the database with the default serializer.
    pub fn open(opts: RocksDBOptions) -> Result<Arc<Self>, StoreError> {
        Self::open_with(opts, default_serializer(), None)
    }

    pub fn open_with(
        opts: RocksDBOptions,
        serializer: Arc<dyn Serializer>,
        node_executor: Option<Arc<dyn NodeExecutor>>,
    ) -> Result<Arc<Self>, StoreError> {
        let store = RocksKVStore {
            state: RwLock::new(None),
            database_version: AtomicU64::new(0),
            opts,
            serializer,
            node_executor,
        };
        {
            let mut guard = store.state.write();
            store.reopen_locked(&mut guard)?;
        }
        tracing::info!(path = %store.opts.db_path.display(), "rocksdb kv store started");
        Ok(Arc::new(store))
    }

    pub fn shutdown(&self) {
        let mut guard = self.state.write();
        if guard.take().is_some() {
            tracing::info!(path = %self.opts.db_path.display(), "rocksdb kv store shut down");
        }
    }

    /// Bumped on every (re)open; captured by iterators at creation time.
    pub fn database_version(&self) -> u64 {
        self.database_version.load(Ordering::Acquire)
    }

    pub fn is_fast_snapshot(&self) -> bool {
        self.opts.fast_snapshot
    }

    fn reopen_locked(&self, slot: &mut Option<DB>) -> Result<(), StoreError> {
        let db = Self::open_db(&self.opts)?;
        self.database_version.fetch_add(1, Ordering::AcqRel);
        *slot = Some(db);
        Ok(())
    }

    fn open_db(opts: &RocksDBOptions) -> Result<DB, StoreError> {
        let mut db_opts = Options::default();
        db_opts.create_if_missing(true);
        db_opts.create_missing_column_families(true);
        db_opts.set_max_open_files(opts.max_open_files);
        db_opts.set_max_background_jobs(opts.max_background_jobs);
        db_opts.set_max_log_file_size(opts.max_log_file_size);

        let descriptors = [CF_DEFAULT, CF_SEQUENCE, CF_LOCKING, CF_FENCING]
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Self::column_family_options(opts)))
            .collect::<Vec<_>>();
        Ok(DB::open_cf_descriptors(&db_opts, &opts.db_path, descriptors)?)
    }

    fn column_family_options(opts: &RocksDBOptions) -> Options {
        let mut block_opts = BlockBasedOptions::default();
        block_opts.set_block_size(opts.block_size);
        block_opts.set_bloom_filter(16.0, false);
        block_opts.set_cache_index_and_filter_blocks(true);

        let mut cf_opts = Options::default();
        cf_opts.set_block_based_table_factory(&block_opts);
        cf_opts.set_write_buffer_size(opts.write_buffer_size);
        cf_opts.set_max_write_buffer_number(opts.max_write_buffer_number);
        cf_opts.set_min_write_buffer_number_to_merge(opts.min_write_buffer_number_to_merge);
        cf_opts.set_compression_type(DBCompressionType::Lz4);
        cf_opts.optimize_level_style_compaction(opts.memtable_memory_budget);
        cf_opts.set_level_zero_file_num_compaction_trigger(opts.level0_file_num_compaction_trigger);
        cf_opts.set_level_zero_slowdown_writes_trigger(opts.level0_slowdown_writes_trigger);
        cf_opts.set_level_zero_stop_writes_trigger(opts.level0_stop_writes_trigger);
        cf_opts.set_max_bytes_for_level_base(opts.max_bytes_for_level_base);
        cf_opts.set_target_file_size_base(opts.target_file_size_base);
        cf_opts.set_memtable_prefix_bloom_ratio(0.125);
        cf_opts.set_merge_operator_associative("stringappend", string_append_merge);
        cf_opts
    }

    fn write_options(&self) -> WriteOptions {
        let mut wo = WriteOptions::default();
        wo.set_sync(self.opts.sync);
        wo.disable_wal(false);
        wo
    }

    fn with_db<T>(&self, f: impl FnOnce(&DB) -> Result<T, StoreError>) -> Result<T, StoreError> {
        let guard = self.state.read();
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::NotOpen),
        }
    }

    // ---- point and range operations -------------------------------------

    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| Ok(db.get(key)?))
    }

    pub fn multi_get(
        &self,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Option<Vec<u8>>>, StoreError> {
        self.with_db(|db| Self::do_multi_get(db, keys))
    }

    fn do_multi_get(
        db: &DB,
        keys: &[Vec<u8>],
    ) -> Result<HashMap<Vec<u8>, Option<Vec<u8>>>, StoreError> {
        let values = db.multi_get(keys);
        let mut map = HashMap::with_capacity(keys.len());
        for (key, value) in keys.iter().zip(values) {
            map.insert(key.clone(), value?);
        }
        Ok(map)
    }

    /// Scan `[start, end)` in key order, up to `limit` entries.
    /// `limit == 0` means unlimited.
    pub fn scan(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KVEntry>, StoreError> {
        self.with_db(|db| Self::do_scan(db, start, end, limit))
    }

    fn do_scan(
        db: &DB,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<KVEntry>, StoreError> {
        let max_count = if limit > 0 { limit } else { usize::MAX };
        let mode = match start {
            Some(s) => IteratorMode::From(s, Direction::Forward),
            None => IteratorMode::Start,
        };
        let mut entries = Vec::new();
        for item in db.iterator(mode) {
            let (key, value) = item?;
            if let Some(end) = end {
                if key.as_ref() >= end {
                    break;
                }
            }
            entries.push(KVEntry::new(key.into_vec(), value.into_vec()));
            if entries.len() >= max_count {
                break;
            }
        }
        Ok(entries)
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| Ok(db.put_opt(key, value, &self.write_options())?))
    }

    pub fn put_list(&self, entries: &[KVEntry]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let mut batch = WriteBatch::default();
            for entry in entries {
                batch.put(&entry.key, &entry.value);
            }
            Ok(db.write_opt(batch, &self.write_options())?)
        })
    }

    /// Store `value` only when `key` is absent; returns the previous value.
    pub fn put_if_absent(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let prev = db.get(key)?;
            if prev.is_none() {
                db.put_opt(key, value, &self.write_options())?;
            }
            Ok(prev)
        })
    }

    /// Store `value` and return the value visible just before the put.
    pub fn get_and_put(&self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let prev = db.get(key)?;
            db.put_opt(key, value, &self.write_options())?;
            Ok(prev)
        })
    }

    /// String-append merge: values merge into a comma-separated list.
    pub fn merge(&self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| Ok(db.merge_opt(key, value, &self.write_options())?))
    }

    pub fn delete(&self, key: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| Ok(db.delete_opt(key, &self.write_options())?))
    }

    /// Delete every key in `[start, end)`.
    pub fn delete_range(&self, start: &[u8], end: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let mut batch = WriteBatch::default();
            batch.delete_range(start, end);
            Ok(db.write_opt(batch, &self.write_options())?)
        })
    }

    // ---- sequences ------------------------------------------------------

    /// Atomically reserve `[prior, prior + step)` for `seq_key`, clamped at
    /// `i64::MAX`.
    pub fn get_sequence(&self, seq_key: &[u8], step: i64) -> Result<Sequence, StoreError> {
        self.with_db(|db| self.do_get_sequence(db, seq_key, step))
    }

    fn do_get_sequence(&self, db: &DB, seq_key: &[u8], step: i64) -> Result<Sequence, StoreError> {
        let seq_cf = cf(db, CF_SEQUENCE)?;
        let start = db
            .get_cf(seq_cf, seq_key)?
            .map(|b| read_be_u64(&b))
            .unwrap_or(0);
        let end = Self::advance_sequence(start, step);
        db.put_cf_opt(seq_cf, seq_key, be_u64(end), &self.write_options())?;
        Ok(Sequence { start, end })
    }

    /// Saturating advance: never wraps, never exceeds `i64::MAX`, never
    /// goes backwards.
    fn advance_sequence(start: u64, step: i64) -> u64 {
        let step = step.max(0) as u64;
        start.saturating_add(step).min(i64::MAX as u64).max(start)
    }

    pub fn reset_sequence(&self, seq_key: &[u8]) -> Result<(), StoreError> {
        self.with_db(|db| {
            let seq_cf = cf(db, CF_SEQUENCE)?;
            Ok(db.delete_cf_opt(seq_cf, seq_key, &self.write_options())?)
        })
    }

    // ---- distributed locks ----------------------------------------------

    pub fn try_lock_with(
        &self,
        key: &[u8],
        keep_lease: bool,
        acquirer: &Acquirer,
    ) -> Result<Owner, StoreError> {
        self.with_db(|db| self.do_try_lock(db, key, keep_lease, acquirer))
    }

    fn do_try_lock(
        &self,
        db: &DB,
        key: &[u8],
        keep_lease: bool,
        acquirer: &Acquirer,
    ) -> Result<Owner, StoreError> {
        let locking_cf = cf(db, CF_LOCKING)?;
        let now = acquirer.locking_timestamp;
        let lease = acquirer.lease_millis;
        let wo = self.write_options();

        let prev_bytes = db.get_cf(locking_cf, key)?;
        let Some(prev_bytes) = prev_bytes else {
            // no others own this lock
            if keep_lease {
                // it wants to keep a lease it no longer holds
                return Ok(Owner::builder()
                    .id(acquirer.id.as_str())
                    .remaining_millis(KEEP_LEASE_FAIL)
                    .success(false)
                    .build());
            }
            let owner = Owner::builder()
                .id(acquirer.id.as_str())
                .deadline_millis(now + lease)
                .remaining_millis(FIRST_TIME_SUCCESS)
                .fencing_token(self.next_fencing_token(db, LOCK_FENCING_KEY)?)
                .acquires(1)
                .context(acquirer.context.clone())
                .success(true)
                .build();
            db.put_cf_opt(locking_cf, key, self.serializer.encode_owner(&owner)?, &wo)?;
            return Ok(owner);
        };

        let prev_owner = self.serializer.decode_owner(&prev_bytes)?;
        let remaining = prev_owner.deadline_millis as i64 - now as i64;

        if remaining < 0 {
            // the previous owner is out of lease
            if keep_lease {
                return Ok(Owner::builder()
                    .id(prev_owner.id.as_str())
                    .deadline_millis(prev_owner.deadline_millis)
                    .remaining_millis(KEEP_LEASE_FAIL)
                    .context(prev_owner.context)
                    .success(false)
                    .build());
            }
            // preempt the expired owner
            let owner = Owner::builder()
                .id(acquirer.id.as_str())
                .deadline_millis(now + lease)
                .remaining_millis(NEW_ACQUIRE_SUCCESS)
                .fencing_token(self.next_fencing_token(db, LOCK_FENCING_KEY)?)
                .acquires(1)
                .context(acquirer.context.clone())
                .success(true)
                .build();
            db.put_cf_opt(locking_cf, key, self.serializer.encode_owner(&owner)?, &wo)?;
            return Ok(owner);
        }

        if prev_owner.is_same_acquirer(acquirer) {
            let owner = if keep_lease {
                // extend the lease; token and acquires are untouched
                Owner::builder()
                    .id(prev_owner.id.as_str())
                    .deadline_millis(now + lease)
                    .remaining_millis(KEEP_LEASE_SUCCESS)
                    .fencing_token(prev_owner.fencing_token)
                    .acquires(prev_owner.acquires)
                    .context(prev_owner.context)
                    .success(true)
                    .build()
            } else {
                // reentrant acquisition
                Owner::builder()
                    .id(prev_owner.id.as_str())
                    .deadline_millis(now + lease)
                    .remaining_millis(REENTRANT_SUCCESS)
                    .fencing_token(prev_owner.fencing_token)
                    .acquires(prev_owner.acquires + 1)
                    .context(acquirer.context.clone())
                    .success(true)
                    .build()
            };
            db.put_cf_opt(locking_cf, key, self.serializer.encode_owner(&owner)?, &wo)?;
            return Ok(owner);
        }

        // held by somebody else and still valid
        tracing::debug!(acquirer = %acquirer.id, owner = %prev_owner.id, "lock is held");
        Ok(Owner::builder()
            .id(prev_owner.id.as_str())
            .remaining_millis(remaining)
            .context(prev_owner.context)
            .success(false)
            .build())
    }

    pub fn release_lock_with(
        &self,
        key: &[u8],
        acquirer: &Acquirer,
    ) -> Result<Owner, StoreError> {
        self.with_db(|db| self.do_release_lock(db, key, acquirer))
    }

    fn do_release_lock(
        &self,
        db: &DB,
        key: &[u8],
        acquirer: &Acquirer,
    ) -> Result<Owner, StoreError> {
        let locking_cf = cf(db, CF_LOCKING)?;
        let wo = self.write_options();

        let Some(prev_bytes) = db.get_cf(locking_cf, key)? else {
            // releasing a lock that does not exist is idempotent
            tracing::warn!(acquirer = %acquirer.id, "lock not exist");
            return Ok(Owner::builder()
                .id(acquirer.id.as_str())
                .fencing_token(acquirer.fencing_token)
                .acquires(0)
                .success(true)
                .build());
        };

        let prev_owner = self.serializer.decode_owner(&prev_bytes)?;
        if prev_owner.is_same_acquirer(acquirer) {
            let acquires = prev_owner.acquires.saturating_sub(1);
            let owner = Owner::builder()
                .id(prev_owner.id.as_str())
                .deadline_millis(prev_owner.deadline_millis)
                .fencing_token(prev_owner.fencing_token)
                .acquires(acquires)
                .context(prev_owner.context)
                .success(true)
                .build();
            if acquires == 0 {
                db.delete_cf_opt(locking_cf, key, &wo)?;
            } else {
                db.put_cf_opt(locking_cf, key, self.serializer.encode_owner(&owner)?, &wo)?;
            }
            return Ok(owner);
        }

        // wrong acquirer; echo the real owner back, touch nothing
        tracing::warn!(acquirer = %acquirer.id, owner = %prev_owner.id, "cannot release lock");
        Ok(Owner::builder()
            .id(prev_owner.id.as_str())
            .fencing_token(prev_owner.fencing_token)
            .acquires(prev_owner.acquires)
            .context(prev_owner.context)
            .success(false)
            .build())
    }

    /// Strictly increasing, never reused, never rolled back. Token number
    /// overflow is not a practical concern: at one million grants per
    /// second the u64 range lasts for hundreds of thousands of years.
    fn next_fencing_token(&self, db: &DB, fencing_key: &[u8]) -> Result<u64, StoreError> {
        let fencing_cf = cf(db, CF_FENCING)?;
        let prev = db
            .get_cf(fencing_cf, fencing_key)?
            .map(|b| read_be_u64(&b))
            .unwrap_or(0);
        let next = prev + 1;
        db.put_cf_opt(fencing_cf, fencing_key, be_u64(next), &self.write_options())?;
        Ok(next)
    }

    // ---- iteration helpers ----------------------------------------------

    /// Cursor over the default column family. The cursor captures the
    /// database version and fails once the engine is reopened underneath it.
    pub fn local_iterator(self: Arc<Self>) -> RocksKVIterator {
        RocksKVIterator {
            version: self.database_version(),
            store: self,
            buffer: VecDeque::new(),
            last_key: None,
            exhausted: false,
        }
    }

    /// Count keys in `[start, end)` on a consistent snapshot, in strides.
    pub fn approximate_keys_in_range(
        &self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<u64, StoreError> {
        self.with_db(|db| {
            let snapshot = db.snapshot();
            let mode = match start {
                Some(s) => IteratorMode::From(s, Direction::Forward),
                None => IteratorMode::Start,
            };
            let mut iter = snapshot.iterator(mode);
            let mut count: u64 = 0;
            loop {
                let mut last_key: Option<Box<[u8]>> = None;
                for _ in 0..COUNT_STRIDE {
                    match iter.next() {
                        Some(item) => {
                            let (key, _value) = item?;
                            last_key = Some(key);
                            count += 1;
                        }
                        None => return Ok(count),
                    }
                }
                if let (Some(end), Some(key)) = (end, &last_key) {
                    if key.as_ref() >= end {
                        return Ok(count);
                    }
                }
            }
        })
    }

    /// Walk `distance` keys forward from `start` on a consistent snapshot
    /// and return the key landed on, or the last key if the range is
    /// shorter. Used to pick region split points.
    pub fn jump_over(
        &self,
        start: Option<&[u8]>,
        distance: u64,
    ) -> Result<Option<Vec<u8>>, StoreError> {
        self.with_db(|db| {
            let snapshot = db.snapshot();
            let mode = match start {
                Some(s) => IteratorMode::From(s, Direction::Forward),
                None => IteratorMode::Start,
            };
            let mut walked: u64 = 0;
            let mut last_key = None;
            for item in snapshot.iterator(mode) {
                let (key, _value) = item?;
                walked += 1;
                last_key = Some(key.into_vec());
                if walked >= distance {
                    break;
                }
            }
            Ok(last_key)
        })
    }

    // ---- sst dump / ingest (region split data transfer) -----------------

    /// Dump `[start, end)` of each listed column family into an SST file,
    /// from one consistent snapshot. Families with no data in range produce
    /// no file.
    pub fn create_sst_files(
        &self,
        sst_file_table: &HashMap<SstColumnFamily, PathBuf>,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        self.with_db(|db| {
            let snapshot = db.snapshot();
            let sst_opts = {
                let mut o = Options::default();
                o.set_merge_operator_associative("stringappend", string_append_merge);
                o
            };
            for (family, sst_path) in sst_file_table {
                let handle = cf(db, family.cf_name())?;
                let mode = match start {
                    Some(s) => IteratorMode::From(s, Direction::Forward),
                    None => IteratorMode::Start,
                };
                let mut writer: Option<SstFileWriter> = None;
                for item in snapshot.iterator_cf(handle, mode) {
                    let (key, value) = item?;
                    if let Some(end) = end {
                        if key.as_ref() >= end {
                            break;
                        }
                    }
                    if writer.is_none() {
                        let mut w = SstFileWriter::create(&sst_opts);
                        w.open(sst_path)?;
                        writer = Some(w);
                    }
                    if let Some(w) = writer.as_mut() {
                        w.put(&key, &value)?;
                    }
                }
                if let Some(mut w) = writer.take() {
                    w.finish()?;
                }
            }
            Ok(())
        })
    }

    /// Atomically ingest previously dumped SST files. Missing files are
    /// skipped (their range was empty at dump time).
    pub fn ingest_sst_files(
        &self,
        sst_file_table: &HashMap<SstColumnFamily, PathBuf>,
    ) -> Result<(), StoreError> {
        self.with_db(|db| {
            for (family, sst_path) in sst_file_table {
                if !sst_path.exists() {
                    continue;
                }
                let handle = cf(db, family.cf_name())?;
                let ingest_opts = IngestExternalFileOptions::default();
                db.ingest_external_file_cf_opts(handle, &ingest_opts, vec![sst_path.clone()])?;
            }
            Ok(())
        })
    }

    // ---- snapshot save / load -------------------------------------------

    #[tracing::instrument(level = "debug", skip(self))]
    fn write_snapshot(&self, snapshot_path: &Path) -> Result<(), StoreError> {
        let guard = self.state.write();
        let Some(db) = guard.as_ref() else {
            return Err(StoreError::NotOpen);
        };
        if snapshot_path.exists() {
            fs::remove_dir_all(snapshot_path)?;
        }
        let checkpoint = Checkpoint::new(db)?;
        checkpoint.create_checkpoint(snapshot_path)?;
        Ok(())
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn read_snapshot(&self, snapshot_path: &Path) -> Result<(), StoreError> {
        let mut guard = self.state.write();
        if !snapshot_path.exists() {
            return Err(StoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("snapshot dir {} not exists", snapshot_path.display()),
            )));
        }
        // close, swap the checkpoint in, reopen
        *guard = None;
        let db_path = &self.opts.db_path;
        if db_path.exists() {
            fs::remove_dir_all(db_path)?;
        }
        fs::rename(snapshot_path, db_path)?;
        self.reopen_locked(&mut guard)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    fn backup_db(&self, backup_path: &Path) -> Result<LocalFileMeta, StoreError> {
        let guard = self.state.write();
        let Some(db) = guard.as_ref() else {
            return Err(StoreError::NotOpen);
        };
        let backup_opts = BackupEngineOptions::new(backup_path)?;
        let env = Env::new()?;
        let mut backup_engine = BackupEngine::open(&backup_opts, &env)?;
        backup_engine.create_new_backup_flush(db, true)?;
        let info = backup_engine
            .get_backup_info()
            .into_iter()
            .max_by_key(|info| info.backup_id)
            .ok_or_else(|| StoreError::Other(AnyError::error("empty backup info")))?;
        let backup_info = RocksBackupInfo {
            backup_id: info.backup_id,
            timestamp: info.timestamp,
            size: info.size,
            num_files: info.num_files,
        };
        tracing::info!(path = %backup_path.display(), ?backup_info, "backup finished");
        Ok(LocalFileMeta {
            user_meta: Some(self.serializer.encode_backup_info(&backup_info)?),
        })
    }

    #[tracing::instrument(level = "debug", skip(self, meta))]
    fn restore_backup(
        &self,
        backup_path: &Path,
        meta: &LocalFileMeta,
    ) -> Result<(), StoreError> {
        let mut guard = self.state.write();
        let user_meta = meta
            .user_meta
            .as_deref()
            .ok_or_else(|| StoreError::Other(AnyError::error("missing backup descriptor")))?;
        let backup_info = self.serializer.decode_backup_info(user_meta)?;
        // close before restoring over the db path
        *guard = None;
        let backup_opts = BackupEngineOptions::new(backup_path)?;
        let env = Env::new()?;
        let mut backup_engine = BackupEngine::open(&backup_opts, &env)?;
        backup_engine.restore_from_backup(
            &self.opts.db_path,
            &self.opts.db_path,
            &RestoreOptions::default(),
            backup_info.backup_id,
        )?;
        tracing::info!(path = %backup_path.display(), ?backup_info, "restored from backup");
        self.reopen_locked(&mut guard)
    }
}

impl BatchRawKVStore for RocksKVStore {
    fn batch_put(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            for st in chunk.iter_mut() {
                match &st.op {
                    KVOperation::Put { key, value } => batch.put(key, value),
                    _ => set_failure(st.done.take(), mismatch_status()),
                }
            }
            Self::finish_write_chunk(db, &wo, batch, chunk, "BATCH_PUT");
        }
    }

    fn batch_put_if_absent(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            // values written earlier in this chunk must be visible to later
            // operations on the same key
            let mut pending: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
            let mut results: Vec<Result<OpResult, Status>> = Vec::with_capacity(chunk.len());
            for st in chunk.iter() {
                match &st.op {
                    KVOperation::PutIfAbsent { key, value } => {
                        let prev = match pending.get(key) {
                            Some(v) => Some(v.clone()),
                            None => match db.get(key) {
                                Ok(v) => v,
                                Err(e) => {
                                    results.push(Err(StoreError::from(e).to_status()));
                                    continue;
                                }
                            },
                        };
                        if prev.is_none() {
                            batch.put(key, value);
                            pending.insert(key.clone(), value.clone());
                        }
                        results.push(Ok(OpResult::Value(prev)));
                    }
                    _ => results.push(Err(mismatch_status())),
                }
            }
            Self::finish_read_write_chunk(db, &wo, batch, chunk, results, "BATCH_PUT_IF_ABSENT");
        }
    }

    fn batch_put_list(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            for st in chunk.iter_mut() {
                match &st.op {
                    KVOperation::PutList { entries } => {
                        for entry in entries {
                            batch.put(&entry.key, &entry.value);
                        }
                    }
                    _ => set_failure(st.done.take(), mismatch_status()),
                }
            }
            Self::finish_write_chunk(db, &wo, batch, chunk, "BATCH_PUT_LIST");
        }
    }

    fn batch_delete(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            for st in chunk.iter_mut() {
                match &st.op {
                    KVOperation::Delete { key } => batch.delete(key),
                    _ => set_failure(st.done.take(), mismatch_status()),
                }
            }
            Self::finish_write_chunk(db, &wo, batch, chunk, "BATCH_DELETE");
        }
    }

    fn batch_delete_range(&self, mut states: KVStateList) {
        // range tombstones are applied one write batch at a time
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for st in states.iter_mut() {
            match &st.op {
                KVOperation::DeleteRange { start_key, end_key } => {
                    let mut batch = WriteBatch::default();
                    batch.delete_range(start_key, end_key);
                    match db.write_opt(batch, &wo) {
                        Ok(()) => set_success(st.done.take(), OpResult::Bool(true)),
                        Err(e) => {
                            tracing::error!(error = %e, "fail to [BATCH_DELETE_RANGE]");
                            set_failure(st.done.take(), StoreError::from(e).to_status());
                        }
                    }
                }
                _ => set_failure(st.done.take(), mismatch_status()),
            }
        }
    }

    fn batch_get_sequence(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let seq_cf = match cf(db, CF_SEQUENCE) {
            Ok(c) => c,
            Err(e) => {
                let status = e.to_status();
                drop(guard);
                fail_all(states, &status);
                return;
            }
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            // a key drawn twice in one chunk must hand out disjoint ranges
            let mut pending: HashMap<Vec<u8>, u64> = HashMap::new();
            let mut results: Vec<Result<OpResult, Status>> = Vec::with_capacity(chunk.len());
            for st in chunk.iter() {
                match &st.op {
                    KVOperation::GetSequence { seq_key, step } => {
                        let start = match pending.get(seq_key) {
                            Some(v) => *v,
                            None => match db.get_cf(seq_cf, seq_key) {
                                Ok(v) => v.map(|b| read_be_u64(&b)).unwrap_or(0),
                                Err(e) => {
                                    results.push(Err(StoreError::from(e).to_status()));
                                    continue;
                                }
                            },
                        };
                        let end = Self::advance_sequence(start, *step);
                        batch.put_cf(seq_cf, seq_key, be_u64(end));
                        pending.insert(seq_key.clone(), end);
                        results.push(Ok(OpResult::Sequence(Sequence { start, end })));
                    }
                    _ => results.push(Err(mismatch_status())),
                }
            }
            Self::finish_read_write_chunk(db, &wo, batch, chunk, results, "BATCH_GET_SEQUENCE");
        }
    }

    fn batch_reset_sequence(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let seq_cf = match cf(db, CF_SEQUENCE) {
            Ok(c) => c,
            Err(e) => {
                let status = e.to_status();
                drop(guard);
                fail_all(states, &status);
                return;
            }
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            for st in chunk.iter_mut() {
                match &st.op {
                    KVOperation::ResetSequence { seq_key } => batch.delete_cf(seq_cf, seq_key),
                    _ => set_failure(st.done.take(), mismatch_status()),
                }
            }
            Self::finish_write_chunk(db, &wo, batch, chunk, "BATCH_RESET_SEQUENCE");
        }
    }

    fn batch_get(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        for st in states.iter_mut() {
            let res = match &st.op {
                KVOperation::Get { key } => db
                    .get(key)
                    .map(OpResult::Value)
                    .map_err(StoreError::from),
                _ => {
                    set_failure(st.done.take(), mismatch_status());
                    continue;
                }
            };
            complete_one(st, res);
        }
    }

    fn batch_multi_get(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        for st in states.iter_mut() {
            let res = match &st.op {
                KVOperation::MultiGet { keys } => {
                    Self::do_multi_get(db, keys).map(OpResult::ValueMap)
                }
                _ => {
                    set_failure(st.done.take(), mismatch_status());
                    continue;
                }
            };
            complete_one(st, res);
        }
    }

    fn batch_scan(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        for st in states.iter_mut() {
            let res = match &st.op {
                KVOperation::Scan {
                    start_key,
                    end_key,
                    limit,
                } => Self::do_scan(db, start_key.as_deref(), end_key.as_deref(), *limit)
                    .map(OpResult::Entries),
                _ => {
                    set_failure(st.done.take(), mismatch_status());
                    continue;
                }
            };
            complete_one(st, res);
        }
    }

    fn batch_get_and_put(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            let mut pending: HashMap<Vec<u8>, Vec<u8>> = HashMap::new();
            let mut results: Vec<Result<OpResult, Status>> = Vec::with_capacity(chunk.len());
            for st in chunk.iter() {
                match &st.op {
                    KVOperation::GetAndPut { key, value } => {
                        let prev = match pending.get(key) {
                            Some(v) => Some(v.clone()),
                            None => match db.get(key) {
                                Ok(v) => v,
                                Err(e) => {
                                    results.push(Err(StoreError::from(e).to_status()));
                                    continue;
                                }
                            },
                        };
                        batch.put(key, value);
                        pending.insert(key.clone(), value.clone());
                        results.push(Ok(OpResult::Value(prev)));
                    }
                    _ => results.push(Err(mismatch_status())),
                }
            }
            Self::finish_read_write_chunk(db, &wo, batch, chunk, results, "BATCH_GET_PUT");
        }
    }

    fn batch_merge(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        let wo = self.write_options();
        for chunk in states.chunks_mut(MAX_BATCH_WRITE_SIZE) {
            let mut batch = WriteBatch::default();
            for st in chunk.iter_mut() {
                match &st.op {
                    KVOperation::Merge { key, value } => batch.merge(key, value),
                    _ => set_failure(st.done.take(), mismatch_status()),
                }
            }
            Self::finish_write_chunk(db, &wo, batch, chunk, "BATCH_MERGE");
        }
    }

    fn batch_try_lock_with(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        for st in states.iter_mut() {
            let res = match &st.op {
                KVOperation::KeyLock {
                    key,
                    keep_lease,
                    acquirer,
                } => self
                    .do_try_lock(db, key, *keep_lease, acquirer)
                    .map(OpResult::Owner),
                _ => {
                    set_failure(st.done.take(), mismatch_status());
                    continue;
                }
            };
            complete_one(st, res);
        }
    }

    fn batch_release_lock_with(&self, mut states: KVStateList) {
        let guard = self.state.read();
        let Some(db) = guard.as_ref() else {
            drop(guard);
            fail_all(states, &StoreError::NotOpen.to_status());
            return;
        };
        for st in states.iter_mut() {
            let res = match &st.op {
                KVOperation::KeyLockRelease { key, acquirer } => self
                    .do_release_lock(db, key, acquirer)
                    .map(OpResult::Owner),
                _ => {
                    set_failure(st.done.take(), mismatch_status());
                    continue;
                }
            };
            complete_one(st, res);
        }
    }

    fn batch_node_execute(&self, mut states: KVStateList, is_leader: bool) {
        for st in states.iter_mut() {
            match &st.op {
                KVOperation::NodeExecute { job } => match &self.node_executor {
                    Some(executor) => match executor.execute(job, is_leader) {
                        Ok(()) => set_success(st.done.take(), OpResult::Bool(true)),
                        Err(status) => set_failure(st.done.take(), status),
                    },
                    None => set_failure(
                        st.done.take(),
                        Status::new(RaftError::Inval, "no node executor configured"),
                    ),
                },
                _ => set_failure(st.done.take(), mismatch_status()),
            }
        }
    }

    fn on_snapshot_save(&self, snapshot_path: &Path) -> Result<Option<LocalFileMeta>, StoreError> {
        if self.opts.fast_snapshot {
            self.write_snapshot(snapshot_path)?;
            Ok(None)
        } else {
            fs::create_dir_all(snapshot_path)?;
            self.backup_db(snapshot_path).map(Some)
        }
    }

    fn on_snapshot_load(
        &self,
        snapshot_path: &Path,
        meta: &LocalFileMeta,
    ) -> Result<(), StoreError> {
        if self.opts.fast_snapshot {
            self.read_snapshot(snapshot_path)
        } else {
            self.restore_backup(snapshot_path, meta)
        }
    }
}

impl RocksKVStore {
    /// Commit a write-only chunk and complete its closures.
    fn finish_write_chunk(
        db: &DB,
        wo: &WriteOptions,
        batch: WriteBatch,
        chunk: &mut [KVState],
        op_label: &str,
    ) {
        match db.write_opt(batch, wo) {
            Ok(()) => {
                for st in chunk.iter_mut() {
                    set_success(st.done.take(), OpResult::Bool(true));
                }
            }
            Err(e) => {
                tracing::error!(size = chunk.len(), error = %e, "fail to [{}]", op_label);
                let status = StoreError::from(e).to_status();
                for st in chunk.iter_mut() {
                    set_failure(st.done.take(), status.clone());
                }
            }
        }
    }

    /// Commit a read-modify-write chunk whose per-state results were
    /// precomputed; a failed commit overrides every pending success.
    fn finish_read_write_chunk(
        db: &DB,
        wo: &WriteOptions,
        batch: WriteBatch,
        chunk: &mut [KVState],
        mut results: Vec<Result<OpResult, Status>>,
        op_label: &str,
    ) {
        if let Err(e) = db.write_opt(batch, wo) {
            tracing::error!(size = chunk.len(), error = %e, "fail to [{}]", op_label);
            let status = StoreError::from(e).to_status();
            for res in results.iter_mut() {
                if res.is_ok() {
                    *res = Err(status.clone());
                }
            }
        }
        for (st, res) in chunk.iter_mut().zip(results) {
            match res {
                Ok(data) => set_success(st.done.take(), data),
                Err(status) => set_failure(st.done.take(), status),
            }
        }
    }
}

/// Buffered cursor over the default column family.
///
/// Yields entries in key order; re-acquires the engine read lock per
/// stride and fails with [`StoreError::IteratorInvalidated`] if the
/// database was reopened since creation.
pub struct RocksKVIterator {
    store: Arc<RocksKVStore>,
    version: u64,
    buffer: VecDeque<KVEntry>,
    last_key: Option<Vec<u8>>,
    exhausted: bool,
}

impl RocksKVIterator {
    fn refill(&mut self) -> Result<(), StoreError> {
        if self.exhausted || !self.buffer.is_empty() {
            return Ok(());
        }
        let guard = self.store.state.read();
        let Some(db) = guard.as_ref() else {
            return Err(StoreError::NotOpen);
        };
        let current = self.store.database_version();
        if current != self.version {
            return Err(StoreError::IteratorInvalidated {
                created: self.version,
                current,
            });
        }
        let mode = match &self.last_key {
            Some(key) => IteratorMode::From(key.as_slice(), Direction::Forward),
            None => IteratorMode::Start,
        };
        for item in db.iterator(mode) {
            let (key, value) = item?;
            if let Some(last) = &self.last_key {
                if key.as_ref() == last.as_slice() {
                    continue;
                }
            }
            self.buffer
                .push_back(KVEntry::new(key.into_vec(), value.into_vec()));
            if self.buffer.len() >= ITERATOR_STRIDE {
                break;
            }
        }
        match self.buffer.back() {
            Some(entry) => self.last_key = Some(entry.key.clone()),
            None => self.exhausted = true,
        }
        Ok(())
    }
}

impl Iterator for RocksKVIterator {
    type Item = Result<KVEntry, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buffer.is_empty() {
            if let Err(e) = self.refill() {
                self.exhausted = true;
                return Some(Err(e));
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
