//! The KV state machine facade.
//!
//! Sits between the FSM caller and the engine: groups consecutive
//! same-kind operations into batches, routes each batch to the matching
//! engine call, and handles snapshot save/load and leader-state fanout.

use std::sync::atomic::AtomicI64;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::closure::KVClosure;
use crate::codec::default_serializer;
use crate::codec::Serializer;
use crate::error::RaftError;
use crate::error::RaftException;
use crate::error::Status;
use crate::executor::SingleThreadExecutor;
use crate::executor::TaskExecutor;
use crate::fsm::ApplyIterator;
use crate::fsm::SaveSnapshotClosure;
use crate::fsm::StateMachine;
use crate::listener::LeaderStateListener;
use crate::listener::LeaderStateNotifier;
use crate::metrics::KVMetrics;
use crate::operation::op;
use crate::operation::KVOperation;
use crate::storage::set_failure;
use crate::storage::snapshot::DirCopyArchiver;
use crate::storage::snapshot::LocalFileMeta;
use crate::storage::snapshot::SnapshotArchiver;
use crate::storage::snapshot::SnapshotReader;
use crate::storage::snapshot::SnapshotWriter;
use crate::storage::BatchRawKVStore;
use crate::storage::KVState;
use crate::storage::KVStateList;

/// Subdirectory of the snapshot writer holding engine data.
const SNAPSHOT_DIR: &str = "kv";
/// Archive name registered with the snapshot writer.
const SNAPSHOT_ARCHIVE: &str = "kv.zip";

/// Handles `RANGE_SPLIT` operations: hand a region range off to a new
/// region. Splitting policy lives outside this crate.
pub trait SplitHandler: Send + Sync {
    fn do_split(
        &self,
        from_region: u64,
        to_region: u64,
        split_key: &[u8],
        done: Option<KVClosure>,
    );
}

/// Construction parameters for [`KVStoreStateMachine`].
pub struct StateMachineOptions {
    pub region_id: u64,
    pub raw_store: Arc<dyn BatchRawKVStore>,
    pub serializer: Arc<dyn Serializer>,
    pub archiver: Arc<dyn SnapshotArchiver>,
    pub split_handler: Option<Arc<dyn SplitHandler>>,
    /// Runs archive compression off the apply thread.
    pub snapshot_executor: Arc<dyn TaskExecutor>,
    /// Runs leader-state listener fanout.
    pub leader_state_executor: Arc<dyn TaskExecutor>,
    pub metrics: Arc<KVMetrics>,
}

impl StateMachineOptions {
    pub fn new(region_id: u64, raw_store: Arc<dyn BatchRawKVStore>) -> Self {
        StateMachineOptions {
            region_id,
            raw_store,
            serializer: default_serializer(),
            archiver: Arc::new(DirCopyArchiver),
            split_handler: None,
            snapshot_executor: Arc::new(SingleThreadExecutor::new("kv-snapshot", 16)),
            leader_state_executor: Arc::new(SingleThreadExecutor::new("kv-leader-state", 1024)),
            metrics: Arc::new(KVMetrics::new()),
        }
    }
}

/// The replicated KV state machine for one region.
pub struct KVStoreStateMachine {
    region_id: u64,
    region_label: String,
    raw_store: Arc<dyn BatchRawKVStore>,
    serializer: Arc<dyn Serializer>,
    archiver: Arc<dyn SnapshotArchiver>,
    split_handler: Option<Arc<dyn SplitHandler>>,
    snapshot_executor: Arc<dyn TaskExecutor>,
    notifier: LeaderStateNotifier,
    /// Term while this replica leads the region, `-1` otherwise. Updated
    /// synchronously on the apply thread so `is_leader` is accurate there.
    leader_term: AtomicI64,
    metrics: Arc<KVMetrics>,
}

impl KVStoreStateMachine {
    pub fn new(opts: StateMachineOptions) -> Self {
        KVStoreStateMachine {
            region_id: opts.region_id,
            region_label: opts.region_id.to_string(),
            raw_store: opts.raw_store,
            serializer: opts.serializer,
            archiver: opts.archiver,
            split_handler: opts.split_handler,
            snapshot_executor: opts.snapshot_executor,
            notifier: LeaderStateNotifier::new(opts.leader_state_executor),
            leader_term: AtomicI64::new(-1),
            metrics: opts.metrics,
        }
    }

    pub fn region_id(&self) -> u64 {
        self.region_id
    }

    pub fn is_leader(&self) -> bool {
        self.leader_term.load(Ordering::Acquire) > 0
    }

    pub fn add_leader_state_listener(&self, listener: Arc<dyn LeaderStateListener>) {
        self.notifier.add_listener(listener);
    }

    fn batch_apply(&self, op_byte: u8, kv_states: KVStateList) {
        if kv_states.is_empty() {
            return;
        }
        self.metrics
            .record_apply(&self.region_label, crate::operation::op_name(op_byte), kv_states.len() as u64);
        self.metrics.record_batch(&self.region_label, kv_states.len());

        match op_byte {
            op::PUT => self.raw_store.batch_put(kv_states),
            op::PUT_IF_ABSENT => self.raw_store.batch_put_if_absent(kv_states),
            op::PUT_LIST => self.raw_store.batch_put_list(kv_states),
            op::DELETE => self.raw_store.batch_delete(kv_states),
            op::DELETE_RANGE => self.raw_store.batch_delete_range(kv_states),
            op::GET_SEQUENCE => self.raw_store.batch_get_sequence(kv_states),
            op::RESET_SEQUENCE => self.raw_store.batch_reset_sequence(kv_states),
            op::NODE_EXECUTE => self.raw_store.batch_node_execute(kv_states, self.is_leader()),
            op::KEY_LOCK => self.raw_store.batch_try_lock_with(kv_states),
            op::KEY_LOCK_RELEASE => self.raw_store.batch_release_lock_with(kv_states),
            op::GET => self.raw_store.batch_get(kv_states),
            op::MULTI_GET => self.raw_store.batch_multi_get(kv_states),
            op::SCAN => self.raw_store.batch_scan(kv_states),
            op::GET_PUT => self.raw_store.batch_get_and_put(kv_states),
            op::MERGE => self.raw_store.batch_merge(kv_states),
            op::RANGE_SPLIT => self.do_split(kv_states),
            _ => {
                // not in the dispatch table: the whole batch fails
                tracing::error!(op_byte, "unknown operation");
                let status = Status::new(
                    RaftError::IllegalOp,
                    format!("unknown operation: {}", op_byte),
                );
                for mut st in kv_states {
                    set_failure(st.done.take(), status.clone());
                }
            }
        }
    }

    fn do_split(&self, kv_states: KVStateList) {
        for mut st in kv_states {
            let done = st.done.take();
            match (&st.op, &self.split_handler) {
                (
                    KVOperation::RangeSplit {
                        from_region,
                        to_region,
                        split_key,
                    },
                    Some(handler),
                ) => handler.do_split(*from_region, *to_region, split_key, done),
                (KVOperation::RangeSplit { .. }, None) => set_failure(
                    done,
                    Status::new(RaftError::Inval, "no split handler configured"),
                ),
                _ => set_failure(
                    done,
                    Status::new(RaftError::IllegalOp, "operation does not match batch kind"),
                ),
            }
        }
    }
}

impl StateMachine for KVStoreStateMachine {
    fn on_apply(&self, iter: &mut ApplyIterator<'_>) {
        let mut kv_states: KVStateList = Vec::new();
        while iter.has_next() {
            let mut done = iter.take_closure();
            // a leader-attached closure carries the original operation, so
            // decoding is only paid on followers
            let kv_op = match done.as_mut().and_then(KVClosure::take_operation) {
                Some(kv_op) => kv_op,
                None => match self.serializer.decode_operation(iter.data()) {
                    Ok(kv_op) => kv_op,
                    Err(e) => {
                        // an undecodable entry breaks determinism; poison
                        // the pipeline instead of skipping it
                        tracing::error!(index = iter.index(), error = %e, "decode operation error");
                        let status = Status::new(
                            RaftError::Decode,
                            format!("decode operation error at index {}", iter.index()),
                        );
                        set_failure(done, status.clone());
                        iter.set_error_and_rollback(1, status);
                        break;
                    }
                },
            };
            if let Some(first) = kv_states.first() {
                if !first.is_same_op(&kv_op) {
                    let batch = std::mem::take(&mut kv_states);
                    let op_byte = batch[0].op.op_byte();
                    self.batch_apply(op_byte, batch);
                }
            }
            kv_states.push(KVState::of(kv_op, done));
            iter.next();
        }
        if let Some(first) = kv_states.first() {
            let op_byte = first.op.op_byte();
            self.batch_apply(op_byte, kv_states);
        }
    }

    fn on_snapshot_save(
        &self,
        writer: Arc<dyn SnapshotWriter>,
        done: Box<dyn SaveSnapshotClosure>,
    ) {
        let snapshot_path = writer.path().join(SNAPSHOT_DIR);
        // the engine write happens here, on the apply thread; only the
        // archive compression is deferred
        match self.raw_store.on_snapshot_save(&snapshot_path) {
            Ok(meta) => {
                let archiver = self.archiver.clone();
                self.snapshot_executor.execute(Box::new(move || {
                    compress_snapshot(archiver.as_ref(), writer.as_ref(), meta, done);
                }));
            }
            Err(e) => {
                tracing::error!(path = %snapshot_path.display(), error = %e, "fail to save snapshot");
                done.run(Status::new(
                    RaftError::Io,
                    format!("fail to save snapshot at {}: {}", snapshot_path.display(), e),
                ));
            }
        }
    }

    fn on_snapshot_load(&self, reader: Arc<dyn SnapshotReader>) -> bool {
        if self.is_leader() {
            tracing::warn!("leader is not supposed to load snapshot");
            return false;
        }
        let Some(meta) = reader.file_meta(SNAPSHOT_ARCHIVE) else {
            tracing::error!(path = %reader.path().display(), "cannot find kv snapshot file");
            return false;
        };
        let archive = reader.path().join(SNAPSHOT_ARCHIVE);
        if let Err(e) = self.archiver.extract(&archive, reader.path()) {
            tracing::error!(archive = %archive.display(), error = %e, "fail to extract snapshot archive");
            return false;
        }
        let snapshot_path = reader.path().join(SNAPSHOT_DIR);
        match self.raw_store.on_snapshot_load(&snapshot_path, &meta) {
            Ok(()) => true,
            Err(e) => {
                tracing::error!(path = %snapshot_path.display(), error = %e, "fail to load snapshot");
                false
            }
        }
    }

    fn on_leader_start(&self, term: u64) {
        tracing::info!(region = self.region_id, term, "leader start");
        self.leader_term.store(term as i64, Ordering::Release);
        // listeners may submit operations back into the state machine, so
        // they must never run on the apply thread
        self.notifier.notify_leader_start(term);
    }

    fn on_leader_stop(&self, status: Status) {
        tracing::info!(region = self.region_id, %status, "leader stop");
        // -1 means this replica was never the leader; listeners see the
        // raw value
        let old_term = self.leader_term.swap(-1, Ordering::AcqRel);
        self.notifier.notify_leader_stop(old_term);
    }

    fn on_error(&self, error: &RaftException) {
        tracing::error!(region = self.region_id, %error, "state machine error");
    }

    fn on_configuration_committed(&self, conf: &crate::entry::Configuration) {
        tracing::info!(region = self.region_id, peers = ?conf.peers(), "configuration committed");
    }

    fn on_shutdown(&self) {
        tracing::info!(region = self.region_id, "state machine shut down");
    }
}

fn compress_snapshot(
    archiver: &dyn SnapshotArchiver,
    writer: &dyn SnapshotWriter,
    meta: Option<LocalFileMeta>,
    done: Box<dyn SaveSnapshotClosure>,
) {
    let source = writer.path().join(SNAPSHOT_DIR);
    let archive = writer.path().join(SNAPSHOT_ARCHIVE);
    if let Err(e) = archiver.compress(&source, &archive) {
        tracing::error!(path = %source.display(), error = %e, "fail to compress snapshot");
        done.run(Status::new(
            RaftError::Io,
            format!("fail to compress snapshot at {}: {}", source.display(), e),
        ));
        return;
    }
    if writer.add_file(SNAPSHOT_ARCHIVE, meta) {
        done.run(Status::ok());
    } else {
        done.run(Status::new(
            RaftError::Io,
            format!("fail to add snapshot file: {}", archive.display()),
        ));
    }
}
