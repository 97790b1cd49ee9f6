//! Storage layer: the engine adapter and its shared vocabulary.

pub mod rocks;
pub mod snapshot;

#[cfg(test)]
mod test;

use std::path::Path;

use byteorder::BigEndian;
use byteorder::ByteOrder;

use crate::closure::KVClosure;
use crate::closure::OpResult;
use crate::error::Status;
use crate::error::StoreError;
use crate::operation::KVOperation;
use crate::storage::snapshot::LocalFileMeta;

/// Max operations folded into one atomic write batch; larger inputs are
/// split into chunks of this size.
pub const MAX_BATCH_WRITE_SIZE: usize = 128;

/// Well-known key of the fencing counter in the fencing column family.
pub const LOCK_FENCING_KEY: &[u8] = b"LOCK_FENCING_KEY";

/// An operation queued for application, paired with its completion handle.
///
/// Follower-replicated entries have no local closure.
#[derive(Debug)]
pub struct KVState {
    pub op: KVOperation,
    pub done: Option<KVClosure>,
}

impl KVState {
    pub fn of(op: KVOperation, done: Option<KVClosure>) -> Self {
        KVState { op, done }
    }

    pub fn is_same_op(&self, op: &KVOperation) -> bool {
        self.op.is_same_op(op)
    }
}

/// A run of same-kind operations handed to one engine batch call.
pub type KVStateList = Vec<KVState>;

pub(crate) fn set_success(done: Option<KVClosure>, data: OpResult) {
    if let Some(done) = done {
        done.success(data);
    }
}

pub(crate) fn set_failure(done: Option<KVClosure>, status: Status) {
    if let Some(done) = done {
        done.fail(status);
    }
}

pub(crate) fn fail_all(states: KVStateList, status: &Status) {
    for mut st in states {
        set_failure(st.done.take(), status.clone());
    }
}

/// Encode a u64 as 8 big-endian bytes, the on-disk format of sequence and
/// fencing values.
pub(crate) fn be_u64(v: u64) -> [u8; 8] {
    let mut buf = [0u8; 8];
    BigEndian::write_u64(&mut buf, v);
    buf
}

pub(crate) fn read_be_u64(buf: &[u8]) -> u64 {
    BigEndian::read_u64(buf)
}

/// Executes opaque `NODE_EXECUTE` jobs; leader-awareness lets a job act only
/// on the replica that currently owns the region.
pub trait NodeExecutor: Send + Sync {
    fn execute(&self, job: &[u8], is_leader: bool) -> Result<(), Status>;
}

/// The batched engine surface the state machine dispatches to.
///
/// Each `batch_*` method consumes its state list and completes every
/// closure, success or failure. Chunking and atomicity are the
/// implementation's concern.
pub trait BatchRawKVStore: Send + Sync {
    fn batch_put(&self, states: KVStateList);
    fn batch_put_if_absent(&self, states: KVStateList);
    fn batch_put_list(&self, states: KVStateList);
    fn batch_delete(&self, states: KVStateList);
    fn batch_delete_range(&self, states: KVStateList);
    fn batch_get_sequence(&self, states: KVStateList);
    fn batch_reset_sequence(&self, states: KVStateList);
    fn batch_get(&self, states: KVStateList);
    fn batch_multi_get(&self, states: KVStateList);
    fn batch_scan(&self, states: KVStateList);
    fn batch_get_and_put(&self, states: KVStateList);
    fn batch_merge(&self, states: KVStateList);
    fn batch_try_lock_with(&self, states: KVStateList);
    fn batch_release_lock_with(&self, states: KVStateList);
    fn batch_node_execute(&self, states: KVStateList, is_leader: bool);

    /// Persist the engine's data under `snapshot_path`. Runs on the apply
    /// thread so the snapshot observes state exactly as of the last applied
    /// index.
    fn on_snapshot_save(&self, snapshot_path: &Path) -> Result<Option<LocalFileMeta>, StoreError>;

    /// Replace the engine's data with the snapshot at `snapshot_path`.
    fn on_snapshot_load(&self, snapshot_path: &Path, meta: &LocalFileMeta)
        -> Result<(), StoreError>;
}
