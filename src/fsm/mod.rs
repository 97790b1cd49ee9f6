//! The finite-state-machine caller: the bridge between consensus and the
//! user state machine.

mod caller;
mod event;
mod iterator;

pub use caller::FsmCaller;
pub use caller::FsmCallerOptions;
pub use iterator::ApplyIterator;

use std::sync::Arc;

use crate::entry::Configuration;
use crate::entry::ConfigurationEntry;
use crate::entry::LeaderChangeContext;
use crate::entry::LogEntry;
use crate::entry::LogId;
use crate::error::RaftException;
use crate::error::Status;
use crate::storage::snapshot::SnapshotMeta;
use crate::storage::snapshot::SnapshotReader;
use crate::storage::snapshot::SnapshotWriter;

/// Read access to the replicated log, plus the applied-id watermark the log
/// manager needs for safe truncation.
pub trait LogManager: Send + Sync {
    fn get_entry(&self, index: u64) -> Option<LogEntry>;

    fn get_term(&self, index: u64) -> u64;

    /// The configuration in effect at `index`.
    fn get_configuration(&self, index: u64) -> Option<ConfigurationEntry>;

    /// Everything at or below `applied` may be truncated.
    fn set_applied_id(&self, applied: LogId);
}

/// Callbacks the driver dispatches, all on the single apply thread.
///
/// Implementations override what they need; lifecycle notifications default
/// to no-ops.
pub trait StateMachine: Send + Sync {
    /// Apply committed data entries. The state machine must consume at
    /// least one entry per call by advancing the iterator.
    fn on_apply(&self, iter: &mut ApplyIterator<'_>);

    /// Persist state as of the moment this is called; report through
    /// `done` (possibly from another thread, e.g. after compression).
    fn on_snapshot_save(&self, writer: Arc<dyn SnapshotWriter>, done: Box<dyn SaveSnapshotClosure>);

    /// Replace state from a snapshot. Returns `false` on failure, which
    /// poisons the pipeline.
    fn on_snapshot_load(&self, reader: Arc<dyn SnapshotReader>) -> bool;

    fn on_shutdown(&self) {}

    fn on_leader_start(&self, _term: u64) {}

    fn on_leader_stop(&self, _status: Status) {}

    fn on_error(&self, _error: &RaftException) {}

    fn on_configuration_committed(&self, _conf: &Configuration) {}

    fn on_start_following(&self, _ctx: &LeaderChangeContext) {}

    fn on_stop_following(&self, _ctx: &LeaderChangeContext) {}
}

/// Completion of a snapshot save. `start` receives the metadata pinned on
/// the apply thread and opens the destination writer.
pub trait SaveSnapshotClosure: Send {
    fn start(&mut self, meta: SnapshotMeta) -> Option<Arc<dyn SnapshotWriter>>;

    fn run(self: Box<Self>, status: Status);
}

/// Completion of a snapshot load. `start` opens the downloaded snapshot.
pub trait LoadSnapshotClosure: Send {
    fn start(&mut self) -> Option<Arc<dyn SnapshotReader>>;

    fn run(self: Box<Self>, status: Status);
}

/// Observes every advance of the last-applied index, e.g. for read-index
/// waiters.
pub trait LastAppliedLogIndexListener: Send + Sync {
    fn on_applied(&self, index: u64);
}
