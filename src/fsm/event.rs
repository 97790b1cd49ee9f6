//! The event union drained by the apply thread.

use std::fmt;

use crossbeam_channel::Sender;

use crate::entry::LeaderChangeContext;
use crate::error::RaftException;
use crate::error::Status;
use crate::fsm::LoadSnapshotClosure;
use crate::fsm::SaveSnapshotClosure;

/// One slot in the apply queue.
///
/// `Committed` events collapse: the consumer only remembers the max index
/// seen in the current drain and flushes it before handling anything else.
pub(crate) enum ApplyTask {
    Committed { index: u64 },
    SnapshotSave { done: Box<dyn SaveSnapshotClosure> },
    SnapshotLoad { done: Box<dyn LoadSnapshotClosure> },
    LeaderStart { term: u64 },
    LeaderStop { status: Status },
    StartFollowing { ctx: LeaderChangeContext },
    StopFollowing { ctx: LeaderChangeContext },
    Error { error: RaftException },
    /// Test hook: the latch fires once everything enqueued before it has
    /// been processed.
    Flush { latch: Sender<()> },
    /// Drain everything before this slot, tear the consumer down, then
    /// fire the latch.
    Shutdown { latch: Sender<()> },
}

impl ApplyTask {
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            ApplyTask::Committed { .. } => "committed",
            ApplyTask::SnapshotSave { .. } => "snapshot-save",
            ApplyTask::SnapshotLoad { .. } => "snapshot-load",
            ApplyTask::LeaderStart { .. } => "leader-start",
            ApplyTask::LeaderStop { .. } => "leader-stop",
            ApplyTask::StartFollowing { .. } => "start-following",
            ApplyTask::StopFollowing { .. } => "stop-following",
            ApplyTask::Error { .. } => "error",
            ApplyTask::Flush { .. } => "flush",
            ApplyTask::Shutdown { .. } => "shutdown",
        }
    }
}

impl fmt::Debug for ApplyTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ApplyTask::Committed { index } => write!(f, "Committed({})", index),
            other => f.write_str(other.kind()),
        }
    }
}
