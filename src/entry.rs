//! Log entry model consumed by the apply pipeline.
//!
//! These types describe what the consensus layer hands over once an index is
//! committed. The pipeline never inspects payload bytes itself; `data` is
//! opaque until the state machine decodes it.

use crate::error::Status;

/// A peer address, e.g. `"127.0.0.1:8081"`.
pub type PeerId = String;

/// The `(index, term)` position of a log entry.
///
/// Ordering is lexicographic on `(index, term)`, which is exactly the
/// comparison used to refuse stale snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct LogId {
    pub index: u64,
    pub term: u64,
}

impl LogId {
    pub fn new(index: u64, term: u64) -> Self {
        LogId { index, term }
    }
}

/// Kind of a replicated log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryType {
    /// Barrier entry appended by a fresh leader; carries no payload.
    NoOp,
    /// A user operation; `data` decodes into a `KVOperation`.
    Data,
    /// A membership change; `peers`/`old_peers` are populated.
    Configuration,
}

/// A committed log entry as delivered by the log manager.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub id: LogId,
    pub entry_type: EntryType,
    /// Serialized operation for `Data` entries, empty otherwise.
    pub data: Vec<u8>,
    /// New configuration for `Configuration` entries.
    pub peers: Vec<PeerId>,
    /// Old configuration while a joint-consensus change is in flight.
    pub old_peers: Vec<PeerId>,
}

impl LogEntry {
    pub fn new_data(id: LogId, data: Vec<u8>) -> Self {
        LogEntry {
            id,
            entry_type: EntryType::Data,
            data,
            peers: Vec::new(),
            old_peers: Vec::new(),
        }
    }

    pub fn new_noop(id: LogId) -> Self {
        LogEntry {
            id,
            entry_type: EntryType::NoOp,
            data: Vec::new(),
            peers: Vec::new(),
            old_peers: Vec::new(),
        }
    }

    pub fn new_configuration(id: LogId, peers: Vec<PeerId>, old_peers: Vec<PeerId>) -> Self {
        LogEntry {
            id,
            entry_type: EntryType::Configuration,
            data: Vec::new(),
            peers,
            old_peers,
        }
    }
}

/// A committed set of peers.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    peers: Vec<PeerId>,
}

impl Configuration {
    pub fn new(peers: Vec<PeerId>) -> Self {
        Configuration { peers }
    }

    pub fn peers(&self) -> &[PeerId] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

/// The configuration in effect at some log index, together with the old
/// configuration if a joint change was pending at that point.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationEntry {
    pub conf: Configuration,
    pub old_conf: Configuration,
}

impl ConfigurationEntry {
    pub fn is_empty(&self) -> bool {
        self.conf.is_empty()
    }
}

/// Context delivered with start/stop-following notifications.
#[derive(Debug, Clone)]
pub struct LeaderChangeContext {
    pub leader_id: PeerId,
    pub term: u64,
    pub status: Status,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_id_ordering_is_index_first() {
        assert!(LogId::new(2, 1) > LogId::new(1, 5));
        assert!(LogId::new(3, 2) > LogId::new(3, 1));
        assert!(LogId::new(3, 1) == LogId::new(3, 1));
    }
}
