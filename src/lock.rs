//! Distributed lock model: lease-bounded, reentrant, fenced.
//!
//! The algorithm relies on the assumption that while there is no
//! synchronized clock across processes, local time in every process flows at
//! approximately the same rate, with an error that is small compared to the
//! auto-release time of the lock. The acquirer therefore ships its own
//! monotonic timestamp; the store never reads a wall clock.

use serde::Deserialize;
use serde::Serialize;

/// Result flags packed into [`Owner::remaining_millis`].
///
/// A non-negative value means the lock is held by somebody else and reports
/// the remaining lease time; the negative values below classify the outcome
/// of a successful (or keep-lease-failed) acquisition.
pub const FIRST_TIME_SUCCESS: i64 = -1;
pub const NEW_ACQUIRE_SUCCESS: i64 = -2;
pub const KEEP_LEASE_SUCCESS: i64 = -3;
pub const REENTRANT_SUCCESS: i64 = -4;
pub const KEEP_LEASE_FAIL: i64 = -5;

/// Identity and intent of a party trying to take a lock.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Acquirer {
    /// Unique id of the acquirer, stable across retries.
    pub id: String,
    /// Requested lease duration in milliseconds.
    pub lease_millis: u64,
    /// The acquirer's local monotonic clock, in milliseconds.
    pub locking_timestamp: u64,
    /// Fencing token observed at a previous grant; informational on release.
    pub fencing_token: u64,
    /// Opaque context stored with the grant.
    pub context: Vec<u8>,
}

impl Acquirer {
    pub fn new(id: impl Into<String>, lease_millis: u64, locking_timestamp: u64) -> Self {
        Acquirer {
            id: id.into(),
            lease_millis,
            locking_timestamp,
            fencing_token: 0,
            context: Vec::new(),
        }
    }
}

/// The persisted (and returned) lock ownership record.
///
/// Persisted records always describe real ownership; `success` and the flag
/// value in `remaining_millis` are only meaningful in the copy returned to
/// the caller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    /// Id of the owning acquirer.
    pub id: String,
    /// Absolute deadline of the lease, in the acquirer clock domain.
    pub deadline_millis: u64,
    /// Remaining lease of the current owner, or one of the flag constants.
    pub remaining_millis: i64,
    /// Monotonic fencing token issued at grant time.
    pub fencing_token: u64,
    /// Reentrant acquisition count.
    pub acquires: u32,
    /// Opaque context supplied by the owner.
    pub context: Vec<u8>,
    /// Whether the operation that produced this record succeeded.
    pub success: bool,
}

impl Owner {
    pub fn builder() -> OwnerBuilder {
        OwnerBuilder::default()
    }

    pub fn is_same_acquirer(&self, acquirer: &Acquirer) -> bool {
        self.id == acquirer.id
    }
}

/// Step-by-step construction of an [`Owner`], mirroring the branches of the
/// lock protocol.
#[derive(Debug, Default)]
pub struct OwnerBuilder {
    owner: Owner,
}

impl OwnerBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.owner.id = id.into();
        self
    }

    pub fn deadline_millis(mut self, deadline: u64) -> Self {
        self.owner.deadline_millis = deadline;
        self
    }

    pub fn remaining_millis(mut self, remaining: i64) -> Self {
        self.owner.remaining_millis = remaining;
        self
    }

    pub fn fencing_token(mut self, token: u64) -> Self {
        self.owner.fencing_token = token;
        self
    }

    pub fn acquires(mut self, acquires: u32) -> Self {
        self.owner.acquires = acquires;
        self
    }

    pub fn context(mut self, context: Vec<u8>) -> Self {
        self.owner.context = context;
        self
    }

    pub fn success(mut self, success: bool) -> Self {
        self.owner.success = success;
        self
    }

    pub fn build(self) -> Owner {
        self.owner
    }
}
