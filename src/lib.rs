//! Replicated state-machine apply pipeline for a RocksDB-backed KV store.
//!
//! This crate is the piece that sits between a Raft consensus log and local
//! storage: once consensus has decided a prefix of the log, the
//! [`FsmCaller`](fsm::FsmCaller) deterministically applies those entries to
//! the [`KVStoreStateMachine`](sm::KVStoreStateMachine), serves snapshots
//! for catch-up and log truncation, and fans leadership changes out to
//! listeners.
//!
//! The moving parts, leaves first:
//!
//! - [`operation`] / [`closure`]: the tagged operation union and the
//!   one-shot completion handles that travel with submitted tasks.
//! - [`storage`]: the thread-safe engine adapter over RocksDB, with column
//!   families for user data, sequences, distributed locks and the fencing
//!   counter.
//! - [`fsm`]: the single-consumer event queue draining committed-index,
//!   snapshot, leadership and error events in strict order.
//! - [`sm`]: the state machine facade gluing the two together.
//! - [`listener`]: asynchronous leader-state fanout.
//!
//! Consensus itself (election, replication, transport) is out of scope and
//! reached only through the collaborator traits in [`fsm`].

#![deny(unused_qualifications)]

pub mod closure;
pub mod codec;
pub mod entry;
pub mod error;
pub mod executor;
pub mod fsm;
pub mod listener;
pub mod lock;
pub mod metrics;
pub mod operation;
pub mod sm;
pub mod storage;

pub use crate::closure::ClosureQueue;
pub use crate::closure::KVClosure;
pub use crate::closure::OpResult;
pub use crate::entry::Configuration;
pub use crate::entry::EntryType;
pub use crate::entry::LogEntry;
pub use crate::entry::LogId;
pub use crate::error::RaftError;
pub use crate::error::RaftException;
pub use crate::error::Status;
pub use crate::error::StoreError;
pub use crate::fsm::FsmCaller;
pub use crate::fsm::FsmCallerOptions;
pub use crate::fsm::StateMachine;
pub use crate::lock::Acquirer;
pub use crate::lock::Owner;
pub use crate::operation::KVEntry;
pub use crate::operation::KVOperation;
pub use crate::operation::Sequence;
pub use crate::sm::KVStoreStateMachine;
pub use crate::sm::StateMachineOptions;
pub use crate::storage::rocks::RocksDBOptions;
pub use crate::storage::rocks::RocksKVStore;
