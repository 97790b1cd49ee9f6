//! Iteration over a committed range of log entries.
//!
//! [`EntryIter`] is the driver-side cursor over `(last_applied, committed]`;
//! [`ApplyIterator`] is the narrowed view handed to the state machine, which
//! only ever sees consecutive `Data` entries.

use std::sync::Arc;

use crate::closure::KVClosure;
use crate::entry::EntryType;
use crate::entry::LogEntry;
use crate::error::ErrorType;
use crate::error::RaftError;
use crate::error::RaftException;
use crate::error::Status;
use crate::fsm::LogManager;

/// Cursor over committed entries, carrying the popped closures aligned to
/// their log indexes.
pub(crate) struct EntryIter {
    log_manager: Arc<dyn LogManager>,
    closures: Vec<Option<KVClosure>>,
    first_closure_index: u64,
    current_index: u64,
    committed_index: u64,
    current_entry: Option<LogEntry>,
    error: Option<RaftException>,
}

impl EntryIter {
    pub(crate) fn new(
        log_manager: Arc<dyn LogManager>,
        closures: Vec<Option<KVClosure>>,
        first_closure_index: u64,
        last_applied_index: u64,
        committed_index: u64,
    ) -> Self {
        let mut iter = EntryIter {
            log_manager,
            closures,
            first_closure_index,
            current_index: last_applied_index,
            committed_index,
            current_entry: None,
            error: None,
        };
        // position on the first entry of the range
        iter.next();
        iter
    }

    /// Valid and positioned on an entry within the committed range.
    pub(crate) fn is_good(&self) -> bool {
        self.current_index <= self.committed_index && self.error.is_none()
    }

    pub(crate) fn entry(&self) -> Option<&LogEntry> {
        self.current_entry.as_ref()
    }

    pub(crate) fn index(&self) -> u64 {
        self.current_index
    }

    pub(crate) fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub(crate) fn take_error(&mut self) -> Option<RaftException> {
        self.error.take()
    }

    pub(crate) fn set_error(&mut self, error: RaftException) {
        if self.error.is_none() {
            self.error = Some(error);
        }
    }

    /// The closure attached to the current entry, if it was submitted
    /// locally.
    pub(crate) fn take_closure(&mut self) -> Option<KVClosure> {
        if self.current_index < self.first_closure_index {
            return None;
        }
        let offset = (self.current_index - self.first_closure_index) as usize;
        self.closures.get_mut(offset).and_then(Option::take)
    }

    pub(crate) fn next(&mut self) {
        self.current_entry = None;
        if self.current_index <= self.committed_index {
            self.current_index += 1;
            if self.current_index <= self.committed_index {
                match self.log_manager.get_entry(self.current_index) {
                    Some(entry) => self.current_entry = Some(entry),
                    None => {
                        self.set_error(RaftException::new(
                            ErrorType::Log,
                            Status::new(
                                RaftError::Io,
                                format!("fail to get entry at index {}", self.current_index),
                            ),
                        ));
                    }
                }
            }
        }
    }

    /// Roll the cursor back `ntail` entries and latch `status` so the
    /// failed tail is not treated as applied.
    pub(crate) fn set_error_and_rollback(&mut self, ntail: u64, status: Status) {
        self.current_index = self.current_index.saturating_sub(ntail);
        self.current_entry = None;
        self.set_error(RaftException::new(ErrorType::StateMachine, status));
    }

    /// Fail every closure from the current position to the end of the
    /// range.
    pub(crate) fn run_rest_closures_with_error(&mut self) {
        let status = self
            .error
            .as_ref()
            .map(|e| e.status().clone())
            .unwrap_or_else(|| Status::new(RaftError::StateMachine, "apply aborted"));
        let from = self.current_index.max(self.first_closure_index);
        for index in from..=self.committed_index {
            let offset = (index - self.first_closure_index) as usize;
            if let Some(done) = self.closures.get_mut(offset).and_then(Option::take) {
                done.fail(status.clone());
            }
        }
    }
}

/// The state machine's view of the committed range: only `Data` entries,
/// stopping short of the first non-data entry.
pub struct ApplyIterator<'a> {
    inner: &'a mut EntryIter,
}

impl<'a> ApplyIterator<'a> {
    pub(crate) fn new(inner: &'a mut EntryIter) -> Self {
        ApplyIterator { inner }
    }

    pub fn has_next(&self) -> bool {
        self.inner.is_good()
            && self
                .inner
                .entry()
                .map(|e| e.entry_type == EntryType::Data)
                .unwrap_or(false)
    }

    /// Payload of the current entry.
    pub fn data(&self) -> &[u8] {
        self.inner.entry().map(|e| e.data.as_slice()).unwrap_or(&[])
    }

    pub fn index(&self) -> u64 {
        self.inner.index()
    }

    pub fn term(&self) -> u64 {
        self.inner.entry().map(|e| e.id.term).unwrap_or(0)
    }

    /// The completion handle for the current entry; present only on the
    /// replica the task was submitted to.
    pub fn take_closure(&mut self) -> Option<KVClosure> {
        self.inner.take_closure()
    }

    /// Advance to the next entry. A no-op once positioned past the last
    /// data entry, so calling it one extra time is always safe.
    pub fn next(&mut self) {
        if self.has_next() {
            self.inner.next();
        }
    }

    /// Report that the current entry (and `ntail - 1` before it) cannot be
    /// applied; poisons the pipeline.
    pub fn set_error_and_rollback(&mut self, ntail: u64, status: Status) {
        self.inner.set_error_and_rollback(ntail, status);
    }
}
