//! One-shot completion handles and the pending-closure queue.
//!
//! A closure is created when a task is submitted on the leader and fires
//! exactly once, after the corresponding log entry has been applied (or has
//! failed). Closures created locally may carry the original, un-serialized
//! operation so the apply path can skip decoding.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;

use parking_lot::Mutex;

use crate::error::RaftError;
use crate::error::Status;
use crate::lock::Owner;
use crate::operation::KVEntry;
use crate::operation::KVOperation;
use crate::operation::Sequence;

/// Success payload delivered to a completed closure.
#[derive(Debug, Clone, PartialEq)]
pub enum OpResult {
    /// Nothing to report beyond success.
    None,
    Bool(bool),
    /// A point-read result; `None` when the key is absent.
    Value(Option<Vec<u8>>),
    Entries(Vec<KVEntry>),
    /// Multi-get result, keyed by the requested keys.
    ValueMap(HashMap<Vec<u8>, Option<Vec<u8>>>),
    Sequence(Sequence),
    Owner(Owner),
}

/// The completion callback invoked exactly once per submitted task.
pub type CompletionFn = Box<dyn FnOnce(Result<OpResult, Status>) + Send + 'static>;

/// One-shot completion handle paired with a submitted operation.
pub struct KVClosure {
    /// Leader-side cached operation; taking it skips payload decoding.
    operation: Option<KVOperation>,
    /// Optional pre-apply hook, fired once the entry is known committed but
    /// before it is applied.
    committed_hook: Option<Box<dyn FnOnce() + Send + 'static>>,
    done: Option<CompletionFn>,
}

impl fmt::Debug for KVClosure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KVClosure")
            .field("operation", &self.operation.as_ref().map(|op| op.op_name()))
            .field("has_committed_hook", &self.committed_hook.is_some())
            .finish()
    }
}

impl KVClosure {
    pub fn new(done: CompletionFn) -> Self {
        KVClosure {
            operation: None,
            committed_hook: None,
            done: Some(done),
        }
    }

    /// Attach the original operation (leader path).
    pub fn with_operation(operation: KVOperation, done: CompletionFn) -> Self {
        KVClosure {
            operation: Some(operation),
            committed_hook: None,
            done: Some(done),
        }
    }

    /// Attach a pre-apply observer.
    pub fn on_committed(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.committed_hook = Some(Box::new(hook));
        self
    }

    /// Take the cached operation, if any.
    pub fn take_operation(&mut self) -> Option<KVOperation> {
        self.operation.take()
    }

    pub(crate) fn fire_committed(&mut self) {
        if let Some(hook) = self.committed_hook.take() {
            hook();
        }
    }

    /// Complete the closure. The handle is consumed; firing twice is
    /// impossible by construction.
    pub fn complete(mut self, result: Result<OpResult, Status>) {
        if let Some(done) = self.done.take() {
            done(result);
        }
    }

    pub fn success(self, data: OpResult) {
        self.complete(Ok(data));
    }

    pub fn fail(self, status: Status) {
        self.complete(Err(status));
    }
}

#[derive(Default)]
struct QueueInner {
    /// Log index of the first closure in `queue`.
    first_index: u64,
    queue: VecDeque<Option<KVClosure>>,
}

/// FIFO of pending closures, pushed at task submission and popped only by
/// the apply thread.
///
/// Entries without a local closure (follower-replicated entries) occupy a
/// `None` slot so that positions stay aligned with log indexes.
#[derive(Default)]
pub struct ClosureQueue {
    inner: Mutex<QueueInner>,
}

impl ClosureQueue {
    pub fn new() -> Self {
        ClosureQueue::default()
    }

    /// Reset the watermark; used after a snapshot load or on bootstrap.
    pub fn reset_first_index(&self, first_index: u64) {
        let mut inner = self.inner.lock();
        inner.first_index = first_index;
        inner.queue.clear();
    }

    pub fn append_pending_closure(&self, closure: Option<KVClosure>) {
        self.inner.lock().queue.push_back(closure);
    }

    /// Fail and drop everything still pending, e.g. when the leader steps
    /// down or the pipeline shuts down.
    pub fn clear(&self) {
        let drained: Vec<Option<KVClosure>> = {
            let mut inner = self.inner.lock();
            inner.first_index = 0;
            inner.queue.drain(..).collect()
        };
        for done in drained.into_iter().flatten() {
            done.fail(Status::new(RaftError::Shutdown, "closure queue is cleared"));
        }
    }

    /// Pop every closure with index in `[first_index, end_index]` into
    /// `out`, and return the index of the first popped slot.
    ///
    /// Returns `Some(end_index + 1)` with an empty `out` when there is
    /// nothing at or below `end_index`; returns `None` when `end_index`
    /// runs past the queue, which indicates a bookkeeping bug in the
    /// caller.
    pub fn pop_closure_until(
        &self,
        end_index: u64,
        out: &mut Vec<Option<KVClosure>>,
    ) -> Option<u64> {
        out.clear();
        let mut inner = self.inner.lock();
        let queue_len = inner.queue.len() as u64;
        if queue_len == 0 || end_index < inner.first_index {
            return Some(end_index + 1);
        }
        if end_index > inner.first_index + queue_len - 1 {
            tracing::error!(
                end_index,
                first_index = inner.first_index,
                queue_len,
                "pop_closure_until out of range"
            );
            return None;
        }
        let out_first_index = inner.first_index;
        for _ in out_first_index..=end_index {
            out.push(inner.queue.pop_front().flatten());
        }
        inner.first_index = end_index + 1;
        Some(out_first_index)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;

    fn counting_closure(hits: &Arc<AtomicU64>) -> KVClosure {
        let hits = hits.clone();
        KVClosure::new(Box::new(move |_res| {
            hits.fetch_add(1, Ordering::SeqCst);
        }))
    }

    #[test]
    fn test_pop_closure_until() {
        let q = ClosureQueue::new();
        q.reset_first_index(1);
        let hits = Arc::new(AtomicU64::new(0));
        for _ in 0..5 {
            q.append_pending_closure(Some(counting_closure(&hits)));
        }

        let mut out = Vec::new();
        let first = q.pop_closure_until(3, &mut out);
        assert_eq!(Some(1), first);
        assert_eq!(3, out.len());

        let first = q.pop_closure_until(5, &mut out);
        assert_eq!(Some(4), first);
        assert_eq!(2, out.len());

        // nothing left at or below 5
        let first = q.pop_closure_until(5, &mut out);
        assert_eq!(Some(6), first);
        assert!(out.is_empty());
    }

    #[test]
    fn test_pop_closure_until_out_of_range() {
        let q = ClosureQueue::new();
        q.reset_first_index(1);
        q.append_pending_closure(None);
        let mut out = Vec::new();
        assert_eq!(None, q.pop_closure_until(10, &mut out));
    }

    #[test]
    fn test_clear_fails_pending() {
        let q = ClosureQueue::new();
        q.reset_first_index(1);
        let failed = Arc::new(AtomicU64::new(0));
        let f = failed.clone();
        q.append_pending_closure(Some(KVClosure::new(Box::new(move |res| {
            assert!(res.is_err());
            f.fetch_add(1, Ordering::SeqCst);
        }))));
        q.clear();
        assert_eq!(1, failed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_committed_hook_fires_before_completion() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let mut c = KVClosure::new(Box::new(move |_res| {
            o1.lock().push("done");
        }))
        .on_committed(move || {
            o2.lock().push("committed");
        });
        c.fire_committed();
        c.success(OpResult::None);
        assert_eq!(vec!["committed", "done"], *order.lock());
    }

    #[test]
    fn test_take_operation_is_one_shot() {
        let mut c = KVClosure::with_operation(
            KVOperation::Delete { key: b"k".to_vec() },
            Box::new(|_res| {}),
        );
        assert!(c.take_operation().is_some());
        assert!(c.take_operation().is_none());
        c.success(OpResult::None);
    }
}
