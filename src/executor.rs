//! Deferred task execution off the apply thread.
//!
//! Snapshot-archive compression and leader-state fanout must not run on the
//! apply thread (the first is slow, the second may re-enter the state
//! machine), so both go through a [`TaskExecutor`].

use std::panic::AssertUnwindSafe;
use std::thread;

use crossbeam_channel::bounded;
use crossbeam_channel::Sender;

type Task = Box<dyn FnOnce() + Send + 'static>;

/// Executes tasks at some point after submission, in submission order.
pub trait TaskExecutor: Send + Sync {
    fn execute(&self, task: Task);
}

/// A bounded, single-worker executor.
///
/// `execute` blocks only when the queue is full. Dropping the executor
/// closes the queue; the worker drains what was already submitted and then
/// exits.
pub struct SingleThreadExecutor {
    tx: Sender<Task>,
}

impl SingleThreadExecutor {
    pub fn new(name: &str, queue_capacity: usize) -> Self {
        let (tx, rx) = bounded::<Task>(queue_capacity);
        let thread_name = name.to_string();
        thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                for task in rx {
                    if std::panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(worker = %thread_name, "task panicked");
                    }
                }
            })
            .expect("failed to spawn executor worker");
        SingleThreadExecutor { tx }
    }
}

impl TaskExecutor for SingleThreadExecutor {
    fn execute(&self, task: Task) {
        if self.tx.send(task).is_err() {
            tracing::warn!("executor is shut down, task dropped");
        }
    }
}
