//! The single-consumer dispatcher between consensus and the state machine.
//!
//! Producers (replication threads) publish events into a bounded
//! multi-producer channel; exactly one consumer thread drains it in FIFO
//! order. Consecutive committed-index events collapse into one apply pass
//! over `(last_applied, max_committed]`, so a burst of replication progress
//! costs a single walk of the log.
//!
//! Snapshot save and load are dispatched from the same thread, which is
//! what guarantees a snapshot observes state exactly as of the last applied
//! index: no concurrent apply is possible while it runs.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::bounded;
use crossbeam_channel::Receiver;
use crossbeam_channel::Sender;
use crossbeam_channel::TryRecvError;
use parking_lot::Mutex;
use parking_lot::RwLock;

use crate::closure::ClosureQueue;
use crate::closure::OpResult;
use crate::entry::Configuration;
use crate::entry::EntryType;
use crate::entry::LeaderChangeContext;
use crate::entry::LogId;
use crate::error::ErrorType;
use crate::error::RaftError;
use crate::error::RaftException;
use crate::error::Status;
use crate::fsm::event::ApplyTask;
use crate::fsm::iterator::ApplyIterator;
use crate::fsm::iterator::EntryIter;
use crate::fsm::LastAppliedLogIndexListener;
use crate::fsm::LoadSnapshotClosure;
use crate::fsm::LogManager;
use crate::fsm::SaveSnapshotClosure;
use crate::fsm::StateMachine;
use crate::storage::snapshot::SnapshotMeta;

/// Default capacity of the apply queue.
const DEFAULT_QUEUE_CAPACITY: usize = 16 * 1024;

type AppliedListeners = Arc<RwLock<Arc<Vec<Arc<dyn LastAppliedLogIndexListener>>>>>;

/// Construction parameters for [`FsmCaller`].
pub struct FsmCallerOptions {
    pub log_manager: Arc<dyn LogManager>,
    pub fsm: Arc<dyn StateMachine>,
    pub closure_queue: Arc<ClosureQueue>,
    /// Where applying starts; `(0, 0)` on a fresh store.
    pub bootstrap_id: LogId,
    pub queue_capacity: usize,
    /// Runs on the apply thread after the state machine has shut down.
    pub after_shutdown: Option<Box<dyn FnOnce(Status) + Send>>,
    /// Informs the node that the pipeline is poisoned so it can step down
    /// and stop accepting writes.
    pub on_node_error: Option<Arc<dyn Fn(&RaftException) + Send + Sync>>,
}

impl FsmCallerOptions {
    pub fn new(
        log_manager: Arc<dyn LogManager>,
        fsm: Arc<dyn StateMachine>,
        closure_queue: Arc<ClosureQueue>,
    ) -> Self {
        FsmCallerOptions {
            log_manager,
            fsm,
            closure_queue,
            bootstrap_id: LogId::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            after_shutdown: None,
            on_node_error: None,
        }
    }
}

/// Handle to the running apply pipeline.
///
/// All `on_*` methods are non-blocking unless the queue is full, in which
/// case the producer waits for the consumer to catch up.
pub struct FsmCaller {
    tx: Sender<ApplyTask>,
    shutdown: AtomicBool,
    last_applied_index: Arc<AtomicU64>,
    listeners: AppliedListeners,
    handle: Mutex<Option<JoinHandle<()>>>,
    shutdown_latch: Mutex<Option<Receiver<()>>>,
}

impl FsmCaller {
    /// Spawn the consumer thread and return the producer-side handle.
    pub fn start(opts: FsmCallerOptions) -> FsmCaller {
        let (tx, rx) = bounded(opts.queue_capacity.max(1));
        let last_applied_index = Arc::new(AtomicU64::new(opts.bootstrap_id.index));
        let listeners: AppliedListeners = Arc::new(RwLock::new(Arc::new(Vec::new())));

        let handler = ApplyTaskHandler {
            rx,
            fsm: opts.fsm,
            log_manager: opts.log_manager,
            closure_queue: opts.closure_queue,
            after_shutdown: opts.after_shutdown,
            on_node_error: opts.on_node_error,
            last_applied_index: last_applied_index.clone(),
            last_applied_term: opts.bootstrap_id.term,
            error: None,
            listeners: listeners.clone(),
        };
        let handle = thread::Builder::new()
            .name("kv-fsm-caller".to_string())
            .spawn(move || handler.run())
            .expect("failed to spawn fsm caller thread");

        tracing::info!("fsm caller started");
        FsmCaller {
            tx,
            shutdown: AtomicBool::new(false),
            last_applied_index,
            listeners,
            handle: Mutex::new(Some(handle)),
            shutdown_latch: Mutex::new(None),
        }
    }

    fn enqueue(&self, task: ApplyTask) -> bool {
        if self.shutdown.load(Ordering::Acquire) {
            tracing::warn!(kind = task.kind(), "fsm caller is stopped, cannot apply new task");
            return false;
        }
        self.tx.send(task).is_ok()
    }

    /// The committed index advanced; schedule an apply pass.
    pub fn on_committed(&self, committed_index: u64) -> bool {
        self.enqueue(ApplyTask::Committed {
            index: committed_index,
        })
    }

    pub fn on_snapshot_save(&self, done: Box<dyn SaveSnapshotClosure>) -> bool {
        self.enqueue(ApplyTask::SnapshotSave { done })
    }

    pub fn on_snapshot_load(&self, done: Box<dyn LoadSnapshotClosure>) -> bool {
        self.enqueue(ApplyTask::SnapshotLoad { done })
    }

    pub fn on_leader_start(&self, term: u64) -> bool {
        self.enqueue(ApplyTask::LeaderStart { term })
    }

    pub fn on_leader_stop(&self, status: Status) -> bool {
        self.enqueue(ApplyTask::LeaderStop { status })
    }

    pub fn on_start_following(&self, ctx: LeaderChangeContext) -> bool {
        self.enqueue(ApplyTask::StartFollowing { ctx })
    }

    pub fn on_stop_following(&self, ctx: LeaderChangeContext) -> bool {
        self.enqueue(ApplyTask::StopFollowing { ctx })
    }

    pub fn on_error(&self, error: RaftException) -> bool {
        self.enqueue(ApplyTask::Error { error })
    }

    pub fn last_applied_index(&self) -> u64 {
        self.last_applied_index.load(Ordering::Acquire)
    }

    pub fn add_last_applied_listener(&self, listener: Arc<dyn LastAppliedLogIndexListener>) {
        let mut guard = self.listeners.write();
        let mut next = guard.as_ref().clone();
        next.push(listener);
        *guard = Arc::new(next);
    }

    /// Block until everything enqueued before this call has been processed.
    pub fn flush(&self) {
        let (latch_tx, latch_rx) = bounded(1);
        if self.enqueue(ApplyTask::Flush { latch: latch_tx }) {
            let _ = latch_rx.recv();
        }
    }

    /// Enqueue the shutdown sentinel. Idempotent; pair with [`join`].
    ///
    /// [`join`]: FsmCaller::join
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("shutting down fsm caller");
        let (latch_tx, latch_rx) = bounded(1);
        if self.tx.send(ApplyTask::Shutdown { latch: latch_tx }).is_ok() {
            *self.shutdown_latch.lock() = Some(latch_rx);
        }
    }

    /// Wait for the consumer to drain and exit.
    pub fn join(&self) {
        if let Some(latch) = self.shutdown_latch.lock().take() {
            let _ = latch.recv();
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}

/// The consumer side: owns all mutable apply state, so no locking is
/// needed beyond the channel.
struct ApplyTaskHandler {
    rx: Receiver<ApplyTask>,
    fsm: Arc<dyn StateMachine>,
    log_manager: Arc<dyn LogManager>,
    closure_queue: Arc<ClosureQueue>,
    after_shutdown: Option<Box<dyn FnOnce(Status) + Send>>,
    on_node_error: Option<Arc<dyn Fn(&RaftException) + Send + Sync>>,
    last_applied_index: Arc<AtomicU64>,
    last_applied_term: u64,
    error: Option<RaftException>,
    listeners: AppliedListeners,
}

impl ApplyTaskHandler {
    fn run(mut self) {
        // max committed index in the current drain; flushed before any
        // non-committed event and at end of batch
        let mut max_committed: Option<u64> = None;
        loop {
            let task = if max_committed.is_none() {
                match self.rx.recv() {
                    Ok(task) => task,
                    Err(_) => break,
                }
            } else {
                match self.rx.try_recv() {
                    Ok(task) => task,
                    Err(TryRecvError::Empty) => {
                        if let Some(index) = max_committed.take() {
                            self.do_committed(index);
                        }
                        continue;
                    }
                    Err(TryRecvError::Disconnected) => {
                        if let Some(index) = max_committed.take() {
                            self.do_committed(index);
                        }
                        break;
                    }
                }
            };

            if let ApplyTask::Committed { index } = &task {
                let index = *index;
                max_committed = Some(max_committed.map_or(index, |m| m.max(index)));
                continue;
            }

            if let Some(index) = max_committed.take() {
                self.do_committed(index);
            }
            tracing::debug!(kind = task.kind(), "processing apply task");
            match task {
                // collapsed above
                ApplyTask::Committed { .. } => {}
                ApplyTask::SnapshotSave { done } => match self.pass_by_status() {
                    Ok(()) => self.do_snapshot_save(done),
                    Err(status) => done.run(status),
                },
                ApplyTask::SnapshotLoad { done } => match self.pass_by_status() {
                    Ok(()) => self.do_snapshot_load(done),
                    Err(status) => done.run(status),
                },
                ApplyTask::LeaderStart { term } => self.fsm.on_leader_start(term),
                ApplyTask::LeaderStop { status } => self.fsm.on_leader_stop(status),
                ApplyTask::StartFollowing { ctx } => self.fsm.on_start_following(&ctx),
                ApplyTask::StopFollowing { ctx } => self.fsm.on_stop_following(&ctx),
                ApplyTask::Error { error } => self.set_error(error),
                ApplyTask::Flush { latch } => {
                    let _ = latch.send(());
                }
                ApplyTask::Shutdown { latch } => {
                    self.do_shutdown();
                    let _ = latch.send(());
                    break;
                }
            }
        }
        tracing::info!("fsm caller consumer stopped");
    }

    fn pass_by_status(&self) -> Result<(), Status> {
        match &self.error {
            Some(error) => Err(Status::new(
                RaftError::Inval,
                format!("fsm caller is in bad status: {}", error),
            )),
            None => Ok(()),
        }
    }

    fn do_committed(&mut self, committed_index: u64) {
        if self.error.is_some() {
            return;
        }
        let last_applied = self.last_applied_index.load(Ordering::Acquire);
        // tolerate out-of-order committed reports
        if last_applied >= committed_index {
            return;
        }

        let mut closures = Vec::new();
        let Some(first_closure_index) =
            self.closure_queue.pop_closure_until(committed_index, &mut closures)
        else {
            self.set_error(RaftException::new(
                ErrorType::StateMachine,
                Status::new(RaftError::Inval, "invalid closure queue range"),
            ));
            return;
        };

        // pre-apply observers
        for done in closures.iter_mut().flatten() {
            done.fire_committed();
        }

        let mut iter = EntryIter::new(
            self.log_manager.clone(),
            closures,
            first_closure_index,
            last_applied,
            committed_index,
        );
        while iter.is_good() {
            let (is_data, completed_conf) = match iter.entry() {
                Some(entry) if entry.entry_type == EntryType::Data => (true, None),
                Some(entry) => {
                    let conf = (entry.entry_type == EntryType::Configuration
                        && !entry.old_peers.is_empty())
                    .then(|| Configuration::new(entry.peers.clone()));
                    (false, conf)
                }
                None => break,
            };
            if is_data {
                self.do_apply_tasks(&mut iter);
                continue;
            }
            if let Some(conf) = completed_conf {
                // the joint stage has drained; only now does the change
                // become visible to the user state machine
                self.fsm.on_configuration_committed(&conf);
            }
            // nothing to apply; run the closure to signal that everything
            // before this entry is committed and applied
            if let Some(done) = iter.take_closure() {
                done.success(OpResult::None);
            }
            iter.next();
        }

        if iter.has_error() {
            iter.run_rest_closures_with_error();
            if let Some(error) = iter.take_error() {
                self.set_error(error);
            }
            // the pipeline is poisoned; last_applied_index must not move
            return;
        }

        let last_index = iter.index() - 1;
        let last_term = self.log_manager.get_term(last_index);
        self.last_applied_index.store(committed_index, Ordering::Release);
        self.last_applied_term = last_term;
        self.log_manager.set_applied_id(LogId::new(last_index, last_term));
        self.notify_last_applied(committed_index);
    }

    fn do_apply_tasks(&mut self, iter: &mut EntryIter) {
        let mut wrapper = ApplyIterator::new(iter);
        self.fsm.on_apply(&mut wrapper);
        if wrapper.has_next() {
            tracing::error!(
                "iterator is still valid, did the state machine return before reaching the end?"
            );
        }
        // move past the current entry so the same log is never passed twice
        wrapper.next();
    }

    fn do_snapshot_save(&mut self, mut done: Box<dyn SaveSnapshotClosure>) {
        let last_applied_index = self.last_applied_index.load(Ordering::Acquire);
        let conf_entry = self
            .log_manager
            .get_configuration(last_applied_index)
            .filter(|c| !c.is_empty());
        let Some(conf_entry) = conf_entry else {
            tracing::error!(last_applied_index, "empty configuration entry for snapshot");
            done.run(Status::new(
                RaftError::Inval,
                format!("empty conf entry for last_applied_index={}", last_applied_index),
            ));
            return;
        };
        let meta = SnapshotMeta {
            last_included_index: last_applied_index,
            last_included_term: self.last_applied_term,
            peers: conf_entry.conf.peers().to_vec(),
            old_peers: conf_entry.old_conf.peers().to_vec(),
        };
        let Some(writer) = done.start(meta) else {
            done.run(Status::new(
                RaftError::Inval,
                "snapshot storage failed to create a writer",
            ));
            return;
        };
        self.fsm.on_snapshot_save(writer, done);
    }

    fn do_snapshot_load(&mut self, mut done: Box<dyn LoadSnapshotClosure>) {
        let Some(reader) = done.start() else {
            done.run(Status::new(RaftError::Inval, "fail to open snapshot reader"));
            return;
        };
        let Some(meta) = reader.load_meta() else {
            // a snapshot without readable metadata means corruption
            self.set_error(RaftException::new(
                ErrorType::Snapshot,
                Status::new(RaftError::Io, "fail to load snapshot meta"),
            ));
            done.run(Status::new(RaftError::Inval, "snapshot reader failed to load meta"));
            return;
        };
        let last_applied_id = LogId::new(
            self.last_applied_index.load(Ordering::Acquire),
            self.last_applied_term,
        );
        let snapshot_id = LogId::new(meta.last_included_index, meta.last_included_term);
        if last_applied_id > snapshot_id {
            done.run(Status::new(
                RaftError::Stale,
                format!(
                    "loading a stale snapshot last_applied_index={} last_applied_term={} \
                     snapshot_index={} snapshot_term={}",
                    last_applied_id.index,
                    last_applied_id.term,
                    snapshot_id.index,
                    snapshot_id.term
                ),
            ));
            return;
        }
        if !self.fsm.on_snapshot_load(reader) {
            let status = Status::new(
                RaftError::StateMachine,
                "state machine on_snapshot_load failed",
            );
            done.run(status.clone());
            self.set_error(RaftException::new(ErrorType::StateMachine, status));
            return;
        }
        if meta.old_peers.is_empty() {
            // joint stage is not supposed to be noticeable by end users
            self.fsm
                .on_configuration_committed(&Configuration::new(meta.peers.clone()));
        }
        self.last_applied_index
            .store(meta.last_included_index, Ordering::Release);
        self.last_applied_term = meta.last_included_term;
        done.run(Status::ok());
    }

    fn do_shutdown(&mut self) {
        self.fsm.on_shutdown();
        if let Some(after_shutdown) = self.after_shutdown.take() {
            after_shutdown(Status::ok());
        }
    }

    fn set_error(&mut self, error: RaftException) {
        if self.error.is_some() {
            // already reported
            return;
        }
        tracing::error!(%error, "fsm caller error latched");
        self.error = Some(error.clone());
        self.fsm.on_error(&error);
        if let Some(hook) = &self.on_node_error {
            hook(&error);
        }
    }

    fn notify_last_applied(&self, index: u64) {
        let listeners = self.listeners.read().clone();
        for listener in listeners.iter() {
            listener.on_applied(index);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::closure::KVClosure;
    use crate::entry::ConfigurationEntry;
    use crate::entry::LogEntry;
    use crate::storage::snapshot::LocalFileMeta;
    use crate::storage::snapshot::SnapshotReader;
    use crate::storage::snapshot::SnapshotWriter;

    #[derive(Default)]
    struct MockLogManager {
        entries: Mutex<BTreeMap<u64, LogEntry>>,
        applied_id: Mutex<Option<LogId>>,
    }

    impl MockLogManager {
        fn put_entry(&self, entry: LogEntry) {
            self.entries.lock().insert(entry.id.index, entry);
        }
    }

    impl LogManager for MockLogManager {
        fn get_entry(&self, index: u64) -> Option<LogEntry> {
            self.entries.lock().get(&index).cloned()
        }

        fn get_term(&self, index: u64) -> u64 {
            self.entries.lock().get(&index).map(|e| e.id.term).unwrap_or(0)
        }

        fn get_configuration(&self, _index: u64) -> Option<ConfigurationEntry> {
            Some(ConfigurationEntry {
                conf: Configuration::new(vec!["p1".to_string()]),
                old_conf: Configuration::default(),
            })
        }

        fn set_applied_id(&self, applied: LogId) {
            *self.applied_id.lock() = Some(applied);
        }
    }

    #[derive(Default)]
    struct RecordingFsm {
        applied: Mutex<Vec<(u64, Vec<u8>)>>,
        committed_confs: Mutex<Vec<Vec<String>>>,
        errors: AtomicUsize,
        shutdowns: AtomicUsize,
        leader_terms: Mutex<Vec<u64>>,
    }

    impl StateMachine for RecordingFsm {
        fn on_apply(&self, iter: &mut ApplyIterator<'_>) {
            while iter.has_next() {
                self.applied.lock().push((iter.index(), iter.data().to_vec()));
                if let Some(done) = iter.take_closure() {
                    done.success(OpResult::None);
                }
                iter.next();
            }
        }

        fn on_snapshot_save(
            &self,
            _writer: Arc<dyn SnapshotWriter>,
            done: Box<dyn SaveSnapshotClosure>,
        ) {
            done.run(Status::ok());
        }

        fn on_snapshot_load(&self, _reader: Arc<dyn SnapshotReader>) -> bool {
            true
        }

        fn on_shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }

        fn on_leader_start(&self, term: u64) {
            self.leader_terms.lock().push(term);
        }

        fn on_error(&self, _error: &RaftException) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }

        fn on_configuration_committed(&self, conf: &Configuration) {
            self.committed_confs.lock().push(conf.peers().to_vec());
        }
    }

    struct Fixture {
        log_manager: Arc<MockLogManager>,
        fsm: Arc<RecordingFsm>,
        closure_queue: Arc<ClosureQueue>,
        caller: FsmCaller,
    }

    fn fixture_with(
        mutate: impl FnOnce(&mut FsmCallerOptions),
    ) -> Fixture {
        let log_manager = Arc::new(MockLogManager::default());
        let fsm = Arc::new(RecordingFsm::default());
        let closure_queue = Arc::new(ClosureQueue::new());
        closure_queue.reset_first_index(1);
        let mut opts = FsmCallerOptions::new(
            log_manager.clone(),
            fsm.clone(),
            closure_queue.clone(),
        );
        mutate(&mut opts);
        let caller = FsmCaller::start(opts);
        Fixture {
            log_manager,
            fsm,
            closure_queue,
            caller,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {})
    }

    #[test]
    fn test_applies_data_entries_in_order() {
        let fx = fixture();
        for i in 1..=3 {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 1), vec![i as u8]));
            fx.closure_queue.append_pending_closure(None);
        }
        assert!(fx.caller.on_committed(3));
        fx.caller.flush();

        assert_eq!(
            vec![(1, vec![1u8]), (2, vec![2]), (3, vec![3])],
            *fx.fsm.applied.lock()
        );
        assert_eq!(3, fx.caller.last_applied_index());
        assert_eq!(Some(LogId::new(3, 1)), *fx.log_manager.applied_id.lock());
    }

    #[test]
    fn test_stale_committed_report_is_ignored() {
        let fx = fixture();
        for i in 1..=2 {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 1), vec![i as u8]));
            fx.closure_queue.append_pending_closure(None);
        }
        fx.caller.on_committed(2);
        fx.caller.flush();
        fx.caller.on_committed(1);
        fx.caller.flush();
        assert_eq!(2, fx.fsm.applied.lock().len());
        assert_eq!(2, fx.caller.last_applied_index());
    }

    #[test]
    fn test_closures_fire_in_log_order_with_committed_hook() {
        let fx = fixture();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 1..=3u64 {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 1), vec![]));
            let o1 = order.clone();
            let o2 = order.clone();
            let closure = KVClosure::new(Box::new(move |res| {
                assert!(res.is_ok());
                o1.lock().push(format!("done-{}", i));
            }))
            .on_committed(move || {
                o2.lock().push(format!("committed-{}", i));
            });
            fx.closure_queue.append_pending_closure(Some(closure));
        }
        fx.caller.on_committed(3);
        fx.caller.flush();
        assert_eq!(
            vec![
                "committed-1",
                "committed-2",
                "committed-3",
                "done-1",
                "done-2",
                "done-3"
            ],
            *order.lock()
        );
    }

    #[test]
    fn test_empty_commit_burst_still_advances_applied_index() {
        let fx = fixture();
        fx.log_manager.put_entry(LogEntry::new_configuration(
            LogId::new(1, 1),
            vec!["a".to_string(), "b".to_string()],
            vec!["a".to_string()],
        ));
        fx.log_manager.put_entry(LogEntry::new_noop(LogId::new(2, 1)));
        fx.closure_queue.append_pending_closure(None);
        fx.closure_queue.append_pending_closure(None);

        fx.caller.on_committed(2);
        fx.caller.flush();

        assert_eq!(2, fx.caller.last_applied_index());
        assert!(fx.fsm.applied.lock().is_empty());
        // joint stage completed, so the configuration was published
        assert_eq!(
            vec![vec!["a".to_string(), "b".to_string()]],
            *fx.fsm.committed_confs.lock()
        );
    }

    #[test]
    fn test_missing_entry_latches_error_and_stops_applying() {
        let errors = Arc::new(AtomicUsize::new(0));
        let node_errors = errors.clone();
        let fx = fixture_with(move |opts| {
            opts.on_node_error = Some(Arc::new(move |_e| {
                node_errors.fetch_add(1, Ordering::SeqCst);
            }));
        });
        fx.log_manager
            .put_entry(LogEntry::new_data(LogId::new(1, 1), vec![1]));
        // index 2 is missing from the log
        fx.closure_queue.append_pending_closure(None);
        fx.closure_queue.append_pending_closure(None);

        fx.caller.on_committed(2);
        fx.caller.flush();

        assert_eq!(1, fx.fsm.applied.lock().len());
        assert_eq!(1, fx.fsm.errors.load(Ordering::SeqCst));
        assert_eq!(1, errors.load(Ordering::SeqCst));
        // a poisoned pipeline never advances
        assert_eq!(0, fx.caller.last_applied_index());

        // further commits are no-ops and do not re-report
        fx.log_manager
            .put_entry(LogEntry::new_data(LogId::new(2, 1), vec![2]));
        fx.caller.on_committed(2);
        fx.caller.flush();
        assert_eq!(1, fx.fsm.applied.lock().len());
        assert_eq!(1, fx.fsm.errors.load(Ordering::SeqCst));
    }

    struct MockWriter {
        path: PathBuf,
    }

    impl SnapshotWriter for MockWriter {
        fn path(&self) -> &Path {
            &self.path
        }

        fn add_file(&self, _name: &str, _meta: Option<LocalFileMeta>) -> bool {
            true
        }
    }

    struct MockSaveClosure {
        meta: Arc<Mutex<Option<SnapshotMeta>>>,
        status: Arc<Mutex<Option<Status>>>,
    }

    impl SaveSnapshotClosure for MockSaveClosure {
        fn start(&mut self, meta: SnapshotMeta) -> Option<Arc<dyn SnapshotWriter>> {
            *self.meta.lock() = Some(meta);
            Some(Arc::new(MockWriter {
                path: PathBuf::from("/tmp/unused"),
            }))
        }

        fn run(self: Box<Self>, status: Status) {
            *self.status.lock() = Some(status);
        }
    }

    #[test]
    fn test_snapshot_save_pins_last_applied_state() {
        let fx = fixture();
        for i in 1..=5 {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 3), vec![]));
            fx.closure_queue.append_pending_closure(None);
        }
        fx.caller.on_committed(5);

        let meta = Arc::new(Mutex::new(None));
        let status = Arc::new(Mutex::new(None));
        fx.caller.on_snapshot_save(Box::new(MockSaveClosure {
            meta: meta.clone(),
            status: status.clone(),
        }));
        fx.caller.flush();

        let meta = meta.lock().clone().expect("snapshot meta captured");
        assert_eq!(5, meta.last_included_index);
        assert_eq!(3, meta.last_included_term);
        assert_eq!(vec!["p1".to_string()], meta.peers);
        assert_eq!(Some(Status::ok()), *status.lock());
    }

    struct MockReader {
        meta: SnapshotMeta,
        path: PathBuf,
    }

    impl SnapshotReader for MockReader {
        fn path(&self) -> &Path {
            &self.path
        }

        fn load_meta(&self) -> Option<SnapshotMeta> {
            Some(self.meta.clone())
        }

        fn file_meta(&self, _name: &str) -> Option<LocalFileMeta> {
            None
        }
    }

    struct MockLoadClosure {
        meta: SnapshotMeta,
        status: Arc<Mutex<Option<Status>>>,
    }

    impl LoadSnapshotClosure for MockLoadClosure {
        fn start(&mut self) -> Option<Arc<dyn SnapshotReader>> {
            Some(Arc::new(MockReader {
                meta: self.meta.clone(),
                path: PathBuf::from("/tmp/unused"),
            }))
        }

        fn run(self: Box<Self>, status: Status) {
            *self.status.lock() = Some(status);
        }
    }

    #[test]
    fn test_stale_snapshot_load_is_refused() {
        let fx = fixture();
        for i in 1..=3 {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 2), vec![]));
            fx.closure_queue.append_pending_closure(None);
        }
        fx.caller.on_committed(3);

        let status = Arc::new(Mutex::new(None));
        fx.caller.on_snapshot_load(Box::new(MockLoadClosure {
            meta: SnapshotMeta {
                last_included_index: 2,
                last_included_term: 2,
                peers: vec!["p1".to_string()],
                old_peers: vec![],
            },
            status: status.clone(),
        }));
        fx.caller.flush();

        let status = status.lock().clone().expect("load status");
        assert_eq!(RaftError::Stale.code(), status.code());
        assert_eq!(3, fx.caller.last_applied_index());
    }

    #[test]
    fn test_snapshot_load_overwrites_applied_state() {
        let fx = fixture();
        let status = Arc::new(Mutex::new(None));
        fx.caller.on_snapshot_load(Box::new(MockLoadClosure {
            meta: SnapshotMeta {
                last_included_index: 100,
                last_included_term: 5,
                peers: vec!["p1".to_string()],
                old_peers: vec![],
            },
            status: status.clone(),
        }));
        fx.caller.flush();

        assert_eq!(Some(Status::ok()), *status.lock());
        assert_eq!(100, fx.caller.last_applied_index());
        assert_eq!(1, fx.fsm.committed_confs.lock().len());
    }

    #[test]
    fn test_leader_events_reach_state_machine_in_order() {
        let fx = fixture();
        fx.caller.on_leader_start(2);
        fx.caller.on_leader_start(3);
        fx.caller.flush();
        assert_eq!(vec![2, 3], *fx.fsm.leader_terms.lock());
    }

    #[test]
    fn test_applied_index_listener_is_notified() {
        struct Listener {
            seen: AtomicU64,
        }
        impl LastAppliedLogIndexListener for Listener {
            fn on_applied(&self, index: u64) {
                self.seen.store(index, Ordering::SeqCst);
            }
        }

        let fx = fixture();
        let listener = Arc::new(Listener {
            seen: AtomicU64::new(0),
        });
        fx.caller.add_last_applied_listener(listener.clone());
        fx.log_manager
            .put_entry(LogEntry::new_data(LogId::new(1, 1), vec![]));
        fx.closure_queue.append_pending_closure(None);
        fx.caller.on_committed(1);
        fx.caller.flush();
        assert_eq!(1, listener.seen.load(Ordering::SeqCst));
    }

    #[test]
    fn test_shutdown_then_join_rejects_new_tasks() {
        let shutdown_status = Arc::new(Mutex::new(None));
        let captured = shutdown_status.clone();
        let fx = fixture_with(move |opts| {
            opts.after_shutdown = Some(Box::new(move |status| {
                *captured.lock() = Some(status);
            }));
        });
        fx.caller.shutdown();
        fx.caller.join();
        assert!(!fx.caller.on_committed(1));
        assert_eq!(1, fx.fsm.shutdowns.load(Ordering::SeqCst));
        assert_eq!(Some(Status::ok()), *shutdown_status.lock());
    }

    #[test]
    fn test_commit_storm_applies_each_entry_exactly_once() {
        let fx = fixture();
        const N: u64 = 1000;
        for i in 1..=N {
            fx.log_manager
                .put_entry(LogEntry::new_data(LogId::new(i, 1), vec![]));
            fx.closure_queue.append_pending_closure(None);
        }
        let mut producers = Vec::new();
        for p in 0..4u64 {
            let caller_tx = fx.caller.tx.clone();
            producers.push(thread::spawn(move || {
                let mut index = p + 1;
                while index <= N {
                    caller_tx
                        .send(ApplyTask::Committed { index })
                        .expect("send committed");
                    index += 4;
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }
        fx.caller.flush();
        assert_eq!(N, fx.caller.last_applied_index());
        let applied = fx.fsm.applied.lock();
        assert_eq!(N as usize, applied.len());
        // strict log order, no skips, no re-applies
        for (i, (index, _)) in applied.iter().enumerate() {
            assert_eq!(i as u64 + 1, *index);
        }
    }
}
