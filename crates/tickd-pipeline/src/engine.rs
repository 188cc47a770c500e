//! Job-level state machine and worker loop.
//!
//! `PENDING → RUNNING → (SUCCESS | FAILURE)`; terminal states are
//! absorbing. Identical run keys denote the same logical run: requests for a
//! pending, running or succeeded key are dropped, a failed key may be
//! replayed by re-emitting the request.

use std::sync::Arc;

use dashmap::DashMap;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use tickd_core::ErrorKind;
use tickd_sensor::{JobRequest, RunTags};

use crate::notify::TerminalObserver;
use crate::stage::StageId;

/// What a successful run hands to the success notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptSummary {
    pub transaction_id: i64,
    pub store_name: String,
    pub total: Decimal,
    pub currency: String,
}

/// First failure the engine saw: the failing stage and its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub stage: StageId,
    pub kind: ErrorKind,
    pub reason: String,
}

/// Registry entry per run key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Pending,
    Running,
    Success,
    Failure { stage: StageId, kind: ErrorKind },
}

impl JobStatus {
    fn is_replayable(&self) -> bool {
        matches!(self, JobStatus::Failure { .. })
    }
}

/// Terminal result delivered to observers, exactly once per run.
#[derive(Debug, Clone)]
pub struct JobOutcome {
    pub run_key: String,
    pub tags: RunTags,
    pub result: Result<ReceiptSummary, JobFailure>,
}

/// The body of one job. The engine is generic over this so the state
/// machine and observer plumbing are testable without live adapters.
#[async_trait::async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(
        &self,
        request: &JobRequest,
        cancel: &CancellationToken,
    ) -> Result<ReceiptSummary, JobFailure>;
}

/// Drives jobs from an mpsc feed until shutdown. At most
/// `max_concurrent_jobs` run at once; the sensor side stays a single poller.
pub struct Engine<R: JobRunner> {
    runner: Arc<R>,
    observers: Vec<Arc<dyn TerminalObserver>>,
    runs: Arc<DashMap<String, JobStatus>>,
    max_concurrent: usize,
}

impl<R: JobRunner> Engine<R> {
    pub fn new(runner: Arc<R>, max_concurrent: usize) -> Self {
        Self {
            runner,
            observers: Vec::new(),
            runs: Arc::new(DashMap::new()),
            max_concurrent: max_concurrent.max(1),
        }
    }

    /// Register a terminal-state observer. Observers run in registration
    /// order after a job reaches SUCCESS or FAILURE.
    pub fn add_observer(&mut self, observer: Arc<dyn TerminalObserver>) {
        self.observers.push(observer);
    }

    /// Status snapshot for one run key.
    pub fn status(&self, run_key: &str) -> Option<JobStatus> {
        self.runs.get(run_key).map(|entry| *entry.value())
    }

    /// Main loop: accept requests until the channel closes or shutdown
    /// flips, then cancel in-flight jobs cooperatively and drain them.
    pub async fn run(self, mut rx: mpsc::Receiver<JobRequest>, mut shutdown: watch::Receiver<bool>) {
        info!(max_jobs = self.max_concurrent, "pipeline engine started");
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let cancel_root = CancellationToken::new();
        let mut tasks: JoinSet<()> = JoinSet::new();

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(request) => {
                            self.dispatch(request, &semaphore, &cancel_root, &mut tasks);
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("pipeline engine shutting down");
                        cancel_root.cancel();
                        break;
                    }
                }
            }
        }

        while let Some(res) = tasks.join_next().await {
            if let Err(e) = res {
                error!("job task panicked: {e}");
            }
        }
        info!("pipeline engine stopped");
    }

    fn dispatch(
        &self,
        request: JobRequest,
        semaphore: &Arc<Semaphore>,
        cancel_root: &CancellationToken,
        tasks: &mut JoinSet<()>,
    ) {
        // Dedup on the run key. A terminal FAILURE may be replayed; anything
        // else already owns the key.
        match self.runs.entry(request.run_key.clone()) {
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(JobStatus::Pending);
            }
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if occupied.get().is_replayable() {
                    debug!(run_key = %request.run_key, "replaying failed run");
                    occupied.insert(JobStatus::Pending);
                } else {
                    debug!(
                        run_key = %request.run_key,
                        status = ?occupied.get(),
                        "duplicate run key, dropping"
                    );
                    return;
                }
            }
        }

        let runner = Arc::clone(&self.runner);
        let observers = self.observers.clone();
        let runs = Arc::clone(&self.runs);
        let semaphore = Arc::clone(semaphore);
        let cancel = cancel_root.child_token();

        tasks.spawn(async move {
            let _permit = match semaphore.acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => return,
            };

            runs.insert(request.run_key.clone(), JobStatus::Running);
            info!(run_key = %request.run_key, "job started");

            let result = runner.run(&request, &cancel).await;

            let terminal = match &result {
                Ok(summary) => {
                    info!(
                        run_key = %request.run_key,
                        transaction_id = summary.transaction_id,
                        "job succeeded"
                    );
                    JobStatus::Success
                }
                Err(failure) => {
                    warn!(
                        run_key = %request.run_key,
                        stage = %failure.stage,
                        kind = %failure.kind,
                        "job failed: {}",
                        failure.reason
                    );
                    JobStatus::Failure {
                        stage: failure.stage,
                        kind: failure.kind,
                    }
                }
            };
            runs.insert(request.run_key.clone(), terminal);

            let outcome = JobOutcome {
                run_key: request.run_key.clone(),
                tags: request.tags.clone(),
                result,
            };
            for observer in &observers {
                observer.on_terminal(&outcome).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tickd_sensor::RunTags;

    fn request(key: &str) -> JobRequest {
        JobRequest {
            run_key: key.to_string(),
            tags: RunTags::default(),
        }
    }

    /// Counts invocations; fails the keys listed in `fail`, cancels
    /// cooperatively.
    struct MockRunner {
        calls: AtomicUsize,
        fail: Vec<String>,
    }

    impl MockRunner {
        fn new(fail: &[&str]) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: fail.iter().map(|s| s.to_string()).collect(),
            }
        }
    }

    #[async_trait::async_trait]
    impl JobRunner for MockRunner {
        async fn run(
            &self,
            request: &JobRequest,
            cancel: &CancellationToken,
        ) -> Result<ReceiptSummary, JobFailure> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if cancel.is_cancelled() {
                return Err(JobFailure {
                    stage: StageId::ReconstructMessage,
                    kind: ErrorKind::Cancelled,
                    reason: "job cancelled".into(),
                });
            }
            if self.fail.contains(&request.run_key) {
                return Err(JobFailure {
                    stage: StageId::Extract,
                    kind: ErrorKind::LlmDecode,
                    reason: "no JSON object in response".into(),
                });
            }
            Ok(ReceiptSummary {
                transaction_id: 1,
                store_name: "Migros".into(),
                total: Decimal::new(4250, 2),
                currency: "CHF".into(),
            })
        }
    }

    #[derive(Default)]
    struct RecordingObserver {
        outcomes: Mutex<Vec<JobOutcome>>,
    }

    #[async_trait::async_trait]
    impl TerminalObserver for RecordingObserver {
        async fn on_terminal(&self, outcome: &JobOutcome) {
            self.outcomes.lock().unwrap().push(outcome.clone());
        }
    }

    async fn run_engine(
        runner: Arc<MockRunner>,
        observer: Arc<RecordingObserver>,
        requests: Vec<JobRequest>,
    ) {
        let mut engine = Engine::new(runner, 2);
        engine.add_observer(observer);
        let (tx, rx) = mpsc::channel(16);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        for req in requests {
            tx.send(req).await.unwrap();
        }
        drop(tx);
        engine.run(rx, shutdown_rx).await;
    }

    #[tokio::test]
    async fn success_notifies_exactly_once() {
        let runner = Arc::new(MockRunner::new(&[]));
        let observer = Arc::new(RecordingObserver::default());
        run_engine(Arc::clone(&runner), Arc::clone(&observer), vec![request("r1")]).await;

        let outcomes = observer.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(outcomes[0].result.is_ok());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_notifies_exactly_once_with_stage_and_kind() {
        let runner = Arc::new(MockRunner::new(&["r1"]));
        let observer = Arc::new(RecordingObserver::default());
        run_engine(Arc::clone(&runner), Arc::clone(&observer), vec![request("r1")]).await;

        let outcomes = observer.outcomes.lock().unwrap();
        assert_eq!(outcomes.len(), 1);
        let failure = outcomes[0].result.as_ref().unwrap_err();
        assert_eq!(failure.stage, StageId::Extract);
        assert_eq!(failure.kind, ErrorKind::LlmDecode);
    }

    #[tokio::test]
    async fn duplicate_run_keys_run_once() {
        let runner = Arc::new(MockRunner::new(&[]));
        let observer = Arc::new(RecordingObserver::default());
        run_engine(
            Arc::clone(&runner),
            Arc::clone(&observer),
            vec![request("dup"), request("dup"), request("dup")],
        )
        .await;

        // One execution, one notification — the duplicates were absorbed.
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(observer.outcomes.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn distinct_run_keys_all_run() {
        let runner = Arc::new(MockRunner::new(&[]));
        let observer = Arc::new(RecordingObserver::default());
        run_engine(
            Arc::clone(&runner),
            Arc::clone(&observer),
            vec![request("a"), request("b"), request("c")],
        )
        .await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 3);
        assert_eq!(observer.outcomes.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn failed_runs_may_be_replayed() {
        let runner = Arc::new(MockRunner::new(&["r1"]));
        let observer = Arc::new(RecordingObserver::default());
        let mut engine = Engine::new(Arc::clone(&runner), 2);
        engine.add_observer(Arc::clone(&observer) as Arc<dyn TerminalObserver>);

        let (tx, rx) = mpsc::channel(4);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx, shutdown_rx));

        tx.send(request("r1")).await.unwrap();
        // Wait for the first run to reach FAILURE before replaying, so the
        // second emission is a genuine replay rather than a dropped duplicate.
        while observer.outcomes.lock().unwrap().is_empty() {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        tx.send(request("r1")).await.unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
        assert_eq!(observer.outcomes.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn shutdown_cancels_queued_work_cooperatively() {
        let runner = Arc::new(MockRunner::new(&[]));
        let observer = Arc::new(RecordingObserver::default());
        let mut engine = Engine::new(Arc::clone(&runner), 1);
        engine.add_observer(Arc::clone(&observer) as Arc<dyn TerminalObserver>);

        let (tx, rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(engine.run(rx, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        handle.await.unwrap();
        drop(tx);
        // No work was dispatched; nothing notified, nothing run.
        assert_eq!(runner.calls.load(Ordering::SeqCst), 0);
        assert!(observer.outcomes.lock().unwrap().is_empty());
    }
}
