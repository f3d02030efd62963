//! WorkerLoop - claim, generate, persist, report.
//!
//! # Flow
//! 1. `QueueStore::claim(role)`; a miss (or a lost race) sleeps one poll
//!    interval
//! 2. `FallbackPipeline::run` on the payload
//! 3. `ResultWriter::persist`, then `complete` (or `fail` when derivation or
//!    persistence failed)
//! 4. `ResultWriter::commit`; its failure never touches the task status
//!
//! # States
//! - **polling**: the loop above. Errors count as one failed iteration; from
//!   the second consecutive one the wait doubles up to `max_backoff`.
//! - **draining**: entered on shutdown. No further claims; an in-flight task
//!   gets `drain_grace` to finish, after which the loop gives up on it.
//!
//! The shutdown receiver is checked before every claim and raced against
//! every sleep. An in-flight generation call is never aborted by it.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::Instrument;

use crate::app::backoff::IdleBackoff;
use crate::app::result_writer::ResultWriter;
use crate::app::shutdown;
use crate::domain::{Role, TaskRecord};
use crate::error::QueueError;
use crate::pipeline::FallbackPipeline;
use crate::ports::QueueStore;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub poll_interval: Duration,
    pub max_backoff: Duration,
    pub drain_grace: Duration,
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// Nothing was left in flight.
    Drained,
    /// The in-flight task outlived `drain_grace`; it stays in `processing`.
    GraceExpired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerReport {
    pub claimed: u64,
    pub completed: u64,
    pub failed: u64,
    pub iteration_errors: u64,
    pub exit: WorkerExit,
}

/// Terminal state a processed task was moved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Processed {
    Completed,
    Failed,
}

#[derive(Debug, Default)]
struct Tally {
    claimed: u64,
    completed: u64,
    failed: u64,
    iteration_errors: u64,
    consecutive_errors: u32,
}

impl Tally {
    fn record(&mut self, outcome: Result<Processed, QueueError>) {
        match outcome {
            Ok(Processed::Completed) => {
                self.completed += 1;
                self.consecutive_errors = 0;
            }
            Ok(Processed::Failed) => {
                self.failed += 1;
                self.consecutive_errors = 0;
            }
            Err(e) => {
                tracing::warn!(error = %e, "could not record task outcome");
                self.error();
            }
        }
    }

    fn error(&mut self) {
        self.iteration_errors += 1;
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
    }

    fn finish(self, exit: WorkerExit) -> WorkerReport {
        WorkerReport {
            claimed: self.claimed,
            completed: self.completed,
            failed: self.failed,
            iteration_errors: self.iteration_errors,
            exit,
        }
    }
}

pub struct WorkerLoop {
    role: Role,
    store: Arc<dyn QueueStore>,
    pipeline: Arc<FallbackPipeline>,
    writer: Arc<ResultWriter>,
    backoff: IdleBackoff,
    drain_grace: Duration,
}

impl WorkerLoop {
    pub fn new(
        role: Role,
        store: Arc<dyn QueueStore>,
        pipeline: Arc<FallbackPipeline>,
        writer: Arc<ResultWriter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            role,
            store,
            pipeline,
            writer,
            backoff: IdleBackoff::new(settings.poll_interval, settings.max_backoff),
            drain_grace: settings.drain_grace,
        }
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    /// Run until `shutdown` flips to `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        let mut tally = Tally::default();
        tracing::info!(
            role = %self.role,
            backend = self.store.backend(),
            strategies = ?self.pipeline.strategy_names(),
            "worker started"
        );

        let exit = loop {
            if shutdown::requested(&shutdown) {
                break WorkerExit::Drained;
            }

            let task = match self.store.claim(&self.role).await {
                Ok(Some(task)) => task,
                Ok(None) => {
                    tally.consecutive_errors = 0;
                    if self.pause(self.backoff.base, &mut shutdown).await {
                        break WorkerExit::Drained;
                    }
                    continue;
                }
                Err(e) if e.is_conflict() => {
                    tracing::debug!(error = %e, "lost claim race");
                    tally.consecutive_errors = 0;
                    if self.pause(self.backoff.base, &mut shutdown).await {
                        break WorkerExit::Drained;
                    }
                    continue;
                }
                Err(e) => {
                    tally.error();
                    let delay = self.backoff.delay(tally.consecutive_errors);
                    tracing::warn!(
                        error = %e,
                        consecutive = tally.consecutive_errors,
                        retry_in_ms = delay.as_millis() as u64,
                        "claim failed"
                    );
                    if self.pause(delay, &mut shutdown).await {
                        break WorkerExit::Drained;
                    }
                    continue;
                }
            };
            tally.claimed += 1;

            let span = tracing::info_span!("task", task_id = %task.id(), role = %self.role);
            let process = self.process(task).instrument(span);
            tokio::pin!(process);

            let finished = tokio::select! {
                outcome = &mut process => Some(outcome),
                _ = shutdown::wait(&mut shutdown) => None,
            };

            match finished {
                Some(outcome) => {
                    let failed_iteration = outcome.is_err();
                    tally.record(outcome);
                    if failed_iteration {
                        let delay = self.backoff.delay(tally.consecutive_errors);
                        if self.pause(delay, &mut shutdown).await {
                            break WorkerExit::Drained;
                        }
                    }
                }
                None => {
                    tracing::info!(grace_ms = self.drain_grace.as_millis() as u64, "shutdown requested; draining in-flight task");
                    match tokio::time::timeout(self.drain_grace, &mut process).await {
                        Ok(outcome) => {
                            tally.record(outcome);
                            break WorkerExit::Drained;
                        }
                        Err(_) => {
                            tracing::error!("drain grace expired; task left in processing");
                            break WorkerExit::GraceExpired;
                        }
                    }
                }
            }
        };

        let report = tally.finish(exit);
        tracing::info!(
            role = %self.role,
            claimed = report.claimed,
            completed = report.completed,
            failed = report.failed,
            iteration_errors = report.iteration_errors,
            exit = ?report.exit,
            "worker stopped"
        );
        report
    }

    /// Sleep unless shutdown arrives first. Returns `true` on shutdown.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => false,
            _ = shutdown::wait(shutdown) => true,
        }
    }

    async fn process(&self, task: TaskRecord) -> Result<Processed, QueueError> {
        tracing::info!(title = %task.payload().title, attempts = task.attempts(), "task claimed");

        let output = match self.pipeline.run(task.payload()).await {
            Ok(output) => output,
            Err(e) => return self.fail(&task, &e.to_string()).await,
        };
        let result = match self.writer.persist(&output).await {
            Ok(result) => result,
            Err(e) => return self.fail(&task, &e.to_string()).await,
        };

        let completed = self.store.complete(task.id(), result.clone()).await?;
        tracing::info!(
            assets = result.assets.len(),
            outcome = ?result.outcome,
            duration_ms = result.duration_ms,
            "task completed"
        );
        self.writer.commit(&result, &completed).await;
        Ok(Processed::Completed)
    }

    async fn fail(&self, task: &TaskRecord, reason: &str) -> Result<Processed, QueueError> {
        tracing::warn!(reason, "task failed");
        self.store.fail(task.id(), reason).await?;
        Ok(Processed::Failed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::status::QueueCounts;
    use crate::domain::{AssetKind, NewTask, Payload, PipelineOutcome, TaskId, TaskResult, TaskStatus};
    use crate::error::ProviderError;
    use crate::impls::{FsAssetStore, MemoryQueue, NoopCommitSink};
    use crate::pipeline::normalize::encode_png;
    use crate::pipeline::{GenerationRequest, Strategy};
    use crate::ports::{StrandedTask, SystemClock};
    use async_trait::async_trait;
    use image::{Rgba, RgbaImage};
    use std::sync::Mutex;
    use std::time::Instant;
    use tempfile::TempDir;

    struct Scripted {
        name: &'static str,
        healthy: bool,
        delay: Duration,
    }

    impl Scripted {
        fn up(name: &'static str) -> Arc<dyn Strategy> {
            Arc::new(Self {
                name,
                healthy: true,
                delay: Duration::ZERO,
            })
        }

        fn down(name: &'static str) -> Arc<dyn Strategy> {
            Arc::new(Self {
                name,
                healthy: false,
                delay: Duration::ZERO,
            })
        }

        fn slow(delay: Duration) -> Arc<dyn Strategy> {
            Arc::new(Self {
                name: "slow",
                healthy: true,
                delay,
            })
        }
    }

    #[async_trait]
    impl Strategy for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn generate(&self, _request: &GenerationRequest) -> Result<Vec<u8>, ProviderError> {
            tokio::time::sleep(self.delay).await;
            if !self.healthy {
                return Err(ProviderError::Authentication {
                    provider: self.name.to_string(),
                    message: "invalid api key".into(),
                });
            }
            Ok(encode_png(&RgbaImage::from_pixel(256, 256, Rgba([0, 200, 0, 255]))).unwrap())
        }
    }

    struct Rig {
        store: Arc<MemoryQueue>,
        worker: Arc<WorkerLoop>,
        _out: TempDir,
    }

    fn settings(drain_grace: Duration) -> WorkerSettings {
        WorkerSettings {
            poll_interval: Duration::from_millis(10),
            max_backoff: Duration::from_millis(40),
            drain_grace,
        }
    }

    fn rig(strategies: Vec<Arc<dyn Strategy>>, drain_grace: Duration) -> Rig {
        let out = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryQueue::new());
        let writer = ResultWriter::new(
            Arc::new(FsAssetStore::new(out.path(), "assets")),
            Arc::new(NoopCommitSink),
            Arc::new(SystemClock),
        );
        let pipeline = FallbackPipeline::new(strategies, Duration::from_secs(30), "pixel-art");
        let worker = WorkerLoop::new(
            Role::new("designer"),
            store.clone(),
            Arc::new(pipeline),
            Arc::new(writer),
            settings(drain_grace),
        );
        Rig {
            store,
            worker: Arc::new(worker),
            _out: out,
        }
    }

    fn snake(role: &str) -> NewTask {
        NewTask::new(role, Payload::new("Snake Sprite", "green pixel-art snake character")).with_id("t1")
    }

    async fn wait_for_status(store: &MemoryQueue, id: &TaskId, want: TaskStatus) -> TaskRecord {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(record) = store.get(id).await.unwrap() {
                if record.status() == want {
                    return record;
                }
            }
            assert!(Instant::now() < deadline, "task never reached {want}");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    async fn run_until(rig: &Rig, want: TaskStatus) -> (WorkerReport, TaskRecord) {
        let (tx, rx) = watch::channel(false);
        let worker = rig.worker.clone();
        let handle = tokio::spawn(async move { worker.run(rx).await });

        let record = wait_for_status(&rig.store, &TaskId::parse("t1").unwrap(), want).await;
        tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        (report, record)
    }

    #[tokio::test]
    async fn happy_path_completes_with_primary_strategy() {
        let rig = rig(vec![Scripted::up("primary"), Scripted::up("secondary")], Duration::from_secs(5));
        rig.store.enqueue(snake("designer")).await.unwrap();

        let (report, record) = run_until(&rig, TaskStatus::Completed).await;

        let result = record.result().unwrap();
        assert_eq!(result.outcome, PipelineOutcome::Full);
        assert_eq!(result.assets.len(), 1);
        assert_eq!(result.assets[0].kind, AssetKind::Character);
        assert_eq!(result.assets[0].provider, "primary");
        assert_eq!((result.assets[0].target_size.width, result.assets[0].target_size.height), (64, 64));
        assert_eq!(report.claimed, 1);
        assert_eq!(report.completed, 1);
        assert_eq!(report.exit, WorkerExit::Drained);
    }

    #[tokio::test]
    async fn total_outage_still_completes() {
        let rig = rig(vec![Scripted::down("primary"), Scripted::down("secondary")], Duration::from_secs(5));
        rig.store.enqueue(snake("designer")).await.unwrap();

        let (report, record) = run_until(&rig, TaskStatus::Completed).await;

        let result = record.result().unwrap();
        assert_eq!(result.outcome, PipelineOutcome::Placeholder);
        assert_eq!(result.assets[0].provider, "placeholder");
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn underivable_payload_fails_the_task() {
        let rig = rig(vec![Scripted::up("primary")], Duration::from_secs(5));
        rig.store
            .enqueue(NewTask::new("designer", Payload::new("Snake Sprite", "   ")).with_id("t1"))
            .await
            .unwrap();

        let (report, record) = run_until(&rig, TaskStatus::Failed).await;

        assert!(record.error().unwrap().contains("derive"));
        assert_eq!(report.failed, 1);
    }

    #[tokio::test]
    async fn other_roles_are_left_alone() {
        let rig = rig(vec![Scripted::up("primary")], Duration::from_secs(5));
        rig.store
            .enqueue(NewTask::new("writer", Payload::new("Lore", "write a story")).with_id("w1"))
            .await
            .unwrap();
        rig.store.enqueue(snake("designer")).await.unwrap();

        let (report, _) = run_until(&rig, TaskStatus::Completed).await;

        let writer_task = rig.store.get(&TaskId::parse("w1").unwrap()).await.unwrap().unwrap();
        assert_eq!(writer_task.status(), TaskStatus::Pending);
        assert_eq!(report.claimed, 1);
    }

    #[tokio::test]
    async fn shutdown_lets_in_flight_task_finish() {
        let rig = rig(vec![Scripted::slow(Duration::from_millis(200))], Duration::from_secs(5));
        rig.store.enqueue(snake("designer")).await.unwrap();

        let (report, _) = run_until(&rig, TaskStatus::Processing).await;

        assert_eq!(report.exit, WorkerExit::Drained);
        assert_eq!(report.completed, 1);
        let record = rig.store.get(&TaskId::parse("t1").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status(), TaskStatus::Completed);
    }

    #[tokio::test]
    async fn drain_grace_expiry_leaves_task_processing() {
        let rig = rig(vec![Scripted::slow(Duration::from_secs(20))], Duration::from_millis(50));
        rig.store.enqueue(snake("designer")).await.unwrap();

        let (report, _) = run_until(&rig, TaskStatus::Processing).await;

        assert_eq!(report.exit, WorkerExit::GraceExpired);
        assert_eq!(report.completed, 0);
        let record = rig.store.get(&TaskId::parse("t1").unwrap()).await.unwrap().unwrap();
        assert_eq!(record.status(), TaskStatus::Processing);
    }

    #[tokio::test]
    async fn dropped_sender_stops_idle_worker() {
        let rig = rig(Vec::new(), Duration::from_secs(5));
        let (tx, rx) = watch::channel(false);
        let worker = rig.worker.clone();
        let handle = tokio::spawn(async move { worker.run(rx).await });

        tokio::time::sleep(Duration::from_millis(30)).await;
        drop(tx);

        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(report.exit, WorkerExit::Drained);
        assert_eq!(report.claimed, 0);
    }

    /// Store whose `claim` always fails; remembers when it was called.
    #[derive(Default)]
    struct Unreachable {
        calls: Mutex<Vec<Instant>>,
    }

    #[async_trait]
    impl QueueStore for Unreachable {
        fn backend(&self) -> &'static str {
            "unreachable"
        }

        async fn enqueue(&self, _task: NewTask) -> Result<TaskRecord, QueueError> {
            Err(QueueError::Connection("down".into()))
        }

        async fn claim(&self, _role: &Role) -> Result<Option<TaskRecord>, QueueError> {
            self.calls.lock().unwrap().push(Instant::now());
            Err(QueueError::Connection("connection refused".into()))
        }

        async fn complete(&self, id: &TaskId, _result: TaskResult) -> Result<TaskRecord, QueueError> {
            Err(QueueError::NotFound(id.clone()))
        }

        async fn fail(&self, id: &TaskId, _error: &str) -> Result<TaskRecord, QueueError> {
            Err(QueueError::NotFound(id.clone()))
        }

        async fn get(&self, _id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
            Ok(None)
        }

        async fn counts(&self) -> Result<QueueCounts, QueueError> {
            Ok(QueueCounts::default())
        }

        async fn stranded(&self) -> Result<Vec<StrandedTask>, QueueError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn claim_errors_back_off_and_never_stop_the_loop() {
        let store = Arc::new(Unreachable::default());
        let out = tempfile::tempdir().unwrap();
        let worker = Arc::new(WorkerLoop::new(
            Role::new("designer"),
            store.clone(),
            Arc::new(FallbackPipeline::placeholder_only("pixel-art")),
            Arc::new(ResultWriter::new(
                Arc::new(FsAssetStore::new(out.path(), "assets")),
                Arc::new(NoopCommitSink),
                Arc::new(SystemClock),
            )),
            settings(Duration::from_secs(1)),
        ));

        let (tx, rx) = watch::channel(false);
        let handle = tokio::spawn({
            let worker = worker.clone();
            async move { worker.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        tx.send(true).unwrap();
        let report = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();

        let calls = store.calls.lock().unwrap().clone();
        assert!(calls.len() >= 4, "only {} claims", calls.len());
        assert_eq!(report.iteration_errors, calls.len() as u64);
        assert_eq!(report.exit, WorkerExit::Drained);

        // Gap after the n-th consecutive error is at least the backoff delay.
        let backoff = IdleBackoff::new(Duration::from_millis(10), Duration::from_millis(40));
        for (n, pair) in calls.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = backoff.delay(n as u32 + 1);
            assert!(gap + Duration::from_millis(1) >= expected, "gap {gap:?} < {expected:?} after {} errors", n + 1);
        }
    }
}
