//! ReaperLoop - periodic redelivery of stale claims.
//!
//! # Flow
//! 1. Every `interval`, `QueueStore::reclaim_stale(role, min_idle)`
//! 2. Reclaimed tasks become claimable by this process's worker; the
//!    backend counts the redelivery against the task's attempt budget
//!
//! Only wired for backends with a pending-entry list (the stream backend).
//! The directory backend leaves stranded tasks to an operator.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::app::shutdown;
use crate::domain::Role;
use crate::ports::QueueStore;

pub struct ReaperLoop {
    role: Role,
    store: Arc<dyn QueueStore>,
    interval: Duration,
    min_idle: Duration,
}

impl ReaperLoop {
    pub fn new(role: Role, store: Arc<dyn QueueStore>, interval: Duration, min_idle: Duration) -> Self {
        Self {
            role,
            store,
            interval,
            min_idle,
        }
    }

    /// One pass. Errors are logged; the next tick retries.
    pub async fn tick(&self) -> usize {
        match self.store.reclaim_stale(&self.role, self.min_idle).await {
            Ok(ids) if ids.is_empty() => 0,
            Ok(ids) => {
                tracing::info!(role = %self.role, count = ids.len(), tasks = ?ids, "reclaimed stale tasks");
                ids.len()
            }
            Err(e) => {
                tracing::warn!(role = %self.role, error = %e, "reclaim pass failed");
                0
            }
        }
    }

    /// Run until shutdown; returns the number of reclaimed tasks.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> usize {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut total = 0;

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown::wait(&mut shutdown) => break,
            }
            if shutdown::requested(&shutdown) {
                break;
            }
            total += self.tick().await;
        }

        tracing::debug!(role = %self.role, total, "reaper stopped");
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::status::QueueCounts;
    use crate::domain::{NewTask, TaskId, TaskRecord, TaskResult};
    use crate::error::QueueError;
    use crate::ports::StrandedTask;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands back one id per call; every third call fails.
    #[derive(Default)]
    struct Stale {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl QueueStore for Stale {
        fn backend(&self) -> &'static str {
            "stale"
        }

        async fn enqueue(&self, _task: NewTask) -> Result<TaskRecord, QueueError> {
            unreachable!()
        }

        async fn claim(&self, _role: &Role) -> Result<Option<TaskRecord>, QueueError> {
            Ok(None)
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

        async fn reclaim_stale(&self, _role: &Role, min_idle: Duration) -> Result<Vec<TaskId>, QueueError> {
            assert_eq!(min_idle, Duration::from_secs(60));
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n % 3 == 0 {
                return Err(QueueError::Connection("reset by peer".into()));
            }
            Ok(vec![TaskId::parse(format!("t{n}")).unwrap()])
        }
    }

    fn reaper(store: Arc<Stale>) -> ReaperLoop {
        ReaperLoop::new(
            Role::new("designer"),
            store,
            Duration::from_millis(10),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn tick_counts_reclaimed_and_survives_errors() {
        let store = Arc::new(Stale::default());
        let reaper = reaper(store.clone());

        assert_eq!(reaper.tick().await, 1);
        assert_eq!(reaper.tick().await, 1);
        assert_eq!(reaper.tick().await, 0);
        assert_eq!(store.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let store = Arc::new(Stale::default());
        let reaper = Arc::new(reaper(store.clone()));
        let (tx, rx) = watch::channel(false);

        let handle = tokio::spawn({
            let reaper = reaper.clone();
            async move { reaper.run(rx).await }
        });
        tokio::time::sleep(Duration::from_millis(60)).await;
        tx.send(true).unwrap();

        let total = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        let calls = store.calls.load(Ordering::SeqCst);
        assert!(calls >= 1);
        assert_eq!(total, calls - calls / 3);
    }
}
