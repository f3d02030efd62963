//! DirectoryQueue - file-per-task queue on a shared filesystem.
//!
//! # Layout
//! ```text
//! <root>/pending/<id>.json
//! <root>/processing/<id>.json
//! <root>/completed/<id>.json
//! <root>/failed/<id>.json
//! <root>/.finishing/<id>.json   task taken out of processing by complete/fail
//! <root>/.ids/<id>              enqueue reservation, one per id ever accepted
//! <root>/.tmp/                  staging area, same filesystem as the partitions
//! ```
//!
//! # Design
//! - Every write is staged in `.tmp/` and published with a single `rename`
//!   (or `hard_link` on enqueue, which refuses to replace an existing id).
//!   Readers therefore see either the old file or the new one.
//! - Enqueue first creates `.ids/<id>` with `create_new`; of two producers
//!   using the same id exactly one gets the reservation.
//! - Claim is the `rename(pending/x, processing/x)` itself. When two workers
//!   race, exactly one rename finds the source; the other gets `NotFound`.
//! - The record is rewritten after the claim rename. If that rewrite fails,
//!   or the process dies first, the file under `processing/` still says
//!   `pending`. The directory is authoritative: `get` and `stranded` report
//!   it as processing and `complete` / `fail` accept it.
//! - `complete` / `fail` start with `rename(processing/x, .finishing/x)`, so
//!   only one of them can win. The winner publishes the terminal copy and
//!   then drops `.finishing/x`. A `.finishing` copy reads as processing
//!   unless a terminal copy already exists.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::fs;
use ulid::Ulid;

use crate::app::status::QueueCounts;
use crate::domain::{
    NewTask, Role, TaskId, TaskRecord, TaskResult, TaskStatus, TransitionError,
};
use crate::error::QueueError;
use crate::ports::{Clock, IdGenerator, QueueStore, StrandedTask, SystemClock, UlidGenerator};

const STAGING_DIR: &str = ".tmp";
const FINISHING_DIR: &str = ".finishing";
const RESERVED_DIR: &str = ".ids";
const EXTENSION: &str = "json";

pub struct DirectoryQueue {
    root: PathBuf,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
}

impl DirectoryQueue {
    /// Open (and create if needed) a queue rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, QueueError> {
        Self::with_clock(root, Arc::new(SystemClock)).await
    }

    pub async fn with_clock(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let root = root.into();
        let dirs = TaskStatus::ALL
            .into_iter()
            .map(TaskStatus::as_str)
            .chain([STAGING_DIR, FINISHING_DIR, RESERVED_DIR]);
        for name in dirs {
            let dir = root.join(name);
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| QueueError::io(&dir, e))?;
        }

        Ok(Self {
            root,
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        })
    }

    fn partition_dir(&self, status: TaskStatus) -> PathBuf {
        self.root.join(status.as_str())
    }

    fn task_path(&self, status: TaskStatus, id: &TaskId) -> PathBuf {
        self.partition_dir(status)
            .join(format!("{}.{EXTENSION}", id.as_str()))
    }

    fn finishing_path(&self, id: &TaskId) -> PathBuf {
        self.root
            .join(FINISHING_DIR)
            .join(format!("{}.{EXTENSION}", id.as_str()))
    }

    /// Write `record` to a fresh staging file and return its path.
    async fn stage(&self, record: &TaskRecord) -> Result<PathBuf, QueueError> {
        let body = serde_json::to_vec_pretty(record)
            .map_err(|e| QueueError::Backend(format!("encode task {}: {e}", record.id())))?;
        // Unique per writer so concurrent processes never share a staging file.
        let path = self
            .root
            .join(STAGING_DIR)
            .join(format!("{}.{}.tmp", record.id(), Ulid::new()));
        fs::write(&path, body)
            .await
            .map_err(|e| QueueError::io(&path, e))?;
        Ok(path)
    }

    /// Stage then rename over `dest`.
    async fn publish(&self, record: &TaskRecord, dest: &Path) -> Result<(), QueueError> {
        let staged = self.stage(record).await?;
        if let Err(e) = fs::rename(&staged, dest).await {
            let _ = fs::remove_file(&staged).await;
            return Err(QueueError::io(dest, e));
        }
        Ok(())
    }

    async fn exists(&self, path: &Path) -> Result<bool, QueueError> {
        fs::try_exists(path)
            .await
            .map_err(|e| QueueError::io(path, e))
    }

    async fn has_terminal_copy(&self, id: &TaskId) -> Result<bool, QueueError> {
        for terminal in [TaskStatus::Completed, TaskStatus::Failed] {
            if self.exists(&self.task_path(terminal, id)).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn id_exists(&self, id: &TaskId) -> Result<bool, QueueError> {
        for status in TaskStatus::ALL {
            if self.exists(&self.task_path(status, id)).await? {
                return Ok(true);
            }
        }
        self.exists(&self.finishing_path(id)).await
    }

    /// Claim `id` for this enqueue. Only one caller ever gets it.
    async fn reserve(&self, id: &TaskId) -> Result<PathBuf, QueueError> {
        let path = self.root.join(RESERVED_DIR).join(id.as_str());
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .await
        {
            Ok(_) => Ok(path),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(duplicate(id)),
            Err(e) => Err(QueueError::io(&path, e)),
        }
    }

    /// Stage the record and link it into `pending/`.
    async fn publish_new(&self, record: &TaskRecord) -> Result<(), QueueError> {
        let staged = self.stage(record).await?;
        let dest = self.task_path(TaskStatus::Pending, record.id());

        // hard_link never replaces an existing file, unlike rename.
        let linked = fs::hard_link(&staged, &dest).await;
        let _ = fs::remove_file(&staged).await;
        match linked {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => Err(duplicate(record.id())),
            Err(e) => Err(QueueError::io(&dest, e)),
        }
    }

    /// List every parseable record in `dir`. Corrupt files are logged and
    /// left where they are.
    async fn scan(&self, dir: &Path, partition: &str) -> Result<Vec<TaskRecord>, QueueError> {
        let mut entries = fs::read_dir(dir)
            .await
            .map_err(|e| QueueError::io(dir, e))?;

        let mut records = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(dir, e))?
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some(EXTENSION) {
                continue;
            }
            match read_record(&path).await {
                Ok(Some(record)) => records.push(record),
                // Vanished between listing and reading: someone else moved it.
                Ok(None) => {}
                Err(QueueError::Corrupt { location, reason }) => {
                    tracing::warn!(
                        backend = "directory",
                        partition,
                        %location,
                        %reason,
                        "skipping unreadable task file"
                    );
                }
                Err(e) => return Err(e),
            }
        }
        Ok(records)
    }

    async fn scan_partition(&self, status: TaskStatus) -> Result<Vec<TaskRecord>, QueueError> {
        self.scan(&self.partition_dir(status), status.as_str()).await
    }

    /// Records under `.finishing/` that never reached a terminal partition.
    async fn unfinished(&self) -> Result<Vec<TaskRecord>, QueueError> {
        let mut unfinished = Vec::new();
        for record in self.scan(&self.root.join(FINISHING_DIR), FINISHING_DIR).await? {
            if !self.has_terminal_copy(record.id()).await? {
                unfinished.push(record);
            }
        }
        Ok(unfinished)
    }

    async fn count(&self, status: TaskStatus) -> Result<usize, QueueError> {
        let dir = self.partition_dir(status);
        let mut entries = fs::read_dir(&dir)
            .await
            .map_err(|e| QueueError::io(&dir, e))?;
        let mut n = 0;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| QueueError::io(&dir, e))?
        {
            if entry.path().extension().and_then(|ext| ext.to_str()) == Some(EXTENSION) {
                n += 1;
            }
        }
        Ok(n)
    }

    /// Shared tail of `complete` and `fail`.
    async fn finish<F>(
        &self,
        id: &TaskId,
        target: TaskStatus,
        apply: F,
    ) -> Result<TaskRecord, QueueError>
    where
        F: FnOnce(&mut TaskRecord, DateTime<Utc>) -> Result<(), TransitionError>,
    {
        let processing = self.task_path(TaskStatus::Processing, id);
        if self.has_terminal_copy(id).await? {
            if self.exists(&processing).await? {
                tracing::warn!(
                    backend = "directory",
                    task_id = %id,
                    "task has both a terminal and a processing copy"
                );
            }
            return Err(QueueError::NotFound(id.clone()));
        }

        // Only one caller's rename finds the processing copy.
        let taken = self.finishing_path(id);
        match fs::rename(&processing, &taken).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(QueueError::NotFound(id.clone()));
            }
            Err(e) => return Err(QueueError::io(&processing, e)),
        }

        match self.settle(id, &taken, target, apply).await {
            Ok(record) => {
                if let Err(e) = fs::remove_file(&taken).await {
                    tracing::warn!(
                        backend = "directory",
                        task_id = %id,
                        path = %taken.display(),
                        error = %e,
                        "finished task left a .finishing copy behind"
                    );
                }
                Ok(record)
            }
            Err(e) => {
                // Hand the task back so a later call can retry.
                if let Err(back) = fs::rename(&taken, &processing).await {
                    tracing::error!(
                        backend = "directory",
                        task_id = %id,
                        path = %taken.display(),
                        error = %back,
                        "could not return task to processing"
                    );
                }
                Err(e)
            }
        }
    }

    async fn settle<F>(
        &self,
        id: &TaskId,
        taken: &Path,
        target: TaskStatus,
        apply: F,
    ) -> Result<TaskRecord, QueueError>
    where
        F: FnOnce(&mut TaskRecord, DateTime<Utc>) -> Result<(), TransitionError>,
    {
        let Some(mut record) = read_record(taken).await? else {
            return Err(QueueError::NotFound(id.clone()));
        };
        record.assume_partition(TaskStatus::Processing);
        apply(&mut record, self.clock.now()).map_err(|_| QueueError::NotFound(id.clone()))?;
        self.publish(&record, &self.task_path(target, id)).await?;
        Ok(record)
    }
}

fn duplicate(id: &TaskId) -> QueueError {
    QueueError::Validation(format!("task {id} already exists"))
}

/// Read and parse one task file. `None` when the file does not exist.
async fn read_record(path: &Path) -> Result<Option<TaskRecord>, QueueError> {
    let body = match fs::read(path).await {
        Ok(body) => body,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(QueueError::io(path, e)),
    };
    serde_json::from_slice(&body)
        .map(Some)
        .map_err(|e| QueueError::Corrupt {
            location: path.display().to_string(),
            reason: e.to_string(),
        })
}

#[async_trait]
impl QueueStore for DirectoryQueue {
    fn backend(&self) -> &'static str {
        "directory"
    }

    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, QueueError> {
        let (id, role, payload) = task.validate()?;
        let id = id.unwrap_or_else(|| self.ids.generate_task_id());
        // Files dropped in by hand carry no reservation.
        if self.id_exists(&id).await? {
            return Err(duplicate(&id));
        }
        let reservation = self.reserve(&id).await?;

        let record = TaskRecord::new(id.clone(), role, payload, self.clock.now());
        if let Err(e) = self.publish_new(&record).await {
            let _ = fs::remove_file(&reservation).await;
            return Err(e);
        }
        tracing::debug!(backend = "directory", task_id = %id, role = %record.role(), "task enqueued");
        Ok(record)
    }

    async fn claim(&self, role: &Role) -> Result<Option<TaskRecord>, QueueError> {
        let mut candidates: Vec<TaskRecord> = self
            .scan_partition(TaskStatus::Pending)
            .await?
            .into_iter()
            .filter(|record| record.role() == role)
            .collect();
        candidates.sort_by(|a, b| {
            a.created_at()
                .cmp(&b.created_at())
                .then_with(|| a.id().cmp(b.id()))
        });

        for candidate in candidates {
            let id = candidate.id();
            let src = self.task_path(TaskStatus::Pending, id);
            let dst = self.task_path(TaskStatus::Processing, id);

            match fs::rename(&src, &dst).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {
                    let conflict = QueueError::ClaimConflict(id.clone());
                    tracing::debug!(backend = "directory", task_id = %id, "{conflict}");
                    continue;
                }
                Err(e) => return Err(QueueError::io(&src, e)),
            }

            // The rename is the claim; from here on the task is ours and is
            // handed to the caller even if the rewrite below fails.
            let mut record = match read_record(&dst).await {
                Ok(Some(record)) => record,
                Ok(None) => candidate,
                Err(e) => {
                    tracing::warn!(backend = "directory", task_id = %id, error = %e, "re-reading claimed task failed");
                    candidate
                }
            };
            record.assume_partition(TaskStatus::Pending);
            record
                .start_processing(self.clock.now())
                .map_err(|_| QueueError::ClaimConflict(record.id().clone()))?;
            if let Err(e) = self.publish(&record, &dst).await {
                tracing::warn!(
                    backend = "directory",
                    task_id = %record.id(),
                    error = %e,
                    "claimed task could not be rewritten; file still says pending"
                );
            }

            tracing::debug!(
                backend = "directory",
                task_id = %record.id(),
                role = %role,
                "task claimed"
            );
            return Ok(Some(record));
        }
        Ok(None)
    }

    async fn complete(&self, id: &TaskId, result: TaskResult) -> Result<TaskRecord, QueueError> {
        self.finish(id, TaskStatus::Completed, |record, now| {
            record.complete(result, now)
        })
        .await
    }

    async fn fail(&self, id: &TaskId, error: &str) -> Result<TaskRecord, QueueError> {
        self.finish(id, TaskStatus::Failed, |record, now| record.fail(error, now))
            .await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        // Terminal copies win over a leftover processing or .finishing copy.
        let locations = [
            (self.task_path(TaskStatus::Completed, id), TaskStatus::Completed),
            (self.task_path(TaskStatus::Failed, id), TaskStatus::Failed),
            (self.task_path(TaskStatus::Processing, id), TaskStatus::Processing),
            (self.finishing_path(id), TaskStatus::Processing),
            (self.task_path(TaskStatus::Pending, id), TaskStatus::Pending),
        ];
        for (path, status) in locations {
            if let Some(mut record) = read_record(&path).await? {
                record.assume_partition(status);
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut counts = QueueCounts::default();
        for status in TaskStatus::ALL {
            counts.add(status, self.count(status).await?);
        }
        counts.add(TaskStatus::Processing, self.unfinished().await?.len());
        Ok(counts)
    }

    async fn stranded(&self) -> Result<Vec<StrandedTask>, QueueError> {
        let mut records = self.scan_partition(TaskStatus::Processing).await?;
        records.extend(self.unfinished().await?);
        let mut stranded: Vec<StrandedTask> = records
            .into_iter()
            .map(|record| StrandedTask {
                id: record.id().clone(),
                role: record.role().clone(),
                embedded_status: record.status(),
            })
            .collect();
        stranded.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(stranded)
    }
}
