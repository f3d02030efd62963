//! Redis Streams-backed queue (consumer groups, at-least-once delivery).
//!
//! ## Keys (namespace `ns`)
//!
//! - `ns:stream:<role>`: one stream per role, consumer group `<role>-workers`
//!   created lazily with `MKSTREAM` from id `0`
//! - `ns:task:<id>`: JSON task record, same schema as a directory task file
//! - `ns:tasks:<status>`: one set per partition, ids move with `SMOVE`
//! - `ns:entries`: hash task id -> stream entry id
//!
//! Every state change that touches more than one key runs as a Lua script so
//! the record body, the partition sets and the stream acknowledgement never
//! disagree.
//!
//! ## Delivery
//!
//! Exclusivity comes from the consumer group: an entry is delivered to one
//! consumer at a time. A consumer first replays its own pending-entry list
//! (entries handed over by the reclaim pass, or left behind by a previous
//! incarnation with the same name), then reads new entries with `BLOCK`.
//! `complete` / `fail` check with `XPENDING` that this consumer still owns the
//! entry; a reclaimed entry therefore cannot be finished twice.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamRangeReply, StreamReadReply};
use redis::Script;

use crate::app::status::QueueCounts;
use crate::domain::{NewTask, Role, TaskId, TaskRecord, TaskResult, TaskStatus};
use crate::error::QueueError;
use crate::ports::{Clock, IdGenerator, QueueStore, StrandedTask, SystemClock, UlidGenerator};

/// Own-history entries inspected per claim.
const HISTORY_BATCH: usize = 16;

/// Entries moved per reclaim pass.
const RECLAIM_BATCH: usize = 100;

/// History/new-entry rounds before a claim reports a miss.
const CLAIM_ROUNDS: usize = 4;

const ENQUEUE_SCRIPT: &str = r#"
-- KEYS: record, pending set, stream, entries hash
-- ARGV: id, record json, role, title, prompt, createdAt
if redis.call('EXISTS', KEYS[1]) == 1 then
  return false
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SADD', KEYS[2], ARGV[1])
local entry = redis.call('XADD', KEYS[3], '*',
  'id', ARGV[1], 'role', ARGV[3], 'title', ARGV[4], 'prompt', ARGV[5], 'createdAt', ARGV[6])
redis.call('HSET', KEYS[4], ARGV[1], entry)
return entry
"#;

const CLAIM_SCRIPT: &str = r#"
-- KEYS: record, pending set, processing set
-- ARGV: id, record json, expected partition
if ARGV[3] == 'pending' then
  if redis.call('SMOVE', KEYS[2], KEYS[3], ARGV[1]) == 0 then
    return 0
  end
elseif redis.call('SISMEMBER', KEYS[3], ARGV[1]) == 0 then
  return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

const FINISH_SCRIPT: &str = r#"
-- KEYS: record, processing set, terminal set, stream, entries hash
-- ARGV: id, record json, group, consumer
if redis.call('SISMEMBER', KEYS[2], ARGV[1]) == 0 then
  return 0
end
local entry = redis.call('HGET', KEYS[5], ARGV[1])
if entry then
  local owner = redis.call('XPENDING', KEYS[4], ARGV[3], entry, entry, 1)
  if #owner == 0 or owner[1][2] ~= ARGV[4] then
    return -1
  end
  redis.call('XACK', KEYS[4], ARGV[3], entry)
end
redis.call('SET', KEYS[1], ARGV[2])
redis.call('SMOVE', KEYS[2], KEYS[3], ARGV[1])
return 1
"#;

#[derive(Debug, Clone)]
pub struct StreamQueueSettings {
    /// Key prefix.
    pub namespace: String,
    /// Consumer name inside each role's group. Must be unique per live
    /// process.
    pub consumer: String,
    /// `BLOCK` for new-entry reads; the worker's poll interval.
    pub block: Duration,
    /// Deliveries after which a task is failed instead of processed again.
    pub max_deliveries: u32,
}

pub struct StreamQueue {
    conn: MultiplexedConnection,
    /// Separate connection for `XREADGROUP ... BLOCK` so blocked reads never
    /// stall ordinary commands.
    blocking: MultiplexedConnection,
    settings: StreamQueueSettings,
    clock: Arc<dyn Clock>,
    ids: Box<dyn IdGenerator>,
    enqueue_script: Script,
    claim_script: Script,
    finish_script: Script,
    groups: Mutex<HashSet<String>>,
    /// Tasks claimed through this instance and not yet finished.
    in_flight: Mutex<HashSet<TaskId>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Finish {
    Done,
    NotProcessing,
    LostOwnership,
}

impl Finish {
    /// Decode the finish script's reply.
    fn from_reply(code: i64) -> Self {
        match code {
            1 => Finish::Done,
            -1 => Finish::LostOwnership,
            _ => Finish::NotProcessing,
        }
    }
}

impl StreamQueue {
    /// Connect and verify the server answers. Any failure here is a
    /// `Connection` error.
    pub async fn connect(url: &str, settings: StreamQueueSettings) -> Result<Self, QueueError> {
        Self::connect_with_clock(url, settings, Arc::new(SystemClock)).await
    }

    pub async fn connect_with_clock(
        url: &str,
        settings: StreamQueueSettings,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, QueueError> {
        let unreachable = |e: redis::RedisError| QueueError::Connection(format!("{url}: {e}"));

        let client = redis::Client::open(url).map_err(unreachable)?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unreachable)?;
        let blocking = client
            .get_multiplexed_async_connection()
            .await
            .map_err(unreachable)?;
        let _: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(unreachable)?;

        Ok(Self {
            conn,
            blocking,
            ids: Box::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
            enqueue_script: Script::new(ENQUEUE_SCRIPT),
            claim_script: Script::new(CLAIM_SCRIPT),
            finish_script: Script::new(FINISH_SCRIPT),
            groups: Mutex::new(HashSet::new()),
            in_flight: Mutex::new(HashSet::new()),
            settings,
        })
    }

    fn stream_key(&self, role: &Role) -> String {
        format!("{}:stream:{}", self.settings.namespace, role)
    }

    fn record_key(&self, id: &TaskId) -> String {
        format!("{}:task:{}", self.settings.namespace, id)
    }

    fn set_key(&self, status: TaskStatus) -> String {
        format!("{}:tasks:{}", self.settings.namespace, status)
    }

    fn entries_key(&self) -> String {
        format!("{}:entries", self.settings.namespace)
    }

    fn block_ms(&self) -> u64 {
        // BLOCK 0 would wait forever.
        (self.settings.block.as_millis() as u64).max(1)
    }

    /// XGROUP CREATE ... MKSTREAM, once per process and role.
    async fn ensure_group(&self, stream: &str, group: &str) -> Result<(), QueueError> {
        if self.lock_groups().contains(stream) {
            return Ok(());
        }
        let mut conn = self.conn.clone();
        let created: redis::RedisResult<()> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("0")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match created {
            Ok(()) => {
                tracing::debug!(backend = "stream", stream, group, "consumer group created");
            }
            Err(e) if e.code() == Some("BUSYGROUP") => {}
            Err(e) => return Err(e.into()),
        }
        self.lock_groups().insert(stream.to_string());
        Ok(())
    }

    fn lock_groups(&self) -> std::sync::MutexGuard<'_, HashSet<String>> {
        self.groups.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_in_flight(&self) -> std::sync::MutexGuard<'_, HashSet<TaskId>> {
        self.in_flight
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn load(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        let key = self.record_key(id);
        let mut conn = self.conn.clone();
        let body: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut conn).await?;
        body.map(|body| {
            serde_json::from_str(&body).map_err(|e| QueueError::Corrupt {
                location: key.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
    }

    async fn ack(&self, stream: &str, group: &str, entry_id: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("XACK")
            .arg(stream)
            .arg(group)
            .arg(entry_id)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    /// Own pending-entry list, oldest first.
    async fn read_history(&self, stream: &str, group: &str) -> Result<Vec<StreamId>, QueueError> {
        let mut conn = self.conn.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(HISTORY_BATCH)
            .arg("STREAMS")
            .arg(stream)
            .arg("0")
            .query_async(&mut conn)
            .await?;
        Ok(entries(reply))
    }

    /// Next never-delivered entry, waiting up to the block interval.
    async fn read_new(&self, stream: &str, group: &str) -> Result<Vec<StreamId>, QueueError> {
        let mut conn = self.blocking.clone();
        let reply: Option<StreamReadReply> = redis::cmd("XREADGROUP")
            .arg("GROUP")
            .arg(group)
            .arg(&self.settings.consumer)
            .arg("COUNT")
            .arg(1)
            .arg("BLOCK")
            .arg(self.block_ms())
            .arg("STREAMS")
            .arg(stream)
            .arg(">")
            .query_async(&mut conn)
            .await?;
        Ok(entries(reply))
    }

    /// Turn a delivered entry into a claimed record, or `None` when the entry
    /// should be skipped.
    async fn take(
        &self,
        role: &Role,
        stream: &str,
        group: &str,
        entry: &StreamId,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let id = match entry.get::<String>("id").map(TaskId::parse) {
            Some(Ok(id)) => id,
            _ => {
                tracing::warn!(backend = "stream", stream, entry_id = %entry.id, "entry without a valid task id");
                self.ack(stream, group, &entry.id).await?;
                return Ok(None);
            }
        };

        // Gate against a concurrent claim through this same consumer.
        if !self.lock_in_flight().insert(id.clone()) {
            return Ok(None);
        }
        let taken = self.transition(role, stream, group, entry, &id).await;
        if !matches!(taken, Ok(Some(_))) {
            self.lock_in_flight().remove(&id);
        }
        taken
    }

    async fn transition(
        &self,
        role: &Role,
        stream: &str,
        group: &str,
        entry: &StreamId,
        id: &TaskId,
    ) -> Result<Option<TaskRecord>, QueueError> {
        let Some(mut record) = self.load(id).await? else {
            tracing::warn!(backend = "stream", task_id = %id, "entry refers to a missing task");
            self.ack(stream, group, &entry.id).await?;
            return Ok(None);
        };

        let expected = record.status();
        let transitioned = match expected {
            TaskStatus::Pending => record.start_processing(self.clock.now()),
            TaskStatus::Processing => record.redeliver(),
            TaskStatus::Completed | TaskStatus::Failed => {
                tracing::debug!(backend = "stream", task_id = %id, status = %expected, "acknowledging entry of finished task");
                self.ack(stream, group, &entry.id).await?;
                return Ok(None);
            }
        };
        if transitioned.is_err() {
            return Ok(None);
        }

        if record.attempts() > self.settings.max_deliveries {
            let reason = format!(
                "gave up after {} deliveries",
                record.attempts() - 1
            );
            tracing::warn!(backend = "stream", task_id = %id, role = %role, %reason, "delivery limit reached");
            record
                .fail(reason, self.clock.now())
                .map_err(|_| QueueError::NotFound(id.clone()))?;
            let finished = self.finish_record(&record, TaskStatus::Failed).await?;
            if finished != Finish::Done {
                tracing::warn!(
                    backend = "stream",
                    task_id = %id,
                    role = %role,
                    outcome = ?finished,
                    "delivery-limit failure was not recorded"
                );
            }
            return Ok(None);
        }

        let body = encode(&record)?;
        let mut conn = self.conn.clone();
        let moved: i64 = self
            .claim_script
            .key(self.record_key(id))
            .key(self.set_key(TaskStatus::Pending))
            .key(self.set_key(TaskStatus::Processing))
            .arg(id.as_str())
            .arg(body)
            .arg(expected.as_str())
            .invoke_async(&mut conn)
            .await?;
        if moved == 0 {
            let conflict = QueueError::ClaimConflict(id.clone());
            tracing::debug!(backend = "stream", task_id = %id, "{conflict}");
            return Ok(None);
        }

        tracing::debug!(
            backend = "stream",
            task_id = %id,
            role = %role,
            attempts = record.attempts(),
            "task claimed"
        );
        Ok(Some(record))
    }

    async fn finish_record(
        &self,
        record: &TaskRecord,
        target: TaskStatus,
    ) -> Result<Finish, QueueError> {
        let role = record.role();
        let body = encode(record)?;
        let mut conn = self.conn.clone();
        let outcome: i64 = self
            .finish_script
            .key(self.record_key(record.id()))
            .key(self.set_key(TaskStatus::Processing))
            .key(self.set_key(target))
            .key(self.stream_key(role))
            .key(self.entries_key())
            .arg(record.id().as_str())
            .arg(body)
            .arg(group_name(role))
            .arg(&self.settings.consumer)
            .invoke_async(&mut conn)
            .await?;
        self.lock_in_flight().remove(record.id());
        Ok(Finish::from_reply(outcome))
    }

    async fn finish<F>(&self, id: &TaskId, target: TaskStatus, apply: F) -> Result<TaskRecord, QueueError>
    where
        F: FnOnce(&mut TaskRecord) -> Result<(), crate::domain::TransitionError>,
    {
        let Some(mut record) = self.load(id).await? else {
            return Err(QueueError::NotFound(id.clone()));
        };
        if apply(&mut record).is_err() {
            return Err(QueueError::NotFound(id.clone()));
        }
        match self.finish_record(&record, target).await? {
            Finish::Done => Ok(record),
            Finish::NotProcessing => Err(QueueError::NotFound(id.clone())),
            Finish::LostOwnership => Err(QueueError::ClaimConflict(id.clone())),
        }
    }
}

fn group_name(role: &Role) -> String {
    format!("{role}-workers")
}

fn encode(record: &TaskRecord) -> Result<String, QueueError> {
    serde_json::to_string(record)
        .map_err(|e| QueueError::Backend(format!("encode task {}: {e}", record.id())))
}

fn entries(reply: Option<StreamReadReply>) -> Vec<StreamId> {
    reply
        .map(|reply| reply.keys.into_iter().flat_map(|key| key.ids).collect())
        .unwrap_or_default()
}

#[async_trait]
impl QueueStore for StreamQueue {
    fn backend(&self) -> &'static str {
        "stream"
    }

    async fn enqueue(&self, task: NewTask) -> Result<TaskRecord, QueueError> {
        let (id, role, payload) = task.validate()?;
        let id = id.unwrap_or_else(|| self.ids.generate_task_id());
        let record = TaskRecord::new(id.clone(), role, payload, self.clock.now());
        let body = encode(&record)?;

        let mut conn = self.conn.clone();
        let entry: Option<String> = self
            .enqueue_script
            .key(self.record_key(&id))
            .key(self.set_key(TaskStatus::Pending))
            .key(self.stream_key(record.role()))
            .key(self.entries_key())
            .arg(id.as_str())
            .arg(body)
            .arg(record.role().as_str())
            .arg(&record.payload().title)
            .arg(&record.payload().prompt)
            .arg(record.created_at().to_rfc3339())
            .invoke_async(&mut conn)
            .await?;

        match entry {
            Some(entry_id) => {
                tracing::debug!(backend = "stream", task_id = %id, %entry_id, "task enqueued");
                Ok(record)
            }
            None => Err(QueueError::Validation(format!("task {id} already exists"))),
        }
    }

    async fn claim(&self, role: &Role) -> Result<Option<TaskRecord>, QueueError> {
        let stream = self.stream_key(role);
        let group = group_name(role);
        self.ensure_group(&stream, &group).await?;

        for _ in 0..CLAIM_ROUNDS {
            for entry in self.read_history(&stream, &group).await? {
                if let Some(record) = self.take(role, &stream, &group, &entry).await? {
                    return Ok(Some(record));
                }
            }

            let fresh = self.read_new(&stream, &group).await?;
            if fresh.is_empty() {
                return Ok(None);
            }
            for entry in fresh {
                if let Some(record) = self.take(role, &stream, &group, &entry).await? {
                    return Ok(Some(record));
                }
            }
        }
        Ok(None)
    }

    async fn complete(&self, id: &TaskId, result: TaskResult) -> Result<TaskRecord, QueueError> {
        let now = self.clock.now();
        self.finish(id, TaskStatus::Completed, |record| record.complete(result, now))
            .await
    }

    async fn fail(&self, id: &TaskId, error: &str) -> Result<TaskRecord, QueueError> {
        let now = self.clock.now();
        self.finish(id, TaskStatus::Failed, |record| record.fail(error, now))
            .await
    }

    async fn get(&self, id: &TaskId) -> Result<Option<TaskRecord>, QueueError> {
        self.load(id).await
    }

    async fn counts(&self) -> Result<QueueCounts, QueueError> {
        let mut conn = self.conn.clone();
        let mut pipe = redis::pipe();
        for status in TaskStatus::ALL {
            pipe.cmd("SCARD").arg(self.set_key(status));
        }
        let sizes: Vec<usize> = pipe.query_async(&mut conn).await?;

        let mut counts = QueueCounts::default();
        for (status, n) in TaskStatus::ALL.into_iter().zip(sizes) {
            counts.add(status, n);
        }
        Ok(counts)
    }

    async fn stranded(&self) -> Result<Vec<StrandedTask>, QueueError> {
        let mut conn = self.conn.clone();
        let mut members: Vec<String> = redis::cmd("SMEMBERS")
            .arg(self.set_key(TaskStatus::Processing))
            .query_async(&mut conn)
            .await?;
        members.sort();

        let mut stranded = Vec::with_capacity(members.len());
        for raw in members {
            let id = TaskId::parse(raw)?;
            if let Some(record) = self.load(&id).await? {
                stranded.push(StrandedTask {
                    role: record.role().clone(),
                    embedded_status: record.status(),
                    id,
                });
            }
        }
        Ok(stranded)
    }

    async fn reclaim_stale(&self, role: &Role, min_idle: Duration) -> Result<Vec<TaskId>, QueueError> {
        let stream = self.stream_key(role);
        let group = group_name(role);
        self.ensure_group(&stream, &group).await?;

        let mut conn = self.conn.clone();
        // Reply: [next cursor, [entry ids], (redis >= 7) [deleted ids]]
        let reply: Vec<redis::Value> = redis::cmd("XAUTOCLAIM")
            .arg(&stream)
            .arg(&group)
            .arg(&self.settings.consumer)
            .arg(min_idle.as_millis() as u64)
            .arg("0-0")
            .arg("COUNT")
            .arg(RECLAIM_BATCH)
            .arg("JUSTID")
            .query_async(&mut conn)
            .await?;
        let entry_ids: Vec<String> = match reply.get(1) {
            Some(value) => redis::from_redis_value(value)?,
            None => Vec::new(),
        };

        let mut reclaimed = Vec::with_capacity(entry_ids.len());
        for entry_id in entry_ids {
            let range: StreamRangeReply = redis::cmd("XRANGE")
                .arg(&stream)
                .arg(&entry_id)
                .arg(&entry_id)
                .query_async(&mut conn)
                .await?;
            if let Some(Ok(id)) = range
                .ids
                .first()
                .and_then(|entry| entry.get::<String>("id"))
                .map(TaskId::parse)
            {
                tracing::info!(backend = "stream", task_id = %id, %entry_id, role = %role, "entry reclaimed");
                reclaimed.push(id);
            }
        }
        Ok(reclaimed)
    }
}
