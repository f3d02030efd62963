//! Task record: identity, payload, lifecycle.
//!
//! State transitions:
//! - Pending -> Processing -> Completed
//! - Pending -> Processing -> Failed
//!
//! Nothing skips a state and nothing moves backwards. A redelivery (stream
//! backend) keeps the task in Processing and only bumps `attempts`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::asset::TaskResult;
use super::ids::{Role, TaskId};
use crate::error::QueueError;

/// Logical partition a task lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 4] = [
        TaskStatus::Pending,
        TaskStatus::Processing,
        TaskStatus::Completed,
        TaskStatus::Failed,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Epic description the pipeline derives generation requests from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub prompt: String,
}

impl Payload {
    pub fn new(title: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            prompt: prompt.into(),
        }
    }

    pub fn is_blank(&self) -> bool {
        self.title.trim().is_empty() && self.prompt.trim().is_empty()
    }
}

/// What a producer submits. Fields are optional so that a JSON document with
/// a missing `role` or `payload` reaches validation instead of failing to
/// deserialize.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub payload: Option<Payload>,
}

impl NewTask {
    pub fn new(role: impl Into<String>, payload: Payload) -> Self {
        Self {
            id: None,
            role: Some(role.into()),
            payload: Some(payload),
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Check required fields. Returns the validated pieces; the id stays
    /// optional because the queue assigns one when the producer did not.
    pub fn validate(self) -> Result<(Option<TaskId>, Role, Payload), QueueError> {
        let role = match self.role {
            Some(role) if !role.trim().is_empty() => Role::new(role.trim()),
            _ => return Err(QueueError::Validation("role is required".into())),
        };
        let payload = match self.payload {
            Some(payload) if !payload.is_blank() => payload,
            _ => return Err(QueueError::Validation("payload is required".into())),
        };
        let id = self.id.map(TaskId::parse).transpose()?;
        Ok((id, role, payload))
    }
}

/// Rejected lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionError {
    pub from: TaskStatus,
    pub to: TaskStatus,
}

/// Task as persisted by every backend (file body / Redis value).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    id: TaskId,
    role: Role,
    payload: Payload,
    status: TaskStatus,
    created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    processed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    failed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<TaskResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(default, skip_serializing_if = "is_zero")]
    attempts: u32,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl TaskRecord {
    pub fn new(id: TaskId, role: Role, payload: Payload, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            role,
            payload,
            status: TaskStatus::Pending,
            created_at,
            processed_at: None,
            completed_at: None,
            failed_at: None,
            result: None,
            error: None,
            attempts: 0,
        }
    }

    pub fn id(&self) -> &TaskId {
        &self.id
    }

    pub fn role(&self) -> &Role {
        &self.role
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        self.completed_at
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        self.failed_at
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Pending -> Processing.
    pub fn start_processing(&mut self, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect(TaskStatus::Pending, TaskStatus::Processing)?;
        self.status = TaskStatus::Processing;
        self.processed_at = Some(now);
        self.attempts += 1;
        Ok(())
    }

    /// Processing -> Processing on redelivery. `processedAt` keeps the first
    /// claim time.
    pub fn redeliver(&mut self) -> Result<(), TransitionError> {
        self.expect(TaskStatus::Processing, TaskStatus::Processing)?;
        self.attempts += 1;
        Ok(())
    }

    /// Processing -> Completed.
    pub fn complete(
        &mut self,
        result: TaskResult,
        now: DateTime<Utc>,
    ) -> Result<(), TransitionError> {
        self.expect(TaskStatus::Processing, TaskStatus::Completed)?;
        self.status = TaskStatus::Completed;
        self.completed_at = Some(now);
        self.result = Some(result);
        Ok(())
    }

    /// Processing -> Failed.
    pub fn fail(&mut self, error: impl Into<String>, now: DateTime<Utc>) -> Result<(), TransitionError> {
        self.expect(TaskStatus::Processing, TaskStatus::Failed)?;
        self.status = TaskStatus::Failed;
        self.failed_at = Some(now);
        self.error = Some(error.into());
        Ok(())
    }

    /// Align the embedded status with the partition a backend found the
    /// record in. Location wins over the field (see the directory backend's
    /// claim window).
    pub(crate) fn assume_partition(&mut self, partition: TaskStatus) {
        self.status = partition;
    }

    fn expect(&self, from: TaskStatus, to: TaskStatus) -> Result<(), TransitionError> {
        if self.status == from {
            Ok(())
        } else {
            Err(TransitionError {
                from: self.status,
                to,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::asset::{PipelineOutcome, TaskResult};
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn record() -> TaskRecord {
        TaskRecord::new(
            TaskId::parse("t1").unwrap(),
            Role::new("designer"),
            Payload::new("Snake Sprite", "green pixel-art snake character"),
            at(0),
        )
    }

    fn empty_result() -> TaskResult {
        TaskResult::new(Vec::new(), 12, PipelineOutcome::Placeholder)
    }

    #[test]
    fn happy_lifecycle_sets_one_timestamp_per_transition() {
        let mut task = record();
        task.start_processing(at(1)).unwrap();
        task.complete(empty_result(), at(2)).unwrap();

        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.processed_at(), Some(at(1)));
        assert_eq!(task.completed_at(), Some(at(2)));
        assert_eq!(task.failed_at(), None);
        assert!(task.result().is_some());
        assert!(task.error().is_none());
        assert_eq!(task.attempts(), 1);
    }

    #[test]
    fn cannot_skip_processing() {
        let mut task = record();
        let err = task.complete(empty_result(), at(1)).unwrap_err();
        assert_eq!(err.from, TaskStatus::Pending);
        assert_eq!(err.to, TaskStatus::Completed);
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[test]
    fn terminal_states_do_not_move() {
        let mut task = record();
        task.start_processing(at(1)).unwrap();
        task.fail("boom", at(2)).unwrap();

        assert!(task.complete(empty_result(), at(3)).is_err());
        assert!(task.fail("again", at(3)).is_err());
        assert!(task.start_processing(at(3)).is_err());
        assert_eq!(task.error(), Some("boom"));
        assert_eq!(task.failed_at(), Some(at(2)));
    }

    #[test]
    fn redelivery_keeps_first_claim_time() {
        let mut task = record();
        task.start_processing(at(1)).unwrap();
        task.redeliver().unwrap();

        assert_eq!(task.attempts(), 2);
        assert_eq!(task.processed_at(), Some(at(1)));
        assert_eq!(task.status(), TaskStatus::Processing);
    }

    #[test]
    fn serializes_with_camel_case_schema() {
        let mut task = record();
        task.start_processing(at(1)).unwrap();
        let json = serde_json::to_value(&task).unwrap();

        assert_eq!(json["id"], "t1");
        assert_eq!(json["role"], "designer");
        assert_eq!(json["payload"]["title"], "Snake Sprite");
        assert_eq!(json["status"], "processing");
        assert!(json.get("createdAt").is_some());
        assert!(json.get("processedAt").is_some());
        assert!(json.get("completedAt").is_none());
        assert!(json.get("result").is_none());
    }

    #[test]
    fn validation_rejects_missing_role_or_payload() {
        let missing_role = NewTask {
            payload: Some(Payload::new("t", "p")),
            ..NewTask::default()
        };
        assert!(matches!(
            missing_role.validate(),
            Err(QueueError::Validation(_))
        ));

        let blank_payload = NewTask::new("designer", Payload::new(" ", ""));
        assert!(matches!(
            blank_payload.validate(),
            Err(QueueError::Validation(_))
        ));

        let from_json: NewTask = serde_json::from_str(r#"{"role":"designer"}"#).unwrap();
        assert!(from_json.validate().is_err());
    }

    #[test]
    fn validation_keeps_supplied_id() {
        let (id, role, payload) = NewTask::new("designer", Payload::new("Snake", "snake"))
            .with_id("t1")
            .validate()
            .unwrap();
        assert_eq!(id.unwrap().as_str(), "t1");
        assert_eq!(role.as_str(), "designer");
        assert_eq!(payload.title, "Snake");
    }
}
