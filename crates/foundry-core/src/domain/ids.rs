//! Domain identifiers (strongly-typed IDs).
//!
//! `TaskId` doubles as a file name in the directory backend and as a Redis key
//! suffix in the stream backend, so the accepted alphabet is deliberately
//! narrow: ASCII alphanumerics plus `.`, `_` and `-`, never a leading dot.
//!
//! Generated ids are `task-<ULID>`: lexicographically sortable by creation
//! time and safe to mint on several hosts without coordination.

use std::fmt;

use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::QueueError;

const TASK_PREFIX: &str = "task-";
const MAX_ID_LEN: usize = 128;

/// Identifier of a task. Immutable once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaskId(String);

impl TaskId {
    /// Validate a producer-supplied id.
    pub fn parse(value: impl Into<String>) -> Result<Self, QueueError> {
        let value = value.into();
        if value.is_empty() || value.len() > MAX_ID_LEN {
            return Err(QueueError::Validation(format!(
                "task id must be 1..={MAX_ID_LEN} characters"
            )));
        }
        if value.starts_with('.') {
            return Err(QueueError::Validation(format!(
                "task id {value:?} must not start with '.'"
            )));
        }
        if let Some(bad) = value
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')))
        {
            return Err(QueueError::Validation(format!(
                "task id {value:?} contains unsupported character {bad:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(format!("{TASK_PREFIX}{ulid}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for TaskId {
    type Error = QueueError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<TaskId> for String {
    fn from(id: TaskId) -> Self {
        id.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Worker class permitted to claim a task (e.g. `designer`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Role(String);

impl Role {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("t1")]
    #[case("task-01HZX3K6V1T3J0Q4M8R2Y5B7CD")]
    #[case("epic_42.v2")]
    fn accepts_file_safe_ids(#[case] raw: &str) {
        assert_eq!(TaskId::parse(raw).unwrap().as_str(), raw);
    }

    #[rstest]
    #[case("")]
    #[case(".hidden")]
    #[case("../escape")]
    #[case("a/b")]
    #[case("with space")]
    fn rejects_ids_that_are_not_file_safe(#[case] raw: &str) {
        assert!(matches!(TaskId::parse(raw), Err(QueueError::Validation(_))));
    }

    #[test]
    fn generated_ids_carry_prefix_and_sort_by_time() {
        let first = TaskId::from_ulid(Ulid::from_parts(1_000, 7));
        let second = TaskId::from_ulid(Ulid::from_parts(2_000, 3));

        assert!(first.as_str().starts_with("task-"));
        assert!(first < second);
    }

    #[test]
    fn deserialization_validates() {
        let ok: TaskId = serde_json::from_str("\"t1\"").unwrap();
        assert_eq!(ok.as_str(), "t1");

        let bad = serde_json::from_str::<TaskId>("\"../t1\"");
        assert!(bad.is_err());
    }
}
