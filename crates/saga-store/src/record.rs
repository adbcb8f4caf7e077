use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use common::{EventType, SagaId};
use serde::{Deserialize, Serialize};

/// The lifecycle status of a saga.
///
/// State transitions:
/// ```text
/// IN_PROGRESS ──┬──► COMPLETED
///               └──► FAILED   (administrative action only)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SagaStatus {
    /// Steps are still being executed.
    #[default]
    InProgress,

    /// A terminal transition was reached (terminal state).
    Completed,

    /// Marked failed by an operator (terminal state).
    Failed,
}

impl SagaStatus {
    /// Returns true if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SagaStatus::Completed | SagaStatus::Failed)
    }

    /// Returns true if a saga in this status may move to `next`.
    ///
    /// Staying `IN_PROGRESS` is allowed so that each step can re-assert it.
    pub fn can_transition_to(&self, next: SagaStatus) -> bool {
        matches!(
            (self, next),
            (SagaStatus::InProgress, SagaStatus::InProgress)
                | (SagaStatus::InProgress, SagaStatus::Completed)
                | (SagaStatus::InProgress, SagaStatus::Failed)
        )
    }

    /// Returns the status as it is stored and sent over the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            SagaStatus::InProgress => "IN_PROGRESS",
            SagaStatus::Completed => "COMPLETED",
            SagaStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for SagaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for SagaStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IN_PROGRESS" => Ok(SagaStatus::InProgress),
            "COMPLETED" => Ok(SagaStatus::Completed),
            "FAILED" => Ok(SagaStatus::Failed),
            other => Err(format!("unknown saga status '{other}'")),
        }
    }
}

/// Business correlation keys attached to a saga at creation,
/// e.g. `session_id -> "2024-06"`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationIds(BTreeMap<String, String>);

impl CorrelationIds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a key, replacing any previous value.
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    /// Returns true if `key` is present with exactly `value`.
    pub fn matches(&self, key: &str, value: &str) -> bool {
        self.get(key) == Some(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// A persisted saga instance: one row per running workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaRecord {
    /// Unique id of this saga instance.
    pub saga_id: SagaId,

    /// Workflow name, one per orchestrator.
    pub saga_name: String,

    /// The step most recently executed; `None` until the first step runs.
    pub saga_state: Option<EventType>,

    pub status: SagaStatus,

    /// The original payload the saga was started with (JSON).
    pub payload: String,

    /// Number of times the saga has been replayed after stalling.
    pub retry_count: i32,

    /// Immutable business correlation keys.
    pub correlation_ids: CorrelationIds,

    pub create_user: String,
    pub create_date: DateTime<Utc>,
    pub update_user: String,
    pub update_date: DateTime<Utc>,
}

/// Input for creating a new saga row.
#[derive(Debug, Clone)]
pub struct NewSaga {
    pub saga_id: SagaId,
    pub saga_name: String,
    pub payload: String,
    pub correlation_ids: CorrelationIds,
    pub create_user: String,
}

impl NewSaga {
    /// Creates a new saga description with a fresh id.
    pub fn new(
        saga_name: impl Into<String>,
        payload: impl Into<String>,
        create_user: impl Into<String>,
    ) -> Self {
        Self {
            saga_id: SagaId::new(),
            saga_name: saga_name.into(),
            payload: payload.into(),
            correlation_ids: CorrelationIds::new(),
            create_user: create_user.into(),
        }
    }

    /// Sets the correlation keys.
    pub fn correlation_ids(mut self, correlation_ids: CorrelationIds) -> Self {
        self.correlation_ids = correlation_ids;
        self
    }

    /// Materializes the row as it looks right after insertion.
    pub fn into_record(self, now: DateTime<Utc>) -> SagaRecord {
        SagaRecord {
            saga_id: self.saga_id,
            saga_name: self.saga_name,
            saga_state: None,
            status: SagaStatus::InProgress,
            payload: self.payload,
            retry_count: 0,
            correlation_ids: self.correlation_ids,
            update_user: self.create_user.clone(),
            create_user: self.create_user,
            create_date: now,
            update_date: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_in_progress() {
        assert_eq!(SagaStatus::default(), SagaStatus::InProgress);
    }

    #[test]
    fn test_status_never_moves_backwards() {
        assert!(SagaStatus::InProgress.can_transition_to(SagaStatus::InProgress));
        assert!(SagaStatus::InProgress.can_transition_to(SagaStatus::Completed));
        assert!(SagaStatus::InProgress.can_transition_to(SagaStatus::Failed));

        for terminal in [SagaStatus::Completed, SagaStatus::Failed] {
            assert!(terminal.is_terminal());
            assert!(!terminal.can_transition_to(SagaStatus::InProgress));
            assert!(!terminal.can_transition_to(SagaStatus::Completed));
            assert!(!terminal.can_transition_to(SagaStatus::Failed));
        }
    }

    #[test]
    fn test_status_string_forms() {
        for status in [
            SagaStatus::InProgress,
            SagaStatus::Completed,
            SagaStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<SagaStatus>().unwrap(), status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("RUNNING".parse::<SagaStatus>().is_err());
    }

    #[test]
    fn test_correlation_ids() {
        let ids = CorrelationIds::new()
            .with("session_id", "2024-06")
            .with("assessment_code", "LTE10");

        assert!(ids.matches("session_id", "2024-06"));
        assert!(!ids.matches("session_id", "2024-01"));
        assert!(!ids.matches("student_id", "2024-06"));
        assert_eq!(ids.iter().count(), 2);

        let json = serde_json::to_value(&ids).unwrap();
        assert_eq!(json["assessment_code"], "LTE10");
    }

    #[test]
    fn test_new_saga_record_starts_in_progress_without_step() {
        let now = Utc::now();
        let record = NewSaga::new("RESULTS_EXPORT", "{}", "tester")
            .correlation_ids(CorrelationIds::new().with("session_id", "1"))
            .into_record(now);

        assert_eq!(record.status, SagaStatus::InProgress);
        assert!(record.saga_state.is_none());
        assert_eq!(record.retry_count, 0);
        assert_eq!(record.update_user, "tester");
        assert_eq!(record.create_date, now);
    }
}
