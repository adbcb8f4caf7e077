use chrono::{DateTime, Utc};

use crate::{SagaRecord, SagaStatus};

/// Builder for constructing saga queries.
///
/// Allows filtering sagas by workflow name, status, correlation key and
/// age. Results are ordered by creation date, oldest first.
#[derive(Debug, Clone, Default)]
pub struct SagaQuery {
    /// Filter by workflow name.
    pub saga_name: Option<String>,

    /// Filter by status (any of these).
    pub statuses: Option<Vec<SagaStatus>>,

    /// Filter by a correlation key/value pair.
    pub correlation: Option<(String, String)>,

    /// Filter to sagas last updated before this timestamp (exclusive).
    pub updated_before: Option<DateTime<Utc>>,

    /// Filter to sagas created before this timestamp (exclusive).
    pub created_before: Option<DateTime<Utc>>,

    /// Filter to sagas replayed fewer than this many times.
    pub retry_count_below: Option<i32>,

    /// Filter to sagas replayed at least this many times.
    pub retry_count_at_least: Option<i32>,

    /// Maximum number of sagas to return.
    pub limit: Option<usize>,
}

impl SagaQuery {
    /// Creates a new empty query.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a query for the in-progress sagas of one workflow.
    pub fn in_progress(saga_name: impl Into<String>) -> Self {
        Self::new()
            .saga_name(saga_name)
            .status(SagaStatus::InProgress)
    }

    /// Filters by workflow name.
    pub fn saga_name(mut self, saga_name: impl Into<String>) -> Self {
        self.saga_name = Some(saga_name.into());
        self
    }

    /// Filters by a single status.
    pub fn status(mut self, status: SagaStatus) -> Self {
        self.statuses = Some(vec![status]);
        self
    }

    /// Filters by any of several statuses.
    pub fn statuses(mut self, statuses: Vec<SagaStatus>) -> Self {
        self.statuses = Some(statuses);
        self
    }

    /// Filters by a correlation key/value pair.
    pub fn correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlation = Some((key.into(), value.into()));
        self
    }

    /// Filters to sagas not updated since `timestamp`.
    pub fn updated_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.updated_before = Some(timestamp);
        self
    }

    /// Filters to sagas created before `timestamp`.
    pub fn created_before(mut self, timestamp: DateTime<Utc>) -> Self {
        self.created_before = Some(timestamp);
        self
    }

    /// Filters to sagas whose `retry_count` is below `count`.
    pub fn retry_count_below(mut self, count: i32) -> Self {
        self.retry_count_below = Some(count);
        self
    }

    /// Filters to sagas whose `retry_count` is at least `count`.
    pub fn retry_count_at_least(mut self, count: i32) -> Self {
        self.retry_count_at_least = Some(count);
        self
    }

    /// Limits the number of sagas returned.
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `saga` satisfies every filter except `limit`.
    pub fn matches(&self, saga: &SagaRecord) -> bool {
        if let Some(ref name) = self.saga_name
            && &saga.saga_name != name
        {
            return false;
        }
        if let Some(ref statuses) = self.statuses
            && !statuses.contains(&saga.status)
        {
            return false;
        }
        if let Some((ref key, ref value)) = self.correlation
            && !saga.correlation_ids.matches(key, value)
        {
            return false;
        }
        if let Some(before) = self.updated_before
            && saga.update_date >= before
        {
            return false;
        }
        if let Some(before) = self.created_before
            && saga.create_date >= before
        {
            return false;
        }
        if let Some(count) = self.retry_count_below
            && saga.retry_count >= count
        {
            return false;
        }
        if let Some(count) = self.retry_count_at_least
            && saga.retry_count < count
        {
            return false;
        }
        true
    }
}
