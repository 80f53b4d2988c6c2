//! The job data model: ids, lifecycle states, and the rows the store owns.

use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub mod options;

pub use options::JobOptions;

/// Globally unique identifier of a job, assigned at creation and immutable.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct JobId(Uuid);

impl JobId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

/// Identifier of an archived completion record.
#[derive(Debug, Eq, PartialEq, Hash, Clone, Copy, Serialize, Deserialize)]
pub struct CompletionId(Uuid);

impl CompletionId {
    pub(crate) fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl From<Uuid> for CompletionId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<CompletionId> for Uuid {
    fn from(value: CompletionId) -> Self {
        value.0
    }
}

impl Display for CompletionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "CompletionId({})", self.0)
    }
}

/// The lifecycle state of a job. Exactly one holds at any time.
///
/// Transitions run only along `Created → Active → {Completed, Failed,
/// Expired}`, plus `Created → Failed` for jobs failed before being leased and
/// `Created | Active → Cancelled`. A failed job with retry budget left is
/// respawned as a *new* row in `Created`; the old row is kept as history.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl JobState {
    /// Whether no further transitions can occur from this state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Failed | Self::Expired | Self::Cancelled
        )
    }
}

impl Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Expired => "expired",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{val}")
    }
}

/// A job row as held by the store.
///
/// `output` is set exactly once, at the transition into a terminal state, and
/// `completed_on` is set if and only if the state is terminal.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub queue: String,
    pub state: JobState,
    pub data: Value,
    pub output: Option<Value>,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub retry_delay: TimeDelta,
    pub retry_backoff: bool,
    pub expire_in: TimeDelta,
    pub singleton_key: Option<String>,
    pub priority: i16,
    pub on_complete: bool,
    pub created_on: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl Job {
    /// Builds the replacement row inserted when this job is retried.
    ///
    /// The retry is a new `Created` row with an incremented attempt count;
    /// this row stays behind as failure history.
    pub(crate) fn respawn(&self, start_after: DateTime<Utc>) -> NewJob {
        NewJob {
            queue: self.queue.clone(),
            data: self.data.clone(),
            retry_count: self.retry_count + 1,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            expire_in: self.expire_in,
            singleton_key: self.singleton_key.clone(),
            priority: self.priority,
            on_complete: self.on_complete,
            start_after,
        }
    }
}

/// An insertable job, before the store has assigned it an id and a row.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub data: Value,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub retry_delay: TimeDelta,
    pub retry_backoff: bool,
    pub expire_in: TimeDelta,
    pub singleton_key: Option<String>,
    pub priority: i16,
    pub on_complete: bool,
    pub start_after: DateTime<Utc>,
}

impl NewJob {
    /// Materializes the row the store will own.
    pub fn into_job(self, id: JobId, now: DateTime<Utc>) -> Job {
        Job {
            id,
            queue: self.queue,
            state: JobState::Created,
            data: self.data,
            output: None,
            retry_count: self.retry_count,
            retry_limit: self.retry_limit,
            retry_delay: self.retry_delay,
            retry_backoff: self.retry_backoff,
            expire_in: self.expire_in,
            singleton_key: self.singleton_key,
            priority: self.priority,
            on_complete: self.on_complete,
            created_on: now,
            start_after: self.start_after,
            started_on: None,
            completed_on: None,
        }
    }
}

/// Archived snapshot of a job that reached a terminal state with
/// `on_complete` requested.
///
/// Read-only once created; consumed at least once by subscribers, never
/// mutated.
#[derive(Debug, Clone)]
pub struct CompletionRecord {
    pub id: CompletionId,
    pub job_id: JobId,
    pub queue: String,
    pub state: JobState,
    /// The original producer-supplied payload.
    pub request: Value,
    /// The stored output: the result on success, the normalized failure
    /// record otherwise.
    pub response: Value,
    pub completed_on: DateTime<Utc>,
}

/// One or many job ids, accepted by the terminal-transition operations.
#[derive(Debug, Clone)]
pub struct JobIds(pub(crate) Vec<JobId>);

impl JobIds {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_slice(&self) -> &[JobId] {
        &self.0
    }
}

impl From<JobId> for JobIds {
    fn from(value: JobId) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<JobId>> for JobIds {
    fn from(value: Vec<JobId>) -> Self {
        Self(value)
    }
}

impl From<&[JobId]> for JobIds {
    fn from(value: &[JobId]) -> Self {
        Self(value.to_vec())
    }
}

impl<const N: usize> From<[JobId; N]> for JobIds {
    fn from(value: [JobId; N]) -> Self {
        Self(value.to_vec())
    }
}

impl FromIterator<JobId> for JobIds {
    fn from_iter<T: IntoIterator<Item = JobId>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobState::Created.is_terminal());
        assert!(!JobState::Active.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
        assert!(JobState::Expired.is_terminal());
        assert!(JobState::Cancelled.is_terminal());
    }

    #[test]
    fn state_names_round_trip() {
        let state: JobState = serde_json::from_str("\"failed\"").unwrap();
        assert_eq!(state, JobState::Failed);
        assert_eq!(serde_json::to_string(&JobState::Active).unwrap(), "\"active\"");
    }

    #[test]
    fn respawn_increments_attempt_and_keeps_payload() {
        let now = Utc::now();
        let job = JobOptions::default()
            .with_retry_limit(3)
            .with_singleton_key("only-one")
            .into_new_job("emails".to_owned(), serde_json::json!({"to": "me"}))
            .into_job(JobId::new(), now);

        let respawned = job.respawn(now + TimeDelta::seconds(30));

        assert_eq!(respawned.retry_count, 1);
        assert_eq!(respawned.retry_limit, 3);
        assert_eq!(respawned.queue, "emails");
        assert_eq!(respawned.data, job.data);
        assert_eq!(respawned.singleton_key.as_deref(), Some("only-one"));
        assert_eq!(respawned.start_after, now + TimeDelta::seconds(30));
    }

    #[test]
    fn job_ids_from_single_and_many() {
        let id = JobId::new();
        let ids: JobIds = id.into();
        assert_eq!(ids.as_slice(), &[id]);

        let many: JobIds = vec![JobId::new(), JobId::new()].into();
        assert_eq!(many.as_slice().len(), 2);
        assert!(!many.is_empty());
    }
}
