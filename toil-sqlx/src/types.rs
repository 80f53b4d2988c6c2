use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[sqlx(type_name = "toil_job_state", rename_all = "lowercase")]
pub(crate) enum JobState {
    Created,
    Active,
    Completed,
    Failed,
    Expired,
    Cancelled,
}

impl From<JobState> for toil::JobState {
    fn from(value: JobState) -> Self {
        match value {
            JobState::Created => Self::Created,
            JobState::Active => Self::Active,
            JobState::Completed => Self::Completed,
            JobState::Failed => Self::Failed,
            JobState::Expired => Self::Expired,
            JobState::Cancelled => Self::Cancelled,
        }
    }
}

impl From<toil::JobState> for JobState {
    fn from(value: toil::JobState) -> Self {
        match value {
            toil::JobState::Created => Self::Created,
            toil::JobState::Active => Self::Active,
            toil::JobState::Completed => Self::Completed,
            toil::JobState::Failed => Self::Failed,
            toil::JobState::Expired => Self::Expired,
            toil::JobState::Cancelled => Self::Cancelled,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct JobRow {
    pub id: Uuid,
    pub queue: String,
    pub state: JobState,
    pub data: serde_json::Value,
    pub output: Option<serde_json::Value>,
    pub retry_count: i32,
    pub retry_limit: i32,
    pub retry_delay_seconds: i64,
    pub retry_backoff: bool,
    pub expire_in_seconds: i64,
    pub singleton_key: Option<String>,
    pub priority: i16,
    pub on_complete: bool,
    pub created_on: DateTime<Utc>,
    pub start_after: DateTime<Utc>,
    pub started_on: Option<DateTime<Utc>>,
    pub completed_on: Option<DateTime<Utc>>,
}

impl From<JobRow> for toil::Job {
    fn from(value: JobRow) -> Self {
        Self {
            id: value.id.into(),
            queue: value.queue,
            state: value.state.into(),
            data: value.data,
            output: value.output,
            retry_count: value.retry_count,
            retry_limit: value.retry_limit,
            retry_delay: TimeDelta::seconds(value.retry_delay_seconds),
            retry_backoff: value.retry_backoff,
            expire_in: TimeDelta::seconds(value.expire_in_seconds),
            singleton_key: value.singleton_key,
            priority: value.priority,
            on_complete: value.on_complete,
            created_on: value.created_on,
            start_after: value.start_after,
            started_on: value.started_on,
            completed_on: value.completed_on,
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct CompletionRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub queue: String,
    pub state: JobState,
    pub request: serde_json::Value,
    pub response: serde_json::Value,
    pub completed_on: DateTime<Utc>,
}

impl From<CompletionRow> for toil::CompletionRecord {
    fn from(value: CompletionRow) -> Self {
        Self {
            id: value.id.into(),
            job_id: value.job_id.into(),
            queue: value.queue,
            state: value.state.into(),
            request: value.request,
            response: value.response,
            completed_on: value.completed_on,
        }
    }
}
