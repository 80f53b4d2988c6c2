//! Postgres store for the `toil` job queue.
//!
//! Jobs live in `toil_jobs` and completion records in `toil_completions`;
//! leasing uses `FOR UPDATE SKIP LOCKED` so concurrent fetchers partition the
//! backlog without blocking each other. Singleton enforcement hashes
//! `(queue, singleton_key)` into a `BIGINT` covered by a partial unique
//! index over outstanding rows.
//!
//! # Example
//!
//! ```no_run
//! use toil::Toil;
//! use toil_sqlx::PgStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = PgStore::connect("postgres://localhost/jobs").await?;
//! store.migrate().await?;
//! let toil = Toil::new(store);
//! # Ok(())
//! # }
//! ```

use std::hash::{Hash, Hasher};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgConnection, PgExecutor, PgPool};
use tokio::sync::Mutex;
use toil::{
    job::NewJob,
    store::{NewCompletion, Store, StoreError},
    CompletionId, CompletionRecord, Job, JobId,
};
use tracing::instrument;
use uuid::Uuid;

mod sql;
mod types;

use types::{CompletionRow, JobRow};

/// Pool-backed [`Store`] implementation.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(url: &str) -> Result<Self, sqlx::Error> {
        let pool = PgPoolOptions::new().connect(url).await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations.
    pub async fn migrate(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl From<PgPool> for PgStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for PgStore {
    fn from(pool: &PgPool) -> Self {
        Self {
            pool: pool.to_owned(),
        }
    }
}

/// A [`Store`] bound to a single connection, typically one holding an open
/// transaction, so lifecycle transitions can commit or roll back atomically
/// with the caller's own statements.
#[derive(Clone, Debug)]
pub struct PgSession {
    connection: Arc<Mutex<PgConnection>>,
}

impl PgSession {
    pub fn new(connection: PgConnection) -> Self {
        Self {
            connection: Arc::new(Mutex::new(connection)),
        }
    }
}

fn unavailable(error: sqlx::Error) -> StoreError {
    StoreError::Unavailable(Box::new(error))
}

/// Hashes a `(queue, singleton_key)` pair into the indexed column.
fn singleton_hash(queue: &str, key: &str) -> i64 {
    let mut state = fxhash::FxHasher64::default();
    queue.hash(&mut state);
    key.hash(&mut state);
    state.finish() as i64
}

async fn insert_job<'a, E>(executor: E, job: NewJob) -> sqlx::Result<Option<Uuid>>
where
    E: PgExecutor<'a>,
{
    let hash = job
        .singleton_key
        .as_deref()
        .map(|key| singleton_hash(&job.queue, key));
    sqlx::query_scalar::<_, Uuid>(sql::INSERT_JOB)
        .bind(&job.queue)
        .bind(&job.data)
        .bind(job.retry_count)
        .bind(job.retry_limit)
        .bind(job.retry_delay.num_seconds())
        .bind(job.retry_backoff)
        .bind(job.expire_in.num_seconds())
        .bind(&job.singleton_key)
        .bind(hash)
        .bind(job.priority)
        .bind(job.on_complete)
        .bind(job.start_after)
        .fetch_optional(executor)
        .await
}

async fn fetch_jobs<'a, E>(
    executor: E,
    queue: &str,
    batch: usize,
    now: DateTime<Utc>,
) -> sqlx::Result<Vec<JobRow>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, JobRow>(sql::FETCH_JOBS)
        .bind(queue)
        .bind(batch as i64)
        .bind(now)
        .fetch_all(executor)
        .await
}

async fn transition<'a, E>(
    executor: E,
    statement: &'static str,
    ids: &[JobId],
    output: Option<&Value>,
    now: DateTime<Utc>,
) -> sqlx::Result<Vec<JobRow>>
where
    E: PgExecutor<'a>,
{
    let ids: Vec<Uuid> = ids.iter().copied().map(Uuid::from).collect();
    let mut query = sqlx::query_as::<_, JobRow>(statement).bind(ids);
    if let Some(output) = output {
        query = query.bind(output);
    }
    query.bind(now).fetch_all(executor).await
}

async fn expire_jobs<'a, E>(
    executor: E,
    output: &Value,
    now: DateTime<Utc>,
) -> sqlx::Result<Vec<JobRow>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, JobRow>(sql::EXPIRE_JOBS)
        .bind(output)
        .bind(now)
        .fetch_all(executor)
        .await
}

async fn find_job<'a, E>(executor: E, id: JobId) -> sqlx::Result<Option<JobRow>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, JobRow>(sql::FIND_JOB)
        .bind(Uuid::from(id))
        .fetch_optional(executor)
        .await
}

async fn push_completion<'a, E>(
    executor: E,
    completion: NewCompletion,
) -> sqlx::Result<Uuid>
where
    E: PgExecutor<'a>,
{
    sqlx::query_scalar::<_, Uuid>(sql::INSERT_COMPLETION)
        .bind(Uuid::from(completion.job_id))
        .bind(&completion.queue)
        .bind(types::JobState::from(completion.state))
        .bind(&completion.request)
        .bind(&completion.response)
        .bind(completion.completed_on)
        .fetch_one(executor)
        .await
}

async fn next_completion<'a, E>(
    executor: E,
    queue: &str,
) -> sqlx::Result<Option<CompletionRow>>
where
    E: PgExecutor<'a>,
{
    sqlx::query_as::<_, CompletionRow>(sql::NEXT_COMPLETION)
        .bind(queue)
        .fetch_optional(executor)
        .await
}

async fn consume_completion<'a, E>(executor: E, id: CompletionId) -> sqlx::Result<bool>
where
    E: PgExecutor<'a>,
{
    let result = sqlx::query(sql::CONSUME_COMPLETION)
        .bind(Uuid::from(id))
        .bind(Utc::now())
        .execute(executor)
        .await?;
    Ok(result.rows_affected() > 0)
}

async fn prune_completions<'a, E>(
    executor: E,
    retention: TimeDelta,
    now: DateTime<Utc>,
) -> sqlx::Result<u64>
where
    E: PgExecutor<'a>,
{
    let result = sqlx::query(sql::PRUNE_COMPLETIONS)
        .bind(now - retention)
        .execute(executor)
        .await?;
    Ok(result.rows_affected())
}

fn into_jobs(rows: Vec<JobRow>) -> Vec<Job> {
    rows.into_iter().map(Into::into).collect()
}

#[async_trait]
impl Store for PgStore {
    #[instrument(skip(self, job), fields(queue = %job.queue))]
    async fn insert(&self, job: NewJob) -> Result<Option<JobId>, StoreError> {
        Ok(insert_job(&self.pool, job)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(into_jobs(
            fetch_jobs(&self.pool, queue, batch, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_completed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(into_jobs(
            transition(&self.pool, sql::MARK_COMPLETED, ids, Some(output), now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_failed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(into_jobs(
            transition(&self.pool, sql::MARK_FAILED, ids, Some(output), now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_cancelled(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        Ok(into_jobs(
            transition(&self.pool, sql::MARK_CANCELLED, ids, None, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn expire(&self, output: &Value, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        Ok(into_jobs(
            expire_jobs(&self.pool, output, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(find_job(&self.pool, id)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    async fn push_completion(
        &self,
        completion: NewCompletion,
    ) -> Result<CompletionId, StoreError> {
        Ok(push_completion(&self.pool, completion)
            .await
            .map_err(unavailable)?
            .into())
    }

    async fn next_completion(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        Ok(next_completion(&self.pool, queue)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    async fn consume_completion(&self, id: CompletionId) -> Result<bool, StoreError> {
        consume_completion(&self.pool, id).await.map_err(unavailable)
    }

    async fn prune_completions(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        prune_completions(&self.pool, retention, now)
            .await
            .map_err(unavailable)
    }
}

#[async_trait]
impl Store for PgSession {
    async fn insert(&self, job: NewJob) -> Result<Option<JobId>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(insert_job(&mut *connection, job)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(into_jobs(
            fetch_jobs(&mut *connection, queue, batch, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_completed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(into_jobs(
            transition(&mut *connection, sql::MARK_COMPLETED, ids, Some(output), now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_failed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(into_jobs(
            transition(&mut *connection, sql::MARK_FAILED, ids, Some(output), now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn mark_cancelled(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(into_jobs(
            transition(&mut *connection, sql::MARK_CANCELLED, ids, None, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn expire(&self, output: &Value, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(into_jobs(
            expire_jobs(&mut *connection, output, now)
                .await
                .map_err(unavailable)?,
        ))
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(find_job(&mut *connection, id)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    async fn push_completion(
        &self,
        completion: NewCompletion,
    ) -> Result<CompletionId, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(push_completion(&mut *connection, completion)
            .await
            .map_err(unavailable)?
            .into())
    }

    async fn next_completion(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let mut connection = self.connection.lock().await;
        Ok(next_completion(&mut *connection, queue)
            .await
            .map_err(unavailable)?
            .map(Into::into))
    }

    async fn consume_completion(&self, id: CompletionId) -> Result<bool, StoreError> {
        let mut connection = self.connection.lock().await;
        consume_completion(&mut *connection, id)
            .await
            .map_err(unavailable)
    }

    async fn prune_completions(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut connection = self.connection.lock().await;
        prune_completions(&mut *connection, retention, now)
            .await
            .map_err(unavailable)
    }
}
