//! An in-memory implementation of [`Store`].
//!
//! Provided as a correct (but not optimized) reference implementation,
//! primarily for use in tests. Fetch exclusivity is provided by the write
//! lock around the row vector; it is not designed for production use.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;

use crate::job::{CompletionId, CompletionRecord, Job, JobId, JobState, NewJob};

use super::{NewCompletion, Store, StoreError};

#[derive(Debug, Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    completions: Arc<RwLock<Vec<StoredCompletion>>>,
}

#[derive(Debug, Clone)]
struct StoredCompletion {
    record: CompletionRecord,
    consumed_on: Option<DateTime<Utc>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn has_outstanding_singleton(jobs: &[Job], queue: &str, key: &str) -> bool {
        jobs.iter().any(|job| {
            job.queue == queue
                && matches!(job.state, JobState::Created | JobState::Active)
                && job.singleton_key.as_deref() == Some(key)
        })
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert(&self, job: NewJob) -> Result<Option<JobId>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if let Some(key) = job.singleton_key.as_deref() {
            if Self::has_outstanding_singleton(&jobs, &job.queue, key) {
                return Ok(None);
            }
        }
        let id = JobId::new();
        jobs.push(job.into_job(id, Utc::now()));
        Ok(Some(id))
    }

    async fn fetch(
        &self,
        queue: &str,
        batch: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let mut eligible = jobs
            .iter_mut()
            .filter(|job| {
                job.queue == queue && job.state == JobState::Created && job.start_after <= now
            })
            .collect::<Vec<_>>();
        eligible.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_on.cmp(&b.created_on))
        });
        Ok(eligible
            .into_iter()
            .take(batch)
            .map(|job| {
                job.state = JobState::Active;
                job.started_on = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn mark_completed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter_mut()
            .filter(|job| ids.contains(&job.id) && job.state == JobState::Active)
            .map(|job| {
                job.state = JobState::Completed;
                job.output = Some(output.clone());
                job.completed_on = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn mark_failed(
        &self,
        ids: &[JobId],
        output: &Value,
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                ids.contains(&job.id)
                    && matches!(job.state, JobState::Active | JobState::Created)
            })
            .map(|job| {
                job.state = JobState::Failed;
                job.output = Some(output.clone());
                job.completed_on = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn mark_cancelled(
        &self,
        ids: &[JobId],
        now: DateTime<Utc>,
    ) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                ids.contains(&job.id)
                    && matches!(job.state, JobState::Active | JobState::Created)
            })
            .map(|job| {
                job.state = JobState::Cancelled;
                job.completed_on = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn expire(&self, output: &Value, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        Ok(jobs
            .iter_mut()
            .filter(|job| {
                job.state == JobState::Active
                    && job
                        .started_on
                        .map(|started_on| started_on + job.expire_in < now)
                        .unwrap_or(false)
            })
            .map(|job| {
                job.state = JobState::Expired;
                job.output = Some(output.clone());
                job.completed_on = Some(now);
                job.clone()
            })
            .collect())
    }

    async fn find_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let jobs = self.jobs.read().map_err(|_| StoreError::BadState)?;
        Ok(jobs.iter().find(|job| job.id == id).cloned())
    }

    async fn push_completion(
        &self,
        completion: NewCompletion,
    ) -> Result<CompletionId, StoreError> {
        let mut completions = self.completions.write().map_err(|_| StoreError::BadState)?;
        let id = CompletionId::new();
        completions.push(StoredCompletion {
            record: CompletionRecord {
                id,
                job_id: completion.job_id,
                queue: completion.queue,
                state: completion.state,
                request: completion.request,
                response: completion.response,
                completed_on: completion.completed_on,
            },
            consumed_on: None,
        });
        Ok(id)
    }

    async fn next_completion(
        &self,
        queue: &str,
    ) -> Result<Option<CompletionRecord>, StoreError> {
        let completions = self.completions.read().map_err(|_| StoreError::BadState)?;
        Ok(completions
            .iter()
            .filter(|stored| stored.record.queue == queue && stored.consumed_on.is_none())
            .min_by_key(|stored| stored.record.completed_on)
            .map(|stored| stored.record.clone()))
    }

    async fn consume_completion(&self, id: CompletionId) -> Result<bool, StoreError> {
        let mut completions = self.completions.write().map_err(|_| StoreError::BadState)?;
        match completions
            .iter_mut()
            .find(|stored| stored.record.id == id && stored.consumed_on.is_none())
        {
            Some(stored) => {
                stored.consumed_on = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn prune_completions(
        &self,
        retention: TimeDelta,
        now: DateTime<Utc>,
    ) -> Result<u64, StoreError> {
        let mut completions = self.completions.write().map_err(|_| StoreError::BadState)?;
        let cutoff = now - retention;
        let before = completions.len();
        completions.retain(|stored| {
            stored.consumed_on.is_none() || stored.record.completed_on >= cutoff
        });
        Ok((before - completions.len()) as u64)
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use crate::job::JobOptions;

    use super::*;

    fn new_job(queue: &str) -> NewJob {
        JobOptions::default().into_new_job(queue.to_owned(), json!({"n": 1}))
    }

    #[tokio::test]
    async fn fetch_returns_empty_when_store_empty() {
        let store = InMemoryStore::new();
        let jobs = store.fetch("q", 1, Utc::now()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn fetch_leases_created_jobs_exclusively() {
        let store = InMemoryStore::new();
        store.insert(new_job("q")).await.unwrap();

        let first = store.fetch("q", 1, Utc::now()).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].state, JobState::Active);
        assert!(first[0].started_on.is_some());

        let second = store.fetch("q", 1, Utc::now()).await.unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn fetch_respects_priority_then_age() {
        let store = InMemoryStore::new();
        let low = store.insert(new_job("q")).await.unwrap().unwrap();
        let high = store
            .insert(
                JobOptions::default()
                    .with_priority(5)
                    .into_new_job("q".to_owned(), Value::Null),
            )
            .await
            .unwrap()
            .unwrap();

        let jobs = store.fetch("q", 2, Utc::now()).await.unwrap();
        assert_eq!(jobs[0].id, high);
        assert_eq!(jobs[1].id, low);
    }

    #[tokio::test]
    async fn fetch_skips_jobs_scheduled_in_the_future() {
        let store = InMemoryStore::new();
        store
            .insert(
                JobOptions::default()
                    .start_in(TimeDelta::hours(1))
                    .into_new_job("q".to_owned(), Value::Null),
            )
            .await
            .unwrap();

        let jobs = store.fetch("q", 1, Utc::now()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn fetch_does_not_cross_queues() {
        let store = InMemoryStore::new();
        store.insert(new_job("other")).await.unwrap();

        let jobs = store.fetch("q", 1, Utc::now()).await.unwrap();
        assert!(jobs.is_empty());
    }

    #[tokio::test]
    async fn concurrent_fetches_partition_the_backlog() {
        let store = InMemoryStore::new();
        for _ in 0..10 {
            store.insert(new_job("q")).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.fetch("q", 5, Utc::now()).await.unwrap()
            }));
        }

        let mut seen = Vec::new();
        for handle in handles {
            for job in handle.await.unwrap() {
                assert!(!seen.contains(&job.id), "job leased twice");
                seen.push(job.id);
            }
        }
        assert_eq!(seen.len(), 10);
    }

    #[tokio::test]
    async fn singleton_key_limits_outstanding_jobs() {
        let store = InMemoryStore::new();
        let options =
            |key: &str| JobOptions::default().with_singleton_key(key);

        let first = store
            .insert(options("host-1").into_new_job("q".to_owned(), Value::Null))
            .await
            .unwrap();
        assert!(first.is_some());

        let duplicate = store
            .insert(options("host-1").into_new_job("q".to_owned(), Value::Null))
            .await
            .unwrap();
        assert!(duplicate.is_none());

        let other_key = store
            .insert(options("host-2").into_new_job("q".to_owned(), Value::Null))
            .await
            .unwrap();
        assert!(other_key.is_some());

        // A terminal job releases the key.
        store
            .mark_failed(&[first.unwrap()], &json!({}), Utc::now())
            .await
            .unwrap();
        let replacement = store
            .insert(options("host-1").into_new_job("q".to_owned(), Value::Null))
            .await
            .unwrap();
        assert!(replacement.is_some());
    }

    #[tokio::test]
    async fn mark_completed_only_touches_active_jobs() {
        let store = InMemoryStore::new();
        let id = store.insert(new_job("q")).await.unwrap().unwrap();

        // Still created: skipped.
        let done = store
            .mark_completed(&[id], &json!({"ok": true}), Utc::now())
            .await
            .unwrap();
        assert!(done.is_empty());

        store.fetch("q", 1, Utc::now()).await.unwrap();
        let done = store
            .mark_completed(&[id], &json!({"ok": true}), Utc::now())
            .await
            .unwrap();
        assert_eq!(done.len(), 1);
        assert_eq!(done[0].state, JobState::Completed);
        assert_eq!(done[0].output, Some(json!({"ok": true})));
        assert!(done[0].completed_on.is_some());

        // Applying twice has the effect of once.
        let again = store
            .mark_completed(&[id], &json!({"ok": false}), Utc::now())
            .await
            .unwrap();
        assert!(again.is_empty());
        let job = store.find_job(id).await.unwrap().unwrap();
        assert_eq!(job.output, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn mark_failed_accepts_created_and_active_jobs() {
        let store = InMemoryStore::new();
        let never_leased = store.insert(new_job("q")).await.unwrap().unwrap();
        let leased = store.insert(new_job("q")).await.unwrap().unwrap();
        store.fetch("q", 2, Utc::now()).await.unwrap();

        // Re-create a never-leased job alongside.
        let fresh = store.insert(new_job("q")).await.unwrap().unwrap();

        let failed = store
            .mark_failed(
                &[never_leased, leased, fresh],
                &json!({"message": "boom"}),
                Utc::now(),
            )
            .await
            .unwrap();
        assert_eq!(failed.len(), 3);
        for job in failed {
            assert_eq!(job.state, JobState::Failed);
            assert_eq!(job.output.unwrap()["message"], "boom");
        }
    }

    #[tokio::test]
    async fn expire_sweeps_overdue_active_jobs() {
        let store = InMemoryStore::new();
        let overdue = store
            .insert(
                JobOptions::default()
                    .with_expire_in(TimeDelta::seconds(1))
                    .into_new_job("q".to_owned(), Value::Null),
            )
            .await
            .unwrap()
            .unwrap();
        let fresh = store.insert(new_job("q")).await.unwrap().unwrap();
        store.fetch("q", 2, Utc::now()).await.unwrap();

        let output = json!({"message": "expired", "kind": "timeout"});
        let expired = store
            .expire(&output, Utc::now() + TimeDelta::seconds(2))
            .await
            .unwrap();

        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, overdue);
        assert_eq!(expired[0].state, JobState::Expired);
        assert_eq!(
            store.find_job(fresh).await.unwrap().unwrap().state,
            JobState::Active
        );
    }

    #[tokio::test]
    async fn completion_archive_is_consumed_at_least_once() {
        let store = InMemoryStore::new();
        let completion = NewCompletion {
            job_id: JobId::new(),
            queue: "q".to_owned(),
            state: JobState::Failed,
            request: json!({"n": 1}),
            response: json!({"message": "boom"}),
            completed_on: Utc::now(),
        };
        let id = store.push_completion(completion).await.unwrap();

        let record = store.next_completion("q").await.unwrap().unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.state, JobState::Failed);

        // Not consumed until marked; redelivery is possible.
        assert!(store.next_completion("q").await.unwrap().is_some());

        assert!(store.consume_completion(id).await.unwrap());
        assert!(store.next_completion("q").await.unwrap().is_none());
        assert!(!store.consume_completion(id).await.unwrap());
    }

    #[tokio::test]
    async fn next_completion_returns_oldest_first() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        for (n, offset) in [(2, 20), (1, 10), (3, 30)] {
            store
                .push_completion(NewCompletion {
                    job_id: JobId::new(),
                    queue: "q".to_owned(),
                    state: JobState::Completed,
                    request: json!({"n": n}),
                    response: json!({}),
                    completed_on: now + TimeDelta::seconds(offset),
                })
                .await
                .unwrap();
        }

        let record = store.next_completion("q").await.unwrap().unwrap();
        assert_eq!(record.request["n"], 1);
    }

    #[tokio::test]
    async fn prune_removes_only_old_consumed_records() {
        let store = InMemoryStore::new();
        let id = store
            .push_completion(NewCompletion {
                job_id: JobId::new(),
                queue: "q".to_owned(),
                state: JobState::Completed,
                request: Value::Null,
                response: json!({}),
                completed_on: Utc::now(),
            })
            .await
            .unwrap();
        store
            .push_completion(NewCompletion {
                job_id: JobId::new(),
                queue: "q".to_owned(),
                state: JobState::Completed,
                request: Value::Null,
                response: json!({}),
                completed_on: Utc::now(),
            })
            .await
            .unwrap();
        store.consume_completion(id).await.unwrap();

        // Unconsumed records are never pruned.
        let pruned = store
            .prune_completions(TimeDelta::zero(), Utc::now() + TimeDelta::days(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        assert!(store.next_completion("q").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn prune_retention_is_keyed_on_record_age() {
        let store = InMemoryStore::new();
        let now = Utc::now();
        let old = store
            .push_completion(NewCompletion {
                job_id: JobId::new(),
                queue: "q".to_owned(),
                state: JobState::Completed,
                request: Value::Null,
                response: json!({}),
                completed_on: now - TimeDelta::days(30),
            })
            .await
            .unwrap();
        let recent = store
            .push_completion(NewCompletion {
                job_id: JobId::new(),
                queue: "q".to_owned(),
                state: JobState::Completed,
                request: Value::Null,
                response: json!({}),
                completed_on: now,
            })
            .await
            .unwrap();
        store.consume_completion(old).await.unwrap();
        store.consume_completion(recent).await.unwrap();

        // Only the record older than the retention window goes, even though
        // both were consumed just now.
        let pruned = store
            .prune_completions(TimeDelta::days(7), now)
            .await
            .unwrap();
        assert_eq!(pruned, 1);
        let pruned = store
            .prune_completions(TimeDelta::zero(), now + TimeDelta::seconds(1))
            .await
            .unwrap();
        assert_eq!(pruned, 1);
    }

    #[tokio::test]
    async fn badstate_errors_when_lock_poisoned() {
        let store = InMemoryStore::new();
        tokio::task::spawn({
            let store = store.clone();
            async move {
                let _guard = store.jobs.write();
                panic!()
            }
        })
        .await
        .unwrap_err();

        assert_matches!(
            store.insert(new_job("q")).await,
            Err(StoreError::BadState)
        );
        assert_matches!(store.fetch("q", 1, Utc::now()).await, Err(StoreError::BadState));
    }
}
