//! The statements behind each store operation, one constant per statement.

macro_rules! job_columns {
    () => {
        "id, queue, state, data, output, retry_count, retry_limit, \
         retry_delay_seconds, retry_backoff, expire_in_seconds, singleton_key, \
         priority, on_complete, created_on, start_after, started_on, completed_on"
    };
}

macro_rules! completion_columns {
    () => {
        "id, job_id, queue, state, request, response, completed_on"
    };
}

/// The partial unique index on `singleton_hash` suppresses the insert when
/// the key already has an outstanding job.
pub(crate) const INSERT_JOB: &str = concat!(
    "INSERT INTO toil_jobs (\
        queue, data, retry_count, retry_limit, retry_delay_seconds, \
        retry_backoff, expire_in_seconds, singleton_key, singleton_hash, \
        priority, on_complete, start_after\
    ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12) \
    ON CONFLICT DO NOTHING \
    RETURNING id",
);

/// Leases a batch: due created rows in priority order, skipping rows locked
/// by a concurrent fetch.
pub(crate) const FETCH_JOBS: &str = concat!(
    "UPDATE toil_jobs \
    SET state = 'active', started_on = $3 \
    WHERE id IN (\
        SELECT id FROM toil_jobs \
        WHERE queue = $1 \
          AND state = 'created' \
          AND start_after <= $3 \
        ORDER BY priority DESC, created_on ASC \
        LIMIT $2 \
        FOR UPDATE SKIP LOCKED\
    ) \
    RETURNING ",
    job_columns!(),
);

pub(crate) const MARK_COMPLETED: &str = concat!(
    "UPDATE toil_jobs \
    SET state = 'completed', output = $2, completed_on = $3 \
    WHERE id = ANY($1) AND state = 'active' \
    RETURNING ",
    job_columns!(),
);

pub(crate) const MARK_FAILED: &str = concat!(
    "UPDATE toil_jobs \
    SET state = 'failed', output = $2, completed_on = $3 \
    WHERE id = ANY($1) AND state IN ('active', 'created') \
    RETURNING ",
    job_columns!(),
);

pub(crate) const MARK_CANCELLED: &str = concat!(
    "UPDATE toil_jobs \
    SET state = 'cancelled', completed_on = $2 \
    WHERE id = ANY($1) AND state IN ('active', 'created') \
    RETURNING ",
    job_columns!(),
);

pub(crate) const EXPIRE_JOBS: &str = concat!(
    "UPDATE toil_jobs \
    SET state = 'expired', output = $1, completed_on = $2 \
    WHERE state = 'active' \
      AND started_on + make_interval(secs => expire_in_seconds::double precision) < $2 \
    RETURNING ",
    job_columns!(),
);

pub(crate) const FIND_JOB: &str = concat!(
    "SELECT ",
    job_columns!(),
    " FROM toil_jobs WHERE id = $1",
);

pub(crate) const INSERT_COMPLETION: &str =
    "INSERT INTO toil_completions (job_id, queue, state, request, response, completed_on) \
    VALUES ($1, $2, $3, $4, $5, $6) \
    RETURNING id";

pub(crate) const NEXT_COMPLETION: &str = concat!(
    "SELECT ",
    completion_columns!(),
    " FROM toil_completions \
    WHERE queue = $1 AND consumed_on IS NULL \
    ORDER BY completed_on ASC \
    LIMIT 1",
);

pub(crate) const CONSUME_COMPLETION: &str =
    "UPDATE toil_completions SET consumed_on = $2 WHERE id = $1 AND consumed_on IS NULL";

pub(crate) const PRUNE_COMPLETIONS: &str =
    "DELETE FROM toil_completions WHERE consumed_on IS NOT NULL AND completed_on < $1";
