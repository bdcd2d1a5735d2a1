//! The durable delayed-job table driving the round lifecycle.
//!
//! Job ids are deterministic (`{auction}-round-{i}`,
//! `{auction}-round-{i}-end`) and inserted with `ON CONFLICT DO NOTHING`,
//! so re-enqueueing deduplicates. Claiming takes a transaction-scoped
//! advisory lock, which lets any number of workers on any number of
//! servers drain the table without double-running a job; failed jobs back
//! off exponentially and are retried until they succeed.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use payloads::AuctionId;

use super::StoreError;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, derive_more::Display, sqlx::Type,
)]
#[sqlx(type_name = "job_kind", rename_all = "snake_case")]
pub enum JobKind {
    StartRound,
    EndRound,
}

#[derive(Debug, Clone, FromRow)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub auction_id: AuctionId,
    pub round_num: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub run_at: Timestamp,
    pub failure_count: i64,
    #[sqlx(try_from = "payloads::OptionalTimestamp")]
    pub last_failed_at: Option<Timestamp>,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

pub fn start_round_job_id(auction_id: &AuctionId) -> String {
    format!("{auction_id}-round-0")
}

pub fn end_round_job_id(auction_id: &AuctionId, round_num: i64) -> String {
    format!("{auction_id}-round-{round_num}-end")
}

pub async fn enqueue_tx(
    id: &str,
    kind: JobKind,
    auction_id: &AuctionId,
    round_num: i64,
    run_at: Timestamp,
    now: Timestamp,
    tx: &mut Transaction<'_, Postgres>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO jobs (
            id, kind, auction_id, round_num, run_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (id) DO NOTHING",
    )
    .bind(id)
    .bind(kind)
    .bind(auction_id)
    .bind(round_num)
    .bind(run_at.to_sqlx())
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn enqueue(
    pool: &PgPool,
    id: &str,
    kind: JobKind,
    auction_id: &AuctionId,
    round_num: i64,
    run_at: Timestamp,
    now: Timestamp,
) -> Result<(), StoreError> {
    let mut tx = pool.begin().await?;
    enqueue_tx(id, kind, auction_id, round_num, run_at, now, &mut tx).await?;
    tx.commit().await?;
    Ok(())
}

/// A claimed due job together with the coordination transaction holding
/// its advisory lock. The lock is released when the transaction commits
/// (or is dropped), after the worker finished or recorded a failure.
pub struct ClaimedJob {
    pub job: Job,
    pub coordination_tx: Transaction<'static, Postgres>,
}

/// Lock and return the next due job, using advisory locks so concurrent
/// workers and concurrent server instances skip jobs already being
/// processed. Failed jobs become due again after an exponential backoff
/// (5s * 2^failures, capped).
pub async fn claim_next_due(
    pool: &PgPool,
    now: Timestamp,
) -> Result<Option<ClaimedJob>, StoreError> {
    // This transaction is ONLY used to hold the advisory lock for
    // coordination. No other database operations should be attached to it.
    let mut coordination_tx = pool.begin().await?;

    let job = sqlx::query_as::<_, Job>(
        "SELECT * FROM jobs
        WHERE run_at <= $1
            AND (
                failure_count = 0
                OR last_failed_at IS NULL
                OR $1 > last_failed_at +
                    INTERVAL '5 seconds' * POW(2, LEAST(failure_count, 6))
            )
            AND pg_try_advisory_xact_lock(
                hashtextextended('job:' || id, 0)
            )
        ORDER BY run_at
        LIMIT 1",
    )
    .bind(now.to_sqlx())
    .fetch_optional(&mut *coordination_tx)
    .await?;

    Ok(job.map(|job| ClaimedJob {
        job,
        coordination_tx,
    }))
}

/// Remove a completed job.
pub async fn complete(pool: &PgPool, id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM jobs WHERE id = $1")
        .bind(id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record a failure so the claim query backs the job off.
pub async fn record_failure(
    pool: &PgPool,
    id: &str,
    now: Timestamp,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE jobs
        SET failure_count = failure_count + 1, last_failed_at = $2
        WHERE id = $1",
    )
    .bind(id)
    .bind(now.to_sqlx())
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get(pool: &PgPool, id: &str) -> Result<Job, StoreError> {
    sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => StoreError::JobNotFound,
            e => StoreError::Database(e),
        })
}

/// Move a pending job's fire time; the anti-snipe extension. Clearing the
/// failure bookkeeping makes the rescheduled job due exactly at `run_at`.
pub async fn reschedule(
    pool: &PgPool,
    id: &str,
    run_at: Timestamp,
) -> Result<bool, StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE jobs
        SET run_at = $2, failure_count = 0, last_failed_at = NULL
        WHERE id = $1",
    )
    .bind(id)
    .bind(run_at.to_sqlx())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn job_ids_are_deterministic() {
        let auction_id = AuctionId(Uuid::nil());
        assert_eq!(
            start_round_job_id(&auction_id),
            format!("{}-round-0", Uuid::nil())
        );
        assert_eq!(
            end_round_job_id(&auction_id, 3),
            format!("{}-round-3-end", Uuid::nil())
        );
        // start and end ids never collide
        assert_ne!(
            start_round_job_id(&auction_id),
            end_round_job_id(&auction_id, 0)
        );
    }
}
