//! Durable store operations.
//!
//! ## Design Decisions
//!
//! ### Money lives here
//! Balances, gift holdings and the transaction ledger are authoritative in
//! Postgres. The fast store's bid structures are a cache; anything
//! recomputable (notably locked totals) is recomputed from these tables.
//!
//! ### Idempotent writes
//! Every writer that can be retried (bid ledger records, settlement
//! records, winner rows, job rows) is keyed by a deterministic id and
//! inserted with `ON CONFLICT DO NOTHING`, so replays are no-ops instead
//! of duplicates.
//!
//! ### Time source dependency
//! Functions that need the current time accept a `TimeSource` or an
//! explicit timestamp so tests can mock the clock, mirroring the rest of
//! the service.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool};

use payloads::{Gift, UserId, responses};

use crate::time::TimeSource;

pub mod auction;
pub mod jobs;
pub mod ledger;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("User not found")]
    UserNotFound,
    #[error("Auction not found")]
    AuctionNotFound,
    #[error("Auction round not found")]
    AuctionRoundNotFound,
    #[error("Auction is not accepting bids")]
    AuctionNotActive,
    #[error("Authors cannot bid in their own auctions")]
    CannotBetOwnAuction,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Insufficient gifts")]
    InsufficientGifts,
    #[error("Idempotency key already used with a different request")]
    IdempotencyConflict,
    #[error("Job not found")]
    JobNotFound,
    #[error("Unique constraint violation")]
    NotUnique(#[source] sqlx::Error),
    #[error("Database error")]
    Database(#[source] sqlx::Error),
    #[error("Unexpected error")]
    UnexpectedError(#[from] anyhow::Error),
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        match &e {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                StoreError::NotUnique(e)
            }
            _ => StoreError::Database(e),
        }
    }
}

/// A complete user row. Gift holdings live in their own table.
#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: UserId,
    pub balance: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

/// Users exist from their first reference onwards; there is no signup.
pub async fn ensure_user(
    executor: impl sqlx::PgExecutor<'_>,
    user_id: &UserId,
    now: Timestamp,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO users (id, balance, created_at, updated_at)
        VALUES ($1, 0, $2, $2)
        ON CONFLICT (id) DO NOTHING",
    )
    .bind(user_id)
    .bind(now.to_sqlx())
    .execute(executor)
    .await?;
    Ok(())
}

pub async fn read_user(
    pool: &PgPool,
    user_id: &UserId,
) -> Result<User, StoreError> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => StoreError::UserNotFound,
            e => StoreError::Database(e),
        })
}

/// Add stars to a user's balance, creating the user if needed.
pub async fn credit_stars_tx(
    user_id: &UserId,
    amount: i64,
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), StoreError> {
    ensure_user(&mut **tx, user_id, now).await?;
    sqlx::query(
        "UPDATE users SET balance = balance + $2, updated_at = $3
        WHERE id = $1",
    )
    .bind(user_id)
    .bind(amount)
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?;
    Ok(())
}

/// Remove stars from a user's balance. The `balance >= amount` predicate
/// makes an over-debit a no-op instead of a constraint violation.
pub async fn debit_stars_tx(
    user_id: &UserId,
    amount: i64,
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE users SET balance = balance - $2, updated_at = $3
        WHERE id = $1 AND balance >= $2",
    )
    .bind(user_id)
    .bind(amount)
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::InsufficientBalance);
    }
    Ok(())
}

pub async fn credit_gifts_tx(
    user_id: &UserId,
    gift_name: &str,
    count: i64,
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), StoreError> {
    ensure_user(&mut **tx, user_id, now).await?;
    sqlx::query(
        "INSERT INTO user_gifts (user_id, name, count)
        VALUES ($1, $2, $3)
        ON CONFLICT (user_id, name)
        DO UPDATE SET count = user_gifts.count + EXCLUDED.count",
    )
    .bind(user_id)
    .bind(gift_name)
    .bind(count)
    .execute(&mut **tx)
    .await?;
    Ok(())
}

pub async fn debit_gifts_tx(
    user_id: &UserId,
    gift_name: &str,
    count: i64,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE user_gifts SET count = count - $3
        WHERE user_id = $1 AND name = $2 AND count >= $3",
    )
    .bind(user_id)
    .bind(gift_name)
    .bind(count)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows_affected == 0 {
        return Err(StoreError::InsufficientGifts);
    }
    Ok(())
}

pub async fn list_gifts(
    pool: &PgPool,
    user_id: &UserId,
) -> Result<Vec<Gift>, StoreError> {
    Ok(sqlx::query_as::<_, Gift>(
        "SELECT name, count FROM user_gifts
        WHERE user_id = $1 AND count > 0
        ORDER BY name",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?)
}

/// Balance closure view: `balance = available + locked`, with `locked`
/// derived from the ACTIVE ledger aggregation, never from the fast cache.
pub async fn balance_summary(
    pool: &PgPool,
    user_id: &UserId,
    time_source: &TimeSource,
) -> Result<responses::UserBalance, StoreError> {
    ensure_user(pool, user_id, time_source.now()).await?;
    let user = read_user(pool, user_id).await?;
    let locked = ledger::locked_stars(pool, user_id).await?;
    let gifts = list_gifts(pool, user_id).await?;
    Ok(responses::UserBalance {
        balance: user.balance,
        available: user.balance - locked,
        locked,
        gifts,
    })
}
