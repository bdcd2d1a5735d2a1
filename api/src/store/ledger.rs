//! The transaction ledger.
//!
//! Every bid admission and every settlement event leaves exactly one
//! record here, keyed by a deterministic op-id: the caller's idempotency
//! key for bids, a pure function of `(auction, user, round, place)` for
//! settlement. Inserts are `ON CONFLICT DO NOTHING`, so any writer can be
//! retried; money movement gated on the insert happening makes the retry
//! safe end to end.
//!
//! The ledger is also the source of truth for locked balances: the locked
//! total is the sum over distinct auctions of the user's latest ACTIVE
//! bet amount. An increase supersedes its predecessor, so this is not a
//! plain sum over records.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool};

use payloads::{
    AuctionId, IdempotencyKey, TransactionStatus, TransactionType, UserId,
    responses,
};

use super::StoreError;
use crate::engine::BidOutcome;

#[derive(Debug, Clone, FromRow)]
pub struct Transaction {
    pub op_id: String,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub user_id: UserId,
    pub auction_id: AuctionId,
    pub round_num: i64,
    pub amount: i64,
    pub previous_amount: i64,
    pub diff: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
}

impl From<Transaction> for responses::Transaction {
    fn from(tx: Transaction) -> Self {
        Self {
            op_id: tx.op_id,
            tx_type: tx.tx_type,
            status: tx.status,
            auction_id: tx.auction_id,
            round_num: tx.round_num,
            amount: tx.amount,
            previous_amount: tx.previous_amount,
            diff: tx.diff,
            created_at: tx.created_at,
        }
    }
}

pub fn win_op_id(
    auction_id: &AuctionId,
    user_id: &UserId,
    round_num: i64,
    place: i64,
) -> String {
    format!("{auction_id}:{user_id}:win:{round_num}:place{place}")
}

pub fn no_bidders_refund_op_id(
    auction_id: &AuctionId,
    author_id: &UserId,
    round_num: i64,
) -> String {
    format!("{auction_id}:{author_id}:win:{round_num}:place-0-refund")
}

pub fn unclaimed_refund_op_id(
    auction_id: &AuctionId,
    author_id: &UserId,
    round_num: i64,
) -> String {
    format!("{auction_id}:{author_id}:unclaimed:{round_num}")
}

/// Insert a ledger record, returning whether this call created it. A
/// `false` return means an earlier attempt already recorded the operation
/// and any money movement it gates must be skipped.
#[allow(clippy::too_many_arguments)]
pub async fn insert_record_tx(
    op_id: &str,
    tx_type: TransactionType,
    status: TransactionStatus,
    user_id: &UserId,
    auction_id: &AuctionId,
    round_num: i64,
    amount: i64,
    previous_amount: i64,
    diff: i64,
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<bool, StoreError> {
    let rows_affected = sqlx::query(
        "INSERT INTO transactions (
            op_id,
            tx_type,
            status,
            user_id,
            auction_id,
            round_num,
            amount,
            previous_amount,
            diff,
            created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        ON CONFLICT (op_id) DO NOTHING",
    )
    .bind(op_id)
    .bind(tx_type)
    .bind(status)
    .bind(user_id)
    .bind(auction_id)
    .bind(round_num)
    .bind(amount)
    .bind(previous_amount)
    .bind(diff)
    .bind(now.to_sqlx())
    .execute(&mut **tx)
    .await?
    .rows_affected();

    Ok(rows_affected > 0)
}

/// Record an admitted or replayed bid outcome, keyed by the caller's
/// idempotency key. Runs on every OK/SAME response, including idempotent
/// replays: if a crash separated the fast-store script from this write,
/// the replay heals the gap (two-store coherence).
pub async fn upsert_bid_record(
    pool: &PgPool,
    idempotency_key: &IdempotencyKey,
    user_id: &UserId,
    auction_id: &AuctionId,
    round_num: i64,
    outcome: &BidOutcome,
    now: Timestamp,
) -> Result<(), StoreError> {
    let (bet, previous_bet, charged) = match outcome {
        BidOutcome::Admitted {
            bet,
            previous_bet,
            charged,
        } => (*bet, *previous_bet, *charged),
        BidOutcome::Same { bet } => (*bet, *bet, 0),
        BidOutcome::CannotDecrease { .. }
        | BidOutcome::InsufficientBalance { .. } => return Ok(()),
    };
    let tx_type = if previous_bet == 0 {
        TransactionType::Bet
    } else {
        TransactionType::BetIncrease
    };

    let mut tx = pool.begin().await?;
    let inserted = insert_record_tx(
        &idempotency_key.0,
        tx_type,
        TransactionStatus::Active,
        user_id,
        auction_id,
        round_num,
        bet,
        previous_bet,
        charged,
        now,
        &mut tx,
    )
    .await?;
    tx.commit().await?;

    if inserted {
        tracing::info!(
            op_id = %idempotency_key,
            %user_id,
            %auction_id,
            round_num,
            amount = bet,
            previous_amount = previous_bet,
            diff = charged,
            "ledger: recorded {tx_type}"
        );
    }
    Ok(())
}

/// Sum of the user's latest ACTIVE bet per auction. `DISTINCT ON` keeps
/// one row per auction (the newest), so increases do not double-count.
pub async fn locked_stars(
    pool: &PgPool,
    user_id: &UserId,
) -> Result<i64, StoreError> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM (
            SELECT DISTINCT ON (auction_id) amount
            FROM transactions
            WHERE user_id = $1
                AND status = 'active'
                AND tx_type IN ('bet', 'bet_increase')
            ORDER BY auction_id, created_at DESC, op_id
        ) latest",
    )
    .bind(user_id)
    .fetch_one(pool)
    .await?)
}

/// Move all of a user's ACTIVE bet records for an auction to a terminal
/// status (WON at settlement, LOST at auction close). Idempotent: a rerun
/// finds nothing ACTIVE.
pub async fn finalize_bid_records_tx(
    user_id: &UserId,
    auction_id: &AuctionId,
    status: TransactionStatus,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<u64, StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE transactions SET status = $3
        WHERE user_id = $1
            AND auction_id = $2
            AND status = 'active'
            AND tx_type IN ('bet', 'bet_increase')",
    )
    .bind(user_id)
    .bind(auction_id)
    .bind(status)
    .execute(&mut **tx)
    .await?
    .rows_affected();

    if rows_affected > 0 {
        tracing::info!(
            %user_id,
            %auction_id,
            %status,
            records = rows_affected,
            "ledger: finalized bid records"
        );
    }
    Ok(rows_affected)
}

/// The caller's raw transaction feed, newest first.
pub async fn list_for_user(
    pool: &PgPool,
    user_id: &UserId,
    limit: i64,
) -> Result<Vec<Transaction>, StoreError> {
    Ok(sqlx::query_as::<_, Transaction>(
        "SELECT * FROM transactions
        WHERE user_id = $1
        ORDER BY created_at DESC, op_id
        LIMIT $2",
    )
    .bind(user_id)
    .bind(limit)
    .fetch_all(pool)
    .await?)
}
