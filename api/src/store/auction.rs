//! Auction rows, round configuration, winner records and the conditional
//! state transitions that drive the round lifecycle.
//!
//! State moves only through predicate updates (`WHERE state = ...`), so a
//! duplicate job firing or a second server racing the same transition
//! affects zero rows and drops out harmlessly.

use jiff::Timestamp;
use jiff_sqlx::{Timestamp as SqlxTs, ToSqlx};
use sqlx::{FromRow, PgPool};

use payloads::{
    AuctionId, AuctionState, IdempotencyKey, RoundSpec, UserId, Winner,
    requests, responses,
};

use super::{StoreError, debit_gifts_tx, ensure_user};
use crate::store::jobs;
use crate::time::TimeSource;

#[derive(Debug, Clone, FromRow)]
pub struct Auction {
    pub id: AuctionId,
    pub name: String,
    pub state: AuctionState,
    pub current_round: i64,
    #[sqlx(try_from = "payloads::OptionalTimestamp")]
    pub round_end_at: Option<Timestamp>,
    pub gift_name: String,
    pub gift_count: i64,
    #[sqlx(try_from = "SqlxTs")]
    pub start_at: Timestamp,
    pub author_id: UserId,
    pub idempotency_key: String,
    #[sqlx(try_from = "SqlxTs")]
    pub created_at: Timestamp,
    #[sqlx(try_from = "SqlxTs")]
    pub updated_at: Timestamp,
}

impl Auction {
    /// Bids are admitted only while a round is actually running.
    pub fn is_accepting_bids(&self) -> bool {
        self.state == AuctionState::Active && self.current_round >= 0
    }

    pub fn into_response(
        self,
        rounds: Vec<RoundSpec>,
        winners: Vec<Winner>,
    ) -> responses::Auction {
        responses::Auction {
            id: self.id,
            name: self.name,
            state: self.state,
            current_round: self.current_round,
            round_end_at: self.round_end_at,
            gift_name: self.gift_name,
            gift_count: self.gift_count,
            start_at: self.start_at,
            author_id: self.author_id,
            rounds,
            winners,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    pub fn summary(&self, participants: i64) -> responses::AuctionSummary {
        responses::AuctionSummary {
            id: self.id,
            name: self.name.clone(),
            state: self.state,
            current_round: self.current_round,
            round_end_at: self.round_end_at,
            gift_name: self.gift_name.clone(),
            start_at: self.start_at,
            participants,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct AuctionRound {
    pub auction_id: AuctionId,
    pub round_num: i64,
    pub duration_seconds: i64,
    pub prizes: Vec<i64>,
}

impl AuctionRound {
    pub fn spec(&self) -> RoundSpec {
        RoundSpec {
            duration_seconds: self.duration_seconds,
            prizes: self.prizes.clone(),
        }
    }
}

/// Create an auction: reserve the author's gifts, insert the document and
/// its rounds, and enqueue the start job, all in one transaction keyed by
/// the caller's idempotency key.
///
/// Returns the auction and whether this call replayed an earlier create.
/// A reused key belonging to a different author is a conflict, never a
/// replay.
#[tracing::instrument(skip(pool, details, time_source), fields(author = %author_id))]
pub async fn create_auction(
    pool: &PgPool,
    details: &requests::CreateAuction,
    author_id: &UserId,
    idempotency_key: &IdempotencyKey,
    time_source: &TimeSource,
) -> Result<(Auction, bool), StoreError> {
    // Fast path for replays, before touching the author's gifts.
    if let Some(auction) =
        read_by_idempotency_key(pool, idempotency_key).await?
    {
        if auction.author_id != *author_id {
            return Err(StoreError::IdempotencyConflict);
        }
        return Ok((auction, true));
    }

    let now = time_source.now();
    let mut tx = pool.begin().await?;

    // Only the configured prizes move to the auction; any surplus in the
    // request's gift_count never leaves the author. Settlement pays (or
    // refunds) exactly this amount back out, so the auction's holdings
    // always equal its outstanding prizes.
    let prizes_total: i64 =
        details.rounds.iter().map(RoundSpec::total_prizes).sum();

    ensure_user(&mut *tx, author_id, now).await?;
    debit_gifts_tx(author_id, &details.gift_name, prizes_total, &mut tx)
        .await?;

    let insert_result = sqlx::query_as::<_, Auction>(
        "INSERT INTO auctions (
            name,
            state,
            current_round,
            gift_name,
            gift_count,
            start_at,
            author_id,
            idempotency_key,
            created_at,
            updated_at
        ) VALUES ($1, 'pending', -1, $2, $3, $4, $5, $6, $7, $7)
        RETURNING *",
    )
    .bind(&details.name)
    .bind(&details.gift_name)
    .bind(prizes_total)
    .bind(details.start_at.to_sqlx())
    .bind(author_id)
    .bind(&idempotency_key.0)
    .bind(now.to_sqlx())
    .fetch_one(&mut *tx)
    .await;

    let auction = match insert_result {
        Ok(auction) => auction,
        Err(e) => {
            // Rolling back undoes the gift debit.
            drop(tx);
            match StoreError::from(e) {
                StoreError::NotUnique(_) => {
                    // A concurrent request with the same key won the race;
                    // replay its auction.
                    let existing =
                        read_by_idempotency_key(pool, idempotency_key)
                            .await?
                            .ok_or(StoreError::IdempotencyConflict)?;
                    if existing.author_id != *author_id {
                        return Err(StoreError::IdempotencyConflict);
                    }
                    return Ok((existing, true));
                }
                other => return Err(other),
            }
        }
    };

    for (round_num, round) in details.rounds.iter().enumerate() {
        sqlx::query(
            "INSERT INTO auction_rounds (
                auction_id,
                round_num,
                duration_seconds,
                prizes
            ) VALUES ($1, $2, $3, $4)",
        )
        .bind(auction.id)
        .bind(round_num as i64)
        .bind(round.duration_seconds)
        .bind(&round.prizes)
        .execute(&mut *tx)
        .await?;
    }

    jobs::enqueue_tx(
        &jobs::start_round_job_id(&auction.id),
        jobs::JobKind::StartRound,
        &auction.id,
        0,
        auction.start_at,
        now,
        &mut tx,
    )
    .await?;

    tx.commit().await?;

    tracing::info!(
        auction_id = %auction.id,
        gift_name = %auction.gift_name,
        gift_count = auction.gift_count,
        "created auction"
    );
    Ok((auction, false))
}

pub async fn read_auction(
    pool: &PgPool,
    auction_id: &AuctionId,
) -> Result<Auction, StoreError> {
    sqlx::query_as::<_, Auction>("SELECT * FROM auctions WHERE id = $1")
        .bind(auction_id)
        .fetch_one(pool)
        .await
        .map_err(|e| match e {
            sqlx::Error::RowNotFound => StoreError::AuctionNotFound,
            e => StoreError::Database(e),
        })
}

async fn read_by_idempotency_key(
    pool: &PgPool,
    idempotency_key: &IdempotencyKey,
) -> Result<Option<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions WHERE idempotency_key = $1",
    )
    .bind(&idempotency_key.0)
    .fetch_optional(pool)
    .await?)
}

/// Auctions that clients care about: running first, then upcoming.
pub async fn list_open(pool: &PgPool) -> Result<Vec<Auction>, StoreError> {
    Ok(sqlx::query_as::<_, Auction>(
        "SELECT * FROM auctions
        WHERE state IN ('pending', 'active', 'settling')
        ORDER BY state = 'pending', start_at",
    )
    .fetch_all(pool)
    .await?)
}

pub async fn list_rounds(
    pool: &PgPool,
    auction_id: &AuctionId,
) -> Result<Vec<AuctionRound>, StoreError> {
    Ok(sqlx::query_as::<_, AuctionRound>(
        "SELECT * FROM auction_rounds
        WHERE auction_id = $1
        ORDER BY round_num",
    )
    .bind(auction_id)
    .fetch_all(pool)
    .await?)
}

pub async fn get_round(
    pool: &PgPool,
    auction_id: &AuctionId,
    round_num: i64,
) -> Result<AuctionRound, StoreError> {
    sqlx::query_as::<_, AuctionRound>(
        "SELECT * FROM auction_rounds
        WHERE auction_id = $1 AND round_num = $2",
    )
    .bind(auction_id)
    .bind(round_num)
    .fetch_one(pool)
    .await
    .map_err(|e| match e {
        sqlx::Error::RowNotFound => StoreError::AuctionRoundNotFound,
        e => StoreError::Database(e),
    })
}

pub async fn count_rounds(
    pool: &PgPool,
    auction_id: &AuctionId,
) -> Result<i64, StoreError> {
    Ok(sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM auction_rounds WHERE auction_id = $1",
    )
    .bind(auction_id)
    .fetch_one(pool)
    .await?)
}

pub async fn list_winners(
    pool: &PgPool,
    auction_id: &AuctionId,
) -> Result<Vec<Winner>, StoreError> {
    Ok(sqlx::query_as::<_, Winner>(
        "SELECT round_num, place, user_id, stars, prize FROM winners
        WHERE auction_id = $1
        ORDER BY round_num, place",
    )
    .bind(auction_id)
    .fetch_all(pool)
    .await?)
}

pub async fn list_round_winners(
    pool: &PgPool,
    auction_id: &AuctionId,
    round_num: i64,
) -> Result<Vec<Winner>, StoreError> {
    Ok(sqlx::query_as::<_, Winner>(
        "SELECT round_num, place, user_id, stars, prize FROM winners
        WHERE auction_id = $1 AND round_num = $2
        ORDER BY place",
    )
    .bind(auction_id)
    .bind(round_num)
    .fetch_all(pool)
    .await?)
}

/// Record a settled round's winners. The `(auction, round, place)` key
/// makes re-settlement a no-op, so a retried end-round job cannot append
/// duplicates.
pub async fn insert_winners_tx(
    auction_id: &AuctionId,
    winners: &[Winner],
    now: Timestamp,
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
) -> Result<(), StoreError> {
    for winner in winners {
        sqlx::query(
            "INSERT INTO winners (
                auction_id,
                round_num,
                place,
                user_id,
                stars,
                prize,
                created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (auction_id, round_num, place) DO NOTHING",
        )
        .bind(auction_id)
        .bind(winner.round_num)
        .bind(winner.place)
        .bind(&winner.user_id)
        .bind(winner.stars)
        .bind(winner.prize)
        .bind(now.to_sqlx())
        .execute(&mut **tx)
        .await?;
    }
    Ok(())
}

// ---- conditional state transitions ---------------------------------------

/// `PENDING -> ACTIVE(round 0)`. Returns false when another worker got
/// there first.
pub async fn activate(
    pool: &PgPool,
    auction_id: &AuctionId,
    round_end_at: Timestamp,
    now: Timestamp,
) -> Result<bool, StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE auctions
        SET state = 'active', current_round = 0, round_end_at = $2,
            updated_at = $3
        WHERE id = $1 AND state = 'pending'",
    )
    .bind(auction_id)
    .bind(round_end_at.to_sqlx())
    .bind(now.to_sqlx())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

/// `ACTIVE(r) -> SETTLING(r)`. Also matches an auction already settling
/// round `r`, so a crashed settlement can be resumed; any other state
/// means the event is a duplicate to drop.
pub async fn begin_settling(
    pool: &PgPool,
    auction_id: &AuctionId,
    round_num: i64,
    now: Timestamp,
) -> Result<bool, StoreError> {
    let rows_affected = sqlx::query(
        "UPDATE auctions
        SET state = 'settling', updated_at = $3
        WHERE id = $1 AND current_round = $2
            AND state IN ('active', 'settling')",
    )
    .bind(auction_id)
    .bind(round_num)
    .bind(now.to_sqlx())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows_affected > 0)
}

/// `SETTLING(r) -> ACTIVE(r+1)`.
pub async fn advance_round(
    pool: &PgPool,
    auction_id: &AuctionId,
    next_round: i64,
    round_end_at: Timestamp,
    now: Timestamp,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE auctions
        SET state = 'active', current_round = $2, round_end_at = $3,
            updated_at = $4
        WHERE id = $1 AND state = 'settling'",
    )
    .bind(auction_id)
    .bind(next_round)
    .bind(round_end_at.to_sqlx())
    .bind(now.to_sqlx())
    .execute(pool)
    .await?;
    Ok(())
}

/// `SETTLING(last) -> FINISHED`.
pub async fn finish(
    pool: &PgPool,
    auction_id: &AuctionId,
    now: Timestamp,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE auctions
        SET state = 'finished', round_end_at = NULL, updated_at = $2
        WHERE id = $1 AND state = 'settling'",
    )
    .bind(auction_id)
    .bind(now.to_sqlx())
    .execute(pool)
    .await?;
    Ok(())
}

/// Anti-snipe write: the deadline shown to clients. The scheduler job row
/// remains the authority on when the round actually ends.
pub async fn set_round_end(
    pool: &PgPool,
    auction_id: &AuctionId,
    round_end_at: Timestamp,
    now: Timestamp,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE auctions SET round_end_at = $2, updated_at = $3
        WHERE id = $1",
    )
    .bind(auction_id)
    .bind(round_end_at.to_sqlx())
    .bind(now.to_sqlx())
    .execute(pool)
    .await?;
    Ok(())
}
