//! The bid coordinator: composes validation, rate limiting, the per-user
//! lock, the admission script, the ledger write and the anti-snipe check
//! behind one endpoint.

use actix_web::{HttpRequest, HttpResponse, post, web};
use payloads::{BidStatus, requests, responses};
use sqlx::PgPool;

use crate::engine::{Admission, BidEngine, BidOutcome, BidRequest};
use crate::fast::{lock::UserLocks, rate};
use crate::notify::NotificationBus;
use crate::rounds::RoundProcessor;
use crate::routes::{ApiError, caller_id, idempotency_key};
use crate::store::{self, StoreError, auction, ledger};
use crate::time::TimeSource;

#[tracing::instrument(
    skip_all,
    fields(user_id, auction_id = %details.auction_id, stars = details.stars),
    ret
)]
#[post("/place_bid")]
#[allow(clippy::too_many_arguments)]
pub async fn place_bid(
    req: HttpRequest,
    details: web::Json<requests::PlaceBid>,
    pool: web::Data<PgPool>,
    engine: web::Data<BidEngine>,
    locks: web::Data<UserLocks>,
    limiter: web::Data<rate::RateLimiter>,
    processor: web::Data<RoundProcessor>,
    notifier: web::Data<NotificationBus>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    // Key format is checked before anything else so a malformed retry
    // token is reported even when other inputs are also bad.
    let key = idempotency_key(&req)?;
    let user_id = caller_id(&req)?;
    if details.stars <= 0 {
        return Err(ApiError::InvalidStarsAmount);
    }
    limiter.check(&rate::BID, &user_id, time_source.now_millis())?;

    let auction_row =
        auction::read_auction(&pool, &details.auction_id).await?;
    if !auction_row.is_accepting_bids() {
        return Err(ApiError::AuctionNotActive);
    }
    if auction_row.author_id == user_id {
        return Err(ApiError::CannotBetOwnAuction);
    }

    // Everything money-related happens under the user's lock: the
    // available-balance read and the admission script form one logical
    // critical section, and the ledger upsert runs on every OK/SAME
    // response (replays included) to heal a crash between the two stores.
    let admission: Admission = locks
        .with_user_lock(&user_id, || async {
            let now = time_source.now();
            store::ensure_user(pool.get_ref(), &user_id, now).await?;
            let user = store::read_user(&pool, &user_id).await?;
            let locked = ledger::locked_stars(&pool, &user_id).await?;

            let admission = engine.place_bid(&BidRequest {
                user_id: &user_id,
                auction_id: &auction_row.id,
                amount: details.stars,
                idempotency_key: &key,
                available_balance: user.balance - locked,
                now_ms: now.as_millisecond(),
            });
            ledger::upsert_bid_record(
                &pool,
                &key,
                &user_id,
                &auction_row.id,
                auction_row.current_round,
                &admission.outcome,
                now,
            )
            .await?;
            Ok::<_, StoreError>(admission)
        })
        .await??;

    let (status, bet, previous_bet, charged) = match admission.outcome {
        BidOutcome::Admitted {
            bet,
            previous_bet,
            charged,
        } => (BidStatus::Ok, bet, previous_bet, charged),
        BidOutcome::Same { bet } => (BidStatus::Same, bet, bet, 0),
        BidOutcome::CannotDecrease { .. } => {
            return Err(ApiError::CannotDecrease);
        }
        BidOutcome::InsufficientBalance { .. } => {
            return Err(ApiError::InsufficientBalance);
        }
    };

    // Fresh admissions may extend a round that is about to close and are
    // worth an immediate snapshot; replays changed nothing.
    let mut extended = false;
    if status == BidStatus::Ok && !admission.idempotent {
        extended = processor
            .maybe_extend_after_bid(&auction_row, &user_id)
            .await;
        notifier
            .into_inner()
            .notify_auction_update(auction_row.id);
    }

    Ok(HttpResponse::Ok().json(responses::BidPlaced {
        success: true,
        status,
        idempotent: admission.idempotent,
        bet,
        previous_bet,
        charged,
        extended,
    }))
}
