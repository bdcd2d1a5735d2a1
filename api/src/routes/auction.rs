use actix_web::{HttpRequest, HttpResponse, get, post, web};
use payloads::{AuctionId, requests, responses};
use serde::Deserialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::fast::{FastStore, rate};
use crate::routes::{ApiError, caller_id, idempotency_key};
use crate::store::auction;
use crate::time::TimeSource;

#[tracing::instrument(skip_all, fields(user_id, name = %details.name), ret)]
#[post("/create_auction")]
pub async fn create_auction(
    req: HttpRequest,
    details: web::Json<requests::CreateAuction>,
    pool: web::Data<PgPool>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    let key = idempotency_key(&req)?;
    let author_id = caller_id(&req)?;
    limiter.check(
        &rate::CREATE_AUCTION,
        &author_id,
        time_source.now_millis(),
    )?;
    if !requests::validate_create_auction(&details).is_valid() {
        return Err(ApiError::InvalidAuctionParams);
    }

    let (auction_row, idempotent) = auction::create_auction(
        &pool,
        &details,
        &author_id,
        &key,
        &time_source,
    )
    .await?;

    let rounds = auction::list_rounds(&pool, &auction_row.id)
        .await?
        .iter()
        .map(auction::AuctionRound::spec)
        .collect();
    Ok(HttpResponse::Ok().json(responses::AuctionCreated {
        success: true,
        idempotent,
        auction: auction_row.into_response(rounds, Vec::new()),
    }))
}

#[tracing::instrument(skip_all, ret)]
#[get("/auctions")]
pub async fn get_auctions(
    req: HttpRequest,
    pool: web::Data<PgPool>,
    fast: web::Data<FastStore>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    // Reads are open; the limiter only sees identified callers.
    if let Ok(user_id) = caller_id(&req) {
        limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    }
    let auctions = auction::list_open(&pool).await?;
    let summaries: Vec<responses::AuctionSummary> = auctions
        .iter()
        .map(|a| a.summary(fast.participant_count(&a.id)))
        .collect();
    Ok(HttpResponse::Ok().json(summaries))
}

#[tracing::instrument(skip_all, fields(%auction_id), ret)]
#[get("/auction/{auction_id}")]
pub async fn get_auction(
    req: HttpRequest,
    auction_id: web::Path<Uuid>,
    pool: web::Data<PgPool>,
    fast: web::Data<FastStore>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    if let Ok(user_id) = caller_id(&req) {
        limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    }
    let auction_id = AuctionId(auction_id.into_inner());
    let auction_row = auction::read_auction(&pool, &auction_id).await?;
    let rounds = auction::list_rounds(&pool, &auction_id)
        .await?
        .iter()
        .map(auction::AuctionRound::spec)
        .collect();
    let winners = auction::list_winners(&pool, &auction_id).await?;
    let participants = fast.participant_count(&auction_id);
    Ok(HttpResponse::Ok().json(responses::AuctionDetail {
        auction: auction_row.into_response(rounds, winners),
        participants,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BidsQuery {
    limit: Option<i64>,
}

const DEFAULT_BIDS_LIMIT: i64 = 20;
const MAX_BIDS_LIMIT: i64 = 100;

#[tracing::instrument(skip_all, fields(%auction_id), ret)]
#[get("/auction/{auction_id}/bids")]
pub async fn get_auction_bids(
    req: HttpRequest,
    auction_id: web::Path<Uuid>,
    query: web::Query<BidsQuery>,
    pool: web::Data<PgPool>,
    fast: web::Data<FastStore>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    if let Ok(user_id) = caller_id(&req) {
        limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    }
    let auction_id = AuctionId(auction_id.into_inner());
    // existence check so an unknown id is a 404, not an empty list
    auction::read_auction(&pool, &auction_id).await?;

    let limit = query
        .limit
        .unwrap_or(DEFAULT_BIDS_LIMIT)
        .clamp(1, MAX_BIDS_LIMIT);
    let bids = fast
        .top_bidders(&auction_id, limit as usize)
        .into_iter()
        .enumerate()
        .map(|(i, (user_id, stars))| responses::BidEntry {
            place: i as i64 + 1,
            user_id,
            stars,
        })
        .collect();
    Ok(HttpResponse::Ok().json(responses::AuctionBids {
        auction_id,
        bids,
        total_participants: fast.participant_count(&auction_id),
    }))
}

#[tracing::instrument(skip_all, fields(user_id, %auction_id), ret)]
#[get("/auction/{auction_id}/my_bid")]
pub async fn get_my_bid(
    req: HttpRequest,
    auction_id: web::Path<Uuid>,
    pool: web::Data<PgPool>,
    fast: web::Data<FastStore>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    let auction_id = AuctionId(auction_id.into_inner());
    auction::read_auction(&pool, &auction_id).await?;

    Ok(HttpResponse::Ok().json(responses::MyBid {
        bet: fast.user_bid(&user_id, &auction_id),
        rank: fast.bid_rank(&auction_id, &user_id),
        total_participants: fast.participant_count(&auction_id),
    }))
}
