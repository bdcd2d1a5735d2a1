use actix_web::{HttpRequest, HttpResponse, get, web};
use serde::Deserialize;
use sqlx::PgPool;

use crate::fast::rate;
use crate::routes::{ApiError, caller_id};
use crate::store::{self, ledger};
use crate::time::TimeSource;

#[tracing::instrument(skip_all, fields(user_id), ret)]
#[get("/balance")]
pub async fn get_balance(
    req: HttpRequest,
    pool: web::Data<PgPool>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    let balance =
        store::balance_summary(&pool, &user_id, &time_source).await?;
    Ok(HttpResponse::Ok().json(balance))
}

#[derive(Debug, Deserialize)]
pub struct TransactionsQuery {
    limit: Option<i64>,
}

const DEFAULT_TRANSACTIONS_LIMIT: i64 = 50;
const MAX_TRANSACTIONS_LIMIT: i64 = 200;

/// The caller's raw ledger feed, newest first.
#[tracing::instrument(skip_all, fields(user_id), ret)]
#[get("/transactions")]
pub async fn get_transactions(
    req: HttpRequest,
    query: web::Query<TransactionsQuery>,
    pool: web::Data<PgPool>,
    limiter: web::Data<rate::RateLimiter>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    let user_id = caller_id(&req)?;
    limiter.check(&rate::READ, &user_id, time_source.now_millis())?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_TRANSACTIONS_LIMIT)
        .clamp(1, MAX_TRANSACTIONS_LIMIT);
    let transactions: Vec<payloads::responses::Transaction> =
        ledger::list_for_user(&pool, &user_id, limit)
            .await?
            .into_iter()
            .map(Into::into)
            .collect();
    Ok(HttpResponse::Ok().json(transactions))
}

/// Test-only seeding of stars and gifts; compiled in with `test-ops`.
#[cfg(feature = "test-ops")]
#[tracing::instrument(skip_all, fields(user_id), ret)]
#[actix_web::post("/mint")]
pub async fn mint(
    req: HttpRequest,
    details: web::Json<payloads::requests::Mint>,
    pool: web::Data<PgPool>,
    time_source: web::Data<TimeSource>,
) -> Result<HttpResponse, ApiError> {
    use crate::store::StoreError;

    let user_id = caller_id(&req)?;
    if details.stars < 0 || details.gift_count < 0 {
        return Err(ApiError::InvalidStarsAmount);
    }

    let now = time_source.now();
    let mut tx = pool.begin().await.map_err(StoreError::from)?;
    if details.stars > 0 {
        store::credit_stars_tx(&user_id, details.stars, now, &mut tx).await?;
    }
    if let Some(gift_name) = &details.gift_name
        && details.gift_count > 0
    {
        store::credit_gifts_tx(
            &user_id,
            gift_name,
            details.gift_count,
            now,
            &mut tx,
        )
        .await?;
    }
    store::ensure_user(&mut *tx, &user_id, now).await?;
    tx.commit().await.map_err(StoreError::from)?;

    let balance =
        store::balance_summary(&pool, &user_id, &time_source).await?;
    Ok(HttpResponse::Ok().json(balance))
}
