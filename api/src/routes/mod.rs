pub mod auction;
pub mod bid;
pub mod stream;
pub mod user;

use actix_web::{
    HttpRequest, HttpResponse, Responder, ResponseError, body::BoxBody, get,
    http::StatusCode, web,
};

use payloads::{
    IdempotencyKey, UserId,
    responses::{ErrorBody, ErrorCode},
};

use crate::fast::lock::LockError;
use crate::fast::rate::RateExceeded;
use crate::store::StoreError;

pub fn api_services() -> actix_web::Scope {
    let scope = web::scope("/api")
        .service(health_check)
        .service(bid::place_bid)
        .service(auction::create_auction)
        .service(auction::get_auctions)
        .service(auction::get_auction)
        .service(auction::get_auction_bids)
        .service(auction::get_my_bid)
        .service(user::get_balance)
        .service(user::get_transactions)
        .service(stream::stream_auctions)
        .service(stream::stream_auction);
    #[cfg(feature = "test-ops")]
    let scope = scope.service(user::mint);
    scope
}

#[get("/health_check")]
pub async fn health_check() -> impl Responder {
    HttpResponse::Ok().body("healthy")
}

/// User-visible failures with stable codes. Subsystems report typed
/// outcomes; this is the single place they become HTTP.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("Caller id header missing")]
    UserNotProvided,
    #[error("Idempotency key missing or malformed")]
    InvalidIdempotencyKey,
    #[error("Invalid auction id")]
    InvalidAuctionId,
    #[error("Stars amount must be a positive integer")]
    InvalidStarsAmount,
    #[error("Invalid auction parameters")]
    InvalidAuctionParams,
    #[error("Auction not found")]
    AuctionNotFound,
    #[error("Auction is not accepting bids")]
    AuctionNotActive,
    #[error("Authors cannot bid in their own auctions")]
    CannotBetOwnAuction,
    #[error("Insufficient balance")]
    InsufficientBalance,
    #[error("Insufficient gifts")]
    InsufficientGifts,
    #[error("Bids cannot decrease")]
    CannotDecrease,
    #[error("Idempotency key already used with a different request")]
    IdempotencyConflict,
    #[error("Too many requests")]
    TooManyRequests {
        retry_after_seconds: i64,
        limit: Option<i64>,
    },
    #[error("Something went wrong")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    fn code(&self) -> ErrorCode {
        match self {
            Self::UserNotProvided => ErrorCode::UserNotProvided,
            Self::InvalidIdempotencyKey => ErrorCode::InvalidIdempotencyKey,
            Self::InvalidAuctionId => ErrorCode::InvalidAuctionId,
            Self::InvalidStarsAmount => ErrorCode::InvalidStarsAmount,
            Self::InvalidAuctionParams => ErrorCode::InvalidAuctionParams,
            Self::AuctionNotFound => ErrorCode::AuctionNotFound,
            Self::AuctionNotActive => ErrorCode::AuctionNotActive,
            Self::CannotBetOwnAuction => ErrorCode::CannotBetOwnAuction,
            Self::InsufficientBalance => ErrorCode::InsufficientBalance,
            Self::InsufficientGifts => ErrorCode::InsufficientGifts,
            Self::CannotDecrease => ErrorCode::CannotDecrease,
            Self::IdempotencyConflict => ErrorCode::IdempotencyConflict,
            Self::TooManyRequests { .. } => ErrorCode::TooManyRequests,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            Self::UserNotProvided => StatusCode::UNAUTHORIZED,
            Self::AuctionNotFound => StatusCode::NOT_FOUND,
            Self::IdempotencyConflict => StatusCode::CONFLICT,
            Self::TooManyRequests { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse<BoxBody> {
        if let Self::Internal(e) = self {
            tracing::error!("internal error: {e:#}");
        }
        let mut response = HttpResponse::build(self.status_code());
        if let Self::TooManyRequests {
            retry_after_seconds,
            limit,
        } = self
        {
            response
                .insert_header(("retry-after", retry_after_seconds.to_string()));
            if let Some(limit) = limit {
                response
                    .insert_header(("x-ratelimit-limit", limit.to_string()))
                    .insert_header(("x-ratelimit-remaining", "0"));
            }
        }
        response.json(ErrorBody::new(self.code()))
    }
}

impl From<StoreError> for ApiError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AuctionNotFound => ApiError::AuctionNotFound,
            StoreError::AuctionNotActive => ApiError::AuctionNotActive,
            StoreError::CannotBetOwnAuction => ApiError::CannotBetOwnAuction,
            StoreError::InsufficientBalance => ApiError::InsufficientBalance,
            StoreError::InsufficientGifts => ApiError::InsufficientGifts,
            StoreError::IdempotencyConflict => ApiError::IdempotencyConflict,
            StoreError::UserNotFound
            | StoreError::AuctionRoundNotFound
            | StoreError::JobNotFound
            | StoreError::NotUnique(_)
            | StoreError::Database(_)
            | StoreError::UnexpectedError(_) => {
                ApiError::Internal(anyhow::Error::from(e))
            }
        }
    }
}

impl From<LockError> for ApiError {
    fn from(_: LockError) -> Self {
        // Mutex contention is a liveness hint, not a correctness failure;
        // the caller should retry with the same idempotency key.
        ApiError::TooManyRequests {
            retry_after_seconds: 1,
            limit: None,
        }
    }
}

impl From<RateExceeded> for ApiError {
    fn from(e: RateExceeded) -> Self {
        ApiError::TooManyRequests {
            retry_after_seconds: e.retry_after_seconds,
            limit: Some(e.limit),
        }
    }
}

const CALLER_ID_MAX_LEN: usize = 128;

/// The trusted caller id header. Identity is the gateway's concern; an
/// absent or empty header is the only failure mode here.
pub fn caller_id(req: &HttpRequest) -> Result<UserId, ApiError> {
    let id = req
        .headers()
        .get(payloads::api_client::USER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= CALLER_ID_MAX_LEN)
        .ok_or(ApiError::UserNotProvided)?;
    tracing::Span::current().record("user_id", tracing::field::display(id));
    Ok(UserId(id.to_string()))
}

/// Mandatory on all mutating operations.
pub fn idempotency_key(req: &HttpRequest) -> Result<IdempotencyKey, ApiError> {
    req.headers()
        .get(payloads::api_client::IDEMPOTENCY_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .and_then(IdempotencyKey::parse)
        .ok_or(ApiError::InvalidIdempotencyKey)
}
