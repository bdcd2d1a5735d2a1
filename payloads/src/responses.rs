use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{
    AuctionId, AuctionState, BidStatus, RoundSpec, TransactionStatus,
    TransactionType, UserId, Winner,
};

/// Stable machine-readable error codes. The HTTP status conveys the class
/// (validation, capacity, transient); the code conveys the cause.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    UserNotProvided,
    InvalidIdempotencyKey,
    InvalidAuctionId,
    InvalidStarsAmount,
    InvalidAuctionParams,
    AuctionNotFound,
    AuctionNotActive,
    CannotBetOwnAuction,
    InsufficientBalance,
    InsufficientGifts,
    CannotDecrease,
    IdempotencyConflict,
    TooManyRequests,
    Internal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: ErrorCode,
}

impl ErrorBody {
    pub fn new(error: ErrorCode) -> Self {
        Self {
            success: false,
            error,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidPlaced {
    pub success: bool,
    pub status: BidStatus,
    /// True when this response replays a previously stored outcome.
    pub idempotent: bool,
    /// The caller's current bid after this request.
    pub bet: i64,
    pub previous_bet: i64,
    /// Stars newly locked by this request (`bet - previous_bet`).
    pub charged: i64,
    /// True when this bid triggered an anti-snipe round extension.
    pub extended: bool,
}

/// Full auction view, winners included.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Auction {
    pub id: AuctionId,
    pub name: String,
    pub state: AuctionState,
    /// -1 before the first round starts.
    pub current_round: i64,
    pub round_end_at: Option<Timestamp>,
    pub gift_name: String,
    pub gift_count: i64,
    pub start_at: Timestamp,
    pub author_id: UserId,
    pub rounds: Vec<RoundSpec>,
    pub winners: Vec<Winner>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionCreated {
    pub success: bool,
    pub idempotent: bool,
    pub auction: Auction,
}

/// Compact auction line for listings and the all-auctions stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSummary {
    pub id: AuctionId,
    pub name: String,
    pub state: AuctionState,
    pub current_round: i64,
    pub round_end_at: Option<Timestamp>,
    pub gift_name: String,
    pub start_at: Timestamp,
    pub participants: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionDetail {
    pub auction: Auction,
    pub participants: i64,
}

/// One entry of an auction's ranked bid listing. `place` is 1-based.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BidEntry {
    pub place: i64,
    pub user_id: UserId,
    pub stars: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionBids {
    pub auction_id: AuctionId,
    pub bids: Vec<BidEntry>,
    pub total_participants: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MyBid {
    /// None when the caller has no standing bid in this auction.
    pub bet: Option<i64>,
    /// 1-based rank in the current round, None without a standing bid.
    pub rank: Option<i64>,
    pub total_participants: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserBalance {
    pub balance: i64,
    pub available: i64,
    pub locked: i64,
    pub gifts: Vec<crate::Gift>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transaction {
    pub op_id: String,
    pub tx_type: TransactionType,
    pub status: TransactionStatus,
    pub auction_id: AuctionId,
    pub round_num: i64,
    pub amount: i64,
    pub previous_amount: i64,
    pub diff: i64,
    pub created_at: Timestamp,
}

/// Periodic snapshot published on the all-auctions channel (~1/s).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionsSnapshot {
    pub generated_at: Timestamp,
    pub auctions: Vec<AuctionSummary>,
}

/// Periodic snapshot published on a single auction's channel (~2/s). The
/// final snapshot of a finished auction carries its winners.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuctionSnapshot {
    pub generated_at: Timestamp,
    pub auction: AuctionSummary,
    pub top_bids: Vec<BidEntry>,
    pub winners: Vec<Winner>,
}
