//! Shared wire and domain types for the star auction service.
//!
//! The server and every consumer (tests, CLI tooling, bots) depend on this
//! crate so request/response shapes agree by construction. Database-facing
//! derives are behind the `use-sqlx` feature so client builds stay lean.

pub mod api_client;
pub mod requests;
pub mod responses;

pub use api_client::{APIClient, ClientError};

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Id type wrappers help ensure we don't mix up ids for different tables.
///
/// User ids are opaque caller-provided strings (the gateway in front of the
/// service owns identity); everything else is generated server-side.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    Serialize,
    Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct UserId(pub String);

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct AuctionId(pub Uuid);

/// A caller-supplied token that makes a mutating request replay-safe.
///
/// Stored outcomes are kept for 24 hours; a repeated request with the same
/// key within that window replays the original outcome verbatim.
#[derive(
    Debug, Clone, PartialEq, Eq, Hash, Display, Serialize, Deserialize,
)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::Type), sqlx(transparent))]
pub struct IdempotencyKey(pub String);

pub const IDEMPOTENCY_KEY_MIN_LEN: usize = 8;
pub const IDEMPOTENCY_KEY_MAX_LEN: usize = 64;

impl IdempotencyKey {
    /// 8-64 characters from `[A-Za-z0-9_-]`.
    pub fn is_valid(key: &str) -> bool {
        (IDEMPOTENCY_KEY_MIN_LEN..=IDEMPOTENCY_KEY_MAX_LEN)
            .contains(&key.len())
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    }

    pub fn parse(key: &str) -> Option<Self> {
        Self::is_valid(key).then(|| Self(key.to_string()))
    }
}

/// Auction lifecycle. `Settling` covers the window between a round's end
/// job firing and its winners being recorded; bids are rejected for every
/// state other than `Active`.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "auction_state", rename_all = "snake_case")
)]
pub enum AuctionState {
    Pending,
    Active,
    Settling,
    Finished,
    Cancelled,
}

/// Ledger record kinds. `Bet` is a user's first lock in an auction;
/// `BetIncrease` supersedes the previous lock amount for the same auction.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "transaction_type", rename_all = "snake_case")
)]
pub enum TransactionType {
    Bet,
    BetIncrease,
    Refund,
    Win,
}

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[cfg_attr(
    feature = "use-sqlx",
    derive(sqlx::Type),
    sqlx(type_name = "transaction_status", rename_all = "snake_case")
)]
pub enum TransactionStatus {
    Active,
    Won,
    Lost,
    Refunded,
}

/// Admission result of a bid request, as reported to the caller. Validation
/// and capacity failures surface as API errors instead.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BidStatus {
    Ok,
    Same,
}

/// One round of an auction: how long it runs and what the top bidders win.
/// `prizes[p-1]` is the gift count awarded to place `p`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundSpec {
    pub duration_seconds: i64,
    pub prizes: Vec<i64>,
}

impl RoundSpec {
    pub fn total_prizes(&self) -> i64 {
        self.prizes.iter().sum()
    }
}

/// An awarded place in a settled round. Place 0 is the author-refund record
/// written when a round closes with no bidders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct Winner {
    pub round_num: i64,
    pub place: i64,
    pub user_id: UserId,
    pub stars: i64,
    pub prize: i64,
}

/// A gift holding: `(name, count)` with names unique per owner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[cfg_attr(feature = "use-sqlx", derive(sqlx::FromRow))]
pub struct Gift {
    pub name: String,
    pub count: i64,
}

/// Decode helper for nullable timestamp columns, used with
/// `#[sqlx(try_from = "OptionalTimestamp")]`.
#[cfg(feature = "use-sqlx")]
#[derive(Debug, Clone, sqlx::Type)]
#[sqlx(transparent)]
pub struct OptionalTimestamp(pub Option<jiff_sqlx::Timestamp>);

#[cfg(feature = "use-sqlx")]
impl TryFrom<OptionalTimestamp> for Option<jiff::Timestamp> {
    type Error = <jiff::Timestamp as TryFrom<jiff_sqlx::Timestamp>>::Error;

    fn try_from(value: OptionalTimestamp) -> Result<Self, Self::Error> {
        value.0.map(jiff::Timestamp::try_from).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn idempotency_key_validation() {
        assert!(IdempotencyKey::is_valid("abcd1234"));
        assert!(IdempotencyKey::is_valid("A-b_C-d_0123"));
        assert!(IdempotencyKey::is_valid(&"x".repeat(64)));

        // length bounds
        assert!(!IdempotencyKey::is_valid("abc4567"));
        assert!(!IdempotencyKey::is_valid(&"x".repeat(65)));
        // character set
        assert!(!IdempotencyKey::is_valid("abcd 1234"));
        assert!(!IdempotencyKey::is_valid("abcd.1234"));
        assert!(!IdempotencyKey::is_valid("ключ-ключ"));
    }

    #[test]
    fn round_spec_total() {
        let round = RoundSpec {
            duration_seconds: 30,
            prizes: vec![3, 2, 1],
        };
        assert_eq!(round.total_prizes(), 6);
    }
}
