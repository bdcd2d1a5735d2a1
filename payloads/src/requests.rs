use jiff::Timestamp;
use serde::{Deserialize, Serialize};

use crate::{AuctionId, RoundSpec};

pub const AUCTION_NAME_MAX_LEN: usize = 120;
pub const GIFT_NAME_MAX_LEN: usize = 64;
pub const MAX_ROUNDS: usize = 32;
pub const MAX_PRIZE_SLOTS: usize = 100;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceBid {
    pub auction_id: AuctionId,
    /// The caller's new total bid, not an increment.
    pub stars: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateAuction {
    pub name: String,
    pub gift_name: String,
    /// Gifts the author puts up for the auction. Must cover the sum of
    /// all configured prizes; only that sum is actually transferred, any
    /// surplus stays with the author.
    pub gift_count: i64,
    pub start_at: Timestamp,
    pub rounds: Vec<RoundSpec>,
}

/// Validation result for a create-auction request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CreateAuctionValidation {
    Valid,
    EmptyName,
    NameTooLong,
    EmptyGiftName,
    GiftNameTooLong,
    NonPositiveGiftCount,
    NoRounds,
    TooManyRounds,
    NonPositiveDuration,
    EmptyPrizeVector,
    TooManyPrizeSlots,
    NonPositivePrize,
    GiftCountBelowPrizes,
}

impl CreateAuctionValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Shape/bounds checks only; ownership checks (does the author actually
/// hold the gifts) belong to the store.
pub fn validate_create_auction(
    details: &CreateAuction,
) -> CreateAuctionValidation {
    use CreateAuctionValidation::*;

    if details.name.trim().is_empty() {
        return EmptyName;
    }
    if details.name.len() > AUCTION_NAME_MAX_LEN {
        return NameTooLong;
    }
    if details.gift_name.trim().is_empty() {
        return EmptyGiftName;
    }
    if details.gift_name.len() > GIFT_NAME_MAX_LEN {
        return GiftNameTooLong;
    }
    if details.gift_count <= 0 {
        return NonPositiveGiftCount;
    }
    if details.rounds.is_empty() {
        return NoRounds;
    }
    if details.rounds.len() > MAX_ROUNDS {
        return TooManyRounds;
    }
    let mut prizes_total: i64 = 0;
    for round in &details.rounds {
        if round.duration_seconds <= 0 {
            return NonPositiveDuration;
        }
        if round.prizes.is_empty() {
            return EmptyPrizeVector;
        }
        if round.prizes.len() > MAX_PRIZE_SLOTS {
            return TooManyPrizeSlots;
        }
        if round.prizes.iter().any(|p| *p <= 0) {
            return NonPositivePrize;
        }
        prizes_total += round.total_prizes();
    }
    if details.gift_count < prizes_total {
        return GiftCountBelowPrizes;
    }
    Valid
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mint {
    pub stars: i64,
    pub gift_name: Option<String>,
    pub gift_count: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_request() -> CreateAuction {
        CreateAuction {
            name: "Friday diamonds".into(),
            gift_name: "Diamond".into(),
            gift_count: 10,
            start_at: Timestamp::UNIX_EPOCH,
            rounds: vec![
                RoundSpec {
                    duration_seconds: 60,
                    prizes: vec![3, 2, 1],
                },
                RoundSpec {
                    duration_seconds: 30,
                    prizes: vec![2],
                },
            ],
        }
    }

    #[test]
    fn accepts_valid_request() {
        assert!(validate_create_auction(&valid_request()).is_valid());
    }

    #[test]
    fn rejects_bad_shapes() {
        use CreateAuctionValidation::*;

        let mut r = valid_request();
        r.name = "  ".into();
        assert_eq!(validate_create_auction(&r), EmptyName);

        let mut r = valid_request();
        r.rounds.clear();
        assert_eq!(validate_create_auction(&r), NoRounds);

        let mut r = valid_request();
        r.rounds[0].prizes = vec![3, 0];
        assert_eq!(validate_create_auction(&r), NonPositivePrize);

        let mut r = valid_request();
        r.rounds[1].duration_seconds = 0;
        assert_eq!(validate_create_auction(&r), NonPositiveDuration);

        // rounds need 8 gifts in total, author brings 7
        let mut r = valid_request();
        r.gift_count = 7;
        assert_eq!(validate_create_auction(&r), GiftCountBelowPrizes);
    }
}
