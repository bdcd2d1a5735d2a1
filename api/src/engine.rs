//! Bid admission: the decision table, the composite ranking score and the
//! idempotency-slot encoding.
//!
//! The engine itself is a thin handle; the admission runs as one atomic
//! script on the fast store (see [`FastStore::run_bid_script`]). Callers
//! are responsible for serializing requests of the same user (the per-user
//! lock) and for computing `available_balance` from the durable ledger.

use std::sync::Arc;

use payloads::{AuctionId, IdempotencyKey, UserId};

use crate::fast::FastStore;

/// Largest representable first-bid second; also the score tie-break base.
/// Because `MAX_TS < 10^10`, the amount is losslessly recoverable as
/// `score / 10^10`.
pub const MAX_TS: i64 = 9_999_999_999;

const SCORE_BASE: u128 = 10_000_000_000;

/// `amount * 10^10 + (MAX_TS - first_bid_seconds)`: orders by amount
/// descending, then by earlier first bid. Computed in `u128` so large star
/// amounts cannot overflow.
pub fn encode_score(amount: i64, first_bid_seconds: i64) -> u128 {
    let ts = first_bid_seconds.clamp(0, MAX_TS);
    amount as u128 * SCORE_BASE + (MAX_TS - ts) as u128
}

pub fn score_amount(score: u128) -> i64 {
    (score / SCORE_BASE) as i64
}

/// Recover the first-bid second a score was built with, so an increased
/// bid keeps its original admission time and cannot leapfrog an earlier
/// bidder of the same amount.
pub fn score_first_bid_seconds(score: u128) -> i64 {
    MAX_TS - (score % SCORE_BASE) as i64
}

/// Inputs of one admission script run. `available_balance` is
/// `balance - locked` computed from the ledger under the user's lock;
/// `now_ms` comes from the caller's clock so tests are deterministic.
pub struct BidRequest<'a> {
    pub user_id: &'a UserId,
    pub auction_id: &'a AuctionId,
    pub amount: i64,
    pub idempotency_key: &'a IdempotencyKey,
    pub available_balance: i64,
    pub now_ms: i64,
}

/// Admission decision. Only `Admitted` and `Same` are stored in the
/// idempotency slot; the two rejections are recoverable, so a retry with
/// the same key and corrected input can still succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BidOutcome {
    Admitted {
        bet: i64,
        previous_bet: i64,
        charged: i64,
    },
    Same {
        bet: i64,
    },
    CannotDecrease {
        current: i64,
    },
    InsufficientBalance {
        available: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub outcome: BidOutcome,
    /// True when the outcome was replayed from the idempotency slot.
    pub idempotent: bool,
}

/// Slot format: `{code}:{amount}:{previous}:{diff}:{status}`. The status
/// field mirrors the ledger record written alongside the outcome.
pub fn encode_slot(outcome: &BidOutcome) -> String {
    match outcome {
        BidOutcome::Admitted {
            bet,
            previous_bet,
            charged,
        } => format!("OK:{bet}:{previous_bet}:{charged}:ACTIVE"),
        BidOutcome::Same { bet } => format!("SAME:{bet}:{bet}:0:ACTIVE"),
        BidOutcome::CannotDecrease { .. }
        | BidOutcome::InsufficientBalance { .. } => {
            unreachable!("rejections are never cached")
        }
    }
}

pub fn decode_slot(slot: &str) -> Option<BidOutcome> {
    let mut parts = slot.split(':');
    let code = parts.next()?;
    let amount: i64 = parts.next()?.parse().ok()?;
    let previous: i64 = parts.next()?.parse().ok()?;
    let diff: i64 = parts.next()?.parse().ok()?;
    let _status = parts.next()?;
    match code {
        "OK" => Some(BidOutcome::Admitted {
            bet: amount,
            previous_bet: previous,
            charged: diff,
        }),
        "SAME" => Some(BidOutcome::Same { bet: amount }),
        _ => None,
    }
}

/// The admission primitive behind `placeBid`.
#[derive(Clone)]
pub struct BidEngine {
    fast: Arc<FastStore>,
}

impl BidEngine {
    pub fn new(fast: Arc<FastStore>) -> Self {
        Self { fast }
    }

    /// Run the atomic admission script. Must be called under the user's
    /// lock so the `available_balance` read and this call form one logical
    /// critical section.
    pub fn place_bid(&self, request: &BidRequest<'_>) -> Admission {
        let admission = self.fast.run_bid_script(request);
        tracing::debug!(
            user_id = %request.user_id,
            auction_id = %request.auction_id,
            amount = request.amount,
            idempotent = admission.idempotent,
            outcome = ?admission.outcome,
            "bid admission"
        );
        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn engine() -> (BidEngine, Arc<FastStore>) {
        let fast = Arc::new(FastStore::new());
        (BidEngine::new(Arc::clone(&fast)), fast)
    }

    fn request<'a>(
        user_id: &'a UserId,
        auction_id: &'a AuctionId,
        key: &'a IdempotencyKey,
        amount: i64,
        available: i64,
        now_ms: i64,
    ) -> BidRequest<'a> {
        BidRequest {
            user_id,
            auction_id,
            amount,
            idempotency_key: key,
            available_balance: available,
            now_ms,
        }
    }

    #[test]
    fn score_round_trips() {
        let score = encode_score(200, 1_700_000_123);
        assert_eq!(score_amount(score), 200);
        assert_eq!(score_first_bid_seconds(score), 1_700_000_123);

        // large amounts survive the 10^10 multiplier
        let score = encode_score(i64::MAX / 2, MAX_TS);
        assert_eq!(score_amount(score), i64::MAX / 2);
        assert_eq!(score_first_bid_seconds(score), MAX_TS);
    }

    #[test]
    fn higher_amount_outranks_earlier_bid() {
        assert!(encode_score(200, 2_000) > encode_score(100, 1_000));
    }

    #[test]
    fn equal_amounts_rank_by_first_bid_time() {
        assert!(encode_score(100, 1_000) > encode_score(100, 2_000));
    }

    #[test]
    fn slot_codec_round_trips() {
        let ok = BidOutcome::Admitted {
            bet: 300,
            previous_bet: 100,
            charged: 200,
        };
        assert_eq!(decode_slot(&encode_slot(&ok)), Some(ok));

        let same = BidOutcome::Same { bet: 250 };
        assert_eq!(decode_slot(&encode_slot(&same)), Some(same));

        assert_eq!(decode_slot("garbage"), None);
        assert_eq!(decode_slot("OK:x:0:0:ACTIVE"), None);
    }

    #[test]
    fn decision_table() {
        let (engine, _) = engine();
        let user_id = UserId("bidder".into());
        let auction_id = AuctionId(Uuid::new_v4());
        let key = |s: &str| IdempotencyKey(s.to_string());

        // fresh bid admits
        let k1 = key("bid-key-0001");
        let admission = engine
            .place_bid(&request(&user_id, &auction_id, &k1, 200, 500, 1_000));
        assert!(!admission.idempotent);
        assert_eq!(
            admission.outcome,
            BidOutcome::Admitted {
                bet: 200,
                previous_bet: 0,
                charged: 200
            }
        );

        // same amount, fresh key -> SAME
        let k2 = key("bid-key-0002");
        let admission = engine
            .place_bid(&request(&user_id, &auction_id, &k2, 200, 300, 2_000));
        assert_eq!(admission.outcome, BidOutcome::Same { bet: 200 });

        // lower amount -> CANNOT_DECREASE, not cached
        let k3 = key("bid-key-0003");
        let admission = engine
            .place_bid(&request(&user_id, &auction_id, &k3, 100, 300, 3_000));
        assert_eq!(
            admission.outcome,
            BidOutcome::CannotDecrease { current: 200 }
        );

        // raising needs only the difference: available 300 + current 200
        let admission = engine
            .place_bid(&request(&user_id, &auction_id, &k3, 500, 300, 4_000));
        assert_eq!(
            admission.outcome,
            BidOutcome::Admitted {
                bet: 500,
                previous_bet: 200,
                charged: 300
            }
        );

        // beyond the total -> INSUFFICIENT_BALANCE with actual headroom
        let k4 = key("bid-key-0004");
        let admission = engine
            .place_bid(&request(&user_id, &auction_id, &k4, 501, 0, 5_000));
        assert_eq!(
            admission.outcome,
            BidOutcome::InsufficientBalance { available: 500 }
        );
    }

    #[test]
    fn replay_returns_stored_outcome_without_side_effects() {
        let (engine, fast) = engine();
        let user_id = UserId("bidder".into());
        let auction_id = AuctionId(Uuid::new_v4());
        let k = IdempotencyKey("replayed-key-01".into());

        let first = engine
            .place_bid(&request(&user_id, &auction_id, &k, 200, 500, 1_000));
        assert!(!first.idempotent);

        for attempt in 0..49 {
            let replay = engine.place_bid(&request(
                &user_id,
                &auction_id,
                &k,
                200,
                500,
                2_000 + attempt,
            ));
            assert!(replay.idempotent);
            assert_eq!(replay.outcome, first.outcome);
        }
        assert_eq!(fast.user_bid(&user_id, &auction_id), Some(200));
        assert_eq!(fast.participant_count(&auction_id), 1);
    }

    #[test]
    fn rejection_does_not_consume_the_key() {
        let (engine, _) = engine();
        let user_id = UserId("bidder".into());
        let auction_id = AuctionId(Uuid::new_v4());
        let k = IdempotencyKey("reusable-key-01".into());

        let rejected = engine
            .place_bid(&request(&user_id, &auction_id, &k, 100, 50, 1_000));
        assert_eq!(
            rejected.outcome,
            BidOutcome::InsufficientBalance { available: 50 }
        );

        // the same key succeeds once the balance covers the bid
        let admitted = engine
            .place_bid(&request(&user_id, &auction_id, &k, 100, 150, 2_000));
        assert!(!admitted.idempotent);
        assert_eq!(
            admitted.outcome,
            BidOutcome::Admitted {
                bet: 100,
                previous_bet: 0,
                charged: 100
            }
        );
    }

    #[test]
    fn increase_preserves_first_bid_ordering() {
        let (engine, fast) = engine();
        let auction_id = AuctionId(Uuid::new_v4());
        let early = UserId("early".into());
        let late = UserId("late".into());

        // early bids 100 at t=1s, late bids 100 at t=2s
        engine.place_bid(&request(
            &early,
            &auction_id,
            &IdempotencyKey("early-key-001".into()),
            100,
            1_000,
            1_000,
        ));
        engine.place_bid(&request(
            &late,
            &auction_id,
            &IdempotencyKey("late-key-0001".into()),
            100,
            1_000,
            2_000,
        ));

        // both raise to 150; early raises last but keeps its original
        // first-bid stamp, so at equal amounts it stays on top
        engine.place_bid(&request(
            &late,
            &auction_id,
            &IdempotencyKey("late-key-0002".into()),
            150,
            1_000,
            3_000,
        ));
        engine.place_bid(&request(
            &early,
            &auction_id,
            &IdempotencyKey("early-key-002".into()),
            150,
            1_000,
            4_000,
        ));

        let top = fast.top_bidders(&auction_id, 2);
        assert_eq!(top[0].0, early);
        assert_eq!(top[1].0, late);
        assert_eq!(top[0].1, 150);
    }
}
