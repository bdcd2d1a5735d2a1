//! The fast store: an embedded key/value + ranked-set + pub/sub engine
//! backing the hot bid path.
//!
//! ## Design Decisions
//!
//! ### Cache, not ledger
//! The fast store holds the per-user bid maps, the per-auction ranked
//! sets, idempotency slots, locks and rate counters. None of it is
//! authoritative for money: locked balances are always recomputed from the
//! durable transaction ledger, so the fast store can be rebuilt after a
//! crash without losing funds.
//!
//! ### Atomic scripts
//! Operations that must observe and update several keys in one step (the
//! bid admission script, lock release, bounded counters) run as single
//! methods while holding the engine mutex. Nothing awaits inside the
//! critical section, so the mutex is a plain [`std::sync::Mutex`].
//!
//! ### Expiry
//! Every TTL is bookkept as an absolute millisecond deadline supplied by
//! the caller's clock. Reads treat expired entries as absent; a periodic
//! sweeper reclaims the memory.

pub mod lock;
pub mod rate;

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use payloads::{AuctionId, UserId};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::engine::{
    Admission, BidOutcome, BidRequest, decode_slot, encode_score, encode_slot,
    score_amount, score_first_bid_seconds,
};
use crate::time::TimeSource;

/// Outcome slots are replayable for 24 hours.
pub const IDEMPOTENCY_TTL_MS: i64 = 24 * 60 * 60 * 1000;

/// How long a published snapshot stays readable for late subscribers.
pub const SNAPSHOT_TTL_MS: i64 = 5_000;

const CHANNEL_CAPACITY: usize = 256;

pub fn idem_key(key: &str) -> String {
    format!("idem:{key}")
}

pub fn user_lock_key(user_id: &UserId) -> String {
    format!("lock:user:{user_id}")
}

pub fn rate_key(prefix: &str, user_id: &UserId) -> String {
    format!("rl:{prefix}:{user_id}")
}

pub fn extension_count_key(auction_id: &AuctionId, round_num: i64) -> String {
    format!("ext:{auction_id}:{round_num}")
}

pub fn auctions_channel() -> String {
    "auctions:updates".to_string()
}

pub fn auction_channel(auction_id: &AuctionId) -> String {
    format!("auction:{auction_id}:updates")
}

pub fn auctions_snapshot_key() -> String {
    "snapshot:auctions".to_string()
}

pub fn auction_snapshot_key(auction_id: &AuctionId) -> String {
    format!("snapshot:auction:{auction_id}")
}

struct Expiring<T> {
    value: T,
    /// Absolute deadline in epoch milliseconds; `None` never expires.
    expires_at_ms: Option<i64>,
}

impl<T> Expiring<T> {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at_ms.is_none_or(|deadline| now_ms < deadline)
    }
}

struct Counter {
    value: i64,
    expires_at_ms: i64,
}

/// Bidders of one auction ordered by composite score, descending. The
/// `ordered` set and `scores` map always agree; both are updated under the
/// store mutex.
#[derive(Default)]
struct RankedBids {
    scores: HashMap<UserId, u128>,
    ordered: BTreeSet<(u128, UserId)>,
}

impl RankedBids {
    fn insert(&mut self, user_id: UserId, score: u128) {
        if let Some(old) = self.scores.insert(user_id.clone(), score) {
            self.ordered.remove(&(old, user_id.clone()));
        }
        self.ordered.insert((score, user_id));
    }

    fn remove(&mut self, user_id: &UserId) -> Option<u128> {
        let score = self.scores.remove(user_id)?;
        self.ordered.remove(&(score, user_id.clone()));
        Some(score)
    }

    fn top(&self, n: usize) -> Vec<(UserId, i64)> {
        self.ordered
            .iter()
            .rev()
            .take(n)
            .map(|(score, user_id)| (user_id.clone(), score_amount(*score)))
            .collect()
    }

    fn rank_of(&self, user_id: &UserId) -> Option<i64> {
        let score = self.scores.get(user_id)?;
        let rank = self
            .ordered
            .iter()
            .rev()
            .position(|(s, u)| s == score && u == user_id)?;
        Some(rank as i64 + 1)
    }
}

#[derive(Default)]
struct Inner {
    strings: HashMap<String, Expiring<String>>,
    counters: HashMap<String, Counter>,
    /// `user -> auction -> current bid` (the `user:{u}:bets` map).
    user_bids: HashMap<UserId, HashMap<AuctionId, i64>>,
    /// `auction -> ranked bidders` (the `auction:{a}:bets` set).
    ranked: HashMap<AuctionId, RankedBids>,
    channels: HashMap<String, broadcast::Sender<String>>,
}

#[derive(Default)]
pub struct FastStore {
    inner: Mutex<Inner>,
}

impl FastStore {
    pub fn new() -> Self {
        Self::default()
    }

    // ---- plain string keys ------------------------------------------------

    pub fn set_string(
        &self,
        key: &str,
        value: String,
        ttl_ms: Option<i64>,
        now_ms: i64,
    ) {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at_ms: ttl_ms.map(|ttl| now_ms + ttl),
            },
        );
    }

    pub fn get_string(&self, key: &str, now_ms: i64) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .strings
            .get(key)
            .filter(|entry| entry.is_live(now_ms))
            .map(|entry| entry.value.clone())
    }

    /// Set-if-absent with a TTL; the acquire half of the distributed-lock
    /// protocol. Returns false when a live value already holds the slot.
    pub fn set_string_nx(
        &self,
        key: &str,
        value: String,
        ttl_ms: i64,
        now_ms: i64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if inner
            .strings
            .get(key)
            .is_some_and(|entry| entry.is_live(now_ms))
        {
            return false;
        }
        inner.strings.insert(
            key.to_string(),
            Expiring {
                value,
                expires_at_ms: Some(now_ms + ttl_ms),
            },
        );
        true
    }

    /// Delete the key only while it still holds `expected`; the release
    /// half of the lock protocol. A stale holder whose TTL already lapsed
    /// cannot delete a successor's slot.
    pub fn compare_and_delete(
        &self,
        key: &str,
        expected: &str,
        now_ms: i64,
    ) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let matches = inner
            .strings
            .get(key)
            .is_some_and(|e| e.is_live(now_ms) && e.value == expected);
        if matches {
            inner.strings.remove(key);
        }
        matches
    }

    // ---- counters ---------------------------------------------------------

    /// INCR with EXPIRE-on-first-increment: the sliding-second rate-limit
    /// primitive. Returns the post-increment value and how many
    /// milliseconds remain until the window resets.
    pub fn incr_with_window(
        &self,
        key: &str,
        window_ms: i64,
        now_ms: i64,
    ) -> (i64, i64) {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner
            .counters
            .entry(key.to_string())
            .and_modify(|c| {
                if now_ms >= c.expires_at_ms {
                    c.value = 0;
                    c.expires_at_ms = now_ms + window_ms;
                }
            })
            .or_insert(Counter {
                value: 0,
                expires_at_ms: now_ms + window_ms,
            });
        counter.value += 1;
        (counter.value, counter.expires_at_ms - now_ms)
    }

    /// Increment a counter only while it stays at or below `max`. Used for
    /// the per-round extension budget, keyed on the fast store so every
    /// server observes the same count.
    pub fn incr_bounded(
        &self,
        key: &str,
        max: i64,
        ttl_ms: i64,
        now_ms: i64,
    ) -> Option<i64> {
        let mut inner = self.inner.lock().unwrap();
        let counter = inner
            .counters
            .entry(key.to_string())
            .and_modify(|c| {
                if now_ms >= c.expires_at_ms {
                    c.value = 0;
                    c.expires_at_ms = now_ms + ttl_ms;
                }
            })
            .or_insert(Counter {
                value: 0,
                expires_at_ms: now_ms + ttl_ms,
            });
        if counter.value >= max {
            return None;
        }
        counter.value += 1;
        Some(counter.value)
    }

    // ---- the bid admission script ----------------------------------------

    /// The three-key admission script: idempotency slot, per-user bid map
    /// and per-auction ranked set observed and updated in one critical
    /// section. Either all keys change or none do.
    pub fn run_bid_script(&self, req: &BidRequest<'_>) -> Admission {
        let mut inner = self.inner.lock().unwrap();
        let slot_key = idem_key(&req.idempotency_key.0);

        if let Some(entry) = inner.strings.get(&slot_key)
            && entry.is_live(req.now_ms)
        {
            if let Some(outcome) = decode_slot(&entry.value) {
                return Admission {
                    outcome,
                    idempotent: true,
                };
            }
            // Unreadable slot: fall through and overwrite it below.
            tracing::warn!(
                key = %req.idempotency_key,
                "discarding undecodable idempotency slot"
            );
        }

        let current = inner
            .user_bids
            .get(req.user_id)
            .and_then(|bids| bids.get(req.auction_id))
            .copied()
            .unwrap_or(0);

        if current == req.amount {
            let outcome = BidOutcome::Same { bet: current };
            inner.strings.insert(
                slot_key,
                Expiring {
                    value: encode_slot(&outcome),
                    expires_at_ms: Some(req.now_ms + IDEMPOTENCY_TTL_MS),
                },
            );
            return Admission {
                outcome,
                idempotent: false,
            };
        }

        // Validation failures are recoverable, so the slot is left free for
        // a corrected retry with the same key.
        if req.amount < current {
            return Admission {
                outcome: BidOutcome::CannotDecrease { current },
                idempotent: false,
            };
        }

        // The caller's stake in this auction is already locked, so raising
        // a bid only needs to cover the difference.
        let actual_available = req.available_balance + current;
        if actual_available < req.amount {
            return Admission {
                outcome: BidOutcome::InsufficientBalance {
                    available: actual_available,
                },
                idempotent: false,
            };
        }

        let ranked = inner.ranked.entry(*req.auction_id).or_default();
        let first_bid_seconds = ranked
            .scores
            .get(req.user_id)
            .map(|score| score_first_bid_seconds(*score))
            .unwrap_or(req.now_ms / 1000);
        ranked.insert(
            req.user_id.clone(),
            encode_score(req.amount, first_bid_seconds),
        );

        inner
            .user_bids
            .entry(req.user_id.clone())
            .or_default()
            .insert(*req.auction_id, req.amount);

        let outcome = BidOutcome::Admitted {
            bet: req.amount,
            previous_bet: current,
            charged: req.amount - current,
        };
        inner.strings.insert(
            slot_key,
            Expiring {
                value: encode_slot(&outcome),
                expires_at_ms: Some(req.now_ms + IDEMPOTENCY_TTL_MS),
            },
        );
        Admission {
            outcome,
            idempotent: false,
        }
    }

    // ---- bid cache reads and settlement writes ---------------------------

    pub fn user_bid(
        &self,
        user_id: &UserId,
        auction_id: &AuctionId,
    ) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner
            .user_bids
            .get(user_id)
            .and_then(|bids| bids.get(auction_id))
            .copied()
    }

    /// Top `n` bidders with their amounts, best first.
    pub fn top_bidders(
        &self,
        auction_id: &AuctionId,
        n: usize,
    ) -> Vec<(UserId, i64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .ranked
            .get(auction_id)
            .map(|ranked| ranked.top(n))
            .unwrap_or_default()
    }

    /// 1-based rank of the user in the auction's ranked set.
    pub fn bid_rank(
        &self,
        auction_id: &AuctionId,
        user_id: &UserId,
    ) -> Option<i64> {
        let inner = self.inner.lock().unwrap();
        inner.ranked.get(auction_id)?.rank_of(user_id)
    }

    pub fn participant_count(&self, auction_id: &AuctionId) -> i64 {
        let inner = self.inner.lock().unwrap();
        inner
            .ranked
            .get(auction_id)
            .map(|ranked| ranked.scores.len() as i64)
            .unwrap_or(0)
    }

    /// Settlement removal of a single winner's bid from both structures.
    pub fn remove_bid(&self, auction_id: &AuctionId, user_id: &UserId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(ranked) = inner.ranked.get_mut(auction_id) {
            ranked.remove(user_id);
        }
        if let Some(bids) = inner.user_bids.get_mut(user_id) {
            bids.remove(auction_id);
        }
    }

    /// Remaining bidders of a finished auction, best ranked first. Does not
    /// mutate; the caller clears the auction once the losers' ledger
    /// records are finalized.
    pub fn remaining_bidders(
        &self,
        auction_id: &AuctionId,
    ) -> Vec<(UserId, i64)> {
        let inner = self.inner.lock().unwrap();
        inner
            .ranked
            .get(auction_id)
            .map(|ranked| ranked.top(ranked.scores.len()))
            .unwrap_or_default()
    }

    /// Drop the auction's ranked set and every per-user entry for it.
    pub fn clear_auction(&self, auction_id: &AuctionId) {
        let mut inner = self.inner.lock().unwrap();
        let users: Vec<UserId> = inner
            .ranked
            .remove(auction_id)
            .map(|ranked| ranked.scores.into_keys().collect())
            .unwrap_or_default();
        for user_id in users {
            if let Some(bids) = inner.user_bids.get_mut(&user_id) {
                bids.remove(auction_id);
                if bids.is_empty() {
                    inner.user_bids.remove(&user_id);
                }
            }
        }
    }

    // ---- pub/sub ----------------------------------------------------------

    /// Publish to a channel. Lagging subscribers miss messages rather than
    /// blocking the publisher, matching fire-and-forget fan-out semantics.
    pub fn publish(&self, channel: &str, payload: String) {
        let sender = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .channels
                .entry(channel.to_string())
                .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
                .clone()
        };
        // No receivers is fine; the message just evaporates.
        let _ = sender.send(payload);
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<String> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    // ---- maintenance -------------------------------------------------------

    /// Reclaim expired strings and counters. Reads already treat expired
    /// entries as absent; this only frees memory.
    pub fn purge_expired(&self, now_ms: i64) {
        let mut inner = self.inner.lock().unwrap();
        inner.strings.retain(|_, entry| entry.is_live(now_ms));
        inner.counters.retain(|_, c| now_ms < c.expires_at_ms);
        inner
            .channels
            .retain(|_, sender| sender.receiver_count() > 0);
    }

    pub fn spawn_sweeper(
        self: &Arc<Self>,
        time_source: TimeSource,
        period: std::time::Duration,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                store.purge_expired(time_source.now_millis());
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use payloads::IdempotencyKey;
    use uuid::Uuid;

    fn auction() -> AuctionId {
        AuctionId(Uuid::new_v4())
    }

    fn user(name: &str) -> UserId {
        UserId(name.to_string())
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
    fn string_ttl_expires() {
        let fast = FastStore::new();
        fast.set_string("k", "v".into(), Some(1_000), 0);
        assert_eq!(fast.get_string("k", 999), Some("v".into()));
        assert_eq!(fast.get_string("k", 1_000), None);
    }

    #[test]
    fn set_nx_respects_live_values_only() {
        let fast = FastStore::new();
        assert!(fast.set_string_nx("lock", "a".into(), 5_000, 0));
        assert!(!fast.set_string_nx("lock", "b".into(), 5_000, 1_000));
        // dead holder's slot is free again
        assert!(fast.set_string_nx("lock", "c".into(), 5_000, 6_000));
    }

    #[test]
    fn compare_and_delete_requires_ownership() {
        let fast = FastStore::new();
        fast.set_string("lock", "token-a".into(), Some(5_000), 0);
        assert!(!fast.compare_and_delete("lock", "token-b", 100));
        assert!(fast.compare_and_delete("lock", "token-a", 100));
        assert!(!fast.compare_and_delete("lock", "token-a", 100));
    }

    #[test]
    fn window_counter_resets() {
        let fast = FastStore::new();
        assert_eq!(fast.incr_with_window("rl", 1_000, 0), (1, 1_000));
        assert_eq!(fast.incr_with_window("rl", 1_000, 400), (2, 600));
        // window lapsed, counter starts over
        assert_eq!(fast.incr_with_window("rl", 1_000, 1_000), (1, 1_000));
    }

    #[test]
    fn bounded_counter_stops_at_max() {
        let fast = FastStore::new();
        assert_eq!(fast.incr_bounded("ext", 2, 60_000, 0), Some(1));
        assert_eq!(fast.incr_bounded("ext", 2, 60_000, 10), Some(2));
        assert_eq!(fast.incr_bounded("ext", 2, 60_000, 20), None);
    }

    #[test]
    fn admission_keeps_map_and_ranked_set_coherent() {
        let fast = FastStore::new();
        let a = auction();
        let (b1, b2) = (user("b1"), user("b2"));
        let (k1, k2) = (
            IdempotencyKey("key-b1-0001".into()),
            IdempotencyKey("key-b2-0001".into()),
        );

        fast.run_bid_script(&request(&b1, &a, &k1, 200, 500, 1_000));
        fast.run_bid_script(&request(&b2, &a, &k2, 300, 500, 2_000));

        // every ranked member has a matching user-map amount
        for (user_id, amount) in fast.top_bidders(&a, 10) {
            assert_eq!(fast.user_bid(&user_id, &a), Some(amount));
        }
        assert_eq!(fast.participant_count(&a), 2);
        assert_eq!(fast.bid_rank(&a, &b2), Some(1));
        assert_eq!(fast.bid_rank(&a, &b1), Some(2));
    }

    #[test]
    fn clear_auction_removes_user_entries() {
        let fast = FastStore::new();
        let a = auction();
        let b1 = user("b1");
        let k1 = IdempotencyKey("key-b1-0002".into());
        fast.run_bid_script(&request(&b1, &a, &k1, 50, 100, 0));

        fast.clear_auction(&a);
        assert_eq!(fast.user_bid(&b1, &a), None);
        assert_eq!(fast.participant_count(&a), 0);
    }

    #[tokio::test]
    async fn publish_reaches_subscriber() {
        let fast = FastStore::new();
        let mut rx = fast.subscribe("auctions:updates");
        fast.publish("auctions:updates", "snapshot".into());
        assert_eq!(rx.recv().await.unwrap(), "snapshot");
    }
}
