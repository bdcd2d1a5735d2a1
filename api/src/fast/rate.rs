//! Sliding-window request counters on the fast store.
//!
//! INCR with EXPIRE-on-first-increment per `(prefix, user)`. Rejections
//! carry how long the caller should wait; the API layer turns that into
//! the standard rate-limit headers. Tunable freely; correctness never
//! depends on it.

use std::sync::Arc;

use payloads::UserId;

use super::{FastStore, rate_key};

#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
    pub prefix: &'static str,
    pub limit: i64,
    pub window_ms: i64,
}

/// Bid admission attempts per user.
pub const BID: RateLimit = RateLimit {
    prefix: "bid",
    limit: 5,
    window_ms: 1_000,
};

/// Auction creations per user.
pub const CREATE_AUCTION: RateLimit = RateLimit {
    prefix: "create",
    limit: 3,
    window_ms: 60_000,
};

/// Read endpoints per user.
pub const READ: RateLimit = RateLimit {
    prefix: "read",
    limit: 20,
    window_ms: 1_000,
};

/// A rejected request: how many requests the window allows and how long
/// until it resets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateExceeded {
    pub limit: i64,
    pub retry_after_seconds: i64,
}

#[derive(Clone)]
pub struct RateLimiter {
    fast: Arc<FastStore>,
}

impl RateLimiter {
    pub fn new(fast: Arc<FastStore>) -> Self {
        Self { fast }
    }

    pub fn check(
        &self,
        limit: &RateLimit,
        user_id: &UserId,
        now_ms: i64,
    ) -> Result<(), RateExceeded> {
        let key = rate_key(limit.prefix, user_id);
        let (count, resets_in_ms) =
            self.fast.incr_with_window(&key, limit.window_ms, now_ms);
        if count > limit.limit {
            return Err(RateExceeded {
                limit: limit.limit,
                // round up so "retry after" is never zero seconds
                retry_after_seconds: (resets_in_ms + 999) / 1000,
            });
        }
        Ok(())
    }
}
