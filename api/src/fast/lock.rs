//! Per-user distributed mutex on the fast store.
//!
//! One slot per user id, acquired with set-if-absent + TTL and released
//! with a compare-and-delete on an owner token. The TTL caps how long a
//! crashed holder can block the user; the retry budget caps how long a
//! request waits before surfacing a transient too-many-requests condition.
//!
//! The lock serializes every balance-touching operation of one user: bid
//! admission, settlement debits, and any future multi-record move. It is a
//! correctness device; the rate limiter is the politeness device.

use std::sync::Arc;
use std::time::Duration;

use payloads::UserId;
use rand::Rng;
use uuid::Uuid;

use super::{FastStore, user_lock_key};
use crate::time::TimeSource;

/// Dead-holder cap.
pub const LOCK_TTL_MS: i64 = 5_000;

const RETRY_BASE_DELAY_MS: u64 = 20;
const RETRY_JITTER_MS: u64 = 20;
/// ~500 retries at 20-40ms each gives up after roughly 15 seconds.
const MAX_ATTEMPTS: u32 = 500;

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("could not acquire user lock within the retry budget")]
    Contended,
}

#[derive(Clone)]
pub struct UserLocks {
    fast: Arc<FastStore>,
    time_source: TimeSource,
}

impl UserLocks {
    pub fn new(fast: Arc<FastStore>, time_source: TimeSource) -> Self {
        Self { fast, time_source }
    }

    /// Acquire the user's lock, run `body`, release. The lock is held
    /// across `body`'s await points, so bodies must only perform the work
    /// that actually needs the user serialized.
    pub async fn with_user_lock<T, F, Fut>(
        &self,
        user_id: &UserId,
        body: F,
    ) -> Result<T, LockError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = user_lock_key(user_id);
        let token = Uuid::new_v4().to_string();

        let mut acquired = false;
        for _ in 0..MAX_ATTEMPTS {
            if self.fast.set_string_nx(
                &key,
                token.clone(),
                LOCK_TTL_MS,
                self.time_source.now_millis(),
            ) {
                acquired = true;
                break;
            }
            let jitter = rand::rng().random_range(0..=RETRY_JITTER_MS);
            tokio::time::sleep(Duration::from_millis(
                RETRY_BASE_DELAY_MS + jitter,
            ))
            .await;
        }
        if !acquired {
            tracing::warn!(%user_id, "user lock contended past retry budget");
            return Err(LockError::Contended);
        }

        let result = body().await;

        // Compare-and-delete: if the TTL lapsed mid-body and someone else
        // took the slot, leave their lock alone.
        if !self.fast.compare_and_delete(
            &key,
            &token,
            self.time_source.now_millis(),
        ) {
            tracing::warn!(%user_id, "user lock expired before release");
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI64, Ordering};

    fn locks() -> UserLocks {
        let fast = Arc::new(FastStore::new());
        let time_source = TimeSource::new(jiff::Timestamp::UNIX_EPOCH);
        UserLocks::new(fast, time_source)
    }

    #[tokio::test]
    async fn lock_serializes_same_user() {
        let locks = locks();
        let user_id = UserId("alice".into());
        let counter = Arc::new(AtomicI64::new(0));

        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let user_id = user_id.clone();
            let counter = Arc::clone(&counter);
            tasks.spawn(async move {
                locks
                    .with_user_lock(&user_id, || async {
                        // read-modify-write with an await between: only
                        // mutual exclusion keeps this lossless
                        let seen = counter.load(Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(2)).await;
                        counter.store(seen + 1, Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            });
        }
        tasks.join_all().await;
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn body_result_is_returned() {
        let locks = locks();
        let user_id = UserId("bob".into());
        let value = locks
            .with_user_lock(&user_id, || async { 41 + 1 })
            .await
            .unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn expired_holder_does_not_block() {
        let fast = Arc::new(FastStore::new());
        let time_source = TimeSource::new(jiff::Timestamp::UNIX_EPOCH);
        let locks =
            UserLocks::new(Arc::clone(&fast), time_source.clone());
        let user_id = UserId("carol".into());

        // simulate a crashed holder whose TTL has already lapsed
        fast.set_string_nx(
            &user_lock_key(&user_id),
            "dead-token".into(),
            LOCK_TTL_MS,
            time_source.now_millis(),
        );
        time_source.advance(jiff::Span::new().seconds(6));

        let value = locks
            .with_user_lock(&user_id, || async { "ran" })
            .await
            .unwrap();
        assert_eq!(value, "ran");
    }
}
