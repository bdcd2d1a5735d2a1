//! The round processor: start-round and end-round job bodies, idempotent
//! winner settlement, and the anti-snipe extension.
//!
//! ```text
//! PENDING ──[start job]──▶ ACTIVE(round 0)
//! ACTIVE(r) ──[winning bid near the close]──▶ ACTIVE(r), deadline += E
//! ACTIVE(r) ──[end job]──▶ SETTLING(r) ──[settle]──▶
//!     next round exists: ACTIVE(r+1)   otherwise: FINISHED
//! ```
//!
//! Every job body may run more than once (scheduler retries, multiple
//! workers, crashes mid-way). Settlement therefore anchors itself on
//! durable state: the winner rows for a round are written once, guarded by
//! their primary key, and each winner's money movement is gated on the
//! WIN ledger record being newly inserted. Re-runs find the plan already
//! persisted and simply finish whatever steps were missed.

use std::sync::Arc;

use anyhow::Context;
use jiff::{SignedDuration, Timestamp};
use payloads::{
    AuctionId, TransactionStatus, TransactionType, UserId, Winner,
};
use sqlx::PgPool;

use crate::fast::{FastStore, extension_count_key, lock::UserLocks};
use crate::notify::NotificationBus;
use crate::store::{self, auction, jobs, ledger};
use crate::time::TimeSource;

#[derive(Debug, Clone)]
pub struct RoundConfig {
    /// Bids landing within this window of the deadline may extend it.
    pub snipe_threshold: SignedDuration,
    /// How much a single extension adds.
    pub extension: SignedDuration,
    /// Extensions allowed per round.
    pub max_extensions: i64,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            snipe_threshold: SignedDuration::from_secs(10),
            extension: SignedDuration::from_secs(5),
            max_extensions: 5,
        }
    }
}

pub struct RoundProcessor {
    pool: PgPool,
    fast: Arc<FastStore>,
    locks: UserLocks,
    notifier: Arc<NotificationBus>,
    time_source: TimeSource,
    config: RoundConfig,
}

impl RoundProcessor {
    pub fn new(
        pool: PgPool,
        fast: Arc<FastStore>,
        locks: UserLocks,
        notifier: Arc<NotificationBus>,
        time_source: TimeSource,
        config: RoundConfig,
    ) -> Self {
        Self {
            pool,
            fast,
            locks,
            notifier,
            time_source,
            config,
        }
    }

    /// Job dispatch entry point; errors bubble to the scheduler, which
    /// records the failure and retries with backoff.
    #[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
    pub async fn handle_job(&self, job: &jobs::Job) -> anyhow::Result<()> {
        match job.kind {
            jobs::JobKind::StartRound => {
                self.start_round(&job.auction_id).await
            }
            jobs::JobKind::EndRound => {
                self.end_round(&job.auction_id, job.round_num).await
            }
        }
    }

    // ---- start ------------------------------------------------------------

    async fn start_round(&self, auction_id: &AuctionId) -> anyhow::Result<()> {
        let round = auction::get_round(&self.pool, auction_id, 0)
            .await
            .context("reading round 0 config")?;
        let now = self.time_source.now();
        let round_end =
            deadline(now, SignedDuration::from_secs(round.duration_seconds))?;

        if !auction::activate(&self.pool, auction_id, round_end, now).await? {
            tracing::debug!(%auction_id, "start-round fired twice; dropping");
            return Ok(());
        }

        jobs::enqueue(
            &self.pool,
            &jobs::end_round_job_id(auction_id, 0),
            jobs::JobKind::EndRound,
            auction_id,
            0,
            round_end,
            now,
        )
        .await?;

        tracing::info!(%auction_id, %round_end, "auction started");
        self.notifier.notify_auction_update(*auction_id);
        Ok(())
    }

    // ---- settle -----------------------------------------------------------

    async fn end_round(
        &self,
        auction_id: &AuctionId,
        round_num: i64,
    ) -> anyhow::Result<()> {
        let now = self.time_source.now();
        if !auction::begin_settling(&self.pool, auction_id, round_num, now)
            .await?
        {
            let auction_row =
                auction::read_auction(&self.pool, auction_id).await?;
            // A crash between enqueueing the next round's end job and
            // advancing the state can deliver this event a beat early;
            // fail so the scheduler retries it after the advance lands.
            if auction_row.current_round < round_num
                && auction_row.state != payloads::AuctionState::Finished
                && auction_row.state != payloads::AuctionState::Cancelled
            {
                anyhow::bail!(
                    "end-round for round {round_num} arrived before the \
                     auction advanced to it"
                );
            }
            tracing::debug!(
                %auction_id,
                round_num,
                "end-round fired for a past round; dropping"
            );
            return Ok(());
        }

        let auction_row =
            auction::read_auction(&self.pool, auction_id).await?;
        let round =
            auction::get_round(&self.pool, auction_id, round_num).await?;

        // The settlement plan: computed from the ranked set exactly once,
        // then durable. Re-runs resume from the persisted rows even though
        // settled bids are already gone from the fast cache.
        let plan = self.settlement_plan(&auction_row, &round).await?;

        let no_bidders = plan.iter().all(|w| w.place == 0);
        if no_bidders {
            self.refund_author(
                &auction_row,
                round_num,
                round.prizes.iter().sum(),
                ledger::no_bidders_refund_op_id(
                    auction_id,
                    &auction_row.author_id,
                    round_num,
                ),
            )
            .await?;
        } else {
            self.settle_winners(&auction_row, round_num, &plan).await?;

            let claimed: i64 = plan.iter().map(|w| w.prize).sum();
            let unclaimed: i64 =
                round.prizes.iter().sum::<i64>() - claimed;
            if unclaimed > 0 {
                self.refund_author(
                    &auction_row,
                    round_num,
                    unclaimed,
                    ledger::unclaimed_refund_op_id(
                        auction_id,
                        &auction_row.author_id,
                        round_num,
                    ),
                )
                .await?;
            }
        }

        self.advance_or_finish(&auction_row, round_num).await?;
        self.notifier.notify_auction_update(*auction_id);
        Ok(())
    }

    /// The winner rows for this round, computing and persisting them on
    /// first call. The primary key on `(auction, round, place)` makes the
    /// write race-free; the pre-read keeps re-runs stable.
    async fn settlement_plan(
        &self,
        auction_row: &auction::Auction,
        round: &auction::AuctionRound,
    ) -> anyhow::Result<Vec<Winner>> {
        let existing = auction::list_round_winners(
            &self.pool,
            &auction_row.id,
            round.round_num,
        )
        .await?;
        if !existing.is_empty() {
            tracing::info!(
                auction_id = %auction_row.id,
                round_num = round.round_num,
                "resuming settlement from persisted winners"
            );
            return Ok(existing);
        }

        let top = self
            .fast
            .top_bidders(&auction_row.id, round.prizes.len());
        let plan: Vec<Winner> = if top.is_empty() {
            vec![Winner {
                round_num: round.round_num,
                place: 0,
                user_id: auction_row.author_id.clone(),
                stars: 0,
                prize: round.prizes.iter().sum(),
            }]
        } else {
            top.into_iter()
                .enumerate()
                .map(|(i, (user_id, stars))| Winner {
                    round_num: round.round_num,
                    place: i as i64 + 1,
                    user_id,
                    stars,
                    prize: round.prizes[i],
                })
                .collect()
        };

        let mut tx = self.pool.begin().await.map_err(store::StoreError::from)?;
        auction::insert_winners_tx(
            &auction_row.id,
            &plan,
            self.time_source.now(),
            &mut tx,
        )
        .await?;
        tx.commit().await.map_err(store::StoreError::from)?;
        Ok(plan)
    }

    /// Settle every winner in parallel, each under their own user lock.
    /// Any single failure fails the job; completed winners are durable and
    /// skipped by the retry.
    async fn settle_winners(
        &self,
        auction_row: &auction::Auction,
        round_num: i64,
        plan: &[Winner],
    ) -> anyhow::Result<()> {
        let mut tasks = tokio::task::JoinSet::new();
        for winner in plan.iter().filter(|w| w.place > 0).cloned() {
            let pool = self.pool.clone();
            let fast = Arc::clone(&self.fast);
            let locks = self.locks.clone();
            let time_source = self.time_source.clone();
            let auction_id = auction_row.id;
            let gift_name = auction_row.gift_name.clone();
            tasks.spawn(async move {
                settle_one_winner(
                    &pool,
                    &fast,
                    &locks,
                    &time_source,
                    &auction_id,
                    &gift_name,
                    round_num,
                    &winner,
                )
                .await
            });
        }

        let mut first_error: Option<anyhow::Error> = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(join_error) => {
                    first_error
                        .get_or_insert(anyhow::Error::from(join_error));
                }
            }
        }
        match first_error {
            // Partial winner settlement: fail the job so the scheduler
            // retries; already-settled winners are gated by their op-ids.
            Some(e) => Err(e.context("partial winner settlement failure")),
            None => Ok(()),
        }
    }

    /// Return `count` gifts to the author, gated on the refund record
    /// being newly written.
    async fn refund_author(
        &self,
        auction_row: &auction::Auction,
        round_num: i64,
        count: i64,
        op_id: String,
    ) -> anyhow::Result<()> {
        let now = self.time_source.now();
        let mut tx = self.pool.begin().await.map_err(store::StoreError::from)?;
        let inserted = ledger::insert_record_tx(
            &op_id,
            TransactionType::Refund,
            TransactionStatus::Refunded,
            &auction_row.author_id,
            &auction_row.id,
            round_num,
            count,
            0,
            0,
            now,
            &mut tx,
        )
        .await?;
        if inserted {
            store::credit_gifts_tx(
                &auction_row.author_id,
                &auction_row.gift_name,
                count,
                now,
                &mut tx,
            )
            .await?;
            tracing::info!(
                auction_id = %auction_row.id,
                round_num,
                %op_id,
                gifts = count,
                "refunded prizes to author"
            );
        }
        tx.commit().await.map_err(store::StoreError::from)?;
        Ok(())
    }

    /// Step the state machine after a settled round: next round or finish.
    async fn advance_or_finish(
        &self,
        auction_row: &auction::Auction,
        round_num: i64,
    ) -> anyhow::Result<()> {
        let auction_id = &auction_row.id;
        let total_rounds =
            auction::count_rounds(&self.pool, auction_id).await?;
        let now = self.time_source.now();

        if round_num + 1 < total_rounds {
            let next =
                auction::get_round(&self.pool, auction_id, round_num + 1)
                    .await?;
            let round_end = deadline(
                now,
                SignedDuration::from_secs(next.duration_seconds),
            )?;
            // Enqueue before advancing: if we crash in between, the retry
            // still matches the settling predicate and advances; the
            // duplicate enqueue is a no-op.
            jobs::enqueue(
                &self.pool,
                &jobs::end_round_job_id(auction_id, round_num + 1),
                jobs::JobKind::EndRound,
                auction_id,
                round_num + 1,
                round_end,
                now,
            )
            .await?;
            auction::advance_round(
                &self.pool,
                auction_id,
                round_num + 1,
                round_end,
                now,
            )
            .await?;
            tracing::info!(
                %auction_id,
                round_num = round_num + 1,
                %round_end,
                "advanced to next round"
            );
            return Ok(());
        }

        // Last round: everyone still in the cache lost. Finalize their
        // ledger records before clearing, so a crash in between leaves
        // records ACTIVE (retried later) rather than orphaned.
        let losers = self.fast.remaining_bidders(auction_id);
        for (user_id, _) in &losers {
            let mut tx =
                self.pool.begin().await.map_err(store::StoreError::from)?;
            ledger::finalize_bid_records_tx(
                user_id,
                auction_id,
                TransactionStatus::Lost,
                &mut tx,
            )
            .await?;
            tx.commit().await.map_err(store::StoreError::from)?;
        }
        self.fast.clear_auction(auction_id);
        auction::finish(&self.pool, auction_id, now).await?;
        tracing::info!(%auction_id, losers = losers.len(), "auction finished");
        Ok(())
    }

    // ---- anti-snipe -------------------------------------------------------

    /// Post-bid hook: if the admitted bid landed inside the snipe window
    /// and ranks among the prize slots, try to extend the round. The
    /// pre-bid `round_end_at` snapshot is fine here; `extend_round`
    /// recomputes real remaining time from the job row.
    pub async fn maybe_extend_after_bid(
        &self,
        auction_row: &auction::Auction,
        user_id: &UserId,
    ) -> bool {
        let Some(round_end) = auction_row.round_end_at else {
            return false;
        };
        let remaining_ms = round_end.as_millisecond()
            - self.time_source.now_millis();
        if remaining_ms <= 0
            || remaining_ms > self.config.snipe_threshold.as_millis() as i64
        {
            return false;
        }

        let round_num = auction_row.current_round;
        let prize_slots = match auction::get_round(
            &self.pool,
            &auction_row.id,
            round_num,
        )
        .await
        {
            Ok(round) => round.prizes.len() as i64,
            Err(e) => {
                crate::telemetry::log_error(e);
                return false;
            }
        };
        match self.fast.bid_rank(&auction_row.id, user_id) {
            Some(rank) if rank <= prize_slots => {}
            _ => return false,
        }

        match self.extend_round(&auction_row.id, round_num).await {
            Ok(extended) => extended,
            Err(e) => {
                crate::telemetry::log_error(e);
                false
            }
        }
    }

    /// Push the round's end out by the configured extension, at most
    /// `max_extensions` times per round.
    ///
    /// The real remaining time comes from the pending end job, not the
    /// auction row: two requests racing on the same stale `round_end_at`
    /// snapshot would otherwise both extend.
    #[tracing::instrument(skip(self))]
    pub async fn extend_round(
        &self,
        auction_id: &AuctionId,
        round_num: i64,
    ) -> anyhow::Result<bool> {
        let job_id = jobs::end_round_job_id(auction_id, round_num);
        let job = match jobs::get(&self.pool, &job_id).await {
            Ok(job) => job,
            Err(store::StoreError::JobNotFound) => return Ok(false),
            Err(e) => return Err(e.into()),
        };

        let now = self.time_source.now();
        let remaining_ms = job.run_at.as_millisecond() - now.as_millisecond();
        if remaining_ms <= 0 {
            return Ok(false);
        }
        // someone else already extended past the window
        if remaining_ms > self.config.snipe_threshold.as_millis() as i64 {
            return Ok(false);
        }

        // Shared extension budget, TTL sized to outlive the latest
        // possible deadline of this round.
        let extension_ms = self.config.extension.as_millis() as i64;
        let counter_ttl_ms = remaining_ms
            + extension_ms * self.config.max_extensions
            + 60_000;
        if self
            .fast
            .incr_bounded(
                &extension_count_key(auction_id, round_num),
                self.config.max_extensions,
                counter_ttl_ms,
                now.as_millisecond(),
            )
            .is_none()
        {
            return Ok(false);
        }

        let new_run_at = deadline(
            now,
            SignedDuration::from_millis(remaining_ms + extension_ms),
        )?;
        if !jobs::reschedule(&self.pool, &job_id, new_run_at).await? {
            return Ok(false);
        }
        auction::set_round_end(&self.pool, auction_id, new_run_at, now)
            .await?;
        tracing::info!(
            %auction_id,
            round_num,
            %new_run_at,
            "anti-snipe extension applied"
        );
        Ok(true)
    }
}

fn deadline(
    now: Timestamp,
    duration: SignedDuration,
) -> anyhow::Result<Timestamp> {
    now.checked_add(duration).context("computing round deadline")
}

/// One winner's settlement: WIN record, star debit, gift credit and record
/// finalization in a single transaction, gated on the WIN record being new;
/// then the cache removal, which is idempotent on its own.
#[allow(clippy::too_many_arguments)]
async fn settle_one_winner(
    pool: &PgPool,
    fast: &FastStore,
    locks: &UserLocks,
    time_source: &TimeSource,
    auction_id: &AuctionId,
    gift_name: &str,
    round_num: i64,
    winner: &Winner,
) -> anyhow::Result<()> {
    let op_id =
        ledger::win_op_id(auction_id, &winner.user_id, round_num, winner.place);

    let settled: Result<(), store::StoreError> = locks
        .with_user_lock(&winner.user_id, || async {
            let now = time_source.now();
            let mut tx = pool.begin().await?;
            let inserted = ledger::insert_record_tx(
                &op_id,
                TransactionType::Win,
                TransactionStatus::Won,
                &winner.user_id,
                auction_id,
                round_num,
                winner.prize,
                0,
                0,
                now,
                &mut tx,
            )
            .await?;
            if inserted {
                store::debit_stars_tx(
                    &winner.user_id,
                    winner.stars,
                    now,
                    &mut tx,
                )
                .await?;
                store::credit_gifts_tx(
                    &winner.user_id,
                    gift_name,
                    winner.prize,
                    now,
                    &mut tx,
                )
                .await?;
                ledger::finalize_bid_records_tx(
                    &winner.user_id,
                    auction_id,
                    TransactionStatus::Won,
                    &mut tx,
                )
                .await?;
            }
            tx.commit().await?;
            if inserted {
                tracing::info!(
                    %op_id,
                    user_id = %winner.user_id,
                    stars = winner.stars,
                    prize = winner.prize,
                    "settled winner"
                );
            }
            Ok(())
        })
        .await
        .context("acquiring winner's user lock")?;
    settled?;

    fast.remove_bid(auction_id, &winner.user_id);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_matches_documented_thresholds() {
        let config = RoundConfig::default();
        assert_eq!(config.snipe_threshold.as_secs(), 10);
        assert_eq!(config.extension.as_secs(), 5);
        assert_eq!(config.max_extensions, 5);
    }

    #[test]
    fn deadline_adds_duration() {
        let now = Timestamp::UNIX_EPOCH;
        let end = deadline(now, SignedDuration::from_secs(30)).unwrap();
        assert_eq!(end.as_second() - now.as_second(), 30);
    }

    #[test]
    fn plan_prize_split_covers_every_configured_prize() {
        // claimed + unclaimed always covers the configured prizes
        let prizes = [3i64, 2, 1];
        for bidders in 0..=3usize {
            let claimed: i64 = prizes.iter().take(bidders).sum();
            let unclaimed: i64 = prizes.iter().skip(bidders).sum();
            assert_eq!(claimed + unclaimed, 6);
        }
    }
}
