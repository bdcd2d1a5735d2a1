//! Drains the durable job table and dispatches round lifecycle events.
//!
//! A tick loop claims due jobs (each claim holds a transaction-scoped
//! advisory lock) and hands them to a bounded pool of workers. Multiple
//! schedulers may run concurrently, on one server or many; correctness
//! comes from idempotent job bodies and deterministic job ids, not from
//! there being a single worker.

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::Semaphore;

use crate::rounds::RoundProcessor;
use crate::store::jobs;
use crate::telemetry::log_error;
use crate::time::TimeSource;

pub const DEFAULT_WORKER_CONCURRENCY: usize = 50;

pub struct Scheduler {
    pool: PgPool,
    processor: Arc<RoundProcessor>,
    time_source: TimeSource,
    tick_interval: Duration,
    worker_concurrency: usize,
}

impl Scheduler {
    pub fn new(
        pool: PgPool,
        processor: Arc<RoundProcessor>,
        time_source: TimeSource,
        tick_interval: Duration,
        worker_concurrency: usize,
    ) -> Self {
        Self {
            pool,
            processor,
            time_source,
            tick_interval,
            worker_concurrency,
        }
    }

    pub async fn run(&self) {
        let workers = Arc::new(Semaphore::new(self.worker_concurrency));
        let mut interval = tokio::time::interval(self.tick_interval);
        loop {
            interval.tick().await;
            if let Err(e) = self.dispatch_due_jobs(&workers).await {
                log_error(e);
            }
        }
    }

    /// Claim and dispatch every currently-due job, bounded by the worker
    /// pool. Returns once no claimable job remains; jobs still running
    /// keep their permits and advisory locks until they finish.
    async fn dispatch_due_jobs(
        &self,
        workers: &Arc<Semaphore>,
    ) -> anyhow::Result<()> {
        loop {
            let permit = Arc::clone(workers)
                .acquire_owned()
                .await
                .expect("worker semaphore never closes");

            let Some(claimed) =
                jobs::claim_next_due(&self.pool, self.time_source.now())
                    .await?
            else {
                return Ok(());
            };

            let pool = self.pool.clone();
            let processor = Arc::clone(&self.processor);
            let time_source = self.time_source.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let jobs::ClaimedJob {
                    job,
                    coordination_tx,
                } = claimed;

                match processor.handle_job(&job).await {
                    Ok(()) => {
                        if let Err(e) = jobs::complete(&pool, &job.id).await {
                            log_error(e);
                        }
                    }
                    Err(e) => {
                        tracing::error!(
                            job_id = %job.id,
                            "job failed, will retry with backoff: {e:#}"
                        );
                        // Record the failure before releasing the advisory
                        // lock so another worker cannot re-claim the job
                        // without the backoff applied.
                        if let Err(e) = jobs::record_failure(
                            &pool,
                            &job.id,
                            time_source.now(),
                        )
                        .await
                        {
                            log_error(e);
                        }
                    }
                }

                // Commit the coordination transaction to release the lock.
                if let Err(e) = coordination_tx.commit().await {
                    log_error(e);
                }
            });
        }
    }
}
