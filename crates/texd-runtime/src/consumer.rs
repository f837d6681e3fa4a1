// SPDX-License-Identifier: MIT OR Apache-2.0
//! Queue consumption with bounded concurrency and rate shaping.

use crate::orchestrator::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use texd_config::QueueConfig;
use texd_queue::{JobQueue, SlidingWindowRateLimiter};
use texd_sandbox::CancelToken;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

/// Tuning knobs for the [`Consumer`] loop.
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    /// Maximum jobs in flight.
    pub concurrency: usize,
    /// Sliding-window cap on job starts.
    pub rate_limit_max: u32,
    /// Sliding-window length.
    pub rate_limit_window: Duration,
    /// How long in-flight jobs get to finish after shutdown.
    pub shutdown_grace: Duration,
    /// Sleep between empty polls.
    pub poll_interval: Duration,
    /// Sleep after a queue transport fault.
    pub error_backoff: Duration,
}

impl ConsumerConfig {
    /// Derive consumer tuning from the queue config section.
    #[must_use]
    pub fn from_queue_config(config: &QueueConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            rate_limit_max: config.rate_limit_max,
            rate_limit_window: config.rate_limit_window(),
            shutdown_grace: config.shutdown_grace(),
            poll_interval: Duration::from_millis(250),
            error_backoff: Duration::from_secs(2),
        }
    }
}

/// Pulls jobs and dispatches them to the orchestrator.
///
/// Lease settlement policy: an attempt that reached a terminal record
/// state (success, engine failure, or timeout) is acked. Only
/// transport-class faults nack the lease so the queue redelivers; the
/// orchestrator's idempotency short-circuit absorbs any duplicate that
/// raced a completed attempt.
pub struct Consumer {
    queue: Arc<dyn JobQueue>,
    orchestrator: Arc<Orchestrator>,
    config: ConsumerConfig,
    shutdown: CancelToken,
    hard_stop: CancelToken,
}

impl Consumer {
    /// Create a consumer over `queue` dispatching to `orchestrator`.
    #[must_use]
    pub fn new(
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            queue,
            orchestrator,
            config,
            shutdown: CancelToken::new(),
            hard_stop: CancelToken::new(),
        }
    }

    /// Token that stops the polling loop; cancel it on SIGTERM/SIGINT.
    /// In-flight jobs keep running until the shutdown grace expires.
    #[must_use]
    pub fn shutdown_token(&self) -> CancelToken {
        self.shutdown.clone()
    }

    /// Run until shutdown, then drain in-flight jobs.
    ///
    /// Jobs still running when the grace period expires have their
    /// sandboxes cancelled (killed), which finalizes them as timeouts.
    pub async fn run(&self) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let rate = SlidingWindowRateLimiter::new(
            self.config.rate_limit_max,
            self.config.rate_limit_window,
        );
        let mut tasks: JoinSet<()> = JoinSet::new();

        info!(
            target: "texd.consumer",
            concurrency = self.config.concurrency,
            rate_max = self.config.rate_limit_max,
            "consumer started"
        );

        loop {
            // A free worker slot gates the next pull, so leases are only
            // taken when a task can actually start.
            let permit = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&semaphore).acquire_owned() => {
                    permit.expect("semaphore never closes")
                }
            };

            // Reap finished tasks so the join set stays small.
            while tasks.try_join_next().is_some() {}

            let lease = match self.queue.pull().await {
                Ok(Some(lease)) => lease,
                Ok(None) => {
                    drop(permit);
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                    }
                    continue;
                }
                Err(e) => {
                    drop(permit);
                    warn!(target: "texd.consumer", error = %e, "queue pull failed, backing off");
                    tokio::select! {
                        biased;
                        () = self.shutdown.cancelled() => break,
                        () = tokio::time::sleep(self.config.error_backoff) => {}
                    }
                    continue;
                }
            };

            // Rate-shape job starts. A shutdown while waiting surrenders
            // the lease untouched.
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    if let Err(e) = self.queue.nack(&lease.lease_id).await {
                        warn!(target: "texd.consumer", error = %e, "nack during shutdown failed");
                    }
                    drop(permit);
                    break;
                }
                () = rate.acquire() => {}
            }

            debug!(
                target: "texd.consumer",
                compilation = %lease.job.compilation_id,
                attempt = lease.attempt,
                "job dispatched"
            );
            let queue = Arc::clone(&self.queue);
            let orchestrator = Arc::clone(&self.orchestrator);
            let hard_stop = self.hard_stop.clone();
            tasks.spawn(async move {
                let id = lease.job.compilation_id.clone();
                match orchestrator.run_job(&lease.job, &hard_stop).await {
                    Ok(outcome) => {
                        debug!(target: "texd.consumer", compilation = %id, ?outcome, "attempt completed");
                        if let Err(e) = queue.ack(&lease.lease_id).await {
                            warn!(target: "texd.consumer", compilation = %id, error = %e, "ack failed");
                        }
                    }
                    Err(e) => {
                        warn!(
                            target: "texd.consumer",
                            compilation = %id,
                            error = %e,
                            "transport fault, surrendering attempt for redelivery"
                        );
                        if let Err(e) = queue.nack(&lease.lease_id).await {
                            warn!(target: "texd.consumer", compilation = %id, error = %e, "nack failed");
                        }
                    }
                }
                drop(permit);
            });
        }

        info!(
            target: "texd.consumer",
            in_flight = tasks.len(),
            "shutting down, draining in-flight jobs"
        );
        let drained = tokio::time::timeout(self.config.shutdown_grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(
                target: "texd.consumer",
                "shutdown grace expired, cancelling remaining sandboxes"
            );
            self.hard_stop.cancel();
            // Cancelled sandboxes finalize their jobs as timeouts; give
            // them a moment to settle the records, then cut losses.
            let settled = tokio::time::timeout(Duration::from_secs(10), async {
                while tasks.join_next().await.is_some() {}
            })
            .await;
            if settled.is_err() {
                tasks.abort_all();
            }
        }
        info!(target: "texd.consumer", "consumer stopped");
    }
}
