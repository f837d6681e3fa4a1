// SPDX-License-Identifier: MIT OR Apache-2.0
//! Work queue with at-least-once leases, plus rate shaping.
//!
//! The consumer pulls [`JobLease`]s from a [`JobQueue`]: each pull hands
//! out the job under a lease that must be [`ack`](JobQueue::ack)ed on a
//! completed attempt (terminal record state, success *or* engine failure)
//! or [`nack`](JobQueue::nack)ed on a transport fault so the queue
//! redelivers. A worker that dies silently is covered by stall reclaim:
//! leases older than the configured grace return to the queue on their
//! own. Delivery is therefore at-least-once, and the orchestrator's
//! idempotency short-circuit absorbs the duplicates.

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod ratelimit;

pub use ratelimit::SlidingWindowRateLimiter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use texd_types::CompileJob;
use tracing::debug;

/// Errors surfaced by queue adapters.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The lease is unknown: expired and reclaimed, or already settled.
    #[error("unknown lease: {0}")]
    UnknownLease(String),

    /// Talking to the queue backend failed.
    #[error("queue transport failure: {0}")]
    Transport(String),
}

/// A leased job: the envelope plus the handle used to settle the attempt.
#[derive(Debug, Clone)]
pub struct JobLease {
    /// Opaque lease handle for `ack` / `nack`.
    pub lease_id: String,
    /// 1-based delivery attempt counter.
    pub attempt: u32,
    /// The job envelope.
    pub job: CompileJob,
}

/// A durable work queue with at-least-once delivery.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Lease the next available job, if any.
    async fn pull(&self) -> Result<Option<JobLease>, QueueError>;

    /// Settle a lease after a completed attempt.
    async fn ack(&self, lease_id: &str) -> Result<(), QueueError>;

    /// Return a lease to the queue for redelivery.
    async fn nack(&self, lease_id: &str) -> Result<(), QueueError>;
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

#[derive(Debug)]
struct PendingEntry {
    job: CompileJob,
    attempt: u32,
}

#[derive(Debug)]
struct LeasedEntry {
    job: CompileJob,
    attempt: u32,
    leased_at: Instant,
}

#[derive(Debug, Default)]
struct QueueInner {
    pending: VecDeque<PendingEntry>,
    leased: HashMap<String, LeasedEntry>,
    lease_seq: u64,
}

/// Snapshot of queue occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Jobs waiting for a worker.
    pub pending: usize,
    /// Jobs currently leased out.
    pub leased: usize,
}

/// In-memory [`JobQueue`] for tests and single-process deployments.
///
/// Redelivery semantics match a durable backend: nacked and stalled
/// leases return to the *front* of the queue with an incremented attempt
/// counter, so a poisoned job is observed again before fresh work.
#[derive(Debug)]
pub struct MemoryJobQueue {
    inner: Mutex<QueueInner>,
    stall_grace: Duration,
}

impl MemoryJobQueue {
    /// Create a queue whose leases expire after `stall_grace`.
    #[must_use]
    pub fn new(stall_grace: Duration) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            stall_grace,
        }
    }

    /// Enqueue a job for delivery.
    pub fn push(&self, job: CompileJob) {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner.pending.push_back(PendingEntry { job, attempt: 0 });
    }

    /// Snapshot of queue occupancy.
    #[must_use]
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock().expect("queue lock poisoned");
        QueueStats {
            pending: inner.pending.len(),
            leased: inner.leased.len(),
        }
    }

    /// Move stalled leases back to the head of the queue.
    fn reclaim_locked(inner: &mut QueueInner, grace: Duration) {
        let now = Instant::now();
        let stalled: Vec<String> = inner
            .leased
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.leased_at) >= grace)
            .map(|(id, _)| id.clone())
            .collect();
        for id in stalled {
            if let Some(entry) = inner.leased.remove(&id) {
                debug!(
                    target: "texd.queue",
                    lease = %id,
                    compilation = %entry.job.compilation_id,
                    "stalled lease reclaimed"
                );
                inner.pending.push_front(PendingEntry {
                    job: entry.job,
                    attempt: entry.attempt,
                });
            }
        }
    }
}

#[async_trait]
impl JobQueue for MemoryJobQueue {
    async fn pull(&self) -> Result<Option<JobLease>, QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        Self::reclaim_locked(&mut inner, self.stall_grace);

        let Some(entry) = inner.pending.pop_front() else {
            return Ok(None);
        };
        inner.lease_seq += 1;
        let lease_id = format!("lease-{}", inner.lease_seq);
        let attempt = entry.attempt + 1;
        inner.leased.insert(
            lease_id.clone(),
            LeasedEntry {
                job: entry.job.clone(),
                attempt,
                leased_at: Instant::now(),
            },
        );
        Ok(Some(JobLease {
            lease_id,
            attempt,
            job: entry.job,
        }))
    }

    async fn ack(&self, lease_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        inner
            .leased
            .remove(lease_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::UnknownLease(lease_id.to_string()))
    }

    async fn nack(&self, lease_id: &str) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().expect("queue lock poisoned");
        let entry = inner
            .leased
            .remove(lease_id)
            .ok_or_else(|| QueueError::UnknownLease(lease_id.to_string()))?;
        inner.pending.push_front(PendingEntry {
            job: entry.job,
            attempt: entry.attempt,
        });
        Ok(())
    }
}
