// SPDX-License-Identifier: MIT OR Apache-2.0
//! Consumer loop behavior: dispatch, lease settlement, idempotent
//! redelivery, and graceful shutdown.

mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use texd_queue::{JobQueue, MemoryJobQueue};
use texd_runtime::{Consumer, ConsumerConfig};
use texd_store::RecordStore;
use texd_types::CompileStatus;

fn consumer_config() -> ConsumerConfig {
    ConsumerConfig {
        concurrency: 3,
        rate_limit_max: 100,
        rate_limit_window: Duration::from_secs(60),
        shutdown_grace: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
        error_backoff: Duration::from_millis(10),
    }
}

fn queue() -> Arc<MemoryJobQueue> {
    Arc::new(MemoryJobQueue::new(Duration::from_secs(300)))
}

async fn terminal_status(h: &Harness, id: &str) -> Option<CompileStatus> {
    h.records
        .compilation(id)
        .await
        .unwrap()
        .map(|r| r.status)
        .filter(CompileStatus::is_terminal)
}

/// Poll the record store until `id` reaches `want` or `timeout` elapses.
async fn wait_for_terminal(
    h: &Harness,
    id: &str,
    want: CompileStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if terminal_status(h, id).await == Some(want) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

fn spawn_consumer(
    q: &Arc<MemoryJobQueue>,
    h: &Harness,
    config: ConsumerConfig,
) -> (
    texd_sandbox::CancelToken,
    tokio::task::JoinHandle<()>,
) {
    let consumer = Arc::new(Consumer::new(
        Arc::clone(q) as Arc<dyn JobQueue>,
        h.orchestrator.clone(),
        config,
    ));
    let shutdown = consumer.shutdown_token();
    let runner = tokio::spawn(async move { consumer.run().await });
    (shutdown, runner)
}

#[tokio::test]
async fn consumer_drains_jobs_to_terminal_states() {
    let h = Harness::new(success_script());
    let q = queue();
    for id in ["c-1", "c-2", "c-3"] {
        h.enqueue_record(id);
        q.push(simple_job(id));
    }

    let (shutdown, runner) = spawn_consumer(&q, &h, consumer_config());

    for id in ["c-1", "c-2", "c-3"] {
        let done =
            wait_for_terminal(&h, id, CompileStatus::Success, Duration::from_secs(5)).await;
        assert!(done, "{id} never reached success");
    }

    shutdown.cancel();
    runner.await.unwrap();
    assert_eq!(q.stats().pending, 0);
    assert_eq!(q.stats().leased, 0);
    assert_eq!(h.workspace_count(), 0);
}

#[tokio::test]
async fn duplicate_delivery_compiles_once() {
    let h = Harness::new(success_script());
    let q = queue();
    h.enqueue_record("c-dup");
    q.push(simple_job("c-dup"));
    q.push(simple_job("c-dup"));

    // One at a time so the second delivery observes the first's terminal
    // record.
    let config = ConsumerConfig {
        concurrency: 1,
        ..consumer_config()
    };
    let (shutdown, runner) = spawn_consumer(&q, &h, config);

    let settled = wait_for(
        || q.stats().pending == 0 && q.stats().leased == 0,
        Duration::from_secs(5),
    )
    .await;
    assert!(settled, "both deliveries should settle");

    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(h.sandbox.executions(), 1);
    assert_eq!(h.records.terminal_patches_for("c-dup").len(), 1);
}

#[tokio::test]
async fn transport_fault_is_redelivered_until_the_store_recovers() {
    let h = Harness::new(success_script());
    let q = queue();
    h.enqueue_record("c-flaky");
    q.push(simple_job("c-flaky"));
    h.records.set_offline(true);

    let (shutdown, runner) = spawn_consumer(&q, &h, consumer_config());

    // Let at least one failed attempt cycle through nack/redeliver.
    tokio::time::sleep(Duration::from_millis(100)).await;
    h.records.set_offline(false);

    let done =
        wait_for_terminal(&h, "c-flaky", CompileStatus::Success, Duration::from_secs(5)).await;
    assert!(done, "job should succeed once the store recovers");

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn shutdown_grace_expiry_times_out_inflight_jobs() {
    let h = Harness::with_deadline(SandboxScript::Hang, Duration::from_secs(600));
    let q = queue();
    h.enqueue_record("c-hang");
    q.push(simple_job("c-hang"));

    let config = ConsumerConfig {
        shutdown_grace: Duration::from_millis(100),
        ..consumer_config()
    };
    let (shutdown, runner) = spawn_consumer(&q, &h, config);

    // Wait until the job is leased and running, then pull the plug.
    let leased = wait_for(|| q.stats().leased == 1, Duration::from_secs(5)).await;
    assert!(leased, "job should be in flight");
    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(
        terminal_status(&h, "c-hang").await,
        Some(CompileStatus::Timeout)
    );
    assert_eq!(h.workspace_count(), 0);
}

#[tokio::test]
async fn shutdown_with_empty_queue_stops_promptly() {
    let h = Harness::new(success_script());
    let q = queue();
    let (shutdown, runner) = spawn_consumer(&q, &h, consumer_config());

    tokio::time::sleep(Duration::from_millis(30)).await;
    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("consumer should stop within the timeout")
        .unwrap();
}
