// SPDX-License-Identifier: MIT OR Apache-2.0
//! texd worker daemon.
//!
//! Loads configuration, wires the adapters (blob store, record store,
//! log bus, Docker sandbox executor, work queue), and runs the consumer
//! until SIGINT/SIGTERM, draining in-flight builds under the configured
//! grace period.
//!
//! Job arrival is an external concern: the enqueuer writes the queued
//! compilation row and hands the envelope to the queue backend, and the
//! worker only ever sees it through the [`JobQueue`] trait. This binary
//! wires the in-process queue implementation; a deployment substitutes
//! its durable backend at the same seam.

#![deny(unsafe_code)]

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use texd_bus::LogBus;
use texd_config::TexdConfig;
use texd_queue::{JobQueue, MemoryJobQueue};
use texd_runtime::{Consumer, ConsumerConfig, Orchestrator};
use texd_sandbox::{DockerExecutor, SandboxExecutor};
use texd_store::{BlobStore, FsBlobStore, MemoryRecordStore, RecordStore};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "texd", version, about = "Sandboxed LaTeX compilation service")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(long, default_value = "texd.toml")]
    config: PathBuf,

    /// Parent directory for compilation workspaces (defaults to the
    /// system temp directory).
    #[arg(long)]
    workspace_dir: Option<PathBuf>,

    /// Enable debug logging regardless of the configured level.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (config, warnings) = TexdConfig::load(&args.config)
        .with_context(|| format!("load config {}", args.config.display()))?;

    let level = if args.debug {
        "texd=debug".to_string()
    } else {
        let level = config.log_level.as_deref().unwrap_or("info");
        format!("texd={level}")
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(level))
        .init();

    for warning in &warnings {
        warn!(target: "texd.daemon", "config: {warning}");
    }

    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::open(
            config.storage.root.as_str(),
            config.storage.signing_secret.as_str(),
        )
        .context("open blob store")?,
    );
    let records: Arc<dyn RecordStore> = Arc::new(MemoryRecordStore::new());
    let bus = Arc::new(LogBus::new());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryJobQueue::new(config.queue.stall_grace()));

    let sandbox: Arc<dyn SandboxExecutor> = Arc::new(
        DockerExecutor::connect()
            .await
            .context("connect to docker daemon")?,
    );
    info!(target: "texd.daemon", "docker daemon reachable");

    let mut orchestrator = Orchestrator::new(
        records,
        blobs,
        Arc::clone(&bus),
        sandbox,
        config.sandbox.clone(),
        config.storage.signed_url_ttl(),
    );
    if let Some(ref dir) = args.workspace_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("create workspace dir {}", dir.display()))?;
        orchestrator = orchestrator.with_workspace_parent(dir);
    }

    let consumer = Arc::new(Consumer::new(
        queue,
        Arc::new(orchestrator),
        ConsumerConfig::from_queue_config(&config.queue),
    ));
    let shutdown = consumer.shutdown_token();

    // Stop accepting new jobs on the first signal; in-flight jobs drain
    // under the configured grace.
    let signal_task = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!(target: "texd.daemon", "termination signal received, shutting down");
            shutdown.cancel();
        })
    };

    info!(
        target: "texd.daemon",
        concurrency = config.queue.concurrency,
        "texd worker running"
    );
    consumer.run().await;

    signal_task.abort();
    info!(target: "texd.daemon", "texd worker stopped");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("install SIGINT handler");
    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
