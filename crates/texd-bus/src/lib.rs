// SPDX-License-Identifier: MIT OR Apache-2.0
//! Per-compilation pub/sub log bus.
//!
//! Channels are keyed by compilation id and carry [`LogEvent`]s from one
//! publisher (the orchestrator) to any number of transient subscribers.
//! Publishing is fire-and-forget: a publisher never blocks on slow
//! subscribers and never observes an error. Events missed because nobody
//! was listening, or because a subscriber lagged, are counted in
//! [`BusStats`]; subscribers reconcile from the record store.
//!
//! A [`LogEvent::Done`] closes its channel: the sender is dropped so
//! draining subscribers terminate, and any later publish or subscribe on
//! that id is rejected (counted) or yields nothing.

#![deny(unsafe_code)]
#![warn(missing_docs)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use texd_types::LogEvent;
use tokio::sync::broadcast;
use tracing::trace;

/// Default per-channel capacity; laggards beyond this lose events.
const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Default)]
struct StatsInner {
    total_published: AtomicU64,
    dropped_no_subscribers: AtomicU64,
    dropped_lagged: AtomicU64,
    rejected_after_done: AtomicU64,
}

/// Snapshot of bus-wide counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusStats {
    /// Events accepted for delivery.
    pub total_published: u64,
    /// Events published while no subscriber was listening.
    pub dropped_no_subscribers: u64,
    /// Events lost to lagging subscribers.
    pub dropped_lagged: u64,
    /// Publishes attempted after a channel's `done` event.
    pub rejected_after_done: u64,
    /// Channels still open.
    pub open_channels: usize,
    /// Channels closed by a `done` event and not yet purged.
    pub closed_channels: usize,
}

enum ChannelState {
    Open(broadcast::Sender<LogEvent>),
    /// `done` has been published; the sender is gone so subscribers drain
    /// and terminate.
    Closed,
}

/// Process-wide log bus with channels keyed by compilation id.
pub struct LogBus {
    channels: Mutex<HashMap<String, ChannelState>>,
    capacity: usize,
    stats: Arc<StatsInner>,
}

impl LogBus {
    /// Create a bus with the default per-channel capacity.
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus with the given per-channel capacity.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            capacity,
            stats: Arc::new(StatsInner::default()),
        }
    }

    /// Publish an event on the channel for `compilation_id`.
    ///
    /// Never blocks and never fails outward. A [`LogEvent::Done`] closes
    /// the channel; publishing to a closed channel is counted in
    /// [`BusStats::rejected_after_done`] and otherwise ignored.
    pub fn publish(&self, compilation_id: &str, event: LogEvent) {
        let is_done = event.is_done();
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        let state = channels
            .entry(compilation_id.to_string())
            .or_insert_with(|| ChannelState::Open(broadcast::channel(self.capacity).0));

        match state {
            ChannelState::Closed => {
                self.stats.rejected_after_done.fetch_add(1, Ordering::Relaxed);
            }
            ChannelState::Open(tx) => {
                self.stats.total_published.fetch_add(1, Ordering::Relaxed);
                if tx.send(event).is_err() {
                    self.stats
                        .dropped_no_subscribers
                        .fetch_add(1, Ordering::Relaxed);
                }
                if is_done {
                    trace!(target: "texd.bus", id = compilation_id, "channel closed");
                    *state = ChannelState::Closed;
                }
            }
        }
    }

    /// Subscribe to future events on the channel for `compilation_id`.
    ///
    /// Subscribing before the worker starts publishing is fine; the
    /// channel is created on demand. Subscribing after the channel's
    /// `done` event returns a subscription that yields nothing.
    #[must_use]
    pub fn subscribe(&self, compilation_id: &str) -> LogSubscription {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        let state = channels
            .entry(compilation_id.to_string())
            .or_insert_with(|| ChannelState::Open(broadcast::channel(self.capacity).0));
        let rx = match state {
            ChannelState::Open(tx) => Some(tx.subscribe()),
            ChannelState::Closed => None,
        };
        LogSubscription {
            rx,
            stats: Arc::clone(&self.stats),
        }
    }

    /// Number of active subscribers on a channel (0 for unknown/closed).
    #[must_use]
    pub fn subscriber_count(&self, compilation_id: &str) -> usize {
        let channels = self.channels.lock().expect("bus lock poisoned");
        match channels.get(compilation_id) {
            Some(ChannelState::Open(tx)) => tx.receiver_count(),
            _ => 0,
        }
    }

    /// Drop closed-channel markers to reclaim memory.
    ///
    /// Safe at any time: a subscriber that shows up for a purged id gets a
    /// fresh channel and, per the contract, recovers final state from the
    /// record store.
    pub fn purge_closed(&self) -> usize {
        let mut channels = self.channels.lock().expect("bus lock poisoned");
        let before = channels.len();
        channels.retain(|_, state| matches!(state, ChannelState::Open(_)));
        before - channels.len()
    }

    /// Snapshot of the bus counters.
    #[must_use]
    pub fn stats(&self) -> BusStats {
        let channels = self.channels.lock().expect("bus lock poisoned");
        let open = channels
            .values()
            .filter(|s| matches!(s, ChannelState::Open(_)))
            .count();
        BusStats {
            total_published: self.stats.total_published.load(Ordering::Relaxed),
            dropped_no_subscribers: self.stats.dropped_no_subscribers.load(Ordering::Relaxed),
            dropped_lagged: self.stats.dropped_lagged.load(Ordering::Relaxed),
            rejected_after_done: self.stats.rejected_after_done.load(Ordering::Relaxed),
            open_channels: open,
            closed_channels: channels.len() - open,
        }
    }
}

impl Default for LogBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LogBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogBus")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// A handle receiving events from one compilation's channel.
pub struct LogSubscription {
    rx: Option<broadcast::Receiver<LogEvent>>,
    stats: Arc<StatsInner>,
}

impl LogSubscription {
    /// Receive the next event, waiting asynchronously.
    ///
    /// Returns `None` once the channel is closed and drained, or
    /// immediately if this subscription attached after the `done` event.
    /// Lag is absorbed: missed events are counted and reception continues
    /// with the next available event.
    pub async fn recv(&mut self) -> Option<LogEvent> {
        let rx = self.rx.as_mut()?;
        loop {
            match rx.recv().await {
                Ok(ev) => return Some(ev),
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    self.stats.dropped_lagged.fetch_add(n, Ordering::Relaxed);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    self.rx = None;
                    return None;
                }
            }
        }
    }

    /// Drain every remaining event into a vector (test helper and
    /// catch-up reads).
    pub async fn collect(mut self) -> Vec<LogEvent> {
        let mut events = Vec::new();
        while let Some(ev) = self.recv().await {
            events.push(ev);
        }
        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use texd_types::CompileStatus;

    fn done_event() -> LogEvent {
        LogEvent::Done {
            pdf_url: None,
            synctex_url: None,
            duration_ms: 1,
        }
    }

    #[tokio::test]
    async fn subscriber_receives_published_events_in_order() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("c-1");
        bus.publish("c-1", LogEvent::Status { status: CompileStatus::Compiling });
        bus.publish("c-1", LogEvent::line("line one"));
        bus.publish("c-1", done_event());

        assert!(matches!(sub.recv().await, Some(LogEvent::Status { .. })));
        match sub.recv().await {
            Some(LogEvent::Log { text, .. }) => assert_eq!(text, "line one"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(sub.recv().await, Some(LogEvent::Done { .. })));
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_counted_not_fatal() {
        let bus = LogBus::new();
        bus.publish("c-1", LogEvent::line("nobody listening"));
        let stats = bus.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.dropped_no_subscribers, 1);
    }

    #[tokio::test]
    async fn done_closes_channel_for_publishers() {
        let bus = LogBus::new();
        let _sub = bus.subscribe("c-1");
        bus.publish("c-1", done_event());
        bus.publish("c-1", LogEvent::line("too late"));
        assert_eq!(bus.stats().rejected_after_done, 1);
    }

    #[tokio::test]
    async fn late_subscriber_gets_nothing() {
        let bus = LogBus::new();
        bus.publish("c-1", done_event());
        let mut sub = bus.subscribe("c-1");
        assert!(sub.recv().await.is_none());
    }

    #[tokio::test]
    async fn subscriber_drains_buffered_events_after_close() {
        let bus = LogBus::new();
        let sub = bus.subscribe("c-1");
        bus.publish("c-1", LogEvent::line("a"));
        bus.publish("c-1", LogEvent::line("b"));
        bus.publish("c-1", done_event());

        let events = sub.collect().await;
        assert_eq!(events.len(), 3);
        assert!(events[2].is_done());
    }

    #[tokio::test]
    async fn channels_are_independent() {
        let bus = LogBus::new();
        let mut sub_a = bus.subscribe("a");
        let _sub_b = bus.subscribe("b");
        bus.publish("b", LogEvent::line("for b"));
        bus.publish("a", LogEvent::line("for a"));
        match sub_a.recv().await {
            Some(LogEvent::Log { text, .. }) => assert_eq!(text, "for a"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn early_subscriber_before_any_publish() {
        let bus = LogBus::new();
        let mut sub = bus.subscribe("pending");
        assert_eq!(bus.subscriber_count("pending"), 1);
        bus.publish("pending", LogEvent::line("hello"));
        assert!(sub.recv().await.is_some());
    }

    #[tokio::test]
    async fn purge_removes_only_closed_channels() {
        let bus = LogBus::new();
        let _keep = bus.subscribe("open");
        bus.publish("closed", done_event());
        assert_eq!(bus.stats().closed_channels, 1);
        assert_eq!(bus.purge_closed(), 1);
        let stats = bus.stats();
        assert_eq!(stats.closed_channels, 0);
        assert_eq!(stats.open_channels, 1);
    }

    #[tokio::test]
    async fn lagging_subscriber_is_counted_and_recovers() {
        let bus = LogBus::with_capacity(2);
        let mut sub = bus.subscribe("c-1");
        for i in 0..5 {
            bus.publish("c-1", LogEvent::line(format!("line {i}")));
        }
        // The first recv observes the lag, counts it, and returns the
        // oldest event still buffered.
        let ev = sub.recv().await.expect("an event survives the lag");
        assert!(matches!(ev, LogEvent::Log { .. }));
        assert!(bus.stats().dropped_lagged > 0);
    }
}
