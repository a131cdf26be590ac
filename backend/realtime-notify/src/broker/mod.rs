/// Realtime notification broker
///
/// Pushes events to connected user sessions and buffers them for users that
/// are offline.
///
/// Architecture:
/// 1. ConnectionRegistry: open connections, their sinks and outbound queues
/// 2. QueueStore: bounded per-user backlog for offline users
/// 3. Writer: one task per connection draining its outbound queue into the sink
/// 4. HeartbeatScheduler: periodic liveness pulse per connection
/// 5. Broker: open / publish / close orchestration on top of the four
///
/// Ordering: each user has a slot guarded by a short synchronous lock. Under
/// it the broker registers + drains on open, stamps timestamps, and hands
/// each published event to every outbound queue of the user. Hand-off order
/// is therefore publish order for every connection, and the writers keep it.
/// Nothing awaits while the lock is held, and no broker call waits on sink
/// I/O except `close_connection`, which waits for that one sink's release.
pub mod connection;
pub mod event;
pub mod heartbeat;
pub mod queue;
pub mod registry;
pub mod sink;
pub mod writer;

pub use connection::{ConnectionId, ConnectionLifecycle, ConnectionState, UserId};
pub use event::{Event, HEARTBEAT_EVENT_TYPE};
pub use heartbeat::{HeartbeatHandle, HeartbeatScheduler, DEFAULT_HEARTBEAT_INTERVAL};
pub use queue::{EnqueueOutcome, QueueStore, DEFAULT_BACKLOG_CAPACITY};
pub use registry::{ConnectionEntry, ConnectionRegistry};
pub use sink::{ChannelSink, Sink};
pub use writer::{outbound_channel, spawn_writer, WriterHandle, DEFAULT_OUTBOUND_CAPACITY};

use crate::error::{Result, WriteError};
use crate::metrics;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Max buffered events per offline user; oldest dropped beyond this
    pub backlog_capacity: usize,
    pub heartbeat_interval: Duration,
    /// Events a connection may have waiting for its writer before it is
    /// considered stuck and torn down
    pub outbound_capacity: usize,
    /// Channel capacity of sinks created by `open_channel`
    pub sink_buffer: usize,
    /// How long a `ChannelSink` write may wait on a full channel
    pub write_timeout: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            backlog_capacity: DEFAULT_BACKLOG_CAPACITY,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            outbound_capacity: DEFAULT_OUTBOUND_CAPACITY,
            sink_buffer: 64,
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of `open_connection`
#[derive(Debug)]
pub struct OpenedConnection {
    pub connection_id: ConnectionId,
    /// Backlog drained at open time, oldest first. Deliver before live events.
    pub replay: Vec<Event>,
    pub lifecycle: Arc<ConnectionLifecycle>,
}

impl OpenedConnection {
    pub fn state(&self) -> ConnectionState {
        self.lifecycle.state()
    }
}

/// What `publish` did with an event. Publishing itself never fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    /// Handed to the user's live connections. `failed` counts connections
    /// whose outbound queue was full; those are torn down.
    Delivered { connections: usize, failed: usize },
    /// No live connection; appended to the backlog
    Queued { dropped_oldest: bool },
    /// Heartbeat for an offline user; heartbeats are never queued
    Discarded,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    pub total_connections: usize,
    pub connected_users: usize,
    pub queued_users: usize,
    pub queued_events: usize,
    /// Users the broker currently holds ordering state for
    pub tracked_users: usize,
    pub events_published: u64,
    pub events_delivered: u64,
    pub events_queued: u64,
    pub events_dropped: u64,
    pub write_failures: u64,
}

#[derive(Default)]
struct Counters {
    published: AtomicU64,
    delivered: AtomicU64,
    queued: AtomicU64,
    write_failures: AtomicU64,
}

/// Per-user ordering state, guarded by the slot lock
#[derive(Default)]
struct UserSlot {
    last_timestamp: Option<DateTime<Utc>>,
}

impl UserSlot {
    /// Keep this user's timestamps non-decreasing
    fn stamp(&mut self, event: Event) -> Event {
        let event = match self.last_timestamp {
            Some(floor) => event.not_before(floor),
            None => event,
        };
        self.last_timestamp = Some(event.timestamp());
        event
    }
}

struct BrokerInner {
    config: BrokerConfig,
    registry: Arc<ConnectionRegistry>,
    queue: Arc<QueueStore>,
    scheduler: HeartbeatScheduler,
    // A slot lives while its user has connections, backlog or an operation
    // in flight; `release_slot` drops it afterwards.
    slots: DashMap<UserId, Arc<Mutex<UserSlot>>>,
    writers: DashMap<ConnectionId, WriterHandle>,
    heartbeats: DashMap<ConnectionId, HeartbeatHandle>,
    next_seq: AtomicU64,
    counters: Counters,
}

/// Process-wide publish/subscribe broker.
///
/// Cheap to clone; clones share state. Build isolated instances for tests.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<BrokerInner>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Self {
        let queue = Arc::new(QueueStore::new(config.backlog_capacity));
        Self::with_components(config, Arc::new(ConnectionRegistry::new()), queue)
    }

    /// Build a broker around externally owned registry and queue store
    pub fn with_components(
        config: BrokerConfig,
        registry: Arc<ConnectionRegistry>,
        queue: Arc<QueueStore>,
    ) -> Self {
        let scheduler = HeartbeatScheduler::new(config.heartbeat_interval);
        Self {
            inner: Arc::new(BrokerInner {
                config,
                registry,
                queue,
                scheduler,
                slots: DashMap::new(),
                writers: DashMap::new(),
                heartbeats: DashMap::new(),
                next_seq: AtomicU64::new(1),
                counters: Counters::default(),
            }),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.inner.registry
    }

    pub fn queue(&self) -> &QueueStore {
        &self.inner.queue
    }

    /// Open a connection for `user_id` delivering into `sink`.
    ///
    /// Registration and backlog drain happen atomically under the user's
    /// slot lock: every event published concurrently either lands in
    /// `replay` or is handed to the new connection, never both.
    ///
    /// Must be called from within a tokio runtime.
    pub fn open_connection(
        &self,
        user_id: UserId,
        sink: Arc<dyn Sink>,
    ) -> Result<OpenedConnection> {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let connection_id = ConnectionId::new(user_id, seq);
        let lifecycle = Arc::new(ConnectionLifecycle::new());

        let (outbound, outbound_rx) = outbound_channel(self.inner.config.outbound_capacity);
        let writer = self.start_writer(connection_id, sink.clone(), lifecycle.clone(), outbound_rx);
        // Present before the entry is visible, so a closer always finds it
        self.inner.writers.insert(connection_id, writer);

        let entry = ConnectionEntry::new(connection_id, sink, outbound, lifecycle.clone());
        let registered = {
            let slot = self.slot(user_id);
            let _slot = slot.lock();
            self.inner
                .registry
                .register(entry)
                .map(|()| self.inner.queue.drain(&user_id))
        };
        let replay = match registered {
            Ok(replay) => replay,
            Err(err) => {
                error!(connection_id = %connection_id, "connection id collision");
                self.inner.writers.remove(&connection_id);
                self.release_slot(&user_id);
                return Err(err);
            }
        };
        metrics::connection_opened();

        let heartbeat = self.spawn_heartbeat(connection_id);
        self.inner.heartbeats.insert(connection_id, heartbeat);

        if lifecycle.mark_open() {
            info!(
                connection_id = %connection_id,
                user_id = %user_id,
                replay = replay.len(),
                "connection opened"
            );
        } else if let Some((_, mut heartbeat)) = self.inner.heartbeats.remove(&connection_id) {
            // Closed while opening; the closer may have missed the heartbeat
            heartbeat.cancel();
        }

        Ok(OpenedConnection {
            connection_id,
            replay,
            lifecycle,
        })
    }

    /// Open a connection backed by a fresh `ChannelSink`.
    ///
    /// The receiver is the live half the host streams from after `replay`.
    pub fn open_channel(
        &self,
        user_id: UserId,
    ) -> Result<(OpenedConnection, mpsc::Receiver<Event>)> {
        let (sink, rx) =
            ChannelSink::new(self.inner.config.sink_buffer, self.inner.config.write_timeout);
        let opened = self.open_connection(user_id, Arc::new(sink))?;
        Ok((opened, rx))
    }

    /// Publish an event to every connection of `user_id`, or queue it.
    ///
    /// Never waits on sink I/O: the event is handed to each connection's
    /// writer and written in the background. A connection that later fails
    /// its write is torn down; events already handed to it are not retried
    /// or requeued.
    pub fn publish(&self, user_id: UserId, event: Event) -> PublishOutcome {
        self.inner.counters.published.fetch_add(1, Ordering::Relaxed);

        let (outcome, stuck) = {
            let slot = self.slot(user_id);
            let mut slot = slot.lock();
            let event = slot.stamp(event);

            let targets = self.inner.registry.connections_for(&user_id);
            if targets.is_empty() {
                (self.enqueue_locked(user_id, event), Vec::new())
            } else {
                let mut handed_off = 0;
                let mut stuck = Vec::new();
                for entry in &targets {
                    match entry.outbound.try_send(event.clone()) {
                        Ok(()) => handed_off += 1,
                        Err(TrySendError::Full(_)) => stuck.push(entry.connection_id),
                        // Writer already gone; teardown is in progress
                        Err(TrySendError::Closed(_)) => {}
                    }
                }

                self.inner
                    .counters
                    .delivered
                    .fetch_add(handed_off, Ordering::Relaxed);
                metrics::record_event("delivered", handed_off);
                debug!(
                    user_id = %user_id,
                    event_type = event.event_type(),
                    connections = targets.len(),
                    handed_off,
                    "event published"
                );

                let outcome = PublishOutcome::Delivered {
                    connections: targets.len(),
                    failed: stuck.len(),
                };
                (outcome, stuck)
            }
        };

        for connection_id in &stuck {
            self.fail_connection(connection_id, &WriteError::QueueFull);
        }
        self.release_slot(&user_id);
        outcome
    }

    /// Publish to every user that currently holds a connection.
    ///
    /// Returns the number of users targeted. Like `publish`, this never
    /// waits on any sink, so one stalled user cannot hold up the others.
    pub fn broadcast(&self, event: Event) -> usize {
        let user_ids = self.inner.registry.user_ids();
        for user_id in &user_ids {
            self.publish(*user_id, event.clone());
        }
        info!(users = user_ids.len(), event_type = event.event_type(), "broadcast sent");
        user_ids.len()
    }

    /// Tear down a connection and wait until its sink is released. Idempotent.
    ///
    /// Returns `true` only for the call that actually performed the teardown.
    pub async fn close_connection(&self, connection_id: &ConnectionId) -> bool {
        let Some((entry, writer)) = self.detach(connection_id) else {
            return false;
        };

        match writer {
            Some(writer) => writer.shutdown().await,
            None => {
                entry.sink.close().await;
                entry.lifecycle.mark_closed();
            }
        }

        info!(connection_id = %connection_id, "connection closed");
        true
    }

    /// Close every open connection
    pub async fn shutdown(&self) {
        let connection_ids = self.inner.registry.all_connection_ids();
        info!(connections = connection_ids.len(), "shutting down broker");
        join_all(
            connection_ids
                .iter()
                .map(|connection_id| self.close_connection(connection_id)),
        )
        .await;
    }

    pub fn connection_state(&self, connection_id: &ConnectionId) -> ConnectionState {
        self.inner
            .registry
            .get(connection_id)
            .map(|entry| entry.lifecycle.state())
            .unwrap_or(ConnectionState::Closed)
    }

    pub fn connection_count(&self, user_id: &UserId) -> usize {
        self.inner.registry.connection_count(user_id)
    }

    pub fn total_connections(&self) -> usize {
        self.inner.registry.len()
    }

    pub fn connected_users(&self) -> usize {
        self.inner.registry.user_count()
    }

    pub fn connected_user_ids(&self) -> Vec<UserId> {
        self.inner.registry.user_ids()
    }

    pub fn backlog_len(&self, user_id: &UserId) -> usize {
        self.inner.queue.len(user_id)
    }

    /// Users the broker currently keeps ordering state for
    pub fn tracked_users(&self) -> usize {
        self.inner.slots.len()
    }

    pub fn stats(&self) -> BrokerStats {
        let counters = &self.inner.counters;
        BrokerStats {
            total_connections: self.inner.registry.len(),
            connected_users: self.inner.registry.user_count(),
            queued_users: self.inner.queue.user_count(),
            queued_events: self.inner.queue.total_events(),
            tracked_users: self.inner.slots.len(),
            events_published: counters.published.load(Ordering::Relaxed),
            events_delivered: counters.delivered.load(Ordering::Relaxed),
            events_queued: counters.queued.load(Ordering::Relaxed),
            events_dropped: self.inner.queue.dropped_total(),
            write_failures: counters.write_failures.load(Ordering::Relaxed),
        }
    }

    fn slot(&self, user_id: UserId) -> Arc<Mutex<UserSlot>> {
        self.inner.slots.entry(user_id).or_default().clone()
    }

    /// Forget the user's slot once nothing depends on it any more.
    ///
    /// Callers must have dropped their own handle to the slot. A slot held
    /// by anyone else is still in use and is kept.
    fn release_slot(&self, user_id: &UserId) {
        self.inner.slots.remove_if(user_id, |_, slot| {
            Arc::strong_count(slot) == 1
                && self.inner.registry.connection_count(user_id) == 0
                && self.inner.queue.len(user_id) == 0
        });
    }

    /// Caller holds the user's slot lock
    fn enqueue_locked(&self, user_id: UserId, event: Event) -> PublishOutcome {
        if event.is_heartbeat() {
            metrics::record_event("discarded", 1);
            return PublishOutcome::Discarded;
        }

        let outcome = self.inner.queue.enqueue(user_id, event);
        self.inner.counters.queued.fetch_add(1, Ordering::Relaxed);
        metrics::record_event("queued", 1);

        if let Some(dropped) = &outcome.dropped {
            metrics::record_event("dropped", 1);
            warn!(
                user_id = %user_id,
                dropped_event_id = %dropped.id(),
                capacity = self.inner.queue.capacity(),
                "backlog full, dropped oldest event"
            );
        } else {
            debug!(user_id = %user_id, backlog = outcome.backlog_len, "event queued");
        }

        PublishOutcome::Queued {
            dropped_oldest: outcome.dropped.is_some(),
        }
    }

    /// Queue a heartbeat for one connection. Returns `false` once the
    /// connection is gone, which stops its heartbeat task.
    fn emit_heartbeat(&self, connection_id: &ConnectionId) -> bool {
        let user_id = connection_id.user_id();
        let sent = {
            let slot = self.slot(user_id);
            let mut slot = slot.lock();
            self.inner
                .registry
                .get(connection_id)
                .map(|entry| entry.outbound.try_send(slot.stamp(Event::heartbeat())))
        };
        self.release_slot(&user_id);

        match sent {
            Some(Ok(())) => true,
            Some(Err(TrySendError::Full(_))) => {
                self.fail_connection(connection_id, &WriteError::QueueFull);
                false
            }
            Some(Err(TrySendError::Closed(_))) | None => false,
        }
    }

    /// Start teardown of a connection: unregister it and stop its heartbeat.
    ///
    /// Only the first caller gets the entry and its writer back; the writer
    /// is what finally releases the sink.
    fn detach(
        &self,
        connection_id: &ConnectionId,
    ) -> Option<(ConnectionEntry, Option<WriterHandle>)> {
        let entry = self.inner.registry.get(connection_id)?;
        if !entry.lifecycle.begin_close() {
            return None;
        }

        self.inner.registry.unregister(connection_id);
        if let Some((_, mut heartbeat)) = self.inner.heartbeats.remove(connection_id) {
            heartbeat.cancel();
        }
        let writer = self
            .inner
            .writers
            .remove(connection_id)
            .map(|(_, writer)| writer);

        metrics::connection_closed();
        self.release_slot(&connection_id.user_id());
        Some((entry, writer))
    }

    /// Tear down a connection whose sink can no longer keep up or failed.
    ///
    /// Failures observed after a close already started are expected fallout
    /// of that close and are not counted.
    fn fail_connection(&self, connection_id: &ConnectionId, err: &WriteError) {
        // Dropping the writer handle cancels it; the writer releases the sink
        if self.detach(connection_id).is_none() {
            return;
        }

        self.inner
            .counters
            .write_failures
            .fetch_add(1, Ordering::Relaxed);
        metrics::record_write_failure();
        warn!(connection_id = %connection_id, error = %err, "connection failed, closing");
    }

    fn start_writer(
        &self,
        connection_id: ConnectionId,
        sink: Arc<dyn Sink>,
        lifecycle: Arc<ConnectionLifecycle>,
        outbound: mpsc::Receiver<Event>,
    ) -> WriterHandle {
        // Weak so a forgotten broker is not kept alive by its own tasks
        let broker: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        spawn_writer(connection_id, sink, lifecycle, outbound, move |connection_id, err| {
            if let Some(inner) = broker.upgrade() {
                Broker { inner }.fail_connection(&connection_id, &err);
            }
        })
    }

    fn spawn_heartbeat(&self, connection_id: ConnectionId) -> HeartbeatHandle {
        let broker: Weak<BrokerInner> = Arc::downgrade(&self.inner);
        self.inner
            .scheduler
            .spawn(connection_id, move || match broker.upgrade() {
                Some(inner) => Broker { inner }.emit_heartbeat(&connection_id),
                None => false,
            })
    }
}

impl Default for Broker {
    fn default() -> Self {
        Self::new(BrokerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;
    use uuid::Uuid;

    fn user() -> UserId {
        UserId::new(Uuid::new_v4())
    }

    fn progress(n: u32) -> Event {
        Event::new("progress", json!({ "progress": n }))
    }

    /// Sink that succeeds `ok_writes` times, then fails
    struct FlakySink {
        ok_writes: usize,
        writes: AtomicUsize,
    }

    #[async_trait]
    impl Sink for FlakySink {
        async fn write(&self, _event: &Event) -> std::result::Result<(), WriteError> {
            let n = self.writes.fetch_add(1, Ordering::SeqCst);
            if n < self.ok_writes {
                Ok(())
            } else {
                Err(WriteError::Transport("connection reset".into()))
            }
        }

        async fn close(&self) {}
    }

    #[tokio::test]
    async fn test_publish_offline_queues() {
        let broker = Broker::default();
        let user_id = user();

        let outcome = broker.publish(user_id, progress(1));
        assert_eq!(outcome, PublishOutcome::Queued { dropped_oldest: false });
        assert_eq!(broker.backlog_len(&user_id), 1);
    }

    #[tokio::test]
    async fn test_open_replays_backlog_in_order() {
        let broker = Broker::default();
        let user_id = user();

        broker.publish(user_id, progress(1));
        broker.publish(user_id, progress(2));

        let (opened, _rx) = broker.open_channel(user_id).unwrap();
        let replay: Vec<_> = opened
            .replay
            .iter()
            .map(|e| e.payload()["progress"].clone())
            .collect();

        assert_eq!(replay, vec![json!(1), json!(2)]);
        assert_eq!(opened.state(), ConnectionState::Open);
        assert_eq!(broker.backlog_len(&user_id), 0);
    }

    #[tokio::test]
    async fn test_publish_to_open_connection_is_live() {
        let broker = Broker::default();
        let user_id = user();
        let (opened, mut rx) = broker.open_channel(user_id).unwrap();
        assert!(opened.replay.is_empty());

        let event = progress(3);
        let outcome = broker.publish(user_id, event.clone());

        assert_eq!(outcome, PublishOutcome::Delivered { connections: 1, failed: 0 });
        assert_eq!(rx.recv().await.unwrap().id(), event.id());
        assert_eq!(broker.backlog_len(&user_id), 0);
    }

    #[tokio::test]
    async fn test_heartbeat_not_queued_offline() {
        let broker = Broker::default();
        let user_id = user();

        let outcome = broker.publish(user_id, Event::heartbeat());
        assert_eq!(outcome, PublishOutcome::Discarded);
        assert_eq!(broker.backlog_len(&user_id), 0);
    }

    #[tokio::test]
    async fn test_timestamps_non_decreasing_per_user() {
        let broker = Broker::default();
        let user_id = user();

        let first = progress(1);
        broker.publish(user_id, first.clone());

        // Event that claims to be older than the one already published
        let stale = Event::from_json(
            &json!({
                "id": Uuid::new_v4(),
                "event_type": "progress",
                "payload": { "progress": 2 },
                "timestamp": first.timestamp() - chrono::Duration::seconds(60),
            })
            .to_string(),
        )
        .unwrap();
        broker.publish(user_id, stale);

        let (opened, _rx) = broker.open_channel(user_id).unwrap();
        assert_eq!(opened.replay.len(), 2);
        assert_eq!(opened.replay[0].timestamp(), first.timestamp());
        assert_eq!(opened.replay[1].timestamp(), first.timestamp());
    }

    #[tokio::test(start_paused = true)]
    async fn test_heartbeat_never_older_than_published_event() {
        let broker = Broker::new(BrokerConfig {
            heartbeat_interval: Duration::from_secs(10),
            ..BrokerConfig::default()
        });
        let user_id = user();
        let (_opened, mut rx) = broker.open_channel(user_id).unwrap();

        // Stamped an hour ahead of the wall clock by its producer
        let future = Event::from_json(
            &json!({
                "id": Uuid::new_v4(),
                "event_type": "progress",
                "payload": {},
                "timestamp": Utc::now() + chrono::Duration::hours(1),
            })
            .to_string(),
        )
        .unwrap();
        broker.publish(user_id, future.clone());
        assert_eq!(rx.recv().await.unwrap().id(), future.id());

        tokio::time::sleep(Duration::from_secs(11)).await;
        let heartbeat = rx.recv().await.unwrap();
        assert!(heartbeat.is_heartbeat());
        assert!(heartbeat.timestamp() >= future.timestamp());
    }

    #[tokio::test]
    async fn test_failing_sink_is_closed_and_next_publish_queues() {
        let broker = Broker::default();
        let user_id = user();
        let sink = Arc::new(FlakySink {
            ok_writes: 1,
            writes: AtomicUsize::new(0),
        });

        let opened = broker.open_connection(user_id, sink).unwrap();

        broker.publish(user_id, progress(1));
        let second = broker.publish(user_id, progress(2));
        assert_eq!(second, PublishOutcome::Delivered { connections: 1, failed: 0 });

        opened.lifecycle.closed().await;
        assert_eq!(broker.connection_state(&opened.connection_id), ConnectionState::Closed);

        let third = broker.publish(user_id, progress(3));
        assert_eq!(third, PublishOutcome::Queued { dropped_oldest: false });
        assert_eq!(broker.stats().write_failures, 1);
    }

    #[tokio::test]
    async fn test_full_outbound_queue_tears_connection_down() {
        let broker = Broker::new(BrokerConfig {
            outbound_capacity: 2,
            ..BrokerConfig::default()
        });
        let user_id = user();
        let (opened, _rx) = broker.open_channel(user_id).unwrap();

        // The writer has not run yet, so the queue fills up synchronously
        broker.publish(user_id, progress(1));
        broker.publish(user_id, progress(2));
        let third = broker.publish(user_id, progress(3));

        assert_eq!(third, PublishOutcome::Delivered { connections: 1, failed: 1 });
        assert_eq!(broker.connection_count(&user_id), 0);
        assert_eq!(broker.stats().write_failures, 1);
        opened.lifecycle.closed().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_during_stalled_write_is_not_a_failure() {
        let broker = Broker::new(BrokerConfig {
            sink_buffer: 1,
            write_timeout: Duration::from_secs(60),
            ..BrokerConfig::default()
        });
        let user_id = user();
        let (opened, _rx) = broker.open_channel(user_id).unwrap();

        broker.publish(user_id, progress(1));
        broker.publish(user_id, progress(2));
        tokio::task::yield_now().await;

        assert!(broker.close_connection(&opened.connection_id).await);
        assert_eq!(opened.state(), ConnectionState::Closed);
        assert_eq!(broker.stats().write_failures, 0);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let broker = Broker::default();
        let user_id = user();
        let (opened, mut rx) = broker.open_channel(user_id).unwrap();

        assert!(broker.close_connection(&opened.connection_id).await);
        assert!(!broker.close_connection(&opened.connection_id).await);

        assert_eq!(opened.state(), ConnectionState::Closed);
        assert_eq!(broker.total_connections(), 0);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_broadcast_reaches_connected_users_only() {
        let broker = Broker::default();
        let (online, offline) = (user(), user());
        let (_opened, mut rx) = broker.open_channel(online).unwrap();

        let targeted =
            broker.broadcast(Event::new("broadcast", json!({ "title": "Maintenance" })));

        assert_eq!(targeted, 1);
        assert_eq!(rx.recv().await.unwrap().event_type(), "broadcast");
        assert_eq!(broker.backlog_len(&offline), 0);
    }

    #[tokio::test]
    async fn test_shutdown_closes_everything() {
        let broker = Broker::default();
        let mut lifecycles = Vec::new();
        for _ in 0..3 {
            let (opened, _rx) = broker.open_channel(user()).unwrap();
            lifecycles.push(opened.lifecycle);
        }

        broker.shutdown().await;

        assert_eq!(broker.total_connections(), 0);
        assert!(lifecycles
            .iter()
            .all(|l| l.state() == ConnectionState::Closed));
    }

    #[tokio::test]
    async fn test_user_state_released_when_idle() {
        let broker = Broker::default();

        for _ in 0..100 {
            let user_id = user();
            broker.publish(user_id, progress(1));
            assert_eq!(broker.tracked_users(), 1);

            let (opened, _rx) = broker.open_channel(user_id).unwrap();
            assert_eq!(opened.replay.len(), 1);
            broker.close_connection(&opened.connection_id).await;
            assert_eq!(broker.tracked_users(), 0);
        }

        // Heartbeats for unknown users leave nothing behind either
        broker.publish(user(), Event::heartbeat());
        assert_eq!(broker.stats().tracked_users, 0);
    }

    #[tokio::test]
    async fn test_injected_components_are_shared() {
        let registry = Arc::new(ConnectionRegistry::new());
        let queue = Arc::new(QueueStore::new(2));
        let broker =
            Broker::with_components(BrokerConfig::default(), registry.clone(), queue.clone());
        let user_id = user();

        for n in 0..3 {
            broker.publish(user_id, progress(n));
        }
        assert_eq!(queue.len(&user_id), 2);

        let (_opened, _rx) = broker.open_channel(user_id).unwrap();
        assert_eq!(registry.connection_count(&user_id), 1);
        assert_eq!(broker.stats().events_dropped, 1);
    }
}
