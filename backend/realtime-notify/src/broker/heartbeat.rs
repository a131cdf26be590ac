/// Heartbeat Scheduler
///
/// One cancellable periodic task per open connection. Each tick asks the
/// broker to queue a content-free heartbeat for that connection. Heartbeats
/// travel through the same outbound queue and writer as regular events, so
/// they keep the transport from timing out and a dead client shows up as a
/// failed heartbeat write even when nothing else is being published.
use super::ConnectionId;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

/// Default interval between heartbeats
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Owner handle for one heartbeat task. Dropping it cancels the task.
pub struct HeartbeatHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl HeartbeatHandle {
    /// Stop the task at its next suspension point. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for HeartbeatHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Debug, Clone)]
pub struct HeartbeatScheduler {
    interval: Duration,
}

impl HeartbeatScheduler {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start heartbeats for one connection.
    ///
    /// `on_tick` runs once per interval and returns whether the connection
    /// still wants heartbeats; `false` ends the task.
    pub fn spawn<F>(&self, connection_id: ConnectionId, mut on_tick: F) -> HeartbeatHandle
    where
        F: FnMut() -> bool + Send + 'static,
    {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let period = self.interval;

        let task = tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    // Sender dropped counts as cancellation too
                    _ = &mut cancel_rx => {
                        debug!(connection_id = %connection_id, "heartbeat cancelled");
                        break;
                    }
                    _ = ticker.tick() => {
                        if !on_tick() {
                            debug!(connection_id = %connection_id, "connection gone, heartbeat stopped");
                            break;
                        }
                    }
                }
            }
        });

        HeartbeatHandle {
            cancel: Some(cancel_tx),
            task,
        }
    }
}

impl Default for HeartbeatScheduler {
    fn default() -> Self {
        Self::new(DEFAULT_HEARTBEAT_INTERVAL)
    }
}
