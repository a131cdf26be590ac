/// Delivery sinks
///
/// A `Sink` is the host-supplied place one connection's events go to. The
/// broker only references it while the connection is open.
use super::Event;
use crate::error::WriteError;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

#[async_trait]
pub trait Sink: Send + Sync {
    /// Deliver one event. Failure means the connection is dead.
    async fn write(&self, event: &Event) -> Result<(), WriteError>;

    /// Release the underlying channel. Must be idempotent.
    async fn close(&self);
}

/// Sink backed by a bounded mpsc channel.
///
/// The receiving half is handed to the host, which frames events onto the
/// wire. Failures are detected synchronously: a dropped receiver fails the
/// write immediately, a full channel fails it after `write_timeout`.
pub struct ChannelSink {
    sender: Mutex<Option<mpsc::Sender<Event>>>,
    write_timeout: Duration,
}

impl ChannelSink {
    pub fn new(capacity: usize, write_timeout: Duration) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let sink = Self {
            sender: Mutex::new(Some(tx)),
            write_timeout,
        };
        (sink, rx)
    }

    pub fn is_closed(&self) -> bool {
        match self.sender.lock().as_ref() {
            Some(tx) => tx.is_closed(),
            None => true,
        }
    }
}

#[async_trait]
impl Sink for ChannelSink {
    async fn write(&self, event: &Event) -> Result<(), WriteError> {
        // Clone the sender so the lock is not held across the await
        let tx = self.sender.lock().clone().ok_or(WriteError::Closed)?;

        match tx.send_timeout(event.clone(), self.write_timeout).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendTimeoutError::Closed(_)) => Err(WriteError::Closed),
            Err(mpsc::error::SendTimeoutError::Timeout(_)) => {
                Err(WriteError::Timeout(self.write_timeout))
            }
        }
    }

    async fn close(&self) {
        self.sender.lock().take();
    }
}
