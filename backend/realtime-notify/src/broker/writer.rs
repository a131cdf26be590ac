/// Connection Writer
///
/// Every open connection owns one writer task. The broker hands events to the
/// connection's bounded outbound queue while it holds the user's state lock;
/// the writer drains that queue into the sink one event at a time. Sink I/O
/// only ever happens here, so a slow or dead client stalls its own connection
/// and nothing else.
///
/// The writer is also the one place a sink is released: whether it stops on
/// cancellation, on a failed write or because the queue closed, it closes the
/// sink and moves the connection to CLOSED on its way out.
use super::{ConnectionId, ConnectionLifecycle, Event, Sink};
use crate::error::WriteError;
use crate::metrics;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Default number of events a connection may have waiting for its writer
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 256;

/// Owner handle for one writer task. Dropping it cancels the task.
pub struct WriterHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl WriterHandle {
    /// Ask the writer to stop. An in-progress write is abandoned. Idempotent.
    pub fn cancel(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Cancel and wait until the sink has been released
    pub async fn shutdown(mut self) {
        self.cancel();
        if let Err(err) = (&mut self.task).await {
            warn!(error = %err, "writer task ended abnormally");
        }
    }
}

impl Drop for WriterHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Outbound queue for one connection: the sender goes into the registry
/// entry, the receiver to `spawn_writer`.
pub fn outbound_channel(capacity: usize) -> (mpsc::Sender<Event>, mpsc::Receiver<Event>) {
    mpsc::channel(capacity.max(1))
}

/// Start the writer for one connection.
///
/// `on_failure` runs at most once, from the writer task, when a sink write
/// fails. It runs before the sink is closed and is not called on
/// cancellation.
pub fn spawn_writer<F>(
    connection_id: ConnectionId,
    sink: Arc<dyn Sink>,
    lifecycle: Arc<ConnectionLifecycle>,
    mut outbound: mpsc::Receiver<Event>,
    on_failure: F,
) -> WriterHandle
where
    F: FnOnce(ConnectionId, WriteError) + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();

    let task = tokio::spawn(async move {
        let failure = loop {
            let event = tokio::select! {
                biased;
                // Sender dropped counts as cancellation too
                _ = &mut cancel_rx => break None,
                next = outbound.recv() => match next {
                    Some(event) => event,
                    None => break None,
                },
            };

            let written = tokio::select! {
                biased;
                _ = &mut cancel_rx => break None,
                result = sink.write(&event) => result,
            };

            match written {
                Ok(()) if event.is_heartbeat() => metrics::record_heartbeat(),
                Ok(()) => {}
                Err(err) => break Some(err),
            }
        };

        if let Some(err) = failure {
            on_failure(connection_id, err);
        }

        sink.close().await;
        lifecycle.mark_closed();
        debug!(connection_id = %connection_id, "writer stopped, sink released");
    });

    WriterHandle {
        cancel: Some(cancel_tx),
        task,
    }
}
