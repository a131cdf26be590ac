/// Server-Sent Events stream
///
/// Endpoint: GET /api/v1/notifications/stream
///
/// Frames the connection's replay and live events as SSE. The stream owns
/// the broker connection: when actix drops it (client went away) the
/// connection is closed.
use super::{caller_id, AppState};
use crate::broker::{Broker, ConnectionId, Event};
use crate::error::{AppError, AppResult};
use actix_web::http::header::{CacheControl, CacheDirective};
use actix_web::web::{self, Bytes};
use actix_web::{HttpRequest, HttpResponse};
use futures::Stream;
use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Render one event as an SSE frame. Heartbeats become comment lines.
pub fn format_sse(event: &Event) -> Result<Bytes, serde_json::Error> {
    if event.is_heartbeat() {
        return Ok(Bytes::from_static(b": heartbeat\n\n"));
    }

    let data = event.to_json()?;
    Ok(Bytes::from(format!(
        "id: {}\nevent: {}\ndata: {}\n\n",
        event.id(),
        event.event_type(),
        data
    )))
}

pub struct EventStream {
    broker: Broker,
    connection_id: ConnectionId,
    /// Frames written before any live event: retry hint, then replay
    pending: VecDeque<Bytes>,
    live: mpsc::Receiver<Event>,
}

impl EventStream {
    pub fn new(
        broker: Broker,
        connection_id: ConnectionId,
        replay: Vec<Event>,
        live: mpsc::Receiver<Event>,
        sse_retry_ms: u64,
    ) -> Result<Self, serde_json::Error> {
        let mut pending = VecDeque::with_capacity(replay.len() + 1);
        if sse_retry_ms > 0 {
            pending.push_back(Bytes::from(format!("retry: {sse_retry_ms}\n\n")));
        }
        for event in &replay {
            pending.push_back(format_sse(event)?);
        }

        Ok(Self {
            broker,
            connection_id,
            pending,
            live,
        })
    }
}

impl Stream for EventStream {
    type Item = Result<Bytes, actix_web::Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(frame) = self.pending.pop_front() {
            return Poll::Ready(Some(Ok(frame)));
        }

        match self.live.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(
                format_sse(&event).map_err(actix_web::error::ErrorInternalServerError),
            )),
            // Sink closed by the broker
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for EventStream {
    fn drop(&mut self) {
        let broker = self.broker.clone();
        let connection_id = self.connection_id;
        debug!(connection_id = %connection_id, "event stream dropped");

        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                broker.close_connection(&connection_id).await;
            });
        }
    }
}

pub async fn stream_events(
    req: HttpRequest,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let user_id = caller_id(&req)?;
    let broker = state.broker.clone();

    let (opened, live) = broker.open_channel(user_id)?;
    let connection_id = opened.connection_id;

    let stream = match EventStream::new(
        broker.clone(),
        connection_id,
        opened.replay,
        live,
        state.sse_retry_ms,
    ) {
        Ok(stream) => stream,
        Err(err) => {
            error!(connection_id = %connection_id, error = %err, "failed to frame replay");
            broker.close_connection(&connection_id).await;
            return Err(AppError::Internal);
        }
    };

    Ok(HttpResponse::Ok()
        .content_type("text/event-stream")
        .insert_header(CacheControl(vec![CacheDirective::NoCache]))
        .insert_header(("X-Connection-Id", connection_id.to_string()))
        .streaming(stream))
}
