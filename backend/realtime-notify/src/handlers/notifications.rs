/// Publish / broadcast / status endpoints
///
/// Business logic elsewhere (progress tracking, payments, admin tools) calls
/// these to push events; the broker decides between live delivery and backlog.
use super::AppState;
use crate::broker::{Event, UserId, HEARTBEAT_EVENT_TYPE};
use crate::error::{AppError, AppResult};
use actix_web::{web, HttpResponse};
use serde::Deserialize;
use serde_json::{json, Value};
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct PublishRequest {
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl PublishRequest {
    fn into_event(self) -> AppResult<Event> {
        let event_type = self.event_type.trim();
        if event_type.is_empty() {
            return Err(AppError::BadRequest("event_type must not be empty".into()));
        }
        if event_type == HEARTBEAT_EVENT_TYPE {
            return Err(AppError::BadRequest(format!(
                "event_type '{HEARTBEAT_EVENT_TYPE}' is reserved"
            )));
        }
        Ok(Event::new(event_type, self.payload))
    }
}

/// Publish an event to one user
///
/// Endpoint: POST /api/v1/notifications/publish/{user_id}
pub async fn publish_event(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
    body: web::Json<PublishRequest>,
) -> AppResult<HttpResponse> {
    let user_id = UserId::from(path.into_inner());
    let event = body.into_inner().into_event()?;
    let event_id = event.id();

    let outcome = state.broker.publish(user_id, event);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "user_id": user_id,
        "event_id": event_id,
        "result": outcome,
    })))
}

/// Publish an event to every connected user
///
/// Endpoint: POST /api/v1/notifications/broadcast
pub async fn broadcast_event(
    state: web::Data<AppState>,
    body: web::Json<PublishRequest>,
) -> AppResult<HttpResponse> {
    let event = body.into_inner().into_event()?;
    let event_id = event.id();

    let users = state.broker.broadcast(event);

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "event_id": event_id,
        "users": users,
    })))
}

/// Connection and backlog status for a user
///
/// Endpoint: GET /api/v1/notifications/status/{user_id}
pub async fn user_status(
    path: web::Path<Uuid>,
    state: web::Data<AppState>,
) -> AppResult<HttpResponse> {
    let user_id = UserId::from(path.into_inner());
    let connection_count = state.broker.connection_count(&user_id);

    Ok(HttpResponse::Ok().json(json!({
        "user_id": user_id,
        "connected": connection_count > 0,
        "connection_count": connection_count,
        "backlog": state.broker.backlog_len(&user_id),
    })))
}

/// Broker-wide counters
///
/// Endpoint: GET /api/v1/notifications/stats
pub async fn broker_stats(state: web::Data<AppState>) -> AppResult<HttpResponse> {
    Ok(HttpResponse::Ok().json(state.broker.stats()))
}

pub fn register_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1/notifications")
            .route("/stream", web::get().to(super::stream::stream_events))
            .route("/publish/{user_id}", web::post().to(publish_event))
            .route("/broadcast", web::post().to(broadcast_event))
            .route("/status/{user_id}", web::get().to(user_status))
            .route("/stats", web::get().to(broker_stats)),
    );
}
