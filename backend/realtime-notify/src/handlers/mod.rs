/// HTTP host adapter for the broker
pub mod notifications;
pub mod stream;

pub use notifications::register_routes;
pub use stream::{format_sse, EventStream};

use crate::broker::{Broker, UserId};
use crate::error::AppError;
use actix_web::HttpRequest;

/// Header carrying the caller's user id, set by the upstream auth gateway
pub const USER_ID_HEADER: &str = "X-User-Id";

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub broker: Broker,
    pub sse_retry_ms: u64,
}

impl AppState {
    pub fn new(broker: Broker, sse_retry_ms: u64) -> Self {
        Self {
            broker,
            sse_retry_ms,
        }
    }
}

/// Resolve the already-authenticated caller
pub fn caller_id(req: &HttpRequest) -> Result<UserId, AppError> {
    let raw = req
        .headers()
        .get(USER_ID_HEADER)
        .ok_or_else(|| AppError::Unauthorized(format!("missing {USER_ID_HEADER} header")))?;

    raw.to_str()
        .ok()
        .and_then(|value| value.parse().ok())
        .ok_or_else(|| AppError::Unauthorized(format!("invalid {USER_ID_HEADER} header")))
}
