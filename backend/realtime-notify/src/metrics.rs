/// Prometheus metrics for the broker and its HTTP surface
use actix_web::{
    body::MessageBody,
    dev::{ServiceRequest, ServiceResponse},
    middleware::Next,
    Error, HttpResponse,
};
use once_cell::sync::Lazy;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Instant;
use tracing::error;

static OPEN_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    register_int_gauge!(
        "realtime_notify_open_connections",
        "Currently open realtime connections"
    )
    .expect("Failed to register open connections metric")
});

static EVENTS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    register_int_counter_vec!(
        "realtime_notify_events_total",
        "Published events by outcome (delivered, queued, dropped, discarded)",
        &["outcome"]
    )
    .expect("Failed to register events metric")
});

static SINK_WRITE_FAILURES: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "realtime_notify_sink_write_failures_total",
        "Connections torn down because their sink failed or fell behind"
    )
    .expect("Failed to register sink write failures metric")
});

static HEARTBEATS: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!(
        "realtime_notify_heartbeats_total",
        "Heartbeats written to open connections"
    )
    .expect("Failed to register heartbeats metric")
});

// Labelled by route pattern; a raw path would carry user ids
static HTTP_REQUEST_DURATION: Lazy<HistogramVec> = Lazy::new(|| {
    register_histogram_vec!(
        "realtime_notify_http_request_duration_seconds",
        "HTTP request latency by route and status",
        &["method", "route", "status"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]
    )
    .expect("Failed to register HTTP request duration metric")
});

pub fn connection_opened() {
    OPEN_CONNECTIONS.inc();
}

pub fn connection_closed() {
    OPEN_CONNECTIONS.dec();
}

pub fn record_event(outcome: &str, count: u64) {
    if count > 0 {
        EVENTS_TOTAL.with_label_values(&[outcome]).inc_by(count);
    }
}

pub fn record_write_failure() {
    SINK_WRITE_FAILURES.inc();
}

pub fn record_heartbeat() {
    HEARTBEATS.inc();
}

/// Request timing middleware, mounted with `middleware::from_fn`.
///
/// SSE responses are timed until their headers go out, not for the life of
/// the stream.
pub async fn track_requests(
    req: ServiceRequest,
    next: Next<impl MessageBody>,
) -> Result<ServiceResponse<impl MessageBody>, Error> {
    let method = req.method().to_string();
    let start = Instant::now();

    let response = next.call(req).await?;
    let route = response
        .request()
        .match_pattern()
        .unwrap_or_else(|| "unmatched".to_string());
    HTTP_REQUEST_DURATION
        .with_label_values(&[&method, &route, response.status().as_str()])
        .observe(start.elapsed().as_secs_f64());

    Ok(response)
}

/// Endpoint: GET /metrics
pub async fn serve_metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return HttpResponse::InternalServerError().finish();
    }

    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{middleware, test, web, App};

    fn gathered_names() -> Vec<String> {
        prometheus::gather()
            .iter()
            .map(|family| family.get_name().to_string())
            .collect()
    }

    #[::core::prelude::v1::test]
    fn test_broker_metrics_are_gathered() {
        record_event("queued", 1);
        record_write_failure();
        record_heartbeat();

        let names = gathered_names();
        assert!(names.contains(&"realtime_notify_events_total".to_string()));
        assert!(names.contains(&"realtime_notify_sink_write_failures_total".to_string()));
        assert!(names.contains(&"realtime_notify_heartbeats_total".to_string()));
    }

    #[actix_web::test]
    async fn test_requests_labelled_by_route_pattern() {
        let app = test::init_service(
            App::new()
                .wrap(middleware::from_fn(track_requests))
                .route("/users/{id}", web::get().to(|| async { HttpResponse::Ok().finish() })),
        )
        .await;

        let req = test::TestRequest::get().uri("/users/42").to_request();
        assert!(test::call_service(&app, req).await.status().is_success());

        let samples = HTTP_REQUEST_DURATION
            .with_label_values(&["GET", "/users/{id}", "200"])
            .get_sample_count();
        assert!(samples >= 1);
    }
}
