/// Integration tests for the realtime-notify HTTP API
///
/// This test module covers:
/// - Publish / broadcast endpoints and their outcomes
/// - Status and stats reporting
/// - SSE stream replay framing
/// - Error handling and response formats
use actix_web::body::MessageBody;
use actix_web::{test, web, App};
use futures::future::poll_fn;
use realtime_notify::handlers::{self, USER_ID_HEADER};
use realtime_notify::{AppState, Broker, UserId};
use serde_json::{json, Value};
use std::pin::Pin;
use uuid::Uuid;

fn app_state(broker: &Broker) -> web::Data<AppState> {
    web::Data::new(AppState::new(broker.clone(), 3000))
}

#[actix_web::test]
async fn test_publish_to_offline_user_is_queued() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;
    let user_id = Uuid::new_v4();

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/publish/{user_id}"))
        .set_json(json!({ "event_type": "progress", "payload": { "progress": 1 } }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["success"], true);
    assert_eq!(body["result"]["outcome"], "queued");
    assert_eq!(broker.backlog_len(&UserId::new(user_id)), 1);
}

#[actix_web::test]
async fn test_publish_rejects_reserved_event_type() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;

    let req = test::TestRequest::post()
        .uri(&format!("/api/v1/notifications/publish/{}", Uuid::new_v4()))
        .set_json(json!({ "event_type": "heartbeat" }))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 400);
    let body: Value = test::read_body_json(resp).await;
    assert_eq!(body["error"], "BAD_REQUEST");
}

#[actix_web::test]
async fn test_status_reports_connections_and_backlog() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;
    let user_id = UserId::new(Uuid::new_v4());
    let (_opened, _rx) = broker.open_channel(user_id).unwrap();

    let req = test::TestRequest::get()
        .uri(&format!("/api/v1/notifications/status/{user_id}"))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;

    assert_eq!(body["connected"], true);
    assert_eq!(body["connection_count"], 1);
    assert_eq!(body["backlog"], 0);
}

#[actix_web::test]
async fn test_broadcast_and_stats() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;
    let (_a, mut rx_a) = broker.open_channel(UserId::new(Uuid::new_v4())).unwrap();
    let (_b, mut rx_b) = broker.open_channel(UserId::new(Uuid::new_v4())).unwrap();

    let req = test::TestRequest::post()
        .uri("/api/v1/notifications/broadcast")
        .set_json(json!({ "event_type": "broadcast", "payload": { "title": "Maintenance" } }))
        .to_request();
    let body: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(body["users"], 2);
    assert_eq!(rx_a.recv().await.unwrap().event_type(), "broadcast");
    assert_eq!(rx_b.recv().await.unwrap().event_type(), "broadcast");

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/stats")
        .to_request();
    let stats: Value = test::call_and_read_body_json(&app, req).await;
    assert_eq!(stats["total_connections"], 2);
    assert_eq!(stats["events_delivered"], 2);
}

#[actix_web::test]
async fn test_stream_requires_user_header() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/stream")
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 401);
    assert_eq!(broker.total_connections(), 0);
}

#[actix_web::test]
async fn test_stream_replays_backlog_as_sse() {
    let broker = Broker::default();
    let app = test::init_service(
        App::new()
            .app_data(app_state(&broker))
            .configure(handlers::register_routes),
    )
    .await;
    let user_id = UserId::new(Uuid::new_v4());
    broker.publish(
        user_id,
        realtime_notify::Event::new("payment_confirmed", json!({ "amount": 1999 })),
    );

    let req = test::TestRequest::get()
        .uri("/api/v1/notifications/stream")
        .insert_header((USER_ID_HEADER, user_id.to_string()))
        .to_request();
    let resp = test::call_service(&app, req).await;

    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers().get("content-type").unwrap(),
        "text/event-stream"
    );
    assert_eq!(broker.connection_count(&user_id), 1);

    let mut body = resp.into_body();
    let retry = poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&retry[..], b"retry: 3000\n\n");

    let replay = poll_fn(|cx| Pin::new(&mut body).poll_next(cx))
        .await
        .unwrap()
        .unwrap();
    let text = std::str::from_utf8(&replay).unwrap();
    assert!(text.contains("event: payment_confirmed\n"));
    assert!(text.contains("\"amount\":1999"));
    assert_eq!(broker.backlog_len(&user_id), 0);
}
