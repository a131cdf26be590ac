use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use realtime_notify::{handlers, logging, metrics, AppState, Broker, Config};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    logging::init_tracing();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(env = %config.app.env, "Starting realtime notification service");

    let broker = Broker::new(config.notify.broker_config());
    tracing::info!(
        backlog_capacity = config.notify.backlog_capacity,
        heartbeat_interval_secs = config.notify.heartbeat_interval_secs,
        "Notification broker initialized"
    );

    let state = web::Data::new(AppState::new(broker.clone(), config.notify.sse_retry_ms));
    let addr = config.bind_addr();
    tracing::info!("Starting HTTP server on {}", addr);

    HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .wrap(middleware::from_fn(metrics::track_requests))
            .route("/health", web::get().to(|| async { "OK" }))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .route("/", web::get().to(|| async { "Realtime Notification Service v1.0" }))
            .configure(handlers::register_routes)
    })
    .bind(&addr)
    .with_context(|| format!("failed to bind {addr}"))?
    .run()
    .await
    .context("HTTP server error")?;

    broker.shutdown().await;
    tracing::info!("Realtime notification service stopped");
    Ok(())
}
