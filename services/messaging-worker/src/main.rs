//! Lifecycle Supervisor for the messaging worker: owns the Delivery Engine
//! (consuming the main queue, dispatching through the effect-handler
//! registry, driving retries through the Retry Publisher) and the Outbox
//! Pump, sharing one broker connection pool's config and one shutdown
//! signal. Shuts components down in reverse dependency order on SIGINT:
//! engine, then outbox pump, then the database pool.

mod image_deriver;

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, App, HttpResponse, HttpServer};
use db_pool::{create_pool, DbConfig};
use delivery_engine::{DeliveryEngine, EngineConfig, TopologyConfig};
use effect_handlers::{build_registry, routing_keys, NoopEmailSender, NoopImageDeriver, NoopSubjectNotifier};
use idempotency_store::RedisIdempotencyStore;
use image_deriver::StateTrackingImageDeriver;
use outbox_pump::{metrics::OutboxMetrics, OutboxProcessor, PgBehaviorLogWriter, SqlxOutboxRepository};
use prometheus::{Encoder, TextEncoder};
use retry_publisher::{PublisherConfig, RetryPublisher};
use upload_coordinator::repository::PgUploadRepository;

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

async fn health() -> HttpResponse {
    HttpResponse::Ok().body("OK")
}

async fn metrics() -> HttpResponse {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&families, &mut buffer) {
        return HttpResponse::InternalServerError().body(e.to_string());
    }
    HttpResponse::Ok().content_type(encoder.format_type()).body(buffer)
}

#[actix_web::main]
async fn main() -> io::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    if env_or("LOG_FORMAT", "text") == "json" {
        tracing_subscriber::fmt().with_env_filter(env_filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    tracing::info!("starting messaging worker");

    let broker_url = std::env::var("BROKER_URL").expect("BROKER_URL must be set");
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let domain = env_or("DOMAIN", "nova");
    let main_exchange = env_or("MAIN_EXCHANGE", "X_main");
    let main_queue = env_or("MAIN_QUEUE", "Q_main");
    let binding_keys: Vec<String> = std::env::var("BINDING_KEYS")
        .ok()
        .map(|v| v.split(',').map(|s| s.trim().to_string()).collect())
        .unwrap_or_else(|| {
            vec![
                routing_keys::SEND_VERIFICATION.to_string(),
                routing_keys::SEND_PASSWORD_RESET.to_string(),
                routing_keys::NOTIFY_SUBJECT_CANCELED.to_string(),
                routing_keys::PROCESS_UPLOADED_IMAGE.to_string(),
            ]
        });
    let prefetch: u16 = env_parse_or("PREFETCH", 10);
    let consumer_tag = env_or("CONSUMER_TAG", "messaging-worker");
    let max_attempts: u32 = env_parse_or("MAX_ATTEMPTS", 5);
    let shutdown_grace: u64 = env_parse_or("SHUTDOWN_GRACE", 30);
    let redis_url = env_or("REDIS_URL", "redis://127.0.0.1:6379");
    let outbox_batch_size: i64 = env_parse_or("OUTBOX_BATCH_SIZE", 100);
    let outbox_poll_interval: u64 = env_parse_or("OUTBOX_POLL_INTERVAL", 5);

    let mut db_config = DbConfig::for_service("messaging-worker");
    db_config.database_url = database_url;
    let db_pool = create_pool(db_config).await.map_err(io::Error::other)?;
    tracing::info!("database pool ready");

    let idempotency_store = Arc::new(
        RedisIdempotencyStore::connect(&redis_url, "messaging-worker")
            .await
            .map_err(io::Error::other)?,
    );
    tracing::info!("idempotency store connected");

    let upload_repository = Arc::new(PgUploadRepository::new(db_pool.clone()));
    let image_deriver = Arc::new(StateTrackingImageDeriver::new(upload_repository, Arc::new(NoopImageDeriver)));

    let registry = Arc::new(build_registry(
        idempotency_store,
        Arc::new(NoopEmailSender),
        Arc::new(NoopSubjectNotifier),
        image_deriver,
    ));

    let topology = TopologyConfig {
        main_exchange,
        main_queue,
        binding_keys,
        domain,
    };

    let publisher = Arc::new(
        RetryPublisher::connect(
            PublisherConfig {
                amqp_url: broker_url.clone(),
                ..PublisherConfig::default()
            },
            topology.clone(),
        )
        .map_err(io::Error::other)?,
    );

    let engine = Arc::new(
        DeliveryEngine::connect(
            EngineConfig {
                amqp_url: broker_url,
                consumer_tag,
                prefetch,
                max_attempts,
            },
            topology,
            registry,
            publisher,
        )
        .map_err(io::Error::other)?,
    );

    let outbox_repository = Arc::new(SqlxOutboxRepository::new(db_pool.clone()));
    let outbox_writer = Arc::new(PgBehaviorLogWriter);
    let outbox_processor = Arc::new(OutboxProcessor::new_with_metrics(
        outbox_repository,
        outbox_writer,
        OutboxMetrics::new("messaging-worker"),
        outbox_batch_size,
        Duration::from_secs(outbox_poll_interval),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let engine_handle = {
        let engine = engine.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run(rx).await {
                tracing::error!(error = %e, "delivery engine exited");
            }
        })
    };

    let outbox_handle = {
        let processor = outbox_processor.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { processor.run(rx).await })
    };

    let http_port = env_or("HTTP_PORT", "8080");
    let addr = format!("0.0.0.0:{}", http_port);
    tracing::info!(addr = %addr, "starting http server");

    let server = HttpServer::new(|| {
        App::new()
            .route("/health", web::get().to(health))
            .route("/metrics", web::get().to(metrics))
    })
    .bind(&addr)?
    .run();

    let server_handle = server.handle();

    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
        let _ = shutdown_tx.send(true);
        server_handle.stop(true).await;
    });

    server.await?;

    tracing::info!(grace_secs = shutdown_grace, "waiting for background components to drain");
    let _ = tokio::time::timeout(Duration::from_secs(shutdown_grace), async {
        let _ = engine_handle.await;
        let _ = outbox_handle.await;
    })
    .await;

    db_pool.close().await;
    tracing::info!("messaging worker stopped");

    Ok(())
}
