//! Lifecycle Supervisor for the upload API: serves the presigned-upload
//! HTTP surface and runs the stale-upload reaper in the background, sharing
//! one database pool and one shutdown signal. Does not run the Delivery
//! Engine -- a completed upload is handed off to the messaging worker via a
//! single `publish_initial` call, never consumed here.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::{web, App, HttpResponse, HttpServer};
use db_pool::{create_pool, DbConfig};
use prometheus::{Encoder, TextEncoder};
use retry_publisher::{PublisherConfig, RetryPublisher, TopologyConfig};
use stale_reaper::{ReaperConfig, StaleReaper};
use upload_coordinator::metrics::CoordinatorMetrics;
use upload_coordinator::object_store::{S3Config, S3ObjectStore};
use upload_coordinator::repository::PgUploadRepository;
use upload_coordinator::{routes, CoordinatorConfig, UploadCoordinator};

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

    tracing::info!("starting upload api");

    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let broker_url = std::env::var("BROKER_URL").ok();

    let mut db_config = DbConfig::for_service("upload-api");
    db_config.database_url = database_url;
    let db_pool = create_pool(db_config).await.map_err(io::Error::other)?;
    tracing::info!("database pool ready");

    let upload_repository = Arc::new(PgUploadRepository::new(db_pool.clone()));

    let s3_config = S3Config {
        bucket: env_or("OBJECT_STORE_BUCKET", "nova-uploads"),
        region: env_or("AWS_REGION", "us-east-1"),
        endpoint: std::env::var("OBJECT_STORE_ENDPOINT").ok(),
    };
    let object_store = Arc::new(S3ObjectStore::connect(&s3_config).await);

    let publisher = match &broker_url {
        Some(url) => {
            let topology = TopologyConfig {
                main_exchange: env_or("MAIN_EXCHANGE", "X_main"),
                main_queue: env_or("MAIN_QUEUE", "Q_main"),
                binding_keys: Vec::new(),
                domain: env_or("DOMAIN", "nova"),
            };
            match RetryPublisher::connect(
                PublisherConfig {
                    amqp_url: url.clone(),
                    ..PublisherConfig::default()
                },
                topology,
            ) {
                Ok(p) => Some(Arc::new(p)),
                Err(e) => {
                    tracing::warn!(error = %e, "could not connect retry publisher, processing handoff disabled");
                    None
                }
            }
        }
        None => {
            tracing::warn!("BROKER_URL not set, processing handoff disabled");
            None
        }
    };

    let coordinator_config = CoordinatorConfig {
        max_bytes: env_parse_or("UPLOAD_MAX_BYTES", 10 * 1024 * 1024),
        presign_ttl: Duration::from_secs(env_parse_or("PRESIGN_TTL_SECS", 900)),
    };
    let coordinator = web::Data::new(UploadCoordinator::new(
        upload_repository,
        object_store.clone(),
        publisher,
        coordinator_config,
        CoordinatorMetrics::new("upload-api"),
    ));

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let reaper_config = ReaperConfig {
        pending_age: Duration::from_secs(env_parse_or("REAPER_PENDING_AGE_SECS", 24 * 3600)),
        failed_age: Duration::from_secs(env_parse_or("REAPER_FAILED_AGE_SECS", 7 * 24 * 3600)),
        tick: Duration::from_secs(env_parse_or("REAPER_TICK_SECS", 3600)),
        ..ReaperConfig::default()
    };
    let reaper_repository = Arc::new(stale_reaper::SqlxStaleUploadRepository::new(db_pool.clone()));
    let reaper = Arc::new(StaleReaper::new(
        reaper_repository,
        object_store,
        reaper_config,
        stale_reaper::metrics::ReaperMetrics::new("upload-api"),
    ));

    let reaper_handle = {
        let reaper = reaper.clone();
        let rx = shutdown_rx.clone();
        tokio::spawn(async move { reaper.run(rx).await })
    };

    let http_port = env_or("HTTP_PORT", "8081");
    let addr = format!("0.0.0.0:{}", http_port);
    tracing::info!(addr = %addr, "starting http server");

    let server = HttpServer::new(move || {
        App::new()
            .wrap(Cors::permissive())
            .app_data(coordinator.clone())
            .route("/health", web::get().to(health))
            .route("/metrics", web::get().to(metrics))
            .configure(routes::configure::<PgUploadRepository, S3ObjectStore>)
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

    tracing::info!("waiting for reaper to drain");
    let _ = tokio::time::timeout(Duration::from_secs(30), reaper_handle).await;

    db_pool.close().await;
    tracing::info!("upload api stopped");

    Ok(())
}
