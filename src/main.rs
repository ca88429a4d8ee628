use idempotent_request::api::{create_router, AppState};
use idempotent_request::config::Settings;
use idempotent_request::idempotency::{MemoryStorage, RedisStorage, StorageBackend};
use idempotent_request::observability::{init_logging, init_metrics};
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let settings = Settings::new()?;

    init_logging(&settings.application.log_config())?;
    info!("Configuration loaded");

    let metrics_handle = init_metrics()?;

    let storage: Arc<dyn StorageBackend> = match &settings.redis.url {
        Some(url) => {
            info!("Connecting to Redis at {}...", url);
            let client = redis::Client::open(url.as_str())?;
            let mut con = client.get_multiplexed_async_connection().await?;
            let _: () = redis::cmd("PING").query_async(&mut con).await?;
            info!("Redis connection established");
            Arc::new(RedisStorage::new(client))
        }
        None => {
            warn!("redis.url is not set, using in-process storage (single instance only)");
            Arc::new(MemoryStorage::new())
        }
    };

    let coordinator = Arc::new(settings.idempotency.build_coordinator(storage)?);
    let state = AppState::new(coordinator).with_metrics(metrics_handle);

    // Outermost layer last: request ids are assigned before tracing and idempotency run.
    let app = create_router(state)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid));

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", settings.application.port)).await?;
    info!("Listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;

    Ok(())
}
