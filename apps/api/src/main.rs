mod applications;
mod assist;
mod automation;
mod cache;
mod config;
mod db;
mod dispatch;
mod engine;
mod errors;
mod events;
mod models;
mod routes;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::automation::captcha::CaptchaClient;
use crate::automation::mailbox::MailboxClient;
use crate::automation::{BrowserDriver, HttpBrowserDriver};
use crate::cache::BoundedCache;
use crate::config::Config;
use crate::db::create_pool;
use crate::dispatch::broker::Broker;
use crate::events::ProgressHub;
use crate::routes::build_router;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (panics on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting AutoApply API v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL (runs pending migrations)
    let db = create_pool(&config.database_url).await?;

    // Initialize the Redis task broker. The service stays up without it:
    // submissions then execute in-process instead of through the queue.
    let broker = match &config.redis_url {
        Some(url) => match Broker::connect(url).await {
            Ok(broker) => {
                if let Err(e) = broker.requeue_orphans().await {
                    warn!("Failed to requeue orphaned tasks: {e:#}");
                }
                info!("Redis broker connected");
                Some(broker)
            }
            Err(e) => {
                warn!("Redis unavailable, dispatching directly: {e:#}");
                None
            }
        },
        None => {
            info!("REDIS_URL not set; dispatching directly");
            None
        }
    };

    // Initialize sidecar clients
    let driver: Arc<dyn BrowserDriver> =
        Arc::new(HttpBrowserDriver::new(config.browser_server_url.clone()));
    info!("Browser driver client initialized");

    let captcha = CaptchaClient::new(
        config.captcha_api_url.clone(),
        config.captcha_api_key.clone(),
    );
    let mailbox = MailboxClient::new(config.mailbox_server_url.clone());

    // Build app state
    let state = AppState {
        db,
        broker,
        driver,
        captcha,
        mailbox,
        hub: Arc::new(ProgressHub::new()),
        platform_cache: Arc::new(Mutex::new(BoundedCache::new(config.platform_cache_capacity))),
        config: config.clone(),
    };

    // Start queue consumers (no-op in direct mode)
    dispatch::runner::spawn_consumers(&state);

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
