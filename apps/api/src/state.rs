use std::sync::{Arc, Mutex};

use sqlx::PgPool;

use crate::automation::captcha::CaptchaClient;
use crate::automation::mailbox::MailboxClient;
use crate::automation::BrowserDriver;
use crate::cache::BoundedCache;
use crate::config::Config;
use crate::dispatch::broker::Broker;
use crate::events::ProgressHub;

/// Shared application state injected into all route handlers via Axum extractors.
#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    /// Present when REDIS_URL is configured and reachable; `None` runs the
    /// dispatcher in direct mode.
    pub broker: Option<Broker>,
    /// Pluggable browser automation backend. Default: the HTTP sidecar
    /// client pointed at BROWSER_SERVER_URL.
    pub driver: Arc<dyn BrowserDriver>,
    pub captcha: CaptchaClient,
    pub mailbox: MailboxClient,
    /// Per-application progress channels feeding the SSE endpoint.
    pub hub: Arc<ProgressHub>,
    /// Host → platform memo for recipe lookup.
    pub platform_cache: Arc<Mutex<BoundedCache<String, String>>>,
    pub config: Config,
}
