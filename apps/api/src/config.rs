use anyhow::{Context, Result};

/// Application configuration loaded from environment variables.
/// Fails at startup if required variables are missing.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    /// Absent → the broker is considered unreachable and every dispatch runs
    /// in direct mode.
    pub redis_url: Option<String>,
    pub browser_server_url: String,
    pub captcha_api_url: String,
    pub captcha_api_key: String,
    pub mailbox_server_url: String,
    pub port: u16,
    pub rust_log: String,

    pub daily_application_limit: i64,
    pub default_max_retries: i32,
    pub queue_concurrency: usize,

    /// Recipes whose success rate sinks below this floor are no longer
    /// replayed and must be re-recorded.
    pub recipe_retirement_floor: f64,
    /// Attempts a recipe gets before the floor applies.
    pub recipe_min_sample: i32,
    /// 0 = cumulative statistics; N > 0 = trailing window over the last N
    /// logged executions.
    pub recipe_stats_window: i64,
    pub recording_cost: f64,
    pub replay_cost: f64,

    pub captcha_low_balance_threshold: f64,
    pub platform_cache_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok(); // load .env if present; ignore if missing

        Ok(Config {
            database_url: require_env("DATABASE_URL")?,
            redis_url: std::env::var("REDIS_URL").ok().filter(|v| !v.is_empty()),
            browser_server_url: require_env("BROWSER_SERVER_URL")?,
            captcha_api_url: require_env("CAPTCHA_API_URL")?,
            captcha_api_key: require_env("CAPTCHA_API_KEY")?,
            mailbox_server_url: require_env("MAILBOX_SERVER_URL")?,
            port: parse_env("PORT", 8080)?,
            rust_log: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),

            daily_application_limit: parse_env("DAILY_APPLICATION_LIMIT", 10)?,
            default_max_retries: parse_env("DEFAULT_MAX_RETRIES", 3)?,
            queue_concurrency: parse_env("QUEUE_CONCURRENCY", 4)?,

            recipe_retirement_floor: parse_env("RECIPE_RETIREMENT_FLOOR", 0.5)?,
            recipe_min_sample: parse_env("RECIPE_MIN_SAMPLE", 3)?,
            recipe_stats_window: parse_env("RECIPE_STATS_WINDOW", 0)?,
            recording_cost: parse_env("RECORDING_COST", 0.80)?,
            replay_cost: parse_env("REPLAY_COST", 0.05)?,

            captcha_low_balance_threshold: parse_env("CAPTCHA_LOW_BALANCE_THRESHOLD", 2.0)?,
            platform_cache_capacity: parse_env("PLATFORM_CACHE_CAPACITY", 512)?,
        })
    }
}

fn require_env(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("Required environment variable '{key}' is not set"))
}

fn parse_env<T>(key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse::<T>()
            .with_context(|| format!("Environment variable '{key}' is not a valid value")),
        Err(_) => Ok(default),
    }
}
