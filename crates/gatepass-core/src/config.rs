//! ============================================================================
//! Configuration - environment-driven settings
//! ============================================================================

use anyhow::Context;

/// Process configuration, read once at startup
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Bot API token; also keys the WebApp session verification
    pub bot_token: String,
    /// Bot username, used for deep links
    pub bot_username: String,
    /// Database path override (GATEPASS_DB_PATH)
    pub db_path: Option<String>,
    /// HTTP bind address for the webhook and bridge endpoints
    pub http_bind: String,
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let bot_token = std::env::var("BOT_TOKEN").context("BOT_TOKEN is not set")?;
        let bot_username = std::env::var("BOT_USERNAME").context("BOT_USERNAME is not set")?;

        Ok(Self {
            bot_token,
            bot_username,
            db_path: std::env::var("GATEPASS_DB_PATH").ok(),
            http_bind: std::env::var("GATEPASS_HTTP_BIND")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
        })
    }
}
