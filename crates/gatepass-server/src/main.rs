// ============================================================================
// gatepass-server — webhook + WebApp bridge
// ============================================================================
// Endpoints:
//   POST /webhook      Telegram updates (commands, payments); always 200
//   POST /api/verify   WebApp hop 1: authenticate session, bind origin token
//   GET  /api/final    WebApp hop 2: redeem token, hand out the invite
//   GET  /healthz      liveness
// ============================================================================

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    extract::{ConnectInfo, Query, State},
    http::{HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info};

use gatepass_core::{
    AccessGrant, AppConfig, Bot, GateDb, GateError, TelegramClient, Update, VerifyOutcome,
};

struct AppState {
    bot: Bot,
    grant: AccessGrant,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    if let Err(e) = dotenvy::dotenv() {
        eprintln!("Warning: Could not load .env file: {e}");
    }

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("gatepass_core=debug".parse()?)
                .add_directive("gatepass_server=debug".parse()?),
        )
        .init();

    let config = AppConfig::from_env()?;
    info!("Starting gatepass-server");

    let db = Arc::new(GateDb::open(config.db_path.as_deref())?);
    let telegram = Arc::new(TelegramClient::new(
        config.bot_token.clone(),
        config.bot_username.clone(),
    ));
    let grant = AccessGrant::new(db.clone(), telegram.clone(), config.bot_token.clone());
    let bot = Bot::new(db, telegram, grant.clone());
    let state = Arc::new(AppState { bot, grant });

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/webhook", post(webhook))
        .route("/api/verify", post(verify))
        .route("/api/final", get(final_redemption))
        .with_state(state);

    let addr: SocketAddr = config.http_bind.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("gatepass-server listening on http://{addr}");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

/// Telegram webhook. Always acknowledged, so a poisoned update is not
/// redelivered forever; handler errors are logged inside the router.
async fn webhook(State(state): State<Arc<AppState>>, Json(update): Json<Update>) -> StatusCode {
    state.bot.handle_update(update).await;
    StatusCode::OK
}

#[derive(Deserialize)]
struct VerifyRequest {
    #[serde(rename = "initData")]
    init_data: String,
}

async fn verify(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(body): Json<VerifyRequest>,
) -> Response {
    let ip = client_ip(&headers, addr);
    match state.grant.verify_session(&body.init_data, &ip) {
        Ok(VerifyOutcome {
            short_link: Some(link),
        }) => Json(json!({ "status": "ok", "shortLink": link })).into_response(),
        Ok(VerifyOutcome { short_link: None }) => {
            Json(json!({ "status": "ok" })).into_response()
        }
        Err(GateError::Authentication(_)) | Err(GateError::InvalidCode) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "Invalid Telegram data" })),
        )
            .into_response(),
        Err(err) => {
            error!("verify failed: {}", err);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

#[derive(Deserialize)]
struct FinalQuery {
    entity_id: Option<String>,
}

async fn final_redemption(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<FinalQuery>,
) -> Response {
    let Some(entity_id) = query
        .entity_id
        .as_deref()
        .and_then(|raw| raw.parse::<i64>().ok())
    else {
        return (StatusCode::FORBIDDEN, "Access denied").into_response();
    };

    let ip = client_ip(&headers, addr);
    match state.grant.final_redeem(&ip, entity_id).await {
        Ok(invite_url) => Html(access_granted_page(&invite_url)).into_response(),
        Err(GateError::Denied(reason)) => {
            (StatusCode::FORBIDDEN, format!("Access denied: {reason}")).into_response()
        }
        Err(GateError::InvalidCode) => {
            (StatusCode::FORBIDDEN, "Access denied: invalid entry").into_response()
        }
        Err(err) => {
            error!("final redemption failed: {}", err);
            (StatusCode::INTERNAL_SERVER_ERROR, "Unable to respond").into_response()
        }
    }
}

/// First hop of x-forwarded-for, else the socket peer address
fn client_ip(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

fn access_granted_page(invite_url: &str) -> String {
    format!(
        r#"<html>
  <body style="font-family:sans-serif">
    <h3>Access Granted ✅</h3>
    <p>This link expires in 5 minutes and works once.</p>
    <a href="{invite_url}" target="_blank">Join Telegram</a>
  </body>
</html>"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "192.0.2.10:5000".parse().unwrap()
    }

    #[test]
    fn test_client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "203.0.113.7, 10.0.0.1".parse().unwrap());
        assert_eq!(client_ip(&headers, addr()), "203.0.113.7");
    }

    #[test]
    fn test_client_ip_falls_back_to_peer() {
        let headers = HeaderMap::new();
        assert_eq!(client_ip(&headers, addr()), "192.0.2.10");
    }

    #[test]
    fn test_client_ip_ignores_empty_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", "".parse().unwrap());
        assert_eq!(client_ip(&headers, addr()), "192.0.2.10");
    }

    #[test]
    fn test_access_granted_page_embeds_invite() {
        let page = access_granted_page("https://t.me/+abcdef");
        assert!(page.contains(r#"href="https://t.me/+abcdef""#));
    }
}
