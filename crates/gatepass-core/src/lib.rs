//! ============================================================================
//! GATEPASS-CORE: the access-grant protocol
//! ============================================================================
//! This crate handles all backend logic for the Gatepass bot:
//! - Telegram WebApp session authentication (two-stage HMAC)
//! - One-time, IP-bound access tokens with compare-and-set redemption
//! - The Stars balance ledger with atomic conditional debits
//! - The short-code link registry and moderator revenue share
//! - One-time invite issuance through the Telegram Bot API
//! ============================================================================

pub mod auth;
pub mod bot;
pub mod config;
pub mod db;
pub mod grant;
pub mod telegram;
pub mod types;

// Re-export main types for convenience
pub use bot::Bot;
pub use config::AppConfig;
pub use db::{AccessTokenRecord, DbStats, GateDb, LinkRecord, RoleRecord, UserRecord};
pub use grant::{extract_access_code, origin_hash, AccessGrant};
pub use telegram::{InviteIssuer, TelegramClient, Update};
pub use types::*;
