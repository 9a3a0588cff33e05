//! ============================================================================
//! Core Types - Error taxonomy and grant-flow types for Gatepass
//! ============================================================================
//! Every store- or platform-level failure is recovered into `GateError`
//! before it reaches an external interface; nothing propagates as a raw
//! storage error to a bot reply or an HTTP response.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Validity window for access tokens and invite links, in seconds.
pub const ACCESS_TTL_SECS: i64 = 300;

/// Error types for the access-grant protocol
#[derive(Debug, Clone, thiserror::Error)]
pub enum GateError {
    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("invalid access code")]
    InvalidCode,

    #[error("access denied: {0}")]
    Denied(DeniedReason),

    #[error("invite issuance failed: {0}")]
    InviteIssuance(String),

    #[error("telegram API error: {0}")]
    Platform(String),

    #[error("storage error: {0}")]
    Storage(String),
}

/// Reasons an access request is denied. Each maps to a distinct
/// user-visible message at the bot and HTTP boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeniedReason {
    InsufficientBalance,
    TokenNotFound,
    AlreadyRedeemed,
    EntityMismatch,
    OriginMismatch,
    TokenExpired,
    ConcurrentRedemption,
    NotModerator,
    NotChannelAdmin,
    NotOwner,
}

impl std::fmt::Display for DeniedReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DeniedReason::InsufficientBalance => "insufficient balance",
            DeniedReason::TokenNotFound => "no access token for this origin",
            DeniedReason::AlreadyRedeemed => "access token already redeemed",
            DeniedReason::EntityMismatch => "access token bound to a different entity",
            DeniedReason::OriginMismatch => "request origin does not match the token",
            DeniedReason::TokenExpired => "access token expired",
            DeniedReason::ConcurrentRedemption => "token redeemed by a concurrent request",
            DeniedReason::NotModerator => "moderator access required",
            DeniedReason::NotChannelAdmin => "channel admin rights required",
            DeniedReason::NotOwner => "owner access required",
        };
        f.write_str(s)
    }
}

impl GateError {
    /// Shorthand for a denial error
    pub fn denied(reason: DeniedReason) -> Self {
        GateError::Denied(reason)
    }
}

/// Claims extracted from a verified WebApp session payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionClaims {
    pub user_id: u64,
    /// Short access code carried by the deep link that opened the WebApp
    pub start_param: Option<String>,
}

/// Result of the WebApp verify hop: the token is bound and, when the code
/// resolves, the client is handed the link's display URL.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub short_link: Option<String>,
}

/// A granted one-time invite
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GrantedInvite {
    pub entity_id: i64,
    pub invite_url: String,
    /// Price actually charged (0 for moderators)
    pub charged: u64,
}
