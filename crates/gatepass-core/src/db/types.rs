//! ============================================================================
//! Database Types - Serializable records for redb storage
//! ============================================================================

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// User record stored in the local database.
/// Created on first interaction, never deleted; the balance is mutated only
/// through the atomic ledger operations on `GateDb`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: u64,
    /// Balance in Telegram Stars
    pub balance: u64,
    pub created_at: i64,
}

impl UserRecord {
    pub fn new(id: u64, created_at: i64) -> Self {
        Self {
            id,
            balance: 0,
            created_at,
        }
    }
}

/// Paid access link record. Write-once: created by a moderator, immutable
/// thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkRecord {
    pub short_code: String,
    /// Target channel or group id
    pub entity_id: i64,
    /// Price in Stars charged on the direct bot path
    pub price: u64,
    /// Moderator who created the link; accrues the revenue share
    pub owner_id: u64,
    /// URL handed to WebApp clients after the verify hop
    pub display_link: String,
    pub created_at: i64,
}

/// One-time access token bound to a network origin.
/// At most one row per origin hash; issuing a new token replaces the row.
/// Redemption flips `verified` in place and never deletes the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessTokenRecord {
    pub origin_hash: String,
    pub user_id: u64,
    /// Short code the token was bound to at the verify hop
    pub short_code: String,
    pub verified: bool,
    pub created_at: i64,
}

/// Role membership entry (moderators and owners tables)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoleRecord {
    pub id: u64,
    pub added_at: i64,
}

/// Database statistics for the inspection tool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbStats {
    pub total_users: usize,
    pub total_links: usize,
    pub links_by_owner: HashMap<u64, usize>,
    pub total_tokens: usize,
    pub redeemed_tokens: usize,
    pub total_moderators: usize,
    pub total_owners: usize,
}
