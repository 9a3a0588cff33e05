// ============================================================================
// GateDb — Embedded Database (redb)
// ============================================================================
// Persistent storage for users, links, access tokens, and role sets.
// Default path: ./gatepass.redb (override via GATEPASS_DB_PATH env var)
//
// All cross-request coordination happens here: handlers share no in-process
// state, so every balance or token mutation is a single redb write
// transaction. redb serializes writers, which is what makes the conditional
// debit and the redeem compare-and-set atomic.
// ============================================================================

pub mod types;

pub use types::{AccessTokenRecord, DbStats, LinkRecord, RoleRecord, UserRecord};

use redb::{Database, ReadableTable, TableDefinition};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::types::{DeniedReason, GateError, ACCESS_TTL_SECS};

// Table definitions
const USERS: TableDefinition<u64, &[u8]> = TableDefinition::new("users");
const LINKS: TableDefinition<&str, &[u8]> = TableDefinition::new("links");
const ACCESS_TOKENS: TableDefinition<&str, &[u8]> = TableDefinition::new("access_tokens");
const MODERATORS: TableDefinition<u64, &[u8]> = TableDefinition::new("moderators");
const OWNERS: TableDefinition<u64, &[u8]> = TableDefinition::new("owners");

fn storage(context: &str, err: impl std::fmt::Display) -> GateError {
    GateError::Storage(format!("{context}: {err}"))
}

/// Embedded database for the access-grant protocol
pub struct GateDb {
    db: Database,
    path: PathBuf,
}

impl GateDb {
    /// Open (or create) the database at the given path.
    /// If `path` is None, uses GATEPASS_DB_PATH env var or ./gatepass.redb
    pub fn open(path: Option<&str>) -> Result<Self, GateError> {
        let db_path = if let Some(p) = path {
            PathBuf::from(p)
        } else if let Ok(env_path) = std::env::var("GATEPASS_DB_PATH") {
            PathBuf::from(env_path)
        } else {
            PathBuf::from("gatepass.redb")
        };

        info!("Opening database at: {}", db_path.display());

        let db = Database::create(&db_path)
            .map_err(|e| storage("failed to open database", e))?;

        // Ensure tables exist by doing a write transaction
        let write_txn = db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let _ = write_txn
                .open_table(USERS)
                .map_err(|e| storage("failed to create users table", e))?;
            let _ = write_txn
                .open_table(LINKS)
                .map_err(|e| storage("failed to create links table", e))?;
            let _ = write_txn
                .open_table(ACCESS_TOKENS)
                .map_err(|e| storage("failed to create access_tokens table", e))?;
            let _ = write_txn
                .open_table(MODERATORS)
                .map_err(|e| storage("failed to create moderators table", e))?;
            let _ = write_txn
                .open_table(OWNERS)
                .map_err(|e| storage("failed to create owners table", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit init", e))?;

        info!("Database ready");

        Ok(Self { db, path: db_path })
    }

    /// Get the database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    // ========================================================================
    // Ledger Operations
    // ========================================================================

    /// Current balance in Stars (absent user reads as 0)
    pub fn balance(&self, user_id: u64) -> Result<u64, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(|e| storage("failed to open users table", e))?;

        match table
            .get(user_id)
            .map_err(|e| storage("failed to get user", e))?
        {
            Some(value) => {
                let user: UserRecord = bincode::deserialize(value.value())
                    .map_err(|e| storage("failed to deserialize user", e))?;
                Ok(user.balance)
            }
            None => Ok(0),
        }
    }

    /// Atomic increment, creating the user row if absent.
    /// Used for deposits and for the moderator revenue share.
    pub fn credit(&self, user_id: u64, amount: u64) -> Result<u64, GateError> {
        let now = chrono::Utc::now().timestamp();
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        let new_balance;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(|e| storage("failed to open users table", e))?;
            let mut user = match table
                .get(user_id)
                .map_err(|e| storage("failed to get user", e))?
            {
                Some(value) => bincode::deserialize::<UserRecord>(value.value())
                    .map_err(|e| storage("failed to deserialize user", e))?,
                None => UserRecord::new(user_id, now),
            };
            user.balance = user.balance.saturating_add(amount);
            new_balance = user.balance;
            let value =
                bincode::serialize(&user).map_err(|e| storage("failed to serialize user", e))?;
            table
                .insert(user_id, value.as_slice())
                .map_err(|e| storage("failed to insert user", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit credit", e))?;

        debug!("Credited {} stars to user {}", amount, user_id);
        Ok(new_balance)
    }

    /// Atomic conditional decrement: the balance is reduced only if it
    /// covers `amount`, inside one write transaction. Two concurrent debits
    /// can never both pass a stale balance check.
    pub fn debit(&self, user_id: u64, amount: u64) -> Result<u64, GateError> {
        self.debit_with_share(user_id, amount, None)
    }

    /// Conditional debit plus the link owner's revenue-share credit in the
    /// same write transaction, so a grant either charges and shares or does
    /// neither.
    pub fn debit_with_share(
        &self,
        user_id: u64,
        amount: u64,
        share_to: Option<u64>,
    ) -> Result<u64, GateError> {
        let now = chrono::Utc::now().timestamp();
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        let new_balance;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(|e| storage("failed to open users table", e))?;
            let mut user = match table
                .get(user_id)
                .map_err(|e| storage("failed to get user", e))?
            {
                Some(value) => bincode::deserialize::<UserRecord>(value.value())
                    .map_err(|e| storage("failed to deserialize user", e))?,
                None => UserRecord::new(user_id, now),
            };
            if user.balance < amount {
                // Dropping the transaction aborts it; nothing was written.
                return Err(GateError::denied(DeniedReason::InsufficientBalance));
            }
            user.balance -= amount;
            new_balance = user.balance;
            let value =
                bincode::serialize(&user).map_err(|e| storage("failed to serialize user", e))?;
            table
                .insert(user_id, value.as_slice())
                .map_err(|e| storage("failed to insert user", e))?;

            if let Some(owner_id) = share_to {
                let mut owner = match table
                    .get(owner_id)
                    .map_err(|e| storage("failed to get owner", e))?
                {
                    Some(value) => bincode::deserialize::<UserRecord>(value.value())
                        .map_err(|e| storage("failed to deserialize owner", e))?,
                    None => UserRecord::new(owner_id, now),
                };
                owner.balance = owner.balance.saturating_add(amount);
                let value = bincode::serialize(&owner)
                    .map_err(|e| storage("failed to serialize owner", e))?;
                table
                    .insert(owner_id, value.as_slice())
                    .map_err(|e| storage("failed to insert owner", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit debit", e))?;

        debug!(
            "Debited {} stars from user {} (share to {:?})",
            amount, user_id, share_to
        );
        Ok(new_balance)
    }

    /// Create the user row if it does not exist yet
    pub fn ensure_user(&self, user_id: u64) -> Result<(), GateError> {
        let now = chrono::Utc::now().timestamp();
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(USERS)
                .map_err(|e| storage("failed to open users table", e))?;
            let exists = table
                .get(user_id)
                .map_err(|e| storage("failed to get user", e))?
                .is_some();
            if !exists {
                let user = UserRecord::new(user_id, now);
                let value = bincode::serialize(&user)
                    .map_err(|e| storage("failed to serialize user", e))?;
                table
                    .insert(user_id, value.as_slice())
                    .map_err(|e| storage("failed to insert user", e))?;
            }
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit user", e))?;
        Ok(())
    }

    pub fn get_user(&self, user_id: u64) -> Result<Option<UserRecord>, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(USERS)
            .map_err(|e| storage("failed to open users table", e))?;

        match table
            .get(user_id)
            .map_err(|e| storage("failed to get user", e))?
        {
            Some(value) => {
                let user: UserRecord = bincode::deserialize(value.value())
                    .map_err(|e| storage("failed to deserialize user", e))?;
                Ok(Some(user))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Link Registry Operations
    // ========================================================================

    /// Write-once insert. Returns false when the short code is already
    /// taken, so the caller can regenerate; existing records are never
    /// overwritten.
    pub fn insert_link_if_absent(&self, link: &LinkRecord) -> Result<bool, GateError> {
        let value = bincode::serialize(link).map_err(|e| storage("failed to serialize link", e))?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(LINKS)
                .map_err(|e| storage("failed to open links table", e))?;
            let taken = table
                .get(link.short_code.as_str())
                .map_err(|e| storage("failed to get link", e))?
                .is_some();
            if taken {
                return Ok(false);
            }
            table
                .insert(link.short_code.as_str(), value.as_slice())
                .map_err(|e| storage("failed to insert link", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit link", e))?;

        debug!(
            "Created link {} -> entity {} (price {})",
            link.short_code, link.entity_id, link.price
        );
        Ok(true)
    }

    pub fn resolve_link(&self, short_code: &str) -> Result<Option<LinkRecord>, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(LINKS)
            .map_err(|e| storage("failed to open links table", e))?;

        match table
            .get(short_code)
            .map_err(|e| storage("failed to get link", e))?
        {
            Some(value) => {
                let link: LinkRecord = bincode::deserialize(value.value())
                    .map_err(|e| storage("failed to deserialize link", e))?;
                Ok(Some(link))
            }
            None => Ok(None),
        }
    }

    pub fn list_links(&self) -> Result<Vec<LinkRecord>, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(LINKS)
            .map_err(|e| storage("failed to open links table", e))?;

        let mut results = Vec::new();
        let iter = table
            .range::<&str>(..)
            .map_err(|e| storage("failed to iterate links", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| storage("failed to read entry", e))?;
            let link: LinkRecord = bincode::deserialize(value.value())
                .map_err(|e| storage("failed to deserialize link", e))?;
            results.push(link);
        }
        Ok(results)
    }

    // ========================================================================
    // Access Token Operations
    // ========================================================================

    /// Bind a fresh unverified token to the origin, replacing any existing
    /// token for that origin in the same write transaction. Post-condition:
    /// exactly one token exists for the origin, unverified.
    pub fn issue_token(
        &self,
        origin_hash: &str,
        user_id: u64,
        short_code: &str,
    ) -> Result<AccessTokenRecord, GateError> {
        let record = AccessTokenRecord {
            origin_hash: origin_hash.to_string(),
            user_id,
            short_code: short_code.to_string(),
            verified: false,
            created_at: chrono::Utc::now().timestamp(),
        };
        let value =
            bincode::serialize(&record).map_err(|e| storage("failed to serialize token", e))?;

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(ACCESS_TOKENS)
                .map_err(|e| storage("failed to open access_tokens table", e))?;
            let replaced = table
                .remove(origin_hash)
                .map_err(|e| storage("failed to remove token", e))?
                .is_some();
            if replaced {
                debug!("Invalidated previous token for origin {}", origin_hash);
            }
            table
                .insert(origin_hash, value.as_slice())
                .map_err(|e| storage("failed to insert token", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit token", e))?;

        debug!(
            "Issued access token for origin {} (user {}, code {})",
            origin_hash, user_id, short_code
        );
        Ok(record)
    }

    /// Consume the origin's token for `expected_entity_id`.
    ///
    /// Runs as a compare-and-set: a read phase performs every denial check
    /// (presence, replay, expiry, entity binding), then a write transaction
    /// re-reads the row and flips `verified` only if it is still the same
    /// unverified token. A token that flipped between the phases lost to a
    /// concurrent redemption. The record is kept after verification; it is
    /// never deleted on this path.
    pub fn redeem_token(
        &self,
        origin_hash: &str,
        expected_entity_id: i64,
        now: i64,
    ) -> Result<LinkRecord, GateError> {
        let (token, link) = {
            let read_txn = self
                .db
                .begin_read()
                .map_err(|e| storage("failed to begin read", e))?;
            let tokens = read_txn
                .open_table(ACCESS_TOKENS)
                .map_err(|e| storage("failed to open access_tokens table", e))?;
            let token = match tokens
                .get(origin_hash)
                .map_err(|e| storage("failed to get token", e))?
            {
                Some(value) => bincode::deserialize::<AccessTokenRecord>(value.value())
                    .map_err(|e| storage("failed to deserialize token", e))?,
                None => return Err(GateError::denied(DeniedReason::TokenNotFound)),
            };
            if token.verified {
                return Err(GateError::denied(DeniedReason::AlreadyRedeemed));
            }
            if now - token.created_at > ACCESS_TTL_SECS {
                return Err(GateError::denied(DeniedReason::TokenExpired));
            }

            let links = read_txn
                .open_table(LINKS)
                .map_err(|e| storage("failed to open links table", e))?;
            let link = match links
                .get(token.short_code.as_str())
                .map_err(|e| storage("failed to get link", e))?
            {
                Some(value) => bincode::deserialize::<LinkRecord>(value.value())
                    .map_err(|e| storage("failed to deserialize link", e))?,
                None => return Err(GateError::InvalidCode),
            };
            if link.entity_id != expected_entity_id {
                return Err(GateError::denied(DeniedReason::EntityMismatch));
            }
            (token, link)
        };

        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let mut tokens = write_txn
                .open_table(ACCESS_TOKENS)
                .map_err(|e| storage("failed to open access_tokens table", e))?;
            let current = match tokens
                .get(origin_hash)
                .map_err(|e| storage("failed to get token", e))?
            {
                Some(value) => bincode::deserialize::<AccessTokenRecord>(value.value())
                    .map_err(|e| storage("failed to deserialize token", e))?,
                None => return Err(GateError::denied(DeniedReason::TokenNotFound)),
            };
            if current.verified {
                return Err(GateError::denied(DeniedReason::ConcurrentRedemption));
            }
            if current.short_code != token.short_code || current.created_at != token.created_at {
                // Replaced by a newer issue between the two phases.
                return Err(GateError::denied(DeniedReason::TokenNotFound));
            }
            let mut consumed = current;
            consumed.verified = true;
            let value = bincode::serialize(&consumed)
                .map_err(|e| storage("failed to serialize token", e))?;
            tokens
                .insert(origin_hash, value.as_slice())
                .map_err(|e| storage("failed to insert token", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit redemption", e))?;

        debug!(
            "Redeemed access token for origin {} (entity {})",
            origin_hash, expected_entity_id
        );
        Ok(link)
    }

    pub fn get_token(&self, origin_hash: &str) -> Result<Option<AccessTokenRecord>, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(ACCESS_TOKENS)
            .map_err(|e| storage("failed to open access_tokens table", e))?;

        match table
            .get(origin_hash)
            .map_err(|e| storage("failed to get token", e))?
        {
            Some(value) => {
                let token: AccessTokenRecord = bincode::deserialize(value.value())
                    .map_err(|e| storage("failed to deserialize token", e))?;
                Ok(Some(token))
            }
            None => Ok(None),
        }
    }

    // ========================================================================
    // Role Operations
    // ========================================================================

    pub fn is_moderator(&self, user_id: u64) -> Result<bool, GateError> {
        self.role_contains(MODERATORS, user_id)
    }

    pub fn is_owner(&self, user_id: u64) -> Result<bool, GateError> {
        self.role_contains(OWNERS, user_id)
    }

    pub fn add_moderator(&self, user_id: u64) -> Result<(), GateError> {
        self.role_insert(MODERATORS, user_id)?;
        info!("Added moderator {}", user_id);
        Ok(())
    }

    pub fn add_owner(&self, user_id: u64) -> Result<(), GateError> {
        self.role_insert(OWNERS, user_id)?;
        info!("Added owner {}", user_id);
        Ok(())
    }

    fn role_contains(
        &self,
        table_def: TableDefinition<u64, &[u8]>,
        user_id: u64,
    ) -> Result<bool, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;
        let table = read_txn
            .open_table(table_def)
            .map_err(|e| storage("failed to open role table", e))?;
        Ok(table
            .get(user_id)
            .map_err(|e| storage("failed to get role entry", e))?
            .is_some())
    }

    fn role_insert(
        &self,
        table_def: TableDefinition<u64, &[u8]>,
        user_id: u64,
    ) -> Result<(), GateError> {
        let record = RoleRecord {
            id: user_id,
            added_at: chrono::Utc::now().timestamp(),
        };
        let value =
            bincode::serialize(&record).map_err(|e| storage("failed to serialize role entry", e))?;
        let write_txn = self
            .db
            .begin_write()
            .map_err(|e| storage("failed to begin write", e))?;
        {
            let mut table = write_txn
                .open_table(table_def)
                .map_err(|e| storage("failed to open role table", e))?;
            table
                .insert(user_id, value.as_slice())
                .map_err(|e| storage("failed to insert role entry", e))?;
        }
        write_txn
            .commit()
            .map_err(|e| storage("failed to commit role entry", e))?;
        Ok(())
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    pub fn stats(&self) -> Result<DbStats, GateError> {
        let read_txn = self
            .db
            .begin_read()
            .map_err(|e| storage("failed to begin read", e))?;

        let users = read_txn
            .open_table(USERS)
            .map_err(|e| storage("failed to open users table", e))?;
        let total_users = users
            .range::<u64>(..)
            .map_err(|e| storage("failed to iterate users", e))?
            .count();

        let links = self.list_links()?;
        let mut links_by_owner: HashMap<u64, usize> = HashMap::new();
        for link in &links {
            *links_by_owner.entry(link.owner_id).or_insert(0) += 1;
        }

        let tokens = read_txn
            .open_table(ACCESS_TOKENS)
            .map_err(|e| storage("failed to open access_tokens table", e))?;
        let mut total_tokens = 0;
        let mut redeemed_tokens = 0;
        let iter = tokens
            .range::<&str>(..)
            .map_err(|e| storage("failed to iterate tokens", e))?;
        for entry in iter {
            let (_key, value) = entry.map_err(|e| storage("failed to read entry", e))?;
            let token: AccessTokenRecord = bincode::deserialize(value.value())
                .map_err(|e| storage("failed to deserialize token", e))?;
            total_tokens += 1;
            if token.verified {
                redeemed_tokens += 1;
            }
        }

        let moderators = read_txn
            .open_table(MODERATORS)
            .map_err(|e| storage("failed to open moderators table", e))?;
        let total_moderators = moderators
            .range::<u64>(..)
            .map_err(|e| storage("failed to iterate moderators", e))?
            .count();

        let owners = read_txn
            .open_table(OWNERS)
            .map_err(|e| storage("failed to open owners table", e))?;
        let total_owners = owners
            .range::<u64>(..)
            .map_err(|e| storage("failed to iterate owners", e))?
            .count();

        Ok(DbStats {
            total_users,
            total_links: links.len(),
            links_by_owner,
            total_tokens,
            redeemed_tokens,
            total_moderators,
            total_owners,
        })
    }
}
