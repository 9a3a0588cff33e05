//! ============================================================================
//! Access Grant Protocol
//! ============================================================================
//! Orchestrates the three-hop grant flow over the stores and the platform:
//!
//! - Direct bot path: short code -> role/balance gate -> debit -> invite.
//! - WebApp path, hop 1 (verify): authenticate the session payload, bind a
//!   one-time token to the caller's origin, hand back the display link.
//! - WebApp path, hop 2 (final): consume the token (compare-and-set), then
//!   request the one-time invite.
//!
//! Commit order is uniform: denial checks, then the durable debit (with the
//! owner revenue share in the same transaction), then token consumption,
//! then invite issuance. Consumption records are audit state — invite
//! failure after a commit is reported, never rolled back or refunded.
//! ============================================================================

use sha2::{Digest, Sha256};
use std::sync::Arc;
use tracing::{info, warn};
use url::Url;

use crate::auth;
use crate::db::{GateDb, LinkRecord};
use crate::telegram::InviteIssuer;
use crate::types::{GateError, GrantedInvite, VerifyOutcome};

const SHORT_CODE_LEN: usize = 6;
const SHORT_CODE_ATTEMPTS: usize = 8;

/// One-way hash of the requester's network address; tokens bind to this so
/// raw addresses are never stored.
pub fn origin_hash(ip: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(ip.as_bytes());
    hex::encode(hasher.finalize())
}

/// Accepts a bare short code or a deep link carrying it in the `startapp`
/// (or `start_param`) query field.
pub fn extract_access_code(input: &str) -> Option<String> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if !input.contains("t.me") {
        return Some(input.to_string());
    }
    let url = Url::parse(input).ok()?;
    url.query_pairs()
        .find(|(key, _)| key == "startapp" || key == "start_param")
        .map(|(_, value)| value.into_owned())
        .filter(|code| !code.is_empty())
}

fn generate_short_code() -> String {
    const CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
    (0..SHORT_CODE_LEN)
        .map(|_| {
            let idx = rand::random::<usize>() % CHARSET.len();
            CHARSET[idx] as char
        })
        .collect()
}

/// The access-grant protocol over dependency-injected stores and issuer
#[derive(Clone)]
pub struct AccessGrant {
    db: Arc<GateDb>,
    issuer: Arc<dyn InviteIssuer>,
    bot_token: String,
}

impl AccessGrant {
    pub fn new(db: Arc<GateDb>, issuer: Arc<dyn InviteIssuer>, bot_token: impl Into<String>) -> Self {
        Self {
            db,
            issuer,
            bot_token: bot_token.into(),
        }
    }

    /// Direct bot path: moderators redeem free, everyone else pays the
    /// link's price. The debit and the owner's revenue share commit in one
    /// transaction before the invite is requested.
    pub async fn direct_access(
        &self,
        user_id: u64,
        raw_code: &str,
    ) -> Result<GrantedInvite, GateError> {
        let code = extract_access_code(raw_code).ok_or(GateError::InvalidCode)?;
        let link = self
            .db
            .resolve_link(&code)?
            .ok_or(GateError::InvalidCode)?;

        if self.db.is_moderator(user_id)? {
            let invite_url = self.issuer.issue_one_time_invite(link.entity_id).await?;
            info!(
                "Moderator {} granted free access to entity {}",
                user_id, link.entity_id
            );
            return Ok(GrantedInvite {
                entity_id: link.entity_id,
                invite_url,
                charged: 0,
            });
        }

        let share_to = if link.price > 0
            && link.owner_id != user_id
            && self.db.is_moderator(link.owner_id)?
        {
            Some(link.owner_id)
        } else {
            None
        };
        self.db.debit_with_share(user_id, link.price, share_to)?;

        let invite_url = self.issuer.issue_one_time_invite(link.entity_id).await?;
        info!(
            "Granted entity {} to user {} for {} stars",
            link.entity_id, user_id, link.price
        );
        Ok(GrantedInvite {
            entity_id: link.entity_id,
            invite_url,
            charged: link.price,
        })
    }

    /// WebApp hop 1: authenticate the init data, then bind a fresh token to
    /// the caller's origin. Replaces any previous token for that origin, so
    /// an origin never holds two live grants.
    pub fn verify_session(
        &self,
        init_data: &str,
        client_ip: &str,
    ) -> Result<VerifyOutcome, GateError> {
        let claims = auth::verify(init_data, &self.bot_token)?;
        let code = claims
            .start_param
            .ok_or_else(|| GateError::Authentication("missing start_param".to_string()))?;

        let origin = origin_hash(client_ip);
        self.db.issue_token(&origin, claims.user_id, &code)?;

        let short_link = self.db.resolve_link(&code)?.map(|link| link.display_link);
        if short_link.is_none() {
            warn!("Token issued for unresolvable code {}", code);
        }
        Ok(VerifyOutcome { short_link })
    }

    /// WebApp hop 2: consume the origin's token for the claimed entity,
    /// then request the invite. The token stays consumed if issuance fails.
    pub async fn final_redeem(&self, client_ip: &str, entity_id: i64) -> Result<String, GateError> {
        let origin = origin_hash(client_ip);
        let now = chrono::Utc::now().timestamp();
        let link = self.db.redeem_token(&origin, entity_id, now)?;

        let invite_url = self.issuer.issue_one_time_invite(link.entity_id).await?;
        info!("Redeemed web access to entity {}", link.entity_id);
        Ok(invite_url)
    }

    /// Create a link under a caller-supplied owner, regenerating the short
    /// code on collision. Registry records are write-once.
    pub fn create_link(
        &self,
        entity_id: i64,
        price: u64,
        owner_id: u64,
        display_link: &str,
    ) -> Result<LinkRecord, GateError> {
        for _ in 0..SHORT_CODE_ATTEMPTS {
            let link = LinkRecord {
                short_code: generate_short_code(),
                entity_id,
                price,
                owner_id,
                display_link: display_link.to_string(),
                created_at: chrono::Utc::now().timestamp(),
            };
            if self.db.insert_link_if_absent(&link)? {
                return Ok(link);
            }
        }
        Err(GateError::Storage(
            "could not generate a unique short code".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::signed_init_data;
    use crate::types::DeniedReason;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const BOT_TOKEN: &str = "123456:TEST-TOKEN";

    /// Issuer stub: counts issuances, optionally fails
    struct StubIssuer {
        issued: AtomicUsize,
        fail: bool,
    }

    impl StubIssuer {
        fn new() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                fail: false,
            }
        }

        fn failing() -> Self {
            Self {
                issued: AtomicUsize::new(0),
                fail: true,
            }
        }

        fn count(&self) -> usize {
            self.issued.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl InviteIssuer for StubIssuer {
        async fn issue_one_time_invite(&self, entity_id: i64) -> Result<String, GateError> {
            if self.fail {
                return Err(GateError::InviteIssuance("stub failure".to_string()));
            }
            self.issued.fetch_add(1, Ordering::SeqCst);
            Ok(format!("https://t.me/+invite{entity_id}"))
        }
    }

    fn grant_with(dir: &tempfile::TempDir, issuer: Arc<StubIssuer>) -> (Arc<GateDb>, AccessGrant) {
        let path = dir.path().join("gate.redb");
        let db = Arc::new(GateDb::open(Some(path.to_str().unwrap())).unwrap());
        let grant = AccessGrant::new(db.clone(), issuer, BOT_TOKEN);
        (db, grant)
    }

    fn init_data_for(user_id: u64, code: &str) -> String {
        let user_json = format!(r#"{{"id":{user_id},"first_name":"Test"}}"#);
        let fields = vec![
            ("auth_date", "1700000000"),
            ("user", user_json.as_str()),
            ("start_param", code),
        ];
        signed_init_data(&fields, BOT_TOKEN)
    }

    #[test]
    fn test_extract_access_code() {
        assert_eq!(extract_access_code("abc123").as_deref(), Some("abc123"));
        assert_eq!(
            extract_access_code("https://t.me/gatebot/app?startapp=xyz789").as_deref(),
            Some("xyz789")
        );
        assert_eq!(
            extract_access_code("https://t.me/gatebot/app?start_param=qqq").as_deref(),
            Some("qqq")
        );
        assert_eq!(extract_access_code(""), None);
        assert_eq!(extract_access_code("https://t.me/gatebot/app"), None);
        assert_eq!(extract_access_code("t.me/not a url"), None);
    }

    #[test]
    fn test_origin_hash_is_stable_and_blind() {
        let a = origin_hash("203.0.113.7");
        let b = origin_hash("203.0.113.7");
        let c = origin_hash("203.0.113.8");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_generate_short_code_shape() {
        let code = generate_short_code();
        assert_eq!(code.len(), SHORT_CODE_LEN);
        assert!(code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[tokio::test]
    async fn test_direct_access_insufficient_balance() {
        // Scenario: balance 0 against a price-1 code
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        let link = grant.create_link(-100555, 1, 9, "https://short.example/a").unwrap();
        db.ensure_user(1).unwrap();

        let err = grant.direct_access(1, &link.short_code).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Denied(DeniedReason::InsufficientBalance)
        ));
        assert_eq!(db.balance(1).unwrap(), 0);
        assert_eq!(issuer.count(), 0);
    }

    #[tokio::test]
    async fn test_direct_access_debits_and_shares() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        db.add_moderator(9).unwrap();
        let link = grant.create_link(-100555, 3, 9, "https://short.example/a").unwrap();
        db.credit(1, 5).unwrap();

        let granted = grant.direct_access(1, &link.short_code).await.unwrap();
        assert_eq!(granted.entity_id, -100555);
        assert_eq!(granted.charged, 3);
        assert_eq!(db.balance(1).unwrap(), 2);
        // Owner is a moderator: the price lands on their balance.
        assert_eq!(db.balance(9).unwrap(), 3);
        assert_eq!(issuer.count(), 1);
    }

    #[tokio::test]
    async fn test_direct_access_no_share_for_plain_owner() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        let link = grant.create_link(-1, 2, 9, "https://short.example/a").unwrap();
        db.credit(1, 2).unwrap();

        grant.direct_access(1, &link.short_code).await.unwrap();
        assert_eq!(db.balance(9).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_moderator_direct_access_is_free() {
        // Scenario: moderator redeems without a debit
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        let link = grant.create_link(-2, 5, 9, "https://short.example/b").unwrap();
        db.add_moderator(4).unwrap();
        db.credit(4, 10).unwrap();

        let granted = grant.direct_access(4, &link.short_code).await.unwrap();
        assert_eq!(granted.charged, 0);
        assert_eq!(db.balance(4).unwrap(), 10);
        assert_eq!(issuer.count(), 1);
    }

    #[tokio::test]
    async fn test_direct_access_unknown_code() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (_db, grant) = grant_with(&dir, issuer);

        let err = grant.direct_access(1, "nosuch").await.unwrap_err();
        assert!(matches!(err, GateError::InvalidCode));
    }

    #[tokio::test]
    async fn test_issuance_failure_after_debit_is_not_refunded() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::failing());
        let (db, grant) = grant_with(&dir, issuer);

        let link = grant.create_link(-3, 2, 9, "https://short.example/c").unwrap();
        db.credit(1, 2).unwrap();

        let err = grant.direct_access(1, &link.short_code).await.unwrap_err();
        assert!(matches!(err, GateError::InviteIssuance(_)));
        // Commit-then-issue: the charge is audit state, not rolled back.
        assert_eq!(db.balance(1).unwrap(), 0);
    }

    #[test]
    fn test_verify_session_tampered_hash_creates_no_token() {
        // Scenario: tampered WebApp payload
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer);

        let init_data = init_data_for(7, "abc123").replace("abc123", "abc124");
        let err = grant.verify_session(&init_data, "203.0.113.7").unwrap_err();
        assert!(matches!(err, GateError::Authentication(_)));
        assert!(db
            .get_token(&origin_hash("203.0.113.7"))
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_webapp_flow_grants_once() {
        // Scenario: verify then final for the same origin; replay denied
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        let link = grant.create_link(-100777, 1, 9, "https://short.example/d").unwrap();
        let init_data = init_data_for(7, &link.short_code);

        let outcome = grant.verify_session(&init_data, "203.0.113.7").unwrap();
        assert_eq!(outcome.short_link.as_deref(), Some("https://short.example/d"));

        let invite = grant.final_redeem("203.0.113.7", -100777).await.unwrap();
        assert!(invite.starts_with("https://t.me/+invite"));
        assert!(db
            .get_token(&origin_hash("203.0.113.7"))
            .unwrap()
            .unwrap()
            .verified);

        let err = grant.final_redeem("203.0.113.7", -100777).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Denied(DeniedReason::AlreadyRedeemed)
        ));
        assert_eq!(issuer.count(), 1);
    }

    #[tokio::test]
    async fn test_final_redeem_entity_mismatch_keeps_token_live() {
        // Scenario: claimed entity differs from the link's entity
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer.clone());

        let link = grant.create_link(-100777, 1, 9, "https://short.example/e").unwrap();
        let init_data = init_data_for(7, &link.short_code);
        grant.verify_session(&init_data, "198.51.100.4").unwrap();

        let err = grant.final_redeem("198.51.100.4", -100999).await.unwrap_err();
        assert!(matches!(
            err,
            GateError::Denied(DeniedReason::EntityMismatch)
        ));
        assert!(!db
            .get_token(&origin_hash("198.51.100.4"))
            .unwrap()
            .unwrap()
            .verified);
        assert_eq!(issuer.count(), 0);
    }

    #[tokio::test]
    async fn test_final_redeem_from_other_origin_denied() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (_db, grant) = grant_with(&dir, issuer);

        let link = grant.create_link(-5, 1, 9, "https://short.example/f").unwrap();
        let init_data = init_data_for(7, &link.short_code);
        grant.verify_session(&init_data, "203.0.113.7").unwrap();

        let err = grant.final_redeem("203.0.113.99", -5).await.unwrap_err();
        assert!(matches!(err, GateError::Denied(DeniedReason::TokenNotFound)));
    }

    #[test]
    fn test_verify_session_unresolvable_code_still_binds_token() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (db, grant) = grant_with(&dir, issuer);

        let init_data = init_data_for(7, "ghost1");
        let outcome = grant.verify_session(&init_data, "203.0.113.7").unwrap();
        assert!(outcome.short_link.is_none());
        assert!(db
            .get_token(&origin_hash("203.0.113.7"))
            .unwrap()
            .is_some());
    }

    #[test]
    fn test_create_link_survives_collisions() {
        let dir = tempfile::tempdir().unwrap();
        let issuer = Arc::new(StubIssuer::new());
        let (_db, grant) = grant_with(&dir, issuer);

        // Every created link must land on a unique code even as the
        // registry fills up.
        let mut codes = std::collections::HashSet::new();
        for _ in 0..64 {
            let link = grant.create_link(-6, 1, 9, "https://short.example/g").unwrap();
            assert!(codes.insert(link.short_code));
        }
    }
}
