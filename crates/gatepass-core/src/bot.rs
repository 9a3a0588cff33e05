//! ============================================================================
//! Bot Command Router
//! ============================================================================
//! Routes webhook updates to the user, moderator, and owner commands and
//! handles the Stars payment confirmation flow. Every denial maps to its own
//! reply; internal errors are logged and reduced to a generic failure.
//! ============================================================================

use std::sync::Arc;
use tracing::{error, info, warn};

use crate::db::GateDb;
use crate::grant::AccessGrant;
use crate::telegram::{InlineKeyboardMarkup, Message, TelegramClient, TelegramUser, Update};
use crate::types::{DeniedReason, GateError};

/// Deposit bounds in Stars
const MAX_DEPOSIT: u64 = 100;

/// Invoice payload prefix for balance deposits
const DEPOSIT_PAYLOAD_PREFIX: &str = "DEPOSIT:";

/// Command router over the grant protocol and the stores
pub struct Bot {
    db: Arc<GateDb>,
    telegram: Arc<TelegramClient>,
    grant: AccessGrant,
}

impl Bot {
    pub fn new(db: Arc<GateDb>, telegram: Arc<TelegramClient>, grant: AccessGrant) -> Self {
        Self {
            db,
            telegram,
            grant,
        }
    }

    /// Handle one webhook update. Never fails the webhook: errors are
    /// logged so Telegram does not redeliver a poisoned update forever.
    pub async fn handle_update(&self, update: Update) {
        if let Some(query) = &update.pre_checkout_query {
            // No inventory to check; deposits are always accepted.
            if let Err(e) = self.telegram.answer_pre_checkout(&query.id, true).await {
                error!("Failed to answer pre-checkout query: {}", e);
            }
        }

        let Some(message) = update.message else {
            return;
        };

        if message.successful_payment.is_some() {
            self.handle_payment(&message).await;
            return;
        }

        let Some(text) = message.text.clone() else {
            return;
        };
        if text.starts_with('/') {
            self.route(&message, &text).await;
        }
    }

    async fn route(&self, msg: &Message, text: &str) {
        let Some(from) = &msg.from else {
            return;
        };
        let mut parts = text.split_whitespace();
        let Some(cmd) = parts.next() else {
            return;
        };
        let args: Vec<&str> = parts.collect();

        let result = match cmd {
            "/start" => self.cmd_start(msg, from).await,
            "/balance" => self.cmd_balance(msg, from).await,
            "/deposit" => self.cmd_deposit(msg, &args).await,
            "/access" => self.cmd_access(msg, from, &args).await,
            "/ab" => self.cmd_access_link(msg, from, &args).await,
            "/addmod" => self.cmd_add_mod(msg, from, &args).await,
            // Unknown commands are ignored.
            _ => Ok(()),
        };

        if let Err(e) = result {
            error!("Command {} failed: {}", cmd, e);
            let _ = self
                .telegram
                .send_message(msg.chat.id, "❌ Something went wrong, try again later")
                .await;
        }
    }

    // ========================================================================
    // User Commands
    // ========================================================================

    async fn cmd_start(&self, msg: &Message, from: &TelegramUser) -> Result<(), GateError> {
        self.db.ensure_user(from.id)?;
        self.telegram
            .send_message(msg.chat.id, "🤖 Bot started. Use /access <code>")
            .await
    }

    async fn cmd_balance(&self, msg: &Message, from: &TelegramUser) -> Result<(), GateError> {
        let balance = self.db.balance(from.id)?;
        self.telegram
            .send_message(msg.chat.id, &format!("💰 Balance: {balance} stars"))
            .await
    }

    async fn cmd_deposit(&self, msg: &Message, args: &[&str]) -> Result<(), GateError> {
        let amount = args.first().and_then(|a| a.parse::<u64>().ok());
        let Some(amount) = amount.filter(|a| (1..=MAX_DEPOSIT).contains(a)) else {
            return self
                .telegram
                .send_message(msg.chat.id, &format!("❌ Usage: /deposit <1-{MAX_DEPOSIT}>"))
                .await;
        };

        self.telegram
            .send_invoice(
                msg.chat.id,
                "Deposit Balance",
                &format!("Deposit {amount} stars"),
                &format!("{DEPOSIT_PAYLOAD_PREFIX}{amount}"),
                amount,
            )
            .await
    }

    async fn cmd_access(
        &self,
        msg: &Message,
        from: &TelegramUser,
        args: &[&str],
    ) -> Result<(), GateError> {
        let Some(raw_code) = args.first() else {
            return self
                .telegram
                .send_message(msg.chat.id, "❌ Usage: /access <code>")
                .await;
        };

        match self.grant.direct_access(from.id, raw_code).await {
            Ok(granted) => {
                self.telegram
                    .send_message_markdown(
                        msg.chat.id,
                        &format!(
                            "✅ Access granted!\n\n⏳ *Valid for 5 minutes*\n👤 *One user only*\n\n{}",
                            granted.invite_url
                        ),
                    )
                    .await
            }
            Err(err) => {
                if !matches!(err, GateError::InvalidCode | GateError::Denied(_)) {
                    error!("Access grant for user {} failed: {}", from.id, err);
                }
                self.telegram
                    .send_message(msg.chat.id, &denial_reply(&err))
                    .await
            }
        }
    }

    // ========================================================================
    // Moderator Command
    // ========================================================================

    async fn cmd_access_link(
        &self,
        msg: &Message,
        from: &TelegramUser,
        args: &[&str],
    ) -> Result<(), GateError> {
        if !self.db.is_moderator(from.id)? {
            return self
                .telegram
                .send_message(msg.chat.id, "❌ Moderator access required")
                .await;
        }

        let entity_id = args.first().and_then(|a| a.parse::<i64>().ok());
        let display_link = args.get(1);
        let price = match args.get(2) {
            Some(raw) => raw.parse::<u64>().ok(),
            None => Some(1),
        };
        let (Some(entity_id), Some(display_link), Some(price)) = (entity_id, display_link, price)
        else {
            return self
                .telegram
                .send_message(msg.chat.id, "❌ Usage: /ab <entityId> <shortUrl> [price]")
                .await;
        };

        if !self.telegram.is_chat_admin(entity_id, from.id).await {
            let keyboard = InlineKeyboardMarkup::single_url_button(
                "➕ Add Bot to Channel",
                self.telegram.add_to_channel_link(),
            );
            return self
                .telegram
                .send_message_with_keyboard(
                    msg.chat.id,
                    "❌ You must be admin in that channel",
                    keyboard,
                )
                .await;
        }

        let link = self
            .grant
            .create_link(entity_id, price, from.id, display_link)?;
        info!(
            "Moderator {} created link {} for entity {}",
            from.id, link.short_code, entity_id
        );
        self.telegram
            .send_message(
                msg.chat.id,
                &format!(
                    "✅ Link created\nLink: {}",
                    self.telegram.deep_link(&link.short_code)
                ),
            )
            .await
    }

    // ========================================================================
    // Owner Command
    // ========================================================================

    async fn cmd_add_mod(
        &self,
        msg: &Message,
        from: &TelegramUser,
        args: &[&str],
    ) -> Result<(), GateError> {
        if !self.db.is_owner(from.id)? {
            return self
                .telegram
                .send_message(msg.chat.id, "❌ Owner access required")
                .await;
        }
        let Some(user_id) = args.first().and_then(|a| a.parse::<u64>().ok()) else {
            return self
                .telegram
                .send_message(msg.chat.id, "❌ Usage: /addmod <userId>")
                .await;
        };

        self.db.add_moderator(user_id)?;
        self.telegram
            .send_message(msg.chat.id, "✅ Moderator added")
            .await
    }

    // ========================================================================
    // Payments
    // ========================================================================

    async fn handle_payment(&self, msg: &Message) {
        let Some(payment) = &msg.successful_payment else {
            return;
        };
        let Some(from) = &msg.from else {
            return;
        };
        let Some(amount) = parse_deposit_payload(&payment.invoice_payload) else {
            warn!(
                "Ignoring successful payment with unknown payload: {}",
                payment.invoice_payload
            );
            return;
        };

        let credited = self
            .db
            .ensure_user(from.id)
            .and_then(|_| self.db.credit(from.id, amount));
        match credited {
            Ok(balance) => {
                info!("User {} deposited {} stars (balance {})", from.id, amount, balance);
                let _ = self
                    .telegram
                    .send_message(msg.chat.id, "✅ Deposit successful\n💰 Balance updated")
                    .await;
            }
            Err(e) => {
                error!("Failed to credit deposit for user {}: {}", from.id, e);
                let _ = self
                    .telegram
                    .send_message(msg.chat.id, "❌ Something went wrong, try again later")
                    .await;
            }
        }
    }
}

fn parse_deposit_payload(payload: &str) -> Option<u64> {
    payload
        .strip_prefix(DEPOSIT_PAYLOAD_PREFIX)
        .and_then(|raw| raw.parse::<u64>().ok())
        .filter(|amount| *amount > 0)
}

/// Distinct reply per denial reason; unexpected errors collapse to a
/// generic failure message.
fn denial_reply(err: &GateError) -> String {
    match err {
        GateError::InvalidCode => "❌ Invalid access code".to_string(),
        GateError::Authentication(_) => "❌ Authentication failed".to_string(),
        GateError::Denied(reason) => match reason {
            DeniedReason::InsufficientBalance => "❌ Insufficient balance".to_string(),
            DeniedReason::NotModerator => "❌ Moderator access required".to_string(),
            DeniedReason::NotChannelAdmin => "❌ You must be admin in that channel".to_string(),
            DeniedReason::NotOwner => "❌ Owner access required".to_string(),
            other => format!("❌ Access denied: {other}"),
        },
        GateError::InviteIssuance(_) => {
            "❌ Could not create the invite link, try again later".to_string()
        }
        GateError::Platform(_) | GateError::Storage(_) => {
            "❌ Something went wrong, try again later".to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_deposit_payload() {
        assert_eq!(parse_deposit_payload("DEPOSIT:25"), Some(25));
        assert_eq!(parse_deposit_payload("DEPOSIT:0"), None);
        assert_eq!(parse_deposit_payload("DEPOSIT:abc"), None);
        assert_eq!(parse_deposit_payload("REFUND:25"), None);
        assert_eq!(parse_deposit_payload(""), None);
    }

    #[test]
    fn test_denial_replies_are_distinct() {
        let reasons = [
            DeniedReason::InsufficientBalance,
            DeniedReason::TokenNotFound,
            DeniedReason::AlreadyRedeemed,
            DeniedReason::EntityMismatch,
            DeniedReason::TokenExpired,
            DeniedReason::ConcurrentRedemption,
        ];
        let replies: std::collections::HashSet<String> = reasons
            .iter()
            .map(|r| denial_reply(&GateError::Denied(*r)))
            .collect();
        assert_eq!(replies.len(), reasons.len());
    }
}
