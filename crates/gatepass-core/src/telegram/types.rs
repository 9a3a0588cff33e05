//! ============================================================================
//! Telegram Bot API Types
//! ============================================================================
//! The subset of the Bot API wire objects the gate consumes: webhook
//! updates, payment events, and the reply-markup structures it sends.
//! ============================================================================

use serde::{Deserialize, Serialize};

/// Incoming webhook update
#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub pre_checkout_query: Option<PreCheckoutQuery>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    #[serde(default)]
    pub from: Option<TelegramUser>,
    pub chat: Chat,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub successful_payment: Option<SuccessfulPayment>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramUser {
    pub id: u64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

/// Pre-checkout query for a Stars invoice; always approved (no inventory)
#[derive(Debug, Clone, Deserialize)]
pub struct PreCheckoutQuery {
    pub id: String,
    pub from: TelegramUser,
    pub invoice_payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SuccessfulPayment {
    pub currency: String,
    pub total_amount: u64,
    pub invoice_payload: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatInviteLink {
    pub invite_link: String,
}

/// getChatMember result; only the status is inspected
#[derive(Debug, Clone, Deserialize)]
pub struct ChatMemberInfo {
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardMarkup {
    pub inline_keyboard: Vec<Vec<InlineKeyboardButton>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InlineKeyboardButton {
    pub text: String,
    pub url: String,
}

impl InlineKeyboardMarkup {
    /// Single-button keyboard, the only shape the bot sends
    pub fn single_url_button(text: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            inline_keyboard: vec![vec![InlineKeyboardButton {
                text: text.into(),
                url: url.into(),
            }]],
        }
    }
}
