//! ============================================================================
//! Telegram Client - Bot API access
//! ============================================================================
//! Handles every outbound Bot API call the gate makes:
//! - Messaging (plain, Markdown, inline keyboard)
//! - One-time invite link creation (the invite issuer)
//! - Channel admin checks for moderator link creation
//! - Stars invoices and pre-checkout acknowledgement
//! ============================================================================

pub mod types;

pub use types::{
    Chat, ChatInviteLink, ChatMemberInfo, InlineKeyboardButton, InlineKeyboardMarkup, Message,
    PreCheckoutQuery, SuccessfulPayment, TelegramUser, Update,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, warn};

use crate::types::{GateError, ACCESS_TTL_SECS};

/// Telegram Bot API base URL
const TELEGRAM_API: &str = "https://api.telegram.org";

/// Invites are single-use
const INVITE_MEMBER_LIMIT: u32 = 1;

/// Seam between the grant protocol and the platform's invite mechanics.
/// Issuance failure must surface as an opaque error; the caller decides
/// what happens to already-committed redemption state.
#[async_trait]
pub trait InviteIssuer: Send + Sync {
    async fn issue_one_time_invite(&self, entity_id: i64) -> Result<String, GateError>;
}

/// Client for the Telegram Bot API
pub struct TelegramClient {
    client: reqwest::Client,
    bot_token: String,
    bot_username: String,
}

impl TelegramClient {
    pub fn new(bot_token: String, bot_username: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            bot_token,
            bot_username,
        }
    }

    pub fn bot_token(&self) -> &str {
        &self.bot_token
    }

    /// Deep link that opens the WebApp with the short code preloaded
    pub fn deep_link(&self, short_code: &str) -> String {
        format!(
            "https://t.me/{}/app?startapp={}",
            self.bot_username, short_code
        )
    }

    /// Link that lets a moderator add the bot to their channel
    pub fn add_to_channel_link(&self) -> String {
        format!("https://t.me/{}?startchannel=true", self.bot_username)
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: &str,
        body: &impl Serialize,
    ) -> Result<T, GateError> {
        let url = format!("{}/bot{}/{}", TELEGRAM_API, self.bot_token, method);

        let response = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| GateError::Platform(format!("{method} request failed: {e}")))?;

        let status = response.status();
        let envelope: ApiEnvelope<T> = response
            .json()
            .await
            .map_err(|e| GateError::Platform(format!("failed to parse {method} response: {e}")))?;

        if !envelope.ok {
            let description = envelope
                .description
                .unwrap_or_else(|| format!("status {status}"));
            return Err(GateError::Platform(format!("{method}: {description}")));
        }

        envelope
            .result
            .ok_or_else(|| GateError::Platform(format!("{method}: empty result")))
    }

    // ========================================================================
    // Messaging
    // ========================================================================

    pub async fn send_message(&self, chat_id: i64, text: &str) -> Result<(), GateError> {
        let request = SendMessageRequest {
            chat_id,
            text: text.to_string(),
            parse_mode: None,
            reply_markup: None,
        };
        let _message: Message = self.call("sendMessage", &request).await?;
        Ok(())
    }

    pub async fn send_message_markdown(&self, chat_id: i64, text: &str) -> Result<(), GateError> {
        let request = SendMessageRequest {
            chat_id,
            text: text.to_string(),
            parse_mode: Some("Markdown".to_string()),
            reply_markup: None,
        };
        let _message: Message = self.call("sendMessage", &request).await?;
        Ok(())
    }

    pub async fn send_message_with_keyboard(
        &self,
        chat_id: i64,
        text: &str,
        keyboard: InlineKeyboardMarkup,
    ) -> Result<(), GateError> {
        let request = SendMessageRequest {
            chat_id,
            text: text.to_string(),
            parse_mode: None,
            reply_markup: Some(keyboard),
        };
        let _message: Message = self.call("sendMessage", &request).await?;
        Ok(())
    }

    // ========================================================================
    // Invites
    // ========================================================================

    /// Request a one-time invite: one member, valid five minutes
    pub async fn create_invite_link(&self, entity_id: i64) -> Result<String, GateError> {
        let request = CreateInviteLinkRequest {
            chat_id: entity_id,
            expire_date: chrono::Utc::now().timestamp() + ACCESS_TTL_SECS,
            member_limit: INVITE_MEMBER_LIMIT,
        };
        let link: ChatInviteLink = self.call("createChatInviteLink", &request).await?;
        debug!("Created one-time invite for entity {}", entity_id);
        Ok(link.invite_link)
    }

    // ========================================================================
    // Admin & Payments
    // ========================================================================

    /// Whether the user administers the chat. Lookup failures read as "no":
    /// an unverifiable admin claim is a denial.
    pub async fn is_chat_admin(&self, chat_id: i64, user_id: u64) -> bool {
        let request = GetChatMemberRequest { chat_id, user_id };
        match self
            .call::<ChatMemberInfo>("getChatMember", &request)
            .await
        {
            Ok(member) => matches!(member.status.as_str(), "administrator" | "creator"),
            Err(e) => {
                warn!(
                    "getChatMember failed for user {} in chat {}: {}",
                    user_id, chat_id, e
                );
                false
            }
        }
    }

    /// Send a Stars (XTR) invoice for a balance deposit
    pub async fn send_invoice(
        &self,
        chat_id: i64,
        title: &str,
        description: &str,
        payload: &str,
        amount: u64,
    ) -> Result<(), GateError> {
        let request = SendInvoiceRequest {
            chat_id,
            title: title.to_string(),
            description: description.to_string(),
            payload: payload.to_string(),
            provider_token: String::new(),
            currency: "XTR".to_string(),
            prices: vec![LabeledPrice {
                label: "Wallet Deposit".to_string(),
                amount,
            }],
        };
        let _message: Message = self.call("sendInvoice", &request).await?;
        Ok(())
    }

    pub async fn answer_pre_checkout(&self, query_id: &str, ok: bool) -> Result<(), GateError> {
        let request = AnswerPreCheckoutRequest {
            pre_checkout_query_id: query_id.to_string(),
            ok,
        };
        let _answered: bool = self.call("answerPreCheckoutQuery", &request).await?;
        Ok(())
    }
}

#[async_trait]
impl InviteIssuer for TelegramClient {
    async fn issue_one_time_invite(&self, entity_id: i64) -> Result<String, GateError> {
        self.create_invite_link(entity_id)
            .await
            .map_err(|e| GateError::InviteIssuance(e.to_string()))
    }
}

// ============================================================================
// Bot API Request Types
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: serde::de::DeserializeOwned"))]
struct ApiEnvelope<T> {
    ok: bool,
    #[serde(default)]
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Serialize)]
struct SendMessageRequest {
    chat_id: i64,
    text: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reply_markup: Option<InlineKeyboardMarkup>,
}

#[derive(Debug, Serialize)]
struct CreateInviteLinkRequest {
    chat_id: i64,
    expire_date: i64,
    member_limit: u32,
}

#[derive(Debug, Serialize)]
struct GetChatMemberRequest {
    chat_id: i64,
    user_id: u64,
}

#[derive(Debug, Serialize)]
struct SendInvoiceRequest {
    chat_id: i64,
    title: String,
    description: String,
    payload: String,
    provider_token: String,
    currency: String,
    prices: Vec<LabeledPrice>,
}

#[derive(Debug, Serialize)]
struct LabeledPrice {
    label: String,
    amount: u64,
}

#[derive(Debug, Serialize)]
struct AnswerPreCheckoutRequest {
    pre_checkout_query_id: String,
    ok: bool,
}
