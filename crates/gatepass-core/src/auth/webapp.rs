//! ============================================================================
//! WebApp Init-Data Verification
//! ============================================================================
//! Telegram signs the WebApp session payload with a two-stage HMAC-SHA256:
//! the bot token is keyed-hashed under the literal key "WebAppData" to derive
//! a secret, and that secret keys the tag over the canonical check string
//! (fields sorted by key, `key=value` lines joined by newlines, `hash`
//! excluded). The tag comparison is constant-time.
//! ============================================================================

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use url::form_urlencoded;

use crate::types::{GateError, SessionClaims};

type HmacSha256 = Hmac<Sha256>;

/// The `user` field of the init data, a JSON-encoded Telegram user
#[derive(Debug, Deserialize)]
struct WebAppUser {
    id: u64,
}

fn auth_error(reason: &str) -> GateError {
    GateError::Authentication(reason.to_string())
}

/// Verify an init-data payload against the bot token and extract the
/// session claims. Pure function: nothing is trusted and nothing is stored
/// unless the tag check passes.
pub fn verify(init_data: &str, bot_token: &str) -> Result<SessionClaims, GateError> {
    let mut fields: Vec<(String, String)> = form_urlencoded::parse(init_data.as_bytes())
        .into_owned()
        .collect();

    let hash_pos = fields
        .iter()
        .position(|(key, _)| key == "hash")
        .ok_or_else(|| auth_error("missing hash field"))?;
    let (_, supplied_hash) = fields.remove(hash_pos);
    let supplied_tag =
        hex::decode(supplied_hash.as_bytes()).map_err(|_| auth_error("malformed hash field"))?;

    let check_string = data_check_string(&mut fields);
    let mac = signing_mac(&check_string, bot_token)?;
    mac.verify_slice(&supplied_tag)
        .map_err(|_| auth_error("hash mismatch"))?;

    claims_from_fields(&fields)
}

/// Canonical check string: fields sorted by key, `key=value` joined by
/// `\n` with no trailing newline. Sorts in place.
fn data_check_string(fields: &mut [(String, String)]) -> String {
    fields.sort_by(|a, b| a.0.cmp(&b.0));
    fields
        .iter()
        .map(|(key, value)| format!("{key}={value}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// MAC over the check string, keyed with the secret derived from the bot
/// token (HMAC over the bot token under the literal key "WebAppData").
fn signing_mac(check_string: &str, bot_token: &str) -> Result<HmacSha256, GateError> {
    let mut derive =
        HmacSha256::new_from_slice(b"WebAppData").map_err(|_| auth_error("invalid key length"))?;
    derive.update(bot_token.as_bytes());
    let secret = derive.finalize().into_bytes();

    let mut mac =
        HmacSha256::new_from_slice(&secret).map_err(|_| auth_error("invalid key length"))?;
    mac.update(check_string.as_bytes());
    Ok(mac)
}

fn claims_from_fields(fields: &[(String, String)]) -> Result<SessionClaims, GateError> {
    let user_json = fields
        .iter()
        .find(|(key, _)| key == "user")
        .map(|(_, value)| value.as_str())
        .ok_or_else(|| auth_error("missing user field"))?;
    let user: WebAppUser =
        serde_json::from_str(user_json).map_err(|_| auth_error("malformed user field"))?;

    let start_param = fields
        .iter()
        .find(|(key, _)| key == "start_param")
        .map(|(_, value)| value.clone())
        .filter(|value| !value.is_empty());

    Ok(SessionClaims {
        user_id: user.id,
        start_param,
    })
}

/// Build a signed init-data query string the verifier accepts, for tests.
#[cfg(test)]
pub(crate) fn signed_init_data(fields: &[(&str, &str)], bot_token: &str) -> String {
    let mut owned: Vec<(String, String)> = fields
        .iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    let check_string = data_check_string(&mut owned);
    let mac = signing_mac(&check_string, bot_token).unwrap();
    let tag = hex::encode(mac.finalize().into_bytes());

    let mut serializer = form_urlencoded::Serializer::new(String::new());
    for (key, value) in &owned {
        serializer.append_pair(key, value);
    }
    serializer.append_pair("hash", &tag);
    serializer.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOT_TOKEN: &str = "123456:TEST-TOKEN";

    fn valid_fields() -> Vec<(&'static str, &'static str)> {
        vec![
            ("auth_date", "1700000000"),
            ("query_id", "AAHdF6IQAAAAAN0XohDhrOrc"),
            ("user", r#"{"id":99,"first_name":"Ada"}"#),
            ("start_param", "abc123"),
        ]
    }

    #[test]
    fn test_valid_payload_accepted() {
        let init_data = signed_init_data(&valid_fields(), BOT_TOKEN);
        let claims = verify(&init_data, BOT_TOKEN).unwrap();
        assert_eq!(claims.user_id, 99);
        assert_eq!(claims.start_param.as_deref(), Some("abc123"));
    }

    #[test]
    fn test_tampered_field_rejected() {
        let init_data = signed_init_data(&valid_fields(), BOT_TOKEN);
        let tampered = init_data.replace("abc123", "abc124");
        assert!(verify(&tampered, BOT_TOKEN).is_err());
    }

    #[test]
    fn test_tampered_hash_rejected() {
        let init_data = signed_init_data(&valid_fields(), BOT_TOKEN);
        // Flip the last hex digit of the tag.
        let tampered = if init_data.ends_with('0') {
            format!("{}1", &init_data[..init_data.len() - 1])
        } else {
            format!("{}0", &init_data[..init_data.len() - 1])
        };
        assert!(verify(&tampered, BOT_TOKEN).is_err());
    }

    #[test]
    fn test_wrong_bot_token_rejected() {
        let init_data = signed_init_data(&valid_fields(), BOT_TOKEN);
        assert!(verify(&init_data, "999999:OTHER-TOKEN").is_err());
    }

    #[test]
    fn test_missing_hash_rejected() {
        let err = verify("auth_date=1700000000&user=%7B%22id%22%3A1%7D", BOT_TOKEN).unwrap_err();
        assert!(matches!(err, GateError::Authentication(_)));
    }

    #[test]
    fn test_missing_user_field_rejected() {
        let fields = vec![("auth_date", "1700000000"), ("start_param", "abc123")];
        let init_data = signed_init_data(&fields, BOT_TOKEN);
        let err = verify(&init_data, BOT_TOKEN).unwrap_err();
        assert!(matches!(err, GateError::Authentication(_)));
    }

    #[test]
    fn test_start_param_optional() {
        let fields = vec![
            ("auth_date", "1700000000"),
            ("user", r#"{"id":7,"first_name":"Lin"}"#),
        ];
        let init_data = signed_init_data(&fields, BOT_TOKEN);
        let claims = verify(&init_data, BOT_TOKEN).unwrap();
        assert_eq!(claims.user_id, 7);
        assert!(claims.start_param.is_none());
    }

    #[test]
    fn test_check_string_is_sorted_and_newline_joined() {
        let mut fields = vec![
            ("b".to_string(), "2".to_string()),
            ("a".to_string(), "1".to_string()),
            ("c".to_string(), "3".to_string()),
        ];
        assert_eq!(data_check_string(&mut fields), "a=1\nb=2\nc=3");
    }
}
