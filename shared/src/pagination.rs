//! Opaque pagination tokens.
//!
//! A token is the store's last evaluated key, JSON-encoded and then
//! base64url-encoded without padding.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde_json::Value;
use tracing::warn;

use crate::store::Item;
use crate::Result;

pub fn encode_token(key: &Item) -> Result<String> {
    let json = serde_json::to_vec(key)?;
    Ok(URL_SAFE_NO_PAD.encode(json))
}

/// Decode a token. A raw JSON object is accepted too; anything else is
/// ignored so the query restarts from the beginning.
pub fn decode_token(token: Option<&str>) -> Option<Item> {
    let token = token?.trim();
    if token.is_empty() {
        return None;
    }

    let parsed = if token.starts_with('{') {
        serde_json::from_str::<Value>(token).ok()
    } else {
        URL_SAFE_NO_PAD
            .decode(token.trim_end_matches('='))
            .ok()
            .and_then(|bytes| serde_json::from_slice::<Value>(&bytes).ok())
    };

    match parsed {
        Some(Value::Object(map)) => Some(map),
        _ => {
            warn!("Ignoring undecodable pagination token");
            None
        }
    }
}
