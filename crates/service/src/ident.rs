use std::fmt;

use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier used for both sessions and rooms.
///
/// 12 bytes from a cryptographic RNG rendered as 24 lowercase hex digits, so
/// a collision with any previously issued identifier is negligible for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Id(String);

impl Id {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 12];
        rand::rng().fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const NAME_MAX_CHARS: usize = 32;
pub const CHAT_MAX_CHARS: usize = 500;

/// Canonicalize a display name.
///
/// The name must be a JSON string whose trimmed form is 1..=32 characters
/// drawn from letters, digits, space, underscore, dash and dot.
pub fn validate_name(value: &Value) -> Option<String> {
    let name = value.as_str()?.trim();
    if name.is_empty() || name.len() > NAME_MAX_CHARS {
        return None;
    }

    name.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, ' ' | '_' | '-' | '.'))
        .then(|| name.to_string())
}

/// Canonicalize a chat body.
///
/// Multi-line text is allowed, embedded control characters are not: every C0
/// control except line feed and carriage return is rejected, as is DEL.
/// (Tab is outside the banned ranges and passes.)
pub fn validate_chat(value: &Value) -> Option<String> {
    let text = value.as_str()?.trim();
    if text.is_empty() || text.chars().count() > CHAT_MAX_CHARS {
        return None;
    }

    text.chars()
        .all(|c| {
            !matches!(
                c,
                '\u{00}'..='\u{08}' | '\u{0B}' | '\u{0C}' | '\u{0E}'..='\u{1F}' | '\u{7F}'
            )
        })
        .then(|| text.to_string())
}

/// Split a private-message prefix off a chat body.
///
/// Two shapes are recognized:
///
/// * `@"name with spaces" body` — a closing quote, then a single space, then
///   a non-empty body.
/// * `@name body` — split at the first space, both halves non-empty.
///
/// Reply prefixes (`@reply [...`) are the router's concern; it never calls
/// this for them.
pub fn parse_private_prefix(text: &str) -> Option<(&str, &str)> {
    let rest = text.strip_prefix('@')?;

    if let Some(quoted) = rest.strip_prefix('"') {
        let close = quoted.find('"')?;
        let name = &quoted[..close];
        let body = quoted[close + 1..].strip_prefix(' ')?;
        return (!body.is_empty()).then_some((name, body));
    }

    let (name, body) = rest.split_once(' ')?;
    (!name.is_empty() && !body.is_empty()).then_some((name, body))
}
