// ============================================================================
// Queue Message Model & Codec
// ============================================================================
//
// Queue entries arrive as raw strings written by several producer generations:
// plain JSON objects, JSON wrapped in an envelope object, and double-encoded
// JSON strings. The codec tolerates all of them and reports anything it cannot
// turn into a usable message as Malformed, so the drainer can discard the raw
// entry without retrying it.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Telegram text formatting mode. Unknown values degrade to PlainText rather
/// than poisoning the whole message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParseMode {
    PlainText,
    Html,
    Markdown,
    MarkdownV2,
}

impl From<String> for ParseMode {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "html" => ParseMode::Html,
            "markdown" => ParseMode::Markdown,
            "markdownv2" => ParseMode::MarkdownV2,
            _ => ParseMode::PlainText,
        }
    }
}

impl From<ParseMode> for String {
    fn from(mode: ParseMode) -> Self {
        match mode {
            ParseMode::PlainText => "".to_string(),
            ParseMode::Html => "HTML".to_string(),
            ParseMode::Markdown => "Markdown".to_string(),
            ParseMode::MarkdownV2 => "MarkdownV2".to_string(),
        }
    }
}

impl ParseMode {
    /// Value for the Bot API `parse_mode` field; PlainText means "omit it"
    pub fn as_api_value(&self) -> Option<&'static str> {
        match self {
            ParseMode::PlainText => None,
            ParseMode::Html => Some("HTML"),
            ParseMode::Markdown => Some("Markdown"),
            ParseMode::MarkdownV2 => Some("MarkdownV2"),
        }
    }
}

/// One pending broadcast message, stored serialized in the queue sorted set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub id: String,
    /// Recipient chat identifier; producers send it as a string or a number
    #[serde(deserialize_with = "chat_id_flexible")]
    pub chat_id: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub parse_mode: Option<ParseMode>,
    /// Inline keyboard payload, passed through to the transport unmodified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keyboard: Option<Value>,
    /// Presence switches delivery to an image-with-caption call
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    /// Sorted-set score; lower is delivered sooner
    #[serde(default)]
    pub priority: f64,
    /// Epoch milliseconds
    #[serde(default)]
    pub created_at: i64,
    /// Correlates this message to a broadcast campaign
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_id: Option<String>,
}

fn chat_id_flexible<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "chatId must be a string or number, got {}",
            other
        ))),
    }
}

/// Result of decoding one raw queue entry
#[derive(Debug)]
pub enum Decoded {
    Message(QueueMessage),
    /// The entry can never legitimately succeed and must be discarded
    Malformed,
}

/// Envelope field names older producers wrapped the payload in
const ENVELOPE_KEYS: &[&str] = &["message", "data", "payload"];

/// Decode a raw queue entry into a QueueMessage.
///
/// Never fails toward the caller: anything that cannot yield both a non-empty
/// `id` and `chatId` comes back as `Decoded::Malformed`.
pub fn decode(raw: &str) -> Decoded {
    let mut value: Value = match serde_json::from_str(raw) {
        Ok(v) => v,
        Err(_) => return Decoded::Malformed,
    };

    // Peel envelope layers and double-encoded strings. Bounded so a
    // pathological self-referencing payload cannot loop.
    for _ in 0..3 {
        let next = match &value {
            Value::String(inner) => match serde_json::from_str(inner) {
                Ok(v) => Some(v),
                Err(_) => return Decoded::Malformed,
            },
            Value::Object(map) if !map.contains_key("id") => {
                ENVELOPE_KEYS.iter().find_map(|k| map.get(*k)).cloned()
            }
            _ => None,
        };
        match next {
            Some(v) => value = v,
            None => break,
        }
    }

    let message: QueueMessage = match serde_json::from_value(value) {
        Ok(m) => m,
        Err(_) => return Decoded::Malformed,
    };

    if message.id.is_empty() || message.chat_id.is_empty() {
        return Decoded::Malformed;
    }

    Decoded::Message(message)
}
