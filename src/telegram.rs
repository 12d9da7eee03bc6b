// ============================================================================
// Delivery Client (Telegram Bot API)
// ============================================================================
//
// Wraps the two transport calls the broadcast needs (sendMessage and
// sendPhoto) and classifies failures from the API's error text. The API's
// own `ok` flag is the source of truth for success, not the HTTP status.

use crate::message::QueueMessage;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;

/// Outcome of one delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    /// Best-available error description when success is false
    pub error_text: Option<String>,
}

impl DeliveryResult {
    pub fn ok() -> Self {
        Self {
            success: true,
            error_text: None,
        }
    }

    pub fn failed(error_text: impl Into<String>) -> Self {
        Self {
            success: false,
            error_text: Some(error_text.into()),
        }
    }
}

/// Coarse classification of a delivery error, matched against the transport's
/// error text. Diagnostic only; nothing is retried based on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    BlockedBot,
    UserDeactivated,
    ChatNotFound,
    TooManyRequests,
    Unknown,
}

impl FailureReason {
    /// Case-insensitive substring matching, in priority order
    pub fn classify(error_text: &str) -> Self {
        let text = error_text.to_lowercase();
        if text.contains("bot was blocked") || text.contains("blocked") || text.contains("forbidden")
        {
            FailureReason::BlockedBot
        } else if text.contains("deactivated") {
            FailureReason::UserDeactivated
        } else if text.contains("chat not found") || text.contains("not found") {
            FailureReason::ChatNotFound
        } else if text.contains("too many requests") || text.contains("retry after") {
            FailureReason::TooManyRequests
        } else {
            FailureReason::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureReason::BlockedBot => "blocked_bot",
            FailureReason::UserDeactivated => "user_deactivated",
            FailureReason::ChatNotFound => "chat_not_found",
            FailureReason::TooManyRequests => "too_many_requests",
            FailureReason::Unknown => "unknown",
        }
    }
}

/// Transport boundary: one delivery attempt per message. Implementations must
/// never panic on transport failure: every outcome maps to a DeliveryResult.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, message: &QueueMessage) -> DeliveryResult;
}

/// Shape of a Bot API response; `ok` decides success
#[derive(Debug, Deserialize)]
struct ApiResponse {
    ok: bool,
    description: Option<String>,
}

pub struct TelegramClient {
    http: reqwest::Client,
    base_url: String,
}

impl TelegramClient {
    pub fn new(api_base: &str, bot_token: &str, timeout_secs: u64) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: format!("{}/bot{}", api_base.trim_end_matches('/'), bot_token),
        })
    }

    fn build_payload(message: &QueueMessage) -> (&'static str, Value) {
        let mut body = serde_json::Map::new();
        body.insert("chat_id".to_string(), json!(message.chat_id));

        if let Some(mode) = message.parse_mode.as_ref().and_then(|m| m.as_api_value()) {
            body.insert("parse_mode".to_string(), json!(mode));
        }
        if let Some(keyboard) = &message.keyboard {
            body.insert("reply_markup".to_string(), keyboard.clone());
        }

        match &message.image_url {
            Some(url) => {
                body.insert("photo".to_string(), json!(url));
                body.insert("caption".to_string(), json!(message.text));
                ("sendPhoto", Value::Object(body))
            }
            None => {
                body.insert("text".to_string(), json!(message.text));
                body.insert("disable_web_page_preview".to_string(), json!(true));
                ("sendMessage", Value::Object(body))
            }
        }
    }

    async fn call(&self, method: &str, payload: &Value) -> DeliveryResult {
        let url = format!("{}/{}", self.base_url, method);
        let response = match self.http.post(&url).json(payload).send().await {
            Ok(r) => r,
            Err(e) => return DeliveryResult::failed(e.to_string()),
        };

        match response.json::<ApiResponse>().await {
            Ok(api) if api.ok => DeliveryResult::ok(),
            Ok(api) => DeliveryResult::failed(
                api.description
                    .unwrap_or_else(|| "API rejected the message".to_string()),
            ),
            Err(e) => DeliveryResult::failed(format!("Unreadable API response: {}", e)),
        }
    }
}

#[async_trait]
impl Transport for TelegramClient {
    async fn send(&self, message: &QueueMessage) -> DeliveryResult {
        let (method, payload) = Self::build_payload(message);
        let result = self.call(method, &payload).await;

        if !result.success {
            tracing::debug!(
                message_id = %message.id,
                method = method,
                error = result.error_text.as_deref().unwrap_or("unknown"),
                "Delivery attempt failed"
            );
        }
        result
    }
}
