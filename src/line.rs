use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use constant_time_eq::constant_time_eq;
use hmac::{Hmac, Mac};
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use std::time::Duration;

const MESSAGING_API_BASE: &str = "https://api.line.me/v2/bot";
const CONTENT_API_BASE: &str = "https://api-data.line.me/v2/bot";

/// Media downloads can be large; everything else is a small JSON post.
const CONTENT_TIMEOUT: Duration = Duration::from_secs(120);
const MESSAGE_TIMEOUT: Duration = Duration::from_secs(15);

/// Webhook body: a batch of events.
#[derive(Debug, Clone, Deserialize)]
pub struct WebhookPayload {
    #[serde(default)]
    pub events: Vec<WebhookEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(rename = "replyToken")]
    pub reply_token: Option<String>,
    pub source: Option<EventSource>,
    pub message: Option<EventMessage>,
}

impl WebhookEvent {
    pub fn user_id(&self) -> Option<&str> {
        self.source.as_ref().and_then(|s| s.user_id.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventSource {
    #[serde(rename = "userId")]
    pub user_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventMessage {
    pub id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub text: Option<String>,
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
}

/// Validate `X-Line-Signature`: HMAC-SHA256 over the raw body, base64,
/// compared in constant time.
pub fn validate_signature(secret: &str, body: &[u8], signature: &str) -> bool {
    if secret.is_empty() || signature.is_empty() {
        return false;
    }
    let Ok(mut mac) = Hmac::<Sha256>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    let expected = BASE64.encode(mac.finalize().into_bytes());
    expected.len() == signature.len() && constant_time_eq(expected.as_bytes(), signature.as_bytes())
}

#[async_trait]
pub trait LineApi: Send + Sync {
    /// One-shot reply consuming the event's reply token.
    async fn reply(&self, reply_token: &str, text: &str) -> Result<()>;
    /// Push a message to a user outside the reply window.
    async fn push(&self, user_id: &str, text: &str) -> Result<()>;
    /// Download the binary content of a media message.
    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>>;
}

#[derive(Debug, Clone)]
pub struct LineClient {
    client: Client,
    access_token: String,
}

impl LineClient {
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        let user_agent = format!("linecloud/{}", env!("CARGO_PKG_VERSION"));
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .user_agent(user_agent)
            .build()
            .context("Failed to build LINE HTTP client")?;
        Ok(Self {
            client,
            access_token: access_token.into(),
        })
    }

    async fn post_message(&self, endpoint: &str, body: serde_json::Value) -> Result<()> {
        let url = format!("{MESSAGING_API_BASE}/message/{endpoint}");
        let res = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .timeout(MESSAGE_TIMEOUT)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("LINE {endpoint} request failed"))?;
        let status = res.status();
        if !status.is_success() {
            let text = res.text().await.unwrap_or_default();
            return Err(anyhow!(
                "LINE {} HTTP error (status {}): {}",
                endpoint,
                status,
                text
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl LineApi for LineClient {
    async fn reply(&self, reply_token: &str, text: &str) -> Result<()> {
        self.post_message(
            "reply",
            json!({
                "replyToken": reply_token,
                "messages": [{ "type": "text", "text": text }]
            }),
        )
        .await
    }

    async fn push(&self, user_id: &str, text: &str) -> Result<()> {
        self.post_message(
            "push",
            json!({
                "to": user_id,
                "messages": [{ "type": "text", "text": text }]
            }),
        )
        .await
    }

    async fn fetch_content(&self, message_id: &str) -> Result<Vec<u8>> {
        let url = format!("{CONTENT_API_BASE}/message/{message_id}/content");
        let res = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .timeout(CONTENT_TIMEOUT)
            .send()
            .await
            .context("LINE content request failed")?;
        let status = res.status();
        if !status.is_success() {
            return Err(anyhow!(
                "LINE content HTTP error for message {} (status {})",
                message_id,
                status
            ));
        }
        let bytes = res.bytes().await.context("Failed to read LINE content")?;
        Ok(bytes.to_vec())
    }
}
