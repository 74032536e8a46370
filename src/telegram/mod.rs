//! Telegram Bot API transport.
//!
//! A small client over the HTTP Bot API: long polling with `getUpdates`
//! for inbound messages, plus the [`MessagingSink`] calls the agent needs
//! (`sendMessage`, `sendChatAction`, `editMessageText`).

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::comm::{EntityKind, InboundMessage, MessageEntity, MessageHandle, MessagingSink, Sender};
use crate::session::ChatId;
use crate::trigger::BotIdentity;

/// Default Bot API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.telegram.org";

/// Server-side long-poll timeout for `getUpdates`.
pub const POLL_TIMEOUT_SECS: u64 = 30;

/// Telegram rejects messages longer than 4096 UTF-16 units.
const MAX_MESSAGE_BYTES: usize = 4000;

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    error_code: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
    #[serde(default)]
    pub is_bot: bool,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub kind: String,
    pub offset: usize,
    pub length: usize,
    #[serde(default)]
    pub user: Option<User>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub message_id: i64,
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub reply_to_message: Option<Box<Message>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

fn to_entity(e: &Entity) -> MessageEntity {
    let kind = match e.kind.as_str() {
        "mention" => EntityKind::Mention,
        "text_mention" => match &e.user {
            Some(u) => EntityKind::TextMention { user_id: u.id },
            None => EntityKind::Other(e.kind.clone()),
        },
        other => EntityKind::Other(other.to_string()),
    };
    MessageEntity {
        kind,
        offset: e.offset,
        length: e.length,
    }
}

/// Convert a Bot API message into an [`InboundMessage`].  Messages without
/// text (stickers, photos, service messages) yield `None`.
pub fn to_inbound(msg: &Message) -> Option<InboundMessage> {
    let text = msg.text.as_ref()?;
    Some(InboundMessage {
        chat_id: msg.chat.id,
        message_id: msg.message_id,
        sender: msg.from.as_ref().map(|u| Sender {
            id: u.id,
            first_name: u.first_name.clone(),
            username: u.username.clone(),
        }),
        text: text.clone(),
        entities: msg.entities.iter().map(to_entity).collect(),
        reply_to_sender_id: msg
            .reply_to_message
            .as_ref()
            .and_then(|r| r.from.as_ref())
            .map(|u| u.id),
    })
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct TelegramClient {
    client: Client,
    base_url: String,
    token: String,
}

impl TelegramClient {
    /// `timeout` bounds ordinary calls; long-poll requests get the poll
    /// window on top of it.
    pub fn new(token: &str, base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout + Duration::from_secs(POLL_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("failed to build Telegram HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, body: &Value) -> anyhow::Result<T> {
        let url = format!("{}/bot{}/{method}", self.base_url, self.token);
        // reqwest errors carry the URL, which contains the token
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram {method} request failed: {}", e.without_url()))?;

        let status = resp.status();
        let parsed: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Telegram {method} returned {status} with an invalid body: {}", e.without_url()))?;

        if !parsed.ok {
            anyhow::bail!(
                "Telegram {method} returned {}: {}",
                parsed.error_code.unwrap_or_else(|| i64::from(status.as_u16())),
                parsed.description.unwrap_or_default()
            );
        }
        parsed
            .result
            .ok_or_else(|| anyhow::anyhow!("Telegram {method} returned no result"))
    }

    /// Identity of the bot owning the token.
    pub async fn get_me(&self) -> anyhow::Result<BotIdentity> {
        let me: User = self.call("getMe", &json!({})).await?;
        Ok(BotIdentity {
            id: me.id,
            username: me.username.unwrap_or_default(),
        })
    }

    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> anyhow::Result<Vec<Update>> {
        self.call(
            "getUpdates",
            &json!({
                "offset": offset,
                "timeout": timeout_secs,
                "allowed_updates": ["message"],
            }),
        )
        .await
    }

    /// Long-poll for updates until `cancel` fires, handing every text
    /// message to `on_message`.  Failures back off exponentially (capped).
    pub async fn poll<F>(&self, cancel: &CancellationToken, mut on_message: F)
    where
        F: FnMut(InboundMessage),
    {
        let mut offset = 0i64;
        let mut failures = 0u32;
        info!("telegram polling started");
        loop {
            let updates = tokio::select! {
                _ = cancel.cancelled() => break,
                r = self.get_updates(offset, POLL_TIMEOUT_SECS) => r,
            };
            match updates {
                Ok(updates) => {
                    failures = 0;
                    for update in updates {
                        offset = offset.max(update.update_id + 1);
                        match update.message.as_ref().and_then(to_inbound) {
                            Some(msg) => on_message(msg),
                            None => debug!(update_id = update.update_id, "skipping non-text update"),
                        }
                    }
                }
                Err(e) => {
                    let delay = crate::utils::backoff_delay(
                        Duration::from_secs(1),
                        failures,
                        Duration::from_secs(60),
                    );
                    failures = failures.saturating_add(1);
                    warn!(error = %e, retry_in_secs = delay.as_secs(), "getUpdates failed");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
        info!("telegram polling stopped");
    }
}

#[async_trait]
impl MessagingSink for TelegramClient {
    async fn send_typing(&self, chat_id: ChatId) -> anyhow::Result<()> {
        let _: Value = self
            .call(
                "sendChatAction",
                &json!({ "chat_id": chat_id, "action": "typing" }),
            )
            .await?;
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<MessageHandle> {
        let mut body = json!({
            "chat_id": chat_id,
            "text": crate::utils::truncate_str(text, MAX_MESSAGE_BYTES),
        });
        if let Some(id) = reply_to {
            body["reply_parameters"] = json!({
                "message_id": id,
                "allow_sending_without_reply": true,
            });
        }
        let sent: Message = self.call("sendMessage", &body).await?;
        Ok(MessageHandle {
            chat_id: sent.chat.id,
            message_id: sent.message_id,
        })
    }

    async fn edit_message(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()> {
        let _: Value = self
            .call(
                "editMessageText",
                &json!({
                    "chat_id": handle.chat_id,
                    "message_id": handle.message_id,
                    "text": crate::utils::truncate_str(text, MAX_MESSAGE_BYTES),
                }),
            )
            .await?;
        Ok(())
    }
}
