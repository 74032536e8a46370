//! Transport-agnostic messaging layer.
//!
//! Provides [`InboundMessage`], the envelope a transport (Telegram, the
//! `ask` CLI command, tests) produces for every incoming message, and the
//! [`MessagingSink`] trait the agent uses to talk back.

use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::session::ChatId;

/// Display name used when a message carries no sender information.
pub const ANONYMOUS: &str = "anonymous";

// ---------------------------------------------------------------------------
// InboundMessage
// ---------------------------------------------------------------------------

/// Author of an inbound message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    pub id: i64,
    pub first_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

impl Sender {
    pub fn display_name(&self) -> &str {
        if !self.first_name.is_empty() {
            &self.first_name
        } else {
            self.username.as_deref().unwrap_or(ANONYMOUS)
        }
    }
}

/// Kind of a formatting entity inside message text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntityKind {
    /// `@username` mention.
    Mention,
    /// Mention of a user without a public username.
    TextMention { user_id: i64 },
    Other(String),
}

/// A span of the message text.  `offset` and `length` are in UTF-16 code
/// units, as delivered by the Telegram Bot API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEntity {
    pub kind: EntityKind,
    pub offset: usize,
    pub length: usize,
}

impl MessageEntity {
    pub fn mention(offset: usize, length: usize) -> Self {
        Self {
            kind: EntityKind::Mention,
            offset,
            length,
        }
    }
}

/// A transport-agnostic inbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub chat_id: ChatId,
    pub message_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sender: Option<Sender>,
    pub text: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entities: Vec<MessageEntity>,
    /// Author of the message this one replies to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to_sender_id: Option<i64>,
}

impl InboundMessage {
    /// Plain text message with no entities and no reply target.
    pub fn text(chat_id: ChatId, message_id: i64, sender: Option<Sender>, text: &str) -> Self {
        Self {
            chat_id,
            message_id,
            sender,
            text: text.to_string(),
            entities: Vec::new(),
            reply_to_sender_id: None,
        }
    }

    pub fn sender_id(&self) -> Option<i64> {
        self.sender.as_ref().map(|s| s.id)
    }

    /// Display name of the author, `anonymous` when unknown.
    pub fn sender_name(&self) -> &str {
        self.sender.as_ref().map_or(ANONYMOUS, Sender::display_name)
    }
}

// ---------------------------------------------------------------------------
// MessagingSink
// ---------------------------------------------------------------------------

/// Identifies a message the bot sent, so it can be edited later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageHandle {
    pub chat_id: ChatId,
    pub message_id: i64,
}

/// Outbound side of a transport.
///
/// Callers treat every failure as non-fatal: they log and carry on.
#[async_trait]
pub trait MessagingSink: Send + Sync + 'static {
    /// Show a "typing…" indicator in `chat_id`.
    async fn send_typing(&self, chat_id: ChatId) -> anyhow::Result<()>;

    /// Send `text` to `chat_id`, optionally as a reply to `reply_to`.
    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<MessageHandle>;

    /// Replace the text of a previously sent message.
    async fn edit_message(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()>;
}

/// Sink that prints replies to stdout.  Used by the `ask` command.
#[derive(Debug, Default)]
pub struct StdoutSink {
    next_id: AtomicI64,
}

impl StdoutSink {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessagingSink for StdoutSink {
    async fn send_typing(&self, chat_id: ChatId) -> anyhow::Result<()> {
        tracing::debug!(chat_id, "typing");
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        _reply_to: Option<i64>,
    ) -> anyhow::Result<MessageHandle> {
        println!("{text}");
        Ok(MessageHandle {
            chat_id,
            message_id: self.next_id.fetch_add(1, Ordering::Relaxed) + 1,
        })
    }

    async fn edit_message(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()> {
        println!("(edited #{}) {text}", handle.message_id);
        Ok(())
    }
}
