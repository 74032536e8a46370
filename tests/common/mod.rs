//! Shared test doubles: a scripted model and a recording messaging sink.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use benebot::agent::{Agent, AgentSettings};
use benebot::capabilities::{Capability, CapabilityRegistry, CapabilityResult, FunctionDeclaration};
use benebot::comm::{InboundMessage, MessageEntity, MessageHandle, MessagingSink, Sender};
use benebot::models::{ModelProvider, ModelResponse};
use benebot::session::{ChatId, ConversationStore, Turn};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Scripted model
// ---------------------------------------------------------------------------

/// Replays a fixed list of responses, one per call, and records the
/// history it was given each time.
pub struct ScriptedProvider {
    script: Mutex<VecDeque<Result<ModelResponse, String>>>,
    pub calls: AtomicUsize,
    pub seen: Mutex<Vec<Vec<Turn>>>,
    pub json_reply: Mutex<Option<Result<String, String>>>,
}

impl ScriptedProvider {
    pub fn new(script: Vec<Result<ModelResponse, String>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: AtomicUsize::new(0),
            seen: Mutex::new(Vec::new()),
            json_reply: Mutex::new(None),
        }
    }

    pub fn ok(responses: Vec<ModelResponse>) -> Self {
        Self::new(responses.into_iter().map(Ok).collect())
    }

    pub fn with_json(self, reply: Result<String, String>) -> Self {
        *self.json_reply.lock().unwrap() = Some(reply);
        self
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ModelProvider for ScriptedProvider {
    async fn generate(
        &self,
        history: &[Turn],
        _system_instruction: &str,
        _functions: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelResponse> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(history.to_vec());
        match self.script.lock().unwrap().pop_front() {
            Some(Ok(r)) => Ok(r),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Err(anyhow::anyhow!("script exhausted")),
        }
    }

    async fn generate_json(
        &self,
        history: &[Turn],
        _system_instruction: &str,
        _schema: &Value,
    ) -> anyhow::Result<String> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen.lock().unwrap().push(history.to_vec());
        match self.json_reply.lock().unwrap().clone() {
            Some(Ok(s)) => Ok(s),
            Some(Err(e)) => Err(anyhow::anyhow!(e)),
            None => Err(anyhow::anyhow!("no json reply scripted")),
        }
    }
}

/// Model that never answers.
pub struct StalledProvider;

#[async_trait]
impl ModelProvider for StalledProvider {
    async fn generate(
        &self,
        _history: &[Turn],
        _system_instruction: &str,
        _functions: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelResponse> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(ModelResponse::default())
    }
}

// ---------------------------------------------------------------------------
// Recording sink
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    Typing(ChatId),
    Sent {
        chat_id: ChatId,
        text: String,
        reply_to: Option<i64>,
    },
    Edited {
        message_id: i64,
        text: String,
    },
}

#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
    next_id: AtomicI64,
    fail_typing: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sink whose typing indicator always fails.
    pub fn failing_typing() -> Self {
        Self {
            fail_typing: true,
            ..Self::default()
        }
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events.lock().unwrap().clone()
    }

    /// Texts of newly sent messages, in order.
    pub fn sent(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Sent { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn edits(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                SinkEvent::Edited { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn typing_count(&self) -> usize {
        self.events()
            .iter()
            .filter(|e| matches!(e, SinkEvent::Typing(_)))
            .count()
    }
}

#[async_trait]
impl MessagingSink for RecordingSink {
    async fn send_typing(&self, chat_id: ChatId) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(SinkEvent::Typing(chat_id));
        if self.fail_typing {
            anyhow::bail!("typing unavailable");
        }
        Ok(())
    }

    async fn send_message(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> anyhow::Result<MessageHandle> {
        self.events.lock().unwrap().push(SinkEvent::Sent {
            chat_id,
            text: text.to_string(),
            reply_to,
        });
        Ok(MessageHandle {
            chat_id,
            message_id: 1000 + self.next_id.fetch_add(1, Ordering::SeqCst),
        })
    }

    async fn edit_message(&self, handle: &MessageHandle, text: &str) -> anyhow::Result<()> {
        self.events.lock().unwrap().push(SinkEvent::Edited {
            message_id: handle.message_id,
            text: text.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub const BOT_ID: i64 = 999;
pub const BOT_USERNAME: &str = "bene_bot";

pub fn args(v: Value) -> Map<String, Value> {
    v.as_object().cloned().unwrap_or_default()
}

/// Registry with a fake `get_my_ip` that counts its invocations.
pub fn ip_registry(invocations: Arc<AtomicUsize>) -> CapabilityRegistry {
    let mut reg = CapabilityRegistry::new();
    reg.register(Capability::new(
        "get_my_ip",
        "Gets the ip address of where the bot is currently hosted",
        vec![],
        Arc::new(move |_args, _ctx| {
            let invocations = Arc::clone(&invocations);
            Box::pin(async move {
                invocations.fetch_add(1, Ordering::SeqCst);
                CapabilityResult::ok(args(json!({ "ip": "203.0.113.5" })))
            })
        }),
    ))
    .unwrap();
    reg
}

pub fn agent_with(
    provider: Arc<dyn ModelProvider>,
    registry: CapabilityRegistry,
    store: Arc<ConversationStore>,
    sink: Arc<RecordingSink>,
    settings: AgentSettings,
) -> Agent {
    Agent::new(provider, Arc::new(registry), store, sink, settings)
}

pub fn settings(max_tool_iterations: usize) -> AgentSettings {
    AgentSettings {
        system_instruction: "You are a helpful bot.".into(),
        max_tool_iterations,
        request_timeout: Duration::from_secs(5),
        correction_prompt: "Check the grammar.".into(),
    }
}

pub fn sender(id: i64, name: &str) -> Sender {
    Sender {
        id,
        first_name: name.to_string(),
        username: None,
    }
}

/// `@bene_bot <rest>` with a proper mention entity.
pub fn mention(chat_id: ChatId, message_id: i64, from: Sender, rest: &str) -> InboundMessage {
    let mut msg = InboundMessage::text(
        chat_id,
        message_id,
        Some(from),
        &format!("@{BOT_USERNAME} {rest}"),
    );
    msg.entities
        .push(MessageEntity::mention(0, BOT_USERNAME.len() + 1));
    msg
}
