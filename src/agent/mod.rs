//! Agent runtime: the tool-call orchestration loop.
//!
//! [`Agent::run_turn`] takes one triggering message through the
//! request → model response → capability invocation → continuation cycle,
//! streams text back through the [`MessagingSink`], and persists the
//! resulting history to the [`ConversationStore`].
//!
//! Inbound routing (trigger classification, spawning, shutdown drain) lives
//! in [`dispatch`]; the grammar-check path lives in [`correction`].

pub mod correction;
pub mod dispatch;

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::capabilities::{CallContext, CapabilityRegistry, CapabilityResult};
use crate::comm::{InboundMessage, MessageHandle, MessagingSink};
use crate::config::{BotConfig, Config};
use crate::models::{GeminiProvider, ModelProvider, ModelResponse, ResponsePart, RetryProvider};
use crate::session::{ChatId, ConversationStore, FunctionCall, FunctionResponse, Role, Turn};

/// Prefix of every user-visible error reply.
pub const ERROR_PREFIX: &str = "Erro: ";

/// Longest error detail echoed back to a chat.
const MAX_ERROR_DETAIL: usize = 400;

/// Format a user-visible error reply.
pub fn error_text(detail: impl std::fmt::Display) -> String {
    format!(
        "{ERROR_PREFIX}{}",
        crate::utils::truncate_str(&detail.to_string(), MAX_ERROR_DETAIL)
    )
}

// ---------------------------------------------------------------------------
// Settings
// ---------------------------------------------------------------------------

/// Orchestrator knobs, lifted from [`BotConfig`].
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub system_instruction: String,
    pub max_tool_iterations: usize,
    pub request_timeout: Duration,
    pub correction_prompt: String,
}

impl AgentSettings {
    pub fn from_config(bot: &BotConfig) -> Self {
        Self {
            system_instruction: bot.prompt.clone(),
            max_tool_iterations: bot.max_tool_iterations.max(1),
            request_timeout: bot.request_timeout(),
            correction_prompt: bot.unintelligible_prompt.clone(),
        }
    }
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self::from_config(&BotConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Turn report
// ---------------------------------------------------------------------------

/// How a turn ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnOutcome {
    /// Text was delivered and history persisted.
    Replied,
    /// The model produced no text; history persisted.
    NoReply,
    /// A model call failed; error shown, history untouched.
    ModelFailed,
    /// Too many capability rounds; error shown, history untouched.
    StepLimit,
    /// Shutdown interrupted the turn; history untouched.
    Cancelled,
}

/// Record of a single capability invocation within a turn.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCallRecord {
    pub capability: String,
    /// Compact summary of the arguments (truncated).
    pub args_summary: String,
    pub success: bool,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Summary of a completed turn.
#[derive(Debug, Clone, Serialize)]
pub struct TurnReport {
    pub chat_id: ChatId,
    pub outcome: TurnOutcome,
    pub tool_calls: Vec<ToolCallRecord>,
    /// Number of model round-trips.
    pub model_calls: u32,
    /// New messages sent (edits are not counted).
    pub replies_sent: usize,
    pub duration_ms: u64,
}

// ---------------------------------------------------------------------------
// Agent
// ---------------------------------------------------------------------------

/// Shared orchestrator state.  Cheap to share behind an `Arc`; every turn
/// borrows it immutably.
pub struct Agent {
    provider: Arc<dyn ModelProvider>,
    registry: Arc<CapabilityRegistry>,
    store: Arc<ConversationStore>,
    sink: Arc<dyn MessagingSink>,
    settings: AgentSettings,
}

/// Text accumulated for the reply of one turn.  The first text is sent as
/// a reply to the triggering message; later text edits that message.
#[derive(Default)]
struct ReplyState {
    handle: Option<MessageHandle>,
    text: String,
    sent: usize,
}

/// Skip orphaned capability turns left at the front of a truncated
/// history; the request must start at a user message.
fn request_window(history: &[Turn]) -> &[Turn] {
    let start = history
        .iter()
        .position(|t| t.role() == Role::User && !t.is_function_results())
        .unwrap_or(history.len());
    &history[start..]
}

impl Agent {
    pub fn new(
        provider: Arc<dyn ModelProvider>,
        registry: Arc<CapabilityRegistry>,
        store: Arc<ConversationStore>,
        sink: Arc<dyn MessagingSink>,
        settings: AgentSettings,
    ) -> Self {
        Self {
            provider,
            registry,
            store,
            sink,
            settings,
        }
    }

    /// Wire the production stack from configuration: Gemini behind
    /// retries, the builtin capabilities, and an empty store.
    pub fn from_config(cfg: &Config, sink: Arc<dyn MessagingSink>) -> anyhow::Result<Self> {
        let timeout = cfg.bot.request_timeout();
        let gemini = GeminiProvider::new(&cfg.keys.gemini, &cfg.bot.model, &cfg.api.gemini_url, timeout)?;
        let provider: Arc<dyn ModelProvider> =
            Arc::new(RetryProvider::new(Arc::new(gemini), cfg.bot.model_retries));
        let registry = crate::capabilities::builtin_registry(&cfg.capabilities, timeout)?;
        Ok(Self::new(
            provider,
            Arc::new(registry),
            Arc::new(ConversationStore::new(cfg.bot.max_history)),
            sink,
            AgentSettings::from_config(&cfg.bot),
        ))
    }

    pub fn store(&self) -> &Arc<ConversationStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Run `fut` under the per-call timeout, giving up early on shutdown.
    /// `None` means cancelled.
    async fn bounded<F: Future>(
        &self,
        cancel: &CancellationToken,
        fut: F,
    ) -> Option<Result<F::Output, tokio::time::error::Elapsed>> {
        tokio::select! {
            _ = cancel.cancelled() => None,
            r = tokio::time::timeout(self.settings.request_timeout, fut) => Some(r),
        }
    }

    async fn typing(&self, chat_id: ChatId) {
        if let Err(e) = self.sink.send_typing(chat_id).await {
            debug!(chat_id, error = %e, "typing indicator failed");
        }
    }

    /// Send `text` as a reply to `msg`.  Failures are logged.
    pub(crate) async fn reply(&self, msg: &InboundMessage, text: &str) -> Option<MessageHandle> {
        match self
            .sink
            .send_message(msg.chat_id, text, Some(msg.message_id))
            .await
        {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(chat_id = msg.chat_id, error = %e, "failed to send message");
                None
            }
        }
    }

    async fn emit_text(&self, msg: &InboundMessage, state: &mut ReplyState, text: &str) {
        state.text.push_str(text);
        match state.handle {
            Some(handle) => {
                if let Err(e) = self.sink.edit_message(&handle, &state.text).await {
                    warn!(chat_id = msg.chat_id, error = %e, "failed to edit message");
                }
            }
            None => {
                if let Some(handle) = self.reply(msg, &state.text).await {
                    state.handle = Some(handle);
                    state.sent += 1;
                }
            }
        }
    }

    async fn invoke(
        &self,
        call: &FunctionCall,
        ctx: CallContext,
        cancel: &CancellationToken,
    ) -> Option<(CapabilityResult, ToolCallRecord)> {
        let started = Instant::now();
        let result = match self
            .bounded(cancel, self.registry.invoke(&call.name, &call.args, ctx))
            .await?
        {
            Ok(r) => r,
            Err(_) => {
                warn!(capability = %call.name, "capability call timed out");
                CapabilityResult::error(format!(
                    "capability `{}` timed out after {}s",
                    call.name,
                    self.settings.request_timeout.as_secs()
                ))
            }
        };
        let record = ToolCallRecord {
            capability: call.name.clone(),
            args_summary: crate::utils::truncate_str(
                &serde_json::to_string(&call.args).unwrap_or_default(),
                200,
            ),
            success: !result.is_error(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: result.error_message().map(String::from),
        };
        Some((result, record))
    }

    /// Run one conversational turn for a triggering message.
    ///
    /// Returns `Err` only for failures outside the turn itself; model and
    /// capability failures are reported in the [`TurnReport`].
    pub async fn run_turn(
        &self,
        msg: &InboundMessage,
        cancel: &CancellationToken,
    ) -> anyhow::Result<TurnReport> {
        let started = Instant::now();
        let chat_id = msg.chat_id;
        let _turn_guard = self.store.lock(chat_id).await;

        let mut history = self.store.get(chat_id).history;
        let stored_len = history.len();
        history.push(Turn::user_message(msg.sender_name(), &msg.text));

        let ctx = CallContext {
            chat_id,
            sender_id: msg.sender_id(),
        };
        let declarations = self.registry.declarations();
        let mut reply = ReplyState::default();
        let mut tool_calls = Vec::new();
        let mut model_calls = 0u32;
        let mut rounds = 0usize;

        let finish = |outcome: TurnOutcome,
                      tool_calls: Vec<ToolCallRecord>,
                      model_calls: u32,
                      replies_sent: usize| TurnReport {
            chat_id,
            outcome,
            tool_calls,
            model_calls,
            replies_sent,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        let outcome = loop {
            self.typing(chat_id).await;
            model_calls += 1;

            let generate = self.provider.generate(
                request_window(&history),
                &self.settings.system_instruction,
                &declarations,
            );
            let response: ModelResponse = match self.bounded(cancel, generate).await {
                None => {
                    info!(chat_id, "turn cancelled during model call");
                    return Ok(finish(TurnOutcome::Cancelled, tool_calls, model_calls, reply.sent));
                }
                Some(Ok(Ok(r))) => r,
                Some(Ok(Err(e))) => {
                    warn!(chat_id, error = %e, "model call failed");
                    self.reply(msg, &error_text(&e)).await;
                    return Ok(finish(TurnOutcome::ModelFailed, tool_calls, model_calls, reply.sent));
                }
                Some(Err(_)) => {
                    let e = format!(
                        "model call timed out after {}s",
                        self.settings.request_timeout.as_secs()
                    );
                    warn!(chat_id, "{e}");
                    self.reply(msg, &error_text(&e)).await;
                    return Ok(finish(TurnOutcome::ModelFailed, tool_calls, model_calls, reply.sent));
                }
            };

            let mut calls: Vec<FunctionCall> = Vec::new();
            let mut separated = reply.text.is_empty();
            for part in response.parts() {
                match part {
                    ResponsePart::Text(text) => {
                        if text.trim().is_empty() {
                            continue;
                        }
                        if !separated {
                            reply.text.push_str("\n\n");
                            separated = true;
                        }
                        self.emit_text(msg, &mut reply, text).await;
                    }
                    ResponsePart::FunctionCall(call) => calls.push(call.clone()),
                    ResponsePart::Unexpected(kind) => {
                        warn!(chat_id, part = %kind, "unexpected response part, skipping");
                    }
                }
            }

            let Some(model_turn) = response.to_turn() else {
                warn!(chat_id, "model returned an empty response");
                break if reply.sent > 0 {
                    TurnOutcome::Replied
                } else {
                    TurnOutcome::NoReply
                };
            };
            history.push(model_turn);

            if calls.is_empty() {
                break if reply.sent > 0 {
                    TurnOutcome::Replied
                } else {
                    TurnOutcome::NoReply
                };
            }

            if rounds >= self.settings.max_tool_iterations {
                warn!(chat_id, rounds, "tool loop step limit reached");
                self.reply(
                    msg,
                    &error_text(format!("too many steps ({rounds}) while answering")),
                )
                .await;
                return Ok(finish(TurnOutcome::StepLimit, tool_calls, model_calls, reply.sent));
            }
            rounds += 1;

            let mut responses = Vec::with_capacity(calls.len());
            for call in &calls {
                debug!(chat_id, capability = %call.name, "invoking capability");
                let Some((result, record)) = self.invoke(call, ctx, cancel).await else {
                    info!(chat_id, "turn cancelled during capability call");
                    return Ok(finish(TurnOutcome::Cancelled, tool_calls, model_calls, reply.sent));
                };
                tool_calls.push(record);
                responses.push(FunctionResponse {
                    name: call.name.clone(),
                    response: result.into_map(),
                });
            }
            history.push(Turn::function_results(responses));
        };

        let added = history.len() - stored_len;
        self.store.save(chat_id, history);
        info!(
            chat_id,
            outcome = ?outcome,
            turns_added = added,
            model_calls,
            capability_calls = tool_calls.len(),
            "turn completed"
        );
        Ok(finish(outcome, tool_calls, model_calls, reply.sent))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Part;

    #[test]
    fn request_window_skips_orphaned_function_turns() {
        let orphan_result = Turn::function_results(vec![FunctionResponse {
            name: "get_my_ip".into(),
            response: Default::default(),
        }]);
        let model = Turn::new(Role::Model, vec![Part::Text("ok".into())]);
        let user = Turn::user_message("Ana", "oi");
        let history = vec![orphan_result, model, user.clone()];
        assert_eq!(request_window(&history), &[user]);
    }

    #[test]
    fn request_window_keeps_clean_history() {
        let history = vec![
            Turn::user_message("Ana", "oi"),
            Turn::new(Role::Model, vec![Part::Text("olá".into())]),
        ];
        assert_eq!(request_window(&history).len(), 2);
    }

    #[test]
    fn error_text_is_prefixed_and_bounded() {
        assert_eq!(error_text("boom"), "Erro: boom");
        let long = "x".repeat(2000);
        assert!(error_text(&long).len() < 500);
    }
}
