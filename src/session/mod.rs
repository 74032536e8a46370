//! Conversation history: `Turn`, `Part`, `Session`, and `ConversationStore`.
//!
//! History lives only in memory.  Each conversation (a Telegram chat id)
//! owns an ordered list of [`Turn`]s that the store bounds to a configured
//! maximum, evicting the oldest turns first.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::OwnedMutexGuard;
use tracing::debug;

/// Conversation identifier as delivered by the messaging platform.
pub type ChatId = i64;

// ── Turn ─────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Model => "model",
        }
    }
}

/// A capability invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: Map<String, Value>,
}

/// The result of a capability invocation, handed back to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionResponse {
    pub name: String,
    pub response: Map<String, Value>,
}

/// One piece of a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Part {
    Text(String),
    FunctionCall(FunctionCall),
    FunctionResponse(FunctionResponse),
}

/// A single history entry.  Turns are immutable once built; the store only
/// ever appends whole turns or drops them from the front.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    role: Role,
    parts: Vec<Part>,
}

impl Turn {
    pub fn new(role: Role, parts: Vec<Part>) -> Self {
        Self { role, parts }
    }

    /// A user text turn tagged with the sender's display name: `[name] text`.
    pub fn user_message(sender_name: &str, text: &str) -> Self {
        Self::new(Role::User, vec![Part::Text(format!("[{sender_name}] {text}"))])
    }

    /// Capability results are sent back under the user role, one part per
    /// call answered.
    pub fn function_results(responses: Vec<FunctionResponse>) -> Self {
        Self::new(
            Role::User,
            responses.into_iter().map(Part::FunctionResponse).collect(),
        )
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn parts(&self) -> &[Part] {
        &self.parts
    }

    /// Concatenated text parts (empty when the turn carries none).
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| match p {
                Part::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    pub fn has_function_calls(&self) -> bool {
        self.parts.iter().any(|p| matches!(p, Part::FunctionCall(_)))
    }

    pub fn is_function_results(&self) -> bool {
        !self.parts.is_empty()
            && self
                .parts
                .iter()
                .all(|p| matches!(p, Part::FunctionResponse(_)))
    }
}

// ── Session ──────────────────────────────────────────────────

/// Snapshot of one conversation's history.
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: ChatId,
    pub history: Vec<Turn>,
}

impl Session {
    pub fn empty(id: ChatId) -> Self {
        Self {
            id,
            history: Vec::new(),
        }
    }
}

/// Drop the oldest turns until at most `max` remain.
pub fn truncate_history(history: &mut Vec<Turn>, max: usize) {
    if history.len() > max {
        let excess = history.len() - max;
        history.drain(..excess);
    }
}

// ── ConversationStore ────────────────────────────────────────

/// Internally synchronised map of conversation id → bounded history.
///
/// `get` never inserts; only `save` creates or replaces an entry.  Turns for
/// the same conversation can be serialised with [`ConversationStore::lock`].
pub struct ConversationStore {
    max_history: usize,
    sessions: RwLock<HashMap<ChatId, Vec<Turn>>>,
    turn_locks: Mutex<HashMap<ChatId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationStore {
    /// Create a store that retains at most `max_history` turns per
    /// conversation (clamped to ≥ 1).
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            sessions: RwLock::new(HashMap::new()),
            turn_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_history(&self) -> usize {
        self.max_history
    }

    /// Return the stored session, or an empty one for an unknown id.
    pub fn get(&self, id: ChatId) -> Session {
        let sessions = self.sessions.read().unwrap_or_else(PoisonError::into_inner);
        match sessions.get(&id) {
            Some(history) => Session {
                id,
                history: history.clone(),
            },
            None => Session::empty(id),
        }
    }

    /// Replace the stored history for `id`, keeping only the most recent
    /// `max_history` turns.  Last writer wins.
    pub fn save(&self, id: ChatId, mut history: Vec<Turn>) {
        let before = history.len();
        truncate_history(&mut history, self.max_history);
        debug!(
            chat_id = id,
            turns = history.len(),
            evicted = before - history.len(),
            "conversation history saved"
        );
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, history);
    }

    /// Forget a conversation entirely.
    pub fn remove(&self, id: ChatId) -> bool {
        self.sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id)
            .is_some()
    }

    pub fn contains(&self, id: ChatId) -> bool {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    /// Number of conversations with stored history.
    pub fn len(&self) -> usize {
        self.sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Acquire the per-conversation turn lock.  Holding the guard for a
    /// whole get → mutate → save cycle makes that cycle atomic with respect
    /// to other turns in the same conversation.
    pub async fn lock(&self, id: ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .turn_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(id).or_default())
        };
        lock.lock_owned().await
    }
}
