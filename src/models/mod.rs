//! Model provider abstractions.
//!
//! Defines the [`ModelProvider`] trait, the [`ModelResponse`] sum types the
//! orchestrator matches on, [`RetryProvider`] for retry semantics, and the
//! concrete [`GeminiProvider`].

pub mod gemini;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::warn;

use crate::capabilities::FunctionDeclaration;
use crate::session::{FunctionCall, Part, Role, Turn};

pub use gemini::GeminiProvider;

// ---------------------------------------------------------------------------
// ModelResponse
// ---------------------------------------------------------------------------

/// One part of a model response.
#[derive(Debug, Clone, PartialEq)]
pub enum ResponsePart {
    Text(String),
    FunctionCall(FunctionCall),
    /// Anything else the API sent back; carries a short description of
    /// the part for logging.
    Unexpected(String),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Candidate {
    pub parts: Vec<ResponsePart>,
}

/// A full response: zero or more candidates, each with ordered parts.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelResponse {
    pub candidates: Vec<Candidate>,
}

impl ModelResponse {
    /// Single-candidate response with the given parts.
    pub fn from_parts(parts: Vec<ResponsePart>) -> Self {
        Self {
            candidates: vec![Candidate { parts }],
        }
    }

    /// Single-candidate plain text response.
    pub fn text(text: &str) -> Self {
        Self::from_parts(vec![ResponsePart::Text(text.to_string())])
    }

    /// Single-candidate response requesting one capability call.
    pub fn function_call(name: &str, args: Map<String, Value>) -> Self {
        Self::from_parts(vec![ResponsePart::FunctionCall(FunctionCall {
            name: name.to_string(),
            args,
        })])
    }

    /// All parts across all candidates, in order.
    pub fn parts(&self) -> impl Iterator<Item = &ResponsePart> {
        self.candidates.iter().flat_map(|c| c.parts.iter())
    }

    pub fn is_empty(&self) -> bool {
        self.parts().next().is_none()
    }

    /// Concatenated text parts.
    pub fn text_content(&self) -> String {
        self.parts()
            .filter_map(|p| match p {
                ResponsePart::Text(t) => Some(t.as_str()),
                _ => None,
            })
            .collect()
    }

    /// History turn for the recognised parts of this response.  `None` when
    /// nothing recognisable came back.
    pub fn to_turn(&self) -> Option<Turn> {
        let parts: Vec<Part> = self
            .parts()
            .filter_map(|p| match p {
                ResponsePart::Text(t) => Some(Part::Text(t.clone())),
                ResponsePart::FunctionCall(fc) => Some(Part::FunctionCall(fc.clone())),
                ResponsePart::Unexpected(_) => None,
            })
            .collect();
        (!parts.is_empty()).then(|| Turn::new(Role::Model, parts))
    }
}

// ---------------------------------------------------------------------------
// ModelProvider trait
// ---------------------------------------------------------------------------

/// Trait implemented by every LLM backend.
#[async_trait]
pub trait ModelProvider: Send + Sync {
    /// Generate a response for `history` under `system_instruction`,
    /// advertising `functions` as callable capabilities.
    async fn generate(
        &self,
        history: &[Turn],
        system_instruction: &str,
        functions: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelResponse>;

    /// Generate a JSON document conforming to `schema`, returned as raw
    /// text.  No capabilities are advertised.
    ///
    /// The default implementation asks for a plain response and returns
    /// its text.
    async fn generate_json(
        &self,
        history: &[Turn],
        system_instruction: &str,
        _schema: &Value,
    ) -> anyhow::Result<String> {
        let response = self.generate(history, system_instruction, &[]).await?;
        Ok(response.text_content())
    }
}

// ---------------------------------------------------------------------------
// RetryProvider
// ---------------------------------------------------------------------------

/// Wraps a provider with bounded retries and exponential backoff
/// (`base_delay × 2^attempt`).  Permanent HTTP failures (400, 401, 403,
/// 404, 422) are returned immediately.
pub struct RetryProvider {
    inner: Arc<dyn ModelProvider>,
    max_attempts: usize,
    base_delay: Duration,
}

impl RetryProvider {
    /// `max_attempts` is clamped to ≥ 1.
    pub fn new(inner: Arc<dyn ModelProvider>, max_attempts: usize) -> Self {
        Self {
            inner,
            max_attempts: max_attempts.max(1),
            base_delay: Duration::from_millis(100),
        }
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    async fn with_retry<T, F, Fut>(&self, op: &str, mut call: F) -> anyhow::Result<T>
    where
        F: FnMut() -> Fut + Send,
        Fut: std::future::Future<Output = anyhow::Result<T>> + Send,
        T: Send,
    {
        let mut last_err = anyhow::anyhow!("no attempts made");
        for attempt in 0..self.max_attempts {
            match call().await {
                Ok(v) => return Ok(v),
                Err(e) => {
                    let permanent = is_permanent_error(&e);
                    warn!(
                        op,
                        attempt = attempt + 1,
                        max_attempts = self.max_attempts,
                        permanent,
                        error = %e,
                        "model call failed"
                    );
                    last_err = e;
                    if permanent {
                        break;
                    }
                    if attempt + 1 < self.max_attempts {
                        let delay = crate::utils::backoff_delay(
                            self.base_delay,
                            attempt as u32,
                            Duration::from_secs(10),
                        );
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
        Err(last_err)
    }
}

#[async_trait]
impl ModelProvider for RetryProvider {
    async fn generate(
        &self,
        history: &[Turn],
        system_instruction: &str,
        functions: &[FunctionDeclaration],
    ) -> anyhow::Result<ModelResponse> {
        self.with_retry("generate", || {
            self.inner.generate(history, system_instruction, functions)
        })
        .await
    }

    async fn generate_json(
        &self,
        history: &[Turn],
        system_instruction: &str,
        schema: &Value,
    ) -> anyhow::Result<String> {
        self.with_retry("generate_json", || {
            self.inner.generate_json(history, system_instruction, schema)
        })
        .await
    }
}

/// Check if an error represents a permanent HTTP failure that should not
/// be retried.
///
/// Parses status codes from error messages like "Gemini API returned 403 …".
pub fn is_permanent_error(err: &anyhow::Error) -> bool {
    let msg = err.to_string();
    ["400", "401", "403", "404", "422"]
        .iter()
        .any(|code| msg.contains(&format!("returned {code}")))
}
