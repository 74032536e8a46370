//! Grammar check for configured senders.
//!
//! Asks the model, without history or capabilities, whether a message is
//! well written.  When it is not, the corrected version is posted as a
//! reply.

use serde::Deserialize;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{error_text, Agent};
use crate::comm::InboundMessage;
use crate::session::{Part, Role, Turn};

/// Structured verdict returned by the model.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Verdict {
    #[serde(rename = "isCorrect")]
    pub is_correct: bool,
    #[serde(rename = "correctedVersion", default)]
    pub corrected_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CorrectionOutcome {
    /// The message was fine; nothing sent.
    AlreadyCorrect,
    /// A correction was posted.
    Corrected(String),
    /// The check failed; an error reply was posted.
    Failed,
    Cancelled,
}

/// Response schema sent with the request.
pub fn verdict_schema() -> Value {
    json!({
        "type": "OBJECT",
        "properties": {
            "isCorrect": { "type": "BOOLEAN" },
            "correctedVersion": { "type": "STRING" }
        },
        "required": ["isCorrect", "correctedVersion"]
    })
}

/// The single user turn sent for a check.
pub fn correction_request(prompt: &str, text: &str) -> Turn {
    Turn::new(
        Role::User,
        vec![
            Part::Text(prompt.to_string()),
            Part::Text(format!("Mensagem: \"{text}\"")),
        ],
    )
}

/// Reply text for a corrected message.
pub fn correction_reply(corrected: &str) -> String {
    format!("Tradução: \"{corrected}\"")
}

impl Agent {
    /// Run the grammar check for `msg`.
    pub async fn correct(&self, msg: &InboundMessage, cancel: &CancellationToken) -> CorrectionOutcome {
        let history = [correction_request(&self.settings.correction_prompt, &msg.text)];
        let schema = verdict_schema();
        let call = self.provider.generate_json(&history, "", &schema);

        let raw = match self.bounded(cancel, call).await {
            None => return CorrectionOutcome::Cancelled,
            Some(Ok(Ok(raw))) => raw,
            Some(Ok(Err(e))) => {
                warn!(chat_id = msg.chat_id, error = %e, "grammar check failed");
                self.reply(msg, &error_text(&e)).await;
                return CorrectionOutcome::Failed;
            }
            Some(Err(_)) => {
                warn!(chat_id = msg.chat_id, "grammar check timed out");
                self.reply(msg, &error_text("grammar check timed out")).await;
                return CorrectionOutcome::Failed;
            }
        };

        let verdict: Verdict = match serde_json::from_str(raw.trim()) {
            Ok(v) => v,
            Err(e) => {
                warn!(chat_id = msg.chat_id, error = %e, "undecodable grammar verdict");
                self.reply(msg, &error_text(format!("invalid verdict: {e}"))).await;
                return CorrectionOutcome::Failed;
            }
        };
        debug!(chat_id = msg.chat_id, is_correct = verdict.is_correct, "grammar verdict");

        let corrected = verdict.corrected_version.trim();
        if verdict.is_correct || corrected.is_empty() {
            return CorrectionOutcome::AlreadyCorrect;
        }
        self.reply(msg, &correction_reply(corrected)).await;
        CorrectionOutcome::Corrected(corrected.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verdict_parses_camel_case() {
        let v: Verdict =
            serde_json::from_str(r#"{"isCorrect": false, "correctedVersion": "Eu fui"}"#).unwrap();
        assert!(!v.is_correct);
        assert_eq!(v.corrected_version, "Eu fui");
    }

    #[test]
    fn request_wraps_message() {
        let turn = correction_request("check grammar", "eu vai");
        assert_eq!(turn.role(), Role::User);
        assert_eq!(turn.parts()[1], Part::Text("Mensagem: \"eu vai\"".into()));
    }

    #[test]
    fn reply_format() {
        assert_eq!(correction_reply("Eu fui"), "Tradução: \"Eu fui\"");
    }
}
