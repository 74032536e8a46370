//! Inbound trigger classification.
//!
//! Decides what happens to an incoming message: a full conversational turn
//! (the bot was mentioned or replied to), a grammar check for configured
//! senders, the alternating-case "mock" echo, or nothing.

use crate::comm::{EntityKind, InboundMessage};
use crate::config::BotConfig;

/// The bot's own identity on the messaging platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BotIdentity {
    pub id: i64,
    /// Handle without the leading `@`.
    pub username: String,
}

/// What to do with an inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Run the tool-call orchestrator.
    Converse,
    /// Run the grammar check.
    Correct,
    /// Reply with the given alternating-case text.
    Mock(String),
    Ignore,
}

/// Slice `text` by UTF-16 code unit range.
fn utf16_slice(text: &str, offset: usize, length: usize) -> Option<String> {
    let units: Vec<u16> = text.encode_utf16().collect();
    let end = offset.checked_add(length)?;
    if end > units.len() {
        return None;
    }
    String::from_utf16(&units[offset..end]).ok()
}

/// True when the message replies to the bot or mentions its handle.
pub fn is_triggered(bot: &BotIdentity, msg: &InboundMessage) -> bool {
    if msg.reply_to_sender_id == Some(bot.id) {
        return true;
    }
    let handle = format!("@{}", bot.username);
    msg.entities.iter().any(|e| match &e.kind {
        EntityKind::Mention => utf16_slice(&msg.text, e.offset, e.length)
            .is_some_and(|m| m.eq_ignore_ascii_case(&handle)),
        EntityKind::TextMention { user_id } => *user_id == bot.id,
        EntityKind::Other(_) => false,
    })
}

/// Alternate casing per character: index 0 upper, index 1 lower, …
pub fn mock_text(text: &str) -> String {
    text.chars()
        .enumerate()
        .flat_map(|(i, c)| -> Box<dyn Iterator<Item = char>> {
            if i % 2 == 0 {
                Box::new(c.to_uppercase())
            } else {
                Box::new(c.to_lowercase())
            }
        })
        .collect()
}

/// Whether the mock echo fires for `text` given probability `chance` and a
/// uniform `roll` in `[0, 1)`.
pub fn should_mock(chance: f64, roll: f64, text: &str) -> bool {
    text.chars().count() > 2 && roll < chance
}

/// Route an inbound message.  `roll` is a uniform sample in `[0, 1)` used
/// for the mock probability.
pub fn classify(bot: &BotIdentity, msg: &InboundMessage, settings: &BotConfig, roll: f64) -> Route {
    if msg.text.trim().is_empty() {
        return Route::Ignore;
    }
    if is_triggered(bot, msg) {
        return Route::Converse;
    }
    if msg
        .sender_id()
        .is_some_and(|id| settings.unintelligible_ids.contains(&id))
    {
        return Route::Correct;
    }
    if should_mock(settings.mock_chance, roll, &msg.text) {
        return Route::Mock(mock_text(&msg.text));
    }
    Route::Ignore
}
