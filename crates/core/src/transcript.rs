//! The ordered record of a conversation.
//!
//! A [`Transcript`] is append-only except for the text of the single message
//! that is currently being revealed. It doubles as render state and as the
//! source of the history handed to the generation service, which only ever
//! sees real dialogue (see [`Transcript::dialogue`]).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;
use uuid::Uuid;

pub type MessageId = Uuid;

/// A participant as it appears in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Party {
    pub id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
}

impl Party {
    pub const SYSTEM_ID: &'static str = "system";
    pub const USER_ID: &'static str = "user";

    pub fn system() -> Self {
        Self {
            id: Self::SYSTEM_ID.to_string(),
            display_name: "System".to_string(),
            avatar: None,
        }
    }

    pub fn user() -> Self {
        Self {
            id: Self::USER_ID.to_string(),
            display_name: "User".to_string(),
            avatar: None,
        }
    }
}

/// One entry in a transcript.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    pub speaker: Party,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub is_error: bool,
    #[serde(default)]
    pub is_system: bool,
    /// Stand-in shown while a reply is pending; never exported or sent upstream.
    #[serde(default)]
    pub is_placeholder: bool,
}

impl Message {
    fn with_flags(speaker: Party, text: String, is_system: bool, is_placeholder: bool) -> Self {
        Self {
            id: Uuid::new_v4(),
            speaker,
            text,
            timestamp: Utc::now(),
            is_error: false,
            is_system,
            is_placeholder,
        }
    }

    /// A line of real dialogue.
    pub fn dialogue(speaker: Party, text: impl Into<String>) -> Self {
        Self::with_flags(speaker, text.into(), false, false)
    }

    /// A transient "is thinking" marker attributed to the upcoming speaker.
    pub fn placeholder(speaker: Party, text: impl Into<String>) -> Self {
        Self::with_flags(speaker, text.into(), true, true)
    }

    /// A system notice such as the pause banner.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::with_flags(Party::system(), text.into(), true, false)
    }

    pub fn with_error(mut self, is_error: bool) -> Self {
        self.is_error = is_error;
        self
    }

    /// True for messages that belong in the history sent upstream.
    pub fn is_dialogue(&self) -> bool {
        !self.is_system && !self.is_error && !self.is_placeholder
    }
}

/// A dialogue line as handed to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DialogueLine {
    pub speaker_id: String,
    pub speaker_name: String,
    pub text: String,
}

impl From<&Message> for DialogueLine {
    fn from(message: &Message) -> Self {
        Self {
            speaker_id: message.speaker.id.clone(),
            speaker_name: message.speaker.display_name.clone(),
            text: message.text.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcript {
    messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    in_flight: Option<MessageId>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// The message currently growing, if any.
    pub fn in_flight(&self) -> Option<MessageId> {
        self.in_flight
    }

    /// Appends a settled message.
    pub fn push(&mut self, message: Message) -> MessageId {
        let id = message.id;
        self.messages.push(message);
        id
    }

    /// Appends a message whose text will grow. Any message still in flight is
    /// settled first, so there is never more than one.
    pub fn begin(&mut self, message: Message) -> MessageId {
        if let Some(previous) = self.in_flight.take() {
            warn!(%previous, "Settling a message that was still in flight");
        }
        let id = self.push(message);
        self.in_flight = Some(id);
        id
    }

    /// Extends the in-flight message to `text`. Text never shrinks; an update
    /// that is not an extension of the current text is ignored.
    pub fn reveal(&mut self, id: MessageId, text: &str) -> bool {
        if self.in_flight != Some(id) {
            return false;
        }
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if text.starts_with(message.text.as_str()) => {
                if text.len() > message.text.len() {
                    message.text.push_str(&text[message.text.len()..]);
                }
                true
            }
            _ => false,
        }
    }

    /// Freezes the in-flight message at its current text.
    pub fn settle(&mut self, id: MessageId) {
        if self.in_flight == Some(id) {
            self.in_flight = None;
        }
    }

    /// Replaces the text of a message and freezes it. Used when a reply is
    /// swapped for its final or error form.
    pub fn finalize(&mut self, id: MessageId, text: impl Into<String>, is_error: bool) -> bool {
        self.settle(id);
        match self.messages.iter_mut().find(|m| m.id == id) {
            Some(message) => {
                message.text = text.into();
                message.is_error = is_error;
                true
            }
            None => false,
        }
    }

    pub fn remove(&mut self, id: MessageId) -> Option<Message> {
        let index = self.messages.iter().position(|m| m.id == id)?;
        self.settle(id);
        Some(self.messages.remove(index))
    }

    /// Removes every message matching `predicate`, returning their ids.
    pub fn remove_where(&mut self, predicate: impl Fn(&Message) -> bool) -> Vec<MessageId> {
        let removed: Vec<MessageId> = self
            .messages
            .iter()
            .filter(|m| predicate(m))
            .map(|m| m.id)
            .collect();
        for id in &removed {
            self.remove(*id);
        }
        removed
    }

    /// Real dialogue only: no notices, placeholders or errors.
    pub fn dialogue(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter().filter(|m| m.is_dialogue())
    }

    /// Everything a reader may consume: placeholders and the in-flight
    /// message are excluded.
    pub fn settled(&self) -> impl Iterator<Item = &Message> {
        self.messages
            .iter()
            .filter(move |m| !m.is_placeholder && Some(m.id) != self.in_flight)
    }
}
