//! Defines the WebSocket message protocol between the browser client and the API server.

use personaverse_core::{
    DialogueConfig, FailureKind, Message, Persona, SessionEvent,
    scheduler::{normalize_limit, normalize_scenario},
};
use serde::{Deserialize, Serialize};

/// The settings of a new playground dialogue.
#[derive(Deserialize, Debug, Clone)]
pub struct StartRequest {
    pub party_a: Persona,
    pub party_b: Persona,
    /// Present only in topic mode.
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub scenario: Option<String>,
    /// Missing or zero means unbounded.
    #[serde(default)]
    pub max_turns: Option<u32>,
}

impl From<StartRequest> for DialogueConfig {
    fn from(request: StartRequest) -> Self {
        let mut config = DialogueConfig::new(request.party_a, request.party_b);
        if let Some(topic) = request.topic {
            config = config.with_topic(topic);
        }
        config.scenario = normalize_scenario(request.scenario);
        config.turn_limit = normalize_limit(request.max_turns);
        config
    }
}

/// Commands sent by the playground client.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaygroundCommand {
    /// Starts a fresh dialogue, discarding any previous one.
    Start(StartRequest),
    /// Resumes a paused dialogue with a new turn limit.
    Continue {
        #[serde(default)]
        max_turns: Option<u32>,
    },
    Stop,
    Reset,
    Export,
}

/// Messages sent to the playground client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlaygroundServerMessage {
    /// A change in the running dialogue.
    Event { event: SessionEvent },
    /// A `start` or `continue` was accepted and the loop is running.
    Started { turn_count: u32 },
    /// A command was refused; nothing changed.
    Rejected { message: String },
    Exported { filename: String, content: String },
    Error { message: String },
}

/// Messages sent from the chat client.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatClientMessage {
    /// Must be the first message.
    Init {
        persona: Persona,
        #[serde(default)]
        history: Vec<Message>,
    },
    UserMessage {
        text: String,
    },
    /// Cancels the reply being typed.
    Stop,
    /// Asks for the conversation as a text file.
    Export,
}

/// Messages sent to the chat client.
#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatServerMessage {
    Initialized {
        history: Vec<Message>,
    },
    Event {
        event: SessionEvent,
    },
    /// The reply finished; `history` is what the client should persist.
    ReplyComplete {
        message: Option<Message>,
        failure: Option<FailureKind>,
        cancelled: bool,
        history: Vec<Message>,
    },
    Exported {
        filename: String,
        content: String,
    },
    Rejected {
        message: String,
    },
    Error {
        message: String,
    },
}
