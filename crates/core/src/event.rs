//! Session events and the transcript writer that emits them.
//!
//! Renderers never read the scheduler's state directly; they subscribe to a
//! bounded channel of [`SessionEvent`]s and rebuild their view from it.

use crate::{
    error::FailureKind,
    scheduler::SchedulerState,
    transcript::{Message, MessageId, Transcript},
    typewriter::RevealSink,
};
use async_trait::async_trait;
use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tokio::sync::mpsc;
use tracing::warn;

/// A change to a running interaction, in the order it happened.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    MessageAppended { message: Message },
    /// Text newly shown on a growing message, to be appended to what the
    /// renderer already has.
    MessageRevealed { id: MessageId, appended: String },
    /// The message is frozen; `text` is its final content in full.
    MessageSettled { id: MessageId, text: String },
    MessageRemoved { id: MessageId },
    TurnCompleted { turn_count: u32 },
    StateChanged { state: SchedulerState },
    Failed { kind: FailureKind, message: String },
}

/// Sending half of the event channel. A publisher without a channel drops
/// every event, which is what headless callers and most tests want.
#[derive(Debug, Clone, Default)]
pub struct EventPublisher {
    tx: Option<mpsc::Sender<SessionEvent>>,
    receiver_gone: Arc<AtomicBool>,
}

impl EventPublisher {
    pub fn new(tx: mpsc::Sender<SessionEvent>) -> Self {
        Self {
            tx: Some(tx),
            receiver_gone: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Creates a publisher together with its receiving half.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    pub async fn publish(&self, event: SessionEvent) {
        let Some(tx) = &self.tx else { return };
        if tx.send(event).await.is_err() && !self.receiver_gone.swap(true, Ordering::Relaxed) {
            warn!("Failed to publish session event: receiver dropped.");
        }
    }
}

/// Mutates a transcript and publishes the matching event for each change.
pub struct TranscriptWriter<'a> {
    transcript: &'a mut Transcript,
    events: &'a EventPublisher,
}

impl<'a> TranscriptWriter<'a> {
    pub fn new(transcript: &'a mut Transcript, events: &'a EventPublisher) -> Self {
        Self { transcript, events }
    }

    pub async fn append(&mut self, message: Message) -> MessageId {
        let id = self.transcript.push(message.clone());
        self.events
            .publish(SessionEvent::MessageAppended { message })
            .await;
        id
    }

    /// Appends a message that the typewriter will grow.
    pub async fn begin(&mut self, message: Message) -> MessageId {
        if let Some(previous) = self.transcript.in_flight() {
            self.settle(previous).await;
        }
        let id = self.transcript.begin(message.clone());
        self.events
            .publish(SessionEvent::MessageAppended { message })
            .await;
        id
    }

    pub async fn settle(&mut self, id: MessageId) {
        self.transcript.settle(id);
        if let Some(message) = self.transcript.get(id) {
            let text = message.text.clone();
            self.events
                .publish(SessionEvent::MessageSettled { id, text })
                .await;
        }
    }

    /// Replaces a message's text and freezes it.
    pub async fn finalize(&mut self, id: MessageId, text: String, is_error: bool) {
        if self.transcript.finalize(id, text.clone(), is_error) {
            self.events
                .publish(SessionEvent::MessageSettled { id, text })
                .await;
        }
    }

    pub async fn remove(&mut self, id: MessageId) {
        if self.transcript.remove(id).is_some() {
            self.events.publish(SessionEvent::MessageRemoved { id }).await;
        }
    }

    pub async fn remove_where(&mut self, predicate: impl Fn(&Message) -> bool) {
        for id in self.transcript.remove_where(predicate) {
            self.events.publish(SessionEvent::MessageRemoved { id }).await;
        }
    }
}

#[async_trait]
impl RevealSink for TranscriptWriter<'_> {
    async fn reveal(&mut self, id: MessageId, displayed: &str) {
        let shown = self.transcript.get(id).map_or(0, |m| m.text.len());
        if self.transcript.reveal(id, displayed) && displayed.len() > shown {
            self.events
                .publish(SessionEvent::MessageRevealed {
                    id,
                    appended: displayed[shown..].to_string(),
                })
                .await;
        }
    }
}
