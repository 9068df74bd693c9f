//! Single-persona chat: the user talks, the persona streams a reply.

use crate::{
    error::{ChatError, FailureKind, GenerationError},
    event::{EventPublisher, SessionEvent, TranscriptWriter},
    llm_client::{ChatRequest, ChatRole, ChatTurn, ReplyGenerator},
    persona::Persona,
    transcript::{Message, Party, Transcript},
    typewriter::{RevealBuffer, RevealRate, StreamTypewriter},
};
use futures::StreamExt;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument, warn};

/// Most messages kept in a persisted chat history.
pub const MAX_CHAT_HISTORY_MESSAGES: usize = 50;

const EMPTY_REPLY_FALLBACK: &str = "I'm not quite sure how to respond to that.";

/// The outcome of one [`PersonaChat::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatReply {
    /// The persona's message as frozen in the transcript. `None` when the
    /// exchange was cancelled before anything arrived.
    pub message: Option<Message>,
    pub failure: Option<FailureKind>,
    pub cancelled: bool,
}

pub struct PersonaChat {
    persona: Persona,
    generator: Arc<dyn ReplyGenerator>,
    typewriter: StreamTypewriter,
    events: EventPublisher,
    transcript: Transcript,
}

impl PersonaChat {
    pub fn new(
        persona: Persona,
        generator: Arc<dyn ReplyGenerator>,
        rate: RevealRate,
        events: EventPublisher,
    ) -> Self {
        Self {
            persona,
            generator,
            typewriter: StreamTypewriter::new(rate),
            events,
            transcript: Transcript::new(),
        }
    }

    /// Seeds the chat with a previously persisted history.
    pub fn with_history(mut self, history: impl IntoIterator<Item = Message>) -> Self {
        for message in history {
            if !message.is_placeholder {
                self.transcript.push(message);
            }
        }
        self
    }

    pub fn persona(&self) -> &Persona {
        &self.persona
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    /// What should be persisted: the last settled, non-system messages.
    pub fn history(&self) -> Vec<Message> {
        let messages: Vec<&Message> = self.transcript.settled().filter(|m| !m.is_system).collect();
        let skip = messages.len().saturating_sub(MAX_CHAT_HISTORY_MESSAGES);
        messages.into_iter().skip(skip).cloned().collect()
    }

    /// Prior exchange as sent upstream; errors never go back to the model.
    fn upstream_history(&self) -> Vec<ChatTurn> {
        let turns: Vec<ChatTurn> = self
            .transcript
            .dialogue()
            .map(|m| ChatTurn {
                role: if m.speaker.id == Party::USER_ID {
                    ChatRole::User
                } else {
                    ChatRole::Persona
                },
                text: m.text.clone(),
            })
            .collect();
        let skip = turns.len().saturating_sub(MAX_CHAT_HISTORY_MESSAGES);
        turns.into_iter().skip(skip).collect()
    }

    /// Sends `text` and reveals the streamed reply while it arrives.
    ///
    /// Generation failures are folded into the reply message, so the only
    /// error is an empty input.
    #[instrument(skip(self, text, cancel), fields(persona = %self.persona.name))]
    pub async fn send(
        &mut self,
        text: &str,
        cancel: &CancellationToken,
    ) -> Result<ChatReply, ChatError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyMessage);
        }

        let request = ChatRequest {
            persona: self.persona.clone(),
            history: self.upstream_history(),
            message: text.to_string(),
        };
        let party = self.persona.party();
        let mut writer = TranscriptWriter::new(&mut self.transcript, &self.events);
        writer.append(Message::dialogue(Party::user(), text)).await;
        let id = writer.begin(Message::dialogue(party, "")).await;

        // A stream error stops the animation early; the message is replaced below.
        let typing = cancel.child_token();
        let buffer = RevealBuffer::new();
        let (streamed, _) = tokio::join!(
            pump(self.generator.as_ref(), request, &buffer, &typing),
            self.typewriter.animate(id, &buffer, &typing, &mut writer),
        );

        let (failure, cancelled) = match streamed {
            Err(e) => {
                let copy = e.user_copy("send more messages");
                writer.finalize(id, copy.clone(), true).await;
                self.events
                    .publish(SessionEvent::Failed {
                        kind: e.kind(),
                        message: copy,
                    })
                    .await;
                (Some(e.kind()), false)
            }
            Ok(()) if cancel.is_cancelled() => {
                let partial = buffer.text().trim().to_string();
                if partial.is_empty() {
                    writer.remove(id).await;
                } else {
                    writer.finalize(id, partial, false).await;
                }
                (None, true)
            }
            Ok(()) => {
                let full = buffer.text().trim().to_string();
                let full = if full.is_empty() {
                    EMPTY_REPLY_FALLBACK.to_string()
                } else {
                    full
                };
                writer.finalize(id, full, false).await;
                (None, false)
            }
        };

        info!(cancelled, failed = failure.is_some(), "Chat reply finished");
        Ok(ChatReply {
            message: self.transcript.get(id).cloned(),
            failure,
            cancelled,
        })
    }
}

/// Feeds the reply stream into `buffer` and closes it, however the stream ends.
async fn pump(
    generator: &dyn ReplyGenerator,
    request: ChatRequest,
    buffer: &RevealBuffer,
    typing: &CancellationToken,
) -> Result<(), GenerationError> {
    let result = stream_into(generator, request, buffer, typing).await;
    buffer.close();
    if let Err(e) = &result {
        warn!(error = %e, "Chat stream failed");
        typing.cancel();
    }
    result
}

async fn stream_into(
    generator: &dyn ReplyGenerator,
    request: ChatRequest,
    buffer: &RevealBuffer,
    cancel: &CancellationToken,
) -> Result<(), GenerationError> {
    let mut stream = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(()),
        stream = generator.stream_reply(request) => stream?,
    };
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            next = stream.next() => match next {
                Some(Ok(fragment)) => buffer.push(&fragment),
                Some(Err(e)) => return Err(e),
                None => return Ok(()),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm_client::{MockReplyGenerator, ReplyStream};
    use futures::stream;
    use std::time::Duration;

    fn ada() -> Persona {
        Persona::new("ada", "Ada")
    }

    fn fragments(parts: &[&str]) -> ReplyStream {
        let items: Vec<Result<String, GenerationError>> =
            parts.iter().map(|p| Ok(p.to_string())).collect();
        Box::pin(stream::iter(items))
    }

    fn chat(mock: MockReplyGenerator) -> PersonaChat {
        PersonaChat::new(ada(), Arc::new(mock), RevealRate::CHAT, EventPublisher::disabled())
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_reply_is_revealed_and_frozen() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply()
            .withf(|request| request.message == "Hello" && request.history.is_empty())
            .times(1)
            .returning(|_| Ok(fragments(&["Good ", "day ", "to you. "])));
        let mut chat = chat(mock);

        let reply = chat.send("  Hello ", &CancellationToken::new()).await.unwrap();
        assert!(!reply.cancelled);
        assert_eq!(reply.failure, None);
        assert_eq!(reply.message.unwrap().text, "Good day to you.");

        let history = chat.history();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].speaker.id, Party::USER_ID);
        assert_eq!(history[0].text, "Hello");
        assert_eq!(chat.transcript().in_flight(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_stream_uses_fallback() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply()
            .returning(|_| Ok(fragments(&["   "])));
        let mut chat = chat(mock);

        let reply = chat.send("Hi", &CancellationToken::new()).await.unwrap();
        assert_eq!(reply.message.unwrap().text, EMPTY_REPLY_FALLBACK);
    }

    #[tokio::test]
    async fn test_empty_input_rejected_without_request() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply().never();
        let mut chat = chat(mock);

        assert_eq!(
            chat.send("   ", &CancellationToken::new()).await,
            Err(ChatError::EmptyMessage)
        );
        assert!(chat.transcript().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_quota_error_replaces_reply() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply().returning(|_| {
            Err(GenerationError::QuotaExceeded {
                message: "429".into(),
            })
        });
        let mut chat = chat(mock);

        let reply = chat.send("Hi", &CancellationToken::new()).await.unwrap();
        assert_eq!(reply.failure, Some(FailureKind::QuotaExceeded));
        let message = reply.message.unwrap();
        assert!(message.is_error);
        assert_eq!(
            message.text,
            "API Quota Exceeded. Please check your plan and billing details. Cannot send more messages at this time. (429)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_mid_stream_error_replaces_partial_text() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply().returning(|_| {
            let items: Vec<Result<String, GenerationError>> = vec![
                Ok("Partial".into()),
                Err(GenerationError::Request {
                    message: "stream reset".into(),
                }),
            ];
            Ok(Box::pin(stream::iter(items)))
        });
        let mut chat = chat(mock);

        let reply = chat.send("Hi", &CancellationToken::new()).await.unwrap();
        let message = reply.message.unwrap();
        assert_eq!(message.text, "Sorry, an error occurred: stream reset");
        assert_eq!(reply.failure, Some(FailureKind::Generation));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_snaps_to_received_text() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply().returning(|_| {
            let head = stream::iter(vec![Ok::<_, GenerationError>(
                "A rather long opening sentence".to_string(),
            )]);
            // The rest never arrives.
            Ok(Box::pin(head.chain(stream::pending())))
        });
        let mut chat = chat(mock);
        let cancel = CancellationToken::new();

        let (reply, _) = tokio::join!(chat.send("Hi", &cancel), async {
            tokio::time::sleep(Duration::from_millis(60)).await;
            cancel.cancel();
        });

        let reply = reply.unwrap();
        assert!(reply.cancelled);
        assert_eq!(reply.message.unwrap().text, "A rather long opening sentence");
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_is_capped_and_sent_upstream() {
        let persisted: Vec<Message> = (0..60)
            .map(|i| {
                let speaker = if i % 2 == 0 { Party::user() } else { ada().party() };
                Message::dialogue(speaker, format!("line {i}"))
            })
            .collect();

        let mut mock = MockReplyGenerator::new();
        mock.expect_stream_reply()
            .withf(|request| {
                request.history.len() == MAX_CHAT_HISTORY_MESSAGES
                    && request.history[0].text == "line 10"
                    && request.history[0].role == ChatRole::User
                    && request.history[1].role == ChatRole::Persona
            })
            .returning(|_| Ok(fragments(&["Yes."])));
        let mut chat = chat(mock).with_history(persisted);

        chat.send("Again?", &CancellationToken::new()).await.unwrap();
        let history = chat.history();
        assert_eq!(history.len(), MAX_CHAT_HISTORY_MESSAGES);
        assert_eq!(history.last().unwrap().text, "Yes.");
    }
}
