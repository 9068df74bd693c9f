//! Two-persona turn loop.
//!
//! A [`DialogueScheduler`] owns at most one [`InteractionSession`]. Each call
//! to [`DialogueScheduler::start`] builds a fresh session with its own
//! cancellation token; [`DialogueScheduler::run`] then alternates speakers,
//! one generation request per turn, until the turn limit pauses it, a stop
//! cancels it, or a generation failure ends it.

use crate::{
    error::{ConfigurationError, FailureKind, SchedulerError, is_error_sentinel},
    event::{EventPublisher, SessionEvent, TranscriptWriter},
    llm_client::{ReplyGenerator, ReplyRequest},
    persona::Persona,
    transcript::{DialogueLine, Message, Transcript},
    typewriter::{AnimationOutcome, RevealBuffer, RevealRate, StreamTypewriter},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

const PAUSED_NOTICE_PREFIX: &str = "Interaction paused after";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SchedulerState {
    Idle,
    Running,
    /// Turn limit reached; resumable.
    Paused,
    Stopped,
    Failed,
}

/// Whether the dialogue is free-form or held to a topic.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", content = "topic", rename_all = "snake_case")]
pub enum ConversationMode {
    #[default]
    Open,
    Topic(String),
}

/// What a dialogue is about and who takes part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DialogueConfig {
    pub party_a: Persona,
    pub party_b: Persona,
    pub mode: ConversationMode,
    pub scenario: Option<String>,
    /// `None` is unbounded.
    pub turn_limit: Option<u32>,
}

impl DialogueConfig {
    pub fn new(party_a: Persona, party_b: Persona) -> Self {
        Self {
            party_a,
            party_b,
            mode: ConversationMode::Open,
            scenario: None,
            turn_limit: None,
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.mode = ConversationMode::Topic(topic.into());
        self
    }

    pub fn with_scenario(mut self, scenario: impl Into<String>) -> Self {
        self.scenario = normalize_scenario(Some(scenario.into()));
        self
    }

    /// A limit of zero means no limit.
    pub fn with_turn_limit(mut self, limit: u32) -> Self {
        self.turn_limit = normalize_limit(Some(limit));
        self
    }

    pub fn topic(&self) -> Option<&str> {
        match &self.mode {
            ConversationMode::Open => None,
            ConversationMode::Topic(topic) => Some(topic.trim()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.party_a.id == self.party_b.id {
            return Err(ConfigurationError::IdenticalParties);
        }
        if let ConversationMode::Topic(topic) = &self.mode
            && topic.trim().is_empty()
        {
            return Err(ConfigurationError::EmptyTopic);
        }
        Ok(())
    }

    /// Speaker and listener for the turn at `turn_count`. Party A opens.
    fn speakers(&self, turn_count: u32) -> (&Persona, &Persona) {
        if turn_count % 2 == 0 {
            (&self.party_a, &self.party_b)
        } else {
            (&self.party_b, &self.party_a)
        }
    }
}

pub fn normalize_scenario(scenario: Option<String>) -> Option<String> {
    scenario
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

pub fn normalize_limit(limit: Option<u32>) -> Option<u32> {
    limit.filter(|&n| n > 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSettings {
    pub reveal: RevealRate,
    /// How many trailing dialogue lines each generation request sees.
    pub history_window: usize,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            reveal: RevealRate::PLAYGROUND,
            history_window: 4,
        }
    }
}

/// Stops a running session from another task.
#[derive(Debug, Clone)]
pub struct StopHandle(CancellationToken);

impl StopHandle {
    pub fn stop(&self) {
        self.0.cancel();
    }
}

/// Why a session ended in [`SchedulerState::Failed`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Failure {
    pub kind: FailureKind,
    /// Banner copy shown to the user.
    pub message: String,
}

/// One Start → (pause/continue)* → Stop-or-Failed cycle.
#[derive(Debug)]
pub struct InteractionSession {
    config: DialogueConfig,
    turn_count: u32,
    transcript: Transcript,
    /// Completed turns as sent upstream; never holds notices or placeholders.
    history: Vec<DialogueLine>,
    cancel: CancellationToken,
}

impl InteractionSession {
    fn new(config: DialogueConfig) -> Self {
        Self {
            config,
            turn_count: 0,
            transcript: Transcript::new(),
            history: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn config(&self) -> &DialogueConfig {
        &self.config
    }

    pub fn turn_count(&self) -> u32 {
        self.turn_count
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }

    pub fn history(&self) -> &[DialogueLine] {
        &self.history
    }

    fn stop_handle(&self) -> StopHandle {
        StopHandle(self.cancel.clone())
    }

    fn limit_reached(&self) -> bool {
        self.config
            .turn_limit
            .is_some_and(|limit| self.turn_count >= limit)
    }

    fn next_request(&self, window: usize) -> ReplyRequest {
        let (speaker, listener) = self.config.speakers(self.turn_count);
        let skip = self.history.len().saturating_sub(window);
        ReplyRequest {
            speaker: speaker.clone(),
            listener: listener.clone(),
            recent_history: self.history[skip..].to_vec(),
            topic: self.config.topic().map(str::to_string),
            scenario: self.config.scenario.clone(),
        }
    }
}

/// How a run of the turn loop ended.
enum RunOutcome {
    Paused,
    Stopped,
    Failed(Failure),
}

/// Drives an alternating dialogue between two personas.
pub struct DialogueScheduler {
    generator: Arc<dyn ReplyGenerator>,
    typewriter: StreamTypewriter,
    settings: SchedulerSettings,
    events: EventPublisher,
    state: SchedulerState,
    session: Option<InteractionSession>,
    failure: Option<Failure>,
}

impl DialogueScheduler {
    pub fn new(
        generator: Arc<dyn ReplyGenerator>,
        settings: SchedulerSettings,
        events: EventPublisher,
    ) -> Self {
        Self {
            generator,
            typewriter: StreamTypewriter::new(settings.reveal),
            settings,
            events,
            state: SchedulerState::Idle,
            session: None,
            failure: None,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn turn_count(&self) -> u32 {
        self.session.as_ref().map_or(0, |s| s.turn_count)
    }

    pub fn session(&self) -> Option<&InteractionSession> {
        self.session.as_ref()
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.session.as_ref().map(|s| &s.transcript)
    }

    pub fn failure(&self) -> Option<&Failure> {
        self.failure.as_ref()
    }

    /// Replaces any finished session with a fresh one. Rejections leave the
    /// scheduler untouched.
    pub async fn start(&mut self, config: DialogueConfig) -> Result<StopHandle, SchedulerError> {
        if self.state == SchedulerState::Running {
            return Err(SchedulerError::AlreadyRunning);
        }
        config.validate()?;

        if let Some(previous) = self.session.take() {
            previous.cancel.cancel();
        }
        info!(
            party_a = %config.party_a.name,
            party_b = %config.party_b.name,
            turn_limit = ?config.turn_limit,
            "Starting interaction"
        );
        let session = InteractionSession::new(config);
        let handle = session.stop_handle();
        self.session = Some(session);
        self.failure = None;
        self.set_state(SchedulerState::Running).await;
        Ok(handle)
    }

    /// Continues a paused session with a new turn limit. The turn counter
    /// carries over.
    pub async fn resume(&mut self, turn_limit: Option<u32>) -> Result<StopHandle, SchedulerError> {
        if self.state != SchedulerState::Paused {
            return Err(SchedulerError::NotPaused);
        }
        let session = self.session.as_mut().ok_or(SchedulerError::NoSession)?;
        let turn_limit = normalize_limit(turn_limit);
        if let Some(limit) = turn_limit
            && limit <= session.turn_count
        {
            return Err(SchedulerError::LimitNotAhead {
                turn_count: session.turn_count,
            });
        }
        session.config.turn_limit = turn_limit;
        session.cancel = CancellationToken::new();
        let handle = session.stop_handle();

        TranscriptWriter::new(&mut session.transcript, &self.events)
            .remove_where(|m| {
                m.is_system && !m.is_error && m.text.starts_with(PAUSED_NOTICE_PREFIX)
            })
            .await;

        info!(
            turn_count = session.turn_count,
            turn_limit = ?session.config.turn_limit,
            "Resuming interaction"
        );
        self.set_state(SchedulerState::Running).await;
        Ok(handle)
    }

    /// Requests a stop. A running loop notices at its next checkpoint; a
    /// paused session stops right away. Failed sessions stay failed.
    pub async fn stop(&mut self) {
        if let Some(session) = &self.session {
            session.cancel.cancel();
        }
        self.typewriter.stop();
        if matches!(self.state, SchedulerState::Running | SchedulerState::Paused) {
            self.set_state(SchedulerState::Stopped).await;
        }
    }

    /// Drops the session and everything in it.
    pub async fn reset(&mut self) {
        if let Some(session) = self.session.take() {
            session.cancel.cancel();
        }
        self.typewriter.stop();
        self.failure = None;
        self.set_state(SchedulerState::Idle).await;
    }

    async fn set_state(&mut self, state: SchedulerState) {
        if self.state != state {
            debug!(from = ?self.state, to = ?state, "Scheduler state change");
        }
        self.state = state;
        self.events.publish(SessionEvent::StateChanged { state }).await;
    }

    /// Runs turns until the session pauses, stops or fails.
    #[instrument(skip(self), fields(turn_count = self.turn_count()))]
    pub async fn run(&mut self) -> SchedulerState {
        if self.state != SchedulerState::Running {
            return self.state;
        }
        let Some(session) = self.session.as_mut() else {
            warn!("Run requested without a session");
            self.set_state(SchedulerState::Idle).await;
            return self.state;
        };

        let turns = TurnLoop {
            generator: self.generator.as_ref(),
            typewriter: &self.typewriter,
            events: &self.events,
            history_window: self.settings.history_window,
        };
        let outcome = turns.run(session).await;

        let state = match outcome {
            RunOutcome::Paused => SchedulerState::Paused,
            RunOutcome::Stopped => SchedulerState::Stopped,
            RunOutcome::Failed(failure) => {
                warn!(kind = ?failure.kind, "Interaction failed: {}", failure.message);
                self.events
                    .publish(SessionEvent::Failed {
                        kind: failure.kind,
                        message: failure.message.clone(),
                    })
                    .await;
                self.failure = Some(failure);
                SchedulerState::Failed
            }
        };
        info!(?state, turn_count = self.turn_count(), "Interaction loop exited");
        self.set_state(state).await;
        state
    }
}

/// Borrowed collaborators for one run of the loop.
struct TurnLoop<'a> {
    generator: &'a dyn ReplyGenerator,
    typewriter: &'a StreamTypewriter,
    events: &'a EventPublisher,
    history_window: usize,
}

impl TurnLoop<'_> {
    async fn run(&self, session: &mut InteractionSession) -> RunOutcome {
        let cancel = session.cancel.clone();
        loop {
            if cancel.is_cancelled() {
                return RunOutcome::Stopped;
            }
            if session.limit_reached() {
                let notice = format!(
                    "{PAUSED_NOTICE_PREFIX} {} turn(s). Adjust Max Turns or Continue below.",
                    session.turn_count
                );
                TranscriptWriter::new(&mut session.transcript, self.events)
                    .append(Message::notice(notice))
                    .await;
                return RunOutcome::Paused;
            }

            let request = session.next_request(self.history_window);
            let speaker = request.speaker.clone();
            let mut writer = TranscriptWriter::new(&mut session.transcript, self.events);

            let placeholder = writer
                .append(Message::placeholder(
                    speaker.party(),
                    format!("{} is thinking...", speaker.name),
                ))
                .await;

            debug!(speaker = %speaker.name, turn = session.turn_count, "Requesting turn");
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => None,
                result = self.generator.generate_reply(request) => Some(result),
            };
            writer.remove(placeholder).await;
            let Some(result) = result else {
                return RunOutcome::Stopped;
            };
            if cancel.is_cancelled() {
                return RunOutcome::Stopped;
            }

            let (text, failed) = match result {
                Ok(reply) => {
                    let failed = is_error_sentinel(&reply.text)
                        .then(|| FailureKind::of_sentinel(&reply.text));
                    (reply.text, failed)
                }
                Err(e) => (e.sentinel_text(&speaker.name), Some(e.kind())),
            };

            let id = writer
                .begin(Message::dialogue(speaker.party(), "").with_error(failed.is_some()))
                .await;
            let buffer = RevealBuffer::complete(text.clone());
            let outcome = self
                .typewriter
                .animate(id, &buffer, &cancel, &mut writer)
                .await;
            writer.settle(id).await;
            if outcome == AnimationOutcome::Cancelled {
                return RunOutcome::Stopped;
            }

            session.history.push(DialogueLine {
                speaker_id: speaker.id.clone(),
                speaker_name: speaker.name.clone(),
                text: text.clone(),
            });

            if let Some(kind) = failed {
                return RunOutcome::Failed(Failure {
                    kind,
                    message: format!(
                        "An error occurred with {}'s response. Interaction stopped. Details: {text}",
                        speaker.name
                    ),
                });
            }

            session.turn_count += 1;
            self.events
                .publish(SessionEvent::TurnCompleted {
                    turn_count: session.turn_count,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::GenerationError,
        llm_client::{ChatRequest, MockReplyGenerator, ProbeRequest, Reply, ReplyStream},
    };
    use async_trait::async_trait;
    use std::{
        collections::VecDeque,
        sync::Mutex,
        time::Duration,
    };

    /// Replays queued results, then falls back to a canned line per speaker.
    #[derive(Default)]
    struct ScriptedGenerator {
        replies: Mutex<VecDeque<Result<Reply, GenerationError>>>,
        requests: Mutex<Vec<ReplyRequest>>,
        /// Stops the session when the given call (1-based) arrives.
        stop_on_call: Mutex<Option<(usize, StopHandle)>>,
        /// Never answers from this call (1-based) onwards.
        hang_from_call: Option<usize>,
    }

    impl ScriptedGenerator {
        fn with_replies(replies: Vec<Result<Reply, GenerationError>>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                ..Default::default()
            }
        }

        fn speakers(&self) -> Vec<String> {
            self.requests
                .lock()
                .unwrap()
                .iter()
                .map(|r| r.speaker.name.clone())
                .collect()
        }
    }

    #[async_trait]
    impl ReplyGenerator for ScriptedGenerator {
        async fn generate_reply(&self, request: ReplyRequest) -> Result<Reply, GenerationError> {
            let call = {
                let mut requests = self.requests.lock().unwrap();
                requests.push(request.clone());
                requests.len()
            };
            if let Some((n, handle)) = self.stop_on_call.lock().unwrap().as_ref()
                && *n == call
            {
                handle.stop();
            }
            if self.hang_from_call.is_some_and(|n| call >= n) {
                futures::future::pending::<()>().await;
            }
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok(Reply::new(format!("{} speaks.", request.speaker.name))))
        }

        async fn probe_reply(&self, _request: ProbeRequest) -> Result<Reply, GenerationError> {
            unimplemented!()
        }

        async fn stream_reply(&self, _request: ChatRequest) -> Result<ReplyStream, GenerationError> {
            unimplemented!()
        }
    }

    fn ada() -> Persona {
        Persona::new("ada", "Ada")
    }

    fn bob() -> Persona {
        Persona::new("bob", "Bob")
    }

    fn scheduler(generator: Arc<dyn ReplyGenerator>) -> DialogueScheduler {
        DialogueScheduler::new(generator, SchedulerSettings::default(), EventPublisher::disabled())
    }

    fn dialogue_speakers(scheduler: &DialogueScheduler) -> Vec<String> {
        scheduler
            .transcript()
            .unwrap()
            .dialogue()
            .map(|m| m.speaker.display_name.clone())
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_turn_limit_pauses_after_ada_and_bob() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(2))
            .await
            .unwrap();

        assert_eq!(scheduler.run().await, SchedulerState::Paused);
        assert_eq!(scheduler.turn_count(), 2);
        assert_eq!(dialogue_speakers(&scheduler), vec!["Ada", "Bob"]);

        let transcript = scheduler.transcript().unwrap();
        let texts: Vec<&str> = transcript.dialogue().map(|m| m.text.as_str()).collect();
        assert_eq!(texts, vec!["Ada speaks.", "Bob speaks."]);
        assert_eq!(
            transcript.last().unwrap().text,
            "Interaction paused after 2 turn(s). Adjust Max Turns or Continue below."
        );
        assert!(transcript.messages().iter().all(|m| !m.is_placeholder));
        assert_eq!(transcript.in_flight(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_speakers_alternate_starting_with_party_a() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(5))
            .await
            .unwrap();
        scheduler.run().await;

        assert_eq!(generator.speakers(), vec!["Ada", "Bob", "Ada", "Bob", "Ada"]);
        assert_eq!(dialogue_speakers(&scheduler), generator.speakers());
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_reached_makes_no_further_call() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_generate_reply()
            .times(3)
            .returning(|request| Ok(Reply::new(format!("Hi from {}", request.speaker.name))));
        let mut scheduler = scheduler(Arc::new(mock));
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(3))
            .await
            .unwrap();

        assert_eq!(scheduler.run().await, SchedulerState::Paused);
        assert_eq!(scheduler.turn_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_carries_counter_forward() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(3))
            .await
            .unwrap();
        assert_eq!(scheduler.run().await, SchedulerState::Paused);
        assert_eq!(scheduler.turn_count(), 3);

        let handle = scheduler.resume(None).await.unwrap();
        // The sixth request arrives after turn five completed; stop there.
        *generator.stop_on_call.lock().unwrap() = Some((6, handle));
        assert_eq!(scheduler.run().await, SchedulerState::Stopped);
        assert_eq!(scheduler.turn_count(), 5);

        let transcript = scheduler.transcript().unwrap();
        assert_eq!(transcript.dialogue().count(), 5);
        assert!(
            transcript
                .messages()
                .iter()
                .all(|m| !m.text.starts_with(PAUSED_NOTICE_PREFIX))
        );
        assert_eq!(
            dialogue_speakers(&scheduler),
            vec!["Ada", "Bob", "Ada", "Bob", "Ada"]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_with_new_limit_pauses_again() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator);
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(1))
            .await
            .unwrap();
        scheduler.run().await;

        scheduler.resume(Some(3)).await.unwrap();
        assert_eq!(scheduler.run().await, SchedulerState::Paused);
        assert_eq!(scheduler.turn_count(), 3);
        let notices = scheduler
            .transcript()
            .unwrap()
            .messages()
            .iter()
            .filter(|m| m.is_system)
            .count();
        assert_eq!(notices, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_rejects_limit_not_ahead_of_counter() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(3))
            .await
            .unwrap();
        assert_eq!(scheduler.run().await, SchedulerState::Paused);

        for limit in [1, 3] {
            assert_eq!(
                scheduler.resume(Some(limit)).await.unwrap_err(),
                SchedulerError::LimitNotAhead { turn_count: 3 }
            );
        }
        // Nothing changed: still paused at the old limit, notice still shown.
        assert_eq!(scheduler.state(), SchedulerState::Paused);
        let session = scheduler.session().unwrap();
        assert_eq!(session.config().turn_limit, Some(3));
        assert!(
            session
                .transcript()
                .last()
                .unwrap()
                .text
                .starts_with(PAUSED_NOTICE_PREFIX)
        );

        scheduler.resume(Some(4)).await.unwrap();
        assert_eq!(scheduler.run().await, SchedulerState::Paused);
        assert_eq!(scheduler.turn_count(), 4);
        assert_eq!(generator.speakers().len(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_generation_error_fails_without_counting() {
        let generator = Arc::new(ScriptedGenerator::with_replies(vec![
            Ok(Reply::new("Hello Bob.")),
            Err(GenerationError::Request {
                message: "connection reset".into(),
            }),
        ]));
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(4))
            .await
            .unwrap();

        assert_eq!(scheduler.run().await, SchedulerState::Failed);
        assert_eq!(scheduler.turn_count(), 1);
        assert_eq!(generator.speakers().len(), 2);

        let last = scheduler.transcript().unwrap().last().unwrap().clone();
        assert!(last.is_error);
        assert_eq!(last.speaker.display_name, "Bob");
        assert_eq!(last.text, "(Error as Bob: connection reset)");

        let failure = scheduler.failure().unwrap();
        assert_eq!(failure.kind, FailureKind::Generation);
        assert_eq!(
            failure.message,
            "An error occurred with Bob's response. Interaction stopped. Details: (Error as Bob: connection reset)"
        );
        assert_eq!(
            scheduler.session().unwrap().history().last().unwrap().text,
            "(Error as Bob: connection reset)"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sentinel_text_fails_the_turn() {
        let generator = Arc::new(ScriptedGenerator::with_replies(vec![Ok(Reply::new(
            "(API Quota Exceeded for Ada. Interaction stopped. Message: 429)",
        ))]));
        let mut scheduler = scheduler(generator);
        scheduler
            .start(DialogueConfig::new(ada(), bob()))
            .await
            .unwrap();

        assert_eq!(scheduler.run().await, SchedulerState::Failed);
        assert_eq!(scheduler.turn_count(), 0);
        assert_eq!(scheduler.failure().unwrap().kind, FailureKind::QuotaExceeded);
        assert!(scheduler.transcript().unwrap().last().unwrap().is_error);

        // Failure is terminal: no resume, and stop leaves it failed.
        assert!(matches!(
            scheduler.resume(None).await,
            Err(SchedulerError::NotPaused)
        ));
        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_mid_animation_snaps_to_full_text() {
        let long = "x".repeat(200);
        let generator = Arc::new(ScriptedGenerator::with_replies(vec![Ok(Reply::new(long.clone()))]));
        let mut scheduler = scheduler(generator);
        let handle = scheduler
            .start(DialogueConfig::new(ada(), bob()))
            .await
            .unwrap();

        let (state, _) = tokio::join!(scheduler.run(), async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            handle.stop();
        });

        assert_eq!(state, SchedulerState::Stopped);
        assert_eq!(scheduler.turn_count(), 0);
        let transcript = scheduler.transcript().unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.messages()[0].text, long);
        assert_eq!(transcript.in_flight(), None);
        assert!(scheduler.session().unwrap().history().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_awaiting_generation_discards_turn() {
        let generator = Arc::new(ScriptedGenerator {
            hang_from_call: Some(2),
            ..Default::default()
        });
        let mut scheduler = scheduler(generator);
        let handle = scheduler
            .start(DialogueConfig::new(ada(), bob()))
            .await
            .unwrap();

        let (state, _) = tokio::join!(scheduler.run(), async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            handle.stop();
        });

        assert_eq!(state, SchedulerState::Stopped);
        assert_eq!(scheduler.turn_count(), 1);
        let transcript = scheduler.transcript().unwrap();
        assert_eq!(transcript.len(), 1);
        assert_eq!(transcript.messages()[0].text, "Ada speaks.");
    }

    #[tokio::test]
    async fn test_identical_parties_rejected_synchronously() {
        let mut mock = MockReplyGenerator::new();
        mock.expect_generate_reply().never();
        let mut scheduler = scheduler(Arc::new(mock));

        let result = scheduler.start(DialogueConfig::new(ada(), ada())).await;
        assert!(matches!(
            result,
            Err(SchedulerError::Configuration(ConfigurationError::IdenticalParties))
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.transcript().is_none_or(Transcript::is_empty));
        assert_eq!(scheduler.run().await, SchedulerState::Idle);
    }

    #[tokio::test]
    async fn test_empty_topic_rejected() {
        let mut scheduler = scheduler(Arc::new(ScriptedGenerator::default()));
        let result = scheduler
            .start(DialogueConfig::new(ada(), bob()).with_topic("   "))
            .await;
        assert!(matches!(
            result,
            Err(SchedulerError::Configuration(ConfigurationError::EmptyTopic))
        ));
        assert_eq!(scheduler.state(), SchedulerState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requests_carry_trailing_window_and_context() {
        let generator = Arc::new(ScriptedGenerator::default());
        let mut scheduler = scheduler(generator.clone());
        scheduler
            .start(
                DialogueConfig::new(ada(), bob())
                    .with_topic(" steam engines ")
                    .with_scenario("  ")
                    .with_turn_limit(6),
            )
            .await
            .unwrap();
        scheduler.run().await;

        let requests = generator.requests.lock().unwrap();
        assert!(requests[0].recent_history.is_empty());
        assert_eq!(requests[0].topic.as_deref(), Some("steam engines"));
        assert_eq!(requests[0].scenario, None);

        let previous = requests[1].recent_history.last().unwrap();
        assert_eq!(previous.speaker_id, "ada");
        assert_eq!(requests[1].listener.id, "ada");

        assert_eq!(requests[5].recent_history.len(), 4);
        assert_eq!(requests[5].recent_history[0].text, "Bob speaks.");
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_and_reset_lifecycle() {
        let mut scheduler = scheduler(Arc::new(ScriptedGenerator::default()));
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(1))
            .await
            .unwrap();
        scheduler.run().await;

        scheduler.stop().await;
        assert_eq!(scheduler.state(), SchedulerState::Stopped);
        assert!(matches!(
            scheduler.resume(None).await,
            Err(SchedulerError::NotPaused)
        ));
        // Stop keeps the conversation around for export.
        assert_eq!(scheduler.transcript().unwrap().dialogue().count(), 1);

        scheduler.reset().await;
        assert_eq!(scheduler.state(), SchedulerState::Idle);
        assert!(scheduler.transcript().is_none());
        assert_eq!(scheduler.turn_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_again_resets_counter() {
        let mut scheduler = scheduler(Arc::new(ScriptedGenerator::default()));
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(2))
            .await
            .unwrap();
        scheduler.run().await;
        assert!(matches!(
            scheduler.start(DialogueConfig::new(bob(), ada())).await,
            Ok(_)
        ));
        assert_eq!(scheduler.turn_count(), 0);
        assert!(scheduler.transcript().unwrap().is_empty());

        // A started session that has not run yet rejects another start.
        assert!(matches!(
            scheduler.start(DialogueConfig::new(ada(), bob())).await,
            Err(SchedulerError::AlreadyRunning)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_describe_the_run() {
        let (events, mut rx) = EventPublisher::channel(1024);
        let mut scheduler = DialogueScheduler::new(
            Arc::new(ScriptedGenerator::default()),
            SchedulerSettings::default(),
            events,
        );
        scheduler
            .start(DialogueConfig::new(ada(), bob()).with_turn_limit(2))
            .await
            .unwrap();
        scheduler.run().await;
        drop(scheduler);

        let mut states = Vec::new();
        let mut turns = Vec::new();
        let mut placeholders = 0;
        let mut removed = 0;
        while let Some(event) = rx.recv().await {
            match event {
                SessionEvent::StateChanged { state } => states.push(state),
                SessionEvent::TurnCompleted { turn_count } => turns.push(turn_count),
                SessionEvent::MessageAppended { message } if message.is_placeholder => {
                    placeholders += 1
                }
                SessionEvent::MessageRemoved { .. } => removed += 1,
                _ => {}
            }
        }
        assert_eq!(states, vec![SchedulerState::Running, SchedulerState::Paused]);
        assert_eq!(turns, vec![1, 2]);
        assert_eq!(placeholders, 2);
        assert_eq!(removed, 2);
    }

    #[test]
    fn test_config_normalization() {
        let config = DialogueConfig::new(ada(), bob())
            .with_scenario("  A quiet library ")
            .with_turn_limit(0);
        assert_eq!(config.scenario.as_deref(), Some("A quiet library"));
        assert_eq!(config.turn_limit, None);
        assert_eq!(config.topic(), None);
        assert!(config.validate().is_ok());
    }
}
