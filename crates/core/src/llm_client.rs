use crate::{
    error::GenerationError,
    persona::Persona,
    prompt::{DialoguePrompt, persona_system_prompt, probe_prompt},
    transcript::DialogueLine,
};
use async_openai::{
    Client,
    config::OpenAIConfig,
    error::OpenAIError,
    types::{
        ChatCompletionRequestAssistantMessageArgs, ChatCompletionRequestMessage,
        ChatCompletionRequestSystemMessageArgs, ChatCompletionRequestUserMessageArgs,
        CreateChatCompletionRequestArgs,
    },
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tracing::{debug, warn};

const PLAYGROUND_TEMPERATURE: f32 = 0.9;
const CHAT_TEMPERATURE: f32 = 0.85;
const PROBE_TEMPERATURE: f32 = 0.7;
const TOP_P: f32 = 0.9;

/// A complete reply from the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reply {
    pub text: String,
}

impl Reply {
    pub fn new(text: impl Into<String>) -> Self {
        Self { text: text.into() }
    }
}

/// Everything needed to generate one playground turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyRequest {
    pub speaker: Persona,
    pub listener: Persona,
    /// Trailing window of real dialogue, oldest first.
    pub recent_history: Vec<DialogueLine>,
    pub topic: Option<String>,
    pub scenario: Option<String>,
}

/// A single in-character test query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeRequest {
    pub persona: Persona,
    pub query: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Persona,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: ChatRole,
    pub text: String,
}

/// A chat message to a persona, with the prior exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatRequest {
    pub persona: Persona,
    pub history: Vec<ChatTurn>,
    pub message: String,
}

/// A stream of reply fragments.
pub type ReplyStream = Pin<Box<dyn Stream<Item = Result<String, GenerationError>> + Send>>;

/// The text-generation collaborator used by the scheduler, the chat flow and
/// the probe.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ReplyGenerator: Send + Sync {
    /// Generates the next line for `request.speaker`.
    async fn generate_reply(&self, request: ReplyRequest) -> Result<Reply, GenerationError>;

    /// Answers a single query in character.
    async fn probe_reply(&self, request: ProbeRequest) -> Result<Reply, GenerationError>;

    /// Streams a chat reply fragment by fragment.
    async fn stream_reply(&self, request: ChatRequest) -> Result<ReplyStream, GenerationError>;
}

/// An implementation of `ReplyGenerator` for any OpenAI-compatible API.
pub struct OpenAICompatibleGenerator {
    client: Client<OpenAIConfig>,
    model: String,
}

impl OpenAICompatibleGenerator {
    /// Creates a generator for an OpenAI-compatible service.
    ///
    /// # Arguments
    ///
    /// * `config` - API key and base URL of the service.
    /// * `model` - The model identifier used for every request.
    pub fn new(config: OpenAIConfig, model: String) -> Self {
        Self {
            client: Client::with_config(config),
            model,
        }
    }

    fn classify(&self, err: OpenAIError) -> GenerationError {
        classify_openai_error(err, &self.model)
    }

    /// Sends a single user prompt and returns the first choice's text.
    async fn complete(&self, prompt: String, temperature: f32) -> Result<String, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(vec![
                ChatCompletionRequestUserMessageArgs::default()
                    .content(prompt)
                    .build()?
                    .into(),
            ])
            .temperature(temperature)
            .top_p(TOP_P)
            .build()?;

        let response = self.client.chat().create(request).await?;
        Ok(response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .unwrap_or_default())
    }

    fn chat_messages(request: &ChatRequest) -> Result<Vec<ChatCompletionRequestMessage>, OpenAIError> {
        let mut messages: Vec<ChatCompletionRequestMessage> = vec![
            ChatCompletionRequestSystemMessageArgs::default()
                .content(persona_system_prompt(&request.persona))
                .build()?
                .into(),
        ];
        for turn in &request.history {
            match turn.role {
                ChatRole::User => messages.push(
                    ChatCompletionRequestUserMessageArgs::default()
                        .content(turn.text.clone())
                        .build()?
                        .into(),
                ),
                ChatRole::Persona => messages.push(
                    ChatCompletionRequestAssistantMessageArgs::default()
                        .content(turn.text.clone())
                        .build()?
                        .into(),
                ),
            };
        }
        messages.push(
            ChatCompletionRequestUserMessageArgs::default()
                .content(request.message.clone())
                .build()?
                .into(),
        );
        Ok(messages)
    }

    async fn open_stream(&self, request: &ChatRequest) -> Result<ReplyStream, OpenAIError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.model)
            .messages(Self::chat_messages(request)?)
            .temperature(CHAT_TEMPERATURE)
            .top_p(TOP_P)
            .stream(true)
            .build()?;

        let stream = self.client.chat().create_stream(request).await?;
        let model = self.model.clone();

        Ok(Box::pin(stream.filter_map(move |result| {
            let model = model.clone();
            async move {
                match result {
                    Ok(response) => response
                        .choices
                        .first()
                        .and_then(|choice| choice.delta.content.clone())
                        .filter(|content| !content.is_empty())
                        .map(Ok),
                    Err(e) => Some(Err(classify_openai_error(e, &model))),
                }
            }
        })))
    }
}

fn classify_openai_error(err: OpenAIError, model: &str) -> GenerationError {
    let classified = match &err {
        OpenAIError::ApiError(api) => {
            let detail = match &api.r#type {
                Some(kind) => format!("{kind}: {}", api.message),
                None => api.message.clone(),
            };
            GenerationError::classify(&detail, None, model)
        }
        OpenAIError::Reqwest(e) => {
            GenerationError::classify(&e.to_string(), e.status().map(|s| s.as_u16()), model)
        }
        other => GenerationError::classify(&other.to_string(), None, model),
    };
    warn!(error = %err, "Generation request failed");
    classified
}

#[async_trait]
impl ReplyGenerator for OpenAICompatibleGenerator {
    async fn generate_reply(&self, request: ReplyRequest) -> Result<Reply, GenerationError> {
        let prompt = DialoguePrompt::build(&request);
        debug!(speaker = %request.speaker.name, "Requesting playground reply");

        let text = self
            .complete(prompt, PLAYGROUND_TEMPERATURE)
            .await
            .map_err(|e| self.classify(e))?;

        if text.trim().is_empty() {
            return Ok(Reply::new(format!(
                "{} seems to be lost in thought...",
                request.speaker.name
            )));
        }
        Ok(Reply::new(text))
    }

    async fn probe_reply(&self, request: ProbeRequest) -> Result<Reply, GenerationError> {
        let text = self
            .complete(probe_prompt(&request), PROBE_TEMPERATURE)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(Reply::new(text))
    }

    async fn stream_reply(&self, request: ChatRequest) -> Result<ReplyStream, GenerationError> {
        self.open_stream(&request).await.map_err(|e| self.classify(e))
    }
}
