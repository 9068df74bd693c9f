pub mod chat;
pub mod error;
pub mod event;
pub mod export;
pub mod llm_client;
pub mod persona;
pub mod probe;
pub mod prompt;
pub mod scheduler;
pub mod transcript;
pub mod typewriter;

pub use chat::{ChatReply, PersonaChat};
pub use error::{ChatError, ConfigurationError, FailureKind, GenerationError, ProbeError, SchedulerError};
pub use event::{EventPublisher, SessionEvent};
pub use llm_client::{OpenAICompatibleGenerator, ReplyGenerator};
pub use persona::Persona;
pub use scheduler::{
    ConversationMode, DialogueConfig, DialogueScheduler, SchedulerSettings, SchedulerState, StopHandle,
};
pub use transcript::{Message, Party, Transcript};
pub use typewriter::{RevealBuffer, RevealRate, StreamTypewriter};
