use crate::{
    error::ProbeError,
    llm_client::{ProbeRequest, ReplyGenerator},
    persona::Persona,
};
use tracing::debug;

/// Asks `persona` a single question and returns its in-character answer.
pub async fn probe_persona(
    generator: &dyn ReplyGenerator,
    persona: &Persona,
    query: &str,
) -> Result<String, ProbeError> {
    let query = query.trim();
    if query.is_empty() {
        return Err(ProbeError::EmptyQuery);
    }
    debug!(persona = %persona.name, "Probing persona");
    let reply = generator
        .probe_reply(ProbeRequest {
            persona: persona.clone(),
            query: query.to_string(),
        })
        .await?;
    Ok(reply.text)
}

impl ProbeError {
    /// Copy shown to the user in place of an answer.
    pub fn user_message(&self) -> String {
        match self {
            ProbeError::EmptyQuery => self.to_string(),
            ProbeError::Generation(e) => e.user_copy("get test response"),
        }
    }
}
