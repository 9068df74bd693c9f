//! Prompt construction for the generation service.

use crate::{
    llm_client::{ProbeRequest, ReplyRequest},
    persona::Persona,
};

/// How the speaker should open its turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opening {
    /// Nothing has been said yet.
    Initiate,
    /// The listener spoke last; answer that specific line.
    Respond { text: String },
    /// Anything else, e.g. the speaker also authored the previous line.
    Continue,
}

impl Opening {
    /// Picks the opening from the trailing history: empty history initiates,
    /// a last line authored by the listener is answered, anything else continues.
    pub fn for_request(request: &ReplyRequest) -> Self {
        match request.recent_history.last() {
            None => Opening::Initiate,
            Some(line) if line.speaker_id == request.listener.id => Opening::Respond {
                text: line.text.clone(),
            },
            Some(_) => Opening::Continue,
        }
    }
}

/// Builds the single-shot prompt for one playground turn.
pub struct DialoguePrompt;

impl DialoguePrompt {
    pub fn build(request: &ReplyRequest) -> String {
        let speaker = &request.speaker;
        let listener = &request.listener;
        let topic = request.topic.as_deref().filter(|t| !t.trim().is_empty());
        let scenario = request.scenario.as_deref().filter(|s| !s.trim().is_empty());

        let history = if request.recent_history.is_empty() {
            "This is the beginning of your conversation.".to_string()
        } else {
            request
                .recent_history
                .iter()
                .map(|line| format!("{}: {}", line.speaker_name, line.text))
                .collect::<Vec<_>>()
                .join("\n")
        };

        let scenario_line = scenario
            .map(|s| format!("The current scenario or setting for your conversation is: \"{s}\"\n"))
            .unwrap_or_default();

        let base = format!(
            "You are {name}. Embody this persona fully.
Your Biography: {bio}
Your Character Description: {character}
Relevant Writings/Excerpts: {writings}
Your Voice/Thought Patterns: {voice}
{memories}

You are currently in a conversation with {other}.
About {other}:
Their Biography: {other_bio}
Their Character Description: {other_character}
{other_memories}

{scenario_line}
General Instruction for this conversation: Engage with {other} in a natural and dynamic way. Express your unique viewpoint and character, {name}, but aim for a lively and believable exchange of concise, spoken-like dialogue. Your responses should typically be brief - a few sentences is ideal. Actively avoid long, unbroken monologues or essay-like replies. The goal is a back-and-forth conversation, not a series of speeches. Even when discussing a specific topic or within a scenario, maintain this concise and conversational style.

Conversation History (you are {name}):
{history}
---
",
            name = speaker.name,
            bio = speaker.biography,
            character = speaker.character_description,
            writings = or_unspecified(&speaker.writings),
            voice = or_unspecified(&speaker.voice_sample_transcript),
            memories = speaker.memories_prompt(),
            other = listener.name,
            other_bio = listener.biography,
            other_character = listener.character_description,
            other_memories = listener.memories_prompt(),
        );

        let instruction = Self::instruction(&Opening::for_request(request), speaker, listener, topic, scenario);
        format!("{base}{instruction}\n{}:", speaker.name)
    }

    fn instruction(
        opening: &Opening,
        speaker: &Persona,
        listener: &Persona,
        topic: Option<&str>,
        scenario: Option<&str>,
    ) -> String {
        let (name, other) = (&speaker.name, &listener.name);
        match opening {
            Opening::Initiate => match (topic, scenario) {
                (Some(topic), scenario) => {
                    let in_scenario = scenario
                        .map(|s| format!(" You are in the scenario: \"{s}\"."))
                        .unwrap_or_default();
                    format!(
                        "The specific topic for this discussion is: \"{topic}\".{in_scenario} As {name}, you MUST initiate the conversation with {other} by directly addressing this topic within the given scenario (if provided). Ask a question about it, state your initial position, or make an observation related to \"{topic}\" and the scenario. Begin the discussion with a concise, conversational opening remark or question. Keep your opening brief."
                    )
                }
                (None, Some(scenario)) => format!(
                    "This is the start of a free chat with {other} within the scenario: \"{scenario}\". Greet them or begin the conversation in a way that is natural for your character, {name}, keeping the scenario in mind."
                ),
                (None, None) => format!(
                    "This is the start of a free chat with {other}. Greet them or begin the conversation in a way that is natural for your character, {name}."
                ),
            },
            Opening::Respond { text } => match topic {
                Some(topic) => {
                    let within = scenario
                        .map(|s| format!(" within the scenario: \"{s}\""))
                        .unwrap_or_default();
                    format!(
                        "The ongoing discussion topic is \"{topic}\"{within}. {other} just said: \"{text}\". As {name}, your response MUST be relevant to this statement AND keep the conversation focused on \"{topic}\" and the scenario (if provided). Remember to keep your response conversational and relatively brief."
                    )
                }
                None => {
                    let reminder = scenario
                        .map(|s| format!(" (remember you are in the scenario: \"{s}\")"))
                        .unwrap_or_default();
                    format!("{other} just said: \"{text}\". As {name}, respond to {other} in character{reminder}.")
                }
            },
            Opening::Continue => {
                let mut instruction = format!("Continue the conversation naturally as {name}.");
                if let Some(topic) = topic {
                    instruction.push_str(&format!(
                        " Your primary focus should remain on the topic: \"{topic}\"."
                    ));
                } else if let Some(scenario) = scenario {
                    instruction.push_str(&format!(
                        " Keep the scenario: \"{scenario}\" in mind as you respond."
                    ));
                }
                instruction
            }
        }
    }
}

fn or_unspecified(text: &str) -> &str {
    if text.trim().is_empty() { "Not specified." } else { text }
}

/// System instruction for a single-persona chat.
pub fn persona_system_prompt(persona: &Persona) -> String {
    let writings = if persona.writings.trim().is_empty() {
        "No specific writings provided, rely on bio and character."
    } else {
        persona.writings.as_str()
    };
    let voice = if persona.voice_sample_transcript.trim().is_empty() {
        "No specific voice sample, rely on bio and character."
    } else {
        persona.voice_sample_transcript.as_str()
    };
    format!(
        "You are {name}. Embody this persona fully.
Your biography: {bio}
Your key character traits and personality: {character}
Excerpts from your writings (diaries, letters, etc.): {writings}
A sample of how you speak or your thoughts (from voice recordings, etc.): {voice}
{memories}
---
Respond naturally as this persona, as if you are speaking directly in a conversation. Do not break character. Do not mention you are an AI.
Your responses should typically be concise, like spoken dialogue - often a few sentences at most. While you can elaborate if it's truly in character and the moment calls for it, actively avoid long, unbroken paragraphs or essay-like responses.
If asked about your origin or how you were created, you can be vague or interpret it through your persona's lens, but do not reveal you are an AI construct.
If the user asks for information that would be outside your persona's knowledge, politely state that it's beyond your scope or knowledge in a way that fits your character.
",
        name = persona.name,
        bio = persona.biography,
        character = persona.character_description,
        memories = persona.memories_prompt(),
    )
}

/// Single-shot role-play prompt used to probe a persona with one query.
pub fn probe_prompt(request: &ProbeRequest) -> String {
    let persona = &request.persona;
    format!(
        "
CONTEXT: You are role-playing as a specific persona. Do not break character.
--- START PERSONA DEFINITION ---
Name: {name}
Biography: {bio}
Character Description: {character}
Writings/Source Material Excerpts: {writings}
Voice/Thought Patterns Sample: {voice}
{memories}
--- END PERSONA DEFINITION ---

Based ONLY on the persona defined above, provide a concise and in-character response to the following user query. Aim for a natural, conversational style, as if you were speaking directly to the user. Keep it brief, like spoken dialogue, and do not offer to do things outside the persona's capabilities.

User Query: \"{query}\"

Persona ({name}) Response:",
        name = persona.name,
        bio = persona.biography,
        character = persona.character_description,
        writings = persona.writings,
        voice = persona.voice_sample_transcript,
        memories = persona.memories_prompt(),
        query = request.query,
    )
}
