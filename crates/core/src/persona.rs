use crate::transcript::Party;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Avatar service used when a persona has no image of its own.
pub const DEFAULT_AVATAR_BASE: &str = "https://ui-avatars.com/api/";

/// How strongly a memory shaped the persona.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Impact {
    Low,
    #[default]
    Medium,
    High,
}

/// The emotional colour of a memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Sentiment {
    Positive,
    Negative,
    #[default]
    Neutral,
}

impl fmt::Display for Impact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Impact::Low => write!(f, "low"),
            Impact::Medium => write!(f, "medium"),
            Impact::High => write!(f, "high"),
        }
    }
}

impl fmt::Display for Sentiment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sentiment::Positive => write!(f, "positive"),
            Sentiment::Negative => write!(f, "negative"),
            Sentiment::Neutral => write!(f, "neutral"),
        }
    }
}

/// A significant event implanted into a persona's background.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Memory {
    pub title: String,
    pub description: String,
    /// Free-form date of when the memory occurred.
    #[serde(default)]
    pub date: Option<String>,
    #[serde(default)]
    pub impact: Impact,
    #[serde(default)]
    pub sentiment: Sentiment,
}

/// A character the user talks to, or that talks to another persona.
///
/// Personas arrive fully formed from the client; this crate never stores them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Persona {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub biography: String,
    #[serde(default)]
    pub character_description: String,
    /// Transcript of recordings showing how the persona speaks.
    #[serde(default)]
    pub voice_sample_transcript: String,
    /// Concatenated excerpts of the persona's own writing.
    #[serde(default)]
    pub writings: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub memories: Vec<Memory>,
}

impl Persona {
    /// Creates a persona with only an identity; the rest can be filled in by field.
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            biography: String::new(),
            character_description: String::new(),
            voice_sample_transcript: String::new(),
            writings: String::new(),
            image_url: None,
            memories: Vec::new(),
        }
    }

    /// The avatar shown next to this persona's messages.
    pub fn avatar(&self) -> String {
        match &self.image_url {
            Some(url) if !url.trim().is_empty() => url.clone(),
            _ => format!(
                "{DEFAULT_AVATAR_BASE}?name={}&background=random&size=128",
                self.name.replace(char::is_whitespace, "+")
            ),
        }
    }

    /// The transcript identity of this persona.
    pub fn party(&self) -> Party {
        Party {
            id: self.id.clone(),
            display_name: self.name.clone(),
            avatar: Some(self.avatar()),
        }
    }

    /// Renders the persona's memories as a prompt section.
    pub fn memories_prompt(&self) -> String {
        if self.memories.is_empty() {
            return "No specific significant memories provided.".to_string();
        }
        let lines: Vec<String> = self
            .memories
            .iter()
            .map(|m| {
                format!(
                    "- Title: {} (Occurred: {}, Impact: {}, Sentiment: {}). Description: {}",
                    m.title,
                    m.date.as_deref().unwrap_or("N/A"),
                    m.impact,
                    m.sentiment,
                    m.description
                )
            })
            .collect();
        format!(
            "\nKey Memories that significantly shaped you:\n{}",
            lines.join("\n")
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_avatar_uses_name() {
        let persona = Persona::new("p1", "Ada Lovelace");
        assert_eq!(
            persona.avatar(),
            "https://ui-avatars.com/api/?name=Ada+Lovelace&background=random&size=128"
        );

        let mut custom = Persona::new("p2", "Bob");
        custom.image_url = Some("https://example.com/bob.png".into());
        assert_eq!(custom.party().avatar.as_deref(), Some("https://example.com/bob.png"));
    }

    #[test]
    fn test_memories_prompt() {
        let mut persona = Persona::new("p1", "Ada");
        assert_eq!(
            persona.memories_prompt(),
            "No specific significant memories provided."
        );

        persona.memories.push(Memory {
            title: "First program".into(),
            description: "Wrote notes on the engine".into(),
            date: None,
            impact: Impact::High,
            sentiment: Sentiment::Positive,
        });
        let rendered = persona.memories_prompt();
        assert!(rendered.contains(
            "- Title: First program (Occurred: N/A, Impact: high, Sentiment: positive). Description: Wrote notes on the engine"
        ));
    }

    #[test]
    fn test_persona_deserializes_from_client_shape() {
        let json = r#"{
            "id": "a1",
            "name": "Ada",
            "characterDescription": "Curious",
            "memories": [{"title": "t", "description": "d", "impact": "low"}]
        }"#;
        let persona: Persona = serde_json::from_str(json).unwrap();
        assert_eq!(persona.character_description, "Curious");
        assert_eq!(persona.memories[0].impact, Impact::Low);
        assert_eq!(persona.memories[0].sentiment, Sentiment::Neutral);
        assert!(persona.biography.is_empty());
    }
}
