//! Plain-text export of a finished conversation.

use crate::{scheduler::DialogueConfig, transcript::Transcript};
use chrono::{DateTime, NaiveDate, TimeZone};
use std::fmt::{self, Display, Write};

/// The title block of an exported transcript.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportHeader {
    Playground {
        party_a: String,
        party_b: String,
        topic: Option<String>,
        scenario: Option<String>,
    },
    Chat {
        persona: String,
    },
}

impl ExportHeader {
    pub fn for_dialogue(config: &DialogueConfig) -> Self {
        ExportHeader::Playground {
            party_a: config.party_a.name.clone(),
            party_b: config.party_b.name.clone(),
            topic: config.topic().map(str::to_string),
            scenario: config.scenario.clone(),
        }
    }

    /// Suggested download name for an export made on `date`.
    pub fn filename(&self, date: NaiveDate) -> String {
        match self {
            ExportHeader::Playground {
                party_a, party_b, ..
            } => export_filename(party_a, party_b, date),
            ExportHeader::Chat { persona } => {
                format!("Chat_with_{}_{}.txt", sanitize(persona), date.format("%Y-%m-%d"))
            }
        }
    }
}

fn sanitize(name: &str) -> String {
    name.replace(char::is_whitespace, "_")
}

/// `Playground_Chat_<A>_vs_<B>_<YYYY-MM-DD>.txt`, whitespace replaced by `_`.
pub fn export_filename(party_a: &str, party_b: &str, date: NaiveDate) -> String {
    format!(
        "Playground_Chat_{}_vs_{}_{}.txt",
        sanitize(party_a),
        sanitize(party_b),
        date.format("%Y-%m-%d")
    )
}

/// Renders the settled part of `transcript`. Placeholders and a message that
/// is still being typed are left out. Times are shown in `exported_at`'s zone.
pub fn export_transcript<Tz>(
    header: &ExportHeader,
    transcript: &Transcript,
    exported_at: &DateTime<Tz>,
) -> String
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    // Writing into a String cannot fail.
    render(header, transcript, exported_at).unwrap_or_default()
}

fn render<Tz>(
    header: &ExportHeader,
    transcript: &Transcript,
    exported_at: &DateTime<Tz>,
) -> Result<String, fmt::Error>
where
    Tz: TimeZone,
    Tz::Offset: Display,
{
    let mut content = String::new();
    match header {
        ExportHeader::Playground {
            party_a,
            party_b,
            topic,
            scenario,
        } => {
            writeln!(content, "Persona Playground Chat")?;
            writeln!(content, "Participants: {party_a} and {party_b}")?;
            if let Some(topic) = topic {
                writeln!(content, "Topic: {topic}")?;
            }
            if let Some(scenario) = scenario {
                writeln!(content, "Scenario: {scenario}")?;
            }
        }
        ExportHeader::Chat { persona } => writeln!(content, "Chat with {persona}")?,
    }
    writeln!(
        content,
        "Exported on: {}\n",
        exported_at.format("%Y-%m-%d %H:%M:%S")
    )?;

    let zone = exported_at.timezone();
    for message in transcript.settled() {
        let time = message.timestamp.with_timezone(&zone).format("%H:%M:%S");
        let name = &message.speaker.display_name;
        if message.is_system {
            writeln!(content, "[{time}] --- System Message ({name}) --- : {}", message.text)?;
        } else {
            writeln!(content, "[{time}] {name}: {}", message.text)?;
        }
    }
    Ok(content)
}
