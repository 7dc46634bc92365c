//! Conversation data model: sessions, transcript messages, moods, scenarios.

use crate::voice::catalog::Voice;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Opaque conversation identifier issued by the session service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// First eight characters, for status lines.
    pub fn short(&self) -> &str {
        match self.0.char_indices().nth(8) {
            Some((idx, _)) => &self.0[..idx],
            None => &self.0,
        }
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Author of a transcript line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    User,
    Agent,
    System,
}

/// One transcript line. Immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Message {
    pub fn new(role: Role, content: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }

    pub fn now(role: Role, content: impl Into<String>) -> Self {
        Self::new(role, content, Utc::now())
    }
}

/// Parse a timestamp sent by the conversation engine.
///
/// Accepts RFC 3339 and naive ISO-8601 (treated as UTC). Anything else
/// falls back to the receive time.
pub fn parse_timestamp(raw: &str) -> DateTime<Utc> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return ts.with_timezone(&Utc);
    }
    if let Ok(naive) = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f") {
        return naive.and_utc();
    }
    Utc::now()
}

/// Emotional state the remote engine plays. Also shapes speech prosody.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mood {
    #[default]
    Neutral,
    Happy,
    Curious,
    Frustrated,
    Confused,
    Impatient,
}

impl Mood {
    pub const ALL: [Mood; 6] = [
        Mood::Neutral,
        Mood::Happy,
        Mood::Curious,
        Mood::Frustrated,
        Mood::Confused,
        Mood::Impatient,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Mood::Neutral => "neutral",
            Mood::Happy => "happy",
            Mood::Curious => "curious",
            Mood::Frustrated => "frustrated",
            Mood::Confused => "confused",
            Mood::Impatient => "impatient",
        }
    }

    /// Speaking rate multiplier.
    pub fn rate(&self) -> f32 {
        match self {
            Mood::Happy => 1.1,
            Mood::Curious => 1.0,
            Mood::Frustrated => 1.2,
            Mood::Confused => 0.9,
            Mood::Impatient => 1.3,
            Mood::Neutral => 1.0,
        }
    }

    /// Pitch multiplier.
    pub fn pitch(&self) -> f32 {
        match self {
            Mood::Happy => 1.2,
            Mood::Curious => 1.1,
            Mood::Frustrated => 0.9,
            Mood::Confused => 1.0,
            Mood::Impatient => 1.1,
            Mood::Neutral => 1.0,
        }
    }
}

impl fmt::Display for Mood {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mood {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Mood::ALL
            .into_iter()
            .find(|m| m.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown mood '{}' (expected one of: neutral, happy, curious, frustrated, confused, impatient)",
                    s
                )
            })
    }
}

/// Predefined conversation openers. The seed line is sent hidden so the
/// engine speaks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scenario {
    Product,
    Complaint,
    Return,
    Technical,
}

impl Scenario {
    pub const ALL: [Scenario; 4] = [
        Scenario::Product,
        Scenario::Complaint,
        Scenario::Return,
        Scenario::Technical,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Scenario::Product => "product",
            Scenario::Complaint => "complaint",
            Scenario::Return => "return",
            Scenario::Technical => "technical",
        }
    }

    pub fn seed(&self) -> &'static str {
        match self {
            Scenario::Product => {
                "Start a conversation as a customer interested in learning about products and services. Begin by asking about what's available."
            }
            Scenario::Complaint => {
                "Start a conversation as a frustrated customer with a complaint about a recent purchase or service. Express your dissatisfaction and explain the issue."
            }
            Scenario::Return => {
                "Start a conversation as a customer who needs to return or exchange a product. Explain what you bought and why you want to return it."
            }
            Scenario::Technical => {
                "Start a conversation as a confused customer experiencing a technical problem. Describe the issue you're having with the product or service."
            }
        }
    }
}

impl FromStr for Scenario {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Scenario::ALL
            .into_iter()
            .find(|sc| sc.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown scenario '{}' (expected one of: product, complaint, return, technical)",
                    s
                )
            })
    }
}

/// One conversation with the remote engine.
///
/// `history` is append-only. `voice_lock` pins the random voice for the
/// remainder of the session once chosen.
#[derive(Debug, Clone)]
pub struct ConversationSession {
    id: SessionId,
    mood: Mood,
    history: Vec<Message>,
    paused: bool,
    active: bool,
    voice_lock: Option<Voice>,
}

impl ConversationSession {
    pub fn new(id: SessionId, mood: Mood) -> Self {
        Self {
            id,
            mood,
            history: Vec::new(),
            paused: false,
            active: true,
            voice_lock: None,
        }
    }

    pub fn id(&self) -> &SessionId {
        &self.id
    }

    pub fn mood(&self) -> Mood {
        self.mood
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// True when the session accepts new outbound messages.
    pub fn is_open(&self) -> bool {
        self.active && !self.paused
    }

    pub fn voice_lock(&self) -> Option<&Voice> {
        self.voice_lock.as_ref()
    }

    pub(crate) fn append(&mut self, message: Message) {
        self.history.push(message);
    }

    pub(crate) fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    pub(crate) fn deactivate(&mut self) {
        self.active = false;
        self.paused = false;
        self.voice_lock = None;
    }

    /// Pin a voice. No-op if one is already locked.
    pub(crate) fn lock_voice(&mut self, voice: Voice) {
        if self.voice_lock.is_none() {
            self.voice_lock = Some(voice);
        }
    }

    pub(crate) fn clear_voice_lock(&mut self) -> Option<Voice> {
        self.voice_lock.take()
    }
}
