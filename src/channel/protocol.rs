//! Conversation channel wire format.
//!
//! JSON frames, internally tagged by `"event"`:
//! - client: `{"event":"send_message","conversation_id":"…","message":"…","is_scenario_prompt":false}`
//! - server: `{"event":"message_response","conversation_id":"…","message":{"content":"…","timestamp":"…"}}`
//! - server: `{"event":"error","message":"…"}`
//! - server: `{"event":"connected","message":"…"}`

use crate::error::Result;
use crate::session::{SessionId, parse_timestamp};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One outbound user (or hidden scenario) message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub conversation_id: SessionId,
    pub message: String,
    #[serde(default)]
    pub is_scenario_prompt: bool,
}

/// Frames sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ClientEvent {
    SendMessage(OutboundMessage),
}

/// Agent reply payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplyMessage {
    pub content: String,
    #[serde(default)]
    pub timestamp: Option<String>,
}

impl ReplyMessage {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
            .as_deref()
            .map(parse_timestamp)
            .unwrap_or_else(Utc::now)
    }
}

/// Frames pushed by the server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    MessageResponse {
        conversation_id: SessionId,
        message: ReplyMessage,
    },
    Error {
        message: String,
    },
    Connected {
        #[serde(default)]
        message: Option<String>,
    },
}

pub fn encode(event: &ClientEvent) -> Result<String> {
    Ok(serde_json::to_string(event)?)
}

pub fn decode(frame: &str) -> Result<ServerEvent> {
    Ok(serde_json::from_str(frame)?)
}
