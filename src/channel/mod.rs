//! Conversation channel: a persistent bidirectional link to the remote engine.

pub mod protocol;
#[cfg(feature = "ws")]
pub mod ws;

use crate::error::Result;
use crate::session::SessionId;
use chrono::{DateTime, Utc};
pub use protocol::{ClientEvent, OutboundMessage, ReplyMessage, ServerEvent};
use std::fmt;

/// Advisory connection state. Sends are attempted regardless.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    Connected,
    #[default]
    Disconnected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected => f.write_str("disconnected"),
        }
    }
}

/// Inbound channel traffic, delivered through the controller's event sink.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Reply {
        conversation_id: SessionId,
        content: String,
        timestamp: DateTime<Utc>,
    },
    Error(String),
    Connection(ConnectionState),
}

impl From<ServerEvent> for ChannelEvent {
    fn from(event: ServerEvent) -> Self {
        match event {
            ServerEvent::MessageResponse {
                conversation_id,
                message,
            } => ChannelEvent::Reply {
                timestamp: message.timestamp(),
                conversation_id,
                content: message.content,
            },
            ServerEvent::Error { message } => ChannelEvent::Error(message),
            ServerEvent::Connected { .. } => ChannelEvent::Connection(ConnectionState::Connected),
        }
    }
}

/// Outbound half of the channel.
///
/// `send` only enqueues: the reply arrives later as [`ChannelEvent::Reply`].
pub trait ConversationChannel: Send + Sync {
    fn send(&self, message: OutboundMessage) -> Result<()>;

    fn state(&self) -> ConnectionState;
}
