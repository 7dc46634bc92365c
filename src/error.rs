//! Error types for coravoice.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoraError {
    // Configuration errors
    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Speech driver errors
    #[error("Speech driver unavailable: {driver}")]
    DriverUnavailable { driver: String },

    // Conversation channel errors
    #[error("Conversation channel error: {message}")]
    Channel { message: String },

    #[error("Conversation channel protocol error: {0}")]
    ChannelProtocol(#[from] serde_json::Error),

    // Session service errors
    #[error("Session service returned HTTP {status}: {body}")]
    EngineStatus { status: u16, body: String },

    #[error("Session service rejected the request: {message}")]
    EngineRejected { message: String },

    #[error("Session service unreachable: {message}")]
    EngineUnreachable { message: String },

    // Lifecycle errors
    #[error("No active conversation")]
    NoActiveSession,

    #[error("No conversation to analyze")]
    NothingToAnalyze,

    #[error("Controller is no longer running")]
    ControllerClosed,

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, CoraError>;
