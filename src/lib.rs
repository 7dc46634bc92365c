//! coravoice - voice front end for a customer-service role-play trainer
//!
//! Talk to a simulated customer: speech in, speech out, with turn-taking
//! that never lets the microphone hear the synthesized voice.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod channel;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod controller;
pub mod conversation;
pub mod defaults;
pub mod engine;
pub mod error;
pub mod machine;
pub mod session;
pub mod speech;
pub mod timer;
pub mod voice;

// Console composition root - needs every optional surface
#[cfg(all(feature = "cli", feature = "ws", feature = "http"))]
pub mod app;

// Ports
pub use channel::ConversationChannel;
pub use engine::SessionService;
pub use speech::{SpeechInput, SpeechOutput};

// Runtime
pub use controller::{
    ControllerHandle, ControllerSettings, ControllerUpdate, EventSink, Ports, Snapshot,
    event_channel, spawn,
};
pub use machine::{VoiceMachine, VoiceMode};

// Error handling
pub use error::{CoraError, Result};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
