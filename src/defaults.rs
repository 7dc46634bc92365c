//! Default configuration constants for coravoice.
//!
//! Shared by [`crate::config::Config`] and [`crate::machine::MachineConfig`] so the
//! file defaults and the built-in defaults never drift apart.

/// Maximum number of times a `synthesis-failed` utterance is resubmitted.
pub const MAX_SPEECH_RETRIES: u32 = 2;

/// Delay before a failed utterance is resubmitted, in milliseconds.
pub const RETRY_BACKOFF_MS: u64 = 500;

/// Quiet period after synthesized speech ends before the microphone re-arms.
///
/// Lets trailing playback and room echo die out so capture does not transcribe
/// the agent's own voice.
pub const QUIET_PERIOD_MS: u64 = 1000;

/// Consecutive fatal recognition errors tolerated before voice mode is switched off.
pub const MAX_CAPTURE_ERRORS: u32 = 3;

/// Recognition locale. Its language prefix also filters the voice catalog.
pub const DEFAULT_LOCALE: &str = "en-US";

/// Session service base URL.
pub const DEFAULT_ENGINE_URL: &str = "http://127.0.0.1:5000/api";

/// Conversation channel URL.
pub const DEFAULT_CHANNEL_URL: &str = "ws://127.0.0.1:5000/ws";

/// First redial delay after the conversation channel drops; doubles per failed attempt.
pub const CHANNEL_RECONNECT_BASE_MS: u64 = 500;

/// Ceiling for the channel redial delay.
pub const CHANNEL_RECONNECT_MAX_MS: u64 = 10_000;

/// Timeout for session service requests. Analysis runs a model, so it is generous.
pub const REQUEST_TIMEOUT_SECS: u64 = 60;

/// Recognition error code that only means "nothing was heard".
pub const NO_SPEECH_CODE: &str = "no-speech";

/// Synthesis error code that is worth retrying with another voice.
pub const SYNTHESIS_FAILED_CODE: &str = "synthesis-failed";

/// Synthesis error code reported when playback is cut short by `cancel()`.
pub const INTERRUPTED_CODE: &str = "interrupted";

/// Words per minute of the console speaker at rate 1.0.
pub const CONSOLE_WORDS_PER_MINUTE: f32 = 150.0;
