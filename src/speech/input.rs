//! Speech input port: continuous capture turned into discrete phrases.

use crate::defaults::NO_SPEECH_CODE;
use crate::error::Result;

/// Recognizer callbacks, delivered through the controller's event sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechInputEvent {
    Started,
    /// Most recent recognized phrase at an utterance boundary.
    Result(String),
    Error(String),
    Ended,
}

/// How a recognition error code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecognitionFailure {
    /// Nothing was heard. Capture continues.
    Transient,
    /// Reported after our own `stop()`.
    Aborted,
    Fatal,
}

impl RecognitionFailure {
    pub fn classify(code: &str) -> Self {
        match code {
            NO_SPEECH_CODE => RecognitionFailure::Transient,
            "aborted" => RecognitionFailure::Aborted,
            _ => RecognitionFailure::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, RecognitionFailure::Fatal)
    }
}

/// Speech-to-text engine with a fixed recognition locale.
///
/// `start` and `stop` are fire-and-forget and may race with the engine's own
/// end-of-capture; the state machine tolerates late `Started`/`Ended` events.
pub trait SpeechInput: Send + Sync {
    fn start(&self) -> Result<()>;

    fn stop(&self);

    fn locale(&self) -> &str;

    fn is_available(&self) -> bool {
        true
    }
}
