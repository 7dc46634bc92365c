//! Speech output port: one utterance in, one playback session out.

use crate::defaults::{INTERRUPTED_CODE, SYNTHESIS_FAILED_CODE};
use crate::error::Result;
use crate::session::Mood;
use crate::voice::catalog::Voice;
use std::fmt;

/// Identifies one dispatched utterance so late driver events can be matched
/// (or discarded) after a cancel or a newer request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UtteranceId(pub u64);

impl fmt::Display for UtteranceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.0)
    }
}

/// One request to the speech engine. Built fresh per attempt, never mutated after dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct UtteranceRequest {
    pub id: UtteranceId,
    pub text: String,
    /// Speaking rate multiplier, 1.0 = engine default.
    pub rate: f32,
    /// Pitch multiplier, 1.0 = engine default.
    pub pitch: f32,
    /// `None` lets the engine use its default voice.
    pub voice: Option<Voice>,
    pub lang: String,
}

impl UtteranceRequest {
    /// Build a request with prosody derived from `mood`.
    pub fn new(
        id: UtteranceId,
        text: impl Into<String>,
        mood: Mood,
        voice: Option<Voice>,
        lang: impl Into<String>,
    ) -> Self {
        Self {
            id,
            text: text.into(),
            rate: mood.rate(),
            pitch: mood.pitch(),
            voice,
            lang: lang.into(),
        }
    }
}

/// Outcome of a dispatched utterance: at most one `Started`, then exactly
/// one of `Ended` or `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpeechOutputEvent {
    Started(UtteranceId),
    Ended(UtteranceId),
    Error(UtteranceId, String),
}

impl SpeechOutputEvent {
    pub fn utterance(&self) -> UtteranceId {
        match self {
            SpeechOutputEvent::Started(id)
            | SpeechOutputEvent::Ended(id)
            | SpeechOutputEvent::Error(id, _) => *id,
        }
    }
}

/// How a synthesis error code is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SynthesisFailure {
    /// Worth resubmitting with a different voice.
    Retryable,
    /// Playback was cut short by a cancel; not a fault.
    Interrupted,
    /// Give up on audio for this utterance.
    Terminal,
}

impl SynthesisFailure {
    pub fn classify(code: &str) -> Self {
        match code {
            SYNTHESIS_FAILED_CODE => SynthesisFailure::Retryable,
            INTERRUPTED_CODE | "canceled" => SynthesisFailure::Interrupted,
            _ => SynthesisFailure::Terminal,
        }
    }
}

/// Text-to-speech engine.
///
/// `speak` and `cancel` are fire-and-forget: outcomes are reported later as
/// [`SpeechOutputEvent`]s through the controller's event sink.
pub trait SpeechOutput: Send + Sync {
    /// Voices the engine offers.
    fn voices(&self) -> Vec<Voice>;

    /// Begin playback. Claims the output device until a terminal event fires.
    fn speak(&self, request: UtteranceRequest) -> Result<()>;

    /// Abort any in-flight utterance. No-op when nothing is playing.
    fn cancel(&self);

    /// Whether the capability exists on this client at all.
    fn is_available(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_synthesis_errors() {
        assert_eq!(
            SynthesisFailure::classify("synthesis-failed"),
            SynthesisFailure::Retryable
        );
        assert_eq!(
            SynthesisFailure::classify("interrupted"),
            SynthesisFailure::Interrupted
        );
        assert_eq!(
            SynthesisFailure::classify("canceled"),
            SynthesisFailure::Interrupted
        );
        assert_eq!(
            SynthesisFailure::classify("audio-busy"),
            SynthesisFailure::Terminal
        );
    }

    #[test]
    fn test_request_takes_mood_prosody() {
        let req = UtteranceRequest::new(UtteranceId(3), "Hi", Mood::Impatient, None, "en-US");
        assert_eq!(req.rate, 1.3);
        assert_eq!(req.pitch, 1.1);
        assert_eq!(req.id, UtteranceId(3));
        assert!(req.voice.is_none());
    }

    #[test]
    fn test_event_utterance() {
        let ev = SpeechOutputEvent::Error(UtteranceId(9), "x".into());
        assert_eq!(ev.utterance(), UtteranceId(9));
    }
}
