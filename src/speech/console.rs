//! Terminal stand-ins for the speech engines.
//!
//! `ConsoleSpeaker` "plays" an utterance by printing it and holding the output
//! device for as long as reading it aloud would take. `ScriptedInput` is a
//! recognizer fed by the console's `/say` command.

use crate::controller::EventSink;
use crate::defaults::{CONSOLE_WORDS_PER_MINUTE, INTERRUPTED_CODE, SYNTHESIS_FAILED_CODE};
use crate::error::Result;
use crate::speech::input::{SpeechInput, SpeechInputEvent};
use crate::speech::output::{SpeechOutput, SpeechOutputEvent, UtteranceId, UtteranceRequest};
use crate::voice::catalog::{Voice, builtin_voices};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

const MIN_PLAYBACK: Duration = Duration::from_millis(300);
const MAX_PLAYBACK: Duration = Duration::from_secs(8);

/// Simulated reading time for `text` at `rate`.
pub fn playback_duration(text: &str, rate: f32) -> Duration {
    let words = text.split_whitespace().count() as f32;
    let rate = if rate > 0.0 { rate } else { 1.0 };
    let secs = words * 60.0 / (CONSOLE_WORDS_PER_MINUTE * rate);
    Duration::from_secs_f32(secs).clamp(MIN_PLAYBACK, MAX_PLAYBACK)
}

struct Playback {
    id: UtteranceId,
    task: JoinHandle<()>,
}

/// Speech output that prints instead of playing audio.
pub struct ConsoleSpeaker {
    sink: EventSink,
    voices: Vec<Voice>,
    broken: Vec<String>,
    echo: bool,
    current: Mutex<Option<Playback>>,
}

impl ConsoleSpeaker {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            voices: builtin_voices(),
            broken: Vec::new(),
            echo: true,
            current: Mutex::new(None),
        }
    }

    /// Voices that always report `synthesis-failed`, for exercising the retry path.
    pub fn with_broken_voices(mut self, names: Vec<String>) -> Self {
        self.broken = names;
        self
    }

    pub fn with_echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    fn interrupt_current(&self) {
        let previous = self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(playback) = previous
            && !playback.task.is_finished()
        {
            playback.task.abort();
            debug!(utterance = %playback.id, "console playback interrupted");
            self.sink.speech_output(SpeechOutputEvent::Error(
                playback.id,
                INTERRUPTED_CODE.to_string(),
            ));
        }
    }
}

impl SpeechOutput for ConsoleSpeaker {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, request: UtteranceRequest) -> Result<()> {
        self.interrupt_current();

        let voice_name = request
            .voice
            .as_ref()
            .map(|v| v.name.clone())
            .unwrap_or_else(|| "default voice".to_string());
        let id = request.id;
        let sink = self.sink.clone();

        if self.broken.iter().any(|name| *name == voice_name) {
            let task = tokio::spawn(async move {
                sink.speech_output(SpeechOutputEvent::Error(
                    id,
                    SYNTHESIS_FAILED_CODE.to_string(),
                ));
            });
            *self
                .current
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Playback { id, task });
            return Ok(());
        }

        if self.echo {
            println!(
                "  [speaking as {} at {:.1}x / pitch {:.1}] {}",
                voice_name, request.rate, request.pitch, request.text
            );
        }

        let duration = playback_duration(&request.text, request.rate);
        let task = tokio::spawn(async move {
            sink.speech_output(SpeechOutputEvent::Started(id));
            tokio::time::sleep(duration).await;
            sink.speech_output(SpeechOutputEvent::Ended(id));
        });
        *self
            .current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Playback { id, task });
        Ok(())
    }

    fn cancel(&self) {
        self.interrupt_current();
    }
}

/// Recognizer driven by typed phrases.
///
/// Phrases only get through while capture is running, like a microphone that
/// cannot hear while stopped.
pub struct ScriptedInput {
    sink: EventSink,
    locale: String,
    running: AtomicBool,
}

impl ScriptedInput {
    pub fn new(sink: EventSink, locale: impl Into<String>) -> Self {
        Self {
            sink,
            locale: locale.into(),
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Deliver a recognized phrase. Returns false when capture is stopped.
    pub fn hear(&self, phrase: &str) -> bool {
        if !self.is_running() {
            debug!("scripted phrase dropped: capture stopped");
            return false;
        }
        self.sink
            .speech_input(SpeechInputEvent::Result(phrase.to_string()));
        true
    }

    /// Report a recognizer error code, e.g. "network".
    pub fn fail(&self, code: &str) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.sink
                .speech_input(SpeechInputEvent::Error(code.to_string()));
            self.sink.speech_input(SpeechInputEvent::Ended);
        }
    }
}

impl SpeechInput for ScriptedInput {
    fn start(&self) -> Result<()> {
        if !self.running.swap(true, Ordering::SeqCst) {
            self.sink.speech_input(SpeechInputEvent::Started);
        }
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            self.sink.speech_input(SpeechInputEvent::Ended);
        }
    }

    fn locale(&self) -> &str {
        &self.locale
    }
}
