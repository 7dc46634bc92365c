//! Voice interaction state machine.
//!
//! The machine is a pure transition function: [`VoiceMachine::handle`] takes one
//! event, updates the authoritative mode and returns the side effects the
//! controller must carry out, in order. It never touches a driver, a clock or
//! the network, so every ordering rule below is testable without hardware.
//!
//! Two flags are tracked apart from the mode because they are what the
//! feedback-avoidance rule is about:
//! - `capture_armed`: the machine has asked the recognizer to run;
//!   until the recognizer confirms with `InputStarted`, an `InputEnded` is
//!   taken to belong to an earlier `stop()` and is ignored;
//! - `speaking`: an utterance has been dispatched and has not yet ended.
//!
//! They are never both true. Entering speech disarms capture first, and after
//! speech ends capture is only re-armed by the quiet-period timer.

use crate::defaults::{MAX_CAPTURE_ERRORS, MAX_SPEECH_RETRIES, QUIET_PERIOD_MS, RETRY_BACKOFF_MS};
use crate::speech::input::RecognitionFailure;
use crate::speech::output::{SynthesisFailure, UtteranceId};
use crate::timer::TimerToken;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Authoritative voice mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VoiceMode {
    /// Voice mode off. Capture never runs.
    #[default]
    Inactive,
    /// Awaiting a phrase (capture may still be waiting out the quiet period).
    Listening,
    /// A message was submitted; awaiting the reply.
    Processing,
    /// Output device claimed, or a synthesis retry is pending.
    Speaking,
    Paused,
    /// Transient recognizer fault; recovers on the next good driver event.
    Error,
}

impl VoiceMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoiceMode::Inactive => "inactive",
            VoiceMode::Listening => "listening",
            VoiceMode::Processing => "processing",
            VoiceMode::Speaking => "speaking",
            VoiceMode::Paused => "paused",
            VoiceMode::Error => "error",
        }
    }

    /// Status-line text.
    pub fn description(&self) -> &'static str {
        match self {
            VoiceMode::Inactive => "Inactive",
            VoiceMode::Listening => "Listening...",
            VoiceMode::Processing => "Processing...",
            VoiceMode::Speaking => "Cora speaking...",
            VoiceMode::Paused => "Paused",
            VoiceMode::Error => "Error - retrying...",
        }
    }
}

impl fmt::Display for VoiceMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Timing and retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineConfig {
    /// Delay between the end of speech and re-arming capture.
    pub quiet_period: Duration,
    /// Delay before a `synthesis-failed` utterance is resubmitted.
    pub retry_backoff: Duration,
    pub max_speech_retries: u32,
    /// Consecutive fatal recognition errors before voice mode switches off.
    pub max_capture_errors: u32,
    /// Speak agent replies (independent of voice mode).
    pub auto_speak: bool,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            quiet_period: Duration::from_millis(QUIET_PERIOD_MS),
            retry_backoff: Duration::from_millis(RETRY_BACKOFF_MS),
            max_speech_retries: MAX_SPEECH_RETRIES,
            max_capture_errors: MAX_CAPTURE_ERRORS,
            auto_speak: true,
        }
    }
}

/// Everything that can move the machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    SessionStarted,
    SessionEnded,
    VoiceToggled(bool),
    /// Typed text was accepted by the lifecycle manager and sent.
    TextSubmitted,
    InputStarted,
    InputResult(String),
    InputError(String),
    InputEnded,
    /// Reply for the current session, already appended to the transcript.
    AgentReply(String),
    ChannelFailed,
    SpeechStarted(UtteranceId),
    SpeechEnded(UtteranceId),
    SpeechFailed(UtteranceId, String),
    Pause,
    Resume,
    TimerFired(TimerToken),
}

/// Side effects, to be performed in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    StartCapture,
    StopCapture,
    Speak {
        utterance: UtteranceId,
        text: String,
        /// 0 for the first attempt, then the retry number.
        attempt: u32,
    },
    CancelSpeech,
    /// Drop the session voice lock so the next attempt re-selects.
    ClearVoiceLock,
    /// Send a recognized phrase through the lifecycle manager.
    Submit(String),
    Schedule {
        token: TimerToken,
        delay: Duration,
    },
    CancelTimer(TimerToken),
    Notice(String),
    ModeChanged {
        from: VoiceMode,
        to: VoiceMode,
    },
}

#[derive(Debug, Clone)]
struct Utterance {
    id: UtteranceId,
    text: String,
}

#[derive(Debug, Clone)]
struct PendingRetry {
    token: TimerToken,
    text: String,
}

/// The voice interaction state machine.
#[derive(Debug)]
pub struct VoiceMachine {
    config: MachineConfig,
    mode: VoiceMode,
    session_active: bool,
    voice_enabled: bool,
    capture_armed: bool,
    start_pending: bool,
    speaking: Option<Utterance>,
    retry: Option<PendingRetry>,
    retries: u32,
    capture_errors: u32,
    rearm: Option<TimerToken>,
    next_token: u64,
    next_utterance: u64,
}

impl VoiceMachine {
    pub fn new(config: MachineConfig) -> Self {
        Self {
            config,
            mode: VoiceMode::Inactive,
            session_active: false,
            voice_enabled: false,
            capture_armed: false,
            start_pending: false,
            speaking: None,
            retry: None,
            retries: 0,
            capture_errors: 0,
            rearm: None,
            next_token: 0,
            next_utterance: 0,
        }
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn mode(&self) -> VoiceMode {
        self.mode
    }

    pub fn session_active(&self) -> bool {
        self.session_active
    }

    pub fn voice_enabled(&self) -> bool {
        self.voice_enabled
    }

    pub fn auto_speak(&self) -> bool {
        self.config.auto_speak
    }

    pub fn set_auto_speak(&mut self, on: bool) {
        self.config.auto_speak = on;
    }

    pub fn capture_armed(&self) -> bool {
        self.capture_armed
    }

    /// An utterance is in flight on the output device.
    pub fn is_speaking(&self) -> bool {
        self.speaking.is_some()
    }

    pub fn current_utterance(&self) -> Option<UtteranceId> {
        self.speaking.as_ref().map(|u| u.id)
    }

    pub fn retry_count(&self) -> u32 {
        self.retries
    }

    pub fn retry_pending(&self) -> bool {
        self.retry.is_some()
    }

    pub fn rearm_pending(&self) -> bool {
        self.rearm.is_some()
    }

    pub fn capture_errors(&self) -> u32 {
        self.capture_errors
    }

    /// Apply one event and return the effects to perform.
    pub fn handle(&mut self, event: Event) -> Vec<Effect> {
        let mut fx = Vec::new();
        match event {
            Event::SessionStarted => self.on_session_started(&mut fx),
            Event::SessionEnded => self.on_session_ended(&mut fx),
            Event::VoiceToggled(on) => self.on_voice_toggled(on, &mut fx),
            Event::TextSubmitted => self.on_text_submitted(&mut fx),
            Event::InputStarted => self.on_input_started(&mut fx),
            Event::InputResult(text) => self.on_input_result(text, &mut fx),
            Event::InputError(code) => self.on_input_error(&code, &mut fx),
            Event::InputEnded => self.on_input_ended(&mut fx),
            Event::AgentReply(text) => self.on_agent_reply(text, &mut fx),
            Event::ChannelFailed => {
                if matches!(self.mode, VoiceMode::Processing) {
                    self.settle("channel error", &mut fx);
                }
            }
            Event::SpeechStarted(id) => {
                if self.is_current(id) {
                    self.retries = 0;
                } else {
                    debug!(utterance = %id, "stale speech start ignored");
                }
            }
            Event::SpeechEnded(id) => {
                if self.is_current(id) {
                    self.speaking = None;
                    self.retries = 0;
                    self.after_speech("speech ended", &mut fx);
                } else {
                    debug!(utterance = %id, "stale speech end ignored");
                }
            }
            Event::SpeechFailed(id, code) => self.on_speech_failed(id, &code, &mut fx),
            Event::Pause => self.on_pause(&mut fx),
            Event::Resume => self.on_resume(&mut fx),
            Event::TimerFired(token) => self.on_timer(token, &mut fx),
        }
        debug_assert!(
            !(self.capture_armed && self.speaking.is_some()),
            "capture and speech armed together"
        );
        fx
    }

    fn on_session_started(&mut self, fx: &mut Vec<Effect>) {
        self.quiesce(fx);
        self.session_active = true;
        self.capture_errors = 0;
        if self.voice_enabled {
            self.arm_capture(fx);
            self.set_mode(VoiceMode::Listening, "session started", fx);
        } else {
            self.set_mode(VoiceMode::Inactive, "session started", fx);
        }
    }

    fn on_session_ended(&mut self, fx: &mut Vec<Effect>) {
        if !self.session_active {
            debug!("end ignored: no active session");
            return;
        }
        self.halt(fx);
        self.session_active = false;
        self.voice_enabled = false;
        self.capture_errors = 0;
        self.set_mode(VoiceMode::Inactive, "session ended", fx);
    }

    fn on_voice_toggled(&mut self, on: bool, fx: &mut Vec<Effect>) {
        if on {
            if !self.session_active {
                fx.push(Effect::Notice(
                    "Start a conversation before enabling voice mode".to_string(),
                ));
                return;
            }
            if self.voice_enabled {
                return;
            }
            self.voice_enabled = true;
            self.capture_errors = 0;
            match self.mode {
                VoiceMode::Inactive | VoiceMode::Error | VoiceMode::Listening => {
                    self.cancel_rearm(fx);
                    self.arm_capture(fx);
                    self.set_mode(VoiceMode::Listening, "voice on", fx);
                }
                VoiceMode::Processing => self.arm_capture(fx),
                // Speech re-arms capture through the quiet period; resume re-arms after a pause.
                VoiceMode::Speaking | VoiceMode::Paused => {}
            }
        } else {
            if !self.voice_enabled {
                return;
            }
            self.voice_enabled = false;
            self.cancel_rearm(fx);
            self.disarm_capture(fx);
            self.silence(fx);
            if self.mode != VoiceMode::Paused {
                self.set_mode(VoiceMode::Inactive, "voice off", fx);
            }
        }
    }

    fn on_text_submitted(&mut self, fx: &mut Vec<Effect>) {
        match self.mode {
            VoiceMode::Inactive | VoiceMode::Listening | VoiceMode::Error => {
                self.set_mode(VoiceMode::Processing, "text submitted", fx);
            }
            _ => debug!(mode = %self.mode, "typed message sent without a mode change"),
        }
    }

    fn on_input_started(&mut self, fx: &mut Vec<Effect>) {
        self.capture_errors = 0;
        self.start_pending = false;
        if !self.capture_armed {
            debug!("recognizer started while disarmed; stopping it");
            fx.push(Effect::StopCapture);
            return;
        }
        if self.mode == VoiceMode::Error {
            self.set_mode(VoiceMode::Listening, "recognizer recovered", fx);
        }
    }

    fn on_input_result(&mut self, text: String, fx: &mut Vec<Effect>) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.mode != VoiceMode::Listening || !self.capture_armed || !self.session_active {
            debug!(mode = %self.mode, armed = self.capture_armed, "recognized phrase dropped");
            return;
        }
        self.capture_errors = 0;
        self.set_mode(VoiceMode::Processing, "phrase recognized", fx);
        fx.push(Effect::Submit(text.to_string()));
    }

    fn on_input_error(&mut self, code: &str, fx: &mut Vec<Effect>) {
        let failure = RecognitionFailure::classify(code);
        if !failure.is_fatal() {
            debug!(code, "recognition error ignored");
            return;
        }
        if self.mode == VoiceMode::Paused || !self.capture_armed {
            debug!(code, mode = %self.mode, "late recognition error ignored");
            return;
        }

        self.capture_armed = false;
        self.start_pending = false;
        fx.push(Effect::StopCapture);
        self.capture_errors += 1;
        fx.push(Effect::Notice(format!("Speech recognition error: {}", code)));

        if self.capture_errors >= self.config.max_capture_errors {
            warn!(errors = self.capture_errors, "too many recognition errors; voice off");
            self.voice_enabled = false;
            self.cancel_rearm(fx);
            fx.push(Effect::Notice(format!(
                "Voice mode turned off after {} recognition errors",
                self.capture_errors
            )));
            self.set_mode(VoiceMode::Inactive, "recognition failing", fx);
        } else {
            self.set_mode(VoiceMode::Error, "recognition error", fx);
            self.schedule_rearm(fx);
        }
    }

    fn on_input_ended(&mut self, fx: &mut Vec<Effect>) {
        if !self.capture_armed {
            return;
        }
        if self.start_pending {
            debug!("recognizer end from an earlier stop ignored");
            return;
        }
        let may_restart = self.voice_enabled
            && self.speaking.is_none()
            && matches!(
                self.mode,
                VoiceMode::Listening | VoiceMode::Processing | VoiceMode::Error
            );
        if may_restart {
            debug!("recognizer ended on its own; restarting");
            self.start_pending = true;
            fx.push(Effect::StartCapture);
        } else {
            self.capture_armed = false;
        }
    }

    fn on_agent_reply(&mut self, text: String, fx: &mut Vec<Effect>) {
        if !self.session_active {
            debug!("reply ignored: no active session");
            return;
        }
        if self.mode == VoiceMode::Paused {
            debug!("reply kept silent while paused");
            return;
        }
        if self.config.auto_speak && !text.trim().is_empty() {
            self.begin_speech(text, fx);
        } else if matches!(self.mode, VoiceMode::Processing | VoiceMode::Error) {
            self.settle("reply received", fx);
        }
    }

    fn on_speech_failed(&mut self, id: UtteranceId, code: &str, fx: &mut Vec<Effect>) {
        if !self.is_current(id) {
            debug!(utterance = %id, code, "stale speech error ignored");
            return;
        }
        let Some(utterance) = self.speaking.take() else {
            return;
        };
        match SynthesisFailure::classify(code) {
            SynthesisFailure::Retryable if self.retries < self.config.max_speech_retries => {
                self.retries += 1;
                warn!(
                    attempt = self.retries,
                    max = self.config.max_speech_retries,
                    "synthesis failed; retrying with another voice"
                );
                fx.push(Effect::ClearVoiceLock);
                let token = self.token();
                self.retry = Some(PendingRetry {
                    token,
                    text: utterance.text,
                });
                fx.push(Effect::Schedule {
                    token,
                    delay: self.config.retry_backoff,
                });
            }
            SynthesisFailure::Retryable => {
                warn!(retries = self.retries, "synthesis retries exhausted");
                self.retries = 0;
                fx.push(Effect::Notice(
                    "Speech failed repeatedly; continuing in text only".to_string(),
                ));
                self.after_speech("speech failed", fx);
            }
            SynthesisFailure::Interrupted => {
                self.retries = 0;
                self.after_speech("speech interrupted", fx);
            }
            SynthesisFailure::Terminal => {
                self.retries = 0;
                fx.push(Effect::Notice(format!(
                    "Speech unavailable ({}); continuing in text only",
                    code
                )));
                self.after_speech("speech failed", fx);
            }
        }
    }

    fn on_pause(&mut self, fx: &mut Vec<Effect>) {
        if !self.session_active || self.mode == VoiceMode::Paused {
            return;
        }
        self.halt(fx);
        self.set_mode(VoiceMode::Paused, "paused", fx);
    }

    fn on_resume(&mut self, fx: &mut Vec<Effect>) {
        if self.mode != VoiceMode::Paused {
            return;
        }
        if self.voice_enabled {
            self.arm_capture(fx);
            self.set_mode(VoiceMode::Listening, "resumed", fx);
        } else {
            self.set_mode(VoiceMode::Inactive, "resumed", fx);
        }
    }

    fn on_timer(&mut self, token: TimerToken, fx: &mut Vec<Effect>) {
        if self.rearm == Some(token) {
            self.rearm = None;
            let ready = self.session_active
                && self.voice_enabled
                && self.speaking.is_none()
                && self.retry.is_none()
                && matches!(
                    self.mode,
                    VoiceMode::Listening | VoiceMode::Processing | VoiceMode::Error
                );
            if ready {
                self.arm_capture(fx);
            } else {
                debug!(%token, mode = %self.mode, "quiet period over; capture stays off");
            }
        } else if self.retry.as_ref().is_some_and(|r| r.token == token) {
            let Some(retry) = self.retry.take() else {
                return;
            };
            if self.session_active && self.mode == VoiceMode::Speaking {
                self.dispatch(retry.text, fx);
            } else {
                debug!(%token, "retry dropped: speech no longer wanted");
            }
        } else {
            debug!(%token, "stale timer ignored");
        }
    }

    // ---- helpers ----

    fn is_current(&self, id: UtteranceId) -> bool {
        self.speaking.as_ref().is_some_and(|u| u.id == id)
    }

    fn token(&mut self) -> TimerToken {
        self.next_token += 1;
        TimerToken(self.next_token)
    }

    fn set_mode(&mut self, to: VoiceMode, cause: &'static str, fx: &mut Vec<Effect>) {
        if self.mode == to {
            return;
        }
        let from = self.mode;
        info!(%from, %to, cause, "voice mode changed");
        self.mode = to;
        fx.push(Effect::ModeChanged { from, to });
    }

    fn arm_capture(&mut self, fx: &mut Vec<Effect>) {
        if !self.capture_armed {
            self.capture_armed = true;
            self.start_pending = true;
            fx.push(Effect::StartCapture);
        }
    }

    fn disarm_capture(&mut self, fx: &mut Vec<Effect>) {
        if self.capture_armed {
            self.capture_armed = false;
            self.start_pending = false;
            fx.push(Effect::StopCapture);
        }
    }

    fn cancel_rearm(&mut self, fx: &mut Vec<Effect>) {
        if let Some(token) = self.rearm.take() {
            fx.push(Effect::CancelTimer(token));
        }
    }

    fn schedule_rearm(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_rearm(fx);
        let token = self.token();
        self.rearm = Some(token);
        fx.push(Effect::Schedule {
            token,
            delay: self.config.quiet_period,
        });
    }

    /// Stop any speech in flight or pending retry.
    fn silence(&mut self, fx: &mut Vec<Effect>) {
        let had_retry = self.retry.is_some();
        if let Some(retry) = self.retry.take() {
            fx.push(Effect::CancelTimer(retry.token));
        }
        if self.speaking.take().is_some() || had_retry {
            fx.push(Effect::CancelSpeech);
        }
        self.retries = 0;
    }

    /// Release every resource the machine holds, but only emit what is needed.
    fn quiesce(&mut self, fx: &mut Vec<Effect>) {
        self.cancel_rearm(fx);
        self.silence(fx);
        self.disarm_capture(fx);
    }

    /// Unconditional stop for pause and end.
    fn halt(&mut self, fx: &mut Vec<Effect>) {
        self.quiesce(fx);
        if !fx.contains(&Effect::CancelSpeech) {
            fx.push(Effect::CancelSpeech);
        }
        if !fx.contains(&Effect::StopCapture) {
            fx.push(Effect::StopCapture);
        }
    }

    fn begin_speech(&mut self, text: String, fx: &mut Vec<Effect>) {
        self.cancel_rearm(fx);
        self.disarm_capture(fx);
        self.silence(fx);
        self.set_mode(VoiceMode::Speaking, "reply received", fx);
        self.dispatch(text, fx);
    }

    fn dispatch(&mut self, text: String, fx: &mut Vec<Effect>) {
        self.next_utterance += 1;
        let id = UtteranceId(self.next_utterance);
        self.speaking = Some(Utterance {
            id,
            text: text.clone(),
        });
        fx.push(Effect::Speak {
            utterance: id,
            text,
            attempt: self.retries,
        });
    }

    /// Leave speaking: back to listening after the quiet period, or inactive.
    fn after_speech(&mut self, cause: &'static str, fx: &mut Vec<Effect>) {
        if self.voice_enabled && self.session_active {
            self.set_mode(VoiceMode::Listening, cause, fx);
            self.schedule_rearm(fx);
        } else {
            self.set_mode(VoiceMode::Inactive, cause, fx);
        }
    }

    /// Leave processing without speaking.
    fn settle(&mut self, cause: &'static str, fx: &mut Vec<Effect>) {
        if self.voice_enabled {
            if self.rearm.is_none() {
                self.arm_capture(fx);
            }
            self.set_mode(VoiceMode::Listening, cause, fx);
        } else {
            self.disarm_capture(fx);
            self.set_mode(VoiceMode::Inactive, cause, fx);
        }
    }
}
