//! Runtime for the voice machine.
//!
//! One tokio task owns the machine, the conversation and the ports. Commands
//! from [`ControllerHandle`] and callbacks from drivers, the channel and timers
//! all arrive on one unbounded queue and are processed strictly one at a time.
//! Slow session-service calls run in their own tasks and re-enter the queue
//! with their result, so the loop itself never blocks.

use crate::channel::{ChannelEvent, ConnectionState, ConversationChannel, OutboundMessage};
use crate::config::Config;
use crate::conversation::{Conversation, STARTED_NOTICE};
use crate::engine::{AnalysisReport, SessionService};
use crate::error::{CoraError, Result};
use crate::machine::{Effect, Event, MachineConfig, VoiceMachine, VoiceMode};
use crate::session::{Message, Mood, Scenario, SessionId};
use crate::speech::input::{SpeechInput, SpeechInputEvent};
use crate::speech::output::{SpeechOutput, SpeechOutputEvent, UtteranceId, UtteranceRequest};
use crate::timer::{TimerToken, Timers};
use crate::voice::catalog::{Quality, Voice};
use crate::voice::select::{VoicePreference, VoiceRequest, select_voice};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

const UPDATE_CAPACITY: usize = 256;

/// Driver, channel and timer callbacks.
#[derive(Debug)]
pub(crate) enum DriverEvent {
    Input(SpeechInputEvent),
    Output(SpeechOutputEvent),
    Channel(ChannelEvent),
    Timer(TimerToken),
}

pub(crate) enum Command {
    StartNew {
        mood: Mood,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    Created {
        mood: Mood,
        result: Result<SessionId>,
        reply: oneshot::Sender<Result<SessionId>>,
    },
    SendText {
        text: String,
        reply: oneshot::Sender<bool>,
    },
    LoadScenario {
        scenario: Scenario,
        reply: oneshot::Sender<bool>,
    },
    SetVoice {
        on: bool,
        reply: oneshot::Sender<bool>,
    },
    SetAutoSpeak(bool),
    Pause(oneshot::Sender<Result<()>>),
    Resume(oneshot::Sender<Result<()>>),
    End(oneshot::Sender<bool>),
    Analyze(oneshot::Sender<Result<AnalysisReport>>),
    Snapshot(oneshot::Sender<Snapshot>),
    Shutdown,
}

pub(crate) enum Input {
    Command(Command),
    Event(DriverEvent),
}

/// Receiving end of the controller queue. Hand it to [`spawn`].
pub struct Inbox(mpsc::UnboundedReceiver<Input>);

impl Inbox {
    #[cfg(test)]
    pub(crate) fn try_recv(&mut self) -> std::result::Result<Input, mpsc::error::TryRecvError> {
        self.0.try_recv()
    }

    pub(crate) async fn recv(&mut self) -> Option<Input> {
        self.0.recv().await
    }
}

/// Where drivers, the channel and timers report what happened.
#[derive(Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Input>,
}

impl EventSink {
    fn push(&self, input: Input) {
        if self.tx.send(input).is_err() {
            trace!("controller gone; event dropped");
        }
    }

    pub fn speech_input(&self, event: SpeechInputEvent) {
        self.push(Input::Event(DriverEvent::Input(event)));
    }

    pub fn speech_output(&self, event: SpeechOutputEvent) {
        self.push(Input::Event(DriverEvent::Output(event)));
    }

    pub fn channel(&self, event: ChannelEvent) {
        self.push(Input::Event(DriverEvent::Channel(event)));
    }

    pub(crate) fn timer_fired(&self, token: TimerToken) {
        self.push(Input::Event(DriverEvent::Timer(token)));
    }
}

/// Create the controller queue. Drivers get clones of the sink before the
/// controller itself is spawned.
pub fn event_channel() -> (EventSink, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (EventSink { tx }, Inbox(rx))
}

/// The external collaborators.
#[derive(Clone)]
pub struct Ports {
    pub input: Arc<dyn SpeechInput>,
    pub output: Arc<dyn SpeechOutput>,
    pub channel: Arc<dyn ConversationChannel>,
    pub sessions: Arc<dyn SessionService>,
}

/// Voice resolution inputs that stay fixed for the controller's lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct VoiceSettings {
    pub preference: VoicePreference,
    pub quality: Quality,
}

impl Default for VoiceSettings {
    fn default() -> Self {
        Self {
            preference: VoicePreference::Random,
            quality: Quality::Premium,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ControllerSettings {
    pub machine: MachineConfig,
    pub voice: VoiceSettings,
    /// Fixed seed for random voice choice; entropy when `None`.
    pub rng_seed: Option<u64>,
}

impl ControllerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            machine: config.machine_config(),
            voice: VoiceSettings {
                preference: config.voice.preference.clone(),
                quality: config.voice.quality,
            },
            rng_seed: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Info,
    Warning,
    Error,
}

/// Broadcast to every subscriber, in processing order.
#[derive(Debug, Clone, PartialEq)]
pub enum ControllerUpdate {
    ModeChanged { from: VoiceMode, to: VoiceMode },
    MessageAppended(Message),
    Notice { level: NoticeLevel, message: String },
    Connection(ConnectionState),
    SessionStarted { id: SessionId, mood: Mood },
    SessionEnded { id: SessionId },
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub mode: VoiceMode,
    pub voice_enabled: bool,
    pub auto_speak: bool,
    /// Recognizer requested to run.
    pub capture_armed: bool,
    /// Utterance in flight on the output device.
    pub speaking: bool,
    pub retry_count: u32,
    pub retry_pending: bool,
    pub session_id: Option<SessionId>,
    pub active: bool,
    pub paused: bool,
    pub mood: Mood,
    pub voice_lock: Option<Voice>,
    pub connection: ConnectionState,
    pub transcript: Vec<Message>,
    pub pending_timers: usize,
}

impl Snapshot {
    /// User and agent messages in the transcript.
    pub fn exchange_count(&self) -> usize {
        self.transcript
            .iter()
            .filter(|m| m.role != crate::session::Role::System)
            .count()
    }
}

/// Cloneable front door to a running controller.
#[derive(Clone)]
pub struct ControllerHandle {
    tx: mpsc::UnboundedSender<Input>,
    updates: broadcast::Sender<ControllerUpdate>,
}

impl ControllerHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<ControllerUpdate> {
        self.updates.subscribe()
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(Input::Command(make(reply)))
            .map_err(|_| CoraError::ControllerClosed)?;
        rx.await.map_err(|_| CoraError::ControllerClosed)
    }

    /// Create a session on the engine and make it current.
    pub async fn start_new(&self, mood: Mood) -> Result<SessionId> {
        self.request(|reply| Command::StartNew { mood, reply })
            .await?
    }

    /// Send typed text. `false` when it was dropped (no open session, or blank).
    pub async fn send_text(&self, text: impl Into<String>) -> Result<bool> {
        let text = text.into();
        self.request(|reply| Command::SendText { text, reply }).await
    }

    pub async fn load_scenario(&self, scenario: Scenario) -> Result<bool> {
        self.request(|reply| Command::LoadScenario { scenario, reply })
            .await
    }

    /// Toggle voice mode. Returns whether the requested state took effect.
    pub async fn set_voice(&self, on: bool) -> Result<bool> {
        self.request(|reply| Command::SetVoice { on, reply }).await
    }

    pub fn set_auto_speak(&self, on: bool) -> Result<()> {
        self.tx
            .send(Input::Command(Command::SetAutoSpeak(on)))
            .map_err(|_| CoraError::ControllerClosed)
    }

    pub async fn pause(&self) -> Result<()> {
        self.request(Command::Pause).await?
    }

    pub async fn resume(&self) -> Result<()> {
        self.request(Command::Resume).await?
    }

    /// End the session. `false` when nothing was active.
    pub async fn end(&self) -> Result<bool> {
        self.request(Command::End).await
    }

    pub async fn analyze(&self) -> Result<AnalysisReport> {
        self.request(Command::Analyze).await?
    }

    pub async fn snapshot(&self) -> Result<Snapshot> {
        self.request(Command::Snapshot).await
    }

    /// Stop the controller after releasing both drivers.
    pub fn shutdown(&self) {
        if self.tx.send(Input::Command(Command::Shutdown)).is_err() {
            debug!("controller already stopped");
        }
    }
}

/// Start the controller task.
pub fn spawn(
    settings: ControllerSettings,
    ports: Ports,
    sink: EventSink,
    inbox: Inbox,
) -> (ControllerHandle, JoinHandle<()>) {
    let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
    let handle = ControllerHandle {
        tx: sink.tx.clone(),
        updates: updates.clone(),
    };
    let rng = match settings.rng_seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let controller = Controller {
        machine: VoiceMachine::new(settings.machine),
        conversation: Conversation::new(),
        voice: settings.voice,
        timers: Timers::new(sink.clone()),
        ports,
        sink,
        updates,
        rng,
        excluded: Vec::new(),
        last_voice: None,
        connection: ConnectionState::Disconnected,
    };
    let task = tokio::spawn(controller.run(inbox));
    (handle, task)
}

struct Controller {
    machine: VoiceMachine,
    conversation: Conversation,
    voice: VoiceSettings,
    timers: Timers,
    ports: Ports,
    sink: EventSink,
    updates: broadcast::Sender<ControllerUpdate>,
    rng: StdRng,
    /// Voices that failed in the current synthesis chain.
    excluded: Vec<String>,
    last_voice: Option<Voice>,
    connection: ConnectionState,
}

impl Controller {
    async fn run(mut self, mut inbox: Inbox) {
        info!("controller started");
        while let Some(input) = inbox.recv().await {
            match input {
                Input::Command(Command::Shutdown) => break,
                Input::Command(command) => self.command(command),
                Input::Event(event) => self.driver_event(event),
            }
        }
        self.ports.output.cancel();
        self.ports.input.stop();
        self.timers.cancel_all();
        info!("controller stopped");
    }

    fn publish(&self, update: ControllerUpdate) {
        if self.updates.send(update).is_err() {
            trace!("no update subscribers");
        }
    }

    fn notice(&self, level: NoticeLevel, message: impl Into<String>) {
        self.publish(ControllerUpdate::Notice {
            level,
            message: message.into(),
        });
    }

    fn command(&mut self, command: Command) {
        match command {
            Command::StartNew { mood, reply } => {
                let sessions = Arc::clone(&self.ports.sessions);
                let sink = self.sink.clone();
                tokio::spawn(async move {
                    let result = sessions.create(mood).await;
                    sink.push(Input::Command(Command::Created {
                        mood,
                        result,
                        reply,
                    }));
                });
            }
            Command::Created {
                mood,
                result,
                reply,
            } => {
                let outcome = match result {
                    Ok(id) => {
                        self.start_session(id.clone(), mood);
                        Ok(id)
                    }
                    Err(e) => {
                        warn!(error = %e, "failed to start conversation");
                        self.notice(
                            NoticeLevel::Error,
                            format!("Failed to start conversation: {}", e),
                        );
                        Err(e)
                    }
                };
                if reply.send(outcome).is_err() {
                    debug!("start_new caller went away");
                }
            }
            Command::SendText { text, reply } => {
                let accepted = match self.conversation.submit(&text) {
                    Some((message, outbound)) => {
                        self.publish(ControllerUpdate::MessageAppended(message));
                        self.dispatch(Event::TextSubmitted);
                        self.send_outbound(outbound);
                        true
                    }
                    None => false,
                };
                if reply.send(accepted).is_err() {
                    debug!("send_text caller went away");
                }
            }
            Command::LoadScenario { scenario, reply } => {
                let accepted = match self.conversation.load_scenario(scenario) {
                    Some((note, outbound)) => {
                        info!(scenario = scenario.as_str(), "scenario loaded");
                        self.publish(ControllerUpdate::MessageAppended(note));
                        self.dispatch(Event::TextSubmitted);
                        self.send_outbound(outbound);
                        true
                    }
                    None => false,
                };
                if reply.send(accepted).is_err() {
                    debug!("load_scenario caller went away");
                }
            }
            Command::SetVoice { on, reply } => {
                if on && !self.ports.input.is_available() {
                    let err = CoraError::DriverUnavailable {
                        driver: "speech input".to_string(),
                    };
                    self.notice(NoticeLevel::Error, err.to_string());
                } else {
                    self.dispatch(Event::VoiceToggled(on));
                }
                if reply.send(self.machine.voice_enabled() == on).is_err() {
                    debug!("set_voice caller went away");
                }
            }
            Command::SetAutoSpeak(on) => {
                info!(on, "auto-speak changed");
                self.machine.set_auto_speak(on);
            }
            Command::Pause(reply) => {
                let result = self.conversation.pause().map(|note| {
                    if let Some(note) = note {
                        self.publish(ControllerUpdate::MessageAppended(note));
                    }
                });
                if result.is_ok() {
                    self.dispatch(Event::Pause);
                }
                if reply.send(result).is_err() {
                    debug!("pause caller went away");
                }
            }
            Command::Resume(reply) => {
                let result = self.conversation.resume().map(|note| {
                    if let Some(note) = note {
                        self.publish(ControllerUpdate::MessageAppended(note));
                    }
                });
                if result.is_ok() {
                    self.dispatch(Event::Resume);
                }
                if reply.send(result).is_err() {
                    debug!("resume caller went away");
                }
            }
            Command::End(reply) => {
                let ended = self.end_session();
                if reply.send(ended).is_err() {
                    debug!("end caller went away");
                }
            }
            Command::Analyze(reply) => match self.conversation.analysis_target() {
                Ok(id) => {
                    let sessions = Arc::clone(&self.ports.sessions);
                    tokio::spawn(async move {
                        let result = sessions.analyze(&id).await;
                        if reply.send(result).is_err() {
                            debug!("analyze caller went away");
                        }
                    });
                }
                Err(e) => {
                    if reply.send(Err(e)).is_err() {
                        debug!("analyze caller went away");
                    }
                }
            },
            Command::Snapshot(reply) => {
                if reply.send(self.snapshot()).is_err() {
                    debug!("snapshot caller went away");
                }
            }
            Command::Shutdown => {}
        }
    }

    fn start_session(&mut self, id: SessionId, mood: Mood) {
        if let Some(previous) = self.conversation.id().cloned()
            && self.conversation.is_active()
        {
            debug!(session = %previous, "replacing active session");
            self.publish(ControllerUpdate::SessionEnded { id: previous });
        }
        self.conversation.start(id.clone(), mood);
        self.excluded.clear();
        self.last_voice = None;
        info!(session = %id, %mood, "conversation started");
        self.dispatch(Event::SessionStarted);
        self.publish(ControllerUpdate::SessionStarted { id, mood });
        self.notice(NoticeLevel::Info, STARTED_NOTICE);
    }

    fn end_session(&mut self) -> bool {
        let note = self.conversation.end();
        self.dispatch(Event::SessionEnded);
        self.excluded.clear();
        self.last_voice = None;
        match (note, self.conversation.id().cloned()) {
            (Some(note), Some(id)) => {
                info!(session = %id, "conversation ended");
                self.publish(ControllerUpdate::MessageAppended(note));
                self.publish(ControllerUpdate::SessionEnded { id });
                true
            }
            _ => false,
        }
    }

    fn driver_event(&mut self, event: DriverEvent) {
        match event {
            DriverEvent::Input(ev) => {
                let event = match ev {
                    SpeechInputEvent::Started => Event::InputStarted,
                    SpeechInputEvent::Result(text) => Event::InputResult(text),
                    SpeechInputEvent::Error(code) => Event::InputError(code),
                    SpeechInputEvent::Ended => Event::InputEnded,
                };
                self.dispatch(event);
            }
            DriverEvent::Output(ev) => {
                let event = match ev {
                    SpeechOutputEvent::Started(id) => Event::SpeechStarted(id),
                    SpeechOutputEvent::Ended(id) => Event::SpeechEnded(id),
                    SpeechOutputEvent::Error(id, code) => Event::SpeechFailed(id, code),
                };
                self.dispatch(event);
            }
            DriverEvent::Channel(ChannelEvent::Reply {
                conversation_id,
                content,
                timestamp,
            }) => {
                if let Some(message) =
                    self.conversation
                        .accept_reply(&conversation_id, &content, timestamp)
                {
                    self.publish(ControllerUpdate::MessageAppended(message));
                    self.dispatch(Event::AgentReply(content));
                }
            }
            DriverEvent::Channel(ChannelEvent::Error(message)) => {
                warn!(%message, "channel error");
                self.notice(NoticeLevel::Warning, message);
                self.dispatch(Event::ChannelFailed);
            }
            DriverEvent::Channel(ChannelEvent::Connection(state)) => {
                if self.connection != state {
                    info!(%state, "channel connection changed");
                    self.connection = state;
                    self.publish(ControllerUpdate::Connection(state));
                    // A reply owed by the dropped connection will not come.
                    if state == ConnectionState::Disconnected {
                        self.dispatch(Event::ChannelFailed);
                    }
                }
            }
            DriverEvent::Timer(token) => {
                self.timers.fired(token);
                self.dispatch(Event::TimerFired(token));
            }
        }
    }

    /// Run an event through the machine and perform its effects. Effects that
    /// fail synchronously feed a follow-up event back in, after the current batch.
    fn dispatch(&mut self, event: Event) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            trace!(?event, "machine event");
            for effect in self.machine.handle(event) {
                if let Some(follow_up) = self.perform(effect) {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    fn perform(&mut self, effect: Effect) -> Option<Event> {
        match effect {
            Effect::StartCapture => {
                if let Err(e) = self.ports.input.start() {
                    warn!(error = %e, "could not start speech capture");
                    return Some(Event::InputError("start-failed".to_string()));
                }
            }
            Effect::StopCapture => self.ports.input.stop(),
            Effect::Speak {
                utterance,
                text,
                attempt,
            } => {
                let request = self.utterance(utterance, text, attempt);
                if let Err(e) = self.ports.output.speak(request) {
                    warn!(error = %e, "could not start speech");
                    return Some(Event::SpeechFailed(utterance, "speak-failed".to_string()));
                }
            }
            Effect::CancelSpeech => self.ports.output.cancel(),
            Effect::ClearVoiceLock => {
                self.conversation.clear_voice_lock();
                if let Some(voice) = self.last_voice.take() {
                    debug!(voice = %voice.name, "voice excluded for this reply");
                    self.excluded.push(voice.name);
                }
            }
            Effect::Submit(text) => match self.conversation.submit(&text) {
                Some((message, outbound)) => {
                    self.publish(ControllerUpdate::MessageAppended(message));
                    return self.send_outbound(outbound);
                }
                None => return Some(Event::ChannelFailed),
            },
            Effect::Schedule { token, delay } => self.timers.schedule(token, delay),
            Effect::CancelTimer(token) => self.timers.cancel(token),
            Effect::Notice(message) => self.notice(NoticeLevel::Warning, message),
            Effect::ModeChanged { from, to } => {
                self.publish(ControllerUpdate::ModeChanged { from, to });
            }
        }
        None
    }

    fn send_outbound(&mut self, outbound: OutboundMessage) -> Option<Event> {
        match self.ports.channel.send(outbound) {
            Ok(()) => None,
            Err(e) => {
                warn!(error = %e, "message not sent");
                self.notice(NoticeLevel::Error, format!("Failed to send message: {}", e));
                Some(Event::ChannelFailed)
            }
        }
    }

    /// Build the request for one attempt, resolving (and possibly locking) the voice.
    ///
    /// Replies are spoken in the recognizer's locale.
    fn utterance(&mut self, id: UtteranceId, text: String, attempt: u32) -> UtteranceRequest {
        if attempt == 0 {
            self.excluded.clear();
        }
        let catalog = self.ports.output.voices();
        let locale = self.ports.input.locale().to_string();
        let request = VoiceRequest {
            preference: &self.voice.preference,
            quality: self.voice.quality,
            locale: &locale,
            locked: self.conversation.voice_lock(),
            excluded: &self.excluded,
        };
        let choice = select_voice(&catalog, &request, &mut self.rng);
        debug!(
            utterance = %id,
            attempt,
            source = ?choice.source,
            voice = choice.voice.as_ref().map(|v| v.name.as_str()).unwrap_or("engine default"),
            "voice resolved"
        );
        if choice.should_lock()
            && let Some(voice) = &choice.voice
        {
            self.conversation.lock_voice(voice.clone());
        }
        self.last_voice = choice.voice.clone();
        UtteranceRequest::new(
            id,
            text,
            self.conversation.mood(),
            choice.voice,
            locale,
        )
    }

    fn snapshot(&self) -> Snapshot {
        let session = self.conversation.session();
        Snapshot {
            mode: self.machine.mode(),
            voice_enabled: self.machine.voice_enabled(),
            auto_speak: self.machine.auto_speak(),
            capture_armed: self.machine.capture_armed(),
            speaking: self.machine.is_speaking(),
            retry_count: self.machine.retry_count(),
            retry_pending: self.machine.retry_pending(),
            session_id: session.map(|s| s.id().clone()),
            active: self.conversation.is_active(),
            paused: self.conversation.is_paused(),
            mood: self.conversation.mood(),
            voice_lock: self.conversation.voice_lock().cloned(),
            connection: self.connection,
            transcript: self.conversation.history().to_vec(),
            pending_timers: self.timers.pending(),
        }
    }
}
