//! End-to-end turn-taking through the controller, with recording fakes for
//! every port and a paused tokio clock.

use chrono::Utc;
use coravoice::channel::{ChannelEvent, ConnectionState, ConversationChannel, OutboundMessage};
use coravoice::controller::{
    self, ControllerHandle, ControllerSettings, ControllerUpdate, EventSink, Ports, Snapshot,
    VoiceSettings, event_channel,
};
use coravoice::engine::{AnalysisReport, SessionService};
use coravoice::error::{CoraError, Result};
use coravoice::machine::VoiceMode;
use coravoice::session::{Mood, Role, Scenario, SessionId};
use coravoice::speech::{
    SpeechInput, SpeechInputEvent, SpeechOutput, SpeechOutputEvent, UtteranceRequest,
};
use coravoice::voice::Voice;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;

// ---- fakes ----

/// Recognizer that reports start/stop immediately and counts calls.
struct FakeInput {
    sink: EventSink,
    running: AtomicBool,
    starts: AtomicUsize,
    /// Accept `start` without ever reporting `Started`, like a recognizer
    /// that fails before capture begins.
    stalls: AtomicBool,
    locale: String,
}

impl FakeInput {
    fn hear(&self, phrase: &str) {
        if self.running.load(Ordering::SeqCst) {
            self.sink
                .speech_input(SpeechInputEvent::Result(phrase.to_string()));
        }
    }

    fn fail(&self, code: &str) {
        self.sink
            .speech_input(SpeechInputEvent::Error(code.to_string()));
    }

    fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl SpeechInput for FakeInput {
    fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if !self.running.swap(true, Ordering::SeqCst) && !self.stalls.load(Ordering::SeqCst) {
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

/// Speaker whose outcomes are delivered by the test.
struct FakeOutput {
    input: Arc<FakeInput>,
    voices: Vec<Voice>,
    requests: Mutex<Vec<UtteranceRequest>>,
    cancels: AtomicUsize,
    /// `speak` calls made while the recognizer was running.
    overlaps: AtomicUsize,
}

impl FakeOutput {
    fn requests(&self) -> Vec<UtteranceRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn last(&self) -> UtteranceRequest {
        self.requests().last().cloned().expect("nothing spoken")
    }
}

impl SpeechOutput for FakeOutput {
    fn voices(&self) -> Vec<Voice> {
        self.voices.clone()
    }

    fn speak(&self, request: UtteranceRequest) -> Result<()> {
        if self.input.is_running() {
            self.overlaps.fetch_add(1, Ordering::SeqCst);
        }
        self.requests.lock().unwrap().push(request);
        Ok(())
    }

    fn cancel(&self) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeChannel {
    sent: Mutex<Vec<OutboundMessage>>,
    broken: AtomicBool,
}

impl FakeChannel {
    fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl ConversationChannel for FakeChannel {
    fn send(&self, message: OutboundMessage) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(CoraError::Channel {
                message: "socket closed".to_string(),
            });
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        ConnectionState::Connected
    }
}

#[derive(Default)]
struct FakeSessions {
    created: AtomicU64,
}

#[async_trait::async_trait]
impl SessionService for FakeSessions {
    async fn create(&self, _mood: Mood) -> Result<SessionId> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(SessionId::new(format!("session-{}", n)))
    }

    async fn analyze(&self, _id: &SessionId) -> Result<AnalysisReport> {
        Ok(AnalysisReport {
            total_score: 21.0,
            overall_feedback: "Calm and helpful.".to_string(),
            ..AnalysisReport::default()
        })
    }
}

// ---- harness ----

struct Harness {
    handle: ControllerHandle,
    sink: EventSink,
    input: Arc<FakeInput>,
    output: Arc<FakeOutput>,
    channel: Arc<FakeChannel>,
    updates: broadcast::Receiver<ControllerUpdate>,
}

fn catalog() -> Vec<Voice> {
    vec![
        Voice::new("Samantha", "en-US"),
        Voice::new("Microsoft Zira - English (United States)", "en-US"),
        Voice::new("Google UK English Female", "en-GB"),
        Voice::new("Daniel", "en-GB"),
        Voice::new("Thomas", "fr-FR"),
    ]
}

fn harness() -> Harness {
    harness_with(ControllerSettings::default())
}

fn harness_with(settings: ControllerSettings) -> Harness {
    harness_in(settings, "en-US")
}

fn harness_in(mut settings: ControllerSettings, locale: &str) -> Harness {
    settings.rng_seed = Some(7);
    let (sink, inbox) = event_channel();
    let input = Arc::new(FakeInput {
        sink: sink.clone(),
        running: AtomicBool::new(false),
        starts: AtomicUsize::new(0),
        stalls: AtomicBool::new(false),
        locale: locale.to_string(),
    });
    let output = Arc::new(FakeOutput {
        input: Arc::clone(&input),
        voices: catalog(),
        requests: Mutex::new(Vec::new()),
        cancels: AtomicUsize::new(0),
        overlaps: AtomicUsize::new(0),
    });
    let channel = Arc::new(FakeChannel::default());
    let ports = Ports {
        input: input.clone(),
        output: output.clone(),
        channel: channel.clone(),
        sessions: Arc::new(FakeSessions::default()),
    };
    let (handle, _task) = controller::spawn(settings, ports, sink.clone(), inbox);
    let updates = handle.subscribe();
    Harness {
        handle,
        sink,
        input,
        output,
        channel,
        updates,
    }
}

impl Harness {
    /// Let every queued event (and whatever it triggers) be processed.
    async fn settle(&self) -> Snapshot {
        let mut snapshot = self.handle.snapshot().await.unwrap();
        for _ in 0..4 {
            tokio::task::yield_now().await;
            snapshot = self.handle.snapshot().await.unwrap();
        }
        snapshot
    }

    async fn session_id(&self) -> SessionId {
        self.settle().await.session_id.expect("no session")
    }

    async fn reply(&self, content: &str) {
        let id = self.session_id().await;
        self.reply_for(id, content);
    }

    fn reply_for(&self, conversation_id: SessionId, content: &str) {
        self.sink.channel(ChannelEvent::Reply {
            conversation_id,
            content: content.to_string(),
            timestamp: Utc::now(),
        });
    }

    fn speech(&self, event: SpeechOutputEvent) {
        self.sink.speech_output(event);
    }

    /// Start a session with voice on and the recognizer running.
    async fn listening(&self) -> Snapshot {
        self.handle.start_new(Mood::Neutral).await.unwrap();
        assert!(self.handle.set_voice(true).await.unwrap());
        let snapshot = self.settle().await;
        assert_eq!(snapshot.mode, VoiceMode::Listening);
        assert!(self.input.is_running());
        snapshot
    }

    fn assert_half_duplex(&self) {
        assert_eq!(
            self.output.overlaps.load(Ordering::SeqCst),
            0,
            "speech started while the recognizer was running"
        );
    }

    fn drain_updates(&mut self) -> Vec<ControllerUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            updates.push(update);
        }
        updates
    }
}

async fn advance(ms: u64) {
    tokio::time::advance(Duration::from_millis(ms)).await;
}

// ---- scenarios ----

#[tokio::test(start_paused = true)]
async fn test_typed_exchange_records_two_messages() {
    let h = harness();
    h.handle.start_new(Mood::Neutral).await.unwrap();
    assert!(h.handle.send_text("Hello").await.unwrap());
    h.reply("Hi there").await;

    let snapshot = h.settle().await;
    let transcript: Vec<(Role, &str)> = snapshot
        .transcript
        .iter()
        .map(|m| (m.role, m.content.as_str()))
        .collect();
    assert_eq!(
        transcript,
        vec![(Role::User, "Hello"), (Role::Agent, "Hi there")]
    );

    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].message, "Hello");
    assert!(!sent[0].is_scenario_prompt);
    assert_eq!(Some(&sent[0].conversation_id), snapshot.session_id.as_ref());
}

#[tokio::test(start_paused = true)]
async fn test_recognized_phrase_moves_to_processing_and_second_is_dropped() {
    let h = harness();
    h.listening().await;

    h.input.hear("I need help");
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Processing);
    assert_eq!(h.channel.sent().len(), 1);

    h.input.hear("Are you there?");
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Processing);
    assert_eq!(h.channel.sent().len(), 1, "second phrase must be dropped");
    assert_eq!(snapshot.exchange_count(), 1);
    assert_eq!(snapshot.transcript[0].content, "I need help");
}

#[tokio::test(start_paused = true)]
async fn test_synthesis_retries_use_a_different_voice() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("My order never arrived").await;

    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Speaking);
    assert!(!h.input.is_running());
    let first = h.output.last();
    let first_voice = first.voice.clone().expect("a voice").name;
    assert_eq!(snapshot.voice_lock.as_ref().map(|v| v.name.as_str()), Some(first_voice.as_str()));

    h.speech(SpeechOutputEvent::Error(first.id, "synthesis-failed".to_string()));
    let snapshot = h.settle().await;
    assert_eq!(snapshot.retry_count, 1);
    assert!(snapshot.retry_pending);
    assert_eq!(snapshot.mode, VoiceMode::Speaking, "mode holds during backoff");
    assert_eq!(h.output.requests().len(), 1, "no resubmission before the backoff");

    advance(500).await;
    h.settle().await;
    let second = h.output.last();
    assert_eq!(h.output.requests().len(), 2);
    let second_voice = second.voice.clone().expect("a voice").name;
    assert_ne!(first_voice, second_voice, "retry must re-select the voice");
    assert_eq!(second.text, "My order never arrived");

    h.speech(SpeechOutputEvent::Error(second.id, "synthesis-failed".to_string()));
    h.settle().await;
    assert_eq!(h.settle().await.retry_count, 2);
    advance(500).await;
    h.settle().await;
    let third = h.output.last();
    assert_eq!(h.output.requests().len(), 3);
    assert_ne!(third.voice.as_ref().map(|v| &v.name), Some(&second_voice));

    h.speech(SpeechOutputEvent::Started(third.id));
    h.speech(SpeechOutputEvent::Ended(third.id));
    let snapshot = h.settle().await;
    assert_eq!(snapshot.retry_count, 0);
    assert!(!snapshot.speaking);
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert_eq!(
        snapshot.voice_lock.as_ref().map(|v| &v.name),
        third.voice.as_ref().map(|v| &v.name),
        "the voice that worked stays locked"
    );
    h.assert_half_duplex();
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fall_back_to_text() {
    let mut h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("Hi").await;
    h.settle().await;

    for _ in 0..3 {
        let current = h.output.last();
        h.speech(SpeechOutputEvent::Error(current.id, "synthesis-failed".to_string()));
        h.settle().await;
        advance(500).await;
        h.settle().await;
    }

    assert_eq!(h.output.requests().len(), 3, "one attempt plus two retries");
    let snapshot = h.settle().await;
    assert_eq!(snapshot.retry_count, 0);
    assert!(!snapshot.retry_pending);
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert!(h.drain_updates().iter().any(|u| matches!(
        u,
        ControllerUpdate::Notice { message, .. } if message.contains("text only")
    )));
}

#[tokio::test(start_paused = true)]
async fn test_capture_waits_out_the_quiet_period() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("Hi, I have a question").await;
    h.settle().await;

    let request = h.output.last();
    h.speech(SpeechOutputEvent::Started(request.id));
    h.speech(SpeechOutputEvent::Ended(request.id));
    let snapshot = h.settle().await;
    let starts_at_end = h.input.starts();
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert!(!snapshot.capture_armed);
    assert!(!h.input.is_running());

    advance(999).await;
    h.settle().await;
    assert_eq!(h.input.starts(), starts_at_end, "capture restarted inside the quiet period");

    advance(1).await;
    let snapshot = h.settle().await;
    assert_eq!(h.input.starts(), starts_at_end + 1);
    assert!(snapshot.capture_armed);
    assert!(h.input.is_running());
    h.assert_half_duplex();
}

#[tokio::test(start_paused = true)]
async fn test_quiet_period_does_not_rearm_when_voice_turned_off() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("Hi").await;
    h.settle().await;
    let request = h.output.last();
    h.speech(SpeechOutputEvent::Ended(request.id));
    h.settle().await;
    let starts = h.input.starts();

    assert!(h.handle.set_voice(false).await.unwrap());
    advance(2000).await;
    let snapshot = h.settle().await;
    assert_eq!(h.input.starts(), starts);
    assert_eq!(snapshot.mode, VoiceMode::Inactive);
}

#[tokio::test(start_paused = true)]
async fn test_end_during_retry_backoff_cancels_the_retry() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("Hi").await;
    h.settle().await;
    let request = h.output.last();
    h.speech(SpeechOutputEvent::Error(request.id, "synthesis-failed".to_string()));
    assert!(h.settle().await.retry_pending);

    assert!(h.handle.end().await.unwrap());
    let spoken = h.output.requests().len();

    advance(5000).await;
    let snapshot = h.settle().await;
    assert_eq!(h.output.requests().len(), spoken, "spoke after end()");
    assert!(!snapshot.retry_pending);
    assert_eq!(snapshot.pending_timers, 0);
    assert_eq!(snapshot.mode, VoiceMode::Inactive);
    assert!(!snapshot.active);
    assert!(!h.input.is_running());
}

// ---- invariants ----

#[tokio::test(start_paused = true)]
async fn test_pause_and_end_are_idempotent() {
    let h = harness();
    h.listening().await;

    h.handle.pause().await.unwrap();
    let first = h.settle().await;
    h.handle.pause().await.unwrap();
    let second = h.settle().await;
    assert_eq!(first.mode, VoiceMode::Paused);
    assert_eq!(first.transcript, second.transcript);
    assert_eq!(first.mode, second.mode);
    assert!(!h.input.is_running());

    assert!(h.handle.end().await.unwrap());
    let ended = h.settle().await;
    assert!(!h.handle.end().await.unwrap());
    let again = h.settle().await;
    assert_eq!(ended.transcript, again.transcript);
    assert_eq!(again.mode, VoiceMode::Inactive);
    assert!(!again.paused);
    assert!(again.voice_lock.is_none());
    assert!(again.session_id.is_some(), "id kept for analysis");
}

#[tokio::test(start_paused = true)]
async fn test_reply_for_another_session_changes_nothing() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    let before = h.settle().await;

    h.reply_for(SessionId::new("someone-else"), "Not for you");
    let after = h.settle().await;

    assert_eq!(before.transcript, after.transcript);
    assert_eq!(before.mode, after.mode);
    assert!(h.output.requests().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_late_reply_from_previous_session_is_dropped() {
    let h = harness();
    h.handle.start_new(Mood::Neutral).await.unwrap();
    let old = h.session_id().await;
    h.handle.send_text("Hello").await.unwrap();
    h.handle.start_new(Mood::Happy).await.unwrap();

    h.reply_for(old, "Late answer");
    let snapshot = h.settle().await;
    assert!(snapshot.transcript.is_empty());
    assert_eq!(snapshot.mood, Mood::Happy);
}

#[tokio::test(start_paused = true)]
async fn test_reply_while_paused_is_recorded_but_silent() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.handle.pause().await.unwrap();
    h.reply("Still there?").await;

    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Paused);
    assert!(h.output.requests().is_empty());
    assert_eq!(
        snapshot.transcript.last().map(|m| m.content.as_str()),
        Some("Still there?")
    );

    h.handle.resume().await.unwrap();
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert!(h.input.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_new_reply_preempts_current_speech() {
    let h = harness();
    h.listening().await;
    h.input.hear("Hello");
    h.reply("First reply").await;
    h.settle().await;
    let first = h.output.last();
    h.speech(SpeechOutputEvent::Started(first.id));

    h.reply("Second reply").await;
    h.settle().await;
    let second = h.output.last();
    assert_ne!(first.id, second.id);
    assert_eq!(second.text, "Second reply");
    assert!(h.output.cancels.load(Ordering::SeqCst) >= 1);

    // The interrupted utterance reporting late must not end the new one.
    h.speech(SpeechOutputEvent::Error(first.id, "interrupted".to_string()));
    h.speech(SpeechOutputEvent::Ended(first.id));
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Speaking);
    assert!(snapshot.speaking);
    h.assert_half_duplex();
}

#[tokio::test(start_paused = true)]
async fn test_auto_speak_off_keeps_listening() {
    let mut settings = ControllerSettings::default();
    settings.machine.auto_speak = false;
    let h = harness_with(settings);
    h.listening().await;
    h.input.hear("Hello");
    h.reply("Hi").await;

    let snapshot = h.settle().await;
    assert!(h.output.requests().is_empty());
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert!(h.input.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_reply_with_voice_off_is_spoken_then_inactive() {
    let h = harness();
    h.handle.start_new(Mood::Frustrated).await.unwrap();
    h.handle.send_text("Hello").await.unwrap();
    h.reply("This is unacceptable").await;
    h.settle().await;

    let request = h.output.last();
    assert!(request.rate > 1.0, "frustrated customers speak faster");
    h.speech(SpeechOutputEvent::Ended(request.id));
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Inactive);
    assert_eq!(h.input.starts(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_channel_failure_leaves_processing() {
    let mut h = harness();
    h.listening().await;
    h.channel.broken.store(true, Ordering::SeqCst);

    h.input.hear("Hello");
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert!(h.drain_updates().iter().any(|u| matches!(
        u,
        ControllerUpdate::Notice { message, .. } if message.contains("Failed to send")
    )));

    h.sink.channel(ChannelEvent::Error("engine overloaded".to_string()));
    assert_eq!(h.settle().await.mode, VoiceMode::Listening);
}

#[tokio::test(start_paused = true)]
async fn test_dropped_connection_releases_processing() {
    let h = harness();
    h.listening().await;
    h.sink
        .channel(ChannelEvent::Connection(ConnectionState::Connected));

    h.input.hear("Hello");
    assert_eq!(h.settle().await.mode, VoiceMode::Processing);

    h.sink
        .channel(ChannelEvent::Connection(ConnectionState::Disconnected));
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Listening);
    assert_eq!(snapshot.connection, ConnectionState::Disconnected);
    assert!(snapshot.capture_armed);

    // After the redial the next phrase goes through again.
    h.sink
        .channel(ChannelEvent::Connection(ConnectionState::Connected));
    h.input.hear("Are you there?");
    assert_eq!(h.settle().await.mode, VoiceMode::Processing);
    assert_eq!(h.channel.sent().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_recognition_errors_recover_then_give_up() {
    let mut h = harness();
    h.listening().await;
    let starts = h.input.starts();

    h.input.fail("no-speech");
    assert_eq!(h.settle().await.mode, VoiceMode::Listening);

    h.input.fail("network");
    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Error);
    assert!(!h.input.is_running());

    advance(1000).await;
    h.settle().await;
    assert_eq!(h.input.starts(), starts + 1);
    assert!(h.input.is_running());
    assert_eq!(h.settle().await.mode, VoiceMode::Listening);

    h.input.stalls.store(true, Ordering::SeqCst);
    for attempt in 1..=3 {
        h.input.fail("audio-capture");
        let snapshot = h.settle().await;
        if attempt < 3 {
            assert_eq!(snapshot.mode, VoiceMode::Error);
            advance(1000).await;
            h.settle().await;
            assert!(h.input.is_running(), "capture re-armed after attempt {}", attempt);
        }
    }
    let snapshot = h.settle().await;
    assert!(!snapshot.voice_enabled);
    assert_eq!(snapshot.mode, VoiceMode::Inactive);
    assert!(h.drain_updates().iter().any(|u| matches!(
        u,
        ControllerUpdate::Notice { message, .. } if message.contains("Voice mode turned off")
    )));
}

#[tokio::test(start_paused = true)]
async fn test_scenario_prompt_is_hidden() {
    let h = harness();
    h.handle.start_new(Mood::Frustrated).await.unwrap();
    assert!(h.handle.load_scenario(Scenario::Complaint).await.unwrap());

    let snapshot = h.settle().await;
    assert_eq!(snapshot.mode, VoiceMode::Processing);
    assert!(snapshot.transcript.iter().all(|m| m.role == Role::System));
    let sent = h.channel.sent();
    assert_eq!(sent.len(), 1);
    assert!(sent[0].is_scenario_prompt);
    assert_eq!(sent[0].message, Scenario::Complaint.seed());
}

#[tokio::test(start_paused = true)]
async fn test_analysis_after_end() {
    let h = harness();
    h.handle.start_new(Mood::Neutral).await.unwrap();
    assert!(matches!(
        h.handle.analyze().await,
        Err(CoraError::NothingToAnalyze)
    ));

    h.handle.send_text("Hello").await.unwrap();
    h.reply("Hi").await;
    h.settle().await;
    h.handle.end().await.unwrap();

    let report = h.handle.analyze().await.unwrap();
    assert_eq!(report.total_score, 21.0);
    assert_eq!(report.overall_feedback, "Calm and helpful.");
}

#[tokio::test(start_paused = true)]
async fn test_voice_requires_a_session() {
    let h = harness();
    assert!(!h.handle.set_voice(true).await.unwrap());
    assert_eq!(h.input.starts(), 0);
    assert!(!h.handle.send_text("Hello").await.unwrap());
}

#[tokio::test(start_paused = true)]
async fn test_replies_use_the_recognizer_locale() {
    let h = harness_in(ControllerSettings::default(), "fr-FR");
    h.handle.start_new(Mood::Neutral).await.unwrap();
    h.handle.send_text("Bonjour").await.unwrap();
    h.reply("Bonjour, j'ai un souci").await;
    h.settle().await;

    let request = h.output.last();
    assert_eq!(request.lang, "fr-FR");
    assert_eq!(request.voice.map(|v| v.name), Some("Thomas".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_named_voice_preference_is_honoured() {
    let settings = ControllerSettings {
        voice: VoiceSettings {
            preference: "Daniel".parse().unwrap(),
            ..VoiceSettings::default()
        },
        ..ControllerSettings::default()
    };
    let h = harness_with(settings);
    h.handle.start_new(Mood::Neutral).await.unwrap();
    h.handle.send_text("Hello").await.unwrap();
    h.reply("Hi").await;
    h.settle().await;

    let request = h.output.last();
    assert_eq!(request.voice.map(|v| v.name), Some("Daniel".to_string()));
    assert!(h.settle().await.voice_lock.is_none(), "only random choices lock");
}

#[tokio::test(start_paused = true)]
async fn test_updates_are_broadcast_in_order() {
    let mut h = harness();
    h.handle.start_new(Mood::Neutral).await.unwrap();
    h.handle.send_text("Hello").await.unwrap();
    h.settle().await;

    let updates = h.drain_updates();
    let started = updates
        .iter()
        .position(|u| matches!(u, ControllerUpdate::SessionStarted { .. }))
        .expect("session started");
    let appended = updates
        .iter()
        .position(|u| matches!(u, ControllerUpdate::MessageAppended(m) if m.content == "Hello"))
        .expect("message appended");
    let processing = updates
        .iter()
        .position(|u| {
            matches!(
                u,
                ControllerUpdate::ModeChanged {
                    to: VoiceMode::Processing,
                    ..
                }
            )
        })
        .expect("processing");
    assert!(started < appended && appended < processing);
}

#[tokio::test(start_paused = true)]
async fn test_handle_reports_closed_controller() {
    let h = harness();
    h.handle.shutdown();
    h.settle_closed().await;
    assert!(matches!(
        h.handle.start_new(Mood::Neutral).await,
        Err(CoraError::ControllerClosed)
    ));
    assert!(matches!(
        h.handle.snapshot().await,
        Err(CoraError::ControllerClosed)
    ));
}

impl Harness {
    async fn settle_closed(&self) {
        for _ in 0..8 {
            tokio::task::yield_now().await;
        }
    }
}
