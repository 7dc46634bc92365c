//! Conversation lifecycle: identity, transcript, pause/resume/end.
//!
//! The manager decides what is *sent* and what is *recorded*; the voice
//! machine decides what is spoken and when the microphone runs.

use crate::channel::OutboundMessage;
use crate::error::{CoraError, Result};
use crate::session::{ConversationSession, Message, Mood, Role, Scenario, SessionId};
use crate::voice::catalog::Voice;
use chrono::{DateTime, Utc};
use tracing::debug;

pub const STARTED_NOTICE: &str = "Conversation started. You are the customer service agent. Wait for Cora (the digital customer) to speak or greet them first.";
pub const SCENARIO_NOTE: &str = "Starting scenario... Cora will begin the conversation.";
pub const PAUSED_NOTE: &str = "Conversation paused by agent";
pub const RESUMED_NOTE: &str = "Conversation resumed by agent";
pub const ENDED_NOTE: &str = "Conversation ended. You can now analyze this conversation.";

/// Owns the current (or most recently ended) session.
#[derive(Debug, Default)]
pub struct Conversation {
    session: Option<ConversationSession>,
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace any previous session with a fresh one.
    pub fn start(&mut self, id: SessionId, mood: Mood) -> &ConversationSession {
        self.session.insert(ConversationSession::new(id, mood))
    }

    pub fn session(&self) -> Option<&ConversationSession> {
        self.session.as_ref()
    }

    pub fn id(&self) -> Option<&SessionId> {
        self.session.as_ref().map(|s| s.id())
    }

    pub fn mood(&self) -> Mood {
        self.session.as_ref().map(|s| s.mood()).unwrap_or_default()
    }

    pub fn is_active(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_active())
    }

    pub fn is_paused(&self) -> bool {
        self.session.as_ref().is_some_and(|s| s.is_paused())
    }

    pub fn history(&self) -> &[Message] {
        self.session.as_ref().map(|s| s.history()).unwrap_or_default()
    }

    /// Typed or recognized user text. `None` when there is no open session
    /// or the text is blank; the message is then dropped silently.
    pub fn submit(&mut self, text: &str) -> Option<(Message, OutboundMessage)> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let session = self.open_session()?;
        let message = Message::now(Role::User, text);
        session.append(message.clone());
        let outbound = OutboundMessage {
            conversation_id: session.id().clone(),
            message: text.to_string(),
            is_scenario_prompt: false,
        };
        Some((message, outbound))
    }

    /// Hidden seed line that makes the engine open the conversation.
    pub fn load_scenario(&mut self, scenario: Scenario) -> Option<(Message, OutboundMessage)> {
        let session = self.open_session()?;
        let note = Message::now(Role::System, SCENARIO_NOTE);
        session.append(note.clone());
        let outbound = OutboundMessage {
            conversation_id: session.id().clone(),
            message: scenario.seed().to_string(),
            is_scenario_prompt: true,
        };
        Some((note, outbound))
    }

    /// Record an agent reply. Replies for another (or an ended) session are dropped.
    pub fn accept_reply(
        &mut self,
        conversation_id: &SessionId,
        content: &str,
        timestamp: DateTime<Utc>,
    ) -> Option<Message> {
        let Some(session) = self.session.as_mut() else {
            debug!(reply_for = %conversation_id, "reply dropped: no session");
            return None;
        };
        if session.id() != conversation_id || !session.is_active() {
            debug!(
                reply_for = %conversation_id,
                current = %session.id(),
                "reply dropped: session mismatch"
            );
            return None;
        }
        let message = Message::new(Role::Agent, content, timestamp);
        session.append(message.clone());
        Some(message)
    }

    /// `Ok(None)` when already paused.
    pub fn pause(&mut self) -> Result<Option<Message>> {
        let session = self.active_session()?;
        if session.is_paused() {
            return Ok(None);
        }
        session.set_paused(true);
        let note = Message::now(Role::System, PAUSED_NOTE);
        session.append(note.clone());
        Ok(Some(note))
    }

    /// `Ok(None)` when not paused.
    pub fn resume(&mut self) -> Result<Option<Message>> {
        let session = self.active_session()?;
        if !session.is_paused() {
            return Ok(None);
        }
        session.set_paused(false);
        let note = Message::now(Role::System, RESUMED_NOTE);
        session.append(note.clone());
        Ok(Some(note))
    }

    /// Mark the session ended, keeping its id and transcript for analysis.
    /// `None` when there is nothing to end.
    pub fn end(&mut self) -> Option<Message> {
        let session = self.session.as_mut().filter(|s| s.is_active())?;
        session.deactivate();
        let note = Message::now(Role::System, ENDED_NOTE);
        session.append(note.clone());
        Some(note)
    }

    /// User and agent messages; system notes do not count.
    pub fn exchange_count(&self) -> usize {
        self.history()
            .iter()
            .filter(|m| matches!(m.role, Role::User | Role::Agent))
            .count()
    }

    /// Session to analyze: needs at least one user message and one agent reply.
    pub fn analysis_target(&self) -> Result<SessionId> {
        let session = self.session.as_ref().ok_or(CoraError::NoActiveSession)?;
        let has = |role: Role| session.history().iter().any(|m| m.role == role);
        if !(has(Role::User) && has(Role::Agent)) {
            return Err(CoraError::NothingToAnalyze);
        }
        Ok(session.id().clone())
    }

    pub fn voice_lock(&self) -> Option<&Voice> {
        self.session.as_ref().and_then(|s| s.voice_lock())
    }

    pub fn lock_voice(&mut self, voice: Voice) {
        if let Some(session) = self.session.as_mut().filter(|s| s.is_active()) {
            session.lock_voice(voice);
        }
    }

    pub fn clear_voice_lock(&mut self) -> Option<Voice> {
        self.session.as_mut().and_then(|s| s.clear_voice_lock())
    }

    fn open_session(&mut self) -> Option<&mut ConversationSession> {
        match self.session.as_mut() {
            Some(session) if session.is_open() => Some(session),
            Some(_) => {
                debug!("message rejected: session paused or ended");
                None
            }
            None => {
                debug!("message rejected: no session");
                None
            }
        }
    }

    fn active_session(&mut self) -> Result<&mut ConversationSession> {
        self.session
            .as_mut()
            .filter(|s| s.is_active())
            .ok_or(CoraError::NoActiveSession)
    }
}
