//! Cancellable one-shot timers that re-enter the controller as events.

use crate::controller::EventSink;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::trace;

/// Handle naming one scheduled deferral. Never reused within a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerToken(pub u64);

impl fmt::Display for TimerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// One sleeping task per pending token.
pub struct Timers {
    sink: EventSink,
    pending: HashMap<TimerToken, JoinHandle<()>>,
}

impl Timers {
    pub fn new(sink: EventSink) -> Self {
        Self {
            sink,
            pending: HashMap::new(),
        }
    }

    /// Deliver `TimerFired(token)` after `delay` unless cancelled first.
    pub fn schedule(&mut self, token: TimerToken, delay: Duration) {
        let sink = self.sink.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            sink.timer_fired(token);
        });
        trace!(%token, ?delay, "timer scheduled");
        if let Some(previous) = self.pending.insert(token, task) {
            previous.abort();
        }
    }

    pub fn cancel(&mut self, token: TimerToken) {
        if let Some(task) = self.pending.remove(&token) {
            task.abort();
            trace!(%token, "timer cancelled");
        }
    }

    /// Forget a token whose event has been delivered.
    pub fn fired(&mut self, token: TimerToken) {
        self.pending.remove(&token);
    }

    pub fn cancel_all(&mut self) {
        for (_, task) in self.pending.drain() {
            task.abort();
        }
    }

    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
