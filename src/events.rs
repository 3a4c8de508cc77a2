//! Observer events emitted by the scheduler loop.
//!
//! This is intentionally lightweight (no heavy payloads) so the loop can
//! emit without blocking dispatch. Consumers subscribe through
//! [`EventBus::subscribe`]; emitting with zero subscribers is the normal
//! case, not an error, and a slow subscriber only loses its own events
//! (broadcast semantics), never stalls the loop.

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::broadcast;

use crate::queue::RequestId;
use crate::state::{MessageId, PersonaId};

/// What the dispatch side of the loop is doing "right now".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueActivity {
    /// Nothing in flight.
    Idle,
    /// A work item is executing.
    Busy,
    /// Dispatch is paused; enqueues still accepted.
    Paused,
}

/// Events describing state changes and call outcomes.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    /// A message was appended to a persona's conversation.
    MessageAppended {
        persona: PersonaId,
        message: MessageId,
    },
    /// A persona's data changed (traits, pause state, heartbeat stamps).
    PersonaChanged { persona: PersonaId },
    /// Facts about the human changed.
    HumanDataChanged,
    /// Dispatch activity changed.
    QueueState { activity: QueueActivity },
    /// A heartbeat verdict decided the persona should speak.
    PersonaWantsToSpeak {
        persona: PersonaId,
        reason: Option<String>,
    },
    /// A one-shot item completed; content is passed through untouched.
    OneShotCompleted { label: String, content: String },
    /// Today's ceremony digest was recorded.
    CeremonyCompleted { date: NaiveDate },
    /// A call or handler failed. `code` is one of
    /// [`error_codes`](crate::error::error_codes).
    ErrorOccurred {
        code: &'static str,
        message: String,
    },
    /// An item exhausted its retry budget.
    RequestDeadLettered { id: RequestId, error: String },
    /// A checkpoint was written.
    CheckpointSaved { at: DateTime<Utc> },
    /// State was restored from a checkpoint at startup.
    CheckpointRestored { saved_at: DateTime<Utc> },
    /// The loop exited its stop path.
    Stopped,
}

/// Broadcast fan-out for [`ObserverEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<ObserverEvent>,
}

impl EventBus {
    /// Create a bus buffering up to `capacity` events per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to all events emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.tx.subscribe()
    }

    /// Emit to every current subscriber. No subscribers is fine.
    pub fn emit(&self, event: ObserverEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
