//! Work item data model.
//!
//! A work item is one unit of LLM work: a prompt payload, how to interpret
//! the response, and which typed next step routes the result back into
//! state. Items are created by producers via [`NewWorkItem`] and owned by
//! the [`RequestQueue`](super::RequestQueue) from enqueue to completion.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::state::PersonaId;

/// Newtype for work item identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of the UUID.
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

/// Dispatch priority. Higher variants dequeue first; creation order breaks
/// ties within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    /// Background work (heartbeats, ceremonies).
    Low,
    /// Ordinary conversational work.
    Normal,
    /// Work the user is actively waiting on.
    High,
}

/// Lifecycle state of a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Waiting to be dispatched (possibly held back by a retry timer).
    Pending,
    /// Handed to the executor; exactly one item may be here at a time.
    Processing,
    /// Failed past the retry budget; kept for inspection until cleared.
    DeadLetter,
}

/// How the provider's response content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseKind {
    /// Plain text, passed through as-is.
    FreeText,
    /// JSON expected; parsed (with repair) before routing.
    Structured,
    /// Untouched text for one-shot consumers.
    Raw,
}

/// Typed next step for a completed item.
///
/// This is a closed set: routing is an exhaustive `match`, so a response
/// can never arrive with nowhere to go. Adding a step is a compile-time
/// change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum NextStep {
    /// Append the reply to the persona's conversation.
    PersonaReply { persona: PersonaId },
    /// Structured verdict on whether the persona should check in.
    HeartbeatDecision { persona: PersonaId },
    /// Structured facts about the human, merged into shared memory.
    FactExtraction { persona: PersonaId },
    /// Structured trait deltas applied to the persona.
    TraitAdjustment { persona: PersonaId },
    /// Daily digest recorded once per day.
    CeremonyDigest,
    /// Raw content surfaced to observers under a caller-chosen label.
    OneShot { label: String },
}

impl NextStep {
    /// The persona this step concerns, when it concerns one.
    pub fn subject(&self) -> Option<PersonaId> {
        match self {
            Self::PersonaReply { persona }
            | Self::HeartbeatDecision { persona }
            | Self::FactExtraction { persona }
            | Self::TraitAdjustment { persona } => Some(*persona),
            Self::CeremonyDigest | Self::OneShot { .. } => None,
        }
    }

    /// Short tag for logs.
    pub fn tag(&self) -> &'static str {
        match self {
            Self::PersonaReply { .. } => "persona_reply",
            Self::HeartbeatDecision { .. } => "heartbeat_decision",
            Self::FactExtraction { .. } => "fact_extraction",
            Self::TraitAdjustment { .. } => "trait_adjustment",
            Self::CeremonyDigest => "ceremony_digest",
            Self::OneShot { .. } => "one_shot",
        }
    }
}

/// A unit of LLM work tracked by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkItem {
    /// Unique identifier.
    pub id: RequestId,

    /// Enqueue order, used to break priority/timestamp ties FIFO.
    #[serde(default)]
    pub seq: u64,

    /// System prompt text (opaque to the core).
    pub system_prompt: String,

    /// User prompt text (opaque to the core; may contain
    /// `{{message:<id>}}` placeholders hydrated at execution time).
    pub user_prompt: String,

    /// When set, the executor prepends the most recent N conversation
    /// turns for the step's persona.
    pub transcript_turns: Option<usize>,

    /// How the response content is interpreted.
    pub kind: ResponseKind,

    /// Dispatch priority.
    pub priority: Priority,

    /// Where the result goes.
    pub next_step: NextStep,

    /// Overrides the configured model spec for this item only.
    pub model_override: Option<String>,

    /// Caller-specific context the core carries but does not interpret
    /// (except where a handler documents a key, e.g. follow-up prompts).
    pub context: serde_json::Value,

    /// Current lifecycle state.
    pub state: RequestState,

    /// Number of failed attempts so far. Owned by the queue's fail path.
    pub attempts: u32,

    /// When the last attempt failed.
    pub last_attempt_at: Option<DateTime<Utc>>,

    /// Not dispatchable before this instant (retry backoff).
    pub retry_after: Option<DateTime<Utc>>,

    /// Terminal error recorded when the item dead-letters.
    pub last_error: Option<String>,

    /// When the item entered the dead-letter set.
    pub dead_lettered_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

impl WorkItem {
    /// True when the item may be dispatched at `now`.
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.state == RequestState::Pending
            && self.retry_after.is_none_or(|after| after <= now)
    }
}

/// Builder for enqueueing a work item.
#[derive(Debug, Clone)]
pub struct NewWorkItem {
    pub(crate) next_step: NextStep,
    pub(crate) system_prompt: String,
    pub(crate) user_prompt: String,
    pub(crate) transcript_turns: Option<usize>,
    pub(crate) kind: ResponseKind,
    pub(crate) priority: Priority,
    pub(crate) model_override: Option<String>,
    pub(crate) context: serde_json::Value,
}

impl NewWorkItem {
    pub fn new(next_step: NextStep) -> Self {
        Self {
            next_step,
            system_prompt: String::new(),
            user_prompt: String::new(),
            transcript_turns: None,
            kind: ResponseKind::FreeText,
            priority: Priority::Normal,
            model_override: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn prompts(mut self, system: impl Into<String>, user: impl Into<String>) -> Self {
        self.system_prompt = system.into();
        self.user_prompt = user.into();
        self
    }

    /// Prepend the most recent `turns` conversation turns at execution time.
    pub fn with_transcript(mut self, turns: usize) -> Self {
        self.transcript_turns = Some(turns);
        self
    }

    pub fn kind(mut self, kind: ResponseKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn model_override(mut self, spec: impl Into<String>) -> Self {
        self.model_override = Some(spec.into());
        self
    }

    pub fn context(mut self, context: serde_json::Value) -> Self {
        self.context = context;
        self
    }

    /// Finalize into a pending item. Called by the queue at enqueue time,
    /// which assigns the sequence number.
    pub(crate) fn into_item(self, seq: u64) -> WorkItem {
        WorkItem {
            id: RequestId::new(),
            seq,
            system_prompt: self.system_prompt,
            user_prompt: self.user_prompt,
            transcript_turns: self.transcript_turns,
            kind: self.kind,
            priority: self.priority,
            next_step: self.next_step,
            model_override: self.model_override,
            context: self.context,
            state: RequestState::Pending,
            attempts: 0,
            last_attempt_at: None,
            retry_after: None,
            last_error: None,
            dead_lettered_at: None,
            created_at: Utc::now(),
        }
    }
}
