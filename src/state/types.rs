//! Core state data model: personas, messages, human facts, daily digests.
//!
//! These types are plain data. All mutation goes through
//! [`StateStore`](super::StateStore), which the scheduler loop owns
//! exclusively; nothing here carries interior mutability.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Newtype for persona identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PersonaId(pub Uuid);

impl PersonaId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for PersonaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Short display: first 8 chars of the UUID.
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for PersonaId {
    fn default() -> Self {
        Self::new()
    }
}

/// Newtype for message identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub Uuid);

impl MessageId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// The `{{message:<id>}}` reference form, with the full UUID
    /// (the short `Display` form is for logs and does not resolve).
    pub fn placeholder(&self) -> String {
        format!("{{{{message:{}}}}}", self.0)
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", &self.0.to_string()[..8])
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    /// The human user.
    User,
    /// A persona's reply.
    Assistant,
    /// System-originated marker (ceremony digests, lifecycle notes).
    Event,
}

/// One turn in a persona's conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Unique identifier, referenced by `{{message:<id>}}` placeholders.
    pub id: MessageId,
    /// Persona this message belongs to.
    pub persona: PersonaId,
    /// Who produced it.
    pub role: MessageRole,
    /// Message text.
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// A single scored trait on a persona (score clamped to `[0.0, 1.0]`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraitScore {
    /// Trait name (e.g. `"warmth"`).
    pub name: String,
    /// Current score in `[0.0, 1.0]`.
    pub score: f32,
}

/// An AI persona the human converses with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Persona {
    /// Unique identifier.
    pub id: PersonaId,
    /// Display name.
    pub name: String,
    /// Persona no longer initiates contact while paused.
    #[serde(default)]
    pub paused: bool,
    /// Archived personas are hidden and never scheduled.
    #[serde(default)]
    pub archived: bool,
    /// Seconds of user inactivity before this persona may check in.
    pub heartbeat_delay_secs: u64,
    /// When the user last sent this persona a message.
    pub last_user_activity: Option<DateTime<Utc>>,
    /// When a heartbeat check-in was last enqueued for this persona.
    pub last_heartbeat_attempt: Option<DateTime<Utc>>,
    /// Scored traits, adjusted over time by trait-adjustment work.
    #[serde(default)]
    pub traits: Vec<TraitScore>,
    pub created_at: DateTime<Utc>,
}

impl Persona {
    /// Create an active persona with the given check-in delay.
    pub fn new(name: impl Into<String>, heartbeat_delay_secs: u64) -> Self {
        Self {
            id: PersonaId::new(),
            name: name.into(),
            paused: false,
            archived: false,
            heartbeat_delay_secs,
            last_user_activity: None,
            last_heartbeat_attempt: None,
            traits: Vec::new(),
            created_at: Utc::now(),
        }
    }

    /// True when the persona participates in scheduling.
    pub fn is_active(&self) -> bool {
        !self.paused && !self.archived
    }
}

/// A fact learned about the human, keyed for dedup (newest wins).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HumanFact {
    /// Dedup key (e.g. `"occupation"`).
    pub key: String,
    /// Fact text.
    pub content: String,
    /// Persona whose conversation surfaced the fact, if known.
    pub learned_from: Option<PersonaId>,
    pub updated_at: DateTime<Utc>,
}

/// One day's ceremony digest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyDigest {
    /// Day the digest covers.
    pub date: NaiveDate,
    /// Digest text, produced by the ceremony work item.
    pub content: String,
    pub created_at: DateTime<Utc>,
}
