//! In-memory application state, owned exclusively by the scheduler loop.
//!
//! [`StateStore`] holds personas, the message log, facts learned about the
//! human, and daily digests. It is deliberately not `Sync`-guarded: the
//! loop task is the only mutator, so a checkpoint taken between awaits can
//! never observe a half-applied change.

use chrono::{NaiveDate, Utc};
use tracing::debug;

use crate::error::{KindredError, Result};
use crate::state::types::{
    DailyDigest, HumanFact, Message, MessageId, MessageRole, Persona, PersonaId, TraitScore,
};

/// Default cap on the global message log.
pub const DEFAULT_MAX_MESSAGES: usize = 2000;

/// Owns all mutable application state.
#[derive(Debug)]
pub struct StateStore {
    personas: Vec<Persona>,
    messages: Vec<Message>,
    facts: Vec<HumanFact>,
    digests: Vec<DailyDigest>,
    max_messages: usize,
}

impl Default for StateStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGES)
    }
}

impl StateStore {
    /// Create an empty store trimming the message log to `max_messages`.
    pub fn new(max_messages: usize) -> Self {
        Self {
            personas: Vec::new(),
            messages: Vec::new(),
            facts: Vec::new(),
            digests: Vec::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Rebuild a store from checkpoint data.
    pub fn restore(
        personas: Vec<Persona>,
        messages: Vec<Message>,
        facts: Vec<HumanFact>,
        digests: Vec<DailyDigest>,
        max_messages: usize,
    ) -> Self {
        let mut store = Self::new(max_messages);
        store.personas = personas;
        store.messages = messages;
        store.facts = facts;
        store.digests = digests;
        store.trim_messages();
        store
    }

    // --- personas ---

    pub fn add_persona(&mut self, persona: Persona) -> PersonaId {
        let id = persona.id;
        self.personas.push(persona);
        id
    }

    pub fn persona(&self, id: PersonaId) -> Option<&Persona> {
        self.personas.iter().find(|p| p.id == id)
    }

    pub fn persona_mut(&mut self, id: PersonaId) -> Option<&mut Persona> {
        self.personas.iter_mut().find(|p| p.id == id)
    }

    pub fn personas(&self) -> &[Persona] {
        &self.personas
    }

    /// Personas that participate in scheduling (not paused, not archived).
    pub fn active_personas(&self) -> impl Iterator<Item = &Persona> {
        self.personas.iter().filter(|p| p.is_active())
    }

    fn require_persona(&mut self, id: PersonaId) -> Result<&mut Persona> {
        self.persona_mut(id)
            .ok_or_else(|| KindredError::State(format!("unknown persona {id}")))
    }

    /// Stamp the last-heartbeat-attempt time, preventing re-triggering on
    /// the next tick.
    pub fn touch_heartbeat(&mut self, id: PersonaId) -> Result<()> {
        self.require_persona(id)?.last_heartbeat_attempt = Some(Utc::now());
        Ok(())
    }

    // --- messages ---

    /// Append a message to a persona's conversation.
    ///
    /// User messages stamp the persona's last-user-activity. The global
    /// log is trimmed oldest-first past the configured cap.
    ///
    /// # Errors
    /// Returns [`KindredError::State`] when the persona does not exist.
    pub fn append_message(
        &mut self,
        persona: PersonaId,
        role: MessageRole,
        content: impl Into<String>,
    ) -> Result<MessageId> {
        let now = Utc::now();
        if role == MessageRole::User {
            self.require_persona(persona)?.last_user_activity = Some(now);
        } else if self.persona(persona).is_none() {
            return Err(KindredError::State(format!("unknown persona {persona}")));
        }
        let message = Message {
            id: MessageId::new(),
            persona,
            role,
            content: content.into(),
            created_at: now,
        };
        let id = message.id;
        self.messages.push(message);
        self.trim_messages();
        Ok(id)
    }

    pub fn message(&self, id: MessageId) -> Option<&Message> {
        self.messages.iter().find(|m| m.id == id)
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    /// The most recent `turns` conversation messages for a persona,
    /// oldest first. Event messages are omitted; they are not part of the
    /// dialogue a provider should see.
    pub fn transcript(&self, persona: PersonaId, turns: usize) -> Vec<&Message> {
        let mut recent: Vec<&Message> = self
            .messages
            .iter()
            .rev()
            .filter(|m| m.persona == persona && m.role != MessageRole::Event)
            .take(turns)
            .collect();
        recent.reverse();
        recent
    }

    fn trim_messages(&mut self) {
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(..excess);
            debug!(trimmed = excess, "trimmed message log");
        }
    }

    // --- human facts ---

    /// Insert or replace a fact by key (exact match, newest wins).
    pub fn upsert_fact(
        &mut self,
        key: impl Into<String>,
        content: impl Into<String>,
        learned_from: Option<PersonaId>,
    ) {
        let key = key.into();
        let fact = HumanFact {
            content: content.into(),
            learned_from,
            updated_at: Utc::now(),
            key: key.clone(),
        };
        match self.facts.iter_mut().find(|f| f.key == key) {
            Some(existing) => *existing = fact,
            None => self.facts.push(fact),
        }
    }

    pub fn facts(&self) -> &[HumanFact] {
        &self.facts
    }

    // --- traits ---

    /// Apply a delta to a persona trait, clamped to `[0.0, 1.0]`.
    ///
    /// A trait not yet scored starts from the neutral 0.5 before the delta
    /// applies. Returns the new score.
    ///
    /// # Errors
    /// Returns [`KindredError::State`] when the persona does not exist.
    pub fn apply_trait_delta(&mut self, persona: PersonaId, name: &str, delta: f32) -> Result<f32> {
        let persona = self.require_persona(persona)?;
        match persona.traits.iter_mut().find(|t| t.name == name) {
            Some(t) => {
                t.score = (t.score + delta).clamp(0.0, 1.0);
                Ok(t.score)
            }
            None => {
                let score = (0.5 + delta).clamp(0.0, 1.0);
                persona.traits.push(TraitScore {
                    name: name.to_owned(),
                    score,
                });
                Ok(score)
            }
        }
    }

    // --- digests ---

    pub fn record_digest(&mut self, date: NaiveDate, content: impl Into<String>) {
        let digest = DailyDigest {
            date,
            content: content.into(),
            created_at: Utc::now(),
        };
        match self.digests.iter_mut().find(|d| d.date == date) {
            Some(existing) => *existing = digest,
            None => self.digests.push(digest),
        }
    }

    pub fn has_digest_for(&self, date: NaiveDate) -> bool {
        self.digests.iter().any(|d| d.date == date)
    }

    pub fn digests(&self) -> &[DailyDigest] {
        &self.digests
    }

    // --- checkpoint export ---

    pub fn export_personas(&self) -> Vec<Persona> {
        self.personas.clone()
    }

    pub fn export_messages(&self) -> Vec<Message> {
        self.messages.clone()
    }

    pub fn export_facts(&self) -> Vec<HumanFact> {
        self.facts.clone()
    }

    pub fn export_digests(&self) -> Vec<DailyDigest> {
        self.digests.clone()
    }
}
