//! Prompt text for scheduler-originated work.
//!
//! The core schedules heartbeats and ceremonies but does not own their
//! wording; an application injects a [`TriggerPrompts`] implementation
//! through the builder. [`DefaultTriggerPrompts`] ships plain-English
//! prompts so the crate works out of the box.

use chrono::NaiveDate;

use crate::state::types::Persona;

/// Prompt texts for a heartbeat decision and, should the verdict say to
/// speak, the follow-up reply.
#[derive(Debug, Clone)]
pub struct HeartbeatPrompts {
    pub system: String,
    pub user: String,
    /// System prompt for the reply item enqueued on a speak verdict.
    pub followup_system: String,
    /// User prompt for the reply item enqueued on a speak verdict.
    pub followup_user: String,
}

/// Prompt texts for the daily ceremony digest.
#[derive(Debug, Clone)]
pub struct CeremonyPrompts {
    pub system: String,
    pub user: String,
}

/// Supplies prompt text for scheduler-originated items.
pub trait TriggerPrompts: Send + Sync {
    /// Prompts for deciding whether `persona` should check in after a
    /// quiet stretch. The decision call must answer with JSON matching
    /// [`HeartbeatVerdict`](crate::router::HeartbeatVerdict).
    fn heartbeat(&self, persona: &Persona) -> HeartbeatPrompts;

    /// Prompts for the end-of-day digest covering `date`.
    fn ceremony(&self, date: NaiveDate) -> CeremonyPrompts;
}

/// Plain-English prompts used when the application injects nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultTriggerPrompts;

impl TriggerPrompts for DefaultTriggerPrompts {
    fn heartbeat(&self, persona: &Persona) -> HeartbeatPrompts {
        let name = &persona.name;
        HeartbeatPrompts {
            system: format!(
                "You are {name}, an AI companion. The user has been quiet for a \
                 while. Decide whether reaching out now would be welcome. Answer \
                 with JSON only: {{\"should_speak\": true or false, \"reason\": \
                 \"one short sentence\"}}."
            ),
            user: "Given the recent conversation, should you check in on the user right now?"
                .to_owned(),
            followup_system: format!(
                "You are {name}, an AI companion. You decided to check in because \
                 the conversation has gone quiet."
            ),
            followup_user:
                "Write a short, warm check-in message that picks up naturally from \
                 the recent conversation. One or two sentences."
                    .to_owned(),
        }
    }

    fn ceremony(&self, date: NaiveDate) -> CeremonyPrompts {
        CeremonyPrompts {
            system: "You are the companion's daily chronicler. Write honestly and briefly."
                .to_owned(),
            user: format!(
                "Write a short digest for {date}: what happened today, what seemed \
                 to matter, and anything worth carrying into tomorrow."
            ),
        }
    }
}
