//! Scheduling core: the loop task that owns all mutable state, the
//! handle embedders drive it through, and the prompt sources behind
//! the built-in triggers.

pub mod handle;
pub mod prompts;
pub mod runner;

pub use handle::{Companion, CompanionBuilder};
pub use prompts::{CeremonyPrompts, DefaultTriggerPrompts, HeartbeatPrompts, TriggerPrompts};
pub use runner::DEFAULT_PERSONA_NAME;
