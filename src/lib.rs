//! Kindred: the scheduling and execution core of a multi-persona
//! AI companion.
//!
//! Every piece of model work (replies, proactive check-ins, fact
//! extraction, the daily digest) is a [`queue::WorkItem`] in one
//! priority queue, executed one at a time against an OpenAI-style
//! chat-completions endpoint.
//!
//! # Architecture
//!
//! A single spawned loop task owns all mutable state, so nothing in
//! the crate needs a lock:
//! - **Queue**: priority + FIFO ordering, retries with backoff, dead
//!   letters
//! - **Executor**: one call in flight at a time, cancellable
//! - **Router**: applies each call's outcome to conversation state and
//!   emits observer events
//! - **Checkpoint**: debounced JSON snapshots; a restart resumes where
//!   it left off
//!
//! Embedders drive the loop through [`Companion`] and watch it through
//! a broadcast event stream.

pub mod config;
pub mod error;
pub mod events;
pub mod executor;
pub mod paths;
pub mod provider;
pub mod queue;
pub mod router;
pub mod scheduler;
pub mod state;

pub use config::CompanionConfig;
pub use error::{CallError, KindredError, Result};
pub use events::{EventBus, ObserverEvent, QueueActivity};
pub use queue::{NewWorkItem, NextStep, Priority, RequestId, ResponseKind, WorkItem};
pub use scheduler::{Companion, CompanionBuilder, DEFAULT_PERSONA_NAME, TriggerPrompts};
pub use state::{Message, MessageId, MessageRole, Persona, PersonaId};
