//! Application state: personas, messages, human facts, daily digests,
//! and the checkpoint store that persists them.

pub mod checkpoint;
pub mod store;
pub mod types;

pub use checkpoint::{CheckpointStore, Snapshot};
pub use store::StateStore;
pub use types::{
    DailyDigest, HumanFact, Message, MessageId, MessageRole, Persona, PersonaId, TraitScore,
};
