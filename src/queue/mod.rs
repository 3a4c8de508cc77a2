//! Work queue: items, priorities, retry/backoff, and the dead-letter set.
//!
//! One instance lives inside the scheduler loop. Producers never touch it
//! directly; they enqueue through the companion handle.

pub mod item;
pub mod store;

pub use item::{NewWorkItem, NextStep, Priority, RequestId, RequestState, ResponseKind, WorkItem};
pub use store::{DeadLetterPolicy, FailOutcome, RequestQueue, RetryPolicy};
