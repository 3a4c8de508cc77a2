//! Priority queue and dead-letter store.
//!
//! [`RequestQueue`] is a plain in-memory store used only by the scheduler
//! loop, so there is no locking anywhere. Ordering is priority first, then
//! age; retry backoff holds items back without removing them; items that
//! exhaust the retry budget move to the dead-letter set instead of being
//! dropped.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::queue::item::{NewWorkItem, RequestId, RequestState, WorkItem};
use crate::state::PersonaId;

/// Queue-level retry policy (distinct from the HTTP client's in-call
/// rate-limit retries).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Failures tolerated before an item dead-letters.
    pub max_attempts: u32,
    /// Base backoff; attempt N waits `initial_backoff_ms * 2^(N-1)`.
    pub initial_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 1000,
        }
    }
}

/// Bounds on the dead-letter set.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DeadLetterPolicy {
    /// Entries older than this are rolled off.
    pub max_age_hours: u64,
    /// At most this many entries are kept (oldest rolled off first).
    pub max_entries: usize,
}

impl Default for DeadLetterPolicy {
    fn default() -> Self {
        Self {
            max_age_hours: 72,
            max_entries: 200,
        }
    }
}

/// Outcome of the fail path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Attempt recorded; item is pending again once the backoff elapses.
    Requeued { retry_after: DateTime<Utc> },
    /// Retry budget exhausted; item moved to the dead-letter set.
    DeadLettered,
}

/// In-memory work queue with a dead-letter set.
#[derive(Debug)]
pub struct RequestQueue {
    items: Vec<WorkItem>,
    next_seq: u64,
    paused: bool,
    shut_down: bool,
    retry: RetryPolicy,
    dead_letter: DeadLetterPolicy,
}

impl RequestQueue {
    pub fn new(retry: RetryPolicy, dead_letter: DeadLetterPolicy) -> Self {
        Self {
            items: Vec::new(),
            next_seq: 0,
            paused: false,
            shut_down: false,
            retry,
            dead_letter,
        }
    }

    /// Rebuild a queue from checkpointed items.
    ///
    /// Items left in `Processing` by a crash are downgraded to `Pending`;
    /// their attempt was never accounted, so re-running is correct.
    pub fn from_items(
        items: Vec<WorkItem>,
        retry: RetryPolicy,
        dead_letter: DeadLetterPolicy,
    ) -> Self {
        let mut queue = Self::new(retry, dead_letter);
        queue.next_seq = items.iter().map(|i| i.seq + 1).max().unwrap_or(0);
        queue.items = items;
        for item in &mut queue.items {
            if item.state == RequestState::Processing {
                debug!(id = %item.id, "recovered in-flight item to pending");
                item.state = RequestState::Pending;
            }
        }
        queue
    }

    /// Append a pending item.
    ///
    /// Returns `None` once the queue has shut down; there is no sentinel
    /// id to misinterpret.
    pub fn enqueue(&mut self, new: NewWorkItem) -> Option<RequestId> {
        if self.shut_down {
            return None;
        }
        let item = new.into_item(self.next_seq);
        self.next_seq += 1;
        let id = item.id;
        debug!(id = %id, step = item.next_step.tag(), priority = ?item.priority, "enqueued");
        self.items.push(item);
        Some(id)
    }

    /// The highest-priority dispatchable item: priority first, then
    /// earliest creation (enqueue order breaks exact timestamp ties).
    /// Yields nothing while paused. Does not claim the item.
    pub fn peek_ready(&self, now: DateTime<Utc>) -> Option<&WorkItem> {
        if self.paused {
            return None;
        }
        self.items.iter().filter(|i| i.is_ready(now)).max_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| b.created_at.cmp(&a.created_at))
                .then_with(|| b.seq.cmp(&a.seq))
        })
    }

    /// Explicit `Pending -> Processing` transition. Peek never claims.
    pub fn mark_processing(&mut self, id: RequestId) -> bool {
        match self.find_mut(id) {
            Some(item) if item.state == RequestState::Pending => {
                item.state = RequestState::Processing;
                true
            }
            _ => false,
        }
    }

    /// Remove a finished item outright.
    pub fn complete(&mut self, id: RequestId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        self.items.len() < before
    }

    /// Record a failed attempt.
    ///
    /// Within the retry budget the item returns to `Pending` with
    /// `retry_after = now + initial_backoff * 2^(attempts-1)`; past it the
    /// item dead-letters with the error recorded. Returns `None` for an
    /// unknown id.
    pub fn fail(&mut self, id: RequestId, error: &str, now: DateTime<Utc>) -> Option<FailOutcome> {
        let max_attempts = self.retry.max_attempts;
        let base_ms = self.retry.initial_backoff_ms;
        let item = self.find_mut(id)?;

        item.attempts += 1;
        item.last_attempt_at = Some(now);
        item.last_error = Some(error.to_owned());

        if item.attempts <= max_attempts {
            let exponent = u32::min(item.attempts - 1, 20);
            let delay_ms = base_ms.saturating_mul(1u64 << exponent);
            let retry_after = now + Duration::milliseconds(delay_ms as i64);
            item.retry_after = Some(retry_after);
            item.state = RequestState::Pending;
            debug!(id = %id, attempts = item.attempts, delay_ms, "requeued after failure");
            Some(FailOutcome::Requeued { retry_after })
        } else {
            item.state = RequestState::DeadLetter;
            item.retry_after = None;
            item.dead_lettered_at = Some(now);
            debug!(id = %id, attempts = item.attempts, "dead-lettered");
            self.enforce_dead_letter_cap();
            Some(FailOutcome::DeadLettered)
        }
    }

    /// Return a `Processing` item to `Pending` without counting an
    /// attempt. Used when a cancelled call should run again later.
    pub fn release(&mut self, id: RequestId) -> bool {
        match self.find_mut(id) {
            Some(item) if item.state == RequestState::Processing => {
                item.state = RequestState::Pending;
                true
            }
            _ => false,
        }
    }

    /// Drop an item in any state (superseded work).
    pub fn remove(&mut self, id: RequestId) -> bool {
        let before = self.items.len();
        self.items.retain(|i| i.id != id);
        self.items.len() < before
    }

    /// Stop dispatching. Enqueues are still accepted and in-flight work
    /// is unaffected.
    pub fn pause(&mut self) {
        self.paused = true;
    }

    pub fn resume(&mut self) {
        self.paused = false;
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Remove every `Pending` item the predicate selects, returning their
    /// ids. `Processing` and dead-letter items are untouched.
    pub fn clear_matching(&mut self, predicate: impl Fn(&WorkItem) -> bool) -> Vec<RequestId> {
        let mut cleared = Vec::new();
        self.items.retain(|i| {
            if i.state == RequestState::Pending && predicate(i) {
                cleared.push(i.id);
                false
            } else {
                true
            }
        });
        cleared
    }

    /// Remove pending work concerning one persona (a superseded turn).
    pub fn clear_for_subject(&mut self, persona: PersonaId) -> Vec<RequestId> {
        self.clear_matching(|i| i.next_step.subject() == Some(persona))
    }

    /// Reject all future enqueues.
    pub fn shut_down(&mut self) {
        self.shut_down = true;
    }

    /// Roll expired and excess entries off the dead-letter set. Returns
    /// how many were removed.
    pub fn roll_off_dead_letters(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - Duration::hours(self.dead_letter.max_age_hours as i64);
        let before = self.items.len();
        self.items.retain(|i| {
            i.state != RequestState::DeadLetter
                || i.dead_lettered_at.is_none_or(|at| at > cutoff)
        });
        let aged_out = before - self.items.len();
        aged_out + self.enforce_dead_letter_cap()
    }

    /// Drop the whole dead-letter set. Returns how many were removed.
    pub fn clear_dead_letters(&mut self) -> usize {
        let before = self.items.len();
        self.items.retain(|i| i.state != RequestState::DeadLetter);
        before - self.items.len()
    }

    fn enforce_dead_letter_cap(&mut self) -> usize {
        let mut dead: Vec<(DateTime<Utc>, RequestId)> = self
            .items
            .iter()
            .filter(|i| i.state == RequestState::DeadLetter)
            .map(|i| (i.dead_lettered_at.unwrap_or(i.created_at), i.id))
            .collect();
        if dead.len() <= self.dead_letter.max_entries {
            return 0;
        }
        dead.sort_by_key(|(at, _)| *at);
        let excess = dead.len() - self.dead_letter.max_entries;
        let drop_ids: Vec<RequestId> = dead.iter().take(excess).map(|(_, id)| *id).collect();
        self.items.retain(|i| !drop_ids.contains(&i.id));
        excess
    }

    // --- introspection ---

    fn find_mut(&mut self, id: RequestId) -> Option<&mut WorkItem> {
        self.items.iter_mut().find(|i| i.id == id)
    }

    pub fn get(&self, id: RequestId) -> Option<&WorkItem> {
        self.items.iter().find(|i| i.id == id)
    }

    pub fn items(&self) -> &[WorkItem] {
        &self.items
    }

    pub fn dead_letters(&self) -> impl Iterator<Item = &WorkItem> {
        self.items
            .iter()
            .filter(|i| i.state == RequestState::DeadLetter)
    }

    pub fn pending_count(&self) -> usize {
        self.items
            .iter()
            .filter(|i| i.state == RequestState::Pending)
            .count()
    }

    /// True when any non-dead item matches (pending or in flight). Used
    /// to avoid enqueueing duplicate scheduled work.
    pub fn has_live_matching(&self, predicate: impl Fn(&WorkItem) -> bool) -> bool {
        self.items
            .iter()
            .any(|i| i.state != RequestState::DeadLetter && predicate(i))
    }

    /// Snapshot of every item for checkpointing.
    pub fn export_items(&self) -> Vec<WorkItem> {
        self.items.clone()
    }
}

impl Default for RequestQueue {
    fn default() -> Self {
        Self::new(RetryPolicy::default(), DeadLetterPolicy::default())
    }
}
