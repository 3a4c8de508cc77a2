//! Routes finished calls to their next step.
//!
//! [`NextStep`] is a closed enum and routing is an exhaustive `match`,
//! so a completed item can never arrive with nowhere to go. Handlers run
//! with mutable access to state and queue; a handler error feeds the item
//! into the queue's fail path exactly like a provider failure would.

use chrono::Utc;
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::CallError;
use crate::events::{EventBus, ObserverEvent};
use crate::executor::{CallOutput, CallResult};
use crate::queue::item::{NewWorkItem, NextStep, Priority, RequestId, ResponseKind, WorkItem};
use crate::queue::store::{FailOutcome, RequestQueue};
use crate::state::store::StateStore;
use crate::state::types::{MessageRole, PersonaId};

/// Structured verdict returned by a heartbeat decision call.
#[derive(Debug, Clone, Deserialize)]
pub struct HeartbeatVerdict {
    /// Whether the persona wants to initiate contact.
    pub should_speak: bool,
    /// Model-supplied motivation, surfaced with the event.
    #[serde(default)]
    pub reason: Option<String>,
}

/// One extracted fact about the human.
#[derive(Debug, Clone, Deserialize)]
pub struct FactDraft {
    pub key: String,
    pub content: String,
}

/// One trait adjustment for a persona.
#[derive(Debug, Clone, Deserialize)]
pub struct TraitDelta {
    pub name: String,
    pub delta: f32,
}

/// Context keys a heartbeat item may carry for the follow-up reply.
pub const CONTEXT_FOLLOWUP_SYSTEM: &str = "followup_system";
pub const CONTEXT_FOLLOWUP_USER: &str = "followup_user";

/// Route a finished call: success through its handler, failure straight
/// to the queue's fail path. Cancelled outcomes never reach the router.
pub fn route(result: CallResult, state: &mut StateStore, queue: &mut RequestQueue, events: &EventBus) {
    match result.outcome {
        Ok(output) => route_success(result.item, output, state, queue, events),
        Err(error) => route_failure(&result.item, &error, queue, events),
    }
}

/// Run the item's handler and complete it, or feed a handler error into
/// the fail path.
pub fn route_success(
    item: WorkItem,
    output: CallOutput,
    state: &mut StateStore,
    queue: &mut RequestQueue,
    events: &EventBus,
) {
    let id = item.id;
    match apply(&item, output, state, queue, events) {
        Ok(()) => {
            debug!(id = %id, step = item.next_step.tag(), "handled");
            queue.complete(id);
        }
        Err(message) => {
            let error = CallError::Handler(message);
            warn!(id = %id, step = item.next_step.tag(), error = %error, "handler failed");
            events.emit(ObserverEvent::ErrorOccurred {
                code: error.code(),
                message: error.to_string(),
            });
            fail_item(id, &error, queue, events);
        }
    }
}

/// Record a failed outcome against the item's retry budget.
pub fn route_failure(
    item: &WorkItem,
    error: &CallError,
    queue: &mut RequestQueue,
    events: &EventBus,
) {
    warn!(id = %item.id, step = item.next_step.tag(), error = %error, "call failed");
    events.emit(ObserverEvent::ErrorOccurred {
        code: error.code(),
        message: error.to_string(),
    });
    fail_item(item.id, error, queue, events);
}

fn fail_item(id: RequestId, error: &CallError, queue: &mut RequestQueue, events: &EventBus) {
    match queue.fail(id, &error.to_string(), Utc::now()) {
        Some(FailOutcome::Requeued { retry_after }) => {
            debug!(id = %id, retry_after = %retry_after, "requeued for retry");
        }
        Some(FailOutcome::DeadLettered) => {
            warn!(id = %id, error = %error, "dead-lettered");
            events.emit(ObserverEvent::RequestDeadLettered {
                id,
                error: error.to_string(),
            });
        }
        None => warn!(id = %id, "failed item no longer tracked by queue"),
    }
}

/// Exhaustive step dispatch. Each arm mutates state, then emits the
/// step's observer notification. Errors are handler-failure text.
fn apply(
    item: &WorkItem,
    output: CallOutput,
    state: &mut StateStore,
    queue: &mut RequestQueue,
    events: &EventBus,
) -> Result<(), String> {
    match &item.next_step {
        NextStep::PersonaReply { persona } => {
            let content = into_text(output);
            let message = state
                .append_message(*persona, MessageRole::Assistant, content)
                .map_err(|e| e.to_string())?;
            events.emit(ObserverEvent::MessageAppended {
                persona: *persona,
                message,
            });
            Ok(())
        }
        NextStep::HeartbeatDecision { persona } => {
            let verdict: HeartbeatVerdict = typed(output)?;
            if verdict.should_speak {
                info!(persona = %persona, reason = ?verdict.reason, "persona wants to speak");
                events.emit(ObserverEvent::PersonaWantsToSpeak {
                    persona: *persona,
                    reason: verdict.reason,
                });
                enqueue_followup(item, *persona, queue);
            }
            events.emit(ObserverEvent::PersonaChanged { persona: *persona });
            Ok(())
        }
        NextStep::FactExtraction { persona } => {
            let facts: Vec<FactDraft> = typed(output)?;
            let count = facts.len();
            for fact in facts {
                state.upsert_fact(fact.key, fact.content, Some(*persona));
            }
            debug!(persona = %persona, count, "merged extracted facts");
            events.emit(ObserverEvent::HumanDataChanged);
            Ok(())
        }
        NextStep::TraitAdjustment { persona } => {
            let deltas: Vec<TraitDelta> = typed(output)?;
            for delta in &deltas {
                state
                    .apply_trait_delta(*persona, &delta.name, delta.delta)
                    .map_err(|e| e.to_string())?;
            }
            events.emit(ObserverEvent::PersonaChanged { persona: *persona });
            Ok(())
        }
        NextStep::CeremonyDigest => {
            let date = Utc::now().date_naive();
            state.record_digest(date, into_text(output));
            info!(%date, "ceremony digest recorded");
            events.emit(ObserverEvent::CeremonyCompleted { date });
            Ok(())
        }
        NextStep::OneShot { label } => {
            events.emit(ObserverEvent::OneShotCompleted {
                label: label.clone(),
                content: into_text(output),
            });
            Ok(())
        }
    }
}

/// When a heartbeat item carries follow-up prompts in its context, the
/// wants-to-speak verdict enqueues the actual reply.
fn enqueue_followup(item: &WorkItem, persona: PersonaId, queue: &mut RequestQueue) {
    let system = item.context.get(CONTEXT_FOLLOWUP_SYSTEM).and_then(|v| v.as_str());
    let user = item.context.get(CONTEXT_FOLLOWUP_USER).and_then(|v| v.as_str());
    let (Some(system), Some(user)) = (system, user) else {
        return;
    };
    let mut follow = NewWorkItem::new(NextStep::PersonaReply { persona })
        .prompts(system, user)
        .kind(ResponseKind::FreeText)
        .priority(Priority::Low);
    if let Some(turns) = item.transcript_turns {
        follow = follow.with_transcript(turns);
    }
    if queue.enqueue(follow).is_none() {
        debug!(persona = %persona, "queue shut down, dropping follow-up");
    }
}

/// The text of any output kind.
fn into_text(output: CallOutput) -> String {
    match output {
        CallOutput::FreeText(text) | CallOutput::Raw(text) => text,
        CallOutput::Structured { content, .. } => content,
    }
}

/// Deserialize a structured output into the handler's expected shape.
fn typed<T: serde::de::DeserializeOwned>(output: CallOutput) -> Result<T, String> {
    let CallOutput::Structured { value, .. } = output else {
        return Err("expected structured output".to_owned());
    };
    serde_json::from_value(value).map_err(|e| format!("payload shape mismatch: {e}"))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use serde_json::json;

    use super::*;
    use crate::error::error_codes;
    use crate::events::EventBus;
    use crate::queue::item::RequestState;
    use crate::state::types::{MessageRole, Persona, PersonaId};

    fn fixture() -> (StateStore, RequestQueue, EventBus, PersonaId) {
        let mut state = StateStore::new(100);
        let persona = state.add_persona(Persona::new("Rowan", 1800));
        (state, RequestQueue::default(), EventBus::new(16), persona)
    }

    /// Enqueue, claim, and clone an item the way the loop does.
    fn claimed(queue: &mut RequestQueue, new: NewWorkItem) -> WorkItem {
        let id = queue.enqueue(new).unwrap();
        queue.mark_processing(id);
        queue.get(id).unwrap().clone()
    }

    fn structured(value: serde_json::Value) -> CallOutput {
        CallOutput::Structured {
            content: value.to_string(),
            value,
        }
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ObserverEvent>) -> Vec<ObserverEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    // ── per-step handlers ────────────────────────────────────

    #[test]
    fn persona_reply_appends_assistant_message() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::PersonaReply { persona }),
        );

        route_success(
            item,
            CallOutput::FreeText("good morning!".into()),
            &mut state,
            &mut queue,
            &events,
        );

        let last = state.messages().last().unwrap();
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "good morning!");
        assert!(queue.items().is_empty(), "completed item is removed");
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::MessageAppended { .. }))
        );
    }

    #[test]
    fn heartbeat_speak_verdict_emits_and_enqueues_followup() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::HeartbeatDecision { persona })
                .with_transcript(10)
                .context(json!({
                    "followup_system": "You are Rowan.",
                    "followup_user": "Say what's on your mind.",
                })),
        );

        route_success(
            item,
            structured(json!({"should_speak": true, "reason": "quiet afternoon"})),
            &mut state,
            &mut queue,
            &events,
        );

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(
            e,
            ObserverEvent::PersonaWantsToSpeak { reason: Some(r), .. } if r == "quiet afternoon"
        )));
        assert!(
            seen.iter()
                .any(|e| matches!(e, ObserverEvent::PersonaChanged { .. }))
        );

        // The follow-up reply item is pending, carrying the transcript window.
        assert_eq!(queue.pending_count(), 1);
        let follow = &queue.items()[0];
        assert_eq!(follow.next_step, NextStep::PersonaReply { persona });
        assert_eq!(follow.priority, Priority::Low);
        assert_eq!(follow.transcript_turns, Some(10));
    }

    #[test]
    fn heartbeat_quiet_verdict_enqueues_nothing() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::HeartbeatDecision { persona })
                .context(json!({"followup_system": "s", "followup_user": "u"})),
        );

        route_success(
            item,
            structured(json!({"should_speak": false})),
            &mut state,
            &mut queue,
            &events,
        );

        assert_eq!(queue.pending_count(), 0);
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::PersonaWantsToSpeak { .. }))
        );
    }

    #[test]
    fn fact_extraction_merges_newest_wins() {
        let (mut state, mut queue, events, persona) = fixture();
        state.upsert_fact("job", "student", None);
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::FactExtraction { persona }),
        );

        route_success(
            item,
            structured(json!([
                {"key": "job", "content": "gardener"},
                {"key": "city", "content": "Aberdeen"},
            ])),
            &mut state,
            &mut queue,
            &events,
        );

        assert_eq!(state.facts().len(), 2);
        let job = state.facts().iter().find(|f| f.key == "job").unwrap();
        assert_eq!(job.content, "gardener");
        assert_eq!(job.learned_from, Some(persona));
    }

    #[test]
    fn trait_adjustment_applies_clamped_deltas() {
        let (mut state, mut queue, events, persona) = fixture();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::TraitAdjustment { persona }),
        );

        route_success(
            item,
            structured(json!([{"name": "warmth", "delta": 0.9}])),
            &mut state,
            &mut queue,
            &events,
        );

        let p = state.persona(persona).unwrap();
        assert_eq!(p.traits[0].name, "warmth");
        // 0.5 neutral start + 0.9, clamped.
        assert!((p.traits[0].score - 1.0).abs() < f32::EPSILON);
    }

    #[test]
    fn ceremony_records_digest_for_today() {
        let (mut state, mut queue, events, _persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(&mut queue, NewWorkItem::new(NextStep::CeremonyDigest));

        route_success(
            item,
            CallOutput::FreeText("A calm day of small wins.".into()),
            &mut state,
            &mut queue,
            &events,
        );

        let today = Utc::now().date_naive();
        assert!(state.has_digest_for(today));
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::CeremonyCompleted { date } if *date == today))
        );
    }

    #[test]
    fn one_shot_surfaces_content_verbatim() {
        let (mut state, mut queue, events, _persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::OneShot {
                label: "summary".into(),
            })
            .kind(ResponseKind::Raw),
        );
        let messages_before = state.messages().len();

        route_success(
            item,
            CallOutput::Raw("  raw text, untouched  ".into()),
            &mut state,
            &mut queue,
            &events,
        );

        assert_eq!(state.messages().len(), messages_before);
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ObserverEvent::OneShotCompleted { label, content }
                if label == "summary" && content == "  raw text, untouched  "
        )));
    }

    // ── failure paths ────────────────────────────────────────

    #[test]
    fn payload_shape_mismatch_is_a_handler_failure() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::HeartbeatDecision { persona }),
        );
        let id = item.id;

        route_success(
            item,
            structured(json!({"nope": 1})),
            &mut state,
            &mut queue,
            &events,
        );

        let stored = queue.get(id).unwrap();
        assert_eq!(stored.state, RequestState::Pending);
        assert_eq!(stored.attempts, 1);
        assert!(stored.retry_after.is_some());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ObserverEvent::ErrorOccurred { code, .. } if *code == error_codes::HANDLER_FAILED
        )));
    }

    #[test]
    fn reply_for_unknown_persona_is_a_handler_failure() {
        let (mut state, mut queue, events, _persona) = fixture();
        let stranger = PersonaId::new();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::PersonaReply { persona: stranger }),
        );
        let id = item.id;

        route_success(
            item,
            CallOutput::FreeText("hi".into()),
            &mut state,
            &mut queue,
            &events,
        );

        assert_eq!(queue.get(id).unwrap().attempts, 1);
        assert!(state.messages().is_empty());
    }

    #[test]
    fn failed_outcome_carries_rate_limit_code() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let item = claimed(
            &mut queue,
            NewWorkItem::new(NextStep::PersonaReply { persona }),
        );

        let error = CallError::RateLimited {
            status: 429,
            message: "slow down".into(),
        };
        route(
            CallResult {
                item,
                outcome: Err(error),
            },
            &mut state,
            &mut queue,
            &events,
        );

        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ObserverEvent::ErrorOccurred { code, .. } if *code == error_codes::RATE_LIMITED
        )));
    }

    #[test]
    fn repeated_failures_dead_letter_with_event() {
        let (mut state, mut queue, events, persona) = fixture();
        let mut rx = events.subscribe();
        let id = queue
            .enqueue(NewWorkItem::new(NextStep::PersonaReply { persona }))
            .unwrap();
        let error = CallError::Provider {
            status: 500,
            message: "boom".into(),
        };

        for _ in 0..4 {
            queue.mark_processing(id);
            let item = queue.get(id).unwrap().clone();
            route_failure(&item, &error, &mut queue, &events);
        }

        assert_eq!(queue.get(id).unwrap().state, RequestState::DeadLetter);
        assert_eq!(queue.dead_letters().count(), 1);
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::RequestDeadLettered { .. }))
        );
    }
}
