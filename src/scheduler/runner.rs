//! The scheduler loop task.
//!
//! One spawned task owns the queue, the state store, the checkpoint, and
//! the executor. It is the sole mutator of all of them, which is what
//! makes the rest of the crate lock-free: commands arrive over a channel,
//! completions arrive over a channel, and a tick timer drives maintenance.
//! Dispatch is eager; it runs after every command and completion, so the
//! tick interval bounds maintenance latency only.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{DateTime, Timelike, Utc};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::CompanionConfig;
use crate::error::{CallError, KindredError, Result};
use crate::events::{EventBus, ObserverEvent, QueueActivity};
use crate::executor::{CallResult, SingleFlightExecutor};
use crate::queue::item::{NewWorkItem, NextStep, Priority, RequestId, ResponseKind, WorkItem};
use crate::queue::store::RequestQueue;
use crate::router::{self, CONTEXT_FOLLOWUP_SYSTEM, CONTEXT_FOLLOWUP_USER};
use crate::scheduler::prompts::TriggerPrompts;
use crate::state::checkpoint::{CheckpointStore, Snapshot};
use crate::state::store::StateStore;
use crate::state::types::{MessageId, MessageRole, Persona, PersonaId};

/// Name of the persona seeded on a first run with no checkpoint.
pub const DEFAULT_PERSONA_NAME: &str = "Rowan";

/// Requests sent from the [`Companion`](super::Companion) handle to the
/// loop task. State-observing commands reply over a oneshot.
pub(crate) enum Command {
    Enqueue {
        new: NewWorkItem,
        reply: oneshot::Sender<Option<RequestId>>,
    },
    AppendUserMessage {
        persona: PersonaId,
        content: String,
        reply: oneshot::Sender<Result<MessageId>>,
    },
    CreatePersona {
        name: String,
        heartbeat_delay_secs: u64,
        reply: oneshot::Sender<PersonaId>,
    },
    Personas {
        reply: oneshot::Sender<Vec<Persona>>,
    },
    SetPersonaPaused {
        persona: PersonaId,
        paused: bool,
        reply: oneshot::Sender<Result<()>>,
    },
    /// Clear pending work for a persona and abort a matching in-flight
    /// call; the aborted item is dropped, not retried.
    CancelSubject {
        persona: PersonaId,
        reply: oneshot::Sender<Vec<RequestId>>,
    },
    /// Operator abort: the in-flight item returns to pending.
    AbortInFlight,
    Pause,
    Resume,
    QueueSnapshot {
        reply: oneshot::Sender<Vec<WorkItem>>,
    },
    ClearDeadLetters {
        reply: oneshot::Sender<usize>,
    },
    FlushNow {
        reply: oneshot::Sender<Result<()>>,
    },
    Stop {
        reply: oneshot::Sender<()>,
    },
}

/// What to do with an aborted item once its cancelled result lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CancelDisposition {
    /// Return to pending without counting an attempt.
    Release,
    /// Superseded work; drop it entirely.
    Remove,
}

/// Restore state and queue from the checkpoint, or seed a first run.
///
/// A corrupt checkpoint is an error, not a silent reset; discarding it
/// would lose the user's history.
pub(crate) fn bootstrap(
    config: &CompanionConfig,
    checkpoint: &CheckpointStore,
) -> Result<(StateStore, RequestQueue, Option<DateTime<Utc>>)> {
    let retry = config.queue.retry_policy();
    let dead_letter = config.queue.dead_letter_policy();
    match checkpoint.load()? {
        Some(snapshot) => {
            info!(
                saved_at = %snapshot.saved_at,
                personas = snapshot.personas.len(),
                messages = snapshot.messages.len(),
                items = snapshot.queue.len(),
                "restoring from checkpoint"
            );
            let state = StateStore::restore(
                snapshot.personas,
                snapshot.messages,
                snapshot.facts,
                snapshot.digests,
                config.state.max_messages,
            );
            let queue = RequestQueue::from_items(snapshot.queue, retry, dead_letter);
            Ok((state, queue, Some(snapshot.saved_at)))
        }
        None => {
            info!(name = DEFAULT_PERSONA_NAME, "first run, seeding default persona");
            let mut state = StateStore::new(config.state.max_messages);
            let persona = state.add_persona(Persona::new(
                DEFAULT_PERSONA_NAME,
                config.scheduler.default_heartbeat_delay_secs,
            ));
            state.append_message(
                persona,
                MessageRole::Assistant,
                format!("Hi, I'm {DEFAULT_PERSONA_NAME}. I'm here whenever you want to talk."),
            )?;
            Ok((state, RequestQueue::new(retry, dead_letter), None))
        }
    }
}

/// The loop task's working set. Constructed by
/// [`CompanionBuilder::spawn`](super::CompanionBuilder::spawn).
pub(crate) struct Runner {
    pub(crate) config: CompanionConfig,
    pub(crate) state: StateStore,
    pub(crate) queue: RequestQueue,
    pub(crate) checkpoint: CheckpointStore,
    pub(crate) executor: SingleFlightExecutor,
    pub(crate) events: EventBus,
    pub(crate) prompts: Arc<dyn TriggerPrompts>,
    pub(crate) commands: mpsc::UnboundedReceiver<Command>,
    pub(crate) completions: mpsc::UnboundedReceiver<CallResult>,
    /// Disposition for the in-flight item an abort was requested for.
    pub(crate) pending_cancel: Option<(RequestId, CancelDisposition)>,
    pub(crate) restored_at: Option<DateTime<Utc>>,
    pub(crate) instance_gauge: Option<Arc<AtomicUsize>>,
}

impl Runner {
    pub(crate) async fn run(mut self) {
        if let Some(saved_at) = self.restored_at {
            self.events
                .emit(ObserverEvent::CheckpointRestored { saved_at });
        }
        info!(
            personas = self.state.personas().len(),
            pending = self.queue.pending_count(),
            "companion loop started"
        );

        let mut tick = tokio::time::interval(self.config.scheduler.tick_interval());
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Stop { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => {
                        self.handle_command(command);
                        self.dispatch();
                    }
                    None => {
                        debug!("all companion handles dropped");
                        self.shutdown().await;
                        break;
                    }
                },
                Some(result) = self.completions.recv() => {
                    self.handle_completion(result);
                    self.dispatch();
                }
                _ = tick.tick() => {
                    self.maintain(Utc::now());
                    self.dispatch();
                }
            }
        }

        if let Some(gauge) = &self.instance_gauge {
            gauge.fetch_sub(1, Ordering::SeqCst);
        }
        info!("companion loop stopped");
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enqueue { new, reply } => {
                let id = self.queue.enqueue(new);
                if id.is_some() {
                    self.checkpoint.mark_dirty();
                }
                let _ = reply.send(id);
            }
            Command::AppendUserMessage {
                persona,
                content,
                reply,
            } => {
                let result = self.state.append_message(persona, MessageRole::User, content);
                if let Ok(message) = &result {
                    self.checkpoint.mark_dirty();
                    self.events.emit(ObserverEvent::MessageAppended {
                        persona,
                        message: *message,
                    });
                }
                let _ = reply.send(result);
            }
            Command::CreatePersona {
                name,
                heartbeat_delay_secs,
                reply,
            } => {
                let id = self.state.add_persona(Persona::new(name, heartbeat_delay_secs));
                info!(persona = %id, "persona created");
                self.checkpoint.mark_dirty();
                self.events.emit(ObserverEvent::PersonaChanged { persona: id });
                let _ = reply.send(id);
            }
            Command::Personas { reply } => {
                let _ = reply.send(self.state.personas().to_vec());
            }
            Command::SetPersonaPaused {
                persona,
                paused,
                reply,
            } => {
                let result = match self.state.persona_mut(persona) {
                    Some(p) => {
                        p.paused = paused;
                        self.checkpoint.mark_dirty();
                        self.events.emit(ObserverEvent::PersonaChanged { persona });
                        Ok(())
                    }
                    None => Err(KindredError::State(format!("unknown persona {persona}"))),
                };
                let _ = reply.send(result);
            }
            Command::CancelSubject { persona, reply } => {
                let mut cleared = self.queue.clear_for_subject(persona);
                if let Some(id) = self.executor.in_flight()
                    && self
                        .queue
                        .get(id)
                        .is_some_and(|item| item.next_step.subject() == Some(persona))
                {
                    self.pending_cancel = Some((id, CancelDisposition::Remove));
                    self.executor.abort();
                    cleared.push(id);
                }
                if !cleared.is_empty() {
                    info!(persona = %persona, cleared = cleared.len(), "cancelled persona work");
                    self.checkpoint.mark_dirty();
                }
                let _ = reply.send(cleared);
            }
            Command::AbortInFlight => {
                if let Some(id) = self.executor.in_flight() {
                    self.pending_cancel = Some((id, CancelDisposition::Release));
                    self.executor.abort();
                }
            }
            Command::Pause => {
                self.queue.pause();
                self.events.emit(ObserverEvent::QueueState {
                    activity: QueueActivity::Paused,
                });
            }
            Command::Resume => {
                self.queue.resume();
                let activity = if self.executor.is_busy() {
                    QueueActivity::Busy
                } else {
                    QueueActivity::Idle
                };
                self.events.emit(ObserverEvent::QueueState { activity });
            }
            Command::QueueSnapshot { reply } => {
                let _ = reply.send(self.queue.export_items());
            }
            Command::ClearDeadLetters { reply } => {
                let cleared = self.queue.clear_dead_letters();
                if cleared > 0 {
                    self.checkpoint.mark_dirty();
                }
                let _ = reply.send(cleared);
            }
            Command::FlushNow { reply } => {
                let _ = reply.send(self.save_checkpoint());
            }
            Command::Stop { .. } => unreachable!("stop is handled by the loop"),
        }
    }

    /// Acknowledge a finished call and route its outcome. Cancelled
    /// outcomes bypass the router entirely: never counted, no events.
    fn handle_completion(&mut self, result: CallResult) {
        let id = result.item.id;
        self.executor.on_completed(id);

        let disposition = if self.pending_cancel.is_some_and(|(pending, _)| pending == id) {
            self.pending_cancel.take().map(|(_, d)| d)
        } else {
            None
        };

        if matches!(result.outcome, Err(CallError::Cancelled)) {
            match disposition.unwrap_or(CancelDisposition::Release) {
                CancelDisposition::Release => {
                    debug!(id = %id, "cancelled call released to pending");
                    self.queue.release(id);
                }
                CancelDisposition::Remove => {
                    debug!(id = %id, "cancelled call removed as superseded");
                    self.queue.remove(id);
                }
            }
            self.checkpoint.mark_dirty();
        } else {
            router::route(result, &mut self.state, &mut self.queue, &self.events);
            self.checkpoint.mark_dirty();
        }

        if !self.executor.is_busy() {
            self.events.emit(ObserverEvent::QueueState {
                activity: QueueActivity::Idle,
            });
        }
    }

    /// Start the highest-priority ready item when the executor is free.
    fn dispatch(&mut self) {
        if self.executor.is_busy() {
            return;
        }
        let now = Utc::now();
        let Some(item) = self.queue.peek_ready(now) else {
            return;
        };
        let item = item.clone();
        let id = item.id;
        if !self.queue.mark_processing(id) {
            warn!(id = %id, "peeked item could not be claimed");
            return;
        }
        self.events.emit(ObserverEvent::QueueState {
            activity: QueueActivity::Busy,
        });
        if let Err(e) = self.executor.start(item, &self.state) {
            warn!(id = %id, error = %e, "dispatch failed, releasing item");
            self.queue.release(id);
        }
    }

    /// Debounced checkpoint, dead-letter roll-off, and scheduled-work
    /// triggers. Runs on every tick.
    fn maintain(&mut self, now: DateTime<Utc>) {
        if self.checkpoint.due()
            && let Err(e) = self.save_checkpoint()
        {
            warn!(error = %e, "debounced checkpoint save failed");
        }

        let rolled = self.queue.roll_off_dead_letters(now);
        if rolled > 0 {
            debug!(rolled, "rolled expired dead letters off");
            self.checkpoint.mark_dirty();
        }

        self.trigger_heartbeats(now);
        self.trigger_ceremony(now);
    }

    /// Enqueue a heartbeat decision for every active persona whose quiet
    /// stretch has outlasted its delay, unless one is already live.
    fn trigger_heartbeats(&mut self, now: DateTime<Utc>) {
        let due: Vec<Persona> = self
            .state
            .active_personas()
            .filter(|p| heartbeat_due(p, now))
            .filter(|p| {
                let id = p.id;
                !self.queue.has_live_matching(move |item| {
                    item.next_step == NextStep::HeartbeatDecision { persona: id }
                })
            })
            .cloned()
            .collect();

        for persona in due {
            let prompts = self.prompts.heartbeat(&persona);
            let mut context = serde_json::Map::new();
            context.insert(
                CONTEXT_FOLLOWUP_SYSTEM.to_owned(),
                Value::String(prompts.followup_system),
            );
            context.insert(
                CONTEXT_FOLLOWUP_USER.to_owned(),
                Value::String(prompts.followup_user),
            );
            let new = NewWorkItem::new(NextStep::HeartbeatDecision { persona: persona.id })
                .prompts(prompts.system, prompts.user)
                .kind(ResponseKind::Structured)
                .priority(Priority::Low)
                .with_transcript(self.config.state.transcript_turns)
                .context(Value::Object(context));
            if self.queue.enqueue(new).is_some() {
                info!(persona = %persona.id, name = %persona.name, "heartbeat enqueued");
                // Stamped now, not on completion, so the next tick does
                // not re-trigger while the decision is still queued.
                if let Err(e) = self.state.touch_heartbeat(persona.id) {
                    warn!(persona = %persona.id, error = %e, "heartbeat stamp failed");
                }
                self.checkpoint.mark_dirty();
            }
        }
    }

    /// Enqueue the daily digest once the configured hour has passed and
    /// no digest exists for today.
    fn trigger_ceremony(&mut self, now: DateTime<Utc>) {
        if !self.config.scheduler.ceremony_enabled {
            return;
        }
        if now.hour() < u32::from(self.config.scheduler.ceremony_hour) {
            return;
        }
        let today = now.date_naive();
        if self.state.has_digest_for(today)
            || self
                .queue
                .has_live_matching(|item| item.next_step == NextStep::CeremonyDigest)
        {
            return;
        }
        let prompts = self.prompts.ceremony(today);
        let new = NewWorkItem::new(NextStep::CeremonyDigest)
            .prompts(prompts.system, prompts.user)
            .kind(ResponseKind::FreeText)
            .priority(Priority::Low);
        if self.queue.enqueue(new).is_some() {
            info!(%today, "ceremony enqueued");
            self.checkpoint.mark_dirty();
        }
    }

    fn save_checkpoint(&mut self) -> Result<()> {
        let snapshot = Snapshot::capture(&self.state, &self.queue);
        self.checkpoint.save(&snapshot)?;
        self.events.emit(ObserverEvent::CheckpointSaved {
            at: snapshot.saved_at,
        });
        Ok(())
    }

    /// Graceful stop: no new enqueues, cancel in-flight work and wait for
    /// it to land, then write the final checkpoint unconditionally.
    async fn shutdown(&mut self) {
        info!("companion loop stopping");
        self.queue.shut_down();

        if let Some(id) = self.executor.in_flight() {
            // A released item survives in the checkpoint and re-runs on
            // the next start; a CancelSubject disposition is kept as is.
            if !self.pending_cancel.is_some_and(|(pending, _)| pending == id) {
                self.pending_cancel = Some((id, CancelDisposition::Release));
            }
            self.executor.abort();
            self.executor.join().await;
        }
        while let Ok(result) = self.completions.try_recv() {
            self.handle_completion(result);
        }

        if let Err(e) = self.save_checkpoint() {
            warn!(error = %e, "final checkpoint save failed");
        }
        self.events.emit(ObserverEvent::Stopped);
    }
}

/// Inactivity is measured from the latest signal for the persona: the
/// last user message, the last heartbeat attempt, or creation.
fn heartbeat_due(persona: &Persona, now: DateTime<Utc>) -> bool {
    let mut anchor = persona.created_at;
    if let Some(at) = persona.last_user_activity {
        anchor = anchor.max(at);
    }
    if let Some(at) = persona.last_heartbeat_attempt {
        anchor = anchor.max(at);
    }
    now.signed_duration_since(anchor).num_seconds() >= persona.heartbeat_delay_secs as i64
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::time::Duration;

    use async_trait::async_trait;
    use chrono::TimeZone;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::error::error_codes;
    use crate::provider::account::ResolvedCall;
    use crate::provider::client::{ChatRequest, Completion, CompletionApi, FinishReason};
    use crate::queue::item::RequestState;
    use crate::scheduler::prompts::DefaultTriggerPrompts;

    /// Always answers with the same completion.
    struct ScriptedApi(String);

    #[async_trait]
    impl CompletionApi for ScriptedApi {
        async fn complete(
            &self,
            _call: &ResolvedCall,
            _request: &ChatRequest,
            _cancel: &CancellationToken,
        ) -> std::result::Result<Completion, CallError> {
            Ok(Completion {
                content: self.0.clone(),
                finish: FinishReason::Stop,
            })
        }
    }

    /// Blocks until the call is cancelled.
    struct HangUntilCancelled;

    #[async_trait]
    impl CompletionApi for HangUntilCancelled {
        async fn complete(
            &self,
            _call: &ResolvedCall,
            _request: &ChatRequest,
            cancel: &CancellationToken,
        ) -> std::result::Result<Completion, CallError> {
            cancel.cancelled().await;
            Err(CallError::Cancelled)
        }
    }

    fn runner_with(api: Arc<dyn CompletionApi>) -> Runner {
        runner_with_checkpoint(api, CheckpointStore::new(None, Duration::from_secs(3600)).unwrap())
    }

    fn runner_with_checkpoint(api: Arc<dyn CompletionApi>, checkpoint: CheckpointStore) -> Runner {
        let config = CompanionConfig::default();
        let (_tx, commands) = mpsc::unbounded_channel();
        let (completion_tx, completions) = mpsc::unbounded_channel();
        let executor =
            SingleFlightExecutor::new(api, Vec::new(), "local:test-model", 0.7, completion_tx);
        Runner {
            config,
            state: StateStore::new(100),
            queue: RequestQueue::default(),
            checkpoint,
            executor,
            events: EventBus::new(64),
            prompts: Arc::new(DefaultTriggerPrompts),
            commands,
            completions,
            pending_cancel: None,
            restored_at: None,
            instance_gauge: None,
        }
    }

    /// Send a command directly and read its synchronous reply.
    fn command_reply<T>(runner: &mut Runner, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> T {
        let (tx, mut rx) = oneshot::channel();
        runner.handle_command(make(tx));
        rx.try_recv().expect("reply sent synchronously")
    }

    fn drain(rx: &mut tokio::sync::broadcast::Receiver<ObserverEvent>) -> Vec<ObserverEvent> {
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            seen.push(event);
        }
        seen
    }

    fn reply_item(persona: PersonaId) -> NewWorkItem {
        NewWorkItem::new(NextStep::PersonaReply { persona }).prompts("You are kind.", "Say hi.")
    }

    // ── commands and dispatch ────────────────────────────────

    #[tokio::test]
    async fn enqueued_reply_executes_and_lands_in_state() {
        let mut runner = runner_with(Arc::new(ScriptedApi("good evening!".into())));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));

        let id = command_reply(&mut runner, |reply| Command::Enqueue {
            new: reply_item(persona),
            reply,
        })
        .expect("queue accepts");
        runner.dispatch();
        assert!(runner.executor.is_busy());
        assert_eq!(runner.executor.in_flight(), Some(id));

        let result = runner.completions.recv().await.expect("completion");
        runner.handle_completion(result);

        assert!(!runner.executor.is_busy());
        assert!(runner.queue.items().is_empty());
        let last = runner.state.messages().last().expect("reply stored");
        assert_eq!(last.role, MessageRole::Assistant);
        assert_eq!(last.content, "good evening!");
    }

    #[tokio::test]
    async fn dispatch_starts_highest_priority_first() {
        let mut runner = runner_with(Arc::new(HangUntilCancelled));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));

        let _low = runner
            .queue
            .enqueue(reply_item(persona).priority(Priority::Low))
            .unwrap();
        let high = runner
            .queue
            .enqueue(reply_item(persona).priority(Priority::High))
            .unwrap();

        runner.dispatch();
        assert_eq!(runner.executor.in_flight(), Some(high));
    }

    #[tokio::test]
    async fn append_user_message_stamps_activity_and_notifies() {
        let mut runner = runner_with(Arc::new(ScriptedApi("ok".into())));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let mut rx = runner.events.subscribe();

        let message = command_reply(&mut runner, |reply| Command::AppendUserMessage {
            persona,
            content: "hello there".into(),
            reply,
        })
        .expect("persona exists");

        assert!(runner.state.message(message).is_some());
        assert!(runner.state.persona(persona).unwrap().last_user_activity.is_some());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::MessageAppended { .. }))
        );
    }

    #[tokio::test]
    async fn persona_commands_create_list_and_pause() {
        let mut runner = runner_with(Arc::new(ScriptedApi("ok".into())));

        let id = command_reply(&mut runner, |reply| Command::CreatePersona {
            name: "Wren".into(),
            heartbeat_delay_secs: 0,
            reply,
        });
        let personas = command_reply(&mut runner, |reply| Command::Personas { reply });
        assert_eq!(personas.len(), 1);
        assert_eq!(personas[0].name, "Wren");

        command_reply(&mut runner, |reply| Command::SetPersonaPaused {
            persona: id,
            paused: true,
            reply,
        })
        .expect("persona exists");
        assert!(runner.state.persona(id).unwrap().paused);

        // A paused persona gets no heartbeat even with a zero delay.
        runner.trigger_heartbeats(Utc::now());
        assert!(runner.queue.items().is_empty());
    }

    #[tokio::test]
    async fn pause_gates_dispatch_until_resume() {
        let mut runner = runner_with(Arc::new(ScriptedApi("ok".into())));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let mut rx = runner.events.subscribe();

        runner.handle_command(Command::Pause);
        runner.queue.enqueue(reply_item(persona)).unwrap();
        runner.dispatch();
        assert!(!runner.executor.is_busy());

        runner.handle_command(Command::Resume);
        runner.dispatch();
        assert!(runner.executor.is_busy());

        let seen = drain(&mut rx);
        assert!(seen.iter().any(|e| matches!(
            e,
            ObserverEvent::QueueState { activity: QueueActivity::Paused }
        )));
        assert!(seen.iter().any(|e| matches!(
            e,
            ObserverEvent::QueueState { activity: QueueActivity::Busy }
        )));
    }

    // ── cancellation ─────────────────────────────────────────

    #[tokio::test]
    async fn abort_in_flight_releases_without_counting() {
        let mut runner = runner_with(Arc::new(HangUntilCancelled));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let id = runner.queue.enqueue(reply_item(persona)).unwrap();
        runner.dispatch();
        let mut rx = runner.events.subscribe();

        runner.handle_command(Command::AbortInFlight);
        let result = runner.completions.recv().await.expect("cancelled result");
        runner.handle_completion(result);

        let item = runner.queue.get(id).expect("item survives");
        assert_eq!(item.state, RequestState::Pending);
        assert_eq!(item.attempts, 0);
        assert!(item.retry_after.is_none());
        // Cancellation reaches no observer as an error.
        assert!(
            !drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::ErrorOccurred { .. }))
        );
    }

    #[tokio::test]
    async fn cancel_subject_drops_pending_and_in_flight() {
        let mut runner = runner_with(Arc::new(HangUntilCancelled));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let other = runner.state.add_persona(Persona::new("Wren", 1800));

        let in_flight = runner.queue.enqueue(reply_item(persona)).unwrap();
        let pending = runner.queue.enqueue(reply_item(persona)).unwrap();
        let unrelated = runner.queue.enqueue(reply_item(other)).unwrap();
        runner.dispatch();
        assert_eq!(runner.executor.in_flight(), Some(in_flight));

        let cleared = command_reply(&mut runner, |reply| Command::CancelSubject {
            persona,
            reply,
        });
        assert!(cleared.contains(&pending));
        assert!(cleared.contains(&in_flight));
        assert!(!cleared.contains(&unrelated));

        let result = runner.completions.recv().await.expect("cancelled result");
        runner.handle_completion(result);

        assert!(runner.queue.get(in_flight).is_none(), "superseded item dropped");
        assert!(runner.queue.get(pending).is_none());
        assert!(runner.queue.get(unrelated).is_some());
        assert_eq!(runner.queue.dead_letters().count(), 0);
    }

    // ── failure handling ─────────────────────────────────────

    #[tokio::test]
    async fn resolution_failure_counts_against_the_item() {
        let mut runner = runner_with(Arc::new(ScriptedApi("unused".into())));
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let mut rx = runner.events.subscribe();

        let id = runner
            .queue
            .enqueue(reply_item(persona).model_override("nonsuch:model"))
            .unwrap();
        runner.dispatch();
        // Nothing went in flight; the failure is already queued.
        assert!(!runner.executor.is_busy());

        let result = runner.completions.recv().await.expect("failure result");
        runner.handle_completion(result);

        let item = runner.queue.get(id).expect("still tracked");
        assert_eq!(item.attempts, 1);
        assert_eq!(item.state, RequestState::Pending);
        assert!(item.retry_after.is_some());
        assert!(drain(&mut rx).iter().any(|e| matches!(
            e,
            ObserverEvent::ErrorOccurred { code, .. } if *code == error_codes::CONFIG_INVALID
        )));
    }

    // ── heartbeats ───────────────────────────────────────────

    #[tokio::test]
    async fn heartbeat_fires_once_and_stamps_the_persona() {
        let mut runner = runner_with(Arc::new(ScriptedApi("ok".into())));
        let persona = runner.state.add_persona(Persona::new("Wren", 0));

        runner.trigger_heartbeats(Utc::now());

        assert_eq!(runner.queue.items().len(), 1);
        let item = &runner.queue.items()[0];
        assert_eq!(item.next_step, NextStep::HeartbeatDecision { persona });
        assert_eq!(item.priority, Priority::Low);
        assert_eq!(item.kind, ResponseKind::Structured);
        assert!(item.context.get(CONTEXT_FOLLOWUP_SYSTEM).is_some());
        assert!(item.context.get(CONTEXT_FOLLOWUP_USER).is_some());
        assert!(
            runner
                .state
                .persona(persona)
                .unwrap()
                .last_heartbeat_attempt
                .is_some()
        );

        // Still queued, so the next pass enqueues nothing.
        runner.trigger_heartbeats(Utc::now());
        assert_eq!(runner.queue.items().len(), 1);
    }

    #[tokio::test]
    async fn heartbeat_waits_for_the_inactivity_window() {
        let mut runner = runner_with(Arc::new(ScriptedApi("ok".into())));
        let persona = runner.state.add_persona(Persona::new("Rowan", 3600));
        let now = Utc::now();
        runner.state.persona_mut(persona).unwrap().created_at =
            now - chrono::Duration::days(1);

        runner.state.persona_mut(persona).unwrap().last_user_activity =
            Some(now - chrono::Duration::minutes(5));
        runner.trigger_heartbeats(now);
        assert!(runner.queue.items().is_empty(), "active conversation, no heartbeat");

        runner.state.persona_mut(persona).unwrap().last_user_activity =
            Some(now - chrono::Duration::hours(2));
        runner.trigger_heartbeats(now);
        assert_eq!(runner.queue.items().len(), 1);
    }

    // ── ceremony ─────────────────────────────────────────────

    #[tokio::test]
    async fn ceremony_enqueues_once_after_the_hour() {
        let mut runner = runner_with(Arc::new(ScriptedApi("a digest".into())));
        runner.config.scheduler.ceremony_hour = 8;
        let after_hour = Utc.with_ymd_and_hms(2026, 3, 14, 9, 0, 0).unwrap();

        runner.trigger_ceremony(after_hour);
        assert_eq!(runner.queue.items().len(), 1);
        assert_eq!(runner.queue.items()[0].next_step, NextStep::CeremonyDigest);

        runner.trigger_ceremony(after_hour);
        assert_eq!(runner.queue.items().len(), 1, "one live ceremony at a time");
    }

    #[tokio::test]
    async fn ceremony_respects_hour_and_enable_flag() {
        let mut runner = runner_with(Arc::new(ScriptedApi("a digest".into())));
        runner.config.scheduler.ceremony_hour = 8;

        let before_hour = Utc.with_ymd_and_hms(2026, 3, 14, 7, 59, 0).unwrap();
        runner.trigger_ceremony(before_hour);
        assert!(runner.queue.items().is_empty());

        runner.config.scheduler.ceremony_enabled = false;
        let after_hour = Utc.with_ymd_and_hms(2026, 3, 14, 12, 0, 0).unwrap();
        runner.trigger_ceremony(after_hour);
        assert!(runner.queue.items().is_empty());
    }

    #[tokio::test]
    async fn completed_ceremony_blocks_a_second_run_today() {
        let mut runner = runner_with(Arc::new(ScriptedApi("small wins, early night".into())));
        runner.config.scheduler.ceremony_hour = 0;
        let now = Utc::now();

        runner.trigger_ceremony(now);
        runner.dispatch();
        let result = runner.completions.recv().await.expect("digest result");
        runner.handle_completion(result);

        assert!(runner.state.has_digest_for(now.date_naive()));
        runner.trigger_ceremony(now);
        assert!(runner.queue.items().is_empty(), "digest already recorded");
    }

    // ── maintenance and checkpointing ────────────────────────

    #[tokio::test]
    async fn maintenance_writes_due_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let checkpoint = CheckpointStore::new(Some(path.clone()), Duration::ZERO).unwrap();
        let mut runner =
            runner_with_checkpoint(Arc::new(ScriptedApi("ok".into())), checkpoint);
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let mut rx = runner.events.subscribe();

        runner.queue.enqueue(reply_item(persona)).unwrap();
        runner.checkpoint.mark_dirty();
        runner.maintain(Utc::now());

        assert!(path.exists());
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::CheckpointSaved { .. }))
        );
    }

    #[tokio::test]
    async fn bootstrap_seeds_a_default_persona_on_first_run() {
        let config = CompanionConfig::default();
        let checkpoint = CheckpointStore::new(None, Duration::from_secs(30)).unwrap();

        let (state, queue, restored_at) = bootstrap(&config, &checkpoint).unwrap();

        assert!(restored_at.is_none());
        assert_eq!(state.personas().len(), 1);
        assert_eq!(state.personas()[0].name, DEFAULT_PERSONA_NAME);
        let welcome = state.messages().last().expect("welcome message");
        assert_eq!(welcome.role, MessageRole::Assistant);
        assert!(queue.items().is_empty());
    }

    #[tokio::test]
    async fn bootstrap_restores_an_existing_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let config = CompanionConfig::default();

        let mut state = StateStore::new(100);
        let persona = state.add_persona(Persona::new("Wren", 600));
        let mut queue = RequestQueue::default();
        queue.enqueue(reply_item(persona)).unwrap();
        let mut checkpoint =
            CheckpointStore::new(Some(path.clone()), Duration::from_secs(30)).unwrap();
        checkpoint.save(&Snapshot::capture(&state, &queue)).unwrap();

        let fresh = CheckpointStore::new(Some(path), Duration::from_secs(30)).unwrap();
        let (restored_state, restored_queue, restored_at) = bootstrap(&config, &fresh).unwrap();

        assert!(restored_at.is_some());
        assert_eq!(restored_state.personas().len(), 1);
        assert_eq!(restored_state.personas()[0].name, "Wren");
        assert_eq!(restored_queue.items().len(), 1);
    }

    #[tokio::test]
    async fn shutdown_releases_in_flight_work_into_the_final_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("checkpoint.json");
        let checkpoint =
            CheckpointStore::new(Some(path.clone()), Duration::from_secs(3600)).unwrap();
        let mut runner = runner_with_checkpoint(Arc::new(HangUntilCancelled), checkpoint);
        let persona = runner.state.add_persona(Persona::new("Rowan", 1800));
        let mut rx = runner.events.subscribe();

        let id = runner.queue.enqueue(reply_item(persona)).unwrap();
        runner.dispatch();
        assert!(runner.executor.is_busy());

        runner.shutdown().await;

        assert!(
            runner.queue.enqueue(reply_item(persona)).is_none(),
            "queue rejects enqueues after shutdown"
        );
        let reloaded = CheckpointStore::new(Some(path), Duration::from_secs(30)).unwrap();
        let snapshot = reloaded.load().unwrap().expect("final checkpoint written");
        assert_eq!(snapshot.queue.len(), 1);
        assert_eq!(snapshot.queue[0].id, id);
        assert_eq!(snapshot.queue[0].attempts, 0, "cancellation never counts");
        assert!(
            drain(&mut rx)
                .iter()
                .any(|e| matches!(e, ObserverEvent::Stopped))
        );
    }
}
