//! The embedder-facing handle.
//!
//! [`CompanionBuilder::spawn`] restores or seeds state, wires the
//! channels, and launches the loop task. The returned [`Companion`]
//! is the only way in: every method is a command sent to the loop,
//! so callers never touch shared state.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::config::CompanionConfig;
use crate::error::{KindredError, Result};
use crate::events::{EventBus, ObserverEvent};
use crate::executor::SingleFlightExecutor;
use crate::provider::client::{CompletionApi, HttpChatClient};
use crate::queue::item::{NewWorkItem, RequestId, WorkItem};
use crate::scheduler::prompts::{DefaultTriggerPrompts, TriggerPrompts};
use crate::scheduler::runner::{self, Command, Runner};
use crate::state::checkpoint::{CheckpointStore, Snapshot};
use crate::state::types::{MessageId, Persona, PersonaId};

const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Configures and launches a companion loop.
pub struct CompanionBuilder {
    config: CompanionConfig,
    api: Option<Arc<dyn CompletionApi>>,
    prompts: Option<Arc<dyn TriggerPrompts>>,
    /// `None` derives the path from config; `Some(None)` disables
    /// persistence outright.
    checkpoint_path: Option<Option<PathBuf>>,
    event_capacity: usize,
    instance_gauge: Option<Arc<AtomicUsize>>,
}

impl CompanionBuilder {
    pub fn new(config: CompanionConfig) -> Self {
        Self {
            config,
            api: None,
            prompts: None,
            checkpoint_path: None,
            event_capacity: DEFAULT_EVENT_CAPACITY,
            instance_gauge: None,
        }
    }

    /// Substitute the completion backend. Defaults to [`HttpChatClient`].
    pub fn api(mut self, api: Arc<dyn CompletionApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Substitute the prompt texts used by the built-in triggers.
    pub fn trigger_prompts(mut self, prompts: Arc<dyn TriggerPrompts>) -> Self {
        self.prompts = Some(prompts);
        self
    }

    /// Checkpoint to `path` instead of the configured data directory.
    pub fn checkpoint_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.checkpoint_path = Some(Some(path.into()));
        self
    }

    /// Run fully in memory; nothing survives a stop.
    pub fn without_persistence(mut self) -> Self {
        self.checkpoint_path = Some(None);
        self
    }

    /// Buffer size of the observer event stream.
    pub fn event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }

    /// Counter incremented while the loop runs; useful for embedders
    /// tracking how many companions are alive.
    pub fn instance_gauge(mut self, gauge: Arc<AtomicUsize>) -> Self {
        self.instance_gauge = Some(gauge);
        self
    }

    /// Restore or seed state and spawn the loop task.
    ///
    /// Fails loudly instead of starting empty: an invalid config or a
    /// corrupt checkpoint is returned as an error so saved history is
    /// never silently discarded.
    pub fn spawn(self) -> Result<Companion> {
        self.config.validate()?;
        let path = match self.checkpoint_path {
            Some(path) => path,
            None => Some(self.config.state.checkpoint_path()),
        };
        let mut checkpoint =
            CheckpointStore::new(path, self.config.scheduler.checkpoint_debounce())?;
        let (state, queue, restored_at) = runner::bootstrap(&self.config, &checkpoint)?;
        if restored_at.is_none() {
            // First run: persist the seed before accepting any work.
            checkpoint.save(&Snapshot::capture(&state, &queue))?;
        }

        let api: Arc<dyn CompletionApi> = match self.api {
            Some(api) => api,
            None => Arc::new(HttpChatClient::new(
                self.config.llm.request_timeout(),
                self.config.llm.connect_timeout(),
                self.config.llm.call_retry(),
            )?),
        };
        let prompts: Arc<dyn TriggerPrompts> = self
            .prompts
            .unwrap_or_else(|| Arc::new(DefaultTriggerPrompts));

        let events = EventBus::new(self.event_capacity);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        let executor = SingleFlightExecutor::new(
            api,
            self.config.llm.accounts.clone(),
            self.config.llm.default_model.clone(),
            self.config.llm.temperature,
            completion_tx,
        );
        if let Some(gauge) = &self.instance_gauge {
            gauge.fetch_add(1, Ordering::SeqCst);
        }

        let runner = Runner {
            config: self.config,
            state,
            queue,
            checkpoint,
            executor,
            events: events.clone(),
            prompts,
            commands: command_rx,
            completions: completion_rx,
            pending_cancel: None,
            restored_at,
            instance_gauge: self.instance_gauge,
        };
        let task = tokio::spawn(runner.run());

        Ok(Companion {
            commands: command_tx,
            events,
            task,
        })
    }
}

/// Handle to a running companion loop.
///
/// Dropping the handle closes the command channel and the loop shuts
/// down on its own, but [`Companion::stop`] is preferred: it waits for
/// the final checkpoint to hit disk.
pub struct Companion {
    commands: mpsc::UnboundedSender<Command>,
    events: EventBus,
    task: JoinHandle<()>,
}

impl Companion {
    pub fn builder(config: CompanionConfig) -> CompanionBuilder {
        CompanionBuilder::new(config)
    }

    /// Subscribe to the observer event stream. Slow consumers lose the
    /// oldest buffered events, never the loop's progress.
    pub fn subscribe(&self) -> broadcast::Receiver<ObserverEvent> {
        self.events.subscribe()
    }

    /// Queue a work item. `Ok(None)` means the loop is shutting down.
    pub async fn enqueue(&self, new: NewWorkItem) -> Result<Option<RequestId>> {
        self.request(|reply| Command::Enqueue { new, reply }).await
    }

    /// Record a user message against a persona's conversation.
    pub async fn send_user_message(
        &self,
        persona: PersonaId,
        content: impl Into<String>,
    ) -> Result<MessageId> {
        let content = content.into();
        self.request(|reply| Command::AppendUserMessage {
            persona,
            content,
            reply,
        })
        .await?
    }

    pub async fn create_persona(
        &self,
        name: impl Into<String>,
        heartbeat_delay_secs: u64,
    ) -> Result<PersonaId> {
        let name = name.into();
        self.request(|reply| Command::CreatePersona {
            name,
            heartbeat_delay_secs,
            reply,
        })
        .await
    }

    pub async fn personas(&self) -> Result<Vec<Persona>> {
        self.request(|reply| Command::Personas { reply }).await
    }

    /// Pause or resume a persona's proactive behavior.
    pub async fn set_persona_paused(&self, persona: PersonaId, paused: bool) -> Result<()> {
        self.request(|reply| Command::SetPersonaPaused {
            persona,
            paused,
            reply,
        })
        .await?
    }

    /// Drop all queued work for a persona and abort a matching
    /// in-flight call. Returns the ids that were cancelled.
    pub async fn cancel_persona(&self, persona: PersonaId) -> Result<Vec<RequestId>> {
        self.request(|reply| Command::CancelSubject { persona, reply })
            .await
    }

    /// Abort the in-flight call; the item returns to pending.
    pub fn abort_in_flight(&self) -> Result<()> {
        self.send(Command::AbortInFlight)
    }

    /// Stop dispatching new work. In-flight work is unaffected.
    pub fn pause(&self) -> Result<()> {
        self.send(Command::Pause)
    }

    pub fn resume(&self) -> Result<()> {
        self.send(Command::Resume)
    }

    /// Point-in-time copy of every tracked item, dead letters included.
    pub async fn queue_snapshot(&self) -> Result<Vec<WorkItem>> {
        self.request(|reply| Command::QueueSnapshot { reply }).await
    }

    pub async fn clear_dead_letters(&self) -> Result<usize> {
        self.request(|reply| Command::ClearDeadLetters { reply })
            .await
    }

    /// Write a checkpoint now, ignoring the debounce window.
    pub async fn flush_now(&self) -> Result<()> {
        self.request(|reply| Command::FlushNow { reply }).await?
    }

    /// Graceful shutdown: cancels in-flight work, writes the final
    /// checkpoint, and waits for the loop task to exit.
    pub async fn stop(self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        if self.commands.send(Command::Stop { reply: tx }).is_ok() {
            let _ = rx.await;
        }
        self.task
            .await
            .map_err(|e| KindredError::Channel(format!("companion loop panicked: {e}")))
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.send(make(tx))?;
        rx.await
            .map_err(|_| KindredError::Channel("companion loop dropped the reply".into()))
    }

    fn send(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| KindredError::Channel("companion loop is gone".into()))
    }
}
