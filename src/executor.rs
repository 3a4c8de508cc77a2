//! Single-flight executor: prepares and runs at most one provider call.
//!
//! `start` does every state read up front (transcript fetch, placeholder
//! hydration, provider resolution) while the caller still holds the
//! state, then spawns only the HTTP call. The finished [`CallResult`]
//! arrives on the completion channel exactly once; the loop acknowledges
//! it with [`SingleFlightExecutor::on_completed`] to go idle again.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{CallError, KindredError, Result};
use crate::provider::account::{ProviderAccount, resolve};
use crate::provider::client::{ChatMessage, ChatRequest, Completion, CompletionApi, FinishReason};
use crate::provider::repair::parse_structured;
use crate::queue::item::{RequestId, ResponseKind, WorkItem};
use crate::state::store::StateStore;
use crate::state::types::{MessageId, MessageRole, PersonaId};

/// Read access the executor needs while preparing a call.
pub trait PromptSources {
    /// The most recent `turns` conversational messages for a persona,
    /// oldest first, mapped to wire roles.
    fn recent_turns(&self, persona: PersonaId, turns: usize) -> Vec<ChatMessage>;

    /// Text of a stored message, for `{{message:<id>}}` hydration.
    fn message_text(&self, id: MessageId) -> Option<String>;
}

impl PromptSources for StateStore {
    fn recent_turns(&self, persona: PersonaId, turns: usize) -> Vec<ChatMessage> {
        self.transcript(persona, turns)
            .into_iter()
            .filter_map(|m| match m.role {
                MessageRole::User => Some(ChatMessage::user(&m.content)),
                MessageRole::Assistant => Some(ChatMessage::assistant(&m.content)),
                MessageRole::Event => None,
            })
            .collect()
    }

    fn message_text(&self, id: MessageId) -> Option<String> {
        self.message(id).map(|m| m.content.clone())
    }
}

const PLACEHOLDER_OPEN: &str = "{{message:";
const PLACEHOLDER_CLOSE: &str = "}}";

/// Replace `{{message:<uuid>}}` references with stored message text.
///
/// A reference may point at a message that did not exist when the prompt
/// template was written; resolution happens here, at execution time.
/// References that still do not resolve are left intact and logged.
pub fn hydrate(text: &str, sources: &dyn PromptSources) -> String {
    if !text.contains(PLACEHOLDER_OPEN) {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find(PLACEHOLDER_OPEN) {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + PLACEHOLDER_OPEN.len()..];
        let Some(end) = after_open.find(PLACEHOLDER_CLOSE) else {
            // Unterminated reference; keep the remainder verbatim.
            out.push_str(&rest[start..]);
            rest = "";
            break;
        };
        let token = &after_open[..end];
        let resolved = uuid::Uuid::parse_str(token)
            .ok()
            .and_then(|raw| sources.message_text(MessageId(raw)));
        match resolved {
            Some(body) => out.push_str(&body),
            None => {
                warn!(reference = token, "unresolvable message placeholder");
                let span = PLACEHOLDER_OPEN.len() + end + PLACEHOLDER_CLOSE.len();
                out.push_str(&rest[start..start + span]);
            }
        }
        rest = &after_open[end + PLACEHOLDER_CLOSE.len()..];
    }
    out.push_str(rest);
    out
}

/// Classified output of a successful call.
#[derive(Debug, Clone)]
pub enum CallOutput {
    /// Plain text, untouched.
    FreeText(String),
    /// Structured payload: the raw text plus its parsed (possibly
    /// repaired) JSON value.
    Structured {
        content: String,
        value: serde_json::Value,
    },
    /// Verbatim content for one-shot consumers.
    Raw(String),
}

/// A finished execution. Delivered exactly once per started item.
#[derive(Debug)]
pub struct CallResult {
    /// The item, carried through so the loop needs no side lookup.
    pub item: WorkItem,
    pub outcome: std::result::Result<CallOutput, CallError>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Busy,
}

struct InFlight {
    id: RequestId,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Runs at most one provider call at a time.
pub struct SingleFlightExecutor {
    api: Arc<dyn CompletionApi>,
    accounts: Vec<ProviderAccount>,
    default_model: String,
    temperature: f64,
    completions: mpsc::UnboundedSender<CallResult>,
    in_flight: Option<InFlight>,
}

impl SingleFlightExecutor {
    pub fn new(
        api: Arc<dyn CompletionApi>,
        accounts: Vec<ProviderAccount>,
        default_model: impl Into<String>,
        temperature: f64,
        completions: mpsc::UnboundedSender<CallResult>,
    ) -> Self {
        Self {
            api,
            accounts,
            default_model: default_model.into(),
            temperature,
            completions,
            in_flight: None,
        }
    }

    /// Prepare and launch a call for `item`.
    ///
    /// Provider resolution runs fresh on every call, so account changes
    /// take effect without restarting. A resolution failure is delivered
    /// through the completion channel like any other failed call and the
    /// executor stays idle.
    ///
    /// # Errors
    /// Returns [`KindredError::Executor`] if a call is already in flight;
    /// the scheduler must never double-dispatch.
    pub fn start(&mut self, item: WorkItem, sources: &dyn PromptSources) -> Result<()> {
        if let Some(flight) = &self.in_flight {
            return Err(KindredError::Executor(format!(
                "call {} already in flight, refusing to start {}",
                flight.id, item.id
            )));
        }

        let history = match (item.transcript_turns, item.next_step.subject()) {
            (Some(turns), Some(persona)) => sources.recent_turns(persona, turns),
            _ => Vec::new(),
        };
        let system = hydrate(&item.system_prompt, sources);
        let user = hydrate(&item.user_prompt, sources);

        let spec = item
            .model_override
            .as_deref()
            .unwrap_or(&self.default_model);
        let call = match resolve(spec, &self.accounts) {
            Ok(call) => call,
            Err(e) => {
                warn!(id = %item.id, step = item.next_step.tag(), error = %e, "provider resolution failed");
                let _ = self.completions.send(CallResult {
                    item,
                    outcome: Err(e),
                });
                return Ok(());
            }
        };

        let request = ChatRequest {
            system,
            history,
            user,
            temperature: self.temperature,
        };
        let id = item.id;
        let kind = item.kind;
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();
        let api = Arc::clone(&self.api);
        let tx = self.completions.clone();

        debug!(id = %id, step = item.next_step.tag(), provider = %call.provider, model = %call.model, "starting call");
        let handle = tokio::spawn(async move {
            let outcome = match api.complete(&call, &request, &task_cancel).await {
                Ok(completion) => classify(kind, completion),
                Err(e) => Err(e),
            };
            let _ = tx.send(CallResult { item, outcome });
        });

        self.in_flight = Some(InFlight { id, cancel, handle });
        Ok(())
    }

    /// Cancel the in-flight call. No-op when idle. The cancelled result
    /// still arrives on the completion channel.
    pub fn abort(&self) {
        if let Some(flight) = &self.in_flight {
            debug!(id = %flight.id, "aborting in-flight call");
            flight.cancel.cancel();
        }
    }

    /// Acknowledge a delivered result, resetting to idle. Results for
    /// items the executor never tracked (resolution failures) are ignored.
    pub fn on_completed(&mut self, id: RequestId) {
        if self.in_flight.as_ref().is_some_and(|f| f.id == id) {
            self.in_flight = None;
        }
    }

    /// Await the in-flight task. Used on the stop path so shutdown waits
    /// for cancellation to land before the final checkpoint; the result
    /// is then drained from the completion channel by the caller.
    pub async fn join(&mut self) {
        if let Some(flight) = self.in_flight.take() {
            let _ = flight.handle.await;
        }
    }

    pub fn state(&self) -> ExecutorState {
        if self.in_flight.is_some() {
            ExecutorState::Busy
        } else {
            ExecutorState::Idle
        }
    }

    pub fn is_busy(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Id of the in-flight item, if any.
    pub fn in_flight(&self) -> Option<RequestId> {
        self.in_flight.as_ref().map(|f| f.id)
    }
}

/// Map a raw completion to the item's declared response kind.
fn classify(
    kind: ResponseKind,
    completion: Completion,
) -> std::result::Result<CallOutput, CallError> {
    if completion.content.trim().is_empty() {
        return Err(CallError::EmptyResponse);
    }
    match kind {
        ResponseKind::FreeText => Ok(CallOutput::FreeText(completion.content)),
        ResponseKind::Raw => Ok(CallOutput::Raw(completion.content)),
        ResponseKind::Structured => {
            // A length-truncated body cannot be trusted even if it happens
            // to parse after repair.
            if completion.finish == FinishReason::Length {
                return Err(CallError::Truncated);
            }
            let value = parse_structured(&completion.content)?;
            Ok(CallOutput::Structured {
                content: completion.content,
                value,
            })
        }
    }
}
