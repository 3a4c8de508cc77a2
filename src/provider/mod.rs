//! Provider accounts, the chat-completions client, and JSON repair.

pub mod account;
pub mod client;
pub mod repair;

pub use account::{LOCAL_PROVIDER, ProviderAccount, ResolvedCall, resolve, resolve_with};
pub use client::{
    CallRetryPolicy, ChatMessage, ChatRequest, Completion, CompletionApi, FinishReason,
    HttpChatClient, Role,
};
pub use repair::{parse_structured, repair, strip_code_fences};
