//! Error types for the kindred scheduling core.
//!
//! Two layers: [`KindredError`] covers crate-level operations (config,
//! persistence, channel plumbing), while [`CallError`] is the per-call
//! taxonomy the executor and router classify against. Each [`CallError`]
//! variant carries a stable error code (SCREAMING_SNAKE_CASE) that is
//! included in the Display output and accessible via [`CallError::code()`].

/// Top-level error type for the scheduling core.
#[derive(Debug, thiserror::Error)]
pub enum KindredError {
    /// Configuration error (bad file, invalid value, unknown provider).
    #[error("config error: {0}")]
    Config(String),

    /// Checkpoint persistence error (serialize, write, restore).
    #[error("checkpoint error: {0}")]
    Checkpoint(String),

    /// State model error (unknown persona, unknown message).
    #[error("state error: {0}")]
    State(String),

    /// Queue error (unknown item, bad transition).
    #[error("queue error: {0}")]
    Queue(String),

    /// Executor error (dispatch while busy).
    #[error("executor error: {0}")]
    Executor(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Channel send/receive error (loop task gone).
    #[error("channel error: {0}")]
    Channel(String),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, KindredError>;

/// Stable error codes for programmatic error handling.
///
/// These codes never change and form part of the public API contract.
/// Observer error events carry these codes; nothing should parse Display
/// output to distinguish errors.
pub mod error_codes {
    /// Invalid or missing configuration (unknown provider, missing credential).
    pub const CONFIG_INVALID: &str = "CONFIG_INVALID";

    /// Provider answered with a rate-limit/overload status (429, 529).
    pub const RATE_LIMITED: &str = "RATE_LIMITED";

    /// Provider answered with a non-retryable error status.
    pub const PROVIDER_ERROR: &str = "PROVIDER_ERROR";

    /// Transport-level failure (connect, timeout, bad response body).
    pub const REQUEST_FAILED: &str = "REQUEST_FAILED";

    /// Provider returned empty content.
    pub const EMPTY_RESPONSE: &str = "EMPTY_RESPONSE";

    /// Provider stopped generating because the output hit its length limit.
    pub const TRUNCATED: &str = "TRUNCATED";

    /// Structured output could not be parsed even after repair.
    pub const MALFORMED_JSON: &str = "MALFORMED_JSON";

    /// A next-step handler rejected an otherwise successful response.
    pub const HANDLER_FAILED: &str = "HANDLER_FAILED";

    /// The call was cancelled. By policy not an error: never counted
    /// against an item, never dead-letters, never reaches observers.
    pub const CANCELLED: &str = "CANCELLED";
}

/// Per-call error taxonomy.
///
/// Classification drives retry behaviour: only [`CallError::RateLimited`]
/// is retried inside the HTTP client; everything else fails the attempt
/// immediately and the queue-level retry policy takes over. The Display
/// impl formats as `[CODE] message`.
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    /// Invalid or missing configuration (unknown provider, missing credential).
    #[error("[{}] {}", error_codes::CONFIG_INVALID, .0)]
    Config(String),

    /// Rate-limit/overload status from the provider.
    #[error("[{}] status {status}: {message}", error_codes::RATE_LIMITED)]
    RateLimited { status: u16, message: String },

    /// Any other error status from the provider.
    #[error("[{}] status {status}: {message}", error_codes::PROVIDER_ERROR)]
    Provider { status: u16, message: String },

    /// Transport-level failure before a status was available.
    #[error("[{}] {}", error_codes::REQUEST_FAILED, .0)]
    Request(String),

    /// Empty content after trimming.
    #[error("[{}] provider returned empty content", error_codes::EMPTY_RESPONSE)]
    EmptyResponse,

    /// Finish reason indicated truncation; structured output is unusable.
    #[error("[{}] output truncated at the model's length limit", error_codes::TRUNCATED)]
    Truncated,

    /// Structured output failed to parse even after repair.
    #[error("[{}] {}", error_codes::MALFORMED_JSON, .0)]
    MalformedJson(String),

    /// A next-step handler failed (typed validation or state mutation).
    #[error("[{}] {}", error_codes::HANDLER_FAILED, .0)]
    Handler(String),

    /// The in-flight call was cancelled.
    #[error("[{}] call cancelled", error_codes::CANCELLED)]
    Cancelled,
}

impl CallError {
    /// Returns the stable error code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => error_codes::CONFIG_INVALID,
            Self::RateLimited { .. } => error_codes::RATE_LIMITED,
            Self::Provider { .. } => error_codes::PROVIDER_ERROR,
            Self::Request(_) => error_codes::REQUEST_FAILED,
            Self::EmptyResponse => error_codes::EMPTY_RESPONSE,
            Self::Truncated => error_codes::TRUNCATED,
            Self::MalformedJson(_) => error_codes::MALFORMED_JSON,
            Self::Handler(_) => error_codes::HANDLER_FAILED,
            Self::Cancelled => error_codes::CANCELLED,
        }
    }

    /// True for the rate-limit/overload class, the only class the HTTP
    /// client retries on its own.
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::RateLimited { .. })
    }

    /// True when the call was cancelled rather than failed.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}
