//! Error types for the unsubscribe engine.

use std::time::Duration;

/// Top-level error type for the engine.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Mailbox error: {0}")]
    Mailbox(#[from] MailboxError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("Execution error: {0}")]
    Execution(#[from] ExecutionError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised by the normalizer when a raw message cannot be turned into a
/// `NormalizedMessage`.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed message {id}: {reason}")]
    MalformedMessage { id: String, reason: String },
}

/// Failure of a single unsubscribe action.
///
/// Transient kinds are retried by the executor's retry policy; everything
/// else fails the attempt immediately.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("server returned HTTP {status}")]
    ServerError { status: u16 },

    #[error("rate limited (HTTP 429)")]
    RateLimited,

    #[error("client error HTTP {status}")]
    ClientError { status: u16 },

    #[error("malformed URI: {0}")]
    MalformedUri(String),

    #[error("refused: {0}")]
    Refused(String),

    #[error("mailbox provider: {0}")]
    Mailbox(String),

    #[error("mailbox provider (transient): {0}")]
    MailboxTransient(String),
}

impl ExecutionError {
    /// Whether the retry policy should try again.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout(_)
                | Self::Connection(_)
                | Self::ServerError { .. }
                | Self::RateLimited
                | Self::MailboxTransient(_)
        )
    }

    /// Stable tag used as the prefix of `Outcome::last_error`.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout(_) => "timeout",
            Self::Connection(_) => "connection",
            Self::ServerError { .. } => "server_error",
            Self::RateLimited => "rate_limited",
            Self::ClientError { .. } => "client_error",
            Self::MalformedUri(_) => "malformed_uri",
            Self::Refused(_) => "refused",
            Self::Mailbox(_) => "mailbox",
            Self::MailboxTransient(_) => "mailbox_transient",
        }
    }

    /// `"<kind>: <detail>"`, the form persisted in the ledger.
    pub fn ledger_text(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

/// Outcome ledger errors.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Concurrent admission lost for key {key}")]
    Conflict { key: String },
}

/// Mailbox provider errors.
#[derive(Debug, thiserror::Error)]
pub enum MailboxError {
    #[error("Authentication failed for provider {provider}")]
    AuthFailed { provider: String },

    #[error("Provider {provider} rate limited, retry after {retry_after:?}")]
    RateLimited {
        provider: String,
        retry_after: Option<Duration>,
    },

    #[error("Provider {provider} request failed: {reason}")]
    Request { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Send rejected: {reason}")]
    SendRejected { reason: String },

    #[error("Operation {operation} not supported by this provider")]
    Unsupported { operation: String },
}

impl MailboxError {
    /// Whether retrying the same call later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::Request { .. })
    }
}

impl From<MailboxError> for ExecutionError {
    fn from(e: MailboxError) -> Self {
        if e.is_transient() {
            ExecutionError::MailboxTransient(e.to_string())
        } else {
            ExecutionError::Mailbox(e.to_string())
        }
    }
}

/// Batch-level pipeline failures. Per-message problems never surface here.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Mailbox fetch failed: {0}")]
    Fetch(#[from] MailboxError),

    #[error("Ledger unavailable: {0}")]
    Ledger(#[from] LedgerError),
}

/// Result type alias for the engine.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_kinds() {
        assert!(ExecutionError::ServerError { status: 503 }.is_transient());
        assert!(ExecutionError::RateLimited.is_transient());
        assert!(ExecutionError::Timeout(Duration::from_secs(1)).is_transient());
        assert!(ExecutionError::Connection("reset".into()).is_transient());
        assert!(!ExecutionError::ClientError { status: 404 }.is_transient());
        assert!(!ExecutionError::MalformedUri("x".into()).is_transient());
    }

    #[test]
    fn ledger_text_carries_kind() {
        let e = ExecutionError::ServerError { status: 503 };
        assert_eq!(e.ledger_text(), "server_error: server returned HTTP 503");
    }

    #[test]
    fn mailbox_error_maps_to_execution_error() {
        let transient: ExecutionError = MailboxError::RateLimited {
            provider: "gmail".into(),
            retry_after: None,
        }
        .into();
        assert!(transient.is_transient());

        let permanent: ExecutionError = MailboxError::SendRejected {
            reason: "bad address".into(),
        }
        .into();
        assert!(!permanent.is_transient());
        assert_eq!(permanent.kind(), "mailbox");
    }
}
