//! Invocation context: one per gateway call.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Identity and cancellation handle for a single tool invocation.
///
/// Clones share the cancellation flag, so a caller can keep one copy and
/// cancel the run executing on another.
#[derive(Debug, Clone)]
pub struct InvocationContext {
    /// Unique invocation ID.
    pub invocation_id: Uuid,
    /// Caller-supplied request ID (gateway `id`), if any.
    pub request_id: Option<String>,
    /// When the invocation started.
    pub started_at: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl Default for InvocationContext {
    fn default() -> Self {
        Self {
            invocation_id: Uuid::new_v4(),
            request_id: None,
            started_at: Utc::now(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl InvocationContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(request_id: impl Into<String>) -> Self {
        Self {
            request_id: Some(request_id.into()),
            ..Self::default()
        }
    }

    /// Ask the running operation to stop admitting new work.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
