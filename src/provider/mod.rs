//! Mailbox provider collaborator.
//!
//! The engine only needs three capabilities from a mailbox: listing raw
//! messages for a query, sending a message, and (optionally) creating a
//! sender filter. Everything provider-specific lives behind this trait.

pub mod gmail;

use async_trait::async_trait;
use lettre::Message;
use serde::{Deserialize, Serialize};

use crate::error::MailboxError;
use crate::message::RawMessage;

pub use gmail::GmailProvider;

/// One page of `list_messages` results.
#[derive(Debug, Default)]
pub struct MessagePage {
    pub messages: Vec<RawMessage>,
    /// Opaque cursor for the next page; `None` on the last page.
    pub next_page_token: Option<String>,
}

/// An outgoing unsubscribe request mail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Draft {
    pub to: String,
    pub subject: String,
    pub body: String,
}

impl Draft {
    /// Render the draft as RFC 5322 bytes.
    pub fn to_rfc5322(&self, from: &str) -> Result<Vec<u8>, MailboxError> {
        let message = Message::builder()
            .from(from.parse().map_err(|e| MailboxError::SendRejected {
                reason: format!("Invalid from address: {e}"),
            })?)
            .to(self.to.parse().map_err(|e| MailboxError::SendRejected {
                reason: format!("Invalid to address: {e}"),
            })?)
            .subject(self.subject.as_str())
            .body(self.body.clone())
            .map_err(|e| MailboxError::SendRejected {
                reason: format!("Failed to build email: {e}"),
            })?;
        Ok(message.formatted())
    }
}

/// Mailbox capabilities consumed by the engine.
#[async_trait]
pub trait MailboxProvider: Send + Sync {
    /// Provider name for logs and errors.
    fn name(&self) -> &str;

    /// Fetch one page of raw messages matching `query`.
    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, MailboxError>;

    /// Hand a message to the provider for delivery. Acceptance does not
    /// guarantee delivery. Returns the provider's message id.
    async fn send_message(&self, draft: &Draft) -> Result<String, MailboxError>;

    /// Silence future mail from `sender_pattern`. Returns the filter id.
    async fn create_filter(&self, sender_pattern: &str) -> Result<String, MailboxError> {
        let _ = sender_pattern;
        Err(MailboxError::Unsupported {
            operation: "create_filter".into(),
        })
    }
}

/// Fetch up to `max` messages, following page tokens.
pub async fn fetch_messages(
    provider: &dyn MailboxProvider,
    query: &str,
    max: usize,
    page_size: usize,
) -> Result<Vec<RawMessage>, MailboxError> {
    let mut messages = Vec::new();
    let mut page_token: Option<String> = None;
    while messages.len() < max {
        let want = (max - messages.len()).min(page_size.max(1));
        let page = provider
            .list_messages(query, page_token.as_deref(), want)
            .await?;
        let fetched = page.messages.len();
        messages.extend(page.messages);
        match page.next_page_token {
            Some(token) if fetched > 0 => page_token = Some(token),
            _ => break,
        }
    }
    messages.truncate(max);
    tracing::debug!(
        provider = provider.name(),
        query,
        fetched = messages.len(),
        "Fetched messages"
    );
    Ok(messages)
}
