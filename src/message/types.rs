//! Canonical message types shared by the whole pipeline.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Raw message ─────────────────────────────────────────────────────

/// A message as handed over by the mailbox provider.
///
/// `raw` holds the full RFC 5322 bytes (headers + body). Providers that
/// know the delivery time attach it as `received_at`.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Provider-stable identifier.
    pub id: String,
    /// RFC 5322 message bytes.
    pub raw: Vec<u8>,
    /// Provider-side delivery timestamp, if known.
    pub received_at: Option<DateTime<Utc>>,
}

impl RawMessage {
    pub fn new(id: impl Into<String>, raw: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            raw: raw.into(),
            received_at: None,
        }
    }
}

// ── Sender ──────────────────────────────────────────────────────────

/// Sender identity from the `From` header.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Sender {
    /// Lowercased address (`user@domain`).
    pub address: String,
    /// Display name, if the header carried one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

impl Sender {
    /// Domain part of the address (empty if the address has no `@`).
    pub fn domain(&self) -> &str {
        self.address
            .rsplit_once('@')
            .map(|(_, d)| d)
            .unwrap_or_default()
    }

    /// Display name when present, otherwise the address.
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.address)
    }
}

// ── Normalized message ──────────────────────────────────────────────

/// Canonical form of one fetched message. Built once by the normalizer and
/// never mutated afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NormalizedMessage {
    pub id: String,
    pub sender: Sender,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    /// Lowercase header name → every raw (unfolded) value in message order.
    pub headers: BTreeMap<String, Vec<String>>,
    pub body_text: String,
    pub body_html: Option<String>,
    /// Set when some part could only be decoded lossily.
    pub decoding_degraded: bool,
}

impl NormalizedMessage {
    /// First value of a header (name is case-insensitive).
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .and_then(|values| values.first())
            .map(String::as_str)
    }

    /// Every value of a header, in order.
    pub fn header_values(&self, name: &str) -> &[String] {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.headers.contains_key(&name.to_ascii_lowercase())
    }

    /// Identifier from the `List-Id` header, angle brackets stripped.
    ///
    /// `List-Id: Weekly Deals <deals.shop.example>` → `deals.shop.example`.
    pub fn list_id(&self) -> Option<String> {
        let raw = self.header("list-id")?;
        let id = match (raw.rfind('<'), raw.rfind('>')) {
            (Some(start), Some(end)) if start < end => &raw[start + 1..end],
            _ => raw,
        };
        let id = id.trim().to_lowercase();
        (!id.is_empty()).then_some(id)
    }

    /// Deduplication key for the outcome ledger: sender domain plus list
    /// identifier, falling back to the sender address when there is no
    /// `List-Id`.
    pub fn list_identity_key(&self) -> String {
        let list = self.list_id().unwrap_or_else(|| self.sender.address.clone());
        format!("{}#{}", self.sender.domain(), list)
    }
}
