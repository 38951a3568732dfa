//! Shared types for the unsubscribe pipeline.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::store::traits::OutcomeStatus;

// ── Unsubscribe mechanism ───────────────────────────────────────────

/// A `mailto:` unsubscribe target with its optional URI parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailtoTarget {
    pub address: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl MailtoTarget {
    /// Parse a `mailto:` URI. Returns `None` for anything without a usable
    /// recipient address.
    pub fn parse(uri: &str) -> Option<Self> {
        let url = Url::parse(uri.trim()).ok()?;
        if url.scheme() != "mailto" {
            return None;
        }
        let address = percent_decode(url.path()).trim().to_lowercase();
        let (local, domain) = address.split_once('@')?;
        if local.is_empty() || domain.is_empty() || address.contains(',') {
            return None;
        }
        let mut subject = None;
        let mut body = None;
        for (key, value) in url.query_pairs() {
            match key.to_ascii_lowercase().as_str() {
                "subject" => subject = Some(value.into_owned()),
                "body" => body = Some(value.into_owned()),
                _ => {}
            }
        }
        Some(Self {
            address,
            subject,
            body,
        })
    }
}

/// Where a `List-Unsubscribe` entry points.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "scheme", rename_all = "snake_case")]
pub enum UnsubscribeTarget {
    Http { uri: Url },
    Mailto(MailtoTarget),
}

/// The concrete action behind a mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MechanismKind {
    /// RFC 8058 one-click: a single POST to the header URI.
    HeaderOneClickPost { uri: Url },
    /// Plain `List-Unsubscribe` entry.
    HeaderListUnsubscribe { target: UnsubscribeTarget },
    /// Link found in the message body.
    BodyLink { uri: Url },
    /// `mailto:` link found in the message body.
    MailtoBody {
        address: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        subject: Option<String>,
    },
    /// Mailbox-side filter for senders without any mechanism.
    MailboxFilter { sender_pattern: String },
}

impl MechanismKind {
    /// Short label for logging and reports.
    pub fn label(&self) -> &'static str {
        match self {
            Self::HeaderOneClickPost { .. } => "header_one_click_post",
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Http { .. },
            } => "header_list_unsubscribe_http",
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Mailto(_),
            } => "header_list_unsubscribe_mailto",
            Self::BodyLink { .. } => "body_link",
            Self::MailtoBody { .. } => "mailto_body",
            Self::MailboxFilter { .. } => "mailbox_filter",
        }
    }

    /// Key used to collapse duplicate candidates pointing at the same place.
    pub(crate) fn target_key(&self) -> String {
        match self {
            Self::HeaderOneClickPost { uri } => format!("post:{uri}"),
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Http { uri },
            }
            | Self::BodyLink { uri } => format!("get:{uri}"),
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Mailto(m),
            } => format!("mailto:{}", m.address),
            Self::MailtoBody { address, .. } => format!("mailto:{address}"),
            Self::MailboxFilter { sender_pattern } => format!("filter:{sender_pattern}"),
        }
    }
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HeaderOneClickPost { uri } => write!(f, "POST {uri}"),
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Http { uri },
            }
            | Self::BodyLink { uri } => write!(f, "GET {uri}"),
            Self::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Mailto(m),
            } => write!(f, "mailto:{}", m.address),
            Self::MailtoBody { address, .. } => write!(f, "mailto:{address}"),
            Self::MailboxFilter { sender_pattern } => write!(f, "filter from:{sender_pattern}"),
        }
    }
}

/// One candidate unsubscribe mechanism with its trust score and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsubscribeMechanism {
    #[serde(flatten)]
    pub kind: MechanismKind,
    /// 0–1 likelihood that acting on this is correct and side-effect free.
    pub confidence: f32,
    /// Header or body part the mechanism came from.
    pub source_field: String,
}

impl UnsubscribeMechanism {
    pub fn new(kind: MechanismKind, confidence: f32, source_field: impl Into<String>) -> Self {
        Self {
            kind,
            confidence: confidence.clamp(0.0, 1.0),
            source_field: source_field.into(),
        }
    }
}

// ── Extraction ──────────────────────────────────────────────────────

/// Non-fatal observations made during extraction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "note", rename_all = "snake_case")]
pub enum ExtractionNote {
    DroppedMalformedUri { source_field: String, raw: String },
}

/// Extractor output: candidates ordered by confidence, highest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Extraction {
    pub mechanisms: Vec<UnsubscribeMechanism>,
    pub notes: Vec<ExtractionNote>,
}

impl Extraction {
    pub fn best(&self) -> Option<&UnsubscribeMechanism> {
        self.mechanisms.first()
    }

    pub fn is_empty(&self) -> bool {
        self.mechanisms.is_empty()
    }
}

// ── Classification ──────────────────────────────────────────────────

/// Evidence the classifier can attach to a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalTag {
    ListUnsubscribeHeader,
    PrecedenceBulk,
    CampaignHeader,
    BulkSenderDomain,
    PromotionalLexicon,
}

/// Deterministic classifier verdict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub is_subscription: bool,
    pub score: f32,
    pub matched_signals: BTreeSet<SignalTag>,
    pub ruleset_version: String,
}

// ── Execution ───────────────────────────────────────────────────────

/// What the executor did with one mechanism.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// `Succeeded`, `Failed` or `Skipped`; never `Pending`.
    pub status: OutcomeStatus,
    /// Network/provider attempts made (0 when skipped).
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// `"<kind>: <detail>"` for failures and skips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Response body contained a confirmation phrase.
    #[serde(default)]
    pub confirmed: bool,
}

impl ExecutionResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Skipped,
            attempts: 0,
            http_status: None,
            error: Some(reason.into()),
            confirmed: false,
        }
    }
}

/// Minimal percent-decoding for mailto paths (`%40` and friends).
fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%'
            && i + 2 < bytes.len()
            && let Some(v) = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok())
        {
            out.push(v);
            i += 3;
            continue;
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
