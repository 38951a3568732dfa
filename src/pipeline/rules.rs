//! Subscription classifier.
//!
//! Scores a normalized message from independent signals:
//! - `List-Unsubscribe` header → +0.5
//! - `Precedence: bulk|list|junk` and campaign headers → +0.2 each, capped
//! - Sender matching a bulk-sender pattern → +0.2
//! - Promotional wording in subject or body → +0.1
//!
//! The signal table is versioned data (`ClassifierConfig`), so a verdict can
//! always be traced back to the weights that produced it.

use std::collections::BTreeSet;

use regex::Regex;
use tracing::{debug, warn};

use crate::config::ClassifierConfig;
use crate::message::NormalizedMessage;
use crate::pipeline::types::{ClassificationResult, SignalTag};

/// Characters of body text inspected for promotional wording.
const BODY_SCAN_LIMIT: usize = 4096;

/// Deterministic rules-based classifier.
pub struct Classifier {
    config: ClassifierConfig,
    bulk_sender: Vec<Regex>,
    promotional: Vec<Regex>,
}

impl Classifier {
    /// Compile the configured patterns. Invalid patterns are logged and
    /// skipped so a bad override never disables classification entirely.
    pub fn new(config: ClassifierConfig) -> Self {
        let bulk_sender = compile_all(&config.bulk_sender_patterns, "bulk_sender");
        let promotional = compile_all(&config.promotional_patterns, "promotional");
        Self {
            config,
            bulk_sender,
            promotional,
        }
    }

    pub fn ruleset_version(&self) -> &str {
        &self.config.version
    }

    pub fn classify(&self, msg: &NormalizedMessage) -> ClassificationResult {
        let cfg = &self.config;
        let mut signals = BTreeSet::new();
        let mut score = 0.0_f32;

        if msg.has_header("list-unsubscribe") {
            signals.insert(SignalTag::ListUnsubscribeHeader);
            score += cfg.list_unsubscribe_weight;
        }

        let mut bulk = 0.0_f32;
        if msg
            .header_values("precedence")
            .iter()
            .any(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "bulk" | "list" | "junk"))
        {
            signals.insert(SignalTag::PrecedenceBulk);
            bulk += cfg.bulk_header_weight;
        }
        let campaign_hits = cfg
            .campaign_headers
            .iter()
            .filter(|name| msg.has_header(name))
            .count();
        if campaign_hits > 0 {
            signals.insert(SignalTag::CampaignHeader);
            bulk += cfg.bulk_header_weight * campaign_hits as f32;
        }
        score += bulk.min(cfg.bulk_header_cap);

        if self.bulk_sender.iter().any(|r| r.is_match(&msg.sender.address)) {
            signals.insert(SignalTag::BulkSenderDomain);
            score += cfg.bulk_sender_weight;
        }

        let body: String = msg.body_text.chars().take(BODY_SCAN_LIMIT).collect();
        if self
            .promotional
            .iter()
            .any(|r| r.is_match(&msg.subject) || r.is_match(&body))
        {
            signals.insert(SignalTag::PromotionalLexicon);
            score += cfg.promotional_weight;
        }

        let score = score.clamp(0.0, 1.0);
        // Float sums like 0.2 + 0.2 + 0.1 land a hair under 0.5.
        let is_subscription = score + 1e-6 >= cfg.threshold && !signals.is_empty();

        debug!(
            message_id = %msg.id,
            score,
            is_subscription,
            signals = ?signals,
            "Classified message"
        );

        ClassificationResult {
            is_subscription,
            score,
            matched_signals: signals,
            ruleset_version: cfg.version.clone(),
        }
    }
}

fn compile_all(patterns: &[String], table: &str) -> Vec<Regex> {
    patterns
        .iter()
        .filter_map(|p| match Regex::new(p) {
            Ok(r) => Some(r),
            Err(e) => {
                warn!(table, pattern = %p, error = %e, "Skipping invalid classifier pattern");
                None
            }
        })
        .collect()
}
