//! Unsubscribe extractor.
//!
//! Produces ranked unsubscribe candidates from three sources, most trusted
//! first:
//! 1. `List-Unsubscribe` + `List-Unsubscribe-Post: One-Click` → one-click POST
//! 2. `List-Unsubscribe` entries (https before http before mailto)
//! 3. Body anchors / text lines matching the unsubscribe lexicon
//!
//! Malformed URIs are dropped with a note; they never fail the extraction.

use std::collections::HashMap;
use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use tracing::debug;
use url::Url;

use crate::config::ExtractorConfig;
use crate::message::NormalizedMessage;
use crate::pipeline::types::{
    Extraction, ExtractionNote, MailtoTarget, MechanismKind, UnsubscribeMechanism,
    UnsubscribeTarget,
};

const LIST_UNSUBSCRIBE: &str = "list-unsubscribe";
const LIST_UNSUBSCRIBE_POST: &str = "list-unsubscribe-post";
const BODY_HTML: &str = "body-html";
const BODY_TEXT: &str = "body-text";

/// Href fragments that mark an unsubscribe link even when the anchor text
/// is an image or a generic "click here".
const HREF_HINTS: &[&str] = &["unsubscribe", "optout", "opt-out", "opt_out"];

static BODY_URI: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\b(?:https?://|mailto:)[^\s<>"'\)\]]+"#).unwrap()
});

static ANGLE_URI: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"<([^>]*)>").unwrap());

/// Extracts unsubscribe mechanisms from normalized messages.
pub struct Extractor {
    config: ExtractorConfig,
    lexicon: Vec<String>,
}

impl Extractor {
    pub fn new(config: ExtractorConfig) -> Self {
        let lexicon = config.lexicon.iter().map(|k| k.to_lowercase()).collect();
        Self { config, lexicon }
    }

    /// Candidate mechanisms ordered by confidence, highest first. An empty
    /// result is a legitimate "no mechanism" answer.
    pub fn extract(&self, msg: &NormalizedMessage) -> Extraction {
        let mut extraction = Extraction::default();

        self.extract_header(msg, &mut extraction);

        let penalty = if msg.decoding_degraded {
            self.config.confidence.degraded_penalty
        } else {
            0.0
        };
        if let Some(html) = &msg.body_html {
            self.extract_html(html, penalty, &mut extraction);
        }
        self.extract_text(&msg.body_text, penalty, &mut extraction);

        dedupe_and_rank(&mut extraction.mechanisms);

        debug!(
            message_id = %msg.id,
            candidates = extraction.mechanisms.len(),
            dropped = extraction.notes.len(),
            "Extracted unsubscribe mechanisms"
        );
        extraction
    }

    fn extract_header(&self, msg: &NormalizedMessage, out: &mut Extraction) {
        let confidence = &self.config.confidence;
        let one_click = msg
            .header_values(LIST_UNSUBSCRIBE_POST)
            .iter()
            .any(|v| v.to_ascii_lowercase().contains("one-click"));
        let mut one_click_taken = false;

        for value in msg.header_values(LIST_UNSUBSCRIBE) {
            for raw in split_list_unsubscribe(value) {
                match classify_uri(&raw) {
                    Some(ParsedUri::Http(uri)) => {
                        let is_https = uri.scheme() == "https";
                        if one_click && is_https && !one_click_taken {
                            one_click_taken = true;
                            out.mechanisms.push(UnsubscribeMechanism::new(
                                MechanismKind::HeaderOneClickPost { uri: uri.clone() },
                                confidence.one_click_post,
                                LIST_UNSUBSCRIBE,
                            ));
                        }
                        let score = if is_https {
                            confidence.header_https
                        } else {
                            confidence.header_http
                        };
                        out.mechanisms.push(UnsubscribeMechanism::new(
                            MechanismKind::HeaderListUnsubscribe {
                                target: UnsubscribeTarget::Http { uri },
                            },
                            score,
                            LIST_UNSUBSCRIBE,
                        ));
                    }
                    Some(ParsedUri::Mailto(target)) => {
                        out.mechanisms.push(UnsubscribeMechanism::new(
                            MechanismKind::HeaderListUnsubscribe {
                                target: UnsubscribeTarget::Mailto(target),
                            },
                            confidence.header_mailto,
                            LIST_UNSUBSCRIBE,
                        ));
                    }
                    None => drop_uri(out, LIST_UNSUBSCRIBE, &raw),
                }
            }
        }
    }

    fn extract_html(&self, html: &str, penalty: f32, out: &mut Extraction) {
        let Ok(anchor_sel) = Selector::parse("a[href]") else {
            return;
        };
        let document = Html::parse_document(html);

        for anchor in document.select(&anchor_sel) {
            let href = anchor.value().attr("href").unwrap_or("").trim();
            let text = anchor.text().collect::<String>().to_lowercase();
            let title = anchor.value().attr("title").unwrap_or("").to_lowercase();
            let href_lower = href.to_ascii_lowercase();

            let matches_text = self.matches_lexicon(&text) || self.matches_lexicon(&title);
            let matches_href = HREF_HINTS.iter().any(|h| href_lower.contains(h));
            if !matches_text && !matches_href {
                continue;
            }
            self.push_body_candidate(href, BODY_HTML, penalty, out);
        }
    }

    fn extract_text(&self, text: &str, penalty: f32, out: &mut Extraction) {
        let mut previous_matched = false;
        for line in text.lines() {
            let lower = line.to_lowercase();
            let matched = self.matches_lexicon(&lower);
            if matched || previous_matched {
                for uri in BODY_URI.find_iter(line) {
                    let raw = uri.as_str().trim_end_matches(['.', ',', ';', ':']);
                    self.push_body_candidate(raw, BODY_TEXT, penalty, out);
                }
            }
            // "To unsubscribe, visit:" followed by the link on the next line.
            previous_matched = matched && !BODY_URI.is_match(line);
        }
    }

    fn push_body_candidate(&self, raw: &str, source: &str, penalty: f32, out: &mut Extraction) {
        let confidence = &self.config.confidence;
        match classify_uri(raw) {
            Some(ParsedUri::Http(uri)) => out.mechanisms.push(UnsubscribeMechanism::new(
                MechanismKind::BodyLink { uri },
                confidence.body_link - penalty,
                source,
            )),
            Some(ParsedUri::Mailto(target)) => out.mechanisms.push(UnsubscribeMechanism::new(
                MechanismKind::MailtoBody {
                    address: target.address,
                    subject: target.subject,
                },
                confidence.body_mailto - penalty,
                source,
            )),
            None => drop_uri(out, source, raw),
        }
    }

    fn matches_lexicon(&self, lower: &str) -> bool {
        !lower.is_empty() && self.lexicon.iter().any(|k| lower.contains(k.as_str()))
    }
}

enum ParsedUri {
    Http(Url),
    Mailto(MailtoTarget),
}

/// Accept absolute http(s) URLs with a host, and mailto URIs with an address.
fn classify_uri(raw: &str) -> Option<ParsedUri> {
    let raw = raw.trim();
    if raw.get(..7).is_some_and(|p| p.eq_ignore_ascii_case("mailto:")) {
        return MailtoTarget::parse(raw).map(ParsedUri::Mailto);
    }
    let uri = Url::parse(raw).ok()?;
    match uri.scheme() {
        "http" | "https" if uri.host_str().is_some_and(|h| !h.is_empty()) => {
            Some(ParsedUri::Http(uri))
        }
        _ => None,
    }
}

/// Split a `List-Unsubscribe` value into its URIs.
///
/// The standard form is a comma-separated list of `<uri>`; values without
/// any angle brackets are split on commas as a lenient fallback.
fn split_list_unsubscribe(value: &str) -> Vec<String> {
    let bracketed: Vec<String> = ANGLE_URI
        .captures_iter(value)
        .filter_map(|c| c.get(1))
        .map(|m| m.as_str().split_whitespace().collect::<String>())
        .collect();
    if !bracketed.is_empty() {
        return bracketed;
    }
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

fn drop_uri(out: &mut Extraction, source_field: &str, raw: &str) {
    debug!(source_field, raw, "Dropped malformed unsubscribe URI");
    out.notes.push(ExtractionNote::DroppedMalformedUri {
        source_field: source_field.to_string(),
        raw: raw.to_string(),
    });
}

/// Keep the most confident candidate per target, then sort descending.
/// The sort is stable so header order breaks ties.
fn dedupe_and_rank(mechanisms: &mut Vec<UnsubscribeMechanism>) {
    let mut best: HashMap<String, usize> = HashMap::new();
    let mut kept: Vec<UnsubscribeMechanism> = Vec::with_capacity(mechanisms.len());
    for mechanism in mechanisms.drain(..) {
        let key = mechanism.kind.target_key();
        match best.get(&key) {
            Some(&idx) => {
                if mechanism.confidence > kept[idx].confidence {
                    kept[idx] = mechanism;
                }
            }
            None => {
                best.insert(key, kept.len());
                kept.push(mechanism);
            }
        }
    }
    kept.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    *mechanisms = kept;
}
