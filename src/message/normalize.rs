//! Message normalizer: raw RFC 5322 bytes to `NormalizedMessage`.
//!
//! Never fails on encoding trouble: lossy decoding is used instead and the
//! message is flagged with `decoding_degraded`. Only a message without
//! headers or without a usable `From` address is rejected.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use mail_parser::{MessageParser, PartType};
use scraper::Html;
use tracing::debug;

use crate::error::NormalizeError;
use crate::message::types::{NormalizedMessage, RawMessage, Sender};

/// Normalize one raw provider message.
pub fn normalize(raw: &RawMessage) -> Result<NormalizedMessage, NormalizeError> {
    let parsed = MessageParser::default()
        .parse(raw.raw.as_slice())
        .ok_or_else(|| malformed(raw, "unparseable message"))?;

    let mut degraded = false;
    let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let bytes = parsed.raw_message();

    for header in parsed.headers() {
        let name = header.name().trim().to_ascii_lowercase();
        if name.is_empty() {
            continue;
        }
        let start = header.offset_start as usize;
        let end = header.offset_end as usize;
        let Some(slice) = bytes.get(start..end) else {
            continue;
        };
        let value = match std::str::from_utf8(slice) {
            Ok(s) => unfold(s),
            Err(_) => {
                degraded = true;
                unfold(&String::from_utf8_lossy(slice))
            }
        };
        headers.entry(name).or_default().push(value);
    }

    if headers.is_empty() {
        return Err(malformed(raw, "no headers"));
    }

    let sender = extract_sender(&parsed).ok_or_else(|| malformed(raw, "no parseable sender"))?;

    let subject = parsed.subject().unwrap_or_default().trim().to_string();

    let body_html = parsed.html_bodies().find_map(|part| match &part.body {
        PartType::Html(html) => Some(html.to_string()),
        _ => None,
    });

    let mut body_text = parsed
        .text_bodies()
        .filter_map(|part| match &part.body {
            PartType::Text(text) => Some(text.as_ref()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("\n");
    if body_text.trim().is_empty()
        && let Some(html) = &body_html
    {
        body_text = strip_html(html);
    }

    if body_text.contains('\u{FFFD}')
        || body_html.as_deref().is_some_and(|h| h.contains('\u{FFFD}'))
        || subject.contains('\u{FFFD}')
    {
        degraded = true;
    }

    let received_at = parsed
        .date()
        .and_then(|d| DateTime::from_timestamp(d.to_timestamp(), 0))
        .or(raw.received_at)
        .unwrap_or_else(Utc::now);

    if degraded {
        debug!(message_id = %raw.id, "Message decoded lossily");
    }

    Ok(NormalizedMessage {
        id: raw.id.clone(),
        sender,
        subject,
        received_at,
        headers,
        body_text,
        body_html,
        decoding_degraded: degraded,
    })
}

fn malformed(raw: &RawMessage, reason: &str) -> NormalizeError {
    NormalizeError::MalformedMessage {
        id: raw.id.clone(),
        reason: reason.to_string(),
    }
}

/// Extract the sender from the `From` header. Requires an `@` in the address.
fn extract_sender(parsed: &mail_parser::Message) -> Option<Sender> {
    let addr = parsed.from().and_then(|a| a.first())?;
    let address = addr.address()?.trim().to_lowercase();
    if !address.contains('@') || address.starts_with('@') || address.ends_with('@') {
        return None;
    }
    let display_name = addr
        .name()
        .map(|n| n.trim().trim_matches('"').to_string())
        .filter(|n| !n.is_empty());
    Some(Sender {
        address,
        display_name,
    })
}

/// Undo RFC 5322 header folding and trim surrounding whitespace.
fn unfold(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut pending_space = false;
    for ch in value.chars() {
        if ch == '\r' || ch == '\n' {
            pending_space = true;
            continue;
        }
        if pending_space {
            if ch.is_whitespace() {
                continue;
            }
            out.push(' ');
            pending_space = false;
        }
        out.push(ch);
    }
    out.trim().to_string()
}

/// Elements whose text never renders.
const INVISIBLE_ELEMENTS: &[&str] = &["script", "style", "noscript", "template", "title"];

/// Visible text of an HTML body, whitespace-compacted.
pub fn strip_html(html: &str) -> String {
    let document = Html::parse_document(html);
    let visible: Vec<&str> = document
        .root_element()
        .descendants()
        .filter_map(|node| {
            let text = node.value().as_text()?;
            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .is_some_and(|e| INVISIBLE_ELEMENTS.contains(&e.name()))
            });
            (!hidden).then_some(&**text)
        })
        .collect();
    visible
        .join(" ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawMessage {
        RawMessage::new("msg-1", text.as_bytes().to_vec())
    }

    #[test]
    fn normalizes_basic_message() {
        let msg = normalize(&raw(
            "From: \"Shop News\" <News@Shop.Example>\r\n\
             To: me@example.com\r\n\
             Subject: Weekly deals\r\n\
             Date: Mon, 5 Jan 2026 10:00:00 +0000\r\n\
             List-Unsubscribe: <https://shop.example/u?id=1>,\r\n <mailto:unsub@shop.example>\r\n\
             \r\n\
             Hello there\r\n",
        ))
        .unwrap();

        assert_eq!(msg.id, "msg-1");
        assert_eq!(msg.sender.address, "news@shop.example");
        assert_eq!(msg.sender.display_name.as_deref(), Some("Shop News"));
        assert_eq!(msg.subject, "Weekly deals");
        assert_eq!(
            msg.header("list-unsubscribe"),
            Some("<https://shop.example/u?id=1>, <mailto:unsub@shop.example>")
        );
        assert!(msg.body_text.contains("Hello there"));
        assert!(msg.body_html.is_none());
        assert!(!msg.decoding_degraded);
        assert_eq!(msg.received_at.timestamp(), 1_767_607_200);
    }

    #[test]
    fn keeps_repeated_headers() {
        let msg = normalize(&raw(
            "From: a@b.example\r\nReceived: one\r\nReceived: two\r\nSubject: x\r\n\r\nbody\r\n",
        ))
        .unwrap();
        assert_eq!(msg.header_values("received"), ["one", "two"]);
    }

    #[test]
    fn html_only_message_gets_text_fallback() {
        let msg = normalize(&raw(
            "From: a@b.example\r\n\
             Subject: html\r\n\
             Content-Type: text/html; charset=utf-8\r\n\
             \r\n\
             <p>Hi <a href=\"https://b.example/unsub\">unsubscribe</a></p>\r\n",
        ))
        .unwrap();
        assert!(msg.body_html.as_deref().unwrap().contains("href"));
        assert!(msg.body_text.contains("unsubscribe"));
    }

    #[test]
    fn missing_sender_is_malformed() {
        let err = normalize(&raw("Subject: no sender\r\n\r\nbody\r\n")).unwrap_err();
        assert!(matches!(
            err,
            NormalizeError::MalformedMessage { ref reason, .. } if reason == "no parseable sender"
        ));
    }

    #[test]
    fn sender_without_domain_is_malformed() {
        assert!(normalize(&raw("From: nobody\r\nSubject: x\r\n\r\nbody\r\n")).is_err());
    }

    #[test]
    fn invalid_utf8_header_is_degraded_not_fatal() {
        let mut bytes = b"From: a@b.example\r\nSubject: ok\r\nX-Junk: ".to_vec();
        bytes.extend_from_slice(&[0xff, 0xfe, b'z']);
        bytes.extend_from_slice(b"\r\n\r\nbody\r\n");
        let msg = normalize(&RawMessage::new("m", bytes)).unwrap();
        assert!(msg.decoding_degraded);
        assert!(msg.header("x-junk").is_some());
    }

    #[test]
    fn falls_back_to_provider_timestamp() {
        let when = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut r = raw("From: a@b.example\r\nSubject: x\r\n\r\nbody\r\n");
        r.received_at = Some(when);
        assert_eq!(normalize(&r).unwrap().received_at, when);
    }

    #[test]
    fn unfold_joins_continuation_lines() {
        assert_eq!(unfold(" <a>,\r\n\t<b>\r\n"), "<a>, <b>");
        assert_eq!(unfold("plain"), "plain");
    }

    #[test]
    fn strip_html_basic() {
        assert_eq!(strip_html("<p>Hello</p>"), "Hello");
        assert_eq!(
            strip_html("<div><b>Bold</b> and <i>italic</i></div>"),
            "Bold and italic"
        );
    }

    #[test]
    fn strip_html_drops_script_and_style_text() {
        let html = "<html><head><title>Deals</title><style>.sale { color: red }</style>\
                    <script>var promo = 'limited time';</script></head>\
                    <body><p>Hi there</p><noscript>Enable JS for our sale</noscript></body></html>";
        assert_eq!(strip_html(html), "Hi there");
    }

    #[test]
    fn html_only_body_hides_script_from_text() {
        let message = raw(
            "From: friend@example.com\r\nSubject: hello\r\nContent-Type: text/html\r\n\r\n\
             <p>See you soon</p><script>track('free shipping')</script>\r\n",
        );
        let msg = normalize(&message).unwrap();
        assert!(msg.body_text.contains("See you soon"));
        assert!(!msg.body_text.contains("free shipping"));
    }
}
