//! Gmail REST provider.
//!
//! Uses the Gmail API v1 with a bearer access token:
//! - `users.messages.list` + `users.messages.get?format=raw` for fetching
//! - `users.messages.send` for mailto unsubscribe requests
//! - `users.settings.filters.create` for the mailbox-filter fallback
//!
//! Obtaining and refreshing the token is the caller's business.

use std::time::Duration;

use async_trait::async_trait;
use base64::prelude::*;
use chrono::DateTime;
use reqwest::StatusCode;
use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderValue, RETRY_AFTER};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::error::{ConfigError, MailboxError};
use crate::message::RawMessage;
use crate::provider::{Draft, MailboxProvider, MessagePage};

const GMAIL_API_BASE: &str = "https://gmail.googleapis.com/gmail/v1/users/me";
const PROVIDER: &str = "gmail";

/// Gmail provider configuration.
#[derive(Debug, Clone)]
pub struct GmailConfig {
    pub access_token: SecretString,
    /// Address used as `From` on unsubscribe mails. Looked up from the
    /// profile endpoint when unset.
    pub user_address: Option<String>,
    pub api_base: String,
    pub request_timeout: Duration,
}

impl GmailConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_token =
            std::env::var("GMAIL_ACCESS_TOKEN").map_err(|_| ConfigError::MissingRequired {
                key: "GMAIL_ACCESS_TOKEN".into(),
                hint: "Set an OAuth access token with the gmail.modify and gmail.settings.basic scopes".into(),
            })?;
        Ok(Self {
            access_token: SecretString::from(access_token),
            user_address: std::env::var("GMAIL_ADDRESS").ok(),
            api_base: std::env::var("GMAIL_API_BASE").unwrap_or_else(|_| GMAIL_API_BASE.into()),
            request_timeout: Duration::from_secs(30),
        })
    }
}

// ── Wire types ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageListResponse {
    messages: Option<Vec<MessageRef>>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawMessageResponse {
    id: String,
    raw: Option<String>,
    internal_date: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileResponse {
    email_address: String,
}

#[derive(Debug, Serialize)]
struct SendRequest {
    raw: String,
}

#[derive(Debug, Deserialize)]
struct IdResponse {
    id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterRequest {
    criteria: FilterCriteria,
    action: FilterAction,
}

#[derive(Debug, Serialize)]
struct FilterCriteria {
    from: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct FilterAction {
    remove_label_ids: Vec<String>,
}

// ── Provider ────────────────────────────────────────────────────────

/// Gmail API mailbox provider.
pub struct GmailProvider {
    config: GmailConfig,
    client: reqwest::Client,
    user_address: OnceCell<String>,
}

impl GmailProvider {
    pub fn new(config: GmailConfig) -> Result<Self, MailboxError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| request_error(format!("failed to build HTTP client: {e}")))?;
        let user_address = OnceCell::new_with(config.user_address.clone());
        Ok(Self {
            config,
            client,
            user_address,
        })
    }

    fn auth_headers(&self) -> Result<HeaderMap, MailboxError> {
        let mut headers = HeaderMap::new();
        let value = HeaderValue::from_str(&format!(
            "Bearer {}",
            self.config.access_token.expose_secret()
        ))
        .map_err(|_| MailboxError::AuthFailed {
            provider: PROVIDER.into(),
        })?;
        headers.insert(AUTHORIZATION, value);
        Ok(headers)
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}{}", self.config.api_base.trim_end_matches('/'), endpoint)
    }

    async fn get<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        query: &[(&str, String)],
    ) -> Result<T, MailboxError> {
        let response = self
            .client
            .get(self.url(endpoint))
            .headers(self.auth_headers()?)
            .query(query)
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;
        handle_response(response).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        endpoint: &str,
        body: &B,
    ) -> Result<T, MailboxError> {
        let response = self
            .client
            .post(self.url(endpoint))
            .headers(self.auth_headers()?)
            .json(body)
            .send()
            .await
            .map_err(|e| request_error(e.to_string()))?;
        handle_response(response).await
    }

    async fn from_address(&self) -> Result<&str, MailboxError> {
        self.user_address
            .get_or_try_init(|| async {
                let profile: ProfileResponse = self.get("/profile", &[]).await?;
                Ok::<_, MailboxError>(profile.email_address)
            })
            .await
            .map(String::as_str)
    }

    async fn fetch_raw(&self, id: &str) -> Result<RawMessage, MailboxError> {
        let response: RawMessageResponse = self
            .get(&format!("/messages/{id}"), &[("format", "raw".to_string())])
            .await?;
        let raw = response.raw.ok_or_else(|| MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("message {id} has no raw payload"),
        })?;
        let mut message = RawMessage::new(response.id, decode_raw(&raw)?);
        message.received_at = response
            .internal_date
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(DateTime::from_timestamp_millis);
        Ok(message)
    }
}

#[async_trait]
impl MailboxProvider for GmailProvider {
    fn name(&self) -> &str {
        PROVIDER
    }

    async fn list_messages(
        &self,
        query: &str,
        page_token: Option<&str>,
        page_size: usize,
    ) -> Result<MessagePage, MailboxError> {
        let mut params = vec![
            ("q", query.to_string()),
            ("maxResults", page_size.clamp(1, 500).to_string()),
        ];
        if let Some(token) = page_token {
            params.push(("pageToken", token.to_string()));
        }
        let list: MessageListResponse = self.get("/messages", &params).await?;

        let refs = list.messages.unwrap_or_default();
        let mut messages = Vec::with_capacity(refs.len());
        for r in &refs {
            // A message can vanish between list and get; only bad
            // credentials fail the page.
            match self.fetch_raw(&r.id).await {
                Ok(message) => messages.push(message),
                Err(e @ MailboxError::AuthFailed { .. }) => return Err(e),
                Err(e) => warn!(gmail_id = %r.id, error = %e, "Skipping unreadable message"),
            }
        }
        debug!(
            listed = refs.len(),
            count = messages.len(),
            more = list.next_page_token.is_some(),
            "Fetched Gmail page"
        );

        Ok(MessagePage {
            messages,
            next_page_token: list.next_page_token,
        })
    }

    async fn send_message(&self, draft: &Draft) -> Result<String, MailboxError> {
        let from = self.from_address().await?;
        let raw = draft.to_rfc5322(from)?;
        let request = SendRequest {
            raw: BASE64_URL_SAFE_NO_PAD.encode(raw),
        };
        let response: IdResponse = self.post("/messages/send", &request).await?;
        info!(to = %draft.to, gmail_id = %response.id, "Unsubscribe mail sent");
        Ok(response.id)
    }

    async fn create_filter(&self, sender_pattern: &str) -> Result<String, MailboxError> {
        let request = FilterRequest {
            criteria: FilterCriteria {
                from: sender_pattern.to_string(),
            },
            action: FilterAction {
                remove_label_ids: vec!["INBOX".into()],
            },
        };
        let response: IdResponse = self.post("/settings/filters", &request).await?;
        info!(sender = sender_pattern, filter_id = %response.id, "Gmail filter created");
        Ok(response.id)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn request_error(reason: String) -> MailboxError {
    MailboxError::Request {
        provider: PROVIDER.into(),
        reason,
    }
}

async fn handle_response<T: DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, MailboxError> {
    let status = response.status();
    if !status.is_success() {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        return Err(status_error(status, retry_after, &body));
    }
    response
        .json()
        .await
        .map_err(|e| MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("parse response: {e}"),
        })
}

/// Map a non-success Gmail status to a mailbox error.
fn status_error(status: StatusCode, retry_after: Option<Duration>, body: &str) -> MailboxError {
    match status.as_u16() {
        401 | 403 => MailboxError::AuthFailed {
            provider: PROVIDER.into(),
        },
        429 => MailboxError::RateLimited {
            provider: PROVIDER.into(),
            retry_after,
        },
        s if s >= 500 => request_error(format!("API error ({status}): {body}")),
        _ => MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("API error ({status}): {body}"),
        },
    }
}

/// Decode Gmail's base64url `raw` field, with or without padding.
fn decode_raw(data: &str) -> Result<Vec<u8>, MailboxError> {
    BASE64_URL_SAFE_NO_PAD
        .decode(data.trim().trim_end_matches('='))
        .map_err(|e| MailboxError::InvalidResponse {
            provider: PROVIDER.into(),
            reason: format!("invalid base64 raw payload: {e}"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert!(matches!(
            status_error(StatusCode::UNAUTHORIZED, None, ""),
            MailboxError::AuthFailed { .. }
        ));
        assert!(matches!(
            status_error(StatusCode::FORBIDDEN, None, ""),
            MailboxError::AuthFailed { .. }
        ));
        match status_error(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(7)), "") {
            MailboxError::RateLimited { retry_after, .. } => {
                assert_eq!(retry_after, Some(Duration::from_secs(7)))
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
        assert!(status_error(StatusCode::SERVICE_UNAVAILABLE, None, "").is_transient());
        assert!(!status_error(StatusCode::BAD_REQUEST, None, "bad").is_transient());
    }

    #[test]
    fn decodes_padded_and_unpadded_raw() {
        let padded = BASE64_URL_SAFE.encode(b"From: a@b.example\r\n\r\nhi");
        let unpadded = BASE64_URL_SAFE_NO_PAD.encode(b"From: a@b.example\r\n\r\nhi");
        assert_eq!(decode_raw(&padded).unwrap(), decode_raw(&unpadded).unwrap());
        assert!(decode_raw("***").is_err());
    }

    #[test]
    fn config_requires_token() {
        // Only checks the error shape; the variable is not set in tests.
        if std::env::var("GMAIL_ACCESS_TOKEN").is_err() {
            assert!(matches!(
                GmailConfig::from_env(),
                Err(ConfigError::MissingRequired { .. })
            ));
        }
    }

    /// Serves `/messages` with ids `a`, `gone` and `b`; `gone` answers with
    /// `missing_status`.
    async fn start_gmail(missing_status: axum::http::StatusCode) -> GmailProvider {
        use axum::extract::Path;
        use axum::routing::get;
        use axum::{Json, Router};

        let app = Router::new()
            .route(
                "/messages",
                get(|| async {
                    Json(serde_json::json!({
                        "messages": [{"id": "a"}, {"id": "gone"}, {"id": "b"}]
                    }))
                }),
            )
            .route(
                "/messages/{id}",
                get(move |Path(id): Path<String>| async move {
                    if id == "gone" {
                        return Err(missing_status);
                    }
                    let raw = format!("From: news@{id}.example\r\nSubject: hi\r\n\r\nbody\r\n");
                    Ok(Json(serde_json::json!({
                        "id": id,
                        "raw": BASE64_URL_SAFE.encode(raw),
                        "internalDate": "1700000000000"
                    })))
                }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        GmailProvider::new(GmailConfig {
            access_token: SecretString::from("t"),
            user_address: Some("me@example.com".into()),
            api_base: format!("http://{addr}"),
            request_timeout: Duration::from_secs(5),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn vanished_message_is_skipped_not_fatal() {
        let provider = start_gmail(axum::http::StatusCode::NOT_FOUND).await;
        let page = provider.list_messages("in:inbox", None, 10).await.unwrap();

        let ids: Vec<_> = page.messages.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert!(page.messages[0].received_at.is_some());
    }

    #[tokio::test]
    async fn server_error_on_one_message_is_skipped() {
        let provider = start_gmail(axum::http::StatusCode::BAD_GATEWAY).await;
        let page = provider.list_messages("in:inbox", None, 10).await.unwrap();
        assert_eq!(page.messages.len(), 2);
    }

    #[tokio::test]
    async fn auth_failure_on_get_fails_the_page() {
        let provider = start_gmail(axum::http::StatusCode::UNAUTHORIZED).await;
        assert!(matches!(
            provider.list_messages("in:inbox", None, 10).await,
            Err(MailboxError::AuthFailed { .. })
        ));
    }

    #[test]
    fn url_joins_base() {
        let provider = GmailProvider::new(GmailConfig {
            access_token: SecretString::from("t"),
            user_address: Some("me@example.com".into()),
            api_base: "http://127.0.0.1:9/gmail/".into(),
            request_timeout: Duration::from_secs(1),
        })
        .unwrap();
        assert_eq!(provider.url("/messages"), "http://127.0.0.1:9/gmail/messages");
    }
}
