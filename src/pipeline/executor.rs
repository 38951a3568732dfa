//! Action executor: performs one unsubscribe mechanism.
//!
//! HTTP mechanisms go through `reqwest` with a bounded timeout and redirect
//! limit; mail mechanisms are delegated to the mailbox provider. Transient
//! failures are retried per `RetryPolicy`; everything else fails the
//! attempt immediately. The executor never touches the ledger.

use std::sync::Arc;

use reqwest::StatusCode;
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ExecutorConfig;
use crate::error::ExecutionError;
use crate::pipeline::types::{
    ExecutionResult, MailtoTarget, MechanismKind, UnsubscribeMechanism, UnsubscribeTarget,
};
use crate::provider::{Draft, MailboxProvider};
use crate::store::traits::OutcomeStatus;

/// RFC 8058 one-click body.
const ONE_CLICK_BODY: &str = "List-Unsubscribe=One-Click";
const DEFAULT_MAIL_TEXT: &str = "unsubscribe";
/// Bytes of a response body inspected for a confirmation phrase.
const CONFIRMATION_SCAN_LIMIT: usize = 64 * 1024;

/// Per-call inputs the executor needs besides the mechanism itself.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub message_id: String,
    pub key: String,
    /// Mechanisms below this confidence are refused.
    pub confidence_floor: f32,
}

/// What a successful attempt observed.
struct AttemptSuccess {
    http_status: Option<u16>,
    confirmed: bool,
}

struct AttemptFailure {
    error: ExecutionError,
    http_status: Option<u16>,
}

impl From<ExecutionError> for AttemptFailure {
    fn from(error: ExecutionError) -> Self {
        Self {
            error,
            http_status: None,
        }
    }
}

pub struct Executor {
    config: ExecutorConfig,
    client: reqwest::Client,
    provider: Arc<dyn MailboxProvider>,
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        provider: Arc<dyn MailboxProvider>,
    ) -> Result<Self, ExecutionError> {
        let client = reqwest::Client::builder()
            .timeout(config.http_timeout)
            .redirect(reqwest::redirect::Policy::limited(config.max_redirects))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| ExecutionError::Connection(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            client,
            provider,
        })
    }

    /// Execute `mechanism` with retries. Always returns a terminal result.
    pub async fn execute(
        &self,
        mechanism: &UnsubscribeMechanism,
        ctx: &ExecutionContext,
    ) -> ExecutionResult {
        if mechanism.confidence < ctx.confidence_floor {
            debug!(
                message_id = %ctx.message_id,
                key = %ctx.key,
                mechanism = mechanism.kind.label(),
                confidence = mechanism.confidence,
                floor = ctx.confidence_floor,
                "Mechanism below confidence floor, refusing"
            );
            return ExecutionResult::skipped(format!(
                "below_floor: confidence {:.2} is below floor {:.2}",
                mechanism.confidence, ctx.confidence_floor
            ));
        }

        let policy = self.config.retry;
        let max_attempts = policy.max_attempts();
        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.attempt(&mechanism.kind).await {
                Ok(success) => {
                    info!(
                        message_id = %ctx.message_id,
                        key = %ctx.key,
                        mechanism = %mechanism.kind,
                        attempt,
                        confirmed = success.confirmed,
                        "Unsubscribe succeeded"
                    );
                    return ExecutionResult {
                        status: OutcomeStatus::Succeeded,
                        attempts: attempt,
                        http_status: success.http_status,
                        error: None,
                        confirmed: success.confirmed,
                    };
                }
                Err(failure) if failure.error.is_transient() && attempt < max_attempts => {
                    let delay = policy.delay(attempt);
                    warn!(
                        message_id = %ctx.message_id,
                        key = %ctx.key,
                        attempt,
                        error = %failure.error,
                        delay_ms = delay.as_millis() as u64,
                        "Transient unsubscribe failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(failure) => {
                    warn!(
                        message_id = %ctx.message_id,
                        key = %ctx.key,
                        mechanism = %mechanism.kind,
                        attempt,
                        error = %failure.error,
                        "Unsubscribe failed"
                    );
                    return ExecutionResult {
                        status: OutcomeStatus::Failed,
                        attempts: attempt,
                        http_status: failure.http_status,
                        error: Some(failure.error.ledger_text()),
                        confirmed: false,
                    };
                }
            }
        }
    }

    async fn attempt(&self, kind: &MechanismKind) -> Result<AttemptSuccess, AttemptFailure> {
        match kind {
            MechanismKind::HeaderOneClickPost { uri } => self.http(uri, true).await,
            MechanismKind::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Http { uri },
            }
            | MechanismKind::BodyLink { uri } => self.http(uri, false).await,
            MechanismKind::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Mailto(target),
            } => self.mail(draft_for(target)).await,
            MechanismKind::MailtoBody { address, subject } => {
                self.mail(Draft {
                    to: address.clone(),
                    subject: subject.clone().unwrap_or_else(|| DEFAULT_MAIL_TEXT.into()),
                    body: DEFAULT_MAIL_TEXT.into(),
                })
                .await
            }
            MechanismKind::MailboxFilter { sender_pattern } => {
                self.provider
                    .create_filter(sender_pattern)
                    .await
                    .map_err(ExecutionError::from)?;
                Ok(AttemptSuccess {
                    http_status: None,
                    confirmed: false,
                })
            }
        }
    }

    async fn http(&self, uri: &Url, one_click: bool) -> Result<AttemptSuccess, AttemptFailure> {
        if !matches!(uri.scheme(), "http" | "https") {
            return Err(ExecutionError::MalformedUri(uri.to_string()).into());
        }

        let request = if one_click {
            self.client
                .post(uri.clone())
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(ONE_CLICK_BODY)
        } else {
            self.client.get(uri.clone())
        };

        let response = request.send().await.map_err(|e| self.transport_error(e))?;
        let status = response.status();
        if status.is_success() {
            let head = read_head(response, CONFIRMATION_SCAN_LIMIT).await;
            return Ok(AttemptSuccess {
                http_status: Some(status.as_u16()),
                confirmed: self.is_confirmation(&String::from_utf8_lossy(&head)),
            });
        }
        Err(AttemptFailure {
            error: status_error(status),
            http_status: Some(status.as_u16()),
        })
    }

    async fn mail(&self, draft: Draft) -> Result<AttemptSuccess, AttemptFailure> {
        let id = self
            .provider
            .send_message(&draft)
            .await
            .map_err(ExecutionError::from)?;
        debug!(to = %draft.to, provider_id = %id, "Provider accepted unsubscribe mail");
        Ok(AttemptSuccess {
            http_status: None,
            confirmed: false,
        })
    }

    fn transport_error(&self, e: reqwest::Error) -> ExecutionError {
        if e.is_timeout() {
            ExecutionError::Timeout(self.config.http_timeout)
        } else if e.is_redirect() {
            ExecutionError::Refused(format!(
                "more than {} redirects",
                self.config.max_redirects
            ))
        } else if e.is_builder() {
            ExecutionError::MalformedUri(e.to_string())
        } else {
            ExecutionError::Connection(e.to_string())
        }
    }

    fn is_confirmation(&self, body: &str) -> bool {
        let lower = body.to_lowercase();
        self.config
            .confirmation_phrases
            .iter()
            .any(|p| lower.contains(&p.to_lowercase()))
    }
}

/// Read at most `limit` bytes of the body; the rest is never downloaded.
/// A body error ends the read without failing the attempt.
async fn read_head(mut response: reqwest::Response, limit: usize) -> Vec<u8> {
    let mut head = Vec::new();
    while head.len() < limit {
        match response.chunk().await {
            Ok(Some(chunk)) => {
                let take = chunk.len().min(limit - head.len());
                head.extend_from_slice(&chunk[..take]);
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "Response body ended early");
                break;
            }
        }
    }
    head
}

fn status_error(status: StatusCode) -> ExecutionError {
    let code = status.as_u16();
    if status == StatusCode::TOO_MANY_REQUESTS {
        ExecutionError::RateLimited
    } else if status.is_server_error() {
        ExecutionError::ServerError { status: code }
    } else {
        ExecutionError::ClientError { status: code }
    }
}

fn draft_for(target: &MailtoTarget) -> Draft {
    Draft {
        to: target.address.clone(),
        subject: target
            .subject
            .clone()
            .unwrap_or_else(|| DEFAULT_MAIL_TEXT.into()),
        body: target.body.clone().unwrap_or_else(|| DEFAULT_MAIL_TEXT.into()),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::error::MailboxError;
    use crate::provider::MessagePage;

    /// Records drafts and filters; fails sends with the queued errors first.
    #[derive(Default)]
    struct RecordingProvider {
        drafts: Mutex<Vec<Draft>>,
        filters: Mutex<Vec<String>>,
        send_failures: Mutex<Vec<MailboxError>>,
    }

    #[async_trait]
    impl MailboxProvider for RecordingProvider {
        fn name(&self) -> &str {
            "recording"
        }

        async fn list_messages(
            &self,
            _query: &str,
            _page_token: Option<&str>,
            _page_size: usize,
        ) -> Result<MessagePage, MailboxError> {
            Ok(MessagePage::default())
        }

        async fn send_message(&self, draft: &Draft) -> Result<String, MailboxError> {
            if let Some(err) = self.send_failures.lock().unwrap().pop() {
                return Err(err);
            }
            self.drafts.lock().unwrap().push(draft.clone());
            Ok("sent-1".into())
        }

        async fn create_filter(&self, sender_pattern: &str) -> Result<String, MailboxError> {
            self.filters.lock().unwrap().push(sender_pattern.into());
            Ok("filter-1".into())
        }
    }

    fn fast_config() -> ExecutorConfig {
        ExecutorConfig {
            retry: RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
                factor: 3,
            },
            http_timeout: Duration::from_secs(2),
            ..ExecutorConfig::default()
        }
    }

    fn ctx(floor: f32) -> ExecutionContext {
        ExecutionContext {
            message_id: "m1".into(),
            key: "ex.com#list".into(),
            confidence_floor: floor,
        }
    }

    fn executor(provider: Arc<RecordingProvider>) -> Executor {
        Executor::new(fast_config(), provider).unwrap()
    }

    #[tokio::test]
    async fn below_floor_is_skipped_without_activity() {
        let provider = Arc::new(RecordingProvider::default());
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::BodyLink {
                // Unroutable: any network attempt would fail, not skip.
                uri: Url::parse("https://127.0.0.1:9/unsub").unwrap(),
            },
            0.4,
            "body-html",
        );
        let result = executor(provider).execute(&mechanism, &ctx(0.5)).await;
        assert_eq!(result.status, OutcomeStatus::Skipped);
        assert_eq!(result.attempts, 0);
        assert!(result.error.unwrap().starts_with("below_floor"));
    }

    #[tokio::test]
    async fn floor_applies_to_mail_mechanisms() {
        let provider = Arc::new(RecordingProvider::default());
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::MailtoBody {
                address: "leave@ex.com".into(),
                subject: None,
            },
            0.35,
            "body-html",
        );
        let result = executor(Arc::clone(&provider))
            .execute(&mechanism, &ctx(0.5))
            .await;
        assert_eq!(result.status, OutcomeStatus::Skipped);
        assert!(provider.drafts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn mailto_header_sends_draft_with_uri_params() {
        let provider = Arc::new(RecordingProvider::default());
        let target =
            MailtoTarget::parse("mailto:leave@ex.com?subject=remove%20me&body=bye").unwrap();
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::HeaderListUnsubscribe {
                target: UnsubscribeTarget::Mailto(target),
            },
            0.6,
            "list-unsubscribe",
        );
        let result = executor(Arc::clone(&provider))
            .execute(&mechanism, &ctx(0.0))
            .await;
        assert_eq!(result.status, OutcomeStatus::Succeeded);
        assert_eq!(result.attempts, 1);
        assert_eq!(
            provider.drafts.lock().unwrap()[0],
            Draft {
                to: "leave@ex.com".into(),
                subject: "remove me".into(),
                body: "bye".into(),
            }
        );
    }

    #[tokio::test]
    async fn transient_mail_failure_is_retried() {
        let provider = Arc::new(RecordingProvider::default());
        provider.send_failures.lock().unwrap().push(MailboxError::RateLimited {
            provider: "recording".into(),
            retry_after: None,
        });
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::MailtoBody {
                address: "leave@ex.com".into(),
                subject: None,
            },
            0.35,
            "body-text",
        );
        let result = executor(Arc::clone(&provider))
            .execute(&mechanism, &ctx(0.0))
            .await;
        assert_eq!(result.status, OutcomeStatus::Succeeded);
        assert_eq!(result.attempts, 2);
        assert_eq!(provider.drafts.lock().unwrap()[0].subject, "unsubscribe");
    }

    #[tokio::test]
    async fn rejected_mail_is_permanent() {
        let provider = Arc::new(RecordingProvider::default());
        provider.send_failures.lock().unwrap().push(MailboxError::SendRejected {
            reason: "bad recipient".into(),
        });
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::MailtoBody {
                address: "leave@ex.com".into(),
                subject: None,
            },
            0.35,
            "body-text",
        );
        let result = executor(provider).execute(&mechanism, &ctx(0.0)).await;
        assert_eq!(result.status, OutcomeStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().starts_with("mailbox:"));
    }

    #[tokio::test]
    async fn filter_mechanism_creates_filter() {
        let provider = Arc::new(RecordingProvider::default());
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::MailboxFilter {
                sender_pattern: "news@ex.com".into(),
            },
            0.5,
            "filter-fallback",
        );
        let result = executor(Arc::clone(&provider))
            .execute(&mechanism, &ctx(0.5))
            .await;
        assert_eq!(result.status, OutcomeStatus::Succeeded);
        assert_eq!(*provider.filters.lock().unwrap(), ["news@ex.com"]);
    }

    #[tokio::test]
    async fn non_http_scheme_is_malformed() {
        let provider = Arc::new(RecordingProvider::default());
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::BodyLink {
                uri: Url::parse("ftp://ex.com/unsub").unwrap(),
            },
            0.9,
            "body-html",
        );
        let result = executor(provider).execute(&mechanism, &ctx(0.0)).await;
        assert_eq!(result.status, OutcomeStatus::Failed);
        assert_eq!(result.attempts, 1);
        assert!(result.error.unwrap().starts_with("malformed_uri"));
    }

    #[test]
    fn status_classification() {
        assert!(matches!(
            status_error(StatusCode::SERVICE_UNAVAILABLE),
            ExecutionError::ServerError { status: 503 }
        ));
        assert!(matches!(
            status_error(StatusCode::TOO_MANY_REQUESTS),
            ExecutionError::RateLimited
        ));
        assert!(matches!(
            status_error(StatusCode::NOT_FOUND),
            ExecutionError::ClientError { status: 404 }
        ));
    }

    /// Serves a body that never ends: 8 KiB of filler forever.
    async fn start_endless_body() -> Url {
        use axum::Router;
        use axum::body::{Body, Bytes};
        use axum::routing::get;

        let app = Router::new().route(
            "/unsub",
            get(|| async {
                let filler = Bytes::from(vec![b'x'; 8 * 1024]);
                let chunks = futures::stream::repeat(Ok::<_, std::convert::Infallible>(filler));
                Body::from_stream(chunks)
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });
        Url::parse(&format!("http://{addr}/unsub")).unwrap()
    }

    #[tokio::test]
    async fn endless_response_body_is_read_only_up_to_limit() {
        let uri = start_endless_body().await;
        let mechanism = UnsubscribeMechanism::new(MechanismKind::BodyLink { uri }, 0.9, "body-html");
        let result = executor(Arc::new(RecordingProvider::default()))
            .execute(&mechanism, &ctx(0.0))
            .await;

        assert_eq!(result.status, OutcomeStatus::Succeeded);
        assert_eq!(result.attempts, 1);
        assert_eq!(result.http_status, Some(200));
        assert!(!result.confirmed);
    }

    #[test]
    fn confirmation_phrases_are_case_insensitive() {
        let executor = executor(Arc::new(RecordingProvider::default()));
        assert!(executor.is_confirmation("<h1>You have been UNSUBSCRIBED</h1>"));
        assert!(!executor.is_confirmation("<h1>Manage preferences</h1>"));
    }
}
