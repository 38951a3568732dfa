//! Configuration types.
//!
//! Every policy constant of the engine lives here with its default. The
//! confidence table and classifier weights are deliberately data, not code,
//! so they can be tuned without touching the pipeline.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Version tag of the default classifier signal table.
pub const SIGNAL_TABLE_VERSION: &str = "signals-v1";

/// Query used when the caller does not provide one.
pub const DEFAULT_QUERY: &str = "category:promotions OR category:updates";

// ── Classifier ──────────────────────────────────────────────────────

/// Weights and pattern lists for subscription scoring.
#[derive(Debug, Clone)]
pub struct ClassifierConfig {
    /// `is_subscription := score >= threshold`.
    pub threshold: f32,
    pub list_unsubscribe_weight: f32,
    /// Weight of each bulk-mail header signal.
    pub bulk_header_weight: f32,
    /// Upper bound for the sum of all bulk-header signals.
    pub bulk_header_cap: f32,
    pub bulk_sender_weight: f32,
    pub promotional_weight: f32,
    /// Regexes matched against the sender address.
    pub bulk_sender_patterns: Vec<String>,
    /// Regexes matched against subject and body text.
    pub promotional_patterns: Vec<String>,
    /// Header names that mark campaign/bulk tooling.
    pub campaign_headers: Vec<String>,
    pub version: String,
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            threshold: 0.5,
            list_unsubscribe_weight: 0.5,
            bulk_header_weight: 0.2,
            bulk_header_cap: 0.4,
            bulk_sender_weight: 0.2,
            promotional_weight: 0.1,
            bulk_sender_patterns: vec![
                r"(?i)@(marketing|newsletter|newsletters|promo|promotions|campaign|news|offers|deals)\.".into(),
                r"(?i)^(newsletter|news|marketing|promo|offers|deals|hello|info)@".into(),
                r"(?i)@.*\b(mailchimp|mcsv|sendgrid|mailgun|sparkpost|klaviyo|hubspot|constantcontact|exacttarget|mktomail|rsgsv|cmail\d*)\.".into(),
            ],
            promotional_patterns: vec![
                r"(?i)\b\d{1,2}\s?% off\b".into(),
                r"(?i)\b(sale|deal|deals|discount|coupon|promo code|limited time|free shipping|newsletter|special offer|last chance)\b".into(),
            ],
            campaign_headers: vec![
                "x-campaign-id".into(),
                "x-campaign".into(),
                "x-mailer-campaign".into(),
                "x-mailgun-tag".into(),
                "x-ses-outgoing".into(),
                "feedback-id".into(),
                "x-csa-complaints".into(),
            ],
            version: SIGNAL_TABLE_VERSION.into(),
        }
    }
}

impl ClassifierConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(threshold) = env_parse::<f32>("UNSUB_CLASSIFY_THRESHOLD")? {
            config.threshold = unit_interval("UNSUB_CLASSIFY_THRESHOLD", threshold)?;
        }
        Ok(config)
    }
}

// ── Extractor ───────────────────────────────────────────────────────

/// Confidence assigned to each mechanism kind.
#[derive(Debug, Clone, Copy)]
pub struct ConfidenceTable {
    pub one_click_post: f32,
    pub header_https: f32,
    pub header_http: f32,
    pub header_mailto: f32,
    pub body_link: f32,
    pub body_mailto: f32,
    /// Subtracted from body-sourced mechanisms when decoding was lossy.
    pub degraded_penalty: f32,
}

impl Default for ConfidenceTable {
    fn default() -> Self {
        Self {
            one_click_post: 0.95,
            header_https: 0.8,
            header_http: 0.7,
            header_mailto: 0.6,
            body_link: 0.4,
            body_mailto: 0.35,
            degraded_penalty: 0.1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExtractorConfig {
    pub confidence: ConfidenceTable,
    /// Case-insensitive anchor-text keywords that mark an unsubscribe link.
    pub lexicon: Vec<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            confidence: ConfidenceTable::default(),
            lexicon: [
                "unsubscribe",
                "opt out",
                "opt-out",
                "manage your subscription",
                "email preferences",
                "désabonner",
                "désinscrire",
                "darse de baja",
                "darte de baja",
                "cancelar suscripción",
                "desuscribirse",
                "abmelden",
                "abbestellen",
                "uitschrijven",
                "disiscriviti",
                "cancelar inscrição",
                "avregistrera",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ExtractorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(list) = std::env::var("UNSUB_LEXICON") {
            let lexicon: Vec<String> = list
                .split(',')
                .map(|s| s.trim().to_lowercase())
                .filter(|s| !s.is_empty())
                .collect();
            if lexicon.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: "UNSUB_LEXICON".into(),
                    message: "lexicon must contain at least one keyword".into(),
                });
            }
            config.lexicon = lexicon;
        }
        Ok(config)
    }
}

// ── Executor ────────────────────────────────────────────────────────

/// Retry table for transient failures.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Retries after the first attempt.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub factor: u32,
}

impl RetryPolicy {
    /// Total attempts including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }

    /// Delay before retry number `retry` (1-based): `base * factor^(retry-1)`.
    pub fn delay(&self, retry: u32) -> Duration {
        let exp = retry.saturating_sub(1);
        self.base_delay
            .saturating_mul(self.factor.saturating_pow(exp))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_secs(1),
            factor: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub http_timeout: Duration,
    pub max_redirects: usize,
    pub retry: RetryPolicy,
    pub user_agent: String,
    /// Phrases in a response body that confirm the unsubscribe.
    pub confirmation_phrases: Vec<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(10),
            max_redirects: 3,
            retry: RetryPolicy::default(),
            user_agent: format!("unsub-engine/{}", env!("CARGO_PKG_VERSION")),
            confirmation_phrases: [
                "unsubscribed",
                "successfully unsubscribed",
                "you have been unsubscribed",
                "has been removed",
                "have been removed",
                "opted out",
                "no longer receive",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
        }
    }
}

impl ExecutorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(secs) = env_parse::<u64>("UNSUB_HTTP_TIMEOUT_SECS")? {
            config.http_timeout = Duration::from_secs(secs);
        }
        if let Some(retries) = env_parse::<u32>("UNSUB_MAX_RETRIES")? {
            config.retry.max_retries = retries;
        }
        Ok(config)
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Messages processed in parallel.
    pub concurrency: usize,
    /// Budget for extraction through execution of one message.
    pub message_timeout: Duration,
    /// Page size requested from the provider.
    pub page_size: usize,
    /// Create a mailbox filter when no unsubscribe mechanism exists.
    pub filter_fallback: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            message_timeout: Duration::from_secs(30),
            page_size: 100,
            filter_fallback: false,
        }
    }
}

impl OrchestratorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(concurrency) = env_parse::<usize>("UNSUB_CONCURRENCY")? {
            if concurrency == 0 {
                return Err(ConfigError::InvalidValue {
                    key: "UNSUB_CONCURRENCY".into(),
                    message: "must be at least 1".into(),
                });
            }
            config.concurrency = concurrency;
        }
        if let Some(secs) = env_parse::<u64>("UNSUB_MESSAGE_TIMEOUT_SECS")? {
            config.message_timeout = Duration::from_secs(secs);
        }
        if let Some(enabled) = env_parse::<bool>("UNSUB_FILTER_FALLBACK")? {
            config.filter_fallback = enabled;
        }
        Ok(config)
    }
}

// ── Engine ──────────────────────────────────────────────────────────

/// Everything the binary needs to assemble the engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub classifier: ClassifierConfig,
    pub extractor: ExtractorConfig,
    pub executor: ExecutorConfig,
    pub orchestrator: OrchestratorConfig,
    pub db_path: PathBuf,
}

impl EngineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            classifier: ClassifierConfig::from_env()?,
            extractor: ExtractorConfig::from_env()?,
            executor: ExecutorConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            db_path: std::env::var("UNSUB_DB_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data/unsub-engine.db")),
        })
    }
}

/// Parse an optional env var. Unset → `None`; set but unparsable → error.
fn env_parse<T>(key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| ConfigError::InvalidValue {
                key: key.to_string(),
                message: format!("{raw:?}: {e}"),
            }),
        Err(_) => Ok(None),
    }
}

fn unit_interval(key: &str, value: f32) -> Result<f32, ConfigError> {
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("{value} is outside 0..=1"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_delays() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(3));
        assert_eq!(policy.delay(3), Duration::from_secs(9));
    }

    #[test]
    fn confidence_table_ordering() {
        let c = ConfidenceTable::default();
        assert!(c.one_click_post > c.header_https);
        assert!(c.header_https > c.header_http);
        assert!(c.header_http > c.header_mailto);
        assert!(c.header_mailto > c.body_link);
        assert!(c.body_link > c.body_mailto);
    }

    #[test]
    fn orchestrator_defaults() {
        let c = OrchestratorConfig::default();
        assert_eq!(c.concurrency, 5);
        assert_eq!(c.message_timeout, Duration::from_secs(30));
        assert!(!c.filter_fallback);
    }

    #[test]
    fn unit_interval_bounds() {
        assert!(unit_interval("k", 0.5).is_ok());
        assert!(unit_interval("k", 1.5).is_err());
        assert!(unit_interval("k", -0.1).is_err());
    }
}
