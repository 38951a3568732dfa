//! Orchestrator: drives a batch through the pipeline.
//!
//! Per message: normalize → classify → extract → admit → execute → record.
//! Normalization, classification and extraction run up front in fetch order
//! so that in-run duplicates are resolved deterministically: per list
//! identity the message with the strongest mechanism is acted on, the
//! earliest one winning ties. The rest runs on a bounded worker pool with a
//! per-message timeout. A failure on one message is recorded against that
//! message only and never aborts the batch.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_QUERY, EngineConfig, OrchestratorConfig};
use crate::context::InvocationContext;
use crate::error::{Error, LedgerError, PipelineError};
use crate::message::{NormalizedMessage, RawMessage, normalize};
use crate::pipeline::executor::{ExecutionContext, Executor};
use crate::pipeline::extract::Extractor;
use crate::pipeline::rules::Classifier;
use crate::pipeline::types::{ClassificationResult, Extraction, MechanismKind, UnsubscribeMechanism};
use crate::provider::{MailboxProvider, fetch_messages};
use crate::store::traits::{Outcome, OutcomeLedger, OutcomeSeed, OutcomeStatus};

/// Confidence given to the mailbox-filter fallback. It only touches the
/// user's own mailbox, so it clears the default floor.
const FILTER_FALLBACK_CONFIDENCE: f32 = 0.5;

/// Default confidence floor for `run` requests.
pub const DEFAULT_CONFIDENCE_FLOOR: f32 = 0.5;

/// Default number of messages fetched per request.
pub const DEFAULT_MAX_MESSAGES: usize = 50;

// ── Requests and reports ────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRequest {
    /// Provider search query; `DEFAULT_QUERY` when absent.
    pub query: Option<String>,
    pub max_messages: usize,
    /// Classify and extract only; never admit, execute or commit.
    pub dry_run: bool,
    pub confidence_floor: f32,
    /// Re-admit keys that already ended `Succeeded` or `Failed`, and take
    /// over `Pending` keys another run left behind.
    pub force: bool,
}

impl Default for RunRequest {
    fn default() -> Self {
        Self {
            query: None,
            max_messages: DEFAULT_MAX_MESSAGES,
            dry_run: false,
            confidence_floor: DEFAULT_CONFIDENCE_FLOOR,
            force: false,
        }
    }
}

/// Per-message line of a run report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunEntry {
    pub message_id: String,
    /// `None` only for messages that could not be normalized.
    pub list_identity_key: Option<String>,
    pub mechanism_used: Option<UnsubscribeMechanism>,
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub dry_run: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusCounts {
    pub pending: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl StatusCounts {
    fn tally(entries: &[RunEntry]) -> Self {
        let mut counts = Self::default();
        for entry in entries {
            match entry.status {
                OutcomeStatus::Pending => counts.pending += 1,
                OutcomeStatus::Succeeded => counts.succeeded += 1,
                OutcomeStatus::Failed => counts.failed += 1,
                OutcomeStatus::Skipped => counts.skipped += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: Uuid,
    /// One entry per fetched message, in fetch order.
    pub entries: Vec<RunEntry>,
    pub counts: StatusCounts,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanSummary {
    pub scanned: usize,
    pub classified_subscription: usize,
    pub already_handled: usize,
    pub malformed: usize,
}

/// Subscription-classified messages grouped by sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionGroup {
    pub sender_address: String,
    pub sender_name: Option<String>,
    pub list_identity_key: String,
    pub message_count: usize,
    /// Up to three subjects, most recent first.
    pub example_subjects: Vec<String>,
    /// Distinct unsubscribe targets, best first.
    pub unsubscribe_targets: Vec<String>,
    pub ledger_status: Option<OutcomeStatus>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageSummary {
    pub id: String,
    pub sender: String,
    pub sender_name: Option<String>,
    pub subject: String,
    pub received_at: DateTime<Utc>,
    pub has_list_unsubscribe: bool,
    pub is_subscription: bool,
}

// ── Planning ────────────────────────────────────────────────────────

/// What to do with one fetched message, decided before any I/O.
enum Plan {
    Malformed {
        message_id: String,
        reason: String,
    },
    NotSubscription {
        msg: NormalizedMessage,
        classification: ClassificationResult,
    },
    DuplicateInRun {
        msg: NormalizedMessage,
    },
    Candidate {
        msg: NormalizedMessage,
        classification: ClassificationResult,
        extraction: Extraction,
    },
}

/// Per-run values shared by every worker.
struct RunScope<'a> {
    run_id: Uuid,
    /// A `Pending` record older than one message budget was abandoned.
    stale_pending_before: Option<DateTime<Utc>>,
    request: &'a RunRequest,
    ctx: &'a InvocationContext,
}

impl RunScope<'_> {
    fn seed(&self, msg: &NormalizedMessage, score: f32) -> OutcomeSeed {
        OutcomeSeed {
            list_identity_key: msg.list_identity_key(),
            message_id: msg.id.clone(),
            sender: msg.sender.address.clone(),
            classification_score: Some(score),
            run_id: Some(self.run_id),
            stale_pending_before: self.stale_pending_before,
        }
    }

    fn entry(
        &self,
        msg: &NormalizedMessage,
        mechanism: Option<UnsubscribeMechanism>,
        status: OutcomeStatus,
        error: Option<String>,
    ) -> RunEntry {
        RunEntry {
            message_id: msg.id.clone(),
            list_identity_key: Some(msg.list_identity_key()),
            mechanism_used: mechanism,
            status,
            error,
            dry_run: self.request.dry_run,
        }
    }
}

// ── Orchestrator ────────────────────────────────────────────────────

pub struct Orchestrator {
    provider: Arc<dyn MailboxProvider>,
    ledger: Arc<dyn OutcomeLedger>,
    classifier: Classifier,
    extractor: Extractor,
    executor: Executor,
    config: OrchestratorConfig,
}

impl Orchestrator {
    pub fn new(
        config: EngineConfig,
        provider: Arc<dyn MailboxProvider>,
        ledger: Arc<dyn OutcomeLedger>,
    ) -> Result<Self, Error> {
        let executor = Executor::new(config.executor, Arc::clone(&provider))?;
        Ok(Self {
            provider,
            ledger,
            classifier: Classifier::new(config.classifier),
            extractor: Extractor::new(config.extractor),
            executor,
            config: config.orchestrator,
        })
    }

    pub fn ledger(&self) -> &Arc<dyn OutcomeLedger> {
        &self.ledger
    }

    async fn fetch(
        &self,
        query: Option<&str>,
        max: usize,
    ) -> Result<Vec<RawMessage>, PipelineError> {
        let query = query.filter(|q| !q.trim().is_empty()).unwrap_or(DEFAULT_QUERY);
        fetch_messages(self.provider.as_ref(), query, max, self.config.page_size)
            .await
            .map_err(|e| {
                error!(provider = self.provider.name(), query, error = %e, "Mailbox fetch failed");
                PipelineError::Fetch(e)
            })
    }

    /// Count what a run would see without acting or writing.
    pub async fn scan(
        &self,
        query: Option<&str>,
        max: usize,
    ) -> Result<ScanSummary, PipelineError> {
        let raws = self.fetch(query, max).await?;
        let mut summary = ScanSummary {
            scanned: raws.len(),
            ..ScanSummary::default()
        };
        for raw in &raws {
            let msg = match normalize(raw) {
                Ok(msg) => msg,
                Err(e) => {
                    debug!(message_id = %raw.id, error = %e, "Skipping malformed message");
                    summary.malformed += 1;
                    continue;
                }
            };
            if !self.classifier.classify(&msg).is_subscription {
                continue;
            }
            summary.classified_subscription += 1;
            if let Some(outcome) = self.ledger.get(&msg.list_identity_key()).await?
                && !outcome.status.admits(false)
            {
                summary.already_handled += 1;
            }
        }
        info!(
            scanned = summary.scanned,
            subscriptions = summary.classified_subscription,
            already_handled = summary.already_handled,
            "Mailbox scan complete"
        );
        Ok(summary)
    }

    /// Run the full pipeline over one batch.
    ///
    /// Only a failed fetch is a batch-level error; every per-message problem
    /// ends up in that message's entry.
    pub async fn run(
        &self,
        request: &RunRequest,
        ctx: &InvocationContext,
    ) -> Result<RunReport, PipelineError> {
        let scope = RunScope {
            run_id: Uuid::new_v4(),
            stale_pending_before: chrono::Duration::from_std(self.config.message_timeout)
                .ok()
                .and_then(|budget| Utc::now().checked_sub_signed(budget)),
            request,
            ctx,
        };
        info!(
            run_id = %scope.run_id,
            invocation_id = %ctx.invocation_id,
            dry_run = request.dry_run,
            force = request.force,
            floor = request.confidence_floor,
            "Starting unsubscribe run"
        );

        let raws = self.fetch(request.query.as_deref(), request.max_messages).await?;
        let plans = self.plan(&raws);

        let entries: Vec<RunEntry> = futures::stream::iter(plans)
            .map(|plan| self.process(plan, &scope))
            .buffered(self.config.concurrency.max(1))
            .collect()
            .await;

        let counts = StatusCounts::tally(&entries);
        info!(
            run_id = %scope.run_id,
            total = entries.len(),
            succeeded = counts.succeeded,
            failed = counts.failed,
            skipped = counts.skipped,
            pending = counts.pending,
            "Unsubscribe run complete"
        );
        Ok(RunReport {
            run_id: scope.run_id,
            entries,
            counts,
        })
    }

    /// Group subscription messages by sender address.
    pub async fn subscriptions(
        &self,
        query: Option<&str>,
        max: usize,
    ) -> Result<Vec<SubscriptionGroup>, PipelineError> {
        let raws = self.fetch(query, max).await?;
        let mut groups: BTreeMap<String, (SubscriptionGroup, Vec<(DateTime<Utc>, String)>)> =
            BTreeMap::new();

        for raw in &raws {
            let Ok(msg) = normalize(raw) else {
                continue;
            };
            if !self.classifier.classify(&msg).is_subscription {
                continue;
            }
            let extraction = self.extractor.extract(&msg);
            let (group, subjects) = groups
                .entry(msg.sender.address.clone())
                .or_insert_with(|| {
                    (
                        SubscriptionGroup {
                            sender_address: msg.sender.address.clone(),
                            sender_name: msg.sender.display_name.clone(),
                            list_identity_key: msg.list_identity_key(),
                            message_count: 0,
                            example_subjects: Vec::new(),
                            unsubscribe_targets: Vec::new(),
                            ledger_status: None,
                        },
                        Vec::new(),
                    )
                });
            group.message_count += 1;
            if group.sender_name.is_none() {
                group.sender_name = msg.sender.display_name.clone();
            }
            subjects.push((msg.received_at, msg.subject.clone()));
            for mechanism in &extraction.mechanisms {
                let target = mechanism.kind.to_string();
                if !group.unsubscribe_targets.contains(&target) {
                    group.unsubscribe_targets.push(target);
                }
            }
        }

        let mut out = Vec::with_capacity(groups.len());
        for (_, (mut group, mut subjects)) in groups {
            subjects.sort_by(|a, b| b.0.cmp(&a.0));
            group.example_subjects = subjects
                .into_iter()
                .map(|(_, s)| s)
                .filter(|s| !s.is_empty())
                .take(3)
                .collect();
            group.ledger_status = self
                .ledger
                .get(&group.list_identity_key)
                .await?
                .map(|o| o.status);
            out.push(group);
        }
        // BTreeMap order breaks count ties by address.
        out.sort_by(|a, b| b.message_count.cmp(&a.message_count));
        Ok(out)
    }

    /// Metadata listing for an arbitrary query.
    pub async fn search(
        &self,
        query: Option<&str>,
        max: usize,
    ) -> Result<Vec<MessageSummary>, PipelineError> {
        let raws = self.fetch(query, max).await?;
        Ok(raws
            .iter()
            .filter_map(|raw| normalize(raw).ok())
            .map(|msg| MessageSummary {
                is_subscription: self.classifier.classify(&msg).is_subscription,
                has_list_unsubscribe: msg.has_header("list-unsubscribe"),
                id: msg.id,
                sender: msg.sender.address,
                sender_name: msg.sender.display_name,
                subject: msg.subject,
                received_at: msg.received_at,
            })
            .collect())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn plan(&self, raws: &[RawMessage]) -> Vec<Plan> {
        let mut plans: Vec<Plan> = Vec::with_capacity(raws.len());
        // key → (plan index, confidence of its best mechanism)
        let mut claimed: HashMap<String, (usize, Option<f32>)> = HashMap::new();

        for raw in raws {
            let msg = match normalize(raw) {
                Ok(msg) => msg,
                Err(e) => {
                    warn!(message_id = %raw.id, error = %e, "Malformed message skipped");
                    plans.push(Plan::Malformed {
                        message_id: raw.id.clone(),
                        reason: e.to_string(),
                    });
                    continue;
                }
            };
            let classification = self.classifier.classify(&msg);
            if !classification.is_subscription {
                plans.push(Plan::NotSubscription {
                    msg,
                    classification,
                });
                continue;
            }

            let extraction = self.extractor.extract(&msg);
            let strength = extraction.best().map(|m| m.confidence);
            let index = plans.len();
            claimed
                .entry(msg.list_identity_key())
                .and_modify(|held| {
                    if strength > held.1 {
                        *held = (index, strength);
                    }
                })
                .or_insert((index, strength));
            plans.push(Plan::Candidate {
                msg,
                classification,
                extraction,
            });
        }

        plans
            .into_iter()
            .enumerate()
            .map(|(index, plan)| match plan {
                Plan::Candidate { msg, .. }
                    if claimed
                        .get(&msg.list_identity_key())
                        .is_some_and(|held| held.0 != index) =>
                {
                    Plan::DuplicateInRun { msg }
                }
                plan => plan,
            })
            .collect()
    }

    async fn process(&self, plan: Plan, scope: &RunScope<'_>) -> RunEntry {
        match plan {
            Plan::Malformed { message_id, reason } => RunEntry {
                message_id,
                list_identity_key: None,
                mechanism_used: None,
                status: OutcomeStatus::Skipped,
                error: Some(format!("malformed message: {reason}")),
                dry_run: scope.request.dry_run,
            },
            Plan::NotSubscription {
                msg,
                classification,
            } => {
                let reason = format!("not a subscription (score {:.2})", classification.score);
                if !scope.request.dry_run {
                    let seed = scope.seed(&msg, classification.score);
                    if let Err(e) = self.ledger.record_skipped(&seed, &reason).await {
                        warn!(message_id = %msg.id, error = %e, "Failed to record skipped outcome");
                    }
                }
                scope.entry(&msg, None, OutcomeStatus::Skipped, Some(reason))
            }
            Plan::DuplicateInRun { msg } => scope.entry(
                &msg,
                None,
                OutcomeStatus::Skipped,
                Some("already handled in this run".into()),
            ),
            Plan::Candidate {
                msg,
                classification,
                extraction,
            } => {
                if scope.ctx.is_cancelled() {
                    let reason = Some("cancelled".into());
                    return scope.entry(&msg, None, OutcomeStatus::Skipped, reason);
                }
                let budget = self.config.message_timeout;
                let work = self.handle_candidate(&msg, &classification, extraction, scope);
                match tokio::time::timeout(budget, work).await {
                    Ok(entry) => entry,
                    Err(_) => self.handle_timeout(&msg, scope).await,
                }
            }
        }
    }

    async fn handle_candidate(
        &self,
        msg: &NormalizedMessage,
        classification: &ClassificationResult,
        extraction: Extraction,
        scope: &RunScope<'_>,
    ) -> RunEntry {
        let key = msg.list_identity_key();
        let seed = scope.seed(msg, classification.score);

        let mechanism = extraction.mechanisms.into_iter().next().or_else(|| {
            self.config.filter_fallback.then(|| {
                UnsubscribeMechanism::new(
                    MechanismKind::MailboxFilter {
                        sender_pattern: msg.sender.address.clone(),
                    },
                    FILTER_FALLBACK_CONFIDENCE,
                    "filter-fallback",
                )
            })
        });

        let Some(mechanism) = mechanism else {
            let reason = "no_mechanism: no unsubscribe mechanism found".to_string();
            if !scope.request.dry_run
                && let Err(e) = self.ledger.record_skipped(&seed, &reason).await
            {
                warn!(
                    message_id = %msg.id,
                    key = %key,
                    error = %e,
                    "Failed to record skipped outcome"
                );
            }
            return scope.entry(msg, None, OutcomeStatus::Skipped, Some(reason));
        };

        if scope.request.dry_run {
            return match self.ledger.get(&key).await {
                Ok(Some(existing)) if !existing.admits(&seed, scope.request.force) => scope.entry(
                    msg,
                    Some(mechanism),
                    OutcomeStatus::Skipped,
                    Some(already_handled(&existing)),
                ),
                Ok(_) => scope.entry(msg, Some(mechanism), OutcomeStatus::Pending, None),
                Err(e) => scope.entry(
                    msg,
                    Some(mechanism),
                    OutcomeStatus::Failed,
                    Some(format!("ledger: {e}")),
                ),
            };
        }

        // Re-check right before admission so a cancel stops new work promptly.
        if scope.ctx.is_cancelled() {
            return scope.entry(msg, None, OutcomeStatus::Skipped, Some("cancelled".into()));
        }

        let admission = match self.ledger.get_or_create_pending(&seed, scope.request.force).await {
            Ok(admission) => admission,
            Err(LedgerError::Conflict { .. }) => {
                debug!(message_id = %msg.id, key = %key, "Lost admission race");
                return scope.entry(
                    msg,
                    None,
                    OutcomeStatus::Skipped,
                    Some("already_handled: concurrent admission".into()),
                );
            }
            Err(e) => {
                error!(message_id = %msg.id, key = %key, error = %e, "Admission failed");
                return scope.entry(msg, None, OutcomeStatus::Failed, Some(format!("ledger: {e}")));
            }
        };
        if admission.already_exists {
            debug!(
                message_id = %msg.id,
                key = %key,
                sender = msg.sender.label(),
                status = %admission.outcome.status,
                "Key already handled"
            );
            return scope.entry(
                msg,
                None,
                OutcomeStatus::Skipped,
                Some(already_handled(&admission.outcome)),
            );
        }

        let exec_ctx = ExecutionContext {
            message_id: msg.id.clone(),
            key: key.clone(),
            confidence_floor: scope.request.confidence_floor,
        };
        let result = self.executor.execute(&mechanism, &exec_ctx).await;

        let mut outcome = admission.outcome;
        outcome.record_attempt(
            result.status,
            Some(mechanism.clone()),
            result.attempts,
            result.error.clone(),
        );
        if let Err(e) = self.ledger.commit(&key, &outcome).await {
            error!(message_id = %msg.id, key = %key, error = %e, "Failed to commit outcome");
            return scope.entry(
                msg,
                Some(mechanism),
                OutcomeStatus::Failed,
                Some(format!("ledger: {e}")),
            );
        }

        scope.entry(msg, Some(mechanism), result.status, result.error)
    }

    /// Mark the key `Failed(timeout)` if this run still owns a `Pending` record.
    async fn handle_timeout(&self, msg: &NormalizedMessage, scope: &RunScope<'_>) -> RunEntry {
        let key = msg.list_identity_key();
        let reason = format!(
            "timeout: message exceeded {}s budget",
            self.config.message_timeout.as_secs_f32()
        );
        warn!(message_id = %msg.id, key = %key, "Per-message timeout");

        if !scope.request.dry_run {
            match self.ledger.get(&key).await {
                Ok(Some(mut outcome))
                    if outcome.status == OutcomeStatus::Pending
                        && outcome.run_id == Some(scope.run_id) =>
                {
                    outcome.record_attempt(OutcomeStatus::Failed, None, 0, Some(reason.clone()));
                    if let Err(e) = self.ledger.commit(&key, &outcome).await {
                        error!(key = %key, error = %e, "Failed to record timeout");
                    }
                }
                Ok(_) => {}
                Err(e) => error!(key = %key, error = %e, "Failed to load outcome after timeout"),
            }
        }
        scope.entry(msg, None, OutcomeStatus::Failed, Some(reason))
    }
}

fn already_handled(outcome: &Outcome) -> String {
    format!("already_handled: outcome is {}", outcome.status)
}
