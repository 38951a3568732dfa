//! `OutcomeLedger` trait: the single admission-control point of the engine.
//!
//! Every backend must make `get_or_create_pending` atomic per key: a check
//! followed by a separate insert is not acceptable.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::pipeline::types::UnsubscribeMechanism;

/// Lifecycle state of an outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    /// Admitted; an action may be in flight.
    Pending,
    Succeeded,
    Failed,
    /// Not acted on (not a subscription, no mechanism, below floor, ...).
    Skipped,
}

impl OutcomeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Whether an existing record in this state may be turned into a fresh
    /// `Pending` admission. `Pending` records are judged per record, see
    /// `Outcome::admits`.
    pub fn admits(&self, force: bool) -> bool {
        match self {
            Self::Skipped => true,
            Self::Succeeded | Self::Failed => force,
            Self::Pending => false,
        }
    }
}

impl fmt::Display for OutcomeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutcomeStatus {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            "skipped" => Ok(Self::Skipped),
            other => Err(LedgerError::Serialization(format!(
                "unknown outcome status: {other}"
            ))),
        }
    }
}

/// The durable record for one list identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub list_identity_key: String,
    /// Message that most recently touched this record.
    pub message_id: String,
    pub sender: String,
    pub status: OutcomeStatus,
    pub mechanism_used: Option<UnsubscribeMechanism>,
    pub attempt_count: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub classification_score: Option<f32>,
    /// Run that admitted the record; used to attribute timeouts.
    pub run_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Outcome {
    /// A fresh record from a seed.
    pub fn from_seed(seed: &OutcomeSeed, status: OutcomeStatus) -> Self {
        let now = Utc::now();
        Self {
            list_identity_key: seed.list_identity_key.clone(),
            message_id: seed.message_id.clone(),
            sender: seed.sender.clone(),
            status,
            mechanism_used: None,
            attempt_count: 0,
            last_attempt_at: None,
            last_error: None,
            classification_score: seed.classification_score,
            run_id: seed.run_id,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether this record may be re-admitted for `seed`.
    ///
    /// Beyond `OutcomeStatus::admits`, a forced run may take over a `Pending`
    /// record another run abandoned (crash, failed commit, cancellation)
    /// once it is older than the seed's staleness cutoff.
    pub fn admits(&self, seed: &OutcomeSeed, force: bool) -> bool {
        match self.status {
            OutcomeStatus::Pending => {
                force
                    && self.run_id != seed.run_id
                    && seed
                        .stale_pending_before
                        .is_some_and(|cutoff| self.updated_at < cutoff)
            }
            status => status.admits(force),
        }
    }

    /// Fold an execution attempt into the record.
    pub fn record_attempt(
        &mut self,
        status: OutcomeStatus,
        mechanism: Option<UnsubscribeMechanism>,
        attempts: u32,
        error: Option<String>,
    ) {
        let now = Utc::now();
        self.status = status;
        if mechanism.is_some() {
            self.mechanism_used = mechanism;
        }
        if attempts > 0 {
            self.attempt_count += attempts;
            self.last_attempt_at = Some(now);
        }
        self.last_error = error;
        self.updated_at = now;
    }
}

/// What the orchestrator knows about a message when it asks for admission.
#[derive(Debug, Clone, PartialEq)]
pub struct OutcomeSeed {
    pub list_identity_key: String,
    pub message_id: String,
    pub sender: String,
    pub classification_score: Option<f32>,
    pub run_id: Option<Uuid>,
    /// `Pending` records last updated before this instant count as
    /// abandoned and may be taken over by a forced admission.
    pub stale_pending_before: Option<DateTime<Utc>>,
}

/// Result of `get_or_create_pending`.
#[derive(Debug, Clone)]
pub struct Admission {
    /// The record as stored after the call.
    pub outcome: Outcome,
    /// `true` when the caller must not act: another run owns the key or it
    /// already reached a terminal state.
    pub already_exists: bool,
}

/// Durable store of outcomes keyed by list identity.
#[async_trait]
pub trait OutcomeLedger: Send + Sync {
    /// Atomically admit the key for action.
    ///
    /// Absent or `Skipped` → inserted as `Pending`, admitted. `Pending` →
    /// not admitted, unless `force` and the record belongs to another run and
    /// predates `seed.stale_pending_before`. `Succeeded`/`Failed` → not
    /// admitted unless `force`. A re-admitted record keeps its attempt count.
    async fn get_or_create_pending(
        &self,
        seed: &OutcomeSeed,
        force: bool,
    ) -> Result<Admission, LedgerError>;

    /// Overwrite the record for `key` (insert if absent).
    async fn commit(&self, key: &str, outcome: &Outcome) -> Result<(), LedgerError>;

    async fn get(&self, key: &str) -> Result<Option<Outcome>, LedgerError>;

    /// Delete the record. Returns whether one existed.
    async fn reset(&self, key: &str) -> Result<bool, LedgerError>;

    /// Record that the key was seen but not acted on. Only inserts or
    /// refreshes `Skipped` records; any other state is left untouched and
    /// returned as-is.
    async fn record_skipped(
        &self,
        seed: &OutcomeSeed,
        reason: &str,
    ) -> Result<Outcome, LedgerError>;

    /// All records, optionally filtered by status, most recently updated first.
    async fn list(&self, status: Option<OutcomeStatus>) -> Result<Vec<Outcome>, LedgerError>;
}
