//! libSQL backend: durable `OutcomeLedger` implementation.
//!
//! Supports local file and in-memory databases. Admission is a single
//! conditional upsert, so it stays atomic per key no matter how many workers
//! share the connection.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::store::migrations;
use crate::store::traits::{Admission, Outcome, OutcomeLedger, OutcomeSeed, OutcomeStatus};

const OUTCOME_COLUMNS: &str = "list_identity_key, message_id, sender, status, mechanism_used, \
     attempt_count, last_attempt_at, last_error, classification_score, run_id, created_at, updated_at";

/// libSQL outcome ledger.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlLedger {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlLedger {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                LedgerError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LedgerError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let ledger = Self::from_database(db)?;
        migrations::run_migrations(&ledger.conn).await?;
        info!(path = %path.display(), "Outcome ledger opened");
        Ok(ledger)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, LedgerError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| LedgerError::Pool(format!("Failed to create in-memory database: {e}")))?;

        let ledger = Self::from_database(db)?;
        migrations::run_migrations(&ledger.conn).await?;
        Ok(ledger)
    }

    fn from_database(db: LibSqlDatabase) -> Result<Self, LedgerError> {
        let conn = db
            .connect()
            .map_err(|e| LedgerError::Pool(format!("Failed to create connection: {e}")))?;
        Ok(Self {
            db: Arc::new(db),
            conn,
        })
    }

    async fn fetch_one(&self, key: &str, op: &str) -> Result<Option<Outcome>, LedgerError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {OUTCOME_COLUMNS} FROM outcomes WHERE list_identity_key = ?1"),
                params![key],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("{op}: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_outcome(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(LedgerError::Query(format!("{op}: {e}"))),
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_datetime(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| d.to_rfc3339())
}

/// Map a libsql Row to an Outcome. Column order matches `OUTCOME_COLUMNS`.
fn row_to_outcome(row: &libsql::Row) -> Result<Outcome, LedgerError> {
    let get_err = |e: libsql::Error| LedgerError::Query(format!("row parse: {e}"));

    let status: String = row.get(3).map_err(get_err)?;
    let mechanism_used = match row.get::<String>(4).ok() {
        Some(json) => Some(
            serde_json::from_str(&json)
                .map_err(|e| LedgerError::Serialization(format!("mechanism_used: {e}")))?,
        ),
        None => None,
    };
    let created: String = row.get(10).map_err(get_err)?;
    let updated: String = row.get(11).map_err(get_err)?;

    Ok(Outcome {
        list_identity_key: row.get(0).map_err(get_err)?,
        message_id: row.get(1).map_err(get_err)?,
        sender: row.get(2).map_err(get_err)?,
        status: status.parse()?,
        mechanism_used,
        attempt_count: row.get::<i64>(5).unwrap_or(0).max(0) as u32,
        last_attempt_at: row.get::<String>(6).ok().map(|s| parse_datetime(&s)),
        last_error: row.get::<String>(7).ok(),
        classification_score: row.get::<f64>(8).ok().map(|v| v as f32),
        run_id: row
            .get::<String>(9)
            .ok()
            .and_then(|s| Uuid::parse_str(&s).ok()),
        created_at: parse_datetime(&created),
        updated_at: parse_datetime(&updated),
    })
}

#[async_trait]
impl OutcomeLedger for LibSqlLedger {
    async fn get_or_create_pending(
        &self,
        seed: &OutcomeSeed,
        force: bool,
    ) -> Result<Admission, LedgerError> {
        let now = Utc::now().to_rfc3339();
        // The WHERE clause mirrors `Outcome::admits`.
        let mut rows = self
            .conn
            .query(
                &format!(
                    "INSERT INTO outcomes (list_identity_key, message_id, sender, status, \
                         attempt_count, classification_score, run_id, created_at, updated_at) \
                     VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?5, ?6, ?6) \
                     ON CONFLICT(list_identity_key) DO UPDATE SET \
                         message_id = excluded.message_id, \
                         sender = excluded.sender, \
                         status = 'pending', \
                         last_error = NULL, \
                         classification_score = excluded.classification_score, \
                         run_id = excluded.run_id, \
                         updated_at = excluded.updated_at \
                     WHERE outcomes.status = 'skipped' \
                        OR (?7 = 1 AND outcomes.status IN ('succeeded', 'failed')) \
                        OR (?7 = 1 AND outcomes.status = 'pending' \
                            AND outcomes.run_id IS NOT excluded.run_id \
                            AND ?8 IS NOT NULL \
                            AND julianday(outcomes.updated_at) < julianday(?8)) \
                     RETURNING {OUTCOME_COLUMNS}"
                ),
                params![
                    seed.list_identity_key.as_str(),
                    seed.message_id.as_str(),
                    seed.sender.as_str(),
                    seed.classification_score.map(f64::from),
                    seed.run_id.map(|id| id.to_string()),
                    now,
                    i64::from(force),
                    seed.stale_pending_before.map(|t| t.to_rfc3339())
                ],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("get_or_create_pending: {e}")))?;

        let admitted = match rows.next().await {
            Ok(Some(row)) => Some(row_to_outcome(&row)?),
            Ok(None) => None,
            Err(e) => return Err(LedgerError::Query(format!("get_or_create_pending: {e}"))),
        };
        drop(rows);

        if let Some(outcome) = admitted {
            debug!(key = %seed.list_identity_key, force, "Outcome admitted");
            return Ok(Admission {
                outcome,
                already_exists: false,
            });
        }

        // The upsert was a no-op, so a record exists that does not admit.
        // If it vanished in between (concurrent reset), report the conflict.
        match self.fetch_one(&seed.list_identity_key, "get_or_create_pending").await? {
            Some(outcome) => Ok(Admission {
                outcome,
                already_exists: true,
            }),
            None => Err(LedgerError::Conflict {
                key: seed.list_identity_key.clone(),
            }),
        }
    }

    async fn commit(&self, key: &str, outcome: &Outcome) -> Result<(), LedgerError> {
        let mechanism = outcome
            .mechanism_used
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| LedgerError::Serialization(format!("mechanism_used: {e}")))?;

        self.conn
            .execute(
                "INSERT INTO outcomes (list_identity_key, message_id, sender, status, mechanism_used, \
                     attempt_count, last_attempt_at, last_error, classification_score, run_id, \
                     created_at, updated_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12) \
                 ON CONFLICT(list_identity_key) DO UPDATE SET \
                     message_id = excluded.message_id, \
                     sender = excluded.sender, \
                     status = excluded.status, \
                     mechanism_used = excluded.mechanism_used, \
                     attempt_count = excluded.attempt_count, \
                     last_attempt_at = excluded.last_attempt_at, \
                     last_error = excluded.last_error, \
                     classification_score = excluded.classification_score, \
                     run_id = excluded.run_id, \
                     updated_at = excluded.updated_at",
                params![
                    key,
                    outcome.message_id.as_str(),
                    outcome.sender.as_str(),
                    outcome.status.as_str(),
                    mechanism,
                    i64::from(outcome.attempt_count),
                    opt_datetime(outcome.last_attempt_at),
                    outcome.last_error.clone(),
                    outcome.classification_score.map(f64::from),
                    outcome.run_id.map(|id| id.to_string()),
                    outcome.created_at.to_rfc3339(),
                    outcome.updated_at.to_rfc3339()
                ],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("commit: {e}")))?;

        debug!(
            key,
            status = %outcome.status,
            attempts = outcome.attempt_count,
            "Outcome committed"
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Outcome>, LedgerError> {
        self.fetch_one(key, "get").await
    }

    async fn reset(&self, key: &str) -> Result<bool, LedgerError> {
        let deleted = self
            .conn
            .execute(
                "DELETE FROM outcomes WHERE list_identity_key = ?1",
                params![key],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("reset: {e}")))?;
        Ok(deleted > 0)
    }

    async fn record_skipped(
        &self,
        seed: &OutcomeSeed,
        reason: &str,
    ) -> Result<Outcome, LedgerError> {
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO outcomes (list_identity_key, message_id, sender, status, \
                     attempt_count, last_error, classification_score, run_id, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'skipped', 0, ?4, ?5, ?6, ?7, ?7) \
                 ON CONFLICT(list_identity_key) DO UPDATE SET \
                     message_id = excluded.message_id, \
                     sender = excluded.sender, \
                     last_error = excluded.last_error, \
                     classification_score = excluded.classification_score, \
                     updated_at = excluded.updated_at \
                 WHERE outcomes.status = 'skipped'",
                params![
                    seed.list_identity_key.as_str(),
                    seed.message_id.as_str(),
                    seed.sender.as_str(),
                    reason,
                    seed.classification_score.map(f64::from),
                    seed.run_id.map(|id| id.to_string()),
                    now
                ],
            )
            .await
            .map_err(|e| LedgerError::Query(format!("record_skipped: {e}")))?;

        self.fetch_one(&seed.list_identity_key, "record_skipped")
            .await?
            .ok_or_else(|| LedgerError::Conflict {
                key: seed.list_identity_key.clone(),
            })
    }

    async fn list(&self, status: Option<OutcomeStatus>) -> Result<Vec<Outcome>, LedgerError> {
        let mut rows = match status {
            Some(status) => {
                self.conn
                    .query(
                        &format!(
                            "SELECT {OUTCOME_COLUMNS} FROM outcomes WHERE status = ?1 \
                             ORDER BY updated_at DESC"
                        ),
                        params![status.as_str()],
                    )
                    .await
            }
            None => {
                self.conn
                    .query(
                        &format!("SELECT {OUTCOME_COLUMNS} FROM outcomes ORDER BY updated_at DESC"),
                        (),
                    )
                    .await
            }
        }
        .map_err(|e| LedgerError::Query(format!("list: {e}")))?;

        let mut outcomes = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| LedgerError::Query(format!("list: {e}")))?
        {
            outcomes.push(row_to_outcome(&row)?);
        }
        Ok(outcomes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::{MechanismKind, UnsubscribeMechanism};

    fn seed(key: &str, message_id: &str) -> OutcomeSeed {
        OutcomeSeed {
            list_identity_key: key.into(),
            message_id: message_id.into(),
            sender: "news@ex.com".into(),
            classification_score: Some(0.75),
            run_id: Some(Uuid::new_v4()),
            stale_pending_before: None,
        }
    }

    #[tokio::test]
    async fn force_takes_over_stale_pending_from_other_run() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let crashed = seed("k", "m1");
        ledger.get_or_create_pending(&crashed, false).await.unwrap();

        let mut next = seed("k", "m2");
        assert!(ledger.get_or_create_pending(&next, true).await.unwrap().already_exists);

        next.stale_pending_before = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(ledger.get_or_create_pending(&next, true).await.unwrap().already_exists);

        next.stale_pending_before = Some(Utc::now() + chrono::Duration::seconds(1));
        assert!(ledger.get_or_create_pending(&next, false).await.unwrap().already_exists);

        let mut same_run = next.clone();
        same_run.run_id = crashed.run_id;
        assert!(ledger.get_or_create_pending(&same_run, true).await.unwrap().already_exists);

        let taken = ledger.get_or_create_pending(&next, true).await.unwrap();
        assert!(!taken.already_exists);
        assert_eq!(taken.outcome.status, OutcomeStatus::Pending);
        assert_eq!(taken.outcome.message_id, "m2");
        assert_eq!(taken.outcome.run_id, next.run_id);
    }

    #[tokio::test]
    async fn admit_then_duplicate() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let first = ledger.get_or_create_pending(&seed("k", "m1"), false).await.unwrap();
        assert!(!first.already_exists);
        assert_eq!(first.outcome.status, OutcomeStatus::Pending);
        assert_eq!(first.outcome.classification_score, Some(0.75));

        let second = ledger.get_or_create_pending(&seed("k", "m2"), false).await.unwrap();
        assert!(second.already_exists);
        assert_eq!(second.outcome.message_id, "m1");
    }

    #[tokio::test]
    async fn concurrent_admission_admits_exactly_one() {
        let ledger = Arc::new(LibSqlLedger::new_memory().await.unwrap());
        let mut handles = Vec::new();
        for i in 0..8 {
            let ledger = Arc::clone(&ledger);
            handles.push(tokio::spawn(async move {
                ledger
                    .get_or_create_pending(&seed("k", &format!("m{i}")), false)
                    .await
                    .unwrap()
                    .already_exists
            }));
        }
        let mut admitted = 0;
        for handle in handles {
            if !handle.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 1);
    }

    #[tokio::test]
    async fn commit_round_trips_mechanism() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let mut outcome = ledger
            .get_or_create_pending(&seed("k", "m1"), false)
            .await
            .unwrap()
            .outcome;
        let mechanism = UnsubscribeMechanism::new(
            MechanismKind::HeaderOneClickPost {
                uri: url::Url::parse("https://ex.com/u").unwrap(),
            },
            0.95,
            "list-unsubscribe",
        );
        outcome.record_attempt(
            OutcomeStatus::Failed,
            Some(mechanism.clone()),
            3,
            Some("server_error: server returned HTTP 503".into()),
        );
        ledger.commit("k", &outcome).await.unwrap();

        let stored = ledger.get("k").await.unwrap().unwrap();
        assert_eq!(stored.status, OutcomeStatus::Failed);
        assert_eq!(stored.attempt_count, 3);
        assert_eq!(stored.mechanism_used, Some(mechanism));
        assert!(stored.last_error.unwrap().starts_with("server_error"));
        assert!(stored.last_attempt_at.is_some());
        assert_eq!(stored.run_id, outcome.run_id);
    }

    #[tokio::test]
    async fn force_readmits_terminal_keeping_attempts() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let mut outcome = ledger
            .get_or_create_pending(&seed("k", "m1"), false)
            .await
            .unwrap()
            .outcome;
        outcome.record_attempt(OutcomeStatus::Failed, None, 2, Some("client_error: 404".into()));
        ledger.commit("k", &outcome).await.unwrap();

        let again = ledger.get_or_create_pending(&seed("k", "m2"), false).await.unwrap();
        assert!(again.already_exists);

        let forced = ledger.get_or_create_pending(&seed("k", "m2"), true).await.unwrap();
        assert!(!forced.already_exists);
        assert_eq!(forced.outcome.status, OutcomeStatus::Pending);
        assert_eq!(forced.outcome.attempt_count, 2);
        assert!(forced.outcome.last_error.is_none());
        assert_eq!(forced.outcome.message_id, "m2");
    }

    #[tokio::test]
    async fn record_skipped_only_touches_skipped() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        let skipped = ledger.record_skipped(&seed("a", "m1"), "not a subscription").await.unwrap();
        assert_eq!(skipped.status, OutcomeStatus::Skipped);
        assert_eq!(skipped.last_error.as_deref(), Some("not a subscription"));

        let refreshed = ledger.record_skipped(&seed("a", "m2"), "no mechanism").await.unwrap();
        assert_eq!(refreshed.message_id, "m2");
        assert_eq!(refreshed.last_error.as_deref(), Some("no mechanism"));

        ledger.get_or_create_pending(&seed("b", "m3"), false).await.unwrap();
        let untouched = ledger.record_skipped(&seed("b", "m4"), "dup").await.unwrap();
        assert_eq!(untouched.status, OutcomeStatus::Pending);
        assert_eq!(untouched.message_id, "m3");

        let admitted = ledger.get_or_create_pending(&seed("a", "m5"), false).await.unwrap();
        assert!(!admitted.already_exists);
    }

    #[tokio::test]
    async fn list_filters_and_reset_deletes() {
        let ledger = LibSqlLedger::new_memory().await.unwrap();
        ledger.get_or_create_pending(&seed("a", "m1"), false).await.unwrap();
        ledger.record_skipped(&seed("b", "m2"), "skip").await.unwrap();

        assert_eq!(ledger.list(None).await.unwrap().len(), 2);
        let pending = ledger.list(Some(OutcomeStatus::Pending)).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].list_identity_key, "a");

        assert!(ledger.reset("a").await.unwrap());
        assert!(!ledger.reset("a").await.unwrap());
        assert!(ledger.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn file_backed_ledger_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("ledger.db");
        {
            let ledger = LibSqlLedger::new_local(&path).await.unwrap();
            let mut outcome = ledger
                .get_or_create_pending(&seed("k", "m1"), false)
                .await
                .unwrap()
                .outcome;
            outcome.record_attempt(OutcomeStatus::Succeeded, None, 1, None);
            ledger.commit("k", &outcome).await.unwrap();
        }
        let reopened = LibSqlLedger::new_local(&path).await.unwrap();
        let stored = reopened.get("k").await.unwrap().unwrap();
        assert_eq!(stored.status, OutcomeStatus::Succeeded);
        assert!(reopened
            .get_or_create_pending(&seed("k", "m2"), false)
            .await
            .unwrap()
            .already_exists);
    }
}
