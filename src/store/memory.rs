//! In-memory `OutcomeLedger` for tests and dry runs.
//!
//! One `tokio::sync::Mutex` guards the whole map, so every operation is a
//! single critical section.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::store::traits::{Admission, Outcome, OutcomeLedger, OutcomeSeed, OutcomeStatus};

#[derive(Default)]
pub struct InMemoryLedger {
    outcomes: Mutex<HashMap<String, Outcome>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeLedger for InMemoryLedger {
    async fn get_or_create_pending(
        &self,
        seed: &OutcomeSeed,
        force: bool,
    ) -> Result<Admission, LedgerError> {
        let mut outcomes = self.outcomes.lock().await;
        match outcomes.get_mut(&seed.list_identity_key) {
            Some(existing) if existing.admits(seed, force) => {
                existing.message_id = seed.message_id.clone();
                existing.sender = seed.sender.clone();
                existing.status = OutcomeStatus::Pending;
                existing.last_error = None;
                existing.classification_score = seed.classification_score;
                existing.run_id = seed.run_id;
                existing.updated_at = Utc::now();
                Ok(Admission {
                    outcome: existing.clone(),
                    already_exists: false,
                })
            }
            Some(existing) => Ok(Admission {
                outcome: existing.clone(),
                already_exists: true,
            }),
            None => {
                let outcome = Outcome::from_seed(seed, OutcomeStatus::Pending);
                outcomes.insert(seed.list_identity_key.clone(), outcome.clone());
                Ok(Admission {
                    outcome,
                    already_exists: false,
                })
            }
        }
    }

    async fn commit(&self, key: &str, outcome: &Outcome) -> Result<(), LedgerError> {
        let mut outcomes = self.outcomes.lock().await;
        let mut stored = outcome.clone();
        stored.list_identity_key = key.to_string();
        if let Some(previous) = outcomes.get(key) {
            stored.created_at = previous.created_at;
        }
        outcomes.insert(key.to_string(), stored);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Outcome>, LedgerError> {
        Ok(self.outcomes.lock().await.get(key).cloned())
    }

    async fn reset(&self, key: &str) -> Result<bool, LedgerError> {
        Ok(self.outcomes.lock().await.remove(key).is_some())
    }

    async fn record_skipped(
        &self,
        seed: &OutcomeSeed,
        reason: &str,
    ) -> Result<Outcome, LedgerError> {
        let mut outcomes = self.outcomes.lock().await;
        let outcome = outcomes
            .entry(seed.list_identity_key.clone())
            .and_modify(|existing| {
                if existing.status == OutcomeStatus::Skipped {
                    existing.message_id = seed.message_id.clone();
                    existing.sender = seed.sender.clone();
                    existing.classification_score = seed.classification_score;
                    existing.last_error = Some(reason.to_string());
                    existing.updated_at = Utc::now();
                }
            })
            .or_insert_with(|| {
                let mut outcome = Outcome::from_seed(seed, OutcomeStatus::Skipped);
                outcome.last_error = Some(reason.to_string());
                outcome
            });
        Ok(outcome.clone())
    }

    async fn list(&self, status: Option<OutcomeStatus>) -> Result<Vec<Outcome>, LedgerError> {
        let outcomes = self.outcomes.lock().await;
        let mut list: Vec<Outcome> = outcomes
            .values()
            .filter(|o| status.is_none_or(|s| o.status == s))
            .cloned()
            .collect();
        list.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(list)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn seed(key: &str, message_id: &str) -> OutcomeSeed {
        OutcomeSeed {
            list_identity_key: key.into(),
            message_id: message_id.into(),
            sender: "news@ex.com".into(),
            classification_score: Some(0.9),
            run_id: None,
            stale_pending_before: None,
        }
    }

    #[tokio::test]
    async fn first_admission_wins() {
        let ledger = InMemoryLedger::new();
        let first = ledger.get_or_create_pending(&seed("k", "m1"), false).await.unwrap();
        assert!(!first.already_exists);
        assert_eq!(first.outcome.status, OutcomeStatus::Pending);

        let second = ledger.get_or_create_pending(&seed("k", "m2"), false).await.unwrap();
        assert!(second.already_exists);
        assert_eq!(second.outcome.message_id, "m1");
    }

    #[tokio::test]
    async fn concurrent_admission_admits_exactly_one() {
        let ledger = Arc::new(InMemoryLedger::new());
        let mut handles = Vec::new();
        for i in 0..16 {
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
    async fn terminal_records_need_force() {
        let ledger = InMemoryLedger::new();
        let mut outcome = ledger
            .get_or_create_pending(&seed("k", "m1"), false)
            .await
            .unwrap()
            .outcome;
        outcome.record_attempt(OutcomeStatus::Succeeded, None, 1, None);
        ledger.commit("k", &outcome).await.unwrap();

        let again = ledger.get_or_create_pending(&seed("k", "m2"), false).await.unwrap();
        assert!(again.already_exists);

        let forced = ledger.get_or_create_pending(&seed("k", "m2"), true).await.unwrap();
        assert!(!forced.already_exists);
        assert_eq!(forced.outcome.status, OutcomeStatus::Pending);
        assert_eq!(forced.outcome.attempt_count, 1);
    }

    #[tokio::test]
    async fn force_never_readmits_pending() {
        let ledger = InMemoryLedger::new();
        ledger.get_or_create_pending(&seed("k", "m1"), false).await.unwrap();
        assert!(ledger.get_or_create_pending(&seed("k", "m2"), true).await.unwrap().already_exists);
    }

    #[tokio::test]
    async fn force_takes_over_stale_pending_from_other_run() {
        let ledger = InMemoryLedger::new();
        let mut crashed = seed("k", "m1");
        crashed.run_id = Some(uuid::Uuid::new_v4());
        ledger.get_or_create_pending(&crashed, false).await.unwrap();

        let mut next = seed("k", "m2");
        next.run_id = Some(uuid::Uuid::new_v4());
        next.stale_pending_before = Some(Utc::now() - chrono::Duration::minutes(1));
        assert!(ledger.get_or_create_pending(&next, true).await.unwrap().already_exists);

        next.stale_pending_before = Some(Utc::now() + chrono::Duration::seconds(1));
        assert!(ledger.get_or_create_pending(&next, false).await.unwrap().already_exists);
        let taken = ledger.get_or_create_pending(&next, true).await.unwrap();
        assert!(!taken.already_exists);
        assert_eq!(taken.outcome.message_id, "m2");
        assert_eq!(taken.outcome.run_id, next.run_id);
    }

    #[tokio::test]
    async fn skipped_is_readmitted() {
        let ledger = InMemoryLedger::new();
        ledger.record_skipped(&seed("k", "m1"), "no mechanism").await.unwrap();
        let admission = ledger.get_or_create_pending(&seed("k", "m2"), false).await.unwrap();
        assert!(!admission.already_exists);
        assert!(admission.outcome.last_error.is_none());
    }

    #[tokio::test]
    async fn record_skipped_never_clobbers() {
        let ledger = InMemoryLedger::new();
        ledger.get_or_create_pending(&seed("k", "m1"), false).await.unwrap();
        let outcome = ledger.record_skipped(&seed("k", "m2"), "dup").await.unwrap();
        assert_eq!(outcome.status, OutcomeStatus::Pending);
        assert_eq!(outcome.message_id, "m1");
    }

    #[tokio::test]
    async fn reset_and_list() {
        let ledger = InMemoryLedger::new();
        ledger.get_or_create_pending(&seed("a", "m1"), false).await.unwrap();
        ledger.record_skipped(&seed("b", "m2"), "not a subscription").await.unwrap();

        assert_eq!(ledger.list(None).await.unwrap().len(), 2);
        let skipped = ledger.list(Some(OutcomeStatus::Skipped)).await.unwrap();
        assert_eq!(skipped.len(), 1);
        assert_eq!(skipped[0].list_identity_key, "b");

        assert!(ledger.reset("a").await.unwrap());
        assert!(!ledger.reset("a").await.unwrap());
        assert!(ledger.get("a").await.unwrap().is_none());
    }
}
