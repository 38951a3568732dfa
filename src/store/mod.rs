//! Outcome ledger: durable record of what was done for each list identity.

pub mod libsql_backend;
pub mod memory;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlLedger;
pub use memory::InMemoryLedger;
pub use traits::{Admission, Outcome, OutcomeLedger, OutcomeSeed, OutcomeStatus};
