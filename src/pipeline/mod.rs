//! Unsubscribe pipeline.
//!
//! Every fetched message flows through:
//! 1. `normalize()`: raw bytes to the canonical message shape
//! 2. `Classifier::classify()`: weighted subscription signals (no network)
//! 3. `Extractor::extract()`: ranked unsubscribe mechanisms
//! 4. `OutcomeLedger::get_or_create_pending()`: at most one action per list
//! 5. `Executor::execute()`: one HTTP request or one mail, with retries
//!
//! `Orchestrator` wires the stages together and owns concurrency.

pub mod executor;
pub mod extract;
pub mod orchestrator;
pub mod rules;
pub mod types;

pub use executor::{ExecutionContext, Executor};
pub use extract::Extractor;
pub use orchestrator::{Orchestrator, RunEntry, RunReport, RunRequest, ScanSummary};
pub use rules::Classifier;
