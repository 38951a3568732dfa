//! Built-in tools: one per engine operation.

pub mod unsubscribe;

pub use unsubscribe::{
    GetOutcomeTool, ListSubscriptionsTool, ResetOutcomeTool, RunUnsubscribeTool, ScanMailboxTool,
    SearchMessagesTool,
};
