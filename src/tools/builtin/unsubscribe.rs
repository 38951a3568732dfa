//! Unsubscribe tools: the operations the gateway exposes.
//!
//! Each tool is a thin adapter: parse and validate `params`, call the
//! orchestrator or ledger, serialize the result.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::context::InvocationContext;
use crate::pipeline::Orchestrator;
use crate::pipeline::orchestrator::{DEFAULT_CONFIDENCE_FLOOR, DEFAULT_MAX_MESSAGES, RunRequest};
use crate::tools::tool::{
    Tool, ToolDomain, ToolError, ToolOutput, optional_bool, optional_f64, optional_str,
    optional_u64, require_str,
};

/// Upper bound for `max_messages` on any single call.
const MAX_MESSAGES_LIMIT: u64 = 500;

fn query_and_max(params: &serde_json::Value) -> Result<(Option<&str>, usize), ToolError> {
    let query = optional_str(params, "query")?;
    let max = match optional_u64(params, "max_messages")? {
        None => DEFAULT_MAX_MESSAGES,
        Some(0) => {
            return Err(ToolError::InvalidParameters(
                "'max_messages' must be at least 1".into(),
            ));
        }
        Some(n) => n.min(MAX_MESSAGES_LIMIT) as usize,
    };
    Ok((query, max))
}

fn query_schema() -> serde_json::Value {
    json!({
        "query": {
            "type": "string",
            "description": "Mailbox search query (default: category:promotions OR category:updates)"
        },
        "max_messages": {
            "type": "integer",
            "minimum": 1,
            "maximum": MAX_MESSAGES_LIMIT,
            "description": "Maximum number of messages to fetch (default: 50)"
        }
    })
}

fn failed(e: impl std::fmt::Display) -> ToolError {
    ToolError::ExecutionFailed(e.to_string())
}

// ── scan_mailbox ────────────────────────────────────────────────────

pub struct ScanMailboxTool {
    orchestrator: Arc<Orchestrator>,
}

impl ScanMailboxTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for ScanMailboxTool {
    fn name(&self) -> &str {
        "scan_mailbox"
    }

    fn description(&self) -> &str {
        "Count messages matching a query, how many look like subscriptions, and how \
         many of those were already handled. Read-only."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": query_schema()
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let (query, max) = query_and_max(&params)?;
        let summary = self.orchestrator.scan(query, max).await.map_err(failed)?;
        ToolOutput::json(&summary, start.elapsed())
    }
}

// ── run_unsubscribe ─────────────────────────────────────────────────

pub struct RunUnsubscribeTool {
    orchestrator: Arc<Orchestrator>,
}

impl RunUnsubscribeTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for RunUnsubscribeTool {
    fn name(&self) -> &str {
        "run_unsubscribe"
    }

    fn description(&self) -> &str {
        "Unsubscribe from the mailing lists found by a query. Each list is acted on \
         at most once; lists already handled are skipped unless force is set. Use \
         dry_run to preview which mechanism would be used without acting."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        let mut properties = query_schema();
        if let Some(map) = properties.as_object_mut() {
            map.insert(
                "dry_run".into(),
                json!({"type": "boolean", "description": "Preview only; nothing is sent or recorded (default: false)"}),
            );
            map.insert(
                "confidence_floor".into(),
                json!({
                    "type": "number",
                    "minimum": 0.0,
                    "maximum": 1.0,
                    "description": "Mechanisms scored below this are skipped (default: 0.5)"
                }),
            );
            map.insert(
                "force".into(),
                json!({"type": "boolean", "description": "Retry lists that already succeeded or failed (default: false)"}),
            );
        }
        json!({
            "type": "object",
            "properties": properties
        })
    }

    fn domain(&self) -> ToolDomain {
        ToolDomain::Act
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let (query, max) = query_and_max(&params)?;
        let confidence_floor =
            optional_f64(&params, "confidence_floor")?.unwrap_or(DEFAULT_CONFIDENCE_FLOOR as f64);
        if !(0.0..=1.0).contains(&confidence_floor) {
            return Err(ToolError::InvalidParameters(format!(
                "'confidence_floor' must be within [0, 1], got {confidence_floor}"
            )));
        }
        let request = RunRequest {
            query: query.map(String::from),
            max_messages: max,
            dry_run: optional_bool(&params, "dry_run")?.unwrap_or(false),
            confidence_floor: confidence_floor as f32,
            force: optional_bool(&params, "force")?.unwrap_or(false),
        };
        let report = self.orchestrator.run(&request, ctx).await.map_err(failed)?;
        ToolOutput::json(&report, start.elapsed())
    }
}

// ── get_outcome ─────────────────────────────────────────────────────

pub struct GetOutcomeTool {
    orchestrator: Arc<Orchestrator>,
}

impl GetOutcomeTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for GetOutcomeTool {
    fn name(&self) -> &str {
        "get_outcome"
    }

    fn description(&self) -> &str {
        "Look up what was done for a mailing list, by its list identity key \
         (as reported by run_unsubscribe)."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "list_identity_key": {
                    "type": "string",
                    "description": "Key of the form sender-domain#list-id"
                }
            },
            "required": ["list_identity_key"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let key = require_str(&params, "list_identity_key")?;
        let outcome = self.orchestrator.ledger().get(key).await.map_err(failed)?;
        let result = match outcome {
            Some(outcome) => json!({
                "found": true,
                "outcome": serde_json::to_value(&outcome).map_err(failed)?,
            }),
            None => json!({ "found": false }),
        };
        Ok(ToolOutput::success(result, start.elapsed()))
    }
}

// ── reset_outcome ───────────────────────────────────────────────────

pub struct ResetOutcomeTool {
    orchestrator: Arc<Orchestrator>,
}

impl ResetOutcomeTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for ResetOutcomeTool {
    fn name(&self) -> &str {
        "reset_outcome"
    }

    fn description(&self) -> &str {
        "Forget the recorded outcome for a mailing list so the next run acts on it \
         again. Requires confirm: true."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": {
                "list_identity_key": {
                    "type": "string",
                    "description": "Key of the form sender-domain#list-id"
                },
                "confirm": {
                    "type": "boolean",
                    "description": "Must be true; the reset cannot be undone"
                }
            },
            "required": ["list_identity_key", "confirm"]
        })
    }

    fn domain(&self) -> ToolDomain {
        ToolDomain::Act
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let key = require_str(&params, "list_identity_key")?;
        if optional_bool(&params, "confirm")? != Some(true) {
            return Err(ToolError::NotAuthorized(format!(
                "reset of '{key}' requires confirm: true"
            )));
        }
        let reset = self.orchestrator.ledger().reset(key).await.map_err(failed)?;
        tracing::info!(key, reset, invocation_id = %ctx.invocation_id, "Outcome reset requested");
        Ok(ToolOutput::success(
            json!({ "list_identity_key": key, "reset": reset }),
            start.elapsed(),
        ))
    }
}

// ── list_subscriptions ──────────────────────────────────────────────

pub struct ListSubscriptionsTool {
    orchestrator: Arc<Orchestrator>,
}

impl ListSubscriptionsTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for ListSubscriptionsTool {
    fn name(&self) -> &str {
        "list_subscriptions"
    }

    fn description(&self) -> &str {
        "List the senders that look like subscriptions, grouped by address, with \
         message counts, example subjects, unsubscribe targets and current status."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": query_schema()
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        let (query, max) = query_and_max(&params)?;
        let groups = self
            .orchestrator
            .subscriptions(query, max)
            .await
            .map_err(failed)?;
        Ok(ToolOutput::success(
            json!({
                "count": groups.len(),
                "subscriptions": serde_json::to_value(&groups).map_err(failed)?,
            }),
            start.elapsed(),
        ))
    }
}

// ── search_messages ─────────────────────────────────────────────────

pub struct SearchMessagesTool {
    orchestrator: Arc<Orchestrator>,
}

impl SearchMessagesTool {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Tool for SearchMessagesTool {
    fn name(&self) -> &str {
        "search_messages"
    }

    fn description(&self) -> &str {
        "Search the mailbox and return message metadata (sender, subject, date) \
         plus whether each message looks like a subscription."
    }

    fn parameters_schema(&self) -> serde_json::Value {
        json!({
            "type": "object",
            "properties": query_schema(),
            "required": ["query"]
        })
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        _ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError> {
        let start = Instant::now();
        require_str(&params, "query")?;
        let (query, max) = query_and_max(&params)?;
        let messages = self.orchestrator.search(query, max).await.map_err(failed)?;
        Ok(ToolOutput::success(
            json!({
                "count": messages.len(),
                "messages": serde_json::to_value(&messages).map_err(failed)?,
            }),
            start.elapsed(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EngineConfig;
    use crate::error::MailboxError;
    use crate::message::RawMessage;
    use crate::provider::{Draft, MailboxProvider, MessagePage};
    use crate::store::{InMemoryLedger, OutcomeLedger, OutcomeSeed};

    struct StaticMailbox(Vec<RawMessage>);

    #[async_trait]
    impl MailboxProvider for StaticMailbox {
        fn name(&self) -> &str {
            "static"
        }

        async fn list_messages(
            &self,
            _query: &str,
            _page_token: Option<&str>,
            _page_size: usize,
        ) -> Result<MessagePage, MailboxError> {
            Ok(MessagePage {
                messages: self.0.clone(),
                next_page_token: None,
            })
        }

        async fn send_message(&self, _draft: &Draft) -> Result<String, MailboxError> {
            Ok("sent".into())
        }
    }

    fn orchestrator(messages: Vec<RawMessage>) -> (Arc<Orchestrator>, Arc<InMemoryLedger>) {
        let ledger = Arc::new(InMemoryLedger::new());
        let config = EngineConfig {
            classifier: Default::default(),
            extractor: Default::default(),
            executor: Default::default(),
            orchestrator: Default::default(),
            db_path: "unused.db".into(),
        };
        let orch = Orchestrator::new(
            config,
            Arc::new(StaticMailbox(messages)),
            Arc::clone(&ledger) as Arc<dyn OutcomeLedger>,
        )
        .unwrap();
        (Arc::new(orch), ledger)
    }

    fn seed(key: &str) -> OutcomeSeed {
        OutcomeSeed {
            list_identity_key: key.into(),
            message_id: "m1".into(),
            sender: "news@shop.example".into(),
            classification_score: Some(0.8),
            run_id: None,
            stale_pending_before: None,
        }
    }

    #[tokio::test]
    async fn get_outcome_not_found() {
        let (orch, _) = orchestrator(Vec::new());
        let tool = GetOutcomeTool::new(orch);
        let out = tool
            .execute(json!({"list_identity_key": "x#y"}), &InvocationContext::new())
            .await
            .unwrap();
        assert_eq!(out.result, json!({"found": false}));
    }

    #[tokio::test]
    async fn get_outcome_found() {
        let (orch, ledger) = orchestrator(Vec::new());
        ledger
            .record_skipped(&seed("shop.example#news"), "not a subscription")
            .await
            .unwrap();
        let tool = GetOutcomeTool::new(orch);
        let out = tool
            .execute(
                json!({"list_identity_key": "shop.example#news"}),
                &InvocationContext::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.result["found"], true);
        assert_eq!(out.result["outcome"]["status"], "skipped");
    }

    #[tokio::test]
    async fn reset_requires_confirmation() {
        let (orch, ledger) = orchestrator(Vec::new());
        ledger
            .record_skipped(&seed("shop.example#news"), "x")
            .await
            .unwrap();
        let tool = ResetOutcomeTool::new(orch);
        let ctx = InvocationContext::new();

        let err = tool
            .execute(json!({"list_identity_key": "shop.example#news"}), &ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotAuthorized(_)));
        assert!(ledger.get("shop.example#news").await.unwrap().is_some());

        let out = tool
            .execute(
                json!({"list_identity_key": "shop.example#news", "confirm": true}),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(out.result["reset"], true);
        assert!(ledger.get("shop.example#news").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn run_rejects_bad_floor_and_max() {
        let (orch, _) = orchestrator(Vec::new());
        let tool = RunUnsubscribeTool::new(orch);
        let ctx = InvocationContext::new();
        assert!(matches!(
            tool.execute(json!({"confidence_floor": 1.5}), &ctx).await,
            Err(ToolError::InvalidParameters(_))
        ));
        assert!(matches!(
            tool.execute(json!({"max_messages": 0}), &ctx).await,
            Err(ToolError::InvalidParameters(_))
        ));
        assert!(matches!(
            tool.execute(json!({"dry_run": "yes"}), &ctx).await,
            Err(ToolError::InvalidParameters(_))
        ));
    }

    #[tokio::test]
    async fn run_dry_run_reports_entries() {
        let raw = RawMessage::new(
            "m1",
            "From: news@shop.example\r\nSubject: Weekly deals\r\n\
             List-Unsubscribe: <mailto:leave@shop.example>\r\n\r\nHello\r\n",
        );
        let (orch, ledger) = orchestrator(vec![raw]);
        let tool = RunUnsubscribeTool::new(orch);
        let out = tool
            .execute(json!({"dry_run": true}), &InvocationContext::new())
            .await
            .unwrap();
        assert_eq!(out.result["entries"][0]["status"], "pending");
        assert_eq!(out.result["entries"][0]["dry_run"], true);
        assert_eq!(out.result["counts"]["pending"], 1);
        assert!(ledger.list(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn search_requires_query() {
        let (orch, _) = orchestrator(Vec::new());
        let tool = SearchMessagesTool::new(orch);
        assert!(matches!(
            tool.execute(json!({}), &InvocationContext::new()).await,
            Err(ToolError::InvalidParameters(_))
        ));
    }

    #[test]
    fn acting_tools_are_marked() {
        let (orch, _) = orchestrator(Vec::new());
        assert_eq!(RunUnsubscribeTool::new(Arc::clone(&orch)).domain(), ToolDomain::Act);
        assert_eq!(ResetOutcomeTool::new(Arc::clone(&orch)).domain(), ToolDomain::Act);
        assert_eq!(ScanMailboxTool::new(orch).domain(), ToolDomain::Inspect);
    }
}
