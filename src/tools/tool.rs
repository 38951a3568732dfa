//! Tool trait and shared parameter helpers.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

use crate::context::InvocationContext;

/// Errors a tool can return to the gateway.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Execution failed: {0}")]
    ExecutionFailed(String),

    #[error("Not authorized: {0}")]
    NotAuthorized(String),

    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

impl ToolError {
    /// Stable error code for wire responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidParameters(_) => "invalid_parameters",
            Self::ExecutionFailed(_) => "execution_failed",
            Self::NotAuthorized(_) => "not_authorized",
            Self::NotFound(_) => "not_found",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Successful tool result.
#[derive(Debug, Clone)]
pub struct ToolOutput {
    pub result: serde_json::Value,
    pub duration: Duration,
}

impl ToolOutput {
    pub fn success(result: serde_json::Value, duration: Duration) -> Self {
        Self { result, duration }
    }

    pub fn text(text: impl Into<String>, duration: Duration) -> Self {
        Self {
            result: serde_json::Value::String(text.into()),
            duration,
        }
    }

    /// Serialize any report type into a result.
    pub fn json<T: Serialize>(value: &T, duration: Duration) -> Result<Self, ToolError> {
        let result = serde_json::to_value(value)
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to serialize result: {e}")))?;
        Ok(Self { result, duration })
    }
}

/// Whether a tool only reads or also changes mailbox/ledger state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolDomain {
    Inspect,
    Act,
}

/// Tool definition as advertised to callers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
    pub domain: ToolDomain,
}

/// A named operation callable through the gateway.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema of the `params` object.
    fn parameters_schema(&self) -> serde_json::Value;

    fn domain(&self) -> ToolDomain {
        ToolDomain::Inspect
    }

    async fn execute(
        &self,
        params: serde_json::Value,
        ctx: &InvocationContext,
    ) -> Result<ToolOutput, ToolError>;
}

/// Required string parameter.
pub fn require_str<'a>(params: &'a serde_json::Value, key: &str) -> Result<&'a str, ToolError> {
    params
        .get(key)
        .and_then(|v| v.as_str())
        .ok_or_else(|| ToolError::InvalidParameters(format!("missing required string '{key}'")))
}

/// Optional string parameter; wrong types are rejected rather than ignored.
pub fn optional_str<'a>(
    params: &'a serde_json::Value,
    key: &str,
) -> Result<Option<&'a str>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidParameters(format!("'{key}' must be a string"))),
    }
}

pub fn optional_bool(params: &serde_json::Value, key: &str) -> Result<Option<bool>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_bool()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidParameters(format!("'{key}' must be a boolean"))),
    }
}

pub fn optional_u64(params: &serde_json::Value, key: &str) -> Result<Option<u64>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or_else(|| {
            ToolError::InvalidParameters(format!("'{key}' must be a non-negative integer"))
        }),
    }
}

pub fn optional_f64(params: &serde_json::Value, key: &str) -> Result<Option<f64>, ToolError> {
    match params.get(key) {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(Some)
            .ok_or_else(|| ToolError::InvalidParameters(format!("'{key}' must be a number"))),
    }
}
