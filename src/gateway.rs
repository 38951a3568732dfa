//! JSON-lines tool gateway.
//!
//! One request per input line:
//!
//! ```text
//! {"id": 1, "tool": "run_unsubscribe", "params": {"dry_run": true}}
//! ```
//!
//! One response per request, in completion order:
//!
//! ```text
//! {"id": 1, "ok": true, "result": {...}}
//! {"id": 2, "ok": false, "error": {"code": "invalid_parameters", "message": "..."}}
//! ```
//!
//! Two gateway-level tools exist besides the registry: `list_tools` returns
//! every tool definition, and `cancel` (`{"id": <request id>}`) cancels an
//! in-flight request.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, mpsc};
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use crate::context::InvocationContext;
use crate::tools::{ToolError, ToolRegistry};

#[derive(Debug, Deserialize)]
pub struct GatewayRequest {
    #[serde(default)]
    pub id: serde_json::Value,
    pub tool: String,
    #[serde(default)]
    pub params: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewayResponse {
    pub id: serde_json::Value,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<GatewayError>,
}

impl GatewayResponse {
    fn success(id: serde_json::Value, result: serde_json::Value) -> Self {
        Self {
            id,
            ok: true,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: serde_json::Value, code: &str, message: impl Into<String>) -> Self {
        Self {
            id,
            ok: false,
            result: None,
            error: Some(GatewayError {
                code: code.into(),
                message: message.into(),
            }),
        }
    }

    fn from_tool_error(id: serde_json::Value, e: &ToolError) -> Self {
        Self::failure(id, e.code(), e.to_string())
    }
}

type InFlight = Arc<Mutex<HashMap<String, InvocationContext>>>;

/// Serve requests from `reader` until EOF, writing responses to `writer`.
///
/// Requests run concurrently; in-flight requests are awaited before return.
pub async fn serve<R, W>(
    registry: Arc<ToolRegistry>,
    reader: R,
    mut writer: W,
) -> std::io::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<GatewayResponse>();

    let writer_task = tokio::spawn(async move {
        while let Some(response) = rx.recv().await {
            let mut line = match serde_json::to_string(&response) {
                Ok(line) => line,
                Err(e) => {
                    error!(error = %e, "Failed to serialize gateway response");
                    continue;
                }
            };
            line.push('\n');
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok::<_, std::io::Error>(())
    });

    let in_flight: InFlight = Arc::new(Mutex::new(HashMap::new()));
    let mut tasks = JoinSet::new();
    let mut lines = BufReader::new(reader).lines();

    while let Some(line) = lines.next_line().await? {
        reap_finished(&mut tasks);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let request: GatewayRequest = match serde_json::from_str(line) {
            Ok(request) => request,
            Err(e) => {
                warn!(error = %e, "Rejected malformed gateway request");
                let _ = tx.send(GatewayResponse::failure(
                    serde_json::Value::Null,
                    "invalid_request",
                    format!("Invalid request: {e}"),
                ));
                continue;
            }
        };

        let registry = Arc::clone(&registry);
        let in_flight = Arc::clone(&in_flight);
        let tx = tx.clone();
        tasks.spawn(async move {
            let response = dispatch(&registry, &in_flight, request).await;
            let _ = tx.send(response);
        });
    }

    debug!(pending = tasks.len(), "Gateway input closed, draining");
    while let Some(joined) = tasks.join_next().await {
        log_join(joined);
    }
    drop(tx);

    match writer_task.await {
        Ok(result) => result,
        Err(e) => Err(std::io::Error::other(e)),
    }
}

/// Drop request tasks that already completed. Returns how many were reaped.
fn reap_finished(tasks: &mut JoinSet<()>) -> usize {
    let mut reaped = 0;
    while let Some(joined) = tasks.try_join_next() {
        log_join(joined);
        reaped += 1;
    }
    reaped
}

fn log_join(joined: Result<(), JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Gateway request task failed");
    }
}

async fn dispatch(
    registry: &ToolRegistry,
    in_flight: &InFlight,
    request: GatewayRequest,
) -> GatewayResponse {
    let GatewayRequest { id, tool, params } = request;
    match tool.as_str() {
        "list_tools" => match serde_json::to_value(registry.tool_definitions().await) {
            Ok(defs) => GatewayResponse::success(id, json!({ "tools": defs })),
            Err(e) => GatewayResponse::failure(id, "execution_failed", e.to_string()),
        },
        "cancel" => {
            let Some(target) = params.get("id").filter(|v| !v.is_null()) else {
                return GatewayResponse::from_tool_error(
                    id,
                    &ToolError::InvalidParameters("missing required 'id'".into()),
                );
            };
            let cancelled = match in_flight.lock().await.get(&target.to_string()) {
                Some(ctx) => {
                    ctx.cancel();
                    true
                }
                None => false,
            };
            info!(request = %target, cancelled, "Cancel requested");
            GatewayResponse::success(id, json!({ "cancelled": cancelled }))
        }
        name => {
            let Some(tool) = registry.get(name).await else {
                return GatewayResponse::from_tool_error(id, &ToolError::NotFound(name.into()));
            };
            let ctx = InvocationContext::with_request_id(id.to_string());
            let key = id.to_string();
            if !id.is_null() {
                in_flight.lock().await.insert(key.clone(), ctx.clone());
            }

            info!(
                tool = name,
                request_id = %key,
                invocation_id = %ctx.invocation_id,
                "Tool invoked"
            );
            let result = tool.execute(params, &ctx).await;

            if !id.is_null() {
                in_flight.lock().await.remove(&key);
            }
            match result {
                Ok(output) => {
                    debug!(
                        tool = name,
                        duration_ms = output.duration.as_millis() as u64,
                        "Tool finished"
                    );
                    GatewayResponse::success(id, output.result)
                }
                Err(e) => {
                    warn!(tool = name, error = %e, "Tool failed");
                    GatewayResponse::from_tool_error(id, &e)
                }
            }
        }
    }
}
