//! Tool registry for the gateway.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::pipeline::Orchestrator;
use crate::tools::builtin::{
    GetOutcomeTool, ListSubscriptionsTool, ResetOutcomeTool, RunUnsubscribeTool, ScanMailboxTool,
    SearchMessagesTool,
};
use crate::tools::tool::{Tool, ToolDefinition, ToolDomain};

/// Registry of available tools.
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: RwLock::new(HashMap::new()),
        }
    }

    /// Register every engine tool against one orchestrator.
    pub fn with_unsubscribe_tools(orchestrator: Arc<Orchestrator>) -> Self {
        let registry = Self::new();
        registry.register_unsubscribe_tools(orchestrator);
        registry
    }

    pub fn register_unsubscribe_tools(&self, orchestrator: Arc<Orchestrator>) {
        self.register_sync(Arc::new(ScanMailboxTool::new(Arc::clone(&orchestrator))));
        self.register_sync(Arc::new(RunUnsubscribeTool::new(Arc::clone(&orchestrator))));
        self.register_sync(Arc::new(GetOutcomeTool::new(Arc::clone(&orchestrator))));
        self.register_sync(Arc::new(ResetOutcomeTool::new(Arc::clone(&orchestrator))));
        self.register_sync(Arc::new(ListSubscriptionsTool::new(Arc::clone(&orchestrator))));
        self.register_sync(Arc::new(SearchMessagesTool::new(orchestrator)));
    }

    pub async fn register(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        self.tools.write().await.insert(name.clone(), tool);
        tracing::debug!("Registered tool: {}", name);
    }

    /// Register a tool (sync version for startup).
    pub fn register_sync(&self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if let Ok(mut tools) = self.tools.try_write() {
            tools.insert(name.clone(), tool);
            tracing::debug!("Registered tool: {}", name);
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.read().await.get(name).cloned()
    }

    pub async fn has(&self, name: &str) -> bool {
        self.tools.read().await.contains_key(name)
    }

    /// All tool names, sorted.
    pub async fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn count(&self) -> usize {
        self.tools.try_read().map(|t| t.len()).unwrap_or(0)
    }

    /// Definitions of every tool, sorted by name.
    pub async fn tool_definitions(&self) -> Vec<ToolDefinition> {
        let mut defs: Vec<ToolDefinition> = self
            .tools
            .read()
            .await
            .values()
            .map(|tool| definition(tool.as_ref()))
            .collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Definitions filtered by domain.
    pub async fn tool_definitions_for_domain(&self, domain: ToolDomain) -> Vec<ToolDefinition> {
        self.tool_definitions()
            .await
            .into_iter()
            .filter(|def| def.domain == domain)
            .collect()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn definition(tool: &dyn Tool) -> ToolDefinition {
    ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
        domain: tool.domain(),
    }
}
