use std::sync::Arc;

use anyhow::Context;

use unsub_engine::config::EngineConfig;
use unsub_engine::gateway;
use unsub_engine::pipeline::Orchestrator;
use unsub_engine::provider::GmailProvider;
use unsub_engine::provider::gmail::GmailConfig;
use unsub_engine::store::{LibSqlLedger, OutcomeLedger};
use unsub_engine::tools::ToolRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // stdout carries the gateway protocol; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let config = EngineConfig::from_env().context("Invalid engine configuration")?;

    eprintln!("📭 unsub-engine v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Ledger: {}", config.db_path.display());
    eprintln!(
        "   Concurrency: {} (timeout {}s per message)",
        config.orchestrator.concurrency,
        config.orchestrator.message_timeout.as_secs()
    );

    // ── Ledger ──────────────────────────────────────────────────────────
    let ledger: Arc<dyn OutcomeLedger> = Arc::new(
        LibSqlLedger::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open ledger at {}", config.db_path.display()))?,
    );

    // ── Mailbox ─────────────────────────────────────────────────────────
    let gmail_config = GmailConfig::from_env()?;
    let provider = Arc::new(GmailProvider::new(gmail_config)?);

    // ── Engine + tools ──────────────────────────────────────────────────
    let orchestrator = Arc::new(Orchestrator::new(config, provider, ledger)?);
    let tools = Arc::new(ToolRegistry::with_unsubscribe_tools(orchestrator));
    eprintln!("   Tools: {} registered", tools.count());
    eprintln!("   Reading JSON requests from stdin.\n");

    gateway::serve(tools, tokio::io::stdin(), tokio::io::stdout())
        .await
        .context("Gateway I/O failed")?;

    tracing::info!("Input closed, shutting down");
    Ok(())
}
