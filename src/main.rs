use std::sync::Arc;

use anyhow::Context;
use secrecy::ExposeSecret;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use inbox_flow::channels::{MailClient, Notifier, StoredMailClient, TelegramNotifier};
use inbox_flow::config::TriageConfig;
use inbox_flow::llm::{LlmConfig, create_anthropic_client};
use inbox_flow::retrieval::{ContextRetriever, HashingEmbedder, StoreIndex};
use inbox_flow::scoring::PriorityScorer;
use inbox_flow::server;
use inbox_flow::store::{Database, LibSqlBackend};
use inbox_flow::workflow::{NodeContext, WorkflowEngine};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = TriageConfig::from_env().context("Invalid configuration")?;

    // Keep the guard alive so buffered file logs are flushed on exit.
    let _log_guard = init_tracing(&config);

    eprintln!("📬 Inbox Flow v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", config.model);
    eprintln!("   HTTP: http://{}", config.server.bind_addr());

    // ── Database ─────────────────────────────────────────────────────
    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Collaborators ────────────────────────────────────────────────
    let llm = create_anthropic_client(&LlmConfig {
        api_key: config.anthropic_api_key.clone(),
        model: config.model.clone(),
    })
    .context("Failed to create LLM client")?;
    let notifier: Arc<dyn Notifier> = Arc::new(TelegramNotifier::new(
        config.telegram_bot_token.expose_secret().to_string(),
    ));
    let mail: Arc<dyn MailClient> = Arc::new(StoredMailClient::new(Arc::clone(&db)));
    let retriever = Arc::new(ContextRetriever::new(
        Arc::clone(&db),
        Arc::new(StoreIndex::new(Arc::clone(&db))),
        Arc::new(HashingEmbedder::default()),
        config.retrieval.clone(),
        config.retry.clone(),
    ));

    // ── Engine ───────────────────────────────────────────────────────
    let ctx = NodeContext::new(
        Arc::clone(&db),
        mail,
        llm,
        notifier,
        retriever,
        PriorityScorer::new(config.scoring.clone()),
        config.retry.clone(),
        config.default_categories.clone(),
        config.default_category.clone(),
        config.edit_ttl,
    );
    let engine = Arc::new(WorkflowEngine::new(ctx));

    let recovered = engine
        .recover_interrupted()
        .await
        .context("Crash recovery failed")?;
    if recovered > 0 {
        eprintln!("   Recovered {recovered} interrupted workflows");
    }
    eprintln!();

    server::serve(&config.server, engine)
        .await
        .context("HTTP server failed")?;
    Ok(())
}

fn init_tracing(config: &TriageConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_writer(std::io::stderr);

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-flow.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let file = tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer);
            tracing_subscriber::registry()
                .with(filter)
                .with(stderr)
                .with(file)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter).with(stderr).init();
            None
        }
    }
}
