//! dash binary: webhook server plus the timer scheduler.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;

use dash::agent::{Dispatcher, Scheduler};
use dash::channels::webhook::{WebhookServer, WebhookServerConfig, twilio_routes};
use dash::channels::{Notifier, TwilioNotifier};
use dash::config::Config;
use dash::db::{Database, Store};
use dash::llm::{Llm, OpenAiLlm};

#[derive(Parser, Debug)]
#[command(name = "dash", about = "WhatsApp productivity copilot", version)]
struct Cli {
    /// Path to a .env file to load before reading configuration.
    #[arg(long)]
    env_file: Option<PathBuf>,

    /// Run migrations and exit without serving.
    #[arg(long)]
    migrate_only: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match &cli.env_file {
        Some(path) => {
            dotenvy::from_path(path)
                .with_context(|| format!("failed to load env file {}", path.display()))?;
        }
        None => {
            let _ = dotenvy::dotenv();
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env().context("configuration error")?;

    Store::run_migrations(&config.database)
        .await
        .context("database migration failed")?;
    if cli.migrate_only {
        tracing::info!("migrations complete");
        return Ok(());
    }

    let store = Store::new(&config.database)
        .await
        .context("database connection failed")?;
    let db: Arc<dyn Database> = Arc::new(store);
    let notifier: Arc<dyn Notifier> = Arc::new(TwilioNotifier::new(config.twilio.clone()));
    let llm: Arc<dyn Llm> = Arc::new(OpenAiLlm::new(config.openai.clone()));

    let dispatcher = Arc::new(Dispatcher::new(
        db.clone(),
        llm.clone(),
        notifier.clone(),
        config.cycles,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler = Scheduler::new(db.clone(), notifier.clone(), config.scheduler.clone());
    let scheduler_handle = scheduler.spawn(shutdown_rx);

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port)
        .parse()
        .context("invalid HOST/PORT")?;
    let mut server = WebhookServer::new(WebhookServerConfig { addr });
    server.add_routes(twilio_routes(dispatcher));
    server
        .start()
        .await
        .map_err(|e| anyhow::anyhow!("webhook server failed to start: {}", e))?;

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutting down");

    let _ = shutdown_tx.send(true);
    let _ = scheduler_handle.await;
    server.shutdown().await;

    Ok(())
}
