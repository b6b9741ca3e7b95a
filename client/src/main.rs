use anyhow::{Context, Result};
use clap::Parser;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use courier_client::{
    cli::{Cli, Command},
    config::ClientConfig,
    HttpTransport, OfflineQueue, QueueStore, SendAttempt,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let cfg = ClientConfig::load(&cli)?;
    tracing::debug!(config = ?cfg, "client configuration");

    let token = cfg.token.clone().unwrap_or_default();
    let transport = Arc::new(HttpTransport::new(cfg.server.clone(), token)?);
    let queue = OfflineQueue::open(QueueStore::new(&cfg.queue_file), transport, cfg.queue).await?;

    match cli.command.unwrap_or(Command::List) {
        Command::Send { conversation, text } => {
            if cfg.token.is_none() {
                tracing::warn!("no token configured (set --token or COURIER_TOKEN)");
            }
            match queue.send_or_enqueue(conversation, &text).await? {
                SendAttempt::Sent(resp) => {
                    println!("sent {} at {}", resp.message_id, resp.server_timestamp)
                }
                SendAttempt::Queued(entry) => println!("queued {}", entry.client_temp_id),
                SendAttempt::Rejected(e) => anyhow::bail!("rejected: {e}"),
            }
        }
        Command::Flush => {
            let report = queue.drain().await.context("drain failed")?;
            println!(
                "sent {}, expired {}, rejected {}, remaining {}",
                report.sent, report.expired, report.rejected, report.remaining
            );
        }
        Command::List => {
            for entry in queue.pending().await {
                println!(
                    "{:<36} {:<36} {:>14} {}",
                    entry.client_temp_id, entry.conversation_id, entry.created_at, entry.text
                );
            }
        }
    }
    Ok(())
}
