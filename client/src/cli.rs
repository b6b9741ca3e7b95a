use clap::{Parser, Subcommand};
use std::path::PathBuf;
use uuid::Uuid;

/// Command line interface for the courier client.
#[derive(Parser, Debug, Default)]
#[command(author, version, about)]
pub struct Cli {
    /// Base URL of the courier server.
    #[arg(long)]
    pub server: Option<String>,
    /// Bearer token identifying the sender.
    #[arg(long)]
    pub token: Option<String>,
    /// Location of the offline queue file.
    #[arg(long)]
    pub queue_file: Option<PathBuf>,
    /// Path to configuration file.
    #[arg(long)]
    pub config: Option<PathBuf>,
    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Send a message, queueing it if the server is unreachable.
    Send {
        #[arg(long)]
        conversation: Uuid,
        text: String,
    },
    /// Replay the offline backlog once.
    Flush,
    /// Show messages waiting in the offline queue.
    List,
}
