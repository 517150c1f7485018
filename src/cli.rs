use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "Client for threshold-signing node networks")]
#[command(version)]
pub(crate) struct Cli {
    #[arg(short, long, global = true, help = "Path to config.toml")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Handshake every node and print the resolved network config
    Handshake {
        #[arg(long = "url", help = "Node URL, overrides bootstrap_urls (repeatable)")]
        urls: Vec<String>,
    },
    /// Print the session key URI
    Session {
        #[arg(long, help = "Replace the session key and drop the stored capability")]
        rotate: bool,
    },
}
