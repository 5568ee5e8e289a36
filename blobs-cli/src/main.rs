//! CLI for the blobs peer-to-peer file relay.

#![allow(
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::missing_docs_in_private_items
)]

mod serve;
mod token;

use std::path::PathBuf;

use anyhow::Result;
use blobs::RelayConfig;
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Parser)]
#[command(name = "blobs", version, about = "Relay files between two browsers")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the relay.
    Serve(Box<serve::ServeArgs>),

    /// Issue or inspect capability tokens.
    Token {
        #[command(subcommand)]
        action: token::TokenAction,
    },

    /// Print the default configuration, or write it to a file.
    Config {
        /// Where to write it.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Generate shell completion scripts.
    #[command(hide = true)]
    Completion {
        /// Target shell.
        shell: Shell,
    },
}

#[tokio::main]
async fn main() {
    if let Err(e) = Cli::parse().dispatch().await {
        eprintln!("blobs: {e:#}");
        std::process::exit(1);
    }
}

impl Cli {
    async fn dispatch(self) -> Result<()> {
        match self.command {
            Command::Serve(args) => args.run().await,
            Command::Token { action } => action.run(),
            Command::Config { output } => config(output),
            Command::Completion { shell } => {
                clap_complete::generate(shell, &mut Self::command(), "blobs", &mut std::io::stdout());
                Ok(())
            }
        }
    }
}

fn config(output: Option<PathBuf>) -> Result<()> {
    let config = RelayConfig::default();
    match output {
        Some(path) => {
            config.save(&path)?;
            eprintln!("wrote {}", path.display());
        }
        None => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
