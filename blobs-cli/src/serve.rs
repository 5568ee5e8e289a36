//! `blobs serve`.

use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};
use blobs::{Relay, RelayConfig};
use clap::Args;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Args)]
pub struct ServeArgs {
    /// JSON config file. Flags override its values.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on.
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Token signing secret.
    #[arg(long, env = "BLOBS_SECRET", hide_env_values = true)]
    secret: Option<String>,

    /// Take the client IP from this header (e.g. x-forwarded-for).
    #[arg(long)]
    client_ip_header: Option<String>,

    /// Only accept requests from this origin. Repeatable.
    #[arg(long = "allow-origin")]
    allowed_origins: Vec<String>,

    /// More logging (-v debug, -vv trace). `RUST_LOG` takes precedence.
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl ServeArgs {
    pub async fn run(self) -> Result<()> {
        init_tracing(self.verbose);

        let mut config = match &self.config {
            Some(path) => RelayConfig::load(path)
                .with_context(|| format!("reading {}", path.display()))?,
            None => RelayConfig::default(),
        };
        if let Some(listen) = self.listen {
            config.listen = listen;
        }
        if let Some(secret) = self.secret {
            config.secret = secret;
        }
        if let Some(header) = self.client_ip_header {
            config.client_ip_header = Some(header);
        }
        if !self.allowed_origins.is_empty() {
            config.allowed_origins = self.allowed_origins;
        }

        let relay = Relay::new(config).context("invalid configuration")?;
        let listener = TcpListener::bind(relay.config().listen)
            .await
            .with_context(|| format!("binding {}", relay.config().listen))?;
        blobs::serve(relay, listener, shutdown()).await?;
        Ok(())
    }
}

fn init_tracing(verbose: u8) {
    let level = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("blobs={level},blobs_cli={level},warn")));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutting down");
    }
}
