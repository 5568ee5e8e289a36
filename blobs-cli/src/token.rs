//! `blobs token`.

use anyhow::{Result, bail};
use blobs::Signer;
use blobs_proto::PeerId;
use clap::Subcommand;

/// Subcommands for `blobs token`.
#[derive(Subcommand)]
pub enum TokenAction {
    /// Sign a token for a peer slot.
    Issue {
        /// Signing secret.
        #[arg(long, env = "BLOBS_SECRET", hide_env_values = true)]
        secret: String,
        /// Peer slot: 1 (creator) or 2 (joiner).
        #[arg(long)]
        peer: PeerId,
        /// Tunnel id.
        #[arg(long)]
        tunnel: String,
        /// Client IP to bind the token to.
        #[arg(long)]
        ip: String,
    },
    /// Check a token's signature and print what it grants.
    Verify {
        /// Signing secret.
        #[arg(long, env = "BLOBS_SECRET", hide_env_values = true)]
        secret: String,
        /// Token to check.
        token: String,
    },
}

impl TokenAction {
    pub fn run(self) -> Result<()> {
        match self {
            Self::Issue {
                secret,
                peer,
                tunnel,
                ip,
            } => {
                if tunnel.contains('|') || ip.contains('|') {
                    bail!("tunnel id and ip must not contain '|'");
                }
                println!("{}", Signer::new(secret).sign(peer, &tunnel, &ip));
            }
            Self::Verify { secret, token } => {
                let grant = Signer::new(secret).verify(&token)?;
                println!("peer:   {}", grant.peer);
                println!("tunnel: {}", grant.tunnel_id);
                println!("ip:     {}", grant.ip);
            }
        }
        Ok(())
    }
}
