//! CLI commands

use clap::Subcommand;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::Result;

pub mod down;
pub mod up;

/// `cluster` subcommands
#[derive(Subcommand, Debug)]
pub enum ClusterCommands {
    /// Spin up a cluster on GCP
    Up(up::UpArgs),
    /// Spin down a cluster on GCP
    Down(down::DownArgs),
}

impl ClusterCommands {
    /// Run the subcommand
    pub async fn run(self) -> Result<()> {
        match self {
            Self::Up(args) => up::run(args).await,
            Self::Down(args) => down::run(args).await,
        }
    }
}

/// Token cancelled on the first Ctrl-C
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}
