//! cortex-gcp - provisioning and teardown of Cortex clusters on GKE
//!
//! `cluster up` creates a Cloud Storage bucket and a GKE cluster, waits for
//! the cluster to run, bootstraps it with the Cortex install script and points
//! a named local environment at the operator. Failures partway through are
//! compensated: the bucket is rolled back, the cluster is kept for inspection.
//! `cluster down` deletes both, tolerating a missing bucket or cluster.
//!
//! # Modules
//!
//! - [`cluster`] - Cluster spec, identity, bucket naming and phases
//! - [`cloud`] - Provider traits and their GCP implementations
//! - [`poll`] - Cancellable polling and the cluster status poller
//! - [`compensation`] - Rollback stack
//! - [`provision`] - The up state machine
//! - [`teardown`] - The down sequence
//! - [`environment`] - Local environment registry
//! - [`cache`] - Cached cluster configs
//! - [`config`] - Per-command settings and the CLI config directory
//! - [`commands`] - CLI subcommands
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cache;
pub mod cloud;
pub mod cluster;
pub mod commands;
pub mod compensation;
pub mod config;
pub mod environment;
pub mod error;
pub mod poll;
pub mod provision;
pub mod teardown;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

use clap::{Parser, Subcommand};

/// Cortex cluster management on Google Cloud
#[derive(Parser, Debug)]
#[command(name = "cortex-gcp")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Top-level commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Manage clusters
    #[command(subcommand)]
    Cluster(commands::ClusterCommands),
}

impl Cli {
    /// Run the CLI command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Cluster(command) => command.run().await,
        }
    }
}
