//! `cluster down` - delete a cluster and its bucket
//!
//! Usage: cortex-gcp cluster down (--config cluster.yaml | -n NAME -p PROJECT -z ZONE) [--yes]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;

use super::cancel_on_ctrl_c;
use crate::cache::ClusterConfigCache;
use crate::cloud::GcpClient;
use crate::config::{config_dir, DownConfig};
use crate::environment::{Confirm, StdinConfirm};
use crate::teardown::{ClusterDeletion, TeardownOrchestrator};
use crate::Result;

/// Spin down a cluster
#[derive(Args, Debug)]
pub struct DownArgs {
    /// Path to the cluster configuration file
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Cluster name
    #[arg(short = 'n', long = "name")]
    pub name: Option<String>,

    /// GCP project id
    #[arg(short = 'p', long = "project")]
    pub project: Option<String>,

    /// GCP zone
    #[arg(short = 'z', long = "zone")]
    pub zone: Option<String>,

    /// Skip confirmation prompt
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,
}

/// Run `cluster down`
pub async fn run(args: DownArgs) -> Result<()> {
    let config = DownConfig::resolve(
        args.name,
        args.project,
        args.zone,
        args.config.as_deref(),
        args.yes,
    )?;
    let cluster = config.cluster_id();

    if !config.disallow_prompt {
        let question = format!(
            "your cluster named \"{}\" in {} (zone: {}) will be spun down and all apis will be deleted, are you sure you want to continue?",
            cluster.name, cluster.project, cluster.zone
        );
        if !StdinConfirm.confirm(&question).await? {
            println!("Aborted");
            return Ok(());
        }
    }

    let client = GcpClient::from_env(&config.project, &config.zone).await?;
    let orchestrator =
        TeardownOrchestrator::new(Arc::new(client)).with_cache(ClusterConfigCache::new(config_dir()?));

    match orchestrator.down(&config, &cancel_on_ctrl_c()).await {
        Ok(report) => {
            if let Some(warning) = &report.bucket_warning {
                eprintln!(
                    "failed to delete bucket {}: {}; remove it via the GCP console",
                    report.bucket, warning
                );
            }
            match report.deletion {
                ClusterDeletion::Submitted => println!(
                    "Deletion of cluster {} was submitted; it may take a few minutes to finish",
                    report.cluster
                ),
                ClusterDeletion::AlreadyGone => {
                    println!("Cluster {} does not exist", report.cluster)
                }
            }
            Ok(())
        }
        Err(failure) => {
            if !failure.bucket_deleted {
                eprintln!("bucket {} was not deleted", failure.cluster.bucket());
            }
            Err(failure.cause)
        }
    }
}
