//! `cluster up` - provision a GKE cluster and point an environment at it
//!
//! Usage: cortex-gcp cluster up --config cluster.yaml [--configure-env gcp] [--yes]

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use tracing::{info, warn};

use super::cancel_on_ctrl_c;
use crate::cache::ClusterConfigCache;
use crate::cloud::auth::GcpCredentials;
use crate::cloud::bootstrap::DEFAULT_MANAGER_IMAGE;
use crate::cloud::{DockerBootstrapExecutor, GcpClient};
use crate::config::{config_dir, environments_path, load_cluster_spec, UpConfig};
use crate::environment::{
    Confirm, EnvironmentRegistrar, FileEnvironmentStore, StdinConfirm, UpsertOutcome,
    DEFAULT_ENVIRONMENT,
};
use crate::provision::ProvisionOrchestrator;
use crate::{Error, Result};

/// Spin up a cluster
#[derive(Args, Debug)]
pub struct UpArgs {
    /// Path to the cluster configuration file
    #[arg(short = 'c', long = "config")]
    pub config: PathBuf,

    /// Name of the environment to configure
    #[arg(short = 'e', long = "configure-env", default_value = DEFAULT_ENVIRONMENT)]
    pub environment: String,

    /// Skip prompts
    #[arg(short = 'y', long = "yes")]
    pub yes: bool,

    /// Manager image that runs the install script
    #[arg(long, env = "CORTEX_MANAGER_IMAGE", default_value = DEFAULT_MANAGER_IMAGE)]
    pub image: String,
}

/// Run `cluster up`
pub async fn run(args: UpArgs) -> Result<()> {
    let config = UpConfig {
        spec: load_cluster_spec(&args.config)?,
        environment: args.environment,
        disallow_prompt: args.yes,
    };

    let dir = config_dir()?;
    let confirm: Arc<dyn Confirm> = Arc::new(StdinConfirm);
    let registrar = EnvironmentRegistrar::new(
        Arc::new(FileEnvironmentStore::new(environments_path(&dir))),
        confirm.clone(),
        config.disallow_prompt,
    );

    if registrar.exists(&config.environment)? {
        let message = format!(
            "found an existing environment named \"{}\", which will be overwritten to connect to this cluster once it's created",
            config.environment
        );
        if config.disallow_prompt {
            warn!("{}", message);
        } else if !confirm
            .confirm(&format!("{}; would you like to continue?", message))
            .await?
        {
            return Err(Error::validation("aborted; use --configure-env to pick another environment"));
        }
    }

    DockerBootstrapExecutor::check_prerequisites().await?;

    let credentials = GcpCredentials::from_env().await?;
    let mut bootstrap =
        DockerBootstrapExecutor::new(args.image).with_access_token(credentials.access_token.clone());
    if let Ok(path) = std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
        if !path.is_empty() {
            bootstrap = bootstrap.with_credentials_file(path);
        }
    }
    let client = GcpClient::new(credentials, &config.spec.project, &config.spec.zone);

    let orchestrator =
        ProvisionOrchestrator::new(Arc::new(client), Arc::new(bootstrap), registrar)
            .with_cache(ClusterConfigCache::new(&dir));

    match orchestrator.up(&config, &cancel_on_ctrl_c()).await {
        Ok(outcome) => {
            println!("Cluster {} is ready", outcome.cluster);
            println!("Operator endpoint: {}", outcome.operator_endpoint);
            match outcome.registration {
                UpsertOutcome::Created | UpsertOutcome::Updated => println!(
                    "Configured the {} environment to connect to this cluster",
                    outcome.environment
                ),
                UpsertOutcome::Unchanged => println!(
                    "The {} environment already connects to this cluster",
                    outcome.environment
                ),
                UpsertOutcome::Declined => println!(
                    "Kept the existing {} environment; the operator endpoint above is not configured",
                    outcome.environment
                ),
            }
            Ok(())
        }
        Err(failure) if failure.is_warning() => {
            warn!(error = %failure.cause, "Cluster is ready but the environment was not configured");
            if let Some(cluster) = &failure.cluster {
                println!("Cluster {} is ready", cluster);
            }
            match &failure.operator_endpoint {
                Some(endpoint) => {
                    println!("Operator endpoint: {}", endpoint);
                    info!(
                        "Configure the {} environment manually with the endpoint above",
                        config.environment
                    );
                }
                None => info!("Configure the environment manually with the operator endpoint"),
            }
            Ok(())
        }
        Err(failure) => {
            for step in failure.manual_cleanup() {
                eprintln!("{}", step);
            }
            for rollback in &failure.rollback_failures {
                eprintln!("rollback failed: {}", rollback);
            }
            Err(failure.cause)
        }
    }
}
