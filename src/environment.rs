//! Local environment registry
//!
//! An environment maps a friendly name to a provider and the operator endpoint
//! of a cluster. Client tooling uses it to target commands at that cluster.
//! Records are stored as YAML in the CLI config directory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tracing::{debug, info};

use crate::cluster::ProviderType;
use crate::{Error, Result};

/// Reserved name of the local docker environment
pub const LOCAL_ENVIRONMENT: &str = "local";

/// Environment configured by `cluster up` unless overridden
pub const DEFAULT_ENVIRONMENT: &str = "gcp";

/// Named pointer at a cluster's operator
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub struct EnvironmentRecord {
    /// Environment name (the key)
    pub name: String,
    /// Provider the cluster runs on
    pub provider: ProviderType,
    /// Operator URL
    pub operator_endpoint: String,
}

impl EnvironmentRecord {
    /// Record for a GCP cluster
    pub fn gcp(name: impl Into<String>, operator_endpoint: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provider: ProviderType::Gcp,
            operator_endpoint: operator_endpoint.into(),
        }
    }
}

/// Keyed store of environment records
#[cfg_attr(test, automock)]
pub trait EnvironmentStore: Send + Sync {
    /// Record with the given name, if any
    fn get(&self, name: &str) -> Result<Option<EnvironmentRecord>>;

    /// Insert or replace the record with the same name
    fn put(&self, record: &EnvironmentRecord) -> Result<()>;
}

/// Asks the operator a yes/no question
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Confirm: Send + Sync {
    /// True if the operator agreed
    async fn confirm(&self, question: &str) -> Result<bool>;
}

#[derive(Debug, Default, Deserialize, Serialize)]
struct EnvironmentFile {
    #[serde(default)]
    environments: BTreeMap<String, StoredEnvironment>,
}

#[derive(Debug, Deserialize, Serialize)]
struct StoredEnvironment {
    provider: ProviderType,
    operator_endpoint: String,
}

/// Environment store backed by `environments.yaml`
pub struct FileEnvironmentStore {
    path: PathBuf,
}

impl FileEnvironmentStore {
    /// Store at the given file path
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn load(&self) -> Result<EnvironmentFile> {
        if !self.path.exists() {
            return Ok(EnvironmentFile::default());
        }
        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            Error::config(format!("failed to read {}: {}", self.path.display(), e))
        })?;
        if data.trim().is_empty() {
            return Ok(EnvironmentFile::default());
        }
        serde_yaml::from_str(&data)
            .map_err(|e| Error::config(format!("failed to parse {}: {}", self.path.display(), e)))
    }
}

impl EnvironmentStore for FileEnvironmentStore {
    fn get(&self, name: &str) -> Result<Option<EnvironmentRecord>> {
        let file = self.load()?;
        Ok(file.environments.get(name).map(|env| EnvironmentRecord {
            name: name.to_string(),
            provider: env.provider,
            operator_endpoint: env.operator_endpoint.clone(),
        }))
    }

    fn put(&self, record: &EnvironmentRecord) -> Result<()> {
        let mut file = self.load()?;
        file.environments.insert(
            record.name.clone(),
            StoredEnvironment {
                provider: record.provider,
                operator_endpoint: record.operator_endpoint.clone(),
            },
        );

        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        std::fs::write(&self.path, serde_yaml::to_string(&file)?).map_err(|e| {
            Error::config(format!("failed to write {}: {}", self.path.display(), e))
        })
    }
}

/// Confirmation read from the terminal
pub struct StdinConfirm;

#[async_trait]
impl Confirm for StdinConfirm {
    async fn confirm(&self, question: &str) -> Result<bool> {
        let mut stdout = tokio::io::stdout();
        stdout.write_all(format!("{} [y/N] ", question).as_bytes()).await?;
        stdout.flush().await?;

        let mut input = String::new();
        let mut reader = tokio::io::BufReader::new(tokio::io::stdin());
        reader.read_line(&mut input).await?;
        Ok(matches!(input.trim().to_lowercase().as_str(), "y" | "yes"))
    }
}

/// What [`EnvironmentRegistrar::upsert`] did
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// No record existed; one was written
    Created,
    /// A record with another endpoint was overwritten
    Updated,
    /// The record already pointed at this endpoint
    Unchanged,
    /// The operator refused to overwrite the existing record
    Declined,
}

impl UpsertOutcome {
    /// True if the store was written
    pub fn wrote(&self) -> bool {
        matches!(self, Self::Created | Self::Updated)
    }
}

/// Points a named environment at a cluster's operator endpoint
pub struct EnvironmentRegistrar {
    store: Arc<dyn EnvironmentStore>,
    confirm: Arc<dyn Confirm>,
    disallow_prompt: bool,
}

impl EnvironmentRegistrar {
    /// Create a registrar. With `disallow_prompt` conflicting records are
    /// overwritten without asking.
    pub fn new(store: Arc<dyn EnvironmentStore>, confirm: Arc<dyn Confirm>, disallow_prompt: bool) -> Self {
        Self {
            store,
            confirm,
            disallow_prompt,
        }
    }

    /// True if an environment with this name exists
    pub fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.store.get(name)?.is_some())
    }

    /// Write `name -> endpoint` unless it is already there.
    ///
    /// Never deletes records. Asks before replacing a different endpoint
    /// unless prompts are disallowed.
    pub async fn upsert(&self, name: &str, operator_endpoint: &str) -> Result<UpsertOutcome> {
        let outcome = match self.store.get(name)? {
            None => UpsertOutcome::Created,
            Some(existing) if existing.operator_endpoint == operator_endpoint => {
                debug!(environment = %name, "Environment already points at this cluster");
                return Ok(UpsertOutcome::Unchanged);
            }
            Some(_) if self.disallow_prompt => UpsertOutcome::Updated,
            Some(_) => {
                let question = format!(
                    "found an existing environment named \"{}\"; would you like to overwrite it to connect to this cluster?",
                    name
                );
                if !self.confirm.confirm(&question).await? {
                    info!(environment = %name, "Kept existing environment");
                    return Ok(UpsertOutcome::Declined);
                }
                UpsertOutcome::Updated
            }
        };

        self.store
            .put(&EnvironmentRecord::gcp(name, operator_endpoint))?;
        info!(environment = %name, endpoint = %operator_endpoint, ?outcome, "Configured environment");
        Ok(outcome)
    }
}
