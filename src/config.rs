//! CLI configuration
//!
//! Persistent state lives in the CLI config directory:
//! - `environments.yaml`: environment records
//! - `cluster_gcp_<name>_<project>_<zone>.yaml`: cached cluster configs
//!
//! The directory is `$CORTEX_CLI_CONFIG_DIR` when set, else `~/.cortex/`.
//! Per-command settings are passed explicitly as [`UpConfig`] and
//! [`DownConfig`].

use std::path::{Path, PathBuf};

use crate::cluster::{ClusterId, ClusterSpec};
use crate::environment::DEFAULT_ENVIRONMENT;
use crate::{Error, Result};

const CONFIG_DIR_NAME: &str = ".cortex";
const CONFIG_DIR_ENV: &str = "CORTEX_CLI_CONFIG_DIR";
const ENVIRONMENTS_FILE_NAME: &str = "environments.yaml";

/// Settings for one `cluster up`
#[derive(Clone, Debug)]
pub struct UpConfig {
    /// Cluster to provision
    pub spec: ClusterSpec,
    /// Environment to point at the new cluster
    pub environment: String,
    /// Never prompt; overwrite conflicting environments
    pub disallow_prompt: bool,
}

impl UpConfig {
    /// Config targeting the default environment with prompts enabled
    pub fn new(spec: ClusterSpec) -> Self {
        Self {
            spec,
            environment: DEFAULT_ENVIRONMENT.to_string(),
            disallow_prompt: false,
        }
    }
}

/// Settings for one `cluster down`
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DownConfig {
    /// Cluster name
    pub cluster_name: String,
    /// GCP project id
    pub project: String,
    /// GCP zone
    pub zone: String,
    /// Never prompt
    pub disallow_prompt: bool,
}

impl DownConfig {
    /// Identity of the cluster to remove
    pub fn cluster_id(&self) -> ClusterId {
        ClusterId::new(&self.project, &self.zone, &self.cluster_name)
    }

    /// Resolve from explicit flags, falling back to a config file for any
    /// flag that was not given
    pub fn resolve(
        name: Option<String>,
        project: Option<String>,
        zone: Option<String>,
        config_file: Option<&Path>,
        disallow_prompt: bool,
    ) -> Result<Self> {
        let from_file = config_file.map(load_cluster_spec).transpose()?;

        let pick = |flag: Option<String>, file: Option<&String>, what: &str| {
            flag.or_else(|| file.cloned())
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| {
                    Error::validation(format!(
                        "cluster {} is required (use --{} or --config)",
                        what, what
                    ))
                })
        };

        let config = Self {
            cluster_name: pick(name, from_file.as_ref().map(|s| &s.cluster_name), "name")?,
            project: pick(project, from_file.as_ref().map(|s| &s.project), "project")?,
            zone: pick(zone, from_file.as_ref().map(|s| &s.zone), "zone")?,
            disallow_prompt,
        };
        config.cluster_id().validate()?;
        Ok(config)
    }
}

/// Load and validate a cluster spec from a YAML file
pub fn load_cluster_spec(path: &Path) -> Result<ClusterSpec> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
    let spec: ClusterSpec = serde_yaml::from_str(&data)
        .map_err(|e| Error::config(format!("failed to parse {}: {}", path.display(), e)))?;
    spec.validate()?;
    Ok(spec)
}

/// Returns the CLI config directory (not created)
pub fn config_dir() -> Result<PathBuf> {
    if let Ok(dir) = std::env::var(CONFIG_DIR_ENV) {
        if !dir.is_empty() {
            return Ok(PathBuf::from(dir));
        }
    }
    let home = dirs::home_dir()
        .ok_or_else(|| Error::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Path of the environment registry inside `dir`
pub fn environments_path(dir: &Path) -> PathBuf {
    dir.join(ENVIRONMENTS_FILE_NAME)
}
