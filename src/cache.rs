//! Cached cluster configuration
//!
//! `cluster up` stores the spec it provisioned under a path derived from the
//! cluster identity, so the exact config survives a failed bootstrap.
//! `cluster down` removes it at the end. The cache is advisory; nothing
//! depends on it being present.

use std::path::{Path, PathBuf};

use tracing::debug;

use crate::cluster::{ClusterId, ClusterSpec};
use crate::{Error, Result};

/// File cache of provisioned cluster specs
#[derive(Clone, Debug)]
pub struct ClusterConfigCache {
    dir: PathBuf,
}

impl ClusterConfigCache {
    /// Cache rooted at `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Directory holding the cache files
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the cached config for a cluster
    pub fn path(&self, id: &ClusterId) -> PathBuf {
        self.dir.join(format!(
            "cluster_gcp_{}_{}_{}.yaml",
            id.name, id.project, id.zone
        ))
    }

    /// Store the spec used to provision a cluster
    pub fn write(&self, spec: &ClusterSpec) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(&spec.id());
        std::fs::write(&path, serde_yaml::to_string(spec)?).map_err(|e| {
            Error::config(format!("failed to write {}: {}", path.display(), e))
        })?;
        debug!(path = %path.display(), "Cached cluster config");
        Ok(path)
    }

    /// Remove the cached config for a cluster. A missing file is not an error.
    pub fn purge(&self, id: &ClusterId) -> Result<()> {
        match std::fs::remove_file(self.path(id)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
