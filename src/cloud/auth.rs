//! GCP credentials
//!
//! The access token comes from `GOOGLE_OAUTH_ACCESS_TOKEN` or, failing that,
//! from `gcloud auth print-access-token`. The node service account is read
//! from the JSON key at `GOOGLE_APPLICATION_CREDENTIALS` when present.

use std::path::Path;

use serde::Deserialize;
use tokio::process::Command;
use tracing::debug;

use crate::{Error, Result};

const ACCESS_TOKEN_ENV: &str = "GOOGLE_OAUTH_ACCESS_TOKEN";
const CREDENTIALS_FILE_ENV: &str = "GOOGLE_APPLICATION_CREDENTIALS";

/// Credentials used for every GCP API call
#[derive(Clone)]
pub struct GcpCredentials {
    /// OAuth2 bearer token
    pub access_token: String,
    /// Service account email assigned to cluster nodes
    pub client_email: Option<String>,
}

impl std::fmt::Debug for GcpCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcpCredentials")
            .field("access_token", &"<redacted>")
            .field("client_email", &self.client_email)
            .finish()
    }
}

#[derive(Deserialize)]
struct ServiceAccountKey {
    client_email: Option<String>,
}

impl GcpCredentials {
    /// Resolve credentials from the environment
    pub async fn from_env() -> Result<Self> {
        let access_token = match std::env::var(ACCESS_TOKEN_ENV) {
            Ok(token) if !token.trim().is_empty() => token.trim().to_string(),
            _ => gcloud_access_token().await?,
        };

        let client_email = match std::env::var(CREDENTIALS_FILE_ENV) {
            Ok(path) if !path.is_empty() => read_client_email(Path::new(&path))?,
            _ => None,
        };

        Ok(Self {
            access_token,
            client_email,
        })
    }
}

async fn gcloud_access_token() -> Result<String> {
    debug!("{} not set, asking gcloud for an access token", ACCESS_TOKEN_ENV);
    let output = Command::new("gcloud")
        .args(["auth", "print-access-token"])
        .output()
        .await
        .map_err(|e| {
            Error::config(format!(
                "unable to run gcloud ({}); set {} or install the Google Cloud SDK",
                e, ACCESS_TOKEN_ENV
            ))
        })?;

    if !output.status.success() {
        return Err(Error::permission_denied(format!(
            "gcloud auth print-access-token failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if token.is_empty() {
        return Err(Error::permission_denied("gcloud returned an empty access token"));
    }
    Ok(token)
}

fn read_client_email(path: &Path) -> Result<Option<String>> {
    let data = std::fs::read_to_string(path).map_err(|e| {
        Error::config(format!(
            "failed to read {} ({}): {}",
            CREDENTIALS_FILE_ENV,
            path.display(),
            e
        ))
    })?;
    let key: ServiceAccountKey = serde_json::from_str(&data)?;
    Ok(key.client_email)
}
