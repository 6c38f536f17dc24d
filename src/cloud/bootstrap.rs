//! Remote bootstrap through the Cortex manager image
//!
//! The manager container runs `/root/install.sh` against the new cluster with
//! the cluster config mounted and the bucket name in its environment. The
//! script prints the operator endpoint as its final URL line.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, info};

use super::BootstrapExecutor;
use crate::cluster::{BucketHandle, ClusterSpec};
use crate::{Error, Result};

/// Default manager image
pub const DEFAULT_MANAGER_IMAGE: &str = "quay.io/cortexlabs/manager:latest";

/// Script run inside the manager container
pub const INSTALL_SCRIPT: &str = "/root/install.sh";

const CONTAINER_CONFIG_PATH: &str = "/.cortex/cluster.yaml";
const CONTAINER_CREDENTIALS_PATH: &str = "/var/secrets/google/key.json";

/// Result of a successful bootstrap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BootstrapOutput {
    /// URL the CLI uses to reach the Cortex operator
    pub operator_endpoint: String,
}

/// Runs the install script in a local docker container
pub struct DockerBootstrapExecutor {
    image: String,
    docker: String,
    scratch_dir: PathBuf,
    credentials_file: Option<PathBuf>,
    access_token: Option<String>,
}

impl DockerBootstrapExecutor {
    /// Create an executor for the given manager image
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            docker: "docker".to_string(),
            scratch_dir: std::env::temp_dir(),
            credentials_file: None,
            access_token: None,
        }
    }

    /// Use another docker-compatible CLI
    pub fn with_docker_binary(mut self, docker: impl Into<String>) -> Self {
        self.docker = docker.into();
        self
    }

    /// Directory for the cluster config handed to the container
    pub fn with_scratch_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch_dir = dir.into();
        self
    }

    /// Mount a service account key into the container
    pub fn with_credentials_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.credentials_file = Some(path.into());
        self
    }

    /// Pass an OAuth access token into the container
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Fail early if the docker daemon is unreachable
    pub async fn check_prerequisites() -> Result<()> {
        let output = Command::new("docker")
            .args(["version", "--format", "{{.Server.Version}}"])
            .output()
            .await
            .map_err(|e| {
                Error::config(format!(
                    "docker not found ({}). Install Docker: https://docs.docker.com/get-docker/",
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(Error::config(format!(
                "unable to connect to the docker daemon: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }

    /// Write the spec to a fresh file that is removed when the handle drops
    fn write_config(&self, spec: &ClusterSpec) -> Result<tempfile::NamedTempFile> {
        let mut file = tempfile::Builder::new()
            .prefix(&format!("cortex-{}-", spec.cluster_name))
            .suffix(".yaml")
            .tempfile_in(&self.scratch_dir)?;
        file.write_all(serde_yaml::to_string(spec)?.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    fn docker_args(&self, spec: &ClusterSpec, bucket: &BucketHandle, config_path: &str) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "--rm".to_string(),
            "--entrypoint".to_string(),
            "/bin/bash".to_string(),
            "-v".to_string(),
            format!("{}:{}:ro", config_path, CONTAINER_CONFIG_PATH),
            "-e".to_string(),
            format!("CORTEX_CLUSTER_CONFIG_FILE={}", CONTAINER_CONFIG_PATH),
            "-e".to_string(),
            format!("CORTEX_BUCKET={}", bucket),
            "-e".to_string(),
            format!("CORTEX_CLUSTER_NAME={}", spec.cluster_name),
            "-e".to_string(),
            format!("CORTEX_PROJECT={}", spec.project),
            "-e".to_string(),
            format!("CORTEX_ZONE={}", spec.zone),
            "-e".to_string(),
            "CORTEX_PROVIDER=gcp".to_string(),
        ];

        if let Some(path) = &self.credentials_file {
            args.push("-v".to_string());
            args.push(format!("{}:{}:ro", path.display(), CONTAINER_CREDENTIALS_PATH));
            args.push("-e".to_string());
            args.push(format!("GOOGLE_APPLICATION_CREDENTIALS={}", CONTAINER_CREDENTIALS_PATH));
        }
        if self.access_token.is_some() {
            // value is taken from this process's environment, never the argv
            args.push("-e".to_string());
            args.push("GOOGLE_OAUTH_ACCESS_TOKEN".to_string());
        }

        args.push(self.image.clone());
        args.push("-c".to_string());
        args.push(INSTALL_SCRIPT.to_string());
        args
    }
}

#[async_trait]
impl BootstrapExecutor for DockerBootstrapExecutor {
    async fn run(&self, spec: &ClusterSpec, bucket: &BucketHandle) -> Result<BootstrapOutput> {
        let config = self.write_config(spec)?;

        let args = self.docker_args(spec, bucket, &config.path().to_string_lossy());
        info!(image = %self.image, bucket = %bucket, "Running cluster bootstrap");

        let mut command = Command::new(&self.docker);
        command
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(token) = &self.access_token {
            command.env("GOOGLE_OAUTH_ACCESS_TOKEN", token);
        }

        let mut child = command.spawn()?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let read_stdout = async {
            let mut lines = Vec::new();
            if let Some(stdout) = stdout {
                let mut reader = BufReader::new(stdout).lines();
                while let Some(line) = reader.next_line().await? {
                    info!(target: "bootstrap", "{}", line);
                    lines.push(line);
                }
            }
            Ok::<_, std::io::Error>(lines)
        };
        let read_stderr = async {
            let mut text = String::new();
            if let Some(mut stderr) = stderr {
                stderr.read_to_string(&mut text).await?;
            }
            Ok::<_, std::io::Error>(text)
        };

        let (lines, stderr_text) = tokio::join!(read_stdout, read_stderr);
        let status = child.wait().await?;
        drop(config);
        let lines = lines?;

        if !status.success() {
            return Err(Error::bootstrap(format!(
                "{} exited with {}: {}",
                INSTALL_SCRIPT,
                status,
                stderr_text.unwrap_or_default().trim()
            )));
        }

        let operator_endpoint = parse_operator_endpoint(&lines).ok_or_else(|| {
            Error::bootstrap(format!("{} did not report an operator endpoint", INSTALL_SCRIPT))
        })?;
        debug!(endpoint = %operator_endpoint, "Bootstrap reported operator endpoint");

        Ok(BootstrapOutput { operator_endpoint })
    }
}

/// Last line of script output that is an http(s) URL
pub fn parse_operator_endpoint<S: AsRef<str>>(lines: &[S]) -> Option<String> {
    lines
        .iter()
        .rev()
        .map(|l| l.as_ref().trim())
        .find(|l| l.starts_with("https://") || l.starts_with("http://"))
        .map(str::to_string)
}
