//! GCP implementation of [`CloudResourceClient`]
//!
//! Buckets go through the Cloud Storage JSON API and clusters through the GKE
//! REST API. Every non-success response is classified into the crate error
//! taxonomy by [`classify_response`].

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::auth::GcpCredentials;
use super::gke::{self, ClusterResponse};
use super::CloudResourceClient;
use crate::cluster::{BucketHandle, ClusterId, ClusterSpec, ClusterStatus};
use crate::{Error, Result};

const STORAGE_API: &str = "https://storage.googleapis.com/storage/v1";
const CONTAINER_API: &str = "https://container.googleapis.com/v1";

/// Cloud Storage and GKE client for one project and zone
pub struct GcpClient {
    http: reqwest::Client,
    credentials: GcpCredentials,
    project: String,
    zone: String,
    storage_api: String,
    container_api: String,
}

impl GcpClient {
    /// Create a client with explicit credentials
    pub fn new(credentials: GcpCredentials, project: impl Into<String>, zone: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            credentials,
            project: project.into(),
            zone: zone.into(),
            storage_api: STORAGE_API.to_string(),
            container_api: CONTAINER_API.to_string(),
        }
    }

    /// Point the client at other API roots, e.g. an emulator
    pub fn with_endpoints(
        mut self,
        storage_api: impl Into<String>,
        container_api: impl Into<String>,
    ) -> Self {
        self.storage_api = storage_api.into();
        self.container_api = container_api.into();
        self
    }

    /// Create a client with credentials resolved from the environment
    pub async fn from_env(project: impl Into<String>, zone: impl Into<String>) -> Result<Self> {
        let credentials = GcpCredentials::from_env().await?;
        Ok(Self::new(credentials, project, zone))
    }

    /// Region the zone belongs to (`us-central1-a` -> `us-central1`)
    pub fn region(&self) -> &str {
        zone_region(&self.zone)
    }

    async fn send(&self, method: Method, url: Url, body: Option<serde_json::Value>) -> Result<String> {
        let mut request = self
            .http
            .request(method, url)
            .bearer_auth(&self.credentials.access_token);
        if let Some(body) = body {
            request = request.json(&body);
        }

        let response = request.send().await.map_err(classify_transport)?;
        let status = response.status();
        let text = response.text().await.map_err(classify_transport)?;

        if status.is_success() {
            Ok(text)
        } else {
            Err(classify_response(status, &text))
        }
    }

    async fn delete_objects(&self, bucket: &BucketHandle) -> Result<()> {
        let mut page_token: Option<String> = None;
        loop {
            let mut url = storage_url(&self.storage_api, &["b", bucket.name(), "o"])?;
            if let Some(token) = &page_token {
                url.query_pairs_mut().append_pair("pageToken", token);
            }

            let body = self.send(Method::GET, url, None).await?;
            let listing: ObjectList = serde_json::from_str(&body)?;

            for object in &listing.items {
                let url = storage_url(&self.storage_api, &["b", bucket.name(), "o", object.name.as_str()])?;
                match self.send(Method::DELETE, url, None).await {
                    Ok(_) => {}
                    Err(e) if e.is_not_found() => {}
                    Err(e) => return Err(e),
                }
            }

            match listing.next_page_token {
                Some(token) => page_token = Some(token),
                None => return Ok(()),
            }
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectList {
    #[serde(default)]
    items: Vec<ObjectEntry>,
    next_page_token: Option<String>,
}

#[derive(Deserialize)]
struct ObjectEntry {
    name: String,
}

#[async_trait]
impl CloudResourceClient for GcpClient {
    async fn create_bucket(&self, bucket: &BucketHandle) -> Result<()> {
        let mut url = storage_url(&self.storage_api, &["b"])?;
        url.query_pairs_mut().append_pair("project", &self.project);
        let body = json!({
            "name": bucket.name(),
            "location": self.region(),
            "iamConfiguration": { "uniformBucketLevelAccess": { "enabled": true } },
        });

        self.send(Method::POST, url, Some(body)).await?;
        info!(bucket = %bucket, region = %self.region(), "Created bucket");
        Ok(())
    }

    async fn delete_bucket(&self, bucket: &BucketHandle) -> Result<()> {
        match self.delete_objects(bucket).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(bucket = %bucket, "Bucket not found (already deleted)");
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let url = storage_url(&self.storage_api, &["b", bucket.name()])?;
        match self.send(Method::DELETE, url, None).await {
            Ok(_) => {
                info!(bucket = %bucket, "Deleted bucket");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                debug!(bucket = %bucket, "Bucket not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn create_cluster(&self, spec: &ClusterSpec) -> Result<ClusterId> {
        let id = spec.id();
        let request = gke::create_cluster_request(spec, self.credentials.client_email.as_deref());
        let url = container_url(&self.container_api, &format!("{}/clusters", id.parent()))?;

        self.send(Method::POST, url, Some(serde_json::to_value(&request)?))
            .await?;
        info!(cluster = %id, "Cluster creation accepted");
        Ok(id)
    }

    async fn delete_cluster(&self, id: &ClusterId) -> Result<()> {
        let url = container_url(&self.container_api, &id.resource_name())?;
        self.send(Method::DELETE, url, None).await?;
        info!(cluster = %id, "Cluster deletion accepted");
        Ok(())
    }

    async fn get_cluster_phase(&self, id: &ClusterId) -> Result<ClusterStatus> {
        let url = container_url(&self.container_api, &id.resource_name())?;
        let body = self.send(Method::GET, url, None).await?;
        let response: ClusterResponse = serde_json::from_str(&body)?;
        let raw = response.status.clone();
        let (status, recognised) = response.into_status();
        if !recognised {
            warn!(cluster = %id, status = %raw, "Unrecognised cluster status, treating as running");
        }
        Ok(status)
    }
}

/// Region part of a zone name
pub fn zone_region(zone: &str) -> &str {
    match zone.rsplit_once('-') {
        Some((region, suffix)) if suffix.len() == 1 => region,
        _ => zone,
    }
}

fn storage_url(base: &str, segments: &[&str]) -> Result<Url> {
    let mut url = Url::parse(base).map_err(|e| Error::provider(e.to_string()))?;
    url.path_segments_mut()
        .map_err(|_| Error::provider("storage API url cannot be a base"))?
        .extend(segments);
    Ok(url)
}

fn container_url(base: &str, resource: &str) -> Result<Url> {
    Url::parse(&format!("{}/{}", base, resource))
        .map_err(|e| Error::provider(format!("invalid cluster resource '{}': {}", resource, e)))
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: String,
}

/// Map an HTTP error response into the crate error taxonomy
pub fn classify_response(status: StatusCode, body: &str) -> Error {
    let message = serde_json::from_str::<ErrorEnvelope>(body)
        .map(|e| e.error.message)
        .ok()
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("{} {}", status.as_u16(), body.trim()));

    match status {
        StatusCode::BAD_REQUEST => Error::invalid_spec(message),
        StatusCode::UNAUTHORIZED => Error::permission_denied(message),
        StatusCode::FORBIDDEN if message.to_lowercase().contains("quota") => {
            Error::quota_exceeded(message)
        }
        StatusCode::FORBIDDEN => Error::permission_denied(message),
        StatusCode::NOT_FOUND => Error::not_found(message),
        StatusCode::CONFLICT => Error::already_exists(message),
        StatusCode::TOO_MANY_REQUESTS => Error::transient(message),
        s if s.is_server_error() => Error::transient(message),
        _ => Error::provider(message),
    }
}

fn classify_transport(err: reqwest::Error) -> Error {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        Error::transient(err.to_string())
    } else {
        Error::provider(err.to_string())
    }
}
