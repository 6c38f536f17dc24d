//! Error types for cluster provisioning and teardown

use thiserror::Error;

/// Main error type for cortex-gcp operations
///
/// The first group of variants is the provider taxonomy returned by
/// [`CloudResourceClient`](crate::cloud::CloudResourceClient) implementations.
/// The rest cover local work (bootstrap, environment registry, config files).
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed cluster spec rejected by the provider (bad machine type, zone, ...)
    #[error("invalid cluster spec: {0}")]
    InvalidSpec(String),

    /// Resource name is already taken
    #[error("already exists: {0}")]
    AlreadyExists(String),

    /// Resource does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Credentials lack the required scope
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// Project quota does not allow the request
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    /// Retryable network or API error
    #[error("transient error: {0}")]
    Transient(String),

    /// Cluster reached a terminal failure on the provider side
    #[error("cluster provisioning failed: {0}")]
    ProvisioningFailed(String),

    /// Operation was cancelled by an external deadline or signal
    #[error("operation cancelled")]
    Cancelled,

    /// Provider error that fits none of the categories above
    #[error("provider error: {0}")]
    Provider(String),

    /// Local input failed validation before any remote call
    #[error("validation error: {0}")]
    Validation(String),

    /// Remote bootstrap of the new cluster failed
    #[error("bootstrap failed: {0}")]
    Bootstrap(String),

    /// Cluster is usable but the local environment record could not be written
    #[error("failed to configure environment: {0}")]
    EnvironmentRegistration(String),

    /// CLI configuration could not be resolved
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML error
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON error
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create an invalid spec error with the given message
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Create an already-exists error with the given message
    pub fn already_exists(msg: impl Into<String>) -> Self {
        Self::AlreadyExists(msg.into())
    }

    /// Create a not-found error with the given message
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    /// Create a permission denied error with the given message
    pub fn permission_denied(msg: impl Into<String>) -> Self {
        Self::PermissionDenied(msg.into())
    }

    /// Create a quota exceeded error with the given message
    pub fn quota_exceeded(msg: impl Into<String>) -> Self {
        Self::QuotaExceeded(msg.into())
    }

    /// Create a transient error with the given message
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    /// Create a provisioning failure carrying the provider diagnostic
    pub fn provisioning_failed(msg: impl Into<String>) -> Self {
        Self::ProvisioningFailed(msg.into())
    }

    /// Create an unclassified provider error with the given message
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider(msg.into())
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a bootstrap error with the given message
    pub fn bootstrap(msg: impl Into<String>) -> Self {
        Self::Bootstrap(msg.into())
    }

    /// Create an environment registration error with the given message
    pub fn environment_registration(msg: impl Into<String>) -> Self {
        Self::EnvironmentRegistration(msg.into())
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True if retrying the same call may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// True if the resource was missing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    /// True for errors that leave cloud resources usable and only affect
    /// local bookkeeping
    pub fn is_warning(&self) -> bool {
        matches!(self, Self::EnvironmentRegistration(_))
    }
}
