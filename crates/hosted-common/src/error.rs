//! Error types for hosted-cluster validation
//!
//! Every external collaborator (provider drivers, the management-plane client,
//! backup tooling) reports failures through this type. Variants carry the
//! cluster and provider context needed to diagnose a failed scenario without
//! re-running it.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for provider and management-plane operations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum Error {
    /// Cloud provider or management-plane call failed
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster the call targeted
        cluster: String,
        /// Provider type (eks, gke, aks, fake)
        provider: String,
        /// Provider-supplied message, treated as opaque text
        message: String,
        /// Whether the call may succeed if issued again (throttling, 5xx)
        retryable: bool,
    },

    /// Lookup by identity found nothing
    #[error("cluster {cluster} not found")]
    NotFound {
        /// Identity that was looked up
        cluster: String,
    },

    /// Invalid requested configuration
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "nodeGroups[ng-1].desiredSize")
        field: Option<String>,
    },

    /// Malformed environment configuration
    #[error("configuration error for {key}: {message}")]
    Config {
        /// Environment variable or setting name
        key: String,
        /// Description of what's wrong
        message: String,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "backup", "fake-driver")
        context: String,
    },
}

impl Error {
    /// Create a retryable provider error without cluster context
    pub fn provider(msg: impl Into<String>) -> Self {
        Self::Provider {
            cluster: UNKNOWN_CONTEXT.to_string(),
            provider: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (rejected request, bad config)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a provider throttling error
    pub fn rate_limited(cluster: impl Into<String>, provider: impl Into<String>) -> Self {
        Self::provider_for(cluster, provider, "rate exceeded: too many requests")
    }

    /// Create a not-found error for the given identity
    pub fn not_found(cluster: impl Into<String>) -> Self {
        Self::NotFound {
            cluster: cluster.into(),
        }
    }

    /// Create a validation error with cluster context
    pub fn validation(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a configuration error for a setting
    pub fn config(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Config {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retryable
    ///
    /// Throttling and transient provider failures are retryable. Validation,
    /// configuration and not-found errors need a different request to succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Provider { retryable, .. } => *retryable,
            Error::NotFound { .. } => false,
            Error::Validation { .. } => false,
            Error::Config { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Whether this error reports a missing resource
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Get the cluster name if this error is associated with a specific cluster
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Provider { cluster, .. } => Some(cluster),
            Error::NotFound { cluster } => Some(cluster),
            Error::Validation { cluster, .. } => Some(cluster),
            Error::Config { .. } => None,
            Error::Internal { .. } => None,
        }
    }
}
