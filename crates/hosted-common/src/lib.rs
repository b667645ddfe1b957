//! Shared plumbing for hosted-cluster e2e validation: errors, retry,
//! configuration, naming and tracing setup.

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod names;
pub mod retry;
pub mod telemetry;

pub use config::{CleanupPolicy, E2eConfig, PollConfig, PollSettings, ProviderKind};
pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
