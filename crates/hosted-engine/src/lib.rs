//! Convergence polling and workflow orchestration for hosted Kubernetes
//! cluster lifecycle tests
//!
//! Remote operations are asynchronous and eventually consistent. The engine
//! separates what to wait for ([`Condition`], built by [`state`]) from how to
//! wait ([`poller::poll`]), checks converged specs with [`drift`], and
//! sequences provider calls into [`Workflow`]s whose cleanup obligations are
//! always unwound.

#![deny(missing_docs)]

pub mod backup_restore;
pub mod condition;
pub mod context;
pub mod drift;
pub mod driver;
pub mod harness;
pub mod model;
pub mod poller;
pub mod scenarios;
pub mod state;
pub mod step;
pub mod steps;
pub mod workflow;

pub use condition::{Condition, Evaluation};
pub use context::{CleanupObligation, WorkflowContext};
pub use drift::{check_converged, DriftError, FieldPath};
pub use driver::{ProviderDriver, ProviderDriverExt};
pub use harness::SuiteHarness;
pub use model::{ClusterChange, ClusterHandle, ClusterSpec, NodeGroup, Snapshot};
pub use poller::{poll, PollError};
pub use state::ResourceState;
pub use step::{FnStep, Step, StepError};
pub use workflow::{CleanupError, Workflow, WorkflowError, WorkflowPhase, WorkflowReport};
