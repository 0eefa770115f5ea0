//! # AgentFlow Worker
//!
//! The two daemons of the distributed runtime:
//! - [`RunnerService`] claims `afl:execute` / `afl:resume` tasks and
//!   drives the evaluator
//! - [`AgentPoller`] claims domain facet tasks and dispatches them to
//!   registered handlers, in-process or artifact-backed
//!
//! Both register themselves as servers and heartbeat through the
//! persistence port; a server whose ping stops advancing is considered
//! failed and its facets are taken over by other agents on the next
//! claim.

pub mod artifact;
pub mod config;
pub mod error;
pub mod poller;
pub mod runner_service;

pub use artifact::{ArtifactCoordinates, ArtifactExecutor};
pub use config::{AgentPollerConfig, ArtifactConfig, RunnerServiceConfig};
pub use error::WorkerError;
pub use poller::AgentPoller;
pub use runner_service::RunnerService;
