//! Worker-side error type.

use agentflow_core::RuntimeError;
use agentflow_storage::StoreError;

/// Errors raised by the runner service and the agent poller.
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("flow not found: {0}")]
    FlowNotFound(String),

    #[error("workflow '{0}' not found in flow")]
    WorkflowNotFound(String),

    #[error("invalid program document: {0}")]
    AstDecode(String),

    #[error("invalid task payload: {0}")]
    Payload(String),
}
