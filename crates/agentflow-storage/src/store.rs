//! The persistence port.
//!
//! Every durable operation of the runtime funnels through this trait. The
//! evaluator must not touch a backend directly; implementations carry the
//! concurrency and atomicity guarantees (atomic single-winner `claim_task`,
//! all-or-nothing `commit`, upsert `save_*`, the partial uniqueness
//! invariants on running tasks and non-terminal events).

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use agentflow_core::{
    EventDefinition, FlowDefinition, HandlerRegistration, LockDefinition, LockMetaData,
    LogDefinition, RunnerDefinition, RunnerState, ServerDefinition, StepDefinition, StepLogEntry,
    StepState, TaskDefinition, TaskState, WorkflowDefinition,
};

use crate::changes::IterationChanges;

/// Error type for store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("step not found: {0}")]
    StepNotFound(Uuid),

    #[error("task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("runner not found: {0}")]
    RunnerNotFound(Uuid),

    #[error("flow not found: {0}")]
    FlowNotFound(Uuid),

    /// A partial uniqueness invariant would be violated.
    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn database(e: impl std::fmt::Display) -> Self {
        Self::Database(e.to_string())
    }

    pub fn serialization(e: impl std::fmt::Display) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// Store for steps, events, the task queue, and the surrounding entities.
///
/// Implementations must be thread-safe and support concurrent access from
/// multiple processes.
#[async_trait]
pub trait PersistenceStore: Send + Sync + 'static {
    // =========================================================================
    // Step Operations
    // =========================================================================

    async fn get_step(&self, step_id: Uuid) -> Result<Option<StepDefinition>, StoreError>;

    async fn get_steps_by_block(&self, block_id: Uuid)
        -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_state(&self, state: StepState)
        -> Result<Vec<StepDefinition>, StoreError>;

    async fn get_steps_by_container(
        &self,
        container_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError>;

    /// All block steps contained by a step.
    async fn get_blocks_by_step(&self, step_id: Uuid)
        -> Result<Vec<StepDefinition>, StoreError>;

    /// Upsert a step, keyed by uuid.
    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError>;

    /// The root step of a workflow: no container and no root reference.
    async fn get_workflow_root(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<StepDefinition>, StoreError>;

    /// Idempotency probe: does a step exist for this (statement, block) pair?
    async fn step_exists(
        &self,
        statement_id: &str,
        block_id: Option<Uuid>,
    ) -> Result<bool, StoreError>;

    // =========================================================================
    // Event Operations
    // =========================================================================

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventDefinition>, StoreError>;

    async fn get_events_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<EventDefinition>, StoreError>;

    /// The non-terminal event for a step, if one exists (at most one may).
    async fn get_event_for_step(
        &self,
        step_id: Uuid,
    ) -> Result<Option<EventDefinition>, StoreError>;

    async fn save_event(&self, event: &EventDefinition) -> Result<(), StoreError>;

    // =========================================================================
    // Task Queue Operations
    // =========================================================================

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskDefinition>, StoreError>;

    async fn get_pending_tasks(&self, task_list: &str)
        -> Result<Vec<TaskDefinition>, StoreError>;

    async fn get_tasks_by_runner(
        &self,
        runner_id: Uuid,
    ) -> Result<Vec<TaskDefinition>, StoreError>;

    /// The most recent task associated with a step.
    async fn get_task_for_step(&self, step_id: Uuid)
        -> Result<Option<TaskDefinition>, StoreError>;

    async fn save_task(&self, task: &TaskDefinition) -> Result<(), StoreError>;

    /// Atomically claim one pending task matching any of the given names.
    ///
    /// The `pending → running` transition serves exactly one claimant; all
    /// concurrent callers but one observe `None` for the same row.
    async fn claim_task(
        &self,
        names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskDefinition>, StoreError>;

    async fn update_task_state(&self, task_id: Uuid, state: TaskState)
        -> Result<(), StoreError>;

    // =========================================================================
    // Runner Operations
    // =========================================================================

    async fn get_runner(&self, runner_id: Uuid) -> Result<Option<RunnerDefinition>, StoreError>;

    async fn save_runner(&self, runner: &RunnerDefinition) -> Result<(), StoreError>;

    async fn get_runners_by_state(
        &self,
        state: RunnerState,
    ) -> Result<Vec<RunnerDefinition>, StoreError>;

    async fn get_runners_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<RunnerDefinition>, StoreError>;

    // =========================================================================
    // Flow / Workflow Operations
    // =========================================================================

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, StoreError>;

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<FlowDefinition>, StoreError>;

    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError>;

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool, StoreError>;

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError>;

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError>;

    // =========================================================================
    // Server Operations
    // =========================================================================

    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerDefinition>, StoreError>;

    async fn save_server(&self, server: &ServerDefinition) -> Result<(), StoreError>;

    async fn update_server_ping(
        &self,
        server_id: Uuid,
        ping_time: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn get_all_servers(&self) -> Result<Vec<ServerDefinition>, StoreError>;

    // =========================================================================
    // Handler Registration Operations
    // =========================================================================

    /// Upsert by facet name.
    async fn save_handler_registration(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<(), StoreError>;

    async fn get_handler_registration(
        &self,
        facet_name: &str,
    ) -> Result<Option<HandlerRegistration>, StoreError>;

    async fn list_handler_registrations(&self)
        -> Result<Vec<HandlerRegistration>, StoreError>;

    async fn delete_handler_registration(&self, facet_name: &str) -> Result<bool, StoreError>;

    // =========================================================================
    // Log Operations
    // =========================================================================

    async fn save_log(&self, log: &LogDefinition) -> Result<(), StoreError>;

    /// Logs for a runner, ordered by the explicit order field.
    async fn get_logs_by_runner(&self, runner_id: Uuid)
        -> Result<Vec<LogDefinition>, StoreError>;

    async fn save_step_log(&self, entry: &StepLogEntry) -> Result<(), StoreError>;

    async fn get_step_logs_by_step(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError>;

    async fn get_step_logs_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError>;

    // =========================================================================
    // Lock Operations
    // =========================================================================

    /// Acquire a key-leased lock. Returns false if the key is held and the
    /// lease has not expired.
    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<LockMetaData>,
    ) -> Result<bool, StoreError>;

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError>;

    /// The lock if it exists and its lease is still valid.
    async fn check_lock(&self, key: &str) -> Result<Option<LockDefinition>, StoreError>;

    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError>;

    // =========================================================================
    // Atomic Commit
    // =========================================================================

    /// Apply one iteration's accumulated changes atomically.
    ///
    /// All-or-nothing: on failure nothing is applied and the change set
    /// remains valid for retry.
    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError>;
}
