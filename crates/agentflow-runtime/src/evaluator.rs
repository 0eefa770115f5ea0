//! The evaluator: drives one workflow through durable iterations.
//!
//! Each iteration builds the working set of runnable steps, invokes the
//! state handler for each, applies requested transitions, and commits the
//! accumulated changes atomically. The loop ends when the root step is
//! terminal (completed / failed), when one or more event steps block on
//! external dispatch (paused), or when a persistence error survives the
//! commit retries (failed).
//!
//! No two processes may drive the same runner concurrently: every
//! invocation holds the `runner:<id>` key-lock for its duration.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use rand::Rng;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use agentflow_core::{
    LockMetaData, LogDefinition, ObjectType, Program, RunnerDefinition, RunnerState,
    RuntimeError, StepDefinition, StepLogEntry, StepState, TaskDefinition, WorkflowDecl,
};
use agentflow_storage::{IterationChanges, PersistenceStore, StoreError};

use crate::context::{AstIndex, EvalContext};
use crate::dispatch::HandlerDispatcher;
use crate::handlers::{handler_for, Outcome};

/// Final status of one evaluator invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// All steps terminal, root completed.
    Completed,
    /// One or more event steps block on external dispatch.
    Paused,
    /// The root step errored or the iteration could not be persisted.
    Failed,
}

/// Evaluator tuning knobs.
#[derive(Debug, Clone)]
pub struct EvaluatorConfig {
    /// Bound on same-iteration re-queues, against handler-level livelock.
    pub push_cap: usize,

    /// Commit attempts before the iteration ends failed.
    pub commit_attempts: u32,

    /// Backoff before each commit retry (jittered ±10%).
    pub commit_backoff: Vec<Duration>,

    /// Lease on the `runner:<id>` lock; extended every iteration.
    pub lock_lease: Duration,

    /// Hard bound on iterations per invocation.
    pub max_iterations: u64,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            push_cap: 1000,
            commit_attempts: 3,
            commit_backoff: vec![
                Duration::from_millis(100),
                Duration::from_millis(400),
                Duration::from_secs(1),
            ],
            lock_lease: Duration::from_secs(60),
            max_iterations: 10_000,
        }
    }
}

/// The state-machine driver.
pub struct Evaluator {
    store: Arc<dyn PersistenceStore>,
    dispatcher: Option<Arc<HandlerDispatcher>>,
    config: EvaluatorConfig,
}

fn perr(e: StoreError) -> RuntimeError {
    RuntimeError::Persistence(e.to_string())
}

impl Evaluator {
    pub fn new(store: Arc<dyn PersistenceStore>) -> Self {
        Self {
            store,
            dispatcher: None,
            config: EvaluatorConfig::default(),
        }
    }

    /// Install an inline dispatcher consulted at `EventTransmit`.
    pub fn with_dispatcher(mut self, dispatcher: Arc<HandlerDispatcher>) -> Self {
        self.dispatcher = Some(dispatcher);
        self
    }

    pub fn with_config(mut self, config: EvaluatorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn store(&self) -> &Arc<dyn PersistenceStore> {
        &self.store
    }

    /// Drive a runner from its current persisted state.
    #[instrument(skip(self, workflow, program), fields(runner_id = %runner_id))]
    pub async fn execute(
        &self,
        runner_id: Uuid,
        workflow: &WorkflowDecl,
        program: &Program,
    ) -> Result<ExecutionStatus, RuntimeError> {
        let runner = self
            .store
            .get_runner(runner_id)
            .await
            .map_err(perr)?
            .ok_or_else(|| {
                RuntimeError::Persistence(format!("runner not found: {runner_id}"))
            })?;
        self.run_locked(runner, workflow, program).await
    }

    /// Re-enter the loop for a paused runner. Persisted step states carry
    /// the continuation point; re-running against a runner with no pending
    /// work is a no-op.
    pub async fn resume(
        &self,
        runner_id: Uuid,
        workflow: &WorkflowDecl,
        program: &Program,
    ) -> Result<ExecutionStatus, RuntimeError> {
        self.execute(runner_id, workflow, program).await
    }

    async fn run_locked(
        &self,
        runner: RunnerDefinition,
        workflow: &WorkflowDecl,
        program: &Program,
    ) -> Result<ExecutionStatus, RuntimeError> {
        let lock_key = format!("runner:{}", runner.uuid);
        let meta = LockMetaData {
            owner: None,
            purpose: Some("evaluator".to_string()),
        };
        let acquired = self
            .store
            .acquire_lock(&lock_key, self.config.lock_lease, Some(meta))
            .await
            .map_err(perr)?;
        if !acquired {
            return Err(RuntimeError::Persistence(format!(
                "runner {} is being evaluated by another process",
                runner.uuid
            )));
        }

        let result = self.run(runner, workflow, program, &lock_key).await;

        if let Err(e) = self.store.release_lock(&lock_key).await {
            warn!(error = %e, "failed to release runner lock");
        }
        result
    }

    async fn run(
        &self,
        mut runner: RunnerDefinition,
        workflow: &WorkflowDecl,
        program: &Program,
        lock_key: &str,
    ) -> Result<ExecutionStatus, RuntimeError> {
        if runner.state == RunnerState::Cancelled {
            return Err(RuntimeError::Cancelled);
        }
        match runner.state {
            RunnerState::Completed => return Ok(ExecutionStatus::Completed),
            RunnerState::Failed => return Ok(ExecutionStatus::Failed),
            _ => {}
        }

        let workflow_id = runner.workflow_id;
        let facets = program.facet_table();
        let ast = AstIndex::build(workflow);

        if runner.state == RunnerState::Created {
            runner.state = RunnerState::Running;
            self.store.save_runner(&runner).await.map_err(perr)?;
            self.log(runner.uuid, format!("runner started: {}", runner.workflow_name))
                .await;
        }

        for iteration in 0..self.config.max_iterations {
            // Cancellation halts at iteration boundaries; in-flight handler
            // results are discarded on return.
            if let Some(current) = self.store.get_runner(runner.uuid).await.map_err(perr)? {
                if current.state == RunnerState::Cancelled {
                    info!(runner_id = %runner.uuid, "runner cancelled, halting");
                    return Err(RuntimeError::Cancelled);
                }
            }

            let mut changes = IterationChanges::new();
            let mut all_steps = self
                .store
                .get_steps_by_workflow(workflow_id)
                .await
                .map_err(perr)?;

            // First entry materializes the root from the workflow AST.
            let root_id = match all_steps
                .iter()
                .find(|s| s.container_id.is_none() && s.root_id.is_none())
            {
                Some(root) => root.id,
                None => {
                    let root = self.create_root(&runner, workflow);
                    let id = root.id;
                    changes.add_created_step(root.clone());
                    all_steps.push(root);
                    id
                }
            };

            let active_events: HashSet<Uuid> = self
                .store
                .get_events_by_workflow(workflow_id)
                .await
                .map_err(perr)?
                .into_iter()
                .filter(|e| !e.state.is_terminal())
                .map(|e| e.step_id)
                .collect();

            let mut steps_map: HashMap<Uuid, StepDefinition> = all_steps
                .into_iter()
                .map(|mut s| {
                    // The stored copy is committed state; reset the write
                    // markers so only steps touched this iteration are
                    // written back.
                    s.transition.commit();
                    (s.id, s)
                })
                .collect();

            // Deterministic order: creation time, then uuid.
            let mut order: Vec<Uuid> = steps_map
                .values()
                .filter(|s| !s.is_terminal())
                .map(|s| s.id)
                .collect();
            order.sort_by_key(|id| {
                let s = &steps_map[id];
                (s.start_time, s.id)
            });

            let mut queue: VecDeque<Uuid> = order.iter().copied().collect();
            let mut pushes = 0usize;
            let mut errored = 0usize;

            while let Some(step_id) = queue.pop_front() {
                let Some(mut step) = steps_map.remove(&step_id) else {
                    continue;
                };
                step.transition.reset_for_iteration();

                let handler = handler_for(step.state);
                let outcome = {
                    let mut ctx = EvalContext {
                        runner_id: runner.uuid,
                        workflow_id,
                        workflow,
                        facets: &facets,
                        ast: &ast,
                        inputs: &runner.inputs,
                        steps: &steps_map,
                        active_events: &active_events,
                        changes: &mut changes,
                        dispatcher: self.dispatcher.as_deref(),
                    };
                    handler.process(&mut ctx, &mut step).await
                };

                match outcome {
                    Ok(Outcome::Advance) => step.request_state_change(true),
                    Ok(Outcome::Stay { push }) => {
                        if push && pushes < self.config.push_cap {
                            pushes += 1;
                            queue.push_back(step_id);
                        }
                        step.transition.push_me = push;
                    }
                    Err(e) if e.is_step_error() => {
                        warn!(
                            step_id = %step.id,
                            statement = %step.statement_name,
                            error = %e,
                            "step errored"
                        );
                        step.mark_error(e.to_string());
                        self.step_log(&step, e.to_string()).await;
                        errored += 1;
                    }
                    Err(e) => return Err(e),
                }

                if step.transition.changed {
                    changes.add_updated_step(step.clone());
                }
                steps_map.insert(step_id, step);
            }

            // Apply requested transitions so the committed state already
            // reflects this iteration's advancement.
            let mut advanced = 0usize;
            for id in &order {
                if let Some(step) = steps_map.get_mut(id) {
                    if step.transition.request_transition && step.apply_transition() {
                        advanced += 1;
                        changes.add_updated_step(step.clone());
                    }
                }
            }

            let created_steps = !changes.created_steps.is_empty();
            let created_events = changes.created_events.len();

            if let Err(e) = self.commit_with_retry(&changes).await {
                warn!(error = %e, "iteration commit failed after retries");
                runner.finish(RunnerState::Failed);
                let _ = self.store.save_runner(&runner).await;
                self.log(runner.uuid, format!("commit failed: {e}")).await;
                return Ok(ExecutionStatus::Failed);
            }

            debug!(
                iteration,
                advanced,
                created_events,
                steps = steps_map.len(),
                "iteration committed"
            );

            // Termination checks.
            let root = steps_map
                .get(&root_id)
                .ok_or_else(|| RuntimeError::Persistence("root step vanished".to_string()))?;

            if root.is_complete() {
                runner.finish(RunnerState::Completed);
                self.store.save_runner(&runner).await.map_err(perr)?;
                self.log(runner.uuid, "runner completed").await;
                return Ok(ExecutionStatus::Completed);
            }
            if root.is_error() {
                runner.finish(RunnerState::Failed);
                self.store.save_runner(&runner).await.map_err(perr)?;
                self.log(
                    runner.uuid,
                    format!(
                        "runner failed: {}",
                        root.error.clone().unwrap_or_else(|| "step error".into())
                    ),
                )
                .await;
                return Ok(ExecutionStatus::Failed);
            }

            let blocked = steps_map.values().any(|s| {
                s.state == StepState::EventTransmit
                    && !s.transition.request_transition
                    && (active_events.contains(&s.id) || created_events > 0)
            });
            if blocked {
                if runner.state != RunnerState::Paused {
                    runner.state = RunnerState::Paused;
                    self.store.save_runner(&runner).await.map_err(perr)?;
                }
                self.log(runner.uuid, "runner paused awaiting external dispatch")
                    .await;
                return Ok(ExecutionStatus::Paused);
            }

            // Stalled: nothing advanced, nothing new, nothing errored,
            // nothing blocked. Mark the waiting steps errored so the
            // failure propagates instead of spinning.
            if advanced == 0 && !created_steps && errored == 0 {
                let waiting: Vec<Uuid> = steps_map
                    .values()
                    .filter(|s| !s.is_terminal() && s.state == StepState::FacetInitBegin)
                    .map(|s| s.id)
                    .collect();
                if waiting.is_empty() {
                    let mut root = steps_map
                        .get(&root_id)
                        .cloned()
                        .ok_or_else(|| {
                            RuntimeError::Persistence("root step vanished".to_string())
                        })?;
                    root.mark_error("no runnable work remains");
                    self.store.save_step(&root).await.map_err(perr)?;
                } else {
                    for id in waiting {
                        if let Some(step) = steps_map.get_mut(&id) {
                            step.mark_error(
                                "unresolved dependency: no runnable work remains",
                            );
                            self.store.save_step(step).await.map_err(perr)?;
                            self.step_log(step, "unresolved dependency".to_string()).await;
                        }
                    }
                }
            }

            self.store
                .extend_lock(lock_key, self.config.lock_lease)
                .await
                .map_err(perr)?;
        }

        warn!(runner_id = %runner.uuid, "iteration bound exhausted");
        runner.finish(RunnerState::Failed);
        self.store.save_runner(&runner).await.map_err(perr)?;
        Ok(ExecutionStatus::Failed)
    }

    /// Supply a blocked step's returns and unblock it.
    ///
    /// Writes the result into the step's return attributes, advances it
    /// past `EventTransmit`, completes the event, and enqueues an
    /// `afl:resume` task for the runner. Idempotent: a step already past
    /// `EventTransmit` (or terminal) is left untouched.
    #[instrument(skip(self, returns), fields(step_id = %step_id))]
    pub async fn continue_step(
        &self,
        step_id: Uuid,
        returns: serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), RuntimeError> {
        let Some(mut step) = self.store.get_step(step_id).await.map_err(perr)? else {
            return Err(RuntimeError::Persistence(format!(
                "step not found: {step_id}"
            )));
        };

        if step.is_terminal() || step.state != StepState::EventTransmit {
            debug!(state = %step.state, "continue_step is a no-op");
            return Ok(());
        }

        for (name, value) in &returns {
            step.attributes.set_return(name, value.clone());
        }
        step.request_state_change(true);
        step.apply_transition();
        self.store.save_step(&step).await.map_err(perr)?;

        if let Some(mut event) = self.store.get_event_for_step(step_id).await.map_err(perr)? {
            event.complete(returns);
            self.store.save_event(&event).await.map_err(perr)?;
        }

        self.enqueue_resume(step.workflow_id).await?;
        info!(facet = %step.facet_name, "step continued");
        Ok(())
    }

    /// Mark a step errored from outside the iteration loop (agent-side
    /// failures: missing handler, handler error, timeout). Enqueues an
    /// `afl:resume` so the evaluator observes the failure and fails the
    /// runner.
    #[instrument(skip(self, message), fields(step_id = %step_id))]
    pub async fn fail_step(
        &self,
        step_id: Uuid,
        message: impl Into<String> + Send,
    ) -> Result<(), RuntimeError> {
        let Some(mut step) = self.store.get_step(step_id).await.map_err(perr)? else {
            return Err(RuntimeError::Persistence(format!(
                "step not found: {step_id}"
            )));
        };
        if step.is_terminal() {
            return Ok(());
        }

        let message = message.into();
        step.mark_error(message.clone());
        self.store.save_step(&step).await.map_err(perr)?;
        self.step_log(&step, message.clone()).await;

        if let Some(mut event) = self.store.get_event_for_step(step_id).await.map_err(perr)? {
            event.error(message);
            self.store.save_event(&event).await.map_err(perr)?;
        }

        self.enqueue_resume(step.workflow_id).await?;
        Ok(())
    }

    async fn enqueue_resume(&self, workflow_id: Uuid) -> Result<(), RuntimeError> {
        let runner = self
            .store
            .get_runners_by_workflow(workflow_id)
            .await
            .map_err(perr)?
            .into_iter()
            .next();
        match runner {
            Some(runner) => {
                let task = TaskDefinition::resume(workflow_id, runner.uuid);
                self.store.save_task(&task).await.map_err(perr)?;
                debug!(%workflow_id, task_id = %task.uuid, "resume task enqueued");
                Ok(())
            }
            None => {
                warn!(%workflow_id, "no runner for workflow, resume not enqueued");
                Ok(())
            }
        }
    }

    fn create_root(
        &self,
        runner: &RunnerDefinition,
        workflow: &WorkflowDecl,
    ) -> StepDefinition {
        let mut root = StepDefinition::create(
            runner.workflow_id,
            ObjectType::Workflow,
            workflow.name.clone(),
            None,
            workflow.name.clone(),
            None,
            None,
            None,
            None,
        );
        for (name, attr) in &runner.inputs {
            root.attributes
                .set_param_hinted(name, attr.value.clone(), attr.type_hint);
        }
        root
    }

    async fn commit_with_retry(&self, changes: &IterationChanges) -> Result<(), StoreError> {
        let mut last_err = None;
        for attempt in 0..self.config.commit_attempts {
            match self.store.commit(changes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!(attempt, error = %e, "commit attempt failed");
                    last_err = Some(e);
                    if (attempt as usize) < self.config.commit_backoff.len() {
                        let base = self.config.commit_backoff[attempt as usize];
                        tokio::time::sleep(jitter(base)).await;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| StoreError::Database("commit failed".to_string())))
    }

    async fn log(&self, runner_id: Uuid, message: impl Into<String>) {
        let entry = LogDefinition::new(runner_id, Utc::now().timestamp_millis(), message);
        if let Err(e) = self.store.save_log(&entry).await {
            warn!(error = %e, "failed to write runner log");
        }
    }

    async fn step_log(&self, step: &StepDefinition, message: String) {
        let entry = StepLogEntry::new(step.id, step.workflow_id, message);
        if let Err(e) = self.store.save_step_log(&entry).await {
            warn!(error = %e, "failed to write step log");
        }
    }
}

/// ±10% jitter to avoid synchronized retries across processes.
fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.9..1.1);
    Duration::from_secs_f64(base.as_secs_f64() * factor)
}
