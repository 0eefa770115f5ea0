//! The runner service daemon.
//!
//! Polls the task queue for `afl:execute` / `afl:resume` tasks and drives
//! the evaluator. Registers itself as a server and heartbeats while
//! running.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use agentflow_core::{
    generate_id, AttributeValue, FlowDefinition, Program, RunnerDefinition, RunnerState,
    RuntimeError, ServerDefinition, ServerState, TaskDefinition, TaskState, EXECUTE_TASK,
    RESUME_TASK,
};
use agentflow_runtime::{Evaluator, ExecutionStatus};
use agentflow_storage::PersistenceStore;

use crate::config::RunnerServiceConfig;
use crate::error::WorkerError;

/// Daemon that claims runtime-control tasks and drives the evaluator.
pub struct RunnerService {
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<Evaluator>,
    config: RunnerServiceConfig,
    server_id: Uuid,
    programs: DashMap<Uuid, Arc<Program>>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl RunnerService {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        evaluator: Arc<Evaluator>,
        config: RunnerServiceConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            evaluator,
            config,
            server_id: generate_id(),
            programs: DashMap::new(),
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Run until shutdown: register, heartbeat, poll.
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.register_server().await?;
        info!(
            server_id = %self.server_id,
            task_list = %self.config.task_list,
            "runner service started"
        );

        let heartbeat = self.spawn_heartbeat();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.poll_once().await {
                        error!(error = %e, "poll cycle error");
                    }
                }
            }
        }

        heartbeat.abort();
        self.deregister_server().await;
        info!(server_id = %self.server_id, "runner service stopped");
        Ok(())
    }

    /// Signal the service to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One poll cycle: claim and process control tasks up to the
    /// concurrency cap. Returns the number of tasks processed.
    pub async fn poll_once(&self) -> Result<usize, WorkerError> {
        let names = vec![EXECUTE_TASK.to_string(), RESUME_TASK.to_string()];
        let mut processed = 0;

        while processed < self.config.max_concurrent {
            let Some(task) = self
                .store
                .claim_task(&names, &self.config.task_list)
                .await?
            else {
                break;
            };
            self.process_task(task).await;
            processed += 1;
        }
        Ok(processed)
    }

    #[instrument(skip(self, task), fields(task_id = %task.uuid, name = %task.name))]
    async fn process_task(&self, mut task: TaskDefinition) {
        let result = if task.name == EXECUTE_TASK {
            self.handle_execute(&mut task).await
        } else {
            self.handle_resume(&task).await
        };

        match result {
            Ok(status) => {
                let state = match status {
                    ExecutionStatus::Failed => TaskState::Failed,
                    _ => TaskState::Completed,
                };
                task.mark(state);
                if state == TaskState::Failed {
                    task.error = Some(agentflow_core::TaskError {
                        message: "workflow execution failed".to_string(),
                    });
                }
                if let Err(e) = self.store.save_task(&task).await {
                    error!(error = %e, "failed to save task state");
                }
            }
            Err(WorkerError::Runtime(RuntimeError::Cancelled)) => {
                task.mark(TaskState::Ignored);
                if let Err(e) = self.store.save_task(&task).await {
                    error!(error = %e, "failed to save ignored task");
                }
            }
            Err(e) => {
                warn!(error = %e, "task processing failed");
                task.fail(e.to_string());
                if let Err(save_err) = self.store.save_task(&task).await {
                    error!(error = %save_err, "failed to save failed task");
                }
            }
        }
    }

    /// `afl:execute`: load the flow, decode the program, create the runner
    /// and its execution workflow id, then enter the evaluator.
    async fn handle_execute(
        &self,
        task: &mut TaskDefinition,
    ) -> Result<ExecutionStatus, WorkerError> {
        let flow_id = task
            .data
            .get("flow_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .or(task.flow_id)
            .ok_or_else(|| WorkerError::Payload("afl:execute requires flow_id".to_string()))?;
        let workflow_name = task
            .data
            .get("workflow_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                WorkerError::Payload("afl:execute requires workflow_name".to_string())
            })?
            .to_string();

        let program = self.load_program(flow_id).await?;
        let workflow = program
            .find_workflow(&workflow_name)
            .ok_or_else(|| WorkerError::WorkflowNotFound(workflow_name.clone()))?
            .clone();

        let inputs = task
            .data
            .get("inputs")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();
        let mut input_attrs = BTreeMap::new();
        for (name, value) in inputs {
            input_attrs.insert(name.clone(), AttributeValue::new(name, value));
        }

        let mut runner = RunnerDefinition::new(generate_id(), workflow_name, input_attrs);
        // An execute task may carry a preassigned runner id; honor it so
        // the submitter can correlate the runner it requested.
        if let Some(runner_id) = task.runner_id {
            runner.uuid = runner_id;
        }
        runner.flow_id = Some(flow_id);
        self.store.save_runner(&runner).await?;

        task.runner_id = Some(runner.uuid);
        task.workflow_id = Some(runner.workflow_id);

        info!(
            runner_id = %runner.uuid,
            workflow_id = %runner.workflow_id,
            workflow = %runner.workflow_name,
            "starting workflow execution"
        );
        Ok(self
            .evaluator
            .execute(runner.uuid, &workflow, &program)
            .await?)
    }

    /// `afl:resume`: locate the runner for the workflow and re-enter the
    /// evaluator from the persisted continuation point.
    async fn handle_resume(&self, task: &TaskDefinition) -> Result<ExecutionStatus, WorkerError> {
        let workflow_id = task
            .data
            .get("workflow_id")
            .and_then(|v| v.as_str())
            .and_then(|s| Uuid::parse_str(s).ok())
            .or(task.workflow_id)
            .ok_or_else(|| WorkerError::Payload("afl:resume requires workflow_id".to_string()))?;

        let runner = self
            .store
            .get_runners_by_workflow(workflow_id)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| {
                WorkerError::Payload(format!("no runner for workflow {workflow_id}"))
            })?;

        if runner.state == RunnerState::Cancelled {
            return Err(WorkerError::Runtime(RuntimeError::Cancelled));
        }

        let flow_id = runner.flow_id.ok_or_else(|| {
            WorkerError::Payload(format!("runner {} has no flow reference", runner.uuid))
        })?;
        let program = self.load_program(flow_id).await?;
        let workflow = program
            .find_workflow(&runner.workflow_name)
            .ok_or_else(|| WorkerError::WorkflowNotFound(runner.workflow_name.clone()))?
            .clone();

        Ok(self
            .evaluator
            .resume(runner.uuid, &workflow, &program)
            .await?)
    }

    /// Load and cache the decoded program for a flow.
    async fn load_program(&self, flow_id: Uuid) -> Result<Arc<Program>, WorkerError> {
        if let Some(program) = self.programs.get(&flow_id) {
            return Ok(Arc::clone(program.value()));
        }
        let flow: FlowDefinition = self
            .store
            .get_flow(flow_id)
            .await?
            .ok_or_else(|| WorkerError::FlowNotFound(flow_id.to_string()))?;
        let program = flow
            .decode_program()
            .map_err(|e| WorkerError::AstDecode(e.to_string()))?;
        let program = Arc::new(program);
        self.programs.insert(flow_id, Arc::clone(&program));
        Ok(program)
    }

    async fn register_server(&self) -> Result<(), WorkerError> {
        let now = Utc::now();
        let server = ServerDefinition {
            uuid: self.server_id,
            server_group: self.config.server_group.clone(),
            service_name: self.config.service_name.clone(),
            server_name: self.config.server_name.clone(),
            server_ips: vec![],
            start_time: now,
            ping_time: now,
            topics: vec![],
            handlers: vec![EXECUTE_TASK.to_string(), RESUME_TASK.to_string()],
            handled: BTreeMap::new(),
            state: ServerState::Running,
        };
        self.store.save_server(&server).await?;
        Ok(())
    }

    async fn deregister_server(&self) {
        if let Ok(Some(mut server)) = self.store.get_server(self.server_id).await {
            server.state = ServerState::Shutdown;
            server.ping_time = Utc::now();
            if let Err(e) = self.store.save_server(&server).await {
                warn!(error = %e, "failed to deregister server");
            }
        }
    }

    fn spawn_heartbeat(&self) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let server_id = self.server_id;
        let interval = self.config.heartbeat_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = store.update_server_ping(server_id, Utc::now()).await {
                            error!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }
}
