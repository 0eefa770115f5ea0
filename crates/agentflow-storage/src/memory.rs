//! In-memory implementation of the persistence port for testing.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use uuid::Uuid;

use agentflow_core::{
    EventDefinition, FlowDefinition, HandlerRegistration, LockDefinition, LockMetaData,
    LogDefinition, RunnerDefinition, RunnerState, ServerDefinition, StepDefinition, StepLogEntry,
    StepState, TaskDefinition, TaskState, WorkflowDefinition,
};

use crate::changes::IterationChanges;
use crate::store::{PersistenceStore, StoreError};

fn statement_key(statement_id: &str, block_id: Option<Uuid>) -> String {
    match block_id {
        Some(b) => format!("{statement_id}:{b}"),
        None => format!("{statement_id}:root"),
    }
}

#[derive(Default)]
struct StepTables {
    steps: HashMap<Uuid, StepDefinition>,
    by_block: HashMap<Uuid, Vec<Uuid>>,
    by_workflow: HashMap<Uuid, Vec<Uuid>>,
    by_container: HashMap<Uuid, Vec<Uuid>>,
    by_statement: HashMap<String, Uuid>,
}

impl StepTables {
    fn insert(&mut self, step: StepDefinition) {
        if let Some(old) = self.steps.get(&step.id) {
            let old = old.clone();
            self.remove_from_indexes(&old);
        }
        self.add_to_indexes(&step);
        self.steps.insert(step.id, step);
    }

    fn add_to_indexes(&mut self, step: &StepDefinition) {
        self.by_workflow
            .entry(step.workflow_id)
            .or_default()
            .push(step.id);
        if let Some(block_id) = step.block_id {
            self.by_block.entry(block_id).or_default().push(step.id);
        }
        if let Some(container_id) = step.container_id {
            self.by_container
                .entry(container_id)
                .or_default()
                .push(step.id);
        }
        if let Some(ref statement_id) = step.statement_id {
            self.by_statement
                .insert(statement_key(statement_id, step.block_id), step.id);
        }
    }

    fn remove_from_indexes(&mut self, step: &StepDefinition) {
        if let Some(ids) = self.by_workflow.get_mut(&step.workflow_id) {
            ids.retain(|id| *id != step.id);
        }
        if let Some(block_id) = step.block_id {
            if let Some(ids) = self.by_block.get_mut(&block_id) {
                ids.retain(|id| *id != step.id);
            }
        }
        if let Some(container_id) = step.container_id {
            if let Some(ids) = self.by_container.get_mut(&container_id) {
                ids.retain(|id| *id != step.id);
            }
        }
        if let Some(ref statement_id) = step.statement_id {
            self.by_statement
                .remove(&statement_key(statement_id, step.block_id));
        }
    }

    fn collect(&self, ids: Option<&Vec<Uuid>>) -> Vec<StepDefinition> {
        ids.map(|ids| {
            ids.iter()
                .filter_map(|id| self.steps.get(id).cloned())
                .collect()
        })
        .unwrap_or_default()
    }
}

/// In-memory persistence store.
///
/// Primarily for tests: stores everything in maps behind `parking_lot`
/// locks while providing the same semantics as the PostgreSQL store,
/// including atomic single-winner claims and the partial uniqueness
/// invariants on running tasks and non-terminal events.
#[derive(Default)]
pub struct InMemoryStore {
    steps: RwLock<StepTables>,
    events: RwLock<HashMap<Uuid, EventDefinition>>,
    tasks: RwLock<HashMap<Uuid, TaskDefinition>>,
    runners: RwLock<HashMap<Uuid, RunnerDefinition>>,
    flows: RwLock<HashMap<Uuid, FlowDefinition>>,
    workflows: RwLock<HashMap<Uuid, WorkflowDefinition>>,
    servers: RwLock<HashMap<Uuid, ServerDefinition>>,
    registrations: RwLock<HashMap<String, HandlerRegistration>>,
    logs: RwLock<Vec<LogDefinition>>,
    step_logs: RwLock<Vec<StepLogEntry>>,
    locks: RwLock<HashMap<String, LockDefinition>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of steps (for tests).
    pub fn step_count(&self) -> usize {
        self.steps.read().steps.len()
    }

    /// Number of pending tasks (for tests).
    pub fn pending_task_count(&self) -> usize {
        self.tasks
            .read()
            .values()
            .filter(|t| t.state == TaskState::Pending)
            .count()
    }

    /// Clear all stored data (for tests).
    pub fn clear(&self) {
        *self.steps.write() = StepTables::default();
        self.events.write().clear();
        self.tasks.write().clear();
        self.runners.write().clear();
        self.flows.write().clear();
        self.workflows.write().clear();
        self.servers.write().clear();
        self.registrations.write().clear();
        self.logs.write().clear();
        self.step_logs.write().clear();
        self.locks.write().clear();
    }

    fn check_event_uniqueness(
        events: &HashMap<Uuid, EventDefinition>,
        event: &EventDefinition,
    ) -> Result<(), StoreError> {
        if !event.state.is_terminal() {
            let clash = events.values().any(|e| {
                e.uuid != event.uuid && e.step_id == event.step_id && !e.state.is_terminal()
            });
            if clash {
                return Err(StoreError::Constraint(format!(
                    "step {} already has a non-terminal event",
                    event.step_id
                )));
            }
        }
        Ok(())
    }

    fn check_task_uniqueness(
        tasks: &HashMap<Uuid, TaskDefinition>,
        task: &TaskDefinition,
    ) -> Result<(), StoreError> {
        if task.state == TaskState::Running {
            if let Some(step_id) = task.step_id {
                let clash = tasks.values().any(|t| {
                    t.uuid != task.uuid
                        && t.step_id == Some(step_id)
                        && t.state == TaskState::Running
                });
                if clash {
                    return Err(StoreError::Constraint(format!(
                        "step {step_id} already has a running task"
                    )));
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for InMemoryStore {
    async fn get_step(&self, step_id: Uuid) -> Result<Option<StepDefinition>, StoreError> {
        Ok(self.steps.read().steps.get(&step_id).cloned())
    }

    async fn get_steps_by_block(
        &self,
        block_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let tables = self.steps.read();
        Ok(tables.collect(tables.by_block.get(&block_id)))
    }

    async fn get_steps_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let tables = self.steps.read();
        Ok(tables.collect(tables.by_workflow.get(&workflow_id)))
    }

    async fn get_steps_by_state(
        &self,
        state: StepState,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        Ok(self
            .steps
            .read()
            .steps
            .values()
            .filter(|s| s.state == state)
            .cloned()
            .collect())
    }

    async fn get_steps_by_container(
        &self,
        container_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let tables = self.steps.read();
        Ok(tables.collect(tables.by_container.get(&container_id)))
    }

    async fn get_blocks_by_step(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let tables = self.steps.read();
        let mut blocks = tables.collect(tables.by_container.get(&step_id));
        blocks.retain(|s| s.is_block());
        Ok(blocks)
    }

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError> {
        self.steps.write().insert(step.clone());
        Ok(())
    }

    async fn get_workflow_root(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<StepDefinition>, StoreError> {
        let tables = self.steps.read();
        let ids = match tables.by_workflow.get(&workflow_id) {
            Some(ids) => ids,
            None => return Ok(None),
        };
        Ok(ids
            .iter()
            .filter_map(|id| tables.steps.get(id))
            .find(|s| s.container_id.is_none() && s.root_id.is_none())
            .cloned())
    }

    async fn step_exists(
        &self,
        statement_id: &str,
        block_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        Ok(self
            .steps
            .read()
            .by_statement
            .contains_key(&statement_key(statement_id, block_id)))
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventDefinition>, StoreError> {
        Ok(self.events.read().get(&event_id).cloned())
    }

    async fn get_events_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<EventDefinition>, StoreError> {
        Ok(self
            .events
            .read()
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_event_for_step(
        &self,
        step_id: Uuid,
    ) -> Result<Option<EventDefinition>, StoreError> {
        Ok(self
            .events
            .read()
            .values()
            .find(|e| e.step_id == step_id && !e.state.is_terminal())
            .cloned())
    }

    async fn save_event(&self, event: &EventDefinition) -> Result<(), StoreError> {
        let mut events = self.events.write();
        Self::check_event_uniqueness(&events, event)?;
        events.insert(event.uuid, event.clone());
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskDefinition>, StoreError> {
        Ok(self.tasks.read().get(&task_id).cloned())
    }

    async fn get_pending_tasks(
        &self,
        task_list: &str,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        let mut tasks: Vec<_> = self
            .tasks
            .read()
            .values()
            .filter(|t| t.task_list_name == task_list && t.state == TaskState::Pending)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| (a.created, a.uuid).cmp(&(b.created, b.uuid)));
        Ok(tasks)
    }

    async fn get_tasks_by_runner(
        &self,
        runner_id: Uuid,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.runner_id == Some(runner_id))
            .cloned()
            .collect())
    }

    async fn get_task_for_step(
        &self,
        step_id: Uuid,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        Ok(self
            .tasks
            .read()
            .values()
            .filter(|t| t.step_id == Some(step_id))
            .max_by_key(|t| (t.created, t.uuid))
            .cloned())
    }

    async fn save_task(&self, task: &TaskDefinition) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        Self::check_task_uniqueness(&tasks, task)?;
        tasks.insert(task.uuid, task.clone());
        Ok(())
    }

    async fn claim_task(
        &self,
        names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        // The write lock makes the pending -> running transition atomic:
        // concurrent claimants serialize here and only one observes the row
        // as pending.
        let mut tasks = self.tasks.write();

        let candidate = tasks
            .values()
            .filter(|t| {
                t.state == TaskState::Pending
                    && t.task_list_name == task_list
                    && names.contains(&t.name)
            })
            // A step with a running task is not claimable again
            .filter(|t| {
                t.step_id.map_or(true, |step_id| {
                    !tasks
                        .values()
                        .any(|o| o.step_id == Some(step_id) && o.state == TaskState::Running)
                })
            })
            .min_by_key(|t| (t.created, t.uuid))
            .map(|t| t.uuid);

        match candidate {
            Some(id) => {
                let task = tasks.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;
                task.state = TaskState::Running;
                task.updated = Utc::now();
                Ok(Some(task.clone()))
            }
            None => Ok(None),
        }
    }

    async fn update_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
    ) -> Result<(), StoreError> {
        let mut tasks = self.tasks.write();
        let task = tasks
            .get_mut(&task_id)
            .ok_or(StoreError::TaskNotFound(task_id))?;
        task.state = state;
        task.updated = Utc::now();
        Ok(())
    }

    async fn get_runner(&self, runner_id: Uuid) -> Result<Option<RunnerDefinition>, StoreError> {
        Ok(self.runners.read().get(&runner_id).cloned())
    }

    async fn save_runner(&self, runner: &RunnerDefinition) -> Result<(), StoreError> {
        self.runners.write().insert(runner.uuid, runner.clone());
        Ok(())
    }

    async fn get_runners_by_state(
        &self,
        state: RunnerState,
    ) -> Result<Vec<RunnerDefinition>, StoreError> {
        Ok(self
            .runners
            .read()
            .values()
            .filter(|r| r.state == state)
            .cloned()
            .collect())
    }

    async fn get_runners_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<RunnerDefinition>, StoreError> {
        Ok(self
            .runners
            .read()
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self.flows.read().get(&flow_id).cloned())
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<FlowDefinition>, StoreError> {
        Ok(self
            .flows
            .read()
            .values()
            .find(|f| f.name == name)
            .cloned())
    }

    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
        self.flows.write().insert(flow.uuid, flow.clone());
        Ok(())
    }

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        Ok(self.flows.write().remove(&flow_id).is_some())
    }

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self.workflows.read().get(&workflow_id).cloned())
    }

    async fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        Ok(self
            .workflows
            .read()
            .values()
            .find(|w| w.name == name)
            .cloned())
    }

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        self.workflows
            .write()
            .insert(workflow.uuid, workflow.clone());
        Ok(())
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerDefinition>, StoreError> {
        Ok(self.servers.read().get(&server_id).cloned())
    }

    async fn save_server(&self, server: &ServerDefinition) -> Result<(), StoreError> {
        self.servers.write().insert(server.uuid, server.clone());
        Ok(())
    }

    async fn update_server_ping(
        &self,
        server_id: Uuid,
        ping_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if let Some(server) = self.servers.write().get_mut(&server_id) {
            server.ping_time = ping_time;
        }
        Ok(())
    }

    async fn get_all_servers(&self) -> Result<Vec<ServerDefinition>, StoreError> {
        Ok(self.servers.read().values().cloned().collect())
    }

    async fn save_handler_registration(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<(), StoreError> {
        self.registrations
            .write()
            .insert(registration.facet_name.clone(), registration.clone());
        Ok(())
    }

    async fn get_handler_registration(
        &self,
        facet_name: &str,
    ) -> Result<Option<HandlerRegistration>, StoreError> {
        Ok(self.registrations.read().get(facet_name).cloned())
    }

    async fn list_handler_registrations(
        &self,
    ) -> Result<Vec<HandlerRegistration>, StoreError> {
        Ok(self.registrations.read().values().cloned().collect())
    }

    async fn delete_handler_registration(&self, facet_name: &str) -> Result<bool, StoreError> {
        Ok(self.registrations.write().remove(facet_name).is_some())
    }

    async fn save_log(&self, log: &LogDefinition) -> Result<(), StoreError> {
        self.logs.write().push(log.clone());
        Ok(())
    }

    async fn get_logs_by_runner(
        &self,
        runner_id: Uuid,
    ) -> Result<Vec<LogDefinition>, StoreError> {
        let mut logs: Vec<_> = self
            .logs
            .read()
            .iter()
            .filter(|l| l.runner_id == runner_id)
            .cloned()
            .collect();
        logs.sort_by_key(|l| l.order);
        Ok(logs)
    }

    async fn save_step_log(&self, entry: &StepLogEntry) -> Result<(), StoreError> {
        self.step_logs.write().push(entry.clone());
        Ok(())
    }

    async fn get_step_logs_by_step(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .step_logs
            .read()
            .iter()
            .filter(|e| e.step_id == step_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.time);
        Ok(entries)
    }

    async fn get_step_logs_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError> {
        let mut entries: Vec<_> = self
            .step_logs
            .read()
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect();
        entries.sort_by_key(|e| e.time);
        Ok(entries)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<LockMetaData>,
    ) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();

        if let Some(existing) = locks.get(key) {
            if !existing.is_expired(now) {
                return Ok(false);
            }
        }

        locks.insert(
            key.to_string(),
            LockDefinition {
                key: key.to_string(),
                acquired_at: now,
                expires_at: now
                    + chrono::Duration::milliseconds(duration.as_millis() as i64),
                meta,
            },
        );
        Ok(true)
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        Ok(self.locks.write().remove(key).is_some())
    }

    async fn check_lock(&self, key: &str) -> Result<Option<LockDefinition>, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get(key) {
            Some(lock) if lock.is_expired(now) => {
                locks.remove(key);
                Ok(None)
            }
            Some(lock) => Ok(Some(lock.clone())),
            None => Ok(None),
        }
    }

    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError> {
        let now = Utc::now();
        let mut locks = self.locks.write();
        match locks.get_mut(key) {
            Some(lock) if !lock.is_expired(now) => {
                lock.expires_at =
                    now + chrono::Duration::milliseconds(duration.as_millis() as i64);
                Ok(true)
            }
            Some(_) => {
                locks.remove(key);
                Ok(false)
            }
            None => Ok(false),
        }
    }

    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError> {
        // Validate the partial uniqueness invariants before touching any
        // table so a failed commit leaves the store unchanged.
        {
            let events = self.events.read();
            for event in changes
                .created_events
                .iter()
                .chain(changes.updated_events.iter())
            {
                Self::check_event_uniqueness(&events, event)?;
            }
            let tasks = self.tasks.read();
            for task in &changes.created_tasks {
                Self::check_task_uniqueness(&tasks, task)?;
            }
        }

        {
            let mut steps = self.steps.write();
            for step in changes
                .created_steps
                .iter()
                .chain(changes.updated_steps.iter())
            {
                steps.insert(step.clone());
            }
        }
        {
            let mut events = self.events.write();
            for event in changes
                .created_events
                .iter()
                .chain(changes.updated_events.iter())
            {
                events.insert(event.uuid, event.clone());
            }
        }
        {
            let mut tasks = self.tasks.write();
            for task in &changes.created_tasks {
                tasks.insert(task.uuid, task.clone());
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{generate_id, FacetAttributes, ObjectType};
    use std::sync::Arc;

    fn step_for(workflow_id: Uuid) -> StepDefinition {
        StepDefinition::create(
            workflow_id,
            ObjectType::VariableAssignment,
            "ns.F",
            Some("stmt-1".to_string()),
            "s1",
            None,
            None,
            None,
            None,
        )
    }

    #[tokio::test]
    async fn test_save_and_get_step_round_trip() {
        let store = InMemoryStore::new();
        let step = step_for(generate_id());

        store.save_step(&step).await.unwrap();
        let loaded = store.get_step(step.id).await.unwrap().unwrap();
        assert_eq!(loaded, step);
    }

    #[tokio::test]
    async fn test_step_exists_idempotency_key() {
        let store = InMemoryStore::new();
        let step = step_for(generate_id());

        assert!(!store.step_exists("stmt-1", None).await.unwrap());
        store.save_step(&step).await.unwrap();
        assert!(store.step_exists("stmt-1", None).await.unwrap());
        assert!(!store.step_exists("stmt-1", Some(generate_id())).await.unwrap());
    }

    #[tokio::test]
    async fn test_workflow_root_lookup() {
        let store = InMemoryStore::new();
        let workflow_id = generate_id();
        let root = StepDefinition::create(
            workflow_id,
            ObjectType::Workflow,
            "Wf",
            None,
            "Wf",
            None,
            None,
            None,
            None,
        );
        let mut child = step_for(workflow_id);
        child.container_id = Some(root.id);
        child.root_id = Some(root.id);

        store.save_step(&root).await.unwrap();
        store.save_step(&child).await.unwrap();

        let found = store.get_workflow_root(workflow_id).await.unwrap().unwrap();
        assert_eq!(found.id, root.id);
    }

    #[tokio::test]
    async fn test_event_partial_uniqueness() {
        let store = InMemoryStore::new();
        let step_id = generate_id();
        let workflow_id = generate_id();

        let event = EventDefinition::new(step_id, workflow_id, "ns.F", serde_json::Map::new());
        store.save_event(&event).await.unwrap();

        // A second non-terminal event for the same step is rejected
        let dup = EventDefinition::new(step_id, workflow_id, "ns.F", serde_json::Map::new());
        assert!(matches!(
            store.save_event(&dup).await,
            Err(StoreError::Constraint(_))
        ));

        // Completing the first frees the slot
        let mut completed = event.clone();
        completed.complete(serde_json::Map::new());
        store.save_event(&completed).await.unwrap();
        store.save_event(&dup).await.unwrap();
    }

    #[tokio::test]
    async fn test_claim_task_single_winner() {
        let store = Arc::new(InMemoryStore::new());
        let task = TaskDefinition::for_facet(
            "ns.AddOne",
            generate_id(),
            generate_id(),
            generate_id(),
            &FacetAttributes::default(),
        );
        store.save_task(&task).await.unwrap();

        let names = vec!["ns.AddOne".to_string()];
        let mut handles = vec![];
        for _ in 0..10 {
            let store = Arc::clone(&store);
            let names = names.clone();
            handles.push(tokio::spawn(async move {
                store.claim_task(&names, "default").await.unwrap()
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_claim_task_filters_name_and_list() {
        let store = InMemoryStore::new();
        let task = TaskDefinition::for_facet(
            "ns.AddOne",
            generate_id(),
            generate_id(),
            generate_id(),
            &FacetAttributes::default(),
        );
        store.save_task(&task).await.unwrap();

        let miss = store
            .claim_task(&["ns.Other".to_string()], "default")
            .await
            .unwrap();
        assert!(miss.is_none());

        let miss = store
            .claim_task(&["ns.AddOne".to_string()], "priority")
            .await
            .unwrap();
        assert!(miss.is_none());

        let hit = store
            .claim_task(&["ns.AddOne".to_string()], "default")
            .await
            .unwrap();
        assert_eq!(hit.unwrap().uuid, task.uuid);
    }

    #[tokio::test]
    async fn test_claim_skips_step_with_running_task() {
        let store = InMemoryStore::new();
        let step_id = generate_id();

        let mut running = TaskDefinition::for_facet(
            "ns.AddOne",
            generate_id(),
            generate_id(),
            step_id,
            &FacetAttributes::default(),
        );
        running.state = TaskState::Running;
        store.save_task(&running).await.unwrap();

        let mut pending = TaskDefinition::for_facet(
            "ns.AddOne",
            generate_id(),
            generate_id(),
            step_id,
            &FacetAttributes::default(),
        );
        pending.step_id = Some(step_id);
        store.save_task(&pending).await.unwrap();

        let claimed = store
            .claim_task(&["ns.AddOne".to_string()], "default")
            .await
            .unwrap();
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_lock_acquire_release_extend() {
        let store = InMemoryStore::new();
        let held = store
            .acquire_lock("runner:x", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(held);

        // Second acquisition fails while the lease is live
        let held = store
            .acquire_lock("runner:x", Duration::from_secs(30), None)
            .await
            .unwrap();
        assert!(!held);

        assert!(store.check_lock("runner:x").await.unwrap().is_some());
        assert!(store
            .extend_lock("runner:x", Duration::from_secs(60))
            .await
            .unwrap());
        assert!(store.release_lock("runner:x").await.unwrap());
        assert!(store.check_lock("runner:x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_commit_applies_all_changes() {
        let store = InMemoryStore::new();
        let workflow_id = generate_id();
        let step = step_for(workflow_id);

        let mut changes = IterationChanges::new();
        changes.add_created_step(step.clone());
        changes.add_created_event(EventDefinition::new(
            step.id,
            workflow_id,
            "ns.F",
            serde_json::Map::new(),
        ));
        changes.add_created_task(TaskDefinition::for_facet(
            "ns.F",
            generate_id(),
            workflow_id,
            step.id,
            &FacetAttributes::default(),
        ));

        store.commit(&changes).await.unwrap();

        assert!(store.get_step(step.id).await.unwrap().is_some());
        assert!(store.get_event_for_step(step.id).await.unwrap().is_some());
        assert_eq!(store.pending_task_count(), 1);
    }

    #[tokio::test]
    async fn test_commit_of_empty_changes_is_noop() {
        let store = InMemoryStore::new();
        let changes = IterationChanges::new();
        store.commit(&changes).await.unwrap();
        assert_eq!(store.step_count(), 0);
        assert_eq!(store.pending_task_count(), 0);
    }

    #[tokio::test]
    async fn test_handler_registration_upsert() {
        let store = InMemoryStore::new();
        let reg = HandlerRegistration::new("ns.AddOne", "mvn:com.example:add-one:1.0.0");
        store.save_handler_registration(&reg).await.unwrap();

        let updated = reg.clone().with_timeout_ms(500);
        store.save_handler_registration(&updated).await.unwrap();

        let loaded = store
            .get_handler_registration("ns.AddOne")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.timeout_ms, 500);
        assert_eq!(store.list_handler_registrations().await.unwrap().len(), 1);

        assert!(store.delete_handler_registration("ns.AddOne").await.unwrap());
        assert!(!store.delete_handler_registration("ns.AddOne").await.unwrap());
    }

    #[tokio::test]
    async fn test_flow_and_workflow_lookup() {
        let store = InMemoryStore::new();
        let program = agentflow_core::Program::default();
        let flow = agentflow_core::FlowDefinition::new("demo-flow", &program).unwrap();
        store.save_flow(&flow).await.unwrap();

        let wf = WorkflowDefinition::new("demo.AddOneWorkflow", flow.uuid);
        store.save_workflow(&wf).await.unwrap();

        assert!(store.get_flow(flow.uuid).await.unwrap().is_some());
        assert_eq!(
            store.get_flow_by_name("demo-flow").await.unwrap().unwrap().uuid,
            flow.uuid
        );
        assert_eq!(
            store
                .get_workflow_by_name("demo.AddOneWorkflow")
                .await
                .unwrap()
                .unwrap()
                .uuid,
            wf.uuid
        );

        assert!(store.delete_flow(flow.uuid).await.unwrap());
        assert!(store.get_flow(flow.uuid).await.unwrap().is_none());
        assert!(!store.delete_flow(flow.uuid).await.unwrap());
    }

    #[tokio::test]
    async fn test_task_for_step_returns_most_recent() {
        let store = InMemoryStore::new();
        let step_id = generate_id();

        let first = TaskDefinition::for_facet(
            "ns.F",
            generate_id(),
            generate_id(),
            step_id,
            &FacetAttributes::default(),
        );
        store.save_task(&first).await.unwrap();

        let mut second = TaskDefinition::for_facet(
            "ns.F",
            generate_id(),
            generate_id(),
            step_id,
            &FacetAttributes::default(),
        );
        second.created = first.created + chrono::Duration::seconds(1);
        store.save_task(&second).await.unwrap();

        let latest = store.get_task_for_step(step_id).await.unwrap().unwrap();
        assert_eq!(latest.uuid, second.uuid);
    }

    #[tokio::test]
    async fn test_logs_ordered_by_order_field() {
        let store = InMemoryStore::new();
        let runner_id = generate_id();
        store
            .save_log(&LogDefinition::new(runner_id, 2, "second"))
            .await
            .unwrap();
        store
            .save_log(&LogDefinition::new(runner_id, 1, "first"))
            .await
            .unwrap();

        let logs = store.get_logs_by_runner(runner_id).await.unwrap();
        assert_eq!(logs[0].message, "first");
        assert_eq!(logs[1].message, "second");
    }
}
