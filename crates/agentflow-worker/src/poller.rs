//! The agent poller daemon.
//!
//! Polls the task queue for domain facet tasks on behalf of registered
//! handlers: in-process handlers from the dispatcher and artifact-backed
//! handlers from the registry (filtered by glob topic patterns). Claims
//! atomically, executes on a semaphore-bounded worker pool, writes
//! returns through `continue_step`, and marks tasks.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{watch, Mutex, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use agentflow_core::{
    generate_id, HandlerRegistration, RuntimeError, ServerDefinition, ServerState,
    TaskDefinition, TaskState, FACET_NAME_KEY,
};
use agentflow_runtime::{Evaluator, HandlerDispatcher, PayloadMap};
use agentflow_storage::PersistenceStore;

use crate::artifact::ArtifactExecutor;
use crate::config::{AgentPollerConfig, ArtifactConfig};
use crate::error::WorkerError;

/// Simple glob match supporting `*` and `?`, for topic patterns.
pub(crate) fn matches_glob(pattern: &str, name: &str) -> bool {
    fn inner(p: &[u8], n: &[u8]) -> bool {
        match (p.first(), n.first()) {
            (None, None) => true,
            (Some(b'*'), _) => {
                inner(&p[1..], n) || (!n.is_empty() && inner(p, &n[1..]))
            }
            (Some(b'?'), Some(_)) => inner(&p[1..], &n[1..]),
            (Some(a), Some(b)) if a == b => inner(&p[1..], &n[1..]),
            _ => false,
        }
    }
    inner(pattern.as_bytes(), name.as_bytes())
}

struct RegistryState {
    registrations: HashMap<String, HandlerRegistration>,
    last_refresh: Option<tokio::time::Instant>,
}

/// Daemon that claims and executes domain facet tasks.
pub struct AgentPoller {
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<Evaluator>,
    dispatcher: Arc<HandlerDispatcher>,
    artifacts: Arc<ArtifactExecutor>,
    config: AgentPollerConfig,
    server_id: Uuid,
    registry: Mutex<RegistryState>,
    permits: Arc<Semaphore>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl AgentPoller {
    pub fn new(
        store: Arc<dyn PersistenceStore>,
        dispatcher: Arc<HandlerDispatcher>,
        config: AgentPollerConfig,
    ) -> Self {
        Self::with_artifacts(store, dispatcher, config, ArtifactConfig::default())
    }

    pub fn with_artifacts(
        store: Arc<dyn PersistenceStore>,
        dispatcher: Arc<HandlerDispatcher>,
        config: AgentPollerConfig,
        artifact_config: ArtifactConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let permits = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            store: Arc::clone(&store),
            evaluator: Arc::new(Evaluator::new(store)),
            dispatcher,
            artifacts: Arc::new(ArtifactExecutor::new(artifact_config)),
            config,
            server_id: generate_id(),
            registry: Mutex::new(RegistryState {
                registrations: HashMap::new(),
                last_refresh: None,
            }),
            permits,
            shutdown_tx,
            shutdown_rx,
        }
    }

    pub fn server_id(&self) -> Uuid {
        self.server_id
    }

    /// Register an artifact-backed handler in the shared registry.
    pub async fn register_artifact_handler(
        &self,
        registration: HandlerRegistration,
    ) -> Result<(), WorkerError> {
        if !ArtifactExecutor::supports(&registration.module_uri) {
            return Err(WorkerError::Runtime(RuntimeError::Resolution(format!(
                "unsupported module URI scheme: {}",
                registration.module_uri
            ))));
        }
        self.store.save_handler_registration(&registration).await?;
        self.refresh_registry().await?;
        Ok(())
    }

    /// Facet names this agent serves: in-process handlers plus registry
    /// registrations passing the topic filter.
    pub async fn registered_names(&self) -> Vec<String> {
        let mut names = self.dispatcher.facet_names();
        let registry = self.registry.lock().await;
        for name in registry.registrations.keys() {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names.sort();
        names
    }

    fn matches_topics(&self, facet_name: &str) -> bool {
        self.config.topics.is_empty()
            || self
                .config
                .topics
                .iter()
                .any(|pattern| matches_glob(pattern, facet_name))
    }

    /// Reload handler registrations from persistence.
    pub async fn refresh_registry(&self) -> Result<(), WorkerError> {
        let registrations = self.store.list_handler_registrations().await?;
        let mut registry = self.registry.lock().await;
        registry.registrations = registrations
            .into_iter()
            .filter(|r| self.matches_topics(&r.facet_name))
            .map(|r| (r.facet_name.clone(), r))
            .collect();
        registry.last_refresh = Some(tokio::time::Instant::now());
        debug!(count = registry.registrations.len(), "registry refreshed");
        Ok(())
    }

    async fn maybe_refresh_registry(&self) {
        let due = {
            let registry = self.registry.lock().await;
            match registry.last_refresh {
                None => true,
                Some(at) => at.elapsed() >= self.config.registry_refresh_interval,
            }
        };
        if due {
            if let Err(e) = self.refresh_registry().await {
                // Registry refresh failures never terminate the poller.
                warn!(error = %e, "registry refresh failed");
            }
        }
    }

    /// Run until shutdown: register, heartbeat, poll with a worker pool.
    pub async fn start(&self) -> Result<(), WorkerError> {
        self.refresh_registry().await?;
        self.register_server().await?;
        let handlers = self.registered_names().await;
        info!(
            server_id = %self.server_id,
            handlers = ?handlers,
            "agent poller started"
        );

        let heartbeat = self.spawn_heartbeat();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.poll_cycle().await;
                }
            }
        }

        // Drain: wait for in-flight handlers before deregistering.
        let _ = self
            .permits
            .acquire_many(self.config.max_concurrent as u32)
            .await;
        heartbeat.abort();
        self.deregister_server().await;
        info!(server_id = %self.server_id, "agent poller stopped");
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// One synchronous poll cycle (for tests): claims up to the available
    /// capacity and processes tasks inline. Returns the number processed.
    pub async fn poll_once(&self) -> Result<usize, WorkerError> {
        self.maybe_refresh_registry().await;
        let names = self.registered_names().await;
        if names.is_empty() {
            return Ok(0);
        }

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

    /// One pooled poll cycle: claimed tasks run as spawned workers bounded
    /// by the concurrency semaphore.
    async fn poll_cycle(&self) {
        self.maybe_refresh_registry().await;
        let names = self.registered_names().await;
        if names.is_empty() {
            return;
        }

        loop {
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                break;
            };
            let task = match self.store.claim_task(&names, &self.config.task_list).await {
                Ok(Some(task)) => task,
                Ok(None) => break,
                Err(e) => {
                    // Claim failures are logged and retried next poll.
                    error!(error = %e, "claim failed");
                    break;
                }
            };

            let store = Arc::clone(&self.store);
            let evaluator = Arc::clone(&self.evaluator);
            let dispatcher = Arc::clone(&self.dispatcher);
            let artifacts = Arc::clone(&self.artifacts);
            let registration = {
                let registry = self.registry.lock().await;
                registry.registrations.get(&task.name).cloned()
            };
            tokio::spawn(async move {
                run_task(store, evaluator, dispatcher, artifacts, registration, task).await;
                drop(permit);
            });
        }
    }

    async fn process_task(&self, task: TaskDefinition) {
        let registration = {
            let registry = self.registry.lock().await;
            registry.registrations.get(&task.name).cloned()
        };
        run_task(
            Arc::clone(&self.store),
            Arc::clone(&self.evaluator),
            Arc::clone(&self.dispatcher),
            Arc::clone(&self.artifacts),
            registration,
            task,
        )
        .await;
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
            topics: self.config.topics.clone(),
            handlers: self.registered_names().await,
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
                            // Heartbeat failures are logged; the poller continues.
                            error!(error = %e, "heartbeat failed");
                        }
                    }
                    _ = shutdown_rx.changed() => break,
                }
            }
        })
    }
}

/// Execute one claimed task end to end and record the outcome.
#[instrument(skip_all, fields(task_id = %task.uuid, facet = %task.name))]
async fn run_task(
    store: Arc<dyn PersistenceStore>,
    evaluator: Arc<Evaluator>,
    dispatcher: Arc<HandlerDispatcher>,
    artifacts: Arc<ArtifactExecutor>,
    registration: Option<HandlerRegistration>,
    mut task: TaskDefinition,
) {
    let Some(step_id) = task.step_id else {
        task.fail("task has no step reference");
        if let Err(e) = store.save_task(&task).await {
            error!(error = %e, "failed to save task");
        }
        return;
    };

    let payload = build_payload(&task);
    let result = execute_handler(
        &store,
        &evaluator,
        &dispatcher,
        &artifacts,
        registration.as_ref(),
        &task.name,
        step_id,
        &payload,
    )
    .await;

    match result {
        Ok(()) => {
            task.mark(TaskState::Completed);
            info!("task completed");
        }
        Err(e) => {
            warn!(error = %e, "task failed");
            if let Err(fail_err) = evaluator.fail_step(step_id, e.to_string()).await {
                error!(error = %fail_err, "failed to mark step errored");
            }
            task.fail(e.to_string());
        }
    }
    if let Err(e) = store.save_task(&task).await {
        error!(error = %e, "failed to save task state");
    }
}

/// The handler resolution order: in-process dispatch table first, then an
/// artifact-backed registration, otherwise the facet has no handler.
#[allow(clippy::too_many_arguments)]
async fn execute_handler(
    store: &Arc<dyn PersistenceStore>,
    evaluator: &Evaluator,
    dispatcher: &HandlerDispatcher,
    artifacts: &ArtifactExecutor,
    registration: Option<&HandlerRegistration>,
    facet_name: &str,
    step_id: Uuid,
    payload: &PayloadMap,
) -> Result<(), RuntimeError> {
    if dispatcher.can_dispatch(facet_name) {
        let returns = dispatcher.dispatch(facet_name, payload).await?;
        return evaluator.continue_step(step_id, returns).await;
    }

    if let Some(registration) = registration {
        if ArtifactExecutor::supports(&registration.module_uri) {
            artifacts.execute(registration, step_id).await?;
            // The subprocess wrote its returns through the persistence
            // API; read them back and perform the transition here.
            let returns = read_step_returns(store, step_id).await?;
            return evaluator.continue_step(step_id, returns).await;
        }
    }

    Err(RuntimeError::HandlerNotFound(facet_name.to_string()))
}

/// A domain task's payload is its data map minus the reserved facet key.
fn build_payload(task: &TaskDefinition) -> PayloadMap {
    let mut payload = task.data.as_object().cloned().unwrap_or_default();
    payload.remove(FACET_NAME_KEY);
    payload
}

async fn read_step_returns(
    store: &Arc<dyn PersistenceStore>,
    step_id: Uuid,
) -> Result<PayloadMap, RuntimeError> {
    let step = store
        .get_step(step_id)
        .await
        .map_err(|e| RuntimeError::Persistence(e.to_string()))?
        .ok_or_else(|| RuntimeError::Persistence(format!("step not found: {step_id}")))?;
    Ok(step.attributes.returns_map())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glob_matching() {
        assert!(matches_glob("demo.*", "demo.AddOne"));
        assert!(matches_glob("*", "anything.at.all"));
        assert!(matches_glob("demo.Add?ne", "demo.AddOne"));
        assert!(!matches_glob("demo.*", "other.AddOne"));
        assert!(matches_glob("demo.AddOne", "demo.AddOne"));
        assert!(!matches_glob("demo.AddOne", "demo.AddOneMore"));
        assert!(matches_glob("*.AddOne", "demo.AddOne"));
    }

    #[test]
    fn test_build_payload_strips_reserved_key() {
        let task = TaskDefinition::for_facet(
            "demo.AddOne",
            generate_id(),
            generate_id(),
            generate_id(),
            &{
                let mut attrs = agentflow_core::FacetAttributes::default();
                attrs.set_param("value", serde_json::json!(41));
                attrs
            },
        );
        let payload = build_payload(&task);
        assert_eq!(payload.get("value"), Some(&serde_json::json!(41)));
        assert!(!payload.contains_key(FACET_NAME_KEY));
    }
}
