//! Persistent entities beyond the step: runners, tasks, events, servers,
//! flows, handler registrations, logs and locks.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ast::Program;
use crate::states::EventState;
use crate::types::{generate_id, AttributeValue, FacetAttributes};

/// Name of the task that starts a workflow execution.
pub const EXECUTE_TASK: &str = "afl:execute";
/// Name of the task that resumes a paused workflow.
pub const RESUME_TASK: &str = "afl:resume";
/// Default task routing channel.
pub const DEFAULT_TASK_LIST: &str = "default";
/// Reserved payload key carrying the facet name on domain tasks.
pub const FACET_NAME_KEY: &str = "_facet_name";

/// Lifecycle state of a runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerState {
    Created,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl RunnerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RunnerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One execution instance of one workflow.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunnerDefinition {
    pub uuid: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    #[serde(default)]
    pub flow_id: Option<Uuid>,
    #[serde(default)]
    pub inputs: BTreeMap<String, AttributeValue>,
    #[serde(default)]
    pub owner: Option<String>,
    pub state: RunnerState,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

impl RunnerDefinition {
    pub fn new(
        workflow_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: BTreeMap<String, AttributeValue>,
    ) -> Self {
        Self {
            uuid: generate_id(),
            workflow_id,
            workflow_name: workflow_name.into(),
            flow_id: None,
            inputs,
            owner: None,
            state: RunnerState::Created,
            start_time: Utc::now(),
            end_time: None,
            duration_ms: None,
        }
    }

    /// Move the runner to a terminal state and stamp the end time.
    pub fn finish(&mut self, state: RunnerState) {
        let now = Utc::now();
        self.state = state;
        self.end_time = Some(now);
        self.duration_ms = Some((now - self.start_time).num_milliseconds());
    }
}

/// State of a queued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Completed,
    Failed,
    Ignored,
    Cancelled,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Ignored => "ignored",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Error payload recorded on a failed task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskError {
    pub message: String,
}

/// An item in the work queue, claimable by exactly one agent at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub uuid: Uuid,
    /// Facet name, or `afl:execute` / `afl:resume` for runtime control.
    pub name: String,
    #[serde(default)]
    pub runner_id: Option<Uuid>,
    #[serde(default)]
    pub workflow_id: Option<Uuid>,
    #[serde(default)]
    pub flow_id: Option<Uuid>,
    #[serde(default)]
    pub step_id: Option<Uuid>,
    pub task_list_name: String,
    pub state: TaskState,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub error: Option<TaskError>,
    #[serde(default)]
    pub data_type: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl TaskDefinition {
    fn new(name: impl Into<String>, data: serde_json::Value) -> Self {
        let now = Utc::now();
        Self {
            uuid: generate_id(),
            name: name.into(),
            runner_id: None,
            workflow_id: None,
            flow_id: None,
            step_id: None,
            task_list_name: DEFAULT_TASK_LIST.to_string(),
            state: TaskState::Pending,
            created: now,
            updated: now,
            error: None,
            data_type: None,
            data,
        }
    }

    /// An `afl:execute` task: start a workflow from a published flow.
    pub fn execute(
        flow_id: Uuid,
        workflow_name: impl Into<String>,
        inputs: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let workflow_name = workflow_name.into();
        let mut task = Self::new(
            EXECUTE_TASK,
            serde_json::json!({
                "flow_id": flow_id,
                "workflow_name": workflow_name,
                "inputs": inputs,
            }),
        );
        task.flow_id = Some(flow_id);
        task
    }

    /// An `afl:resume` task: re-enter the evaluator for a paused workflow.
    pub fn resume(workflow_id: Uuid, runner_id: Uuid) -> Self {
        let mut task = Self::new(
            RESUME_TASK,
            serde_json::json!({ "workflow_id": workflow_id }),
        );
        task.workflow_id = Some(workflow_id);
        task.runner_id = Some(runner_id);
        task
    }

    /// A domain facet task: the step's params as a flat map plus the
    /// reserved `_facet_name` key.
    pub fn for_facet(
        facet_name: impl Into<String>,
        runner_id: Uuid,
        workflow_id: Uuid,
        step_id: Uuid,
        attributes: &FacetAttributes,
    ) -> Self {
        let facet_name = facet_name.into();
        let mut payload = attributes.params_map();
        payload.insert(
            FACET_NAME_KEY.to_string(),
            serde_json::Value::String(facet_name.clone()),
        );
        let mut task = Self::new(facet_name, serde_json::Value::Object(payload));
        task.runner_id = Some(runner_id);
        task.workflow_id = Some(workflow_id);
        task.step_id = Some(step_id);
        task
    }

    /// Is this a runtime-control task rather than a domain facet task?
    pub fn is_control(&self) -> bool {
        self.name == EXECUTE_TASK || self.name == RESUME_TASK
    }

    pub fn mark(&mut self, state: TaskState) {
        self.state = state;
        self.updated = Utc::now();
    }

    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(TaskError {
            message: message.into(),
        });
        self.mark(TaskState::Failed);
    }
}

/// A durable record of external dispatch for an event facet step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDefinition {
    pub uuid: Uuid,
    pub step_id: Uuid,
    pub workflow_id: Uuid,
    pub state: EventState,
    /// Facet name of the dispatching step.
    pub event_type: String,
    #[serde(default)]
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl EventDefinition {
    pub fn new(
        step_id: Uuid,
        workflow_id: Uuid,
        event_type: impl Into<String>,
        payload: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        Self {
            uuid: generate_id(),
            step_id,
            workflow_id,
            state: EventState::Created,
            event_type: event_type.into(),
            payload,
        }
    }

    /// Mark completed, recording the handler result in the payload.
    pub fn complete(&mut self, result: serde_json::Map<String, serde_json::Value>) {
        self.state = EventState::Completed;
        self.payload
            .insert("result".to_string(), serde_json::Value::Object(result));
    }

    /// Mark errored, recording the message in the payload.
    pub fn error(&mut self, message: impl Into<String>) {
        self.state = EventState::Error;
        self.payload.insert(
            "error".to_string(),
            serde_json::Value::String(message.into()),
        );
    }
}

/// Lifecycle state of a worker server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Startup,
    Running,
    Shutdown,
    Error,
}

/// A live worker process, registered for discovery and health tracking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerDefinition {
    pub uuid: Uuid,
    pub server_group: String,
    pub service_name: String,
    pub server_name: String,
    #[serde(default)]
    pub server_ips: Vec<String>,
    pub start_time: DateTime<Utc>,
    pub ping_time: DateTime<Utc>,
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub handlers: Vec<String>,
    #[serde(default)]
    pub handled: BTreeMap<String, u64>,
    pub state: ServerState,
}

impl ServerDefinition {
    /// A server whose ping has not advanced within the threshold is
    /// considered failed; other agents take over its facets.
    pub fn is_stale(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        now - self.ping_time > threshold
    }
}

/// Advertises that a handler can execute a facet. Registry-wide.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HandlerRegistration {
    /// Qualified facet name; primary key.
    pub facet_name: String,
    /// `file://`, `mvn:` or logical module URI.
    pub module_uri: String,
    #[serde(default)]
    pub entrypoint: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub checksum: String,
    pub timeout_ms: u64,
    #[serde(default)]
    pub requirements: Vec<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
}

impl HandlerRegistration {
    pub fn new(facet_name: impl Into<String>, module_uri: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            facet_name: facet_name.into(),
            module_uri: module_uri.into(),
            entrypoint: String::new(),
            version: "1.0.0".to_string(),
            checksum: String::new(),
            timeout_ms: 300_000,
            requirements: vec![],
            metadata: serde_json::Map::new(),
            created: now,
            updated: now,
        }
    }

    pub fn with_entrypoint(mut self, entrypoint: impl Into<String>) -> Self {
        self.entrypoint = entrypoint.into();
        self
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.timeout_ms = timeout_ms;
        self
    }
}

/// Metadata attached to a distributed lock.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LockMetaData {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub purpose: Option<String>,
}

/// A key-leased mutex for coarse cross-process coordination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockDefinition {
    pub key: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default)]
    pub meta: Option<LockMetaData>,
}

impl LockDefinition {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// Append-only runner-scoped diagnostic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogDefinition {
    pub uuid: Uuid,
    pub runner_id: Uuid,
    #[serde(default)]
    pub step_id: Option<Uuid>,
    pub order: i64,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl LogDefinition {
    pub fn new(runner_id: Uuid, order: i64, message: impl Into<String>) -> Self {
        Self {
            uuid: generate_id(),
            runner_id,
            step_id: None,
            order,
            message: message.into(),
            time: Utc::now(),
        }
    }
}

/// Append-only step-scoped diagnostic entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepLogEntry {
    pub uuid: Uuid,
    pub step_id: Uuid,
    pub workflow_id: Uuid,
    pub message: String,
    pub time: DateTime<Utc>,
}

impl StepLogEntry {
    pub fn new(step_id: Uuid, workflow_id: Uuid, message: impl Into<String>) -> Self {
        Self {
            uuid: generate_id(),
            step_id,
            workflow_id,
            message: message.into(),
            time: Utc::now(),
        }
    }
}

/// Original source text kept alongside the compiled program.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowSource {
    pub name: String,
    pub content: String,
}

/// A published, compiled program. Read-only after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlowDefinition {
    pub uuid: Uuid,
    pub name: String,
    #[serde(default)]
    pub path: String,
    /// The compiled program AST as an opaque JSON document.
    pub program: serde_json::Value,
    #[serde(default)]
    pub sources: Vec<FlowSource>,
}

impl FlowDefinition {
    pub fn new(name: impl Into<String>, program: &Program) -> Result<Self, serde_json::Error> {
        Ok(Self {
            uuid: generate_id(),
            name: name.into(),
            path: String::new(),
            program: serde_json::to_value(program)?,
            sources: vec![],
        })
    }

    /// Decode the stored AST document into the typed tree.
    pub fn decode_program(&self) -> Result<Program, serde_json::Error> {
        serde_json::from_value(self.program.clone())
    }
}

/// One top-level workflow definition inside a flow. Read-only after compile.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub uuid: Uuid,
    pub name: String,
    pub flow_id: Uuid,
}

impl WorkflowDefinition {
    pub fn new(name: impl Into<String>, flow_id: Uuid) -> Self {
        Self {
            uuid: generate_id(),
            name: name.into(),
            flow_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_runner_finish_stamps_duration() {
        let mut runner = RunnerDefinition::new(generate_id(), "Test", BTreeMap::new());
        assert_eq!(runner.state, RunnerState::Created);
        runner.finish(RunnerState::Completed);
        assert!(runner.state.is_terminal());
        assert!(runner.end_time.is_some());
        assert!(runner.duration_ms.unwrap() >= 0);
    }

    #[test]
    fn test_execute_task_payload() {
        let flow_id = generate_id();
        let mut inputs = serde_json::Map::new();
        inputs.insert("input".to_string(), json!(41));
        let task = TaskDefinition::execute(flow_id, "AddOneWorkflow", inputs);

        assert_eq!(task.name, EXECUTE_TASK);
        assert!(task.is_control());
        assert_eq!(task.state, TaskState::Pending);
        assert_eq!(task.data["workflow_name"], json!("AddOneWorkflow"));
        assert_eq!(task.data["inputs"]["input"], json!(41));
    }

    #[test]
    fn test_facet_task_carries_reserved_key() {
        let mut attrs = FacetAttributes::default();
        attrs.set_param("value", json!(41));
        let task = TaskDefinition::for_facet(
            "demo.AddOne",
            generate_id(),
            generate_id(),
            generate_id(),
            &attrs,
        );

        assert!(!task.is_control());
        assert_eq!(task.data[FACET_NAME_KEY], json!("demo.AddOne"));
        assert_eq!(task.data["value"], json!(41));
        assert!(task.step_id.is_some());
    }

    #[test]
    fn test_task_fail_records_error() {
        let mut task = TaskDefinition::resume(generate_id(), generate_id());
        task.fail("handler exploded");
        assert_eq!(task.state, TaskState::Failed);
        assert_eq!(task.error.as_ref().unwrap().message, "handler exploded");
    }

    #[test]
    fn test_event_complete_and_error() {
        let mut event = EventDefinition::new(
            generate_id(),
            generate_id(),
            "demo.AddOne",
            serde_json::Map::new(),
        );
        assert_eq!(event.state, EventState::Created);

        let mut result = serde_json::Map::new();
        result.insert("result".to_string(), json!(42));
        event.complete(result);
        assert_eq!(event.state, EventState::Completed);
        assert_eq!(event.payload["result"]["result"], json!(42));

        let mut errored = EventDefinition::new(
            generate_id(),
            generate_id(),
            "demo.AddOne",
            serde_json::Map::new(),
        );
        errored.error("boom");
        assert_eq!(errored.state, EventState::Error);
    }

    #[test]
    fn test_server_staleness() {
        let now = Utc::now();
        let server = ServerDefinition {
            uuid: generate_id(),
            server_group: "default".to_string(),
            service_name: "afl-agent".to_string(),
            server_name: "host-1".to_string(),
            server_ips: vec![],
            start_time: now - Duration::seconds(120),
            ping_time: now - Duration::seconds(45),
            topics: vec![],
            handlers: vec![],
            handled: BTreeMap::new(),
            state: ServerState::Running,
        };
        assert!(server.is_stale(now, Duration::seconds(30)));
        assert!(!server.is_stale(now, Duration::seconds(60)));
    }

    #[test]
    fn test_lock_expiry() {
        let now = Utc::now();
        let lock = LockDefinition {
            key: "runner:abc".to_string(),
            acquired_at: now,
            expires_at: now + Duration::seconds(30),
            meta: None,
        };
        assert!(!lock.is_expired(now));
        assert!(lock.is_expired(now + Duration::seconds(31)));
    }

    #[test]
    fn test_flow_program_round_trip() {
        let program = Program::default();
        let flow = FlowDefinition::new("demo", &program).unwrap();
        assert_eq!(flow.decode_program().unwrap(), program);
    }

    #[test]
    fn test_task_state_display() {
        assert_eq!(TaskState::Pending.to_string(), "pending");
        assert_eq!(TaskState::Ignored.to_string(), "ignored");
        assert_eq!(RunnerState::Failed.to_string(), "failed");
    }
}
