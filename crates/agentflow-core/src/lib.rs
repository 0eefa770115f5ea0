//! # AgentFlow Core
//!
//! Shared model for the AgentFlow runtime: the typed program AST, the step
//! entity with its four transition tables, and the persistent entities of
//! the queue/runner protocol (tasks, events, runners, servers, handler
//! registrations, locks, logs).
//!
//! This crate holds no I/O; persistence lives behind the port trait in
//! `agentflow-storage` and execution in `agentflow-runtime`.

pub mod ast;
pub mod entities;
pub mod error;
pub mod states;
pub mod step;
pub mod types;

pub use ast::{
    Argument, AttributeDecl, BlockDecl, BlockKind, Expr, FacetDecl, FacetSig, FacetTable,
    ForeachBinding, Namespace, Program, StatementDecl, WorkflowDecl,
};
pub use entities::{
    EventDefinition, FlowDefinition, FlowSource, HandlerRegistration, LockDefinition,
    LockMetaData, LogDefinition, RunnerDefinition, RunnerState, ServerDefinition, ServerState,
    StepLogEntry, TaskDefinition, TaskError, TaskState, WorkflowDefinition, DEFAULT_TASK_LIST,
    EXECUTE_TASK, FACET_NAME_KEY, RESUME_TASK,
};
pub use error::RuntimeError;
pub use states::{next_state, EventState, StepState};
pub use step::{StepDefinition, StepTransition};
pub use types::{
    generate_id, AttributeValue, FacetAttributes, ObjectType, TypeHint, VersionInfo,
};
