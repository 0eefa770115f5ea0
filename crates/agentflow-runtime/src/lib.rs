//! # AgentFlow Runtime
//!
//! The execution core: the evaluator that drives a runner through durable
//! iterations, the per-state handlers, argument expression evaluation, and
//! the handler dispatch contract.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Evaluator                            │
//! │  (working set → state handlers → transitions → commit)      │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     PersistenceStore                        │
//! │  (steps, events, task queue, runners, locks)                │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Blocking at `EventTransmit` is persisted continuation, not async/await:
//! the step's state is its own continuation point, and `continue_step`
//! plus a follow-up `afl:resume` task re-enter the loop.

pub mod context;
pub mod dispatch;
pub mod evaluator;
pub mod expr;
pub mod handlers;

pub use context::{AstIndex, EvalContext};
pub use dispatch::{FacetHandler, HandlerDispatcher, PayloadMap};
pub use evaluator::{Evaluator, EvaluatorConfig, ExecutionStatus};
pub use expr::{check_type, evaluate, Resolution, Scope};
pub use handlers::{handler_for, Outcome, StateHandler};
