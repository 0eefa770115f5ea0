//! Per-state step handlers.
//!
//! Each state of the step machines has exactly one handler. Handlers are
//! values behind a small trait; selection is a match over the step's
//! current state. A handler may mutate the step, append created steps,
//! events and tasks to the iteration changes, and steer scheduling through
//! its outcome.

use async_trait::async_trait;

use agentflow_core::{RuntimeError, StepDefinition, StepState};

use crate::context::EvalContext;

mod blocks;
mod capture;
mod completion;
mod init;

/// Scheduling outcome of one handler invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Request transition to the next state.
    Advance,
    /// Remain in the current state. With `push` set the step is re-queued
    /// for continued processing within the same iteration.
    Stay { push: bool },
}

impl Outcome {
    pub fn stay() -> Self {
        Self::Stay { push: false }
    }

    pub fn push() -> Self {
        Self::Stay { push: true }
    }
}

/// One state's processing logic.
///
/// Handlers must be pure with respect to (step, sibling snapshot, facet
/// table); failures are returned, never panicked, and mark the step
/// errored without crashing the evaluator.
#[async_trait]
pub trait StateHandler: Send + Sync {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError>;
}

/// Structural states with no work of their own advance unconditionally.
///
/// The script and mixin phases are retained in the statement table so
/// persisted histories line up with the full language; this runtime
/// carries no script or mixin declarations through them.
struct PassThroughHandler;

#[async_trait]
impl StateHandler for PassThroughHandler {
    async fn process(
        &self,
        _ctx: &mut EvalContext<'_>,
        _step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        Ok(Outcome::Advance)
    }
}

static PASS_THROUGH: PassThroughHandler = PassThroughHandler;
static CREATED: init::CreatedHandler = init::CreatedHandler;
static FACET_INIT_BEGIN: init::FacetInitBeginHandler = init::FacetInitBeginHandler;
static EVENT_TRANSMIT: completion::EventTransmitHandler = completion::EventTransmitHandler;
static STATEMENT_BLOCKS_BEGIN: blocks::StatementBlocksBeginHandler =
    blocks::StatementBlocksBeginHandler;
static STATEMENT_BLOCKS_CONTINUE: blocks::ChildObservationHandler =
    blocks::ChildObservationHandler;
static BLOCK_EXECUTION_BEGIN: blocks::BlockExecutionBeginHandler =
    blocks::BlockExecutionBeginHandler;
static BLOCK_EXECUTION_CONTINUE: blocks::ChildObservationHandler =
    blocks::ChildObservationHandler;
static STATEMENT_CAPTURE_BEGIN: capture::StatementCaptureBeginHandler =
    capture::StatementCaptureBeginHandler;
static STATEMENT_COMPLETE: completion::StatementCompleteHandler =
    completion::StatementCompleteHandler;

/// Select the handler for a step's current state.
pub fn handler_for(state: StepState) -> &'static dyn StateHandler {
    use StepState::*;
    match state {
        Created => &CREATED,
        FacetInitBegin => &FACET_INIT_BEGIN,
        EventTransmit => &EVENT_TRANSMIT,
        StatementBlocksBegin => &STATEMENT_BLOCKS_BEGIN,
        StatementBlocksContinue => &STATEMENT_BLOCKS_CONTINUE,
        BlockExecutionBegin => &BLOCK_EXECUTION_BEGIN,
        BlockExecutionContinue => &BLOCK_EXECUTION_CONTINUE,
        StatementCaptureBegin => &STATEMENT_CAPTURE_BEGIN,
        StatementComplete | StatementError => &STATEMENT_COMPLETE,
        // FacetInitEnd, the script/mixin phases, blocks/capture End states
        // and StatementEnd carry no logic of their own.
        _ => &PASS_THROUGH,
    }
}
