//! Step and event state machines.
//!
//! Four transition tables drive step execution, selected by the step's
//! object type:
//! - statement table: the full machine for `VariableAssignment` and
//!   `Workflow` steps
//! - block table: `AndThen` / `AndMap` / `AndMatch` / `Block` steps
//! - yield table: `YieldAssignment` steps (skips the block phases)
//! - schema table: `SchemaInstantiation` steps
//!
//! `Complete` and `Error` are absorbing; `Error` is reachable from every
//! state through an explicit error transition.

use serde::{Deserialize, Serialize};

use crate::types::ObjectType;

/// Execution state of a step.
///
/// Serialized as the hierarchical dotted names carried in persistence
/// (e.g. `state.facet.initialization.Begin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StepState {
    #[serde(rename = "state.statement.Created")]
    Created,

    #[serde(rename = "state.facet.initialization.Begin")]
    FacetInitBegin,
    #[serde(rename = "state.facet.initialization.End")]
    FacetInitEnd,

    #[serde(rename = "state.facet.scripts.Begin")]
    FacetScriptsBegin,
    #[serde(rename = "state.facet.scripts.End")]
    FacetScriptsEnd,

    #[serde(rename = "state.mixin.blocks.Begin")]
    MixinBlocksBegin,
    #[serde(rename = "state.mixin.blocks.Continue")]
    MixinBlocksContinue,
    #[serde(rename = "state.mixin.blocks.End")]
    MixinBlocksEnd,

    #[serde(rename = "state.mixin.capture.Begin")]
    MixinCaptureBegin,
    #[serde(rename = "state.mixin.capture.End")]
    MixinCaptureEnd,

    #[serde(rename = "state.EventTransmit")]
    EventTransmit,

    #[serde(rename = "state.statement.blocks.Begin")]
    StatementBlocksBegin,
    #[serde(rename = "state.statement.blocks.Continue")]
    StatementBlocksContinue,
    #[serde(rename = "state.statement.blocks.End")]
    StatementBlocksEnd,

    #[serde(rename = "state.block.execution.Begin")]
    BlockExecutionBegin,
    #[serde(rename = "state.block.execution.Continue")]
    BlockExecutionContinue,
    #[serde(rename = "state.block.execution.End")]
    BlockExecutionEnd,

    #[serde(rename = "state.statement.capture.Begin")]
    StatementCaptureBegin,
    #[serde(rename = "state.statement.capture.End")]
    StatementCaptureEnd,

    #[serde(rename = "state.statement.End")]
    StatementEnd,
    #[serde(rename = "state.statement.Complete")]
    StatementComplete,
    #[serde(rename = "state.statement.Error")]
    StatementError,
}

impl StepState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StatementComplete | Self::StatementError)
    }

    pub fn is_complete(&self) -> bool {
        *self == Self::StatementComplete
    }

    pub fn is_error(&self) -> bool {
        *self == Self::StatementError
    }

    /// The dotted wire name of this state.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "state.statement.Created",
            Self::FacetInitBegin => "state.facet.initialization.Begin",
            Self::FacetInitEnd => "state.facet.initialization.End",
            Self::FacetScriptsBegin => "state.facet.scripts.Begin",
            Self::FacetScriptsEnd => "state.facet.scripts.End",
            Self::MixinBlocksBegin => "state.mixin.blocks.Begin",
            Self::MixinBlocksContinue => "state.mixin.blocks.Continue",
            Self::MixinBlocksEnd => "state.mixin.blocks.End",
            Self::MixinCaptureBegin => "state.mixin.capture.Begin",
            Self::MixinCaptureEnd => "state.mixin.capture.End",
            Self::EventTransmit => "state.EventTransmit",
            Self::StatementBlocksBegin => "state.statement.blocks.Begin",
            Self::StatementBlocksContinue => "state.statement.blocks.Continue",
            Self::StatementBlocksEnd => "state.statement.blocks.End",
            Self::BlockExecutionBegin => "state.block.execution.Begin",
            Self::BlockExecutionContinue => "state.block.execution.Continue",
            Self::BlockExecutionEnd => "state.block.execution.End",
            Self::StatementCaptureBegin => "state.statement.capture.Begin",
            Self::StatementCaptureEnd => "state.statement.capture.End",
            Self::StatementEnd => "state.statement.End",
            Self::StatementComplete => "state.statement.Complete",
            Self::StatementError => "state.statement.Error",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for StepState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("unknown step state: {s}"))
    }
}

/// Full transition table for statement steps (VariableAssignment, Workflow).
fn next_statement_state(state: StepState) -> Option<StepState> {
    use StepState::*;
    match state {
        Created => Some(FacetInitBegin),
        FacetInitBegin => Some(FacetInitEnd),
        FacetInitEnd => Some(FacetScriptsBegin),
        FacetScriptsBegin => Some(FacetScriptsEnd),
        FacetScriptsEnd => Some(MixinBlocksBegin),
        MixinBlocksBegin => Some(MixinBlocksContinue),
        MixinBlocksContinue => Some(MixinBlocksEnd),
        MixinBlocksEnd => Some(MixinCaptureBegin),
        MixinCaptureBegin => Some(MixinCaptureEnd),
        MixinCaptureEnd => Some(EventTransmit),
        EventTransmit => Some(StatementBlocksBegin),
        StatementBlocksBegin => Some(StatementBlocksContinue),
        StatementBlocksContinue => Some(StatementBlocksEnd),
        StatementBlocksEnd => Some(StatementCaptureBegin),
        StatementCaptureBegin => Some(StatementCaptureEnd),
        StatementCaptureEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Simplified table for block steps.
fn next_block_state(state: StepState) -> Option<StepState> {
    use StepState::*;
    match state {
        Created => Some(BlockExecutionBegin),
        BlockExecutionBegin => Some(BlockExecutionContinue),
        BlockExecutionContinue => Some(BlockExecutionEnd),
        BlockExecutionEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Minimal table for yield steps: skips the block phases.
fn next_yield_state(state: StepState) -> Option<StepState> {
    use StepState::*;
    match state {
        Created => Some(FacetInitBegin),
        FacetInitBegin => Some(FacetInitEnd),
        FacetInitEnd => Some(FacetScriptsBegin),
        FacetScriptsBegin => Some(FacetScriptsEnd),
        FacetScriptsEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Table for schema instantiation: evaluate arguments, then finish.
fn next_schema_state(state: StepState) -> Option<StepState> {
    use StepState::*;
    match state {
        Created => Some(FacetInitBegin),
        FacetInitBegin => Some(FacetInitEnd),
        FacetInitEnd => Some(StatementEnd),
        StatementEnd => Some(StatementComplete),
        _ => None,
    }
}

/// Select the next state for a step given its object type.
///
/// Returns `None` at terminal states.
pub fn next_state(object_type: ObjectType, state: StepState) -> Option<StepState> {
    match object_type {
        ObjectType::YieldAssignment => next_yield_state(state),
        ObjectType::SchemaInstantiation => next_schema_state(state),
        t if t.is_block() => next_block_state(state),
        _ => next_statement_state(state),
    }
}

/// Lifecycle state of a dispatched event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventState {
    #[serde(rename = "event.Created")]
    Created,
    #[serde(rename = "event.Dispatched")]
    Dispatched,
    #[serde(rename = "event.Processing")]
    Processing,
    #[serde(rename = "event.Completed")]
    Completed,
    #[serde(rename = "event.Error")]
    Error,
}

impl EventState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }

    /// Next state along the happy path, `None` at terminal states.
    pub fn next(&self) -> Option<EventState> {
        match self {
            Self::Created => Some(Self::Dispatched),
            Self::Dispatched => Some(Self::Processing),
            Self::Processing => Some(Self::Completed),
            Self::Completed | Self::Error => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "event.Created",
            Self::Dispatched => "event.Dispatched",
            Self::Processing => "event.Processing",
            Self::Completed => "event.Completed",
            Self::Error => "event.Error",
        }
    }
}

impl std::fmt::Display for EventState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
