//! Step entity and transition control.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::states::{next_state, StepState};
use crate::types::{generate_id, FacetAttributes, ObjectType, VersionInfo};

/// In-memory transition control flags for a step.
///
/// These flags steer the evaluator within an iteration and are not part of
/// the step's persistent identity:
/// - `request_transition`: advance to the next state when transitions are
///   applied
/// - `push_me`: re-queue the step for continued processing in the same
///   iteration
/// - `changed`: the step was modified and must be written at commit
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTransition {
    #[serde(default)]
    pub request_transition: bool,
    #[serde(default)]
    pub push_me: bool,
    #[serde(default)]
    pub changed: bool,
}

impl StepTransition {
    /// Initial control state: a fresh step immediately requests its first
    /// transition.
    pub fn initial() -> Self {
        Self {
            request_transition: true,
            push_me: false,
            changed: true,
        }
    }

    pub fn reset_for_iteration(&mut self) {
        self.push_me = false;
    }

    /// Clear the write markers.
    ///
    /// A step loaded from the store is committed state by definition; the
    /// evaluator resets the markers on load so only steps touched in the
    /// current iteration are written back at the commit boundary.
    pub fn commit(&mut self) {
        self.changed = false;
        self.request_transition = false;
    }
}

/// A runtime step: the execution instance of exactly one statement or block.
///
/// At most one step exists per `(statement_id, block_id)` pair; this is the
/// idempotency key that makes re-entry safe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: Uuid,
    pub object_type: ObjectType,

    // Hierarchy
    pub workflow_id: Uuid,
    #[serde(default)]
    pub statement_id: Option<String>,
    #[serde(default)]
    pub statement_name: String,
    #[serde(default)]
    pub container_type: Option<ObjectType>,
    #[serde(default)]
    pub container_id: Option<Uuid>,
    #[serde(default)]
    pub block_id: Option<Uuid>,
    #[serde(default)]
    pub root_id: Option<Uuid>,

    // State machine
    pub state: StepState,
    #[serde(default)]
    pub transition: StepTransition,
    #[serde(default)]
    pub error: Option<String>,

    // Data
    #[serde(default)]
    pub facet_name: String,
    #[serde(default)]
    pub attributes: FacetAttributes,

    #[serde(default)]
    pub version: VersionInfo,

    // Foreach iteration binding
    #[serde(default)]
    pub foreach_var: Option<String>,
    #[serde(default)]
    pub foreach_value: Option<serde_json::Value>,

    pub start_time: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl StepDefinition {
    /// Create a new step in the `Created` state.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        workflow_id: Uuid,
        object_type: ObjectType,
        facet_name: impl Into<String>,
        statement_id: Option<String>,
        statement_name: impl Into<String>,
        container_id: Option<Uuid>,
        container_type: Option<ObjectType>,
        block_id: Option<Uuid>,
        root_id: Option<Uuid>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: generate_id(),
            object_type,
            workflow_id,
            statement_id,
            statement_name: statement_name.into(),
            container_type,
            container_id,
            block_id,
            root_id,
            state: StepState::Created,
            transition: StepTransition::initial(),
            error: None,
            facet_name: facet_name.into(),
            attributes: FacetAttributes::default(),
            version: VersionInfo::default(),
            foreach_var: None,
            foreach_value: None,
            start_time: now,
            last_modified: now,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.state.is_complete()
    }

    pub fn is_error(&self) -> bool {
        self.state.is_error()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_block(&self) -> bool {
        self.object_type.is_block()
    }

    pub fn is_statement(&self) -> bool {
        self.object_type.is_statement()
    }

    /// Move directly to a new state, marking the step changed.
    pub fn change_state(&mut self, new_state: StepState) {
        self.state = new_state;
        self.transition.changed = true;
        self.last_modified = Utc::now();
    }

    /// Request advancement to the next state on the next transition pass.
    pub fn request_state_change(&mut self, request: bool) {
        self.transition.request_transition = request;
        if request {
            self.transition.changed = true;
        }
    }

    /// Mark the step errored; terminal and absorbing.
    pub fn mark_error(&mut self, message: impl Into<String>) {
        self.state = StepState::StatementError;
        self.error = Some(message.into());
        self.transition.request_transition = false;
        self.transition.push_me = false;
        self.transition.changed = true;
        self.last_modified = Utc::now();
    }

    /// Mark the step completed; terminal and absorbing.
    pub fn mark_completed(&mut self) {
        self.state = StepState::StatementComplete;
        self.transition.request_transition = false;
        self.transition.changed = true;
        self.last_modified = Utc::now();
    }

    /// Next state per this step's transition table, `None` at terminal.
    pub fn next_state(&self) -> Option<StepState> {
        next_state(self.object_type, self.state)
    }

    /// Apply a requested transition. Returns true if the state advanced.
    pub fn apply_transition(&mut self) -> bool {
        if !self.transition.request_transition {
            return false;
        }
        match self.next_state() {
            Some(next) => {
                self.change_state(next);
                self.transition.request_transition = false;
                true
            }
            None => {
                self.transition.request_transition = false;
                false
            }
        }
    }

    /// Look up an attribute, preferring returns over params.
    pub fn get_attribute(&self, name: &str) -> Option<&serde_json::Value> {
        self.attributes
            .get_return(name)
            .or_else(|| self.attributes.get_param(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(object_type: ObjectType) -> StepDefinition {
        StepDefinition::create(
            generate_id(),
            object_type,
            "ns.Test",
            Some("stmt-1".to_string()),
            "s1",
            None,
            None,
            None,
            None,
        )
    }

    #[test]
    fn test_new_step_requests_first_transition() {
        let s = step(ObjectType::VariableAssignment);
        assert_eq!(s.state, StepState::Created);
        assert!(s.transition.request_transition);
    }

    #[test]
    fn test_apply_transition_advances() {
        let mut s = step(ObjectType::VariableAssignment);
        assert!(s.apply_transition());
        assert_eq!(s.state, StepState::FacetInitBegin);
        // Request flag is consumed
        assert!(!s.apply_transition());
    }

    #[test]
    fn test_transition_commit_clears_write_markers() {
        let mut s = step(ObjectType::VariableAssignment);
        assert!(s.transition.changed);
        assert!(s.transition.request_transition);

        s.transition.commit();
        assert!(!s.transition.changed);
        assert!(!s.transition.request_transition);

        // A later mutation marks the step dirty again
        s.request_state_change(true);
        assert!(s.transition.changed);
    }

    #[test]
    fn test_terminal_is_absorbing() {
        let mut s = step(ObjectType::VariableAssignment);
        s.mark_completed();
        s.request_state_change(true);
        assert!(!s.apply_transition());
        assert_eq!(s.state, StepState::StatementComplete);
    }

    #[test]
    fn test_mark_error_records_message() {
        let mut s = step(ObjectType::YieldAssignment);
        s.mark_error("unresolved reference: missing.attr");
        assert!(s.is_error());
        assert_eq!(
            s.error.as_deref(),
            Some("unresolved reference: missing.attr")
        );
    }

    #[test]
    fn test_get_attribute_prefers_returns() {
        let mut s = step(ObjectType::VariableAssignment);
        s.attributes.set_param("x", json!(1));
        s.attributes.set_return("x", json!(2));
        assert_eq!(s.get_attribute("x"), Some(&json!(2)));
    }

    #[test]
    fn test_block_step_uses_block_table() {
        let mut s = step(ObjectType::AndThen);
        assert!(s.apply_transition());
        assert_eq!(s.state, StepState::BlockExecutionBegin);
    }

    #[test]
    fn test_serde_round_trip() {
        let s = step(ObjectType::VariableAssignment);
        let json = serde_json::to_string(&s).unwrap();
        let back: StepDefinition = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
        assert!(json.contains("state.statement.Created"));
    }
}
