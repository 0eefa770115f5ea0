//! Evaluation context handed to state handlers.

use std::collections::{BTreeMap, HashMap, HashSet};

use uuid::Uuid;

use agentflow_core::{
    AttributeValue, BlockDecl, FacetTable, StatementDecl, StepDefinition, WorkflowDecl,
};
use agentflow_storage::IterationChanges;

use crate::dispatch::HandlerDispatcher;

/// Index from statement / block ids into the workflow AST.
pub struct AstIndex<'a> {
    statements: HashMap<&'a str, &'a StatementDecl>,
    blocks: HashMap<&'a str, &'a BlockDecl>,
}

impl<'a> AstIndex<'a> {
    pub fn build(workflow: &'a WorkflowDecl) -> Self {
        let mut index = Self {
            statements: HashMap::new(),
            blocks: HashMap::new(),
        };
        index.add_block(&workflow.body);
        index
    }

    fn add_block(&mut self, block: &'a BlockDecl) {
        self.blocks.insert(block.id.as_str(), block);
        for statement in &block.statements {
            self.statements.insert(statement.id(), statement);
        }
    }

    pub fn statement(&self, id: &str) -> Option<&'a StatementDecl> {
        self.statements.get(id).copied()
    }

    pub fn block(&self, id: &str) -> Option<&'a BlockDecl> {
        self.blocks.get(id).copied()
    }
}

/// Everything a state handler may see and touch.
///
/// The current step is threaded separately as an owned mutable value; the
/// context exposes the rest of the working set as a read-only snapshot and
/// collects new steps/events/tasks in the iteration changes accumulator.
pub struct EvalContext<'a> {
    pub runner_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow: &'a WorkflowDecl,
    pub facets: &'a FacetTable,
    pub ast: &'a AstIndex<'a>,
    /// The containing workflow's input parameters.
    pub inputs: &'a BTreeMap<String, AttributeValue>,
    /// Snapshot of all persisted steps of this workflow (sans the current).
    pub steps: &'a HashMap<Uuid, StepDefinition>,
    /// Step ids that already have a non-terminal event.
    pub active_events: &'a HashSet<Uuid>,
    pub changes: &'a mut IterationChanges,
    pub dispatcher: Option<&'a HandlerDispatcher>,
}

impl<'a> EvalContext<'a> {
    /// Sibling steps of a block, keyed by statement name.
    ///
    /// Includes steps created earlier in this iteration so fast-path
    /// references resolve within one pass.
    pub fn sibling_scope(&self, block_id: Option<Uuid>) -> HashMap<String, StepDefinition> {
        let mut scope = HashMap::new();
        for step in self.steps.values() {
            if step.block_id == block_id && step.is_statement() {
                scope.insert(step.statement_name.clone(), step.clone());
            }
        }
        for step in &self.changes.created_steps {
            if step.block_id == block_id && step.is_statement() {
                scope
                    .entry(step.statement_name.clone())
                    .or_insert_with(|| step.clone());
            }
        }
        scope
    }

    /// Child steps of a container, from the snapshot and this iteration's
    /// created steps.
    pub fn children_of(&self, container_id: Uuid) -> Vec<StepDefinition> {
        let mut children: Vec<StepDefinition> = self
            .steps
            .values()
            .filter(|s| s.container_id == Some(container_id))
            .cloned()
            .collect();
        for step in &self.changes.created_steps {
            if step.container_id == Some(container_id) && !children.iter().any(|c| c.id == step.id)
            {
                children.push(step.clone());
            }
        }
        children.sort_by(|a, b| (a.start_time, a.id).cmp(&(b.start_time, b.id)));
        children
    }

    /// Idempotency probe over the snapshot plus this iteration's creations.
    pub fn statement_key_exists(&self, statement_id: &str, block_id: Option<Uuid>) -> bool {
        let hit = |s: &StepDefinition| {
            s.statement_id.as_deref() == Some(statement_id) && s.block_id == block_id
        };
        self.steps.values().any(hit) || self.changes.created_steps.iter().any(hit)
    }
}
