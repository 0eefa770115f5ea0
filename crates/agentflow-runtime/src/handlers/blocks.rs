//! Block phase handlers: child creation and child observation.

use async_trait::async_trait;

use agentflow_core::{BlockDecl, ObjectType, RuntimeError, StatementDecl, StepDefinition};

use crate::context::EvalContext;
use crate::expr::Resolution;
use crate::handlers::init::{base_statement_id, eval_block_expr};
use crate::handlers::{Outcome, StateHandler};

/// `StatementBlocksBegin`: create one child block step per block of the
/// statement's body. Only workflow steps carry a body in this runtime.
pub(super) struct StatementBlocksBeginHandler;

#[async_trait]
impl StateHandler for StatementBlocksBeginHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        if step.object_type != ObjectType::Workflow {
            return Ok(Outcome::Advance);
        }

        let block = &ctx.workflow.body;
        if !ctx.statement_key_exists(&block.id, Some(step.id)) {
            let child = StepDefinition::create(
                step.workflow_id,
                block.kind.object_type(),
                "",
                Some(block.id.clone()),
                block.id.clone(),
                Some(step.id),
                Some(step.object_type),
                Some(step.id),
                Some(step.root_id.unwrap_or(step.id)),
            );
            ctx.changes.add_created_step(child);
        }
        Ok(Outcome::Advance)
    }
}

/// `BlockExecutionBegin`: materialize the block's statements as child
/// steps, idempotently. `AndMap` blocks expand one child set per element
/// of their foreach source; `AndMatch` blocks execute as plain blocks,
/// with ordinary data-dependency ordering among the children.
pub(super) struct BlockExecutionBeginHandler;

#[async_trait]
impl StateHandler for BlockExecutionBeginHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        let statement_id = step.statement_id.clone().unwrap_or_default();
        let block = ctx
            .ast
            .block(base_statement_id(&statement_id))
            .ok_or_else(|| {
                RuntimeError::UnknownFacet(format!("block '{statement_id}' not in program"))
            })?
            .clone();

        if step.object_type == ObjectType::AndMap {
            let Some(foreach) = block.foreach.clone() else {
                return Err(RuntimeError::UnresolvedReference(format!(
                    "AndMap block '{}' has no foreach binding",
                    block.id
                )));
            };
            let source = match eval_block_expr(ctx, step, &foreach.source)? {
                Resolution::Value(value) => value,
                Resolution::Pending(_) => return Ok(Outcome::stay()),
            };
            let Some(elements) = source.as_array().cloned() else {
                return Err(RuntimeError::TypeMismatch {
                    name: foreach.var.clone(),
                    expected: "List".to_string(),
                    actual: agentflow_core::TypeHint::infer(&source).to_string(),
                });
            };
            for (index, element) in elements.iter().enumerate() {
                create_children(ctx, step, &block, Some((index, foreach.var.as_str(), element)));
            }
        } else {
            create_children(ctx, step, &block, None);
        }
        Ok(Outcome::Advance)
    }
}

fn create_children(
    ctx: &mut EvalContext<'_>,
    block_step: &StepDefinition,
    block: &BlockDecl,
    binding: Option<(usize, &str, &serde_json::Value)>,
) {
    for statement in &block.statements {
        let statement_id = match binding {
            Some((index, _, _)) => format!("{}#{index}", statement.id()),
            None => statement.id().to_string(),
        };
        if ctx.statement_key_exists(&statement_id, Some(block_step.id)) {
            continue;
        }

        let (object_type, facet_name) = match statement {
            StatementDecl::Assignment { facet, .. } => {
                (ObjectType::VariableAssignment, facet.clone())
            }
            StatementDecl::Yield { .. } => {
                (ObjectType::YieldAssignment, ctx.workflow.name.clone())
            }
            StatementDecl::Schema { schema, .. } => {
                (ObjectType::SchemaInstantiation, schema.clone())
            }
        };

        let mut child = StepDefinition::create(
            block_step.workflow_id,
            object_type,
            facet_name,
            Some(statement_id),
            statement.name(),
            Some(block_step.id),
            Some(block_step.object_type),
            Some(block_step.id),
            block_step.root_id,
        );
        if let Some((_, var, value)) = binding {
            child.foreach_var = Some(var.to_string());
            child.foreach_value = Some(value.clone());
        }
        ctx.changes.add_created_step(child);
    }
}

/// `StatementBlocksContinue` / `BlockExecutionContinue`: observe children.
///
/// Advances when every child is terminal; fails when any child errored;
/// otherwise stays without re-queueing so scheduling is driven by the
/// children themselves.
pub(super) struct ChildObservationHandler;

#[async_trait]
impl StateHandler for ChildObservationHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        let children = ctx.children_of(step.id);

        if let Some(errored) = children.iter().find(|c| c.is_error()) {
            let detail = errored
                .error
                .clone()
                .unwrap_or_else(|| "unknown error".to_string());
            return Err(RuntimeError::Handler(format!(
                "child step '{}' errored: {detail}",
                errored.statement_name
            )));
        }

        if children.iter().all(|c| c.is_terminal()) {
            Ok(Outcome::Advance)
        } else {
            Ok(Outcome::stay())
        }
    }
}
