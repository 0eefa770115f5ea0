//! Capture phase handlers: merging yielded returns upward.

use async_trait::async_trait;

use agentflow_core::{ObjectType, RuntimeError, StepDefinition};

use crate::context::EvalContext;
use crate::expr::{evaluate, Resolution, Scope};
use crate::handlers::{Outcome, StateHandler};

/// `StatementCaptureBegin`: for workflow steps, locate the completed yield
/// child and write its params (the yield arguments) as this step's return
/// attributes. Declared returns with default expressions fill any gaps, so
/// a workflow with an empty body still completes with its declared
/// returns.
pub(super) struct StatementCaptureBeginHandler;

#[async_trait]
impl StateHandler for StatementCaptureBeginHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        if step.object_type != ObjectType::Workflow {
            return Ok(Outcome::Advance);
        }

        let yielded = ctx.steps.values().find(|s| {
            s.object_type == ObjectType::YieldAssignment
                && s.root_id == Some(step.id)
                && s.is_complete()
        });

        if let Some(yielded) = yielded {
            for (name, attr) in &yielded.attributes.params {
                step.attributes.set_return(name, attr.value.clone());
            }
        }

        // Defaults for declared returns the yield did not supply.
        let siblings = ctx.sibling_scope(step.block_id);
        let scope = Scope::new(ctx.inputs, &siblings);
        for decl in &ctx.workflow.returns {
            if step.attributes.get_return(&decl.name).is_some() {
                continue;
            }
            if let Some(default) = &decl.default {
                if let Resolution::Value(value) = evaluate(default, &scope)? {
                    step.attributes.set_return(&decl.name, value);
                }
            }
        }

        Ok(Outcome::Advance)
    }
}
