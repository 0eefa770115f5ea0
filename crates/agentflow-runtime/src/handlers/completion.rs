//! Completion phase handlers: event transmission and terminal states.

use async_trait::async_trait;
use tracing::debug;

use agentflow_core::{EventDefinition, RuntimeError, StepDefinition, TaskDefinition};

use crate::context::EvalContext;
use crate::handlers::{Outcome, StateHandler};

/// `EventTransmit`: the heart of the external-dispatch protocol.
///
/// Non-event facets pass through. For event facets, an inline dispatcher
/// gets first refusal; otherwise a durable event and a queue task are
/// appended to the iteration changes and the step BLOCKS here until
/// `continue_step` supplies its returns.
pub(super) struct EventTransmitHandler;

#[async_trait]
impl StateHandler for EventTransmitHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        let is_event = ctx
            .facets
            .get(&step.facet_name)
            .map(|sig| sig.event)
            .unwrap_or(false);
        if !is_event {
            return Ok(Outcome::Advance);
        }

        // Returns already supplied (continue_step raced the iteration):
        // nothing left to dispatch.
        if !step.attributes.returns.is_empty() {
            return Ok(Outcome::Advance);
        }

        if let Some(dispatcher) = ctx.dispatcher {
            if dispatcher.can_dispatch(&step.facet_name) {
                let payload = step.attributes.params_map();
                let result = dispatcher.dispatch(&step.facet_name, &payload).await?;
                for (name, value) in result {
                    step.attributes.set_return(name, value);
                }
                debug!(step_id = %step.id, facet = %step.facet_name, "inline dispatch");
                return Ok(Outcome::Advance);
            }
        }

        // Already dispatched on an earlier iteration: keep waiting.
        if ctx.active_events.contains(&step.id)
            || ctx
                .changes
                .created_events
                .iter()
                .any(|e| e.step_id == step.id)
        {
            return Ok(Outcome::stay());
        }

        let payload = step.attributes.params_map();
        let event = EventDefinition::new(
            step.id,
            step.workflow_id,
            step.facet_name.clone(),
            payload,
        );
        let task = TaskDefinition::for_facet(
            step.facet_name.clone(),
            ctx.runner_id,
            step.workflow_id,
            step.id,
            &step.attributes,
        );
        debug!(
            step_id = %step.id,
            facet = %step.facet_name,
            task_id = %task.uuid,
            "event dispatched to task queue"
        );
        ctx.changes.add_created_event(event);
        ctx.changes.add_created_task(task);

        // Block: no advancement until continue_step() is called externally.
        Ok(Outcome::stay())
    }
}

/// `StatementComplete`: terminal. The containing block observes this on
/// its next pass; no explicit container notification is needed.
pub(super) struct StatementCompleteHandler;

#[async_trait]
impl StateHandler for StatementCompleteHandler {
    async fn process(
        &self,
        _ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        if !step.is_terminal() {
            step.mark_completed();
        }
        Ok(Outcome::stay())
    }
}
