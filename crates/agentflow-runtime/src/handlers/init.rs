//! Initialization phase handlers.
//!
//! `FacetInitBegin` is where arguments are evaluated: the facet definition
//! is resolved from the program, each argument expression is evaluated in
//! the ambient scope, and the results land in the step's params. A
//! reference to a sibling that has not completed yet parks the step in
//! this state until a later iteration.

use async_trait::async_trait;

use agentflow_core::{
    AttributeDecl, Expr, ObjectType, RuntimeError, StatementDecl, StepDefinition, TypeHint,
};

use crate::context::EvalContext;
use crate::expr::{check_type, evaluate, Resolution, Scope};
use crate::handlers::{Outcome, StateHandler};

pub(super) struct CreatedHandler;

#[async_trait]
impl StateHandler for CreatedHandler {
    async fn process(
        &self,
        _ctx: &mut EvalContext<'_>,
        _step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        Ok(Outcome::Advance)
    }
}

pub(super) struct FacetInitBeginHandler;

#[async_trait]
impl StateHandler for FacetInitBeginHandler {
    async fn process(
        &self,
        ctx: &mut EvalContext<'_>,
        step: &mut StepDefinition,
    ) -> Result<Outcome, RuntimeError> {
        match step.object_type {
            ObjectType::Workflow => init_workflow_root(ctx, step),
            ObjectType::YieldAssignment => init_yield(ctx, step),
            ObjectType::SchemaInstantiation => init_schema(ctx, step),
            _ => init_statement(ctx, step),
        }
    }
}

/// Root step: inputs were supplied by the execute task; validate them
/// against the workflow's declared params and write them as step params.
fn init_workflow_root(
    ctx: &mut EvalContext<'_>,
    step: &mut StepDefinition,
) -> Result<Outcome, RuntimeError> {
    let sig = ctx
        .facets
        .get(&step.facet_name)
        .ok_or_else(|| RuntimeError::UnknownFacet(step.facet_name.clone()))?;
    step.facet_name = sig.qualified_name.clone();

    for decl in &ctx.workflow.params {
        match ctx.inputs.get(&decl.name) {
            Some(attr) => {
                check_type(&decl.name, &attr.value, decl.type_hint)?;
                step.attributes
                    .set_param_hinted(&decl.name, attr.value.clone(), decl.type_hint);
            }
            None => {
                let value = eval_default(ctx, step, decl)?;
                match value {
                    Some(v) => step
                        .attributes
                        .set_param_hinted(&decl.name, v, decl.type_hint),
                    None => {
                        return Err(RuntimeError::UnresolvedReference(format!(
                            "$.{}",
                            decl.name
                        )))
                    }
                }
            }
        }
    }
    Ok(Outcome::Advance)
}

/// Statement step: resolve the facet, evaluate every argument.
fn init_statement(
    ctx: &mut EvalContext<'_>,
    step: &mut StepDefinition,
) -> Result<Outcome, RuntimeError> {
    let statement_id = step.statement_id.clone().unwrap_or_default();
    let statement = ctx
        .ast
        .statement(base_statement_id(&statement_id))
        .ok_or_else(|| RuntimeError::UnknownFacet(step.facet_name.clone()))?;

    let facet = match statement {
        StatementDecl::Assignment { facet, .. } => facet.clone(),
        _ => step.facet_name.clone(),
    };
    let sig = ctx
        .facets
        .get(&facet)
        .ok_or_else(|| RuntimeError::UnknownFacet(facet.clone()))?
        .clone();
    step.facet_name = sig.qualified_name.clone();

    match eval_args(ctx, step, statement.args(), &sig.params)? {
        Some(values) => {
            for (name, value, hint) in values {
                step.attributes.set_param_hinted(name, value, hint);
            }
            Ok(Outcome::Advance)
        }
        None => Ok(Outcome::stay()),
    }
}

/// Yield step: arguments are the containing workflow's return attributes.
fn init_yield(
    ctx: &mut EvalContext<'_>,
    step: &mut StepDefinition,
) -> Result<Outcome, RuntimeError> {
    let statement_id = step.statement_id.clone().unwrap_or_default();
    let statement = ctx
        .ast
        .statement(base_statement_id(&statement_id))
        .ok_or_else(|| RuntimeError::UnknownFacet(step.facet_name.clone()))?;

    if let Some(sig) = ctx.facets.get(&ctx.workflow.name) {
        step.facet_name = sig.qualified_name.clone();
    }

    match eval_args(ctx, step, statement.args(), &ctx.workflow.returns)? {
        Some(values) => {
            for (name, value, hint) in values {
                step.attributes.set_param_hinted(name, value, hint);
            }
            Ok(Outcome::Advance)
        }
        None => Ok(Outcome::stay()),
    }
}

/// Schema instantiation: evaluate arguments into params; no facet lookup
/// is required for the schema name itself.
fn init_schema(
    ctx: &mut EvalContext<'_>,
    step: &mut StepDefinition,
) -> Result<Outcome, RuntimeError> {
    let statement_id = step.statement_id.clone().unwrap_or_default();
    let statement = ctx
        .ast
        .statement(base_statement_id(&statement_id))
        .ok_or_else(|| RuntimeError::UnknownFacet(step.facet_name.clone()))?;

    match eval_args(ctx, step, statement.args(), &[])? {
        Some(values) => {
            for (name, value, hint) in values {
                step.attributes.set_param_hinted(name, value, hint);
            }
            Ok(Outcome::Advance)
        }
        None => Ok(Outcome::stay()),
    }
}

/// Evaluate a statement's arguments against declared attributes.
///
/// Returns `None` when any argument is blocked on an incomplete sibling.
/// Declared attributes with defaults fill in for missing arguments.
fn eval_args(
    ctx: &EvalContext<'_>,
    step: &StepDefinition,
    args: &[agentflow_core::Argument],
    decls: &[AttributeDecl],
) -> Result<Option<Vec<(String, serde_json::Value, TypeHint)>>, RuntimeError> {
    let siblings = ctx.sibling_scope(step.block_id);
    let mut scope = Scope::new(ctx.inputs, &siblings);
    if let (Some(var), Some(value)) = (&step.foreach_var, &step.foreach_value) {
        scope = scope.with_foreach(var, value);
    }

    let mut values = Vec::with_capacity(args.len());
    for arg in args {
        match evaluate(&arg.expr, &scope)? {
            Resolution::Value(value) => {
                let hint = decls
                    .iter()
                    .find(|d| d.name == arg.name)
                    .map(|d| d.type_hint)
                    .unwrap_or(TypeHint::Any);
                check_type(&arg.name, &value, hint)?;
                values.push((arg.name.clone(), value, hint));
            }
            Resolution::Pending(_) => return Ok(None),
        }
    }

    // Declared params not supplied fall back to their default expressions.
    for decl in decls {
        if values.iter().any(|(name, _, _)| name == &decl.name) {
            continue;
        }
        if let Some(default) = &decl.default {
            match evaluate(default, &scope)? {
                Resolution::Value(value) => {
                    check_type(&decl.name, &value, decl.type_hint)?;
                    values.push((decl.name.clone(), value, decl.type_hint));
                }
                Resolution::Pending(_) => return Ok(None),
            }
        }
    }

    Ok(Some(values))
}

fn eval_default(
    ctx: &EvalContext<'_>,
    step: &StepDefinition,
    decl: &AttributeDecl,
) -> Result<Option<serde_json::Value>, RuntimeError> {
    let Some(default) = &decl.default else {
        return Ok(None);
    };
    let siblings = ctx.sibling_scope(step.block_id);
    let scope = Scope::new(ctx.inputs, &siblings);
    match evaluate(default, &scope)? {
        Resolution::Value(value) => {
            check_type(&decl.name, &value, decl.type_hint)?;
            Ok(Some(value))
        }
        Resolution::Pending(_) => Ok(None),
    }
}

/// Foreach-expanded statement ids carry a `#<index>` suffix; the AST is
/// indexed by the base id.
pub(super) fn base_statement_id(statement_id: &str) -> &str {
    statement_id
        .split_once('#')
        .map(|(base, _)| base)
        .unwrap_or(statement_id)
}

/// Evaluate an expression for block expansion (foreach sources).
pub(super) fn eval_block_expr(
    ctx: &EvalContext<'_>,
    step: &StepDefinition,
    expr: &Expr,
) -> Result<Resolution, RuntimeError> {
    let siblings = ctx.sibling_scope(step.block_id);
    let scope = Scope::new(ctx.inputs, &siblings);
    evaluate(expr, &scope)
}
