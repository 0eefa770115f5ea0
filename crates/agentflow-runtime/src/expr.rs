//! Argument expression evaluation.
//!
//! Expressions resolve against the ambient scope of the containing
//! workflow: its input parameters (`$.name`), sibling step returns
//! (`sibling.attr`) and an optional foreach binding. A reference to a
//! sibling that exists but has not yet completed is not an error: the
//! step waits and is re-evaluated on a later iteration.

use std::collections::BTreeMap;
use std::collections::HashMap;

use agentflow_core::{AttributeValue, Expr, RuntimeError, StepDefinition, TypeHint};

/// Result of evaluating one expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The expression produced a value.
    Value(serde_json::Value),
    /// The referenced sibling exists but has not completed yet; the step
    /// must wait for a later iteration. Carries the blocking reference.
    Pending(String),
}

/// The ambient scope an expression evaluates in.
pub struct Scope<'a> {
    /// The containing workflow's input parameters.
    pub inputs: &'a BTreeMap<String, AttributeValue>,
    /// Sibling steps by statement name.
    pub siblings: &'a HashMap<String, StepDefinition>,
    /// Foreach binding, when evaluating inside a mapping block.
    pub foreach: Option<(&'a str, &'a serde_json::Value)>,
}

impl<'a> Scope<'a> {
    pub fn new(
        inputs: &'a BTreeMap<String, AttributeValue>,
        siblings: &'a HashMap<String, StepDefinition>,
    ) -> Self {
        Self {
            inputs,
            siblings,
            foreach: None,
        }
    }

    pub fn with_foreach(mut self, var: &'a str, value: &'a serde_json::Value) -> Self {
        self.foreach = Some((var, value));
        self
    }
}

/// Evaluate one expression in the given scope.
pub fn evaluate(expr: &Expr, scope: &Scope<'_>) -> Result<Resolution, RuntimeError> {
    match expr {
        Expr::Lit { value } => Ok(Resolution::Value(value.clone())),

        Expr::Input { name } => match scope.inputs.get(name) {
            Some(attr) => Ok(Resolution::Value(attr.value.clone())),
            None => Err(RuntimeError::UnresolvedReference(format!("$.{name}"))),
        },

        Expr::Var { name } => match scope.foreach {
            Some((var, value)) if var == name => Ok(Resolution::Value(value.clone())),
            _ => Err(RuntimeError::UnresolvedReference(name.clone())),
        },

        Expr::Ref { step, attr } => {
            let reference = format!("{step}.{attr}");
            let sibling = scope
                .siblings
                .get(step)
                .ok_or_else(|| RuntimeError::UnresolvedReference(reference.clone()))?;

            if sibling.is_error() {
                return Err(RuntimeError::UnresolvedReference(format!(
                    "{reference} (step '{step}' errored)"
                )));
            }
            if !sibling.is_complete() {
                return Ok(Resolution::Pending(reference));
            }
            match sibling.get_attribute(attr) {
                Some(value) => Ok(Resolution::Value(value.clone())),
                None => Err(RuntimeError::UnresolvedReference(reference)),
            }
        }
    }
}

/// Check a resolved value against a declared type hint.
pub fn check_type(
    name: &str,
    value: &serde_json::Value,
    hint: TypeHint,
) -> Result<(), RuntimeError> {
    if hint.accepts(value) {
        Ok(())
    } else {
        Err(RuntimeError::TypeMismatch {
            name: name.to_string(),
            expected: hint.to_string(),
            actual: TypeHint::infer(value).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentflow_core::{generate_id, ObjectType};
    use serde_json::json;

    fn sibling(name: &str, complete: bool) -> StepDefinition {
        let mut step = StepDefinition::create(
            generate_id(),
            ObjectType::VariableAssignment,
            "ns.F",
            Some("s".to_string()),
            name,
            None,
            None,
            None,
            None,
        );
        step.attributes.set_return("result", json!(42));
        if complete {
            step.mark_completed();
        }
        step
    }

    fn inputs() -> BTreeMap<String, AttributeValue> {
        let mut map = BTreeMap::new();
        map.insert("input".to_string(), AttributeValue::new("input", json!(41)));
        map
    }

    #[test]
    fn test_literal() {
        let inputs = BTreeMap::new();
        let siblings = HashMap::new();
        let scope = Scope::new(&inputs, &siblings);
        let r = evaluate(&Expr::Lit { value: json!(10) }, &scope).unwrap();
        assert_eq!(r, Resolution::Value(json!(10)));
    }

    #[test]
    fn test_input_reference() {
        let inputs = inputs();
        let siblings = HashMap::new();
        let scope = Scope::new(&inputs, &siblings);

        let r = evaluate(
            &Expr::Input {
                name: "input".to_string(),
            },
            &scope,
        )
        .unwrap();
        assert_eq!(r, Resolution::Value(json!(41)));

        let err = evaluate(
            &Expr::Input {
                name: "missing".to_string(),
            },
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::UnresolvedReference(_)));
    }

    #[test]
    fn test_sibling_reference_resolves_when_complete() {
        let inputs = BTreeMap::new();
        let mut siblings = HashMap::new();
        siblings.insert("added".to_string(), sibling("added", true));
        let scope = Scope::new(&inputs, &siblings);

        let r = evaluate(
            &Expr::Ref {
                step: "added".to_string(),
                attr: "result".to_string(),
            },
            &scope,
        )
        .unwrap();
        assert_eq!(r, Resolution::Value(json!(42)));
    }

    #[test]
    fn test_sibling_reference_pends_while_incomplete() {
        let inputs = BTreeMap::new();
        let mut siblings = HashMap::new();
        siblings.insert("added".to_string(), sibling("added", false));
        let scope = Scope::new(&inputs, &siblings);

        let r = evaluate(
            &Expr::Ref {
                step: "added".to_string(),
                attr: "result".to_string(),
            },
            &scope,
        )
        .unwrap();
        assert_eq!(r, Resolution::Pending("added.result".to_string()));
    }

    #[test]
    fn test_sibling_reference_to_errored_step_fails() {
        let inputs = BTreeMap::new();
        let mut siblings = HashMap::new();
        let mut errored = sibling("added", false);
        errored.mark_error("boom");
        siblings.insert("added".to_string(), errored);
        let scope = Scope::new(&inputs, &siblings);

        let err = evaluate(
            &Expr::Ref {
                step: "added".to_string(),
                attr: "result".to_string(),
            },
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::UnresolvedReference(_)));
    }

    #[test]
    fn test_unknown_sibling_fails_immediately() {
        let inputs = BTreeMap::new();
        let siblings = HashMap::new();
        let scope = Scope::new(&inputs, &siblings);

        let err = evaluate(
            &Expr::Ref {
                step: "nobody".to_string(),
                attr: "x".to_string(),
            },
            &scope,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RuntimeError::UnresolvedReference("nobody.x".to_string())
        );
    }

    #[test]
    fn test_foreach_binding() {
        let inputs = BTreeMap::new();
        let siblings = HashMap::new();
        let value = json!("item-2");
        let scope = Scope::new(&inputs, &siblings).with_foreach("item", &value);

        let r = evaluate(
            &Expr::Var {
                name: "item".to_string(),
            },
            &scope,
        )
        .unwrap();
        assert_eq!(r, Resolution::Value(json!("item-2")));

        let err = evaluate(
            &Expr::Var {
                name: "other".to_string(),
            },
            &scope,
        )
        .unwrap_err();
        assert!(matches!(err, RuntimeError::UnresolvedReference(_)));
    }

    #[test]
    fn test_type_check() {
        assert!(check_type("value", &json!(41), TypeHint::Long).is_ok());
        let err = check_type("value", &json!("not a number"), TypeHint::Long).unwrap_err();
        match err {
            RuntimeError::TypeMismatch {
                name,
                expected,
                actual,
            } => {
                assert_eq!(name, "value");
                assert_eq!(expected, "Long");
                assert_eq!(actual, "String");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
