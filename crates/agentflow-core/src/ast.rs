//! Typed view of the compiled program tree.
//!
//! The surface parser/compiler is an external collaborator; flows store its
//! output as a JSON document which deserializes into this tree. The
//! persistence layer treats the program as opaque; the evaluator pattern
//! matches on it.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::TypeHint;

/// A compiled program: the root of the AST.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Program {
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

/// A namespace groups facet and workflow declarations.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Namespace {
    pub name: String,
    #[serde(default)]
    pub facets: Vec<FacetDecl>,
    #[serde(default)]
    pub workflows: Vec<WorkflowDecl>,
    #[serde(default)]
    pub namespaces: Vec<Namespace>,
}

/// A facet declaration: a named, typed unit-of-work signature.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FacetDecl {
    pub name: String,
    /// Event facets dispatch to the external worker pool.
    #[serde(default)]
    pub event: bool,
    #[serde(default)]
    pub params: Vec<AttributeDecl>,
    #[serde(default)]
    pub returns: Vec<AttributeDecl>,
}

/// A declared parameter or return attribute.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AttributeDecl {
    pub name: String,
    #[serde(default)]
    pub type_hint: TypeHint,
    #[serde(default)]
    pub default: Option<Expr>,
}

/// A workflow declaration: params, returns, and a root block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDecl {
    pub name: String,
    #[serde(default)]
    pub params: Vec<AttributeDecl>,
    #[serde(default)]
    pub returns: Vec<AttributeDecl>,
    pub body: BlockDecl,
}

/// Kind of a block construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BlockKind {
    #[default]
    AndThen,
    AndMap,
    AndMatch,
    Block,
}

impl BlockKind {
    pub fn object_type(&self) -> crate::types::ObjectType {
        match self {
            Self::AndThen => crate::types::ObjectType::AndThen,
            Self::AndMap => crate::types::ObjectType::AndMap,
            Self::AndMatch => crate::types::ObjectType::AndMatch,
            Self::Block => crate::types::ObjectType::Block,
        }
    }
}

/// Foreach binding for mapping blocks: one child set per source element.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForeachBinding {
    pub var: String,
    pub source: Expr,
}

/// A block: a sequence of statements, optionally with a foreach binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockDecl {
    /// Stable id assigned by the compiler, part of the step idempotency key.
    pub id: String,
    #[serde(default)]
    pub kind: BlockKind,
    #[serde(default)]
    pub foreach: Option<ForeachBinding>,
    #[serde(default)]
    pub statements: Vec<StatementDecl>,
}

impl BlockDecl {
    /// The terminal yield statement, if the block has one.
    pub fn yield_statement(&self) -> Option<&StatementDecl> {
        self.statements
            .iter()
            .find(|s| matches!(s, StatementDecl::Yield { .. }))
    }
}

/// One statement of a block.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StatementDecl {
    /// `name = Facet(arg = expr, ...)`
    Assignment {
        id: String,
        name: String,
        facet: String,
        #[serde(default)]
        args: Vec<Argument>,
    },
    /// `yield Workflow(attr = expr, ...)`
    Yield {
        id: String,
        #[serde(default)]
        args: Vec<Argument>,
    },
    /// `name = Schema { attr = expr, ... }`
    Schema {
        id: String,
        name: String,
        schema: String,
        #[serde(default)]
        args: Vec<Argument>,
    },
}

impl StatementDecl {
    pub fn id(&self) -> &str {
        match self {
            Self::Assignment { id, .. } | Self::Yield { id, .. } | Self::Schema { id, .. } => id,
        }
    }

    /// The statement's binding name ("yield" for yield statements).
    pub fn name(&self) -> &str {
        match self {
            Self::Assignment { name, .. } | Self::Schema { name, .. } => name,
            Self::Yield { .. } => "yield",
        }
    }

    pub fn args(&self) -> &[Argument] {
        match self {
            Self::Assignment { args, .. }
            | Self::Yield { args, .. }
            | Self::Schema { args, .. } => args,
        }
    }
}

/// A named argument expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argument {
    pub name: String,
    pub expr: Expr,
}

/// An argument expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Expr {
    /// A literal JSON value.
    Lit { value: serde_json::Value },
    /// `$.name`: a workflow input parameter.
    Input { name: String },
    /// `step.attr`: a return attribute of a sibling step.
    Ref { step: String, attr: String },
    /// A foreach binding variable.
    Var { name: String },
}

/// Resolved signature of a facet or workflow, as seen by the evaluator.
#[derive(Debug, Clone, PartialEq)]
pub struct FacetSig {
    pub qualified_name: String,
    pub event: bool,
    pub params: Vec<AttributeDecl>,
    pub returns: Vec<AttributeDecl>,
}

/// Lookup table from facet name to signature.
///
/// Both qualified (`ns.AddOne`) and short (`AddOne`) names resolve; short
/// names are registered first-wins, so statements within a namespace can
/// reference local facets without qualification. Workflow signatures are
/// included so root and yield steps resolve through the same path.
#[derive(Debug, Clone, Default)]
pub struct FacetTable {
    by_name: HashMap<String, FacetSig>,
}

impl FacetTable {
    /// Build the table from a program.
    pub fn from_program(program: &Program) -> Self {
        let mut table = Self::default();
        for ns in &program.namespaces {
            table.add_namespace(ns, "");
        }
        table
    }

    fn add_namespace(&mut self, ns: &Namespace, prefix: &str) {
        let qualified_ns = if prefix.is_empty() {
            ns.name.clone()
        } else {
            format!("{prefix}.{}", ns.name)
        };

        for facet in &ns.facets {
            let sig = FacetSig {
                qualified_name: format!("{qualified_ns}.{}", facet.name),
                event: facet.event,
                params: facet.params.clone(),
                returns: facet.returns.clone(),
            };
            self.insert(&facet.name, sig);
        }

        for workflow in &ns.workflows {
            let sig = FacetSig {
                qualified_name: format!("{qualified_ns}.{}", workflow.name),
                event: false,
                params: workflow.params.clone(),
                returns: workflow.returns.clone(),
            };
            self.insert(&workflow.name, sig);
        }

        for nested in &ns.namespaces {
            self.add_namespace(nested, &qualified_ns);
        }
    }

    fn insert(&mut self, short_name: &str, sig: FacetSig) {
        self.by_name
            .insert(sig.qualified_name.clone(), sig.clone());
        self.by_name
            .entry(short_name.to_string())
            .or_insert(sig);
    }

    pub fn get(&self, name: &str) -> Option<&FacetSig> {
        self.by_name.get(name)
    }

    pub fn len(&self) -> usize {
        self.by_name.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_name.is_empty()
    }
}

impl Program {
    /// Find a workflow by name, qualified or short.
    pub fn find_workflow(&self, name: &str) -> Option<&WorkflowDecl> {
        fn walk<'a>(
            namespaces: &'a [Namespace],
            prefix: &str,
            name: &str,
        ) -> Option<&'a WorkflowDecl> {
            for ns in namespaces {
                let qualified_ns = if prefix.is_empty() {
                    ns.name.clone()
                } else {
                    format!("{prefix}.{}", ns.name)
                };
                for w in &ns.workflows {
                    if w.name == name || format!("{qualified_ns}.{}", w.name) == name {
                        return Some(w);
                    }
                }
                if let Some(found) = walk(&ns.namespaces, &qualified_ns, name) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.namespaces, "", name)
    }

    pub fn facet_table(&self) -> FacetTable {
        FacetTable::from_program(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    /// A small program equivalent to:
    /// ```text
    /// namespace demo {
    ///     event facet AddOne(value: Long) => (result: Long)
    ///     workflow AddOneWorkflow(input: Long) => (output: Long) andThen {
    ///         added = AddOne(value = $.input)
    ///         yield AddOneWorkflow(output = added.result)
    ///     }
    /// }
    /// ```
    pub(crate) fn add_one_program() -> Program {
        Program {
            namespaces: vec![Namespace {
                name: "demo".to_string(),
                facets: vec![FacetDecl {
                    name: "AddOne".to_string(),
                    event: true,
                    params: vec![AttributeDecl {
                        name: "value".to_string(),
                        type_hint: TypeHint::Long,
                        default: None,
                    }],
                    returns: vec![AttributeDecl {
                        name: "result".to_string(),
                        type_hint: TypeHint::Long,
                        default: None,
                    }],
                }],
                workflows: vec![WorkflowDecl {
                    name: "AddOneWorkflow".to_string(),
                    params: vec![AttributeDecl {
                        name: "input".to_string(),
                        type_hint: TypeHint::Long,
                        default: None,
                    }],
                    returns: vec![AttributeDecl {
                        name: "output".to_string(),
                        type_hint: TypeHint::Long,
                        default: None,
                    }],
                    body: BlockDecl {
                        id: "blk-1".to_string(),
                        kind: BlockKind::AndThen,
                        foreach: None,
                        statements: vec![
                            StatementDecl::Assignment {
                                id: "stmt-1".to_string(),
                                name: "added".to_string(),
                                facet: "AddOne".to_string(),
                                args: vec![Argument {
                                    name: "value".to_string(),
                                    expr: Expr::Input {
                                        name: "input".to_string(),
                                    },
                                }],
                            },
                            StatementDecl::Yield {
                                id: "stmt-2".to_string(),
                                args: vec![Argument {
                                    name: "output".to_string(),
                                    expr: Expr::Ref {
                                        step: "added".to_string(),
                                        attr: "result".to_string(),
                                    },
                                }],
                            },
                        ],
                    },
                }],
                namespaces: vec![],
            }],
        }
    }

    #[test]
    fn test_facet_table_resolves_short_and_qualified() {
        let table = add_one_program().facet_table();
        assert!(table.get("AddOne").is_some());
        assert!(table.get("demo.AddOne").is_some());
        assert!(table.get("demo.AddOne").unwrap().event);
        assert!(table.get("nope.Missing").is_none());
    }

    #[test]
    fn test_workflow_signature_in_table() {
        let table = add_one_program().facet_table();
        let sig = table.get("AddOneWorkflow").unwrap();
        assert!(!sig.event);
        assert_eq!(sig.returns[0].name, "output");
    }

    #[test]
    fn test_find_workflow() {
        let program = add_one_program();
        assert!(program.find_workflow("AddOneWorkflow").is_some());
        assert!(program.find_workflow("demo.AddOneWorkflow").is_some());
        assert!(program.find_workflow("demo.Nothing").is_none());
    }

    #[test]
    fn test_yield_statement_lookup() {
        let program = add_one_program();
        let wf = program.find_workflow("AddOneWorkflow").unwrap();
        let y = wf.body.yield_statement().unwrap();
        assert_eq!(y.id(), "stmt-2");
        assert_eq!(y.name(), "yield");
    }

    #[test]
    fn test_program_serde_round_trip() {
        let program = add_one_program();
        let doc = serde_json::to_value(&program).unwrap();
        let back: Program = serde_json::from_value(doc).unwrap();
        assert_eq!(back, program);
    }

    #[test]
    fn test_expr_tagged_serialization() {
        let expr = Expr::Ref {
            step: "added".to_string(),
            attr: "result".to_string(),
        };
        let doc = serde_json::to_value(&expr).unwrap();
        assert_eq!(doc, json!({"type": "ref", "step": "added", "attr": "result"}));
    }
}
