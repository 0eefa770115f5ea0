//! End-to-end evaluator scenarios against the in-memory store.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::json;

use agentflow_core::{
    Argument, AttributeDecl, AttributeValue, BlockDecl, BlockKind, EventState, Expr, FacetDecl,
    ForeachBinding, Namespace, ObjectType, Program, RunnerDefinition, RunnerState, StatementDecl,
    TaskState, TypeHint, WorkflowDecl,
};
use agentflow_runtime::{Evaluator, ExecutionStatus, HandlerDispatcher, PayloadMap};
use agentflow_storage::{InMemoryStore, PersistenceStore};

fn attr(name: &str, hint: TypeHint) -> AttributeDecl {
    AttributeDecl {
        name: name.to_string(),
        type_hint: hint,
        default: None,
    }
}

fn arg(name: &str, expr: Expr) -> Argument {
    Argument {
        name: name.to_string(),
        expr,
    }
}

fn input_ref(name: &str) -> Expr {
    Expr::Input {
        name: name.to_string(),
    }
}

fn step_ref(step: &str, attr: &str) -> Expr {
    Expr::Ref {
        step: step.to_string(),
        attr: attr.to_string(),
    }
}

/// `event facet AddOne(value: Long) => (result: Long)` plus a workflow
/// built from the given statements.
fn program_with(workflow: WorkflowDecl) -> Program {
    Program {
        namespaces: vec![Namespace {
            name: "demo".to_string(),
            facets: vec![FacetDecl {
                name: "AddOne".to_string(),
                event: true,
                params: vec![attr("value", TypeHint::Long)],
                returns: vec![attr("result", TypeHint::Long)],
            }],
            workflows: vec![workflow],
            namespaces: vec![],
        }],
    }
}

/// workflow AddOneWorkflow(input: Long) => (output: Long) andThen {
///     added = AddOne(value = $.input)
///     yield AddOneWorkflow(output = added.result)
/// }
fn add_one_workflow() -> WorkflowDecl {
    WorkflowDecl {
        name: "AddOneWorkflow".to_string(),
        params: vec![attr("input", TypeHint::Long)],
        returns: vec![attr("output", TypeHint::Long)],
        body: BlockDecl {
            id: "blk-1".to_string(),
            kind: BlockKind::AndThen,
            foreach: None,
            statements: vec![
                StatementDecl::Assignment {
                    id: "stmt-1".to_string(),
                    name: "added".to_string(),
                    facet: "AddOne".to_string(),
                    args: vec![arg("value", input_ref("input"))],
                },
                StatementDecl::Yield {
                    id: "stmt-2".to_string(),
                    args: vec![arg("output", step_ref("added", "result"))],
                },
            ],
        },
    }
}

fn runner_with_inputs(
    workflow_name: &str,
    inputs: &[(&str, serde_json::Value)],
) -> RunnerDefinition {
    let mut map = BTreeMap::new();
    for (name, value) in inputs {
        map.insert(name.to_string(), AttributeValue::new(*name, value.clone()));
    }
    RunnerDefinition::new(agentflow_core::generate_id(), workflow_name, map)
}

fn add_one_dispatcher() -> Arc<HandlerDispatcher> {
    let dispatcher = HandlerDispatcher::new();
    dispatcher.register_handler("demo.AddOne", |payload: PayloadMap| async move {
        let value = payload.get("value").and_then(|v| v.as_i64()).unwrap_or(0);
        let mut result = PayloadMap::new();
        result.insert("result".to_string(), json!(value + 1));
        Ok(result)
    });
    Arc::new(dispatcher)
}

#[tokio::test]
async fn test_add_one_with_inline_dispatch_completes() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let runner = runner_with_inputs("AddOneWorkflow", &[("input", json!(41))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone()).with_dispatcher(add_one_dispatcher());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let saved = store.get_runner(runner.uuid).await.unwrap().unwrap();
    assert_eq!(saved.state, RunnerState::Completed);
    assert!(saved.end_time.is_some());

    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_complete());
    assert_eq!(root.attributes.get_return("output"), Some(&json!(42)));

    // Inline dispatch leaves no queue traffic behind
    assert_eq!(store.pending_task_count(), 0);
}

#[tokio::test]
async fn test_add_one_pauses_then_continues_to_completion() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let runner = runner_with_inputs("AddOneWorkflow", &[("input", json!(41))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Paused);
    assert_eq!(
        store.get_runner(runner.uuid).await.unwrap().unwrap().state,
        RunnerState::Paused
    );

    // A domain task and a durable event were persisted for the step
    let task = store
        .claim_task(&["demo.AddOne".to_string()], "default")
        .await
        .unwrap()
        .expect("task should be claimable");
    assert_eq!(task.data["value"], json!(41));
    assert_eq!(task.data["_facet_name"], json!("demo.AddOne"));
    let step_id = task.step_id.unwrap();
    let event = store.get_event_for_step(step_id).await.unwrap().unwrap();
    assert_eq!(event.state, EventState::Created);

    // Supply the result as an agent would
    let mut returns = PayloadMap::new();
    returns.insert("result".to_string(), json!(42));
    evaluator.continue_step(step_id, returns).await.unwrap();

    // The event is completed and a resume task enqueued
    assert!(store.get_event_for_step(step_id).await.unwrap().is_none());
    let resume = store
        .claim_task(&["afl:resume".to_string()], "default")
        .await
        .unwrap()
        .expect("resume task should be enqueued");
    assert_eq!(resume.workflow_id, Some(runner.workflow_id));

    let status = evaluator
        .resume(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.attributes.get_return("output"), Some(&json!(42)));
}

/// Three chained AddOne calls: start = 10, final = 13; exactly three
/// domain tasks are created and all reach completed.
#[tokio::test]
async fn test_three_step_chain() {
    let workflow = WorkflowDecl {
        name: "ChainOfThree".to_string(),
        params: vec![attr("start", TypeHint::Long)],
        returns: vec![attr("final", TypeHint::Long)],
        body: BlockDecl {
            id: "blk-1".to_string(),
            kind: BlockKind::AndThen,
            foreach: None,
            statements: vec![
                StatementDecl::Assignment {
                    id: "s1".to_string(),
                    name: "step1".to_string(),
                    facet: "AddOne".to_string(),
                    args: vec![arg("value", input_ref("start"))],
                },
                StatementDecl::Assignment {
                    id: "s2".to_string(),
                    name: "step2".to_string(),
                    facet: "AddOne".to_string(),
                    args: vec![arg("value", step_ref("step1", "result"))],
                },
                StatementDecl::Assignment {
                    id: "s3".to_string(),
                    name: "step3".to_string(),
                    facet: "AddOne".to_string(),
                    args: vec![arg("value", step_ref("step2", "result"))],
                },
                StatementDecl::Yield {
                    id: "s4".to_string(),
                    args: vec![arg("final", step_ref("step3", "result"))],
                },
            ],
        },
    };
    let program = program_with(workflow);
    let workflow = program.find_workflow("ChainOfThree").unwrap().clone();

    let store = Arc::new(InMemoryStore::new());
    let runner = runner_with_inputs("ChainOfThree", &[("start", json!(10))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let names = vec!["demo.AddOne".to_string()];
    let mut status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();

    // Drive the pause/claim/continue/resume cycle like an agent would
    let mut handled = 0;
    while status == ExecutionStatus::Paused {
        let task = store
            .claim_task(&names, "default")
            .await
            .unwrap()
            .expect("paused runner must have a claimable task");
        let value = task.data["value"].as_i64().unwrap();
        let mut returns = PayloadMap::new();
        returns.insert("result".to_string(), json!(value + 1));
        evaluator
            .continue_step(task.step_id.unwrap(), returns)
            .await
            .unwrap();
        store
            .update_task_state(task.uuid, TaskState::Completed)
            .await
            .unwrap();
        handled += 1;

        status = evaluator
            .resume(runner.uuid, &workflow, &program)
            .await
            .unwrap();
    }

    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(handled, 3);

    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(root.attributes.get_return("final"), Some(&json!(13)));

    let tasks = store.get_tasks_by_runner(runner.uuid).await.unwrap();
    let add_one_tasks: Vec<_> = tasks.iter().filter(|t| t.name == "demo.AddOne").collect();
    assert_eq!(add_one_tasks.len(), 3);
    assert!(add_one_tasks
        .iter()
        .all(|t| t.state == TaskState::Completed));
}

/// A workflow with an empty body yields immediately and completes with
/// its declared return attributes (here: none).
#[tokio::test]
async fn test_empty_workflow_completes_immediately() {
    let workflow = WorkflowDecl {
        name: "Empty".to_string(),
        params: vec![],
        returns: vec![],
        body: BlockDecl {
            id: "blk-1".to_string(),
            kind: BlockKind::AndThen,
            foreach: None,
            statements: vec![],
        },
    };
    let program = program_with(workflow);
    let workflow = program.find_workflow("Empty").unwrap().clone();

    let store = Arc::new(InMemoryStore::new());
    let runner = runner_with_inputs("Empty", &[]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Completed);
    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.attributes.returns.is_empty());
}

/// A yield referencing an attribute of an errored sibling fails the
/// runner; the error propagates up the containment tree.
#[tokio::test]
async fn test_handler_error_fails_runner() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let runner = runner_with_inputs("AddOneWorkflow", &[("input", json!(41))]);
    store.save_runner(&runner).await.unwrap();

    let dispatcher = HandlerDispatcher::new();
    dispatcher.register_handler("demo.AddOne", |_payload: PayloadMap| async move {
        Err(agentflow_core::RuntimeError::Handler(
            "arithmetic unit offline".to_string(),
        ))
    });

    let evaluator = Evaluator::new(store.clone()).with_dispatcher(Arc::new(dispatcher));
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();

    assert_eq!(status, ExecutionStatus::Failed);
    assert_eq!(
        store.get_runner(runner.uuid).await.unwrap().unwrap().state,
        RunnerState::Failed
    );

    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.is_error());

    // The originating step's error message is preserved for diagnostics
    let steps = store
        .get_steps_by_workflow(runner.workflow_id)
        .await
        .unwrap();
    let errored = steps
        .iter()
        .find(|s| s.statement_name == "added")
        .unwrap();
    assert!(errored
        .error
        .as_deref()
        .unwrap()
        .contains("arithmetic unit offline"));
}

/// An unknown facet errors the step during initialization and fails the
/// runner.
#[tokio::test]
async fn test_unknown_facet_fails_runner() {
    let workflow = WorkflowDecl {
        name: "Broken".to_string(),
        params: vec![],
        returns: vec![],
        body: BlockDecl {
            id: "blk-1".to_string(),
            kind: BlockKind::AndThen,
            foreach: None,
            statements: vec![StatementDecl::Assignment {
                id: "s1".to_string(),
                name: "x".to_string(),
                facet: "NoSuchFacet".to_string(),
                args: vec![],
            }],
        },
    };
    let program = program_with(workflow);
    let workflow = program.find_workflow("Broken").unwrap().clone();

    let store = Arc::new(InMemoryStore::new());
    let runner = runner_with_inputs("Broken", &[]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);
}

/// A type mismatch between the supplied input and the declared parameter
/// errors the root during initialization.
#[tokio::test]
async fn test_input_type_mismatch_fails_runner() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let runner = runner_with_inputs("AddOneWorkflow", &[("input", json!("forty-one"))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Failed);

    let root = store
        .get_workflow_root(runner.workflow_id)
        .await
        .unwrap()
        .unwrap();
    assert!(root.error.as_deref().unwrap().contains("type mismatch"));
}

/// Resuming a completed runner is a no-op: no new steps, events or tasks.
#[tokio::test]
async fn test_resume_after_completion_is_noop() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let runner = runner_with_inputs("AddOneWorkflow", &[("input", json!(1))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone()).with_dispatcher(add_one_dispatcher());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let steps_before = store.step_count();
    let tasks_before = store
        .get_tasks_by_runner(runner.uuid)
        .await
        .unwrap()
        .len();

    let status = evaluator
        .resume(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);
    assert_eq!(store.step_count(), steps_before);
    assert_eq!(
        store.get_tasks_by_runner(runner.uuid).await.unwrap().len(),
        tasks_before
    );
}

/// A cancelled runner short-circuits before any iteration begins.
#[tokio::test]
async fn test_cancelled_runner_short_circuits() {
    let store = Arc::new(InMemoryStore::new());
    let program = program_with(add_one_workflow());
    let workflow = program.find_workflow("AddOneWorkflow").unwrap().clone();

    let mut runner = runner_with_inputs("AddOneWorkflow", &[("input", json!(1))]);
    runner.state = RunnerState::Cancelled;
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let err = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap_err();
    assert_eq!(err, agentflow_core::RuntimeError::Cancelled);
    assert_eq!(store.step_count(), 0);
}

/// AndMap blocks expand one child set per element of the foreach source,
/// with the binding in scope for child arguments.
#[tokio::test]
async fn test_and_map_expands_per_element() {
    let workflow = WorkflowDecl {
        name: "EchoAll".to_string(),
        params: vec![attr("items", TypeHint::List)],
        returns: vec![],
        body: BlockDecl {
            id: "blk-1".to_string(),
            kind: BlockKind::AndMap,
            foreach: Some(ForeachBinding {
                var: "item".to_string(),
                source: input_ref("items"),
            }),
            statements: vec![StatementDecl::Assignment {
                id: "s-echo".to_string(),
                name: "echoed".to_string(),
                facet: "Echo".to_string(),
                args: vec![arg(
                    "value",
                    Expr::Var {
                        name: "item".to_string(),
                    },
                )],
            }],
        },
    };

    let program = Program {
        namespaces: vec![Namespace {
            name: "demo".to_string(),
            facets: vec![FacetDecl {
                name: "Echo".to_string(),
                event: false,
                params: vec![attr("value", TypeHint::Any)],
                returns: vec![],
            }],
            workflows: vec![workflow],
            namespaces: vec![],
        }],
    };
    let workflow = program.find_workflow("EchoAll").unwrap().clone();

    let store = Arc::new(InMemoryStore::new());
    let runner = runner_with_inputs("EchoAll", &[("items", json!(["a", "b"]))]);
    store.save_runner(&runner).await.unwrap();

    let evaluator = Evaluator::new(store.clone());
    let status = evaluator
        .execute(runner.uuid, &workflow, &program)
        .await
        .unwrap();
    assert_eq!(status, ExecutionStatus::Completed);

    let steps = store
        .get_steps_by_workflow(runner.workflow_id)
        .await
        .unwrap();
    let echoes: Vec<_> = steps
        .iter()
        .filter(|s| s.object_type == ObjectType::VariableAssignment)
        .collect();
    assert_eq!(echoes.len(), 2);
    let mut values: Vec<_> = echoes
        .iter()
        .map(|s| s.attributes.get_param("value").unwrap().clone())
        .collect();
    values.sort_by_key(|v| v.as_str().unwrap_or_default().to_string());
    assert_eq!(values, vec![json!("a"), json!("b")]);
    assert!(echoes.iter().all(|s| s.is_complete()));
    assert!(echoes.iter().all(|s| s.foreach_var.as_deref() == Some("item")));
}
