//! PostgreSQL implementation of the persistence port.
//!
//! Entities are stored as JSONB documents alongside the columns the runtime
//! queries on. The two queue invariants live in partial unique indexes:
//! at most one `running` task per step and at most one non-terminal event
//! per step. `claim_task` performs the atomic `pending -> running`
//! transition with `FOR UPDATE SKIP LOCKED` so concurrent claimants never
//! contend on the same row.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::{debug, instrument};
use uuid::Uuid;

use agentflow_core::{
    EventDefinition, FlowDefinition, HandlerRegistration, LockDefinition, LockMetaData,
    LogDefinition, RunnerDefinition, RunnerState, ServerDefinition, StepDefinition, StepLogEntry,
    StepState, TaskDefinition, TaskState, WorkflowDefinition,
};

use crate::changes::IterationChanges;
use crate::store::{PersistenceStore, StoreError};

/// Embedded schema, applied by [`PostgresStore::migrate`].
const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS afl_steps (
    uuid UUID PRIMARY KEY,
    workflow_id UUID NOT NULL,
    container_id UUID,
    block_id UUID,
    statement_id TEXT,
    state TEXT NOT NULL,
    is_block BOOLEAN NOT NULL DEFAULT FALSE,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_steps_workflow_idx ON afl_steps (workflow_id);
CREATE INDEX IF NOT EXISTS afl_steps_container_idx ON afl_steps (container_id);
CREATE INDEX IF NOT EXISTS afl_steps_block_idx ON afl_steps (block_id);
CREATE INDEX IF NOT EXISTS afl_steps_state_idx ON afl_steps (state);
CREATE UNIQUE INDEX IF NOT EXISTS afl_steps_statement_key
    ON afl_steps (statement_id, COALESCE(block_id, '00000000-0000-0000-0000-000000000000'::uuid))
    WHERE statement_id IS NOT NULL;

CREATE TABLE IF NOT EXISTS afl_events (
    uuid UUID PRIMARY KEY,
    step_id UUID NOT NULL,
    workflow_id UUID NOT NULL,
    state TEXT NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_events_workflow_idx ON afl_events (workflow_id);
CREATE UNIQUE INDEX IF NOT EXISTS afl_events_step_active
    ON afl_events (step_id)
    WHERE state IN ('event.Created', 'event.Dispatched', 'event.Processing');

CREATE TABLE IF NOT EXISTS afl_tasks (
    uuid UUID PRIMARY KEY,
    name TEXT NOT NULL,
    task_list_name TEXT NOT NULL,
    state TEXT NOT NULL,
    step_id UUID,
    runner_id UUID,
    created TIMESTAMPTZ NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_tasks_claim_idx ON afl_tasks (state, name, task_list_name);
CREATE INDEX IF NOT EXISTS afl_tasks_runner_idx ON afl_tasks (runner_id);
CREATE UNIQUE INDEX IF NOT EXISTS afl_tasks_step_running
    ON afl_tasks (step_id)
    WHERE state = 'running';

CREATE TABLE IF NOT EXISTS afl_runners (
    uuid UUID PRIMARY KEY,
    workflow_id UUID NOT NULL,
    state TEXT NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_runners_workflow_idx ON afl_runners (workflow_id);
CREATE INDEX IF NOT EXISTS afl_runners_state_idx ON afl_runners (state);

CREATE TABLE IF NOT EXISTS afl_flows (
    uuid UUID PRIMARY KEY,
    name TEXT NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_flows_name_idx ON afl_flows (name);

CREATE TABLE IF NOT EXISTS afl_workflows (
    uuid UUID PRIMARY KEY,
    name TEXT NOT NULL,
    flow_id UUID NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_workflows_name_idx ON afl_workflows (name);

CREATE TABLE IF NOT EXISTS afl_servers (
    uuid UUID PRIMARY KEY,
    ping_time TIMESTAMPTZ NOT NULL,
    doc JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS afl_handler_registrations (
    facet_name TEXT PRIMARY KEY,
    doc JSONB NOT NULL
);

CREATE TABLE IF NOT EXISTS afl_logs (
    uuid UUID PRIMARY KEY,
    runner_id UUID NOT NULL,
    ord BIGINT NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_logs_runner_idx ON afl_logs (runner_id, ord);

CREATE TABLE IF NOT EXISTS afl_step_logs (
    uuid UUID PRIMARY KEY,
    step_id UUID NOT NULL,
    workflow_id UUID NOT NULL,
    time TIMESTAMPTZ NOT NULL,
    doc JSONB NOT NULL
);
CREATE INDEX IF NOT EXISTS afl_step_logs_step_idx ON afl_step_logs (step_id, time);
CREATE INDEX IF NOT EXISTS afl_step_logs_workflow_idx ON afl_step_logs (workflow_id, time);

CREATE TABLE IF NOT EXISTS afl_locks (
    key TEXT PRIMARY KEY,
    acquired_at TIMESTAMPTZ NOT NULL,
    expires_at TIMESTAMPTZ NOT NULL,
    meta JSONB
);
"#;

/// PostgreSQL persistence store.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn to_doc<T: Serialize>(value: &T) -> Result<serde_json::Value, StoreError> {
    serde_json::to_value(value).map_err(StoreError::serialization)
}

fn from_doc<T: DeserializeOwned>(row: &PgRow) -> Result<T, StoreError> {
    let doc: serde_json::Value = row.get("doc");
    serde_json::from_value(doc).map_err(StoreError::serialization)
}

fn decode_rows<T: DeserializeOwned>(rows: Vec<PgRow>) -> Result<Vec<T>, StoreError> {
    rows.iter().map(from_doc).collect()
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to the given database URL.
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url)
            .await
            .map_err(StoreError::database)?;
        Ok(Self::new(pool))
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema. Idempotent.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        debug!("schema applied");
        Ok(())
    }

    async fn upsert_step<'e, E>(executor: E, step: &StepDefinition) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO afl_steps (uuid, workflow_id, container_id, block_id, statement_id, state, is_block, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (uuid) DO UPDATE
            SET state = EXCLUDED.state, doc = EXCLUDED.doc
            "#,
        )
        .bind(step.id)
        .bind(step.workflow_id)
        .bind(step.container_id)
        .bind(step.block_id)
        .bind(&step.statement_id)
        .bind(step.state.as_str())
        .bind(step.is_block())
        .bind(to_doc(step)?)
        .execute(executor)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn upsert_event<'e, E>(executor: E, event: &EventDefinition) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO afl_events (uuid, step_id, workflow_id, state, doc)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (uuid) DO UPDATE
            SET state = EXCLUDED.state, doc = EXCLUDED.doc
            "#,
        )
        .bind(event.uuid)
        .bind(event.step_id)
        .bind(event.workflow_id)
        .bind(event.state.as_str())
        .bind(to_doc(event)?)
        .execute(executor)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn upsert_task<'e, E>(executor: E, task: &TaskDefinition) -> Result<(), StoreError>
    where
        E: sqlx::PgExecutor<'e>,
    {
        sqlx::query(
            r#"
            INSERT INTO afl_tasks (uuid, name, task_list_name, state, step_id, runner_id, created, doc)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (uuid) DO UPDATE
            SET state = EXCLUDED.state, doc = EXCLUDED.doc
            "#,
        )
        .bind(task.uuid)
        .bind(&task.name)
        .bind(&task.task_list_name)
        .bind(task.state.to_string())
        .bind(task.step_id)
        .bind(task.runner_id)
        .bind(task.created)
        .bind(to_doc(task)?)
        .execute(executor)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }
}

#[async_trait]
impl PersistenceStore for PostgresStore {
    async fn get_step(&self, step_id: Uuid) -> Result<Option<StepDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_steps WHERE uuid = $1")
            .bind(step_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn get_steps_by_block(
        &self,
        block_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE block_id = $1")
            .bind(block_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_steps_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_steps_by_state(
        &self,
        state: StepState,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE state = $1")
            .bind(state.as_str())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_steps_by_container(
        &self,
        container_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_steps WHERE container_id = $1")
            .bind(container_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_blocks_by_step(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<StepDefinition>, StoreError> {
        let rows =
            sqlx::query("SELECT doc FROM afl_steps WHERE container_id = $1 AND is_block")
                .bind(step_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn save_step(&self, step: &StepDefinition) -> Result<(), StoreError> {
        Self::upsert_step(&self.pool, step).await
    }

    async fn get_workflow_root(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<StepDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM afl_steps
            WHERE workflow_id = $1 AND container_id IS NULL
              AND (doc->>'root_id') IS NULL
            LIMIT 1
            "#,
        )
        .bind(workflow_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn step_exists(
        &self,
        statement_id: &str,
        block_id: Option<Uuid>,
    ) -> Result<bool, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT 1 AS hit FROM afl_steps
            WHERE statement_id = $1
              AND COALESCE(block_id, '00000000-0000-0000-0000-000000000000'::uuid)
                = COALESCE($2, '00000000-0000-0000-0000-000000000000'::uuid)
            LIMIT 1
            "#,
        )
        .bind(statement_id)
        .bind(block_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(row.is_some())
    }

    async fn get_event(&self, event_id: Uuid) -> Result<Option<EventDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_events WHERE uuid = $1")
            .bind(event_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn get_events_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<EventDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_events WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_event_for_step(
        &self,
        step_id: Uuid,
    ) -> Result<Option<EventDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT doc FROM afl_events
            WHERE step_id = $1
              AND state IN ('event.Created', 'event.Dispatched', 'event.Processing')
            LIMIT 1
            "#,
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_event(&self, event: &EventDefinition) -> Result<(), StoreError> {
        Self::upsert_event(&self.pool, event).await
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<TaskDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_tasks WHERE uuid = $1")
            .bind(task_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn get_pending_tasks(
        &self,
        task_list: &str,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT doc FROM afl_tasks
            WHERE task_list_name = $1 AND state = 'pending'
            ORDER BY created
            "#,
        )
        .bind(task_list)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_tasks_by_runner(
        &self,
        runner_id: Uuid,
    ) -> Result<Vec<TaskDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_tasks WHERE runner_id = $1")
            .bind(runner_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_task_for_step(
        &self,
        step_id: Uuid,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        let row = sqlx::query(
            "SELECT doc FROM afl_tasks WHERE step_id = $1 ORDER BY created DESC LIMIT 1",
        )
        .bind(step_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_task(&self, task: &TaskDefinition) -> Result<(), StoreError> {
        Self::upsert_task(&self.pool, task).await
    }

    #[instrument(skip(self, names))]
    async fn claim_task(
        &self,
        names: &[String],
        task_list: &str,
    ) -> Result<Option<TaskDefinition>, StoreError> {
        // Single-statement claim: the inner SELECT locks one pending row
        // (skipping rows other claimants hold), the UPDATE flips it to
        // running inside the same statement. Steps that already have a
        // running task are excluded to uphold the per-step invariant.
        let row = sqlx::query(
            r#"
            WITH claimable AS (
                SELECT uuid
                FROM afl_tasks t
                WHERE t.state = 'pending'
                  AND t.name = ANY($1)
                  AND t.task_list_name = $2
                  AND (t.step_id IS NULL OR NOT EXISTS (
                      SELECT 1 FROM afl_tasks r
                      WHERE r.step_id = t.step_id AND r.state = 'running'
                  ))
                ORDER BY created
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE afl_tasks t
            SET state = 'running',
                doc = jsonb_set(
                    jsonb_set(t.doc, '{state}', '"running"'),
                    '{updated}', to_jsonb(now())
                )
            FROM claimable c
            WHERE t.uuid = c.uuid
            RETURNING t.doc
            "#,
        )
        .bind(names)
        .bind(task_list)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;

        match row {
            Some(row) => {
                let task: TaskDefinition = from_doc(&row)?;
                debug!(task_id = %task.uuid, name = %task.name, "claimed task");
                Ok(Some(task))
            }
            None => Ok(None),
        }
    }

    async fn update_task_state(
        &self,
        task_id: Uuid,
        state: TaskState,
    ) -> Result<(), StoreError> {
        let state_str = state.to_string();
        let result = sqlx::query(
            r#"
            UPDATE afl_tasks
            SET state = $2,
                doc = jsonb_set(
                    jsonb_set(doc, '{state}', to_jsonb($2::text)),
                    '{updated}', to_jsonb(now())
                )
            WHERE uuid = $1
            "#,
        )
        .bind(task_id)
        .bind(state_str)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::TaskNotFound(task_id));
        }
        Ok(())
    }

    async fn get_runner(&self, runner_id: Uuid) -> Result<Option<RunnerDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_runners WHERE uuid = $1")
            .bind(runner_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_runner(&self, runner: &RunnerDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_runners (uuid, workflow_id, state, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO UPDATE
            SET state = EXCLUDED.state, doc = EXCLUDED.doc
            "#,
        )
        .bind(runner.uuid)
        .bind(runner.workflow_id)
        .bind(runner.state.to_string())
        .bind(to_doc(runner)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_runners_by_state(
        &self,
        state: RunnerState,
    ) -> Result<Vec<RunnerDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_runners WHERE state = $1")
            .bind(state.to_string())
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_runners_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<RunnerDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_runners WHERE workflow_id = $1")
            .bind(workflow_id)
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_flow(&self, flow_id: Uuid) -> Result<Option<FlowDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_flows WHERE uuid = $1")
            .bind(flow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn get_flow_by_name(&self, name: &str) -> Result<Option<FlowDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_flows WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_flow(&self, flow: &FlowDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_flows (uuid, name, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (uuid) DO UPDATE SET name = EXCLUDED.name, doc = EXCLUDED.doc
            "#,
        )
        .bind(flow.uuid)
        .bind(&flow.name)
        .bind(to_doc(flow)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn delete_flow(&self, flow_id: Uuid) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM afl_flows WHERE uuid = $1")
            .bind(flow_id)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn get_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_workflows WHERE uuid = $1")
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn get_workflow_by_name(
        &self,
        name: &str,
    ) -> Result<Option<WorkflowDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_workflows WHERE name = $1 LIMIT 1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_workflow(&self, workflow: &WorkflowDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_workflows (uuid, name, flow_id, doc)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (uuid) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(workflow.uuid)
        .bind(&workflow.name)
        .bind(workflow.flow_id)
        .bind(to_doc(workflow)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_server(&self, server_id: Uuid) -> Result<Option<ServerDefinition>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_servers WHERE uuid = $1")
            .bind(server_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn save_server(&self, server: &ServerDefinition) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_servers (uuid, ping_time, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (uuid) DO UPDATE
            SET ping_time = EXCLUDED.ping_time, doc = EXCLUDED.doc
            "#,
        )
        .bind(server.uuid)
        .bind(server.ping_time)
        .bind(to_doc(server)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn update_server_ping(
        &self,
        server_id: Uuid,
        ping_time: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE afl_servers
            SET ping_time = $2,
                doc = jsonb_set(doc, '{ping_time}', to_jsonb($2::timestamptz))
            WHERE uuid = $1
            "#,
        )
        .bind(server_id)
        .bind(ping_time)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_all_servers(&self) -> Result<Vec<ServerDefinition>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_servers")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn save_handler_registration(
        &self,
        registration: &HandlerRegistration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_handler_registrations (facet_name, doc)
            VALUES ($1, $2)
            ON CONFLICT (facet_name) DO UPDATE SET doc = EXCLUDED.doc
            "#,
        )
        .bind(&registration.facet_name)
        .bind(to_doc(registration)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_handler_registration(
        &self,
        facet_name: &str,
    ) -> Result<Option<HandlerRegistration>, StoreError> {
        let row = sqlx::query("SELECT doc FROM afl_handler_registrations WHERE facet_name = $1")
            .bind(facet_name)
            .fetch_optional(&self.pool)
            .await
            .map_err(StoreError::database)?;
        row.as_ref().map(from_doc).transpose()
    }

    async fn list_handler_registrations(
        &self,
    ) -> Result<Vec<HandlerRegistration>, StoreError> {
        let rows = sqlx::query("SELECT doc FROM afl_handler_registrations")
            .fetch_all(&self.pool)
            .await
            .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn delete_handler_registration(&self, facet_name: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM afl_handler_registrations WHERE facet_name = $1")
            .bind(facet_name)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn save_log(&self, log: &LogDefinition) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO afl_logs (uuid, runner_id, ord, doc) VALUES ($1, $2, $3, $4)",
        )
        .bind(log.uuid)
        .bind(log.runner_id)
        .bind(log.order)
        .bind(to_doc(log)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_logs_by_runner(
        &self,
        runner_id: Uuid,
    ) -> Result<Vec<LogDefinition>, StoreError> {
        let rows =
            sqlx::query("SELECT doc FROM afl_logs WHERE runner_id = $1 ORDER BY ord")
                .bind(runner_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn save_step_log(&self, entry: &StepLogEntry) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO afl_step_logs (uuid, step_id, workflow_id, time, doc)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.uuid)
        .bind(entry.step_id)
        .bind(entry.workflow_id)
        .bind(entry.time)
        .bind(to_doc(entry)?)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(())
    }

    async fn get_step_logs_by_step(
        &self,
        step_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError> {
        let rows =
            sqlx::query("SELECT doc FROM afl_step_logs WHERE step_id = $1 ORDER BY time")
                .bind(step_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn get_step_logs_by_workflow(
        &self,
        workflow_id: Uuid,
    ) -> Result<Vec<StepLogEntry>, StoreError> {
        let rows =
            sqlx::query("SELECT doc FROM afl_step_logs WHERE workflow_id = $1 ORDER BY time")
                .bind(workflow_id)
                .fetch_all(&self.pool)
                .await
                .map_err(StoreError::database)?;
        decode_rows(rows)
    }

    async fn acquire_lock(
        &self,
        key: &str,
        duration: Duration,
        meta: Option<LockMetaData>,
    ) -> Result<bool, StoreError> {
        let meta_doc = meta.map(|m| to_doc(&m)).transpose()?;
        // Clear an expired lease, then try to take the key; losing the
        // insert race means another holder got there first.
        sqlx::query("DELETE FROM afl_locks WHERE key = $1 AND expires_at <= now()")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;

        let result = sqlx::query(
            r#"
            INSERT INTO afl_locks (key, acquired_at, expires_at, meta)
            VALUES ($1, now(), now() + $2::interval, $3)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(key)
        .bind(format!("{} milliseconds", duration.as_millis()))
        .bind(meta_doc)
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lock(&self, key: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM afl_locks WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(StoreError::database)?;
        Ok(result.rows_affected() > 0)
    }

    async fn check_lock(&self, key: &str) -> Result<Option<LockDefinition>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT key, acquired_at, expires_at, meta
            FROM afl_locks
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::database)?;

        Ok(row.map(|row| {
            let meta: Option<serde_json::Value> = row.get("meta");
            LockDefinition {
                key: row.get("key"),
                acquired_at: row.get("acquired_at"),
                expires_at: row.get("expires_at"),
                meta: meta.and_then(|m| serde_json::from_value(m).ok()),
            }
        }))
    }

    async fn extend_lock(&self, key: &str, duration: Duration) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE afl_locks
            SET expires_at = now() + $2::interval
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .bind(format!("{} milliseconds", duration.as_millis()))
        .execute(&self.pool)
        .await
        .map_err(StoreError::database)?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, changes))]
    async fn commit(&self, changes: &IterationChanges) -> Result<(), StoreError> {
        if !changes.has_changes() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await.map_err(StoreError::database)?;

        for step in changes
            .created_steps
            .iter()
            .chain(changes.updated_steps.iter())
        {
            Self::upsert_step(&mut *tx, step).await?;
        }
        for event in changes
            .created_events
            .iter()
            .chain(changes.updated_events.iter())
        {
            Self::upsert_event(&mut *tx, event).await?;
        }
        for task in &changes.created_tasks {
            Self::upsert_task(&mut *tx, task).await?;
        }

        tx.commit().await.map_err(StoreError::database)?;
        debug!(
            created_steps = changes.created_steps.len(),
            updated_steps = changes.updated_steps.len(),
            created_events = changes.created_events.len(),
            created_tasks = changes.created_tasks.len(),
            "committed iteration changes"
        );
        Ok(())
    }
}
