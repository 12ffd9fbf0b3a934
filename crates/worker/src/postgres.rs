use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::debug;

use longtask_core::{
    NodeError, PeriodUnit, Result, TaskPatch, TaskRow, TaskSpawn, TaskState, WorkerRow,
};

use crate::store::{LockRequest, Store};

const WORKER_FIELDS: &str = "id, active, locked_until, stop, task_count, group_id, node_name";
const TASK_FIELDS: &str = "id, state, worker_id, group_id, next_start, sched_period_unit, \
     sched_period_count, sched_enabled, cleanup_pending, change_token, error";

/// PostgreSQL的存储实现。
///
/// 表与存储过程按schema名限定；行映射手工完成。
pub struct PgStore {
    pool: PgPool,
    schema: String,
}

impl PgStore {
    pub fn new(pool: PgPool, schema: String) -> Self {
        Self { pool, schema }
    }

    fn row_to_worker(row: &PgRow) -> Result<WorkerRow> {
        Ok(WorkerRow {
            id: row.try_get("id")?,
            active: row.try_get("active")?,
            locked_until: row.try_get("locked_until")?,
            stop: row.try_get("stop")?,
            task_count: row.try_get("task_count")?,
            group_id: row.try_get("group_id")?,
            node_name: row.try_get("node_name")?,
        })
    }

    fn row_to_task(row: &PgRow) -> Result<TaskRow> {
        let state: String = row.try_get("state")?;
        let state = TaskState::from_code(&state)
            .ok_or_else(|| NodeError::Internal(format!("未知任务状态: {state}")))?;
        let unit: Option<String> = row.try_get("sched_period_unit")?;
        let sched_period_unit = match unit {
            Some(code) => Some(
                PeriodUnit::from_code(&code)
                    .ok_or_else(|| NodeError::Internal(format!("未知周期单位: {code}")))?,
            ),
            None => None,
        };
        Ok(TaskRow {
            id: row.try_get("id")?,
            state,
            worker_id: row.try_get("worker_id")?,
            group_id: row.try_get("group_id")?,
            next_start: row.try_get("next_start")?,
            sched_period_unit,
            sched_period_count: row.try_get("sched_period_count")?,
            sched_enabled: row.try_get("sched_enabled")?,
            cleanup_pending: row.try_get("cleanup_pending")?,
            change_token: row.try_get("change_token")?,
            error: row.try_get("error")?,
        })
    }
}

#[async_trait]
impl Store for PgStore {
    async fn fetch_workers(&self) -> Result<Vec<WorkerRow>> {
        let sql = format!("SELECT {WORKER_FIELDS} FROM {}.worker", self.schema);
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn fetch_workers_by_ids(&self, ids: &[i32]) -> Result<Vec<WorkerRow>> {
        let sql = format!(
            "SELECT {WORKER_FIELDS} FROM {}.worker WHERE id = ANY($1)",
            self.schema
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_worker).collect()
    }

    async fn fetch_worker(&self, id: i32) -> Result<Option<WorkerRow>> {
        let sql = format!(
            "SELECT {WORKER_FIELDS} FROM {}.worker WHERE id = $1",
            self.schema
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_worker).transpose()
    }

    async fn fetch_group_tasks(
        &self,
        group_id: i32,
        horizon: DateTime<Utc>,
        known: &[i64],
    ) -> Result<Vec<TaskRow>> {
        let sql = format!(
            "SELECT {TASK_FIELDS} FROM {}.task \
             WHERE (group_id = $1 AND (state LIKE 'A%' \
                    OR (next_start IS NOT NULL AND next_start < $2))) \
                OR id = ANY($3)",
            self.schema
        );
        let rows = sqlx::query(&sql)
            .bind(group_id)
            .bind(horizon)
            .bind(known)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<TaskRow>> {
        let sql = format!(
            "SELECT {TASK_FIELDS} FROM {}.task WHERE id = ANY($1)",
            self.schema
        );
        let rows = sqlx::query(&sql).bind(ids).fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_task).collect()
    }

    async fn fetch_task(&self, id: i64) -> Result<Option<TaskRow>> {
        let sql = format!(
            "SELECT {TASK_FIELDS} FROM {}.task WHERE id = $1",
            self.schema
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(Self::row_to_task).transpose()
    }

    async fn fetch_task_spawn(&self, id: i64) -> Result<Option<TaskSpawn>> {
        let sql = format!(
            "SELECT command, cwd, {TASK_FIELDS} FROM {}.task WHERE id = $1",
            self.schema
        );
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        match row {
            Some(row) => Ok(Some(TaskSpawn {
                command: row.try_get("command")?,
                cwd: row.try_get("cwd")?,
                row: Self::row_to_task(&row)?,
            })),
            None => Ok(None),
        }
    }

    async fn lock_worker(&self, req: &LockRequest) -> Result<Option<DateTime<Utc>>> {
        let sql = format!("SELECT {}.lock_worker($1, $2, $3, $4, $5, $6)", self.schema);
        let row = sqlx::query(&sql)
            .bind(req.worker_id)
            .bind(req.group_id)
            .bind(&req.node_name)
            .bind(req.task_count)
            .bind(req.new_until)
            .bind(req.expected)
            .fetch_one(&self.pool)
            .await?;
        let current: Option<DateTime<Utc>> = row.try_get(0)?;
        debug!(
            "lock_worker({}) -> {:?}",
            req.worker_id,
            current.map(|t| t.to_rfc3339())
        );
        Ok(current)
    }

    async fn unlock_worker(&self, id: i32, task_count: i32) -> Result<()> {
        let sql = format!(
            "UPDATE {}.worker SET active = false, locked_until = NULL, task_count = $2 \
             WHERE id = $1",
            self.schema
        );
        sqlx::query(&sql)
            .bind(id)
            .bind(task_count)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn recover_worker_tasks(&self, id: i32) -> Result<()> {
        let sql = format!("SELECT {}.recover_worker_tasks($1)", self.schema);
        sqlx::query(&sql).bind(id).execute(&self.pool).await?;
        Ok(())
    }

    async fn start_task(&self, group_id: i32, worker_id: i32) -> Result<Option<i64>> {
        let sql = format!("SELECT {}.start_task($1, $2)", self.schema);
        let row = sqlx::query(&sql)
            .bind(group_id)
            .bind(worker_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get(0)?)
    }

    async fn sched_start(&self, id: i64) -> Result<Option<i64>> {
        let sql = format!("SELECT {}.sched_start($1)", self.schema);
        let row = sqlx::query(&sql).bind(id).fetch_one(&self.pool).await?;
        Ok(row.try_get(0)?)
    }

    async fn save_task(
        &self,
        id: i64,
        patch: &TaskPatch,
        token: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let Some(state) = patch.state else {
            return Ok(true);
        };
        let error: Option<String> = patch.error.clone().flatten();
        let affected = match token {
            Some(token) => {
                let sql = format!(
                    "UPDATE {}.task SET state = $2, error = $3 \
                     WHERE id = $1 AND state IN ('AE','AS','AC') AND change_token = $4",
                    self.schema
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(state.as_code())
                    .bind(error)
                    .bind(token)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
            None => {
                let sql = format!(
                    "UPDATE {}.task SET state = $2, error = $3 \
                     WHERE id = $1 AND state IN ('AE','AS','AC')",
                    self.schema
                );
                sqlx::query(&sql)
                    .bind(id)
                    .bind(state.as_code())
                    .bind(error)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(affected > 0)
    }

    async fn advance_next_start(
        &self,
        id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let sql = format!(
            "UPDATE {}.task SET next_start = $2 \
             WHERE id = $1 AND next_start IS NOT DISTINCT FROM $3",
            self.schema
        );
        let affected = sqlx::query(&sql)
            .bind(id)
            .bind(to)
            .bind(from)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected > 0)
    }
}
