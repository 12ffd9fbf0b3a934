use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use longtask_core::{NodeConfig, Result, TaskRow, TaskState, WorkerRow};
use longtask_scheduler::{ActiveEntity, Controller, Ctx, EntityKey, RetryPolicy, Slot};

use crate::env::NodeEnv;
use crate::task::TaskEntity;
use crate::worker::WorkerEntity;
use crate::{KIND_REFRESH_TASKS, KIND_REFRESH_WORKERS, KIND_TASK, KIND_WORKER, PRIO_CONTROL, PRIO_TASK};

/// 实体统一的退避参数。
pub fn retry_policy(cfg: &NodeConfig) -> RetryPolicy {
    RetryPolicy {
        min: cfg.min_retry_delay(),
        max: cfg.max_retry_delay(),
    }
}

/// 装入或更新一行worker，返回槽位。不值得加载的行返回None。
pub fn upsert_worker_row(
    ctl: &mut Controller<NodeEnv>,
    env: &NodeEnv,
    row: WorkerRow,
) -> Option<Slot> {
    let id = row.id as i64;
    let slot = match ctl.find(KIND_WORKER, id) {
        Some(s) => s,
        None => {
            if !WorkerEntity::interesting(&row) {
                return None;
            }
            let own = row.id == env.cfg.worker_id;
            ctl.spawn(
                WorkerEntity::key(row.id),
                PRIO_CONTROL,
                Some(retry_policy(&env.cfg)),
                Box::new(WorkerEntity::new(row.id, own)),
            )
        }
    };
    ctl.with_entity::<WorkerEntity, _>(slot, |w| w.apply_remote(row));
    ctl.signal(slot);
    Some(slot)
}

/// 装入或更新一行task，返回槽位。不值得加载的行返回None。
pub fn upsert_task_row(
    ctl: &mut Controller<NodeEnv>,
    env: &NodeEnv,
    row: TaskRow,
) -> Option<Slot> {
    let id = row.id;
    let slot = match ctl.find(KIND_TASK, id) {
        Some(s) => s,
        None => {
            if !TaskEntity::interesting(&row, &env.cfg) {
                return None;
            }
            ctl.spawn(
                TaskEntity::key(id),
                PRIO_TASK,
                Some(retry_policy(&env.cfg)),
                Box::new(TaskEntity::new(id)),
            )
        }
    };
    ctl.with_entity::<TaskEntity, _>(slot, |t| t.apply_remote(row));
    ctl.signal(slot);
    Some(slot)
}

/// 批量合并worker行；给出expected时，缺席的行按删除处理。
pub fn apply_worker_rows(
    ctl: &mut Controller<NodeEnv>,
    env: &NodeEnv,
    rows: Vec<WorkerRow>,
    expected: Option<HashSet<i64>>,
) {
    let mut found = HashSet::new();
    for row in rows {
        found.insert(row.id as i64);
        upsert_worker_row(ctl, env, row);
    }
    if let Some(expected) = expected {
        for id in expected.difference(&found) {
            if let Some(slot) = ctl.find(KIND_WORKER, *id) {
                ctl.with_entity::<WorkerEntity, _>(slot, |w| w.set_deleted());
                ctl.signal(slot);
            }
        }
    }
}

/// 批量合并task行。看到AW行意味着又有活可领，清除闩锁。
pub fn apply_task_rows(
    ctl: &mut Controller<NodeEnv>,
    env: &mut NodeEnv,
    rows: Vec<TaskRow>,
    expected: Option<HashSet<i64>>,
) {
    let mut found = HashSet::new();
    let mut has_waiting = false;
    for row in rows {
        found.insert(row.id);
        if row.state == TaskState::Waiting {
            has_waiting = true;
        }
        upsert_task_row(ctl, env, row);
    }
    if let Some(expected) = expected {
        for id in expected.difference(&found) {
            if let Some(slot) = ctl.find(KIND_TASK, *id) {
                ctl.with_entity::<TaskEntity, _>(slot, |t| t.set_deleted());
                ctl.signal(slot);
            }
        }
    }
    if has_waiting && env.no_more_waiting {
        env.no_more_waiting = false;
        env.request_admission();
    }
}

/// 周期全量刷新worker表，缺席的行按删除处理。
pub struct RefreshWorkers {
    next_refresh: Option<DateTime<Utc>>,
}

impl RefreshWorkers {
    pub fn new() -> Self {
        Self { next_refresh: None }
    }

    pub fn key() -> EntityKey {
        EntityKey {
            kind: KIND_REFRESH_WORKERS,
            id: 0,
        }
    }

    /// 下次被信号时立即刷新。
    pub fn force(&mut self) {
        self.next_refresh = None;
    }
}

impl Default for RefreshWorkers {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ActiveEntity<NodeEnv> for RefreshWorkers {
    async fn process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        if !ctx.reached(self.next_refresh) {
            return Ok(());
        }
        let at = ctx.now() + ctx.env.cfg.workers_refresh_interval();
        self.next_refresh = Some(at);
        ctx.schedule(at);

        info!("刷新worker列表");
        let rows = ctx.env.store.fetch_workers().await?;
        let expected: HashSet<i64> = ctx.ctl.ids_of(KIND_WORKER).into_iter().collect();
        apply_worker_rows(ctx.ctl, ctx.env, rows, Some(expected));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// 周期刷新task表。
///
/// 只装入本组进行中的、或将在时间窗内启动的行，加上已装入的行；
/// 内存工作集因此被限定在“本节点可能要处理的活”。
pub struct RefreshTasks {
    next_refresh: Option<DateTime<Utc>>,
}

impl RefreshTasks {
    pub fn new() -> Self {
        Self { next_refresh: None }
    }

    pub fn key() -> EntityKey {
        EntityKey {
            kind: KIND_REFRESH_TASKS,
            id: 0,
        }
    }

    pub fn force(&mut self) {
        self.next_refresh = None;
    }
}

impl Default for RefreshTasks {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl ActiveEntity<NodeEnv> for RefreshTasks {
    async fn process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        if !ctx.reached(self.next_refresh) {
            return Ok(());
        }
        // 刷新期间先假定没有可领任务，看到AW行再清闩锁
        ctx.env.no_more_waiting = true;
        let at = ctx.now() + ctx.env.cfg.tasks_refresh_interval();
        self.next_refresh = Some(at);
        ctx.schedule(at);

        info!("刷新任务列表");
        let horizon = ctx.now() + ctx.env.cfg.schedule_horizon();
        let known = ctx.ctl.ids_of(KIND_TASK);
        let rows = ctx
            .env
            .store
            .fetch_group_tasks(ctx.env.cfg.group_id, horizon, &known)
            .await?;
        let expected: HashSet<i64> = known.into_iter().collect();
        apply_task_rows(ctx.ctl, ctx.env, rows, Some(expected));
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
