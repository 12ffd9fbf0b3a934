use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::{error, info};

use longtask_core::{Result, WorkerRow};
use longtask_scheduler::{ActiveEntity, Ctx, EntityKey};

use crate::env::NodeEnv;
use crate::store::LockRequest;
use crate::sync::SyncedState;
use crate::KIND_WORKER;

/// worker行实体。
///
/// 本节点的worker负责在租约中点续期并察觉锁被截走；其他节点的worker
/// 只在其租约过期超出宽限期后被接管，用于把失效节点名下的任务放回
/// 等待队列。
pub struct WorkerEntity {
    id: i32,
    own: bool,
    rec: SyncedState<WorkerRow>,
    /// 成功获取时的到期时刻；与远端镜像不一致说明锁被他人截走
    lock_time: Option<DateTime<Utc>>,
    has_lock: bool,
    stop: i32,
}

impl WorkerEntity {
    pub fn new(id: i32, own: bool) -> Self {
        Self {
            id,
            own,
            rec: SyncedState::new(),
            lock_time: None,
            has_lock: false,
            stop: 0,
        }
    }

    pub fn key(id: i32) -> EntityKey {
        EntityKey {
            kind: KIND_WORKER,
            id: id as i64,
        }
    }

    /// worker行全部值得加载。
    pub fn interesting(_row: &WorkerRow) -> bool {
        true
    }

    pub fn has_lock(&self) -> bool {
        self.has_lock
    }

    pub fn apply_remote(&mut self, row: WorkerRow) {
        self.rec.set_remote(row);
    }

    pub fn set_deleted(&mut self) {
        self.rec.set_deleted();
    }

    fn set_has_lock(&mut self, val: bool, env: &mut NodeEnv) -> bool {
        if self.has_lock == val {
            return false;
        }
        self.has_lock = val;
        if val {
            info!("worker{}: 取得锁", self.id);
            if self.own {
                env.lease.has_lock = true;
                env.no_more_waiting = false;
                env.request_admission();
                env.force_task_refresh = true;
            } else {
                env.locked_foreign += 1;
            }
        } else {
            info!("worker{}: 失去锁", self.id);
            self.lock_time = None;
            if self.own {
                env.lease.has_lock = false;
                // 名下任务一律按“被对方接管”重新评估
                env.signal_tasks = true;
            } else {
                env.locked_foreign -= 1;
            }
        }
        true
    }

    fn apply_stop(&mut self, val: i32, env: &mut NodeEnv) {
        if self.stop == val {
            return;
        }
        let old = self.stop;
        self.stop = val;
        if self.own {
            info!("worker{}: stop级别 {} -> {}", self.id, old, val);
            env.lease.stop = val;
            if old > 0 && val <= 0 {
                env.request_admission();
            } else if old < 3 && val >= 3 {
                env.signal_tasks = true;
            }
        }
    }

    /// 一次原子的获取/续期/探测调用。
    async fn lock(&mut self, env: &mut NodeEnv, now: DateTime<Utc>) -> Result<bool> {
        let half = env.cfg.half_locking_time();
        let new_until = now + half + half;
        let req = LockRequest {
            worker_id: self.id,
            group_id: if self.own { env.cfg.group_id } else { -1 },
            node_name: env.cfg.node_name.clone(),
            task_count: if self.own { env.executing } else { -1 },
            new_until,
            expected: self.lock_time,
        };
        match env.store.lock_worker(&req).await? {
            None => {
                if let Some(row) = self.rec.remote_mut() {
                    row.locked_until = Some(new_until);
                }
                self.lock_time = Some(new_until);
                self.set_has_lock(true, env);
            }
            Some(current) => {
                if let Some(row) = self.rec.remote_mut() {
                    row.locked_until = Some(current);
                }
                self.lock_time = None;
                self.set_has_lock(false, env);
            }
        }
        Ok(self.has_lock)
    }

    /// 在租约中点续期，并检测锁是否被截走。
    async fn keep_lock(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<bool> {
        let now = ctx.now();
        let half = ctx.env.cfg.half_locking_time();

        if self.has_lock {
            let mirror_until = self.rec.remote().map(|r| r.locked_until);
            if let Some(until) = mirror_until {
                if until != self.lock_time {
                    error!("worker{}: 锁被其他节点截走", self.id);
                    self.lock(ctx.env, now).await?;
                }
            }
        }

        let renew_at = self.lock_time.map(|t| t - half);
        if self.lock_time.is_none() || ctx.reached(renew_at) {
            let next = if self.lock(ctx.env, now).await? {
                self.lock_time.map(|t| t - half)
            } else {
                // 失败时等对方到期后再试
                self.rec
                    .remote()
                    .and_then(|r| r.locked_until)
                    .map(|t| t + half)
            };
            let next = next.unwrap_or(now + half);
            if ctx.reached(Some(next)) {
                ctx.schedule(now + half);
            }
        }
        Ok(self.has_lock)
    }

    /// 监视其他节点：租约过期超出宽限期后接管并恢复其任务。
    async fn watch_foreign(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        let Some(row) = self.rec.remote() else {
            return Ok(());
        };
        if !row.active {
            return Ok(());
        }
        let deadline = row
            .locked_until
            .map(|t| t + ctx.env.cfg.failed_worker_recovery_delay());
        if ctx.reached(deadline) {
            let now = ctx.now();
            if self.lock(ctx.env, now).await? {
                // 抢到锁后重读，防止对方恰好复活
                match ctx.env.store.fetch_worker(self.id).await? {
                    Some(row) => self.rec.set_remote(row),
                    None => self.rec.set_deleted(),
                }
                if self.rec.remote().map(|r| r.active).unwrap_or(false) {
                    info!("worker{}: 接管失效worker，恢复其任务", self.id);
                    ctx.env.store.recover_worker_tasks(self.id).await?;
                }
                self.unlock_and_deactivate(ctx.env).await?;
            }
        }
        Ok(())
    }

    /// 释放锁并把行置为不活跃，记录最终任务数。
    pub async fn unlock_and_deactivate(&mut self, env: &mut NodeEnv) -> Result<()> {
        let task_count = if self.own { env.executing } else { 0 };
        env.store.unlock_worker(self.id, task_count).await?;
        if let Some(row) = self.rec.remote_mut() {
            row.active = false;
            row.locked_until = None;
        }
        self.set_has_lock(false, env);
        Ok(())
    }
}

#[async_trait(?Send)]
impl ActiveEntity<NodeEnv> for WorkerEntity {
    async fn process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        if self.rec.is_deleted() && !self.own {
            if self.has_lock {
                self.set_has_lock(false, ctx.env);
            }
            ctx.close_self();
            return Ok(());
        }

        if let Some(stop) = self.rec.remote().map(|r| r.stop) {
            self.apply_stop(stop, ctx.env);
        }

        if self.own {
            self.keep_lock(ctx).await?;
        } else {
            self.watch_foreign(ctx).await?;
        }
        Ok(())
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
