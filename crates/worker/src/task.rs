use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::{error, info, warn};

use longtask_core::{NodeConfig, Result, TaskRow, TaskSpawn, TaskState};
use longtask_scheduler::{ActiveEntity, Ctx, EntityKey};

use crate::env::NodeEnv;
use crate::period;
use crate::process::{resolve_cwd, TaskProcess};
use crate::refresh::upsert_task_row;
use crate::sync::SyncedState;
use crate::KIND_TASK;

/// 正在进行的停止流程
#[derive(Debug, Clone, Copy)]
enum StopRequest {
    /// 已发优雅终止信号，超时后升级强杀
    Graceful { kill_at: DateTime<Utc> },
    /// 强杀已发出或取消已登记，退出一律记为取消
    Cancel,
}

/// task行实体：任务生命周期状态机。
///
/// 每次process把三路信号合并决策：远端行的状态与归属、本地OS进程的
/// 存活、本节点的租约。进程存活靠轮询，间隔从最小值起每次翻倍，进程
/// 启动或收到停止请求时重置以保证响应性。
pub struct TaskEntity {
    id: i64,
    rec: SyncedState<TaskRow>,
    proc: Option<TaskProcess>,
    /// 领取时的变更令牌；远端令牌移动说明行已被别人动过
    claim_token: Option<DateTime<Utc>>,
    next_check: Option<DateTime<Utc>>,
    check_interval: Duration,
    next_start: Option<DateTime<Utc>>,
    stopping: Option<StopRequest>,
    remote_close_seen: bool,
}

impl TaskEntity {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            rec: SyncedState::new(),
            proc: None,
            claim_token: None,
            next_check: None,
            check_interval: Duration::zero(),
            next_start: None,
            stopping: None,
            remote_close_seen: false,
        }
    }

    pub fn key(id: i64) -> EntityKey {
        EntityKey { kind: KIND_TASK, id }
    }

    /// 行是否属于本节点的内存工作集：组匹配，且有启用的启动计划
    /// 或正开放地分配给本节点。
    pub fn interesting(row: &TaskRow, cfg: &NodeConfig) -> bool {
        if row.group_id != cfg.group_id {
            return false;
        }
        if row.next_start.is_some() && row.sched_enabled {
            return true;
        }
        if row.state == TaskState::Waiting {
            return false;
        }
        match row.worker_id {
            Some(w) if w == cfg.worker_id => row.state.is_open(),
            _ => false,
        }
    }

    pub fn apply_remote(&mut self, row: TaskRow) {
        self.rec.set_remote(row);
    }

    pub fn set_deleted(&mut self) {
        self.rec.set_deleted();
    }

    pub fn has_process(&self) -> bool {
        self.proc.is_some()
    }

    fn set_process(&mut self, proc: Option<TaskProcess>, env: &mut NodeEnv) {
        match (&self.proc, &proc) {
            (None, Some(_)) => env.executing += 1,
            (Some(_), None) => {
                env.executing -= 1;
                env.request_admission();
            }
            _ => {}
        }
        self.proc = proc;
    }

    fn kill_process(&mut self, env: &mut NodeEnv) {
        if let Some(p) = self.proc.as_mut() {
            p.kill();
            self.set_process(None, env);
        }
    }

    /// 领取后启动OS进程，随后强制重读行镜像。
    pub async fn claim(&mut self, env: &mut NodeEnv, spawn: TaskSpawn) -> Result<()> {
        if let Some(p) = self.proc.as_mut() {
            match p.poll()? {
                Some(_) => self.set_process(None, env),
                None => {
                    return Err(longtask_core::NodeError::Process(format!(
                        "任务{}进程仍在运行，拒绝重复启动",
                        self.id
                    )))
                }
            }
        }
        self.claim_token = spawn.row.change_token;
        self.rec.set_remote(spawn.row.clone());

        let cwd = resolve_cwd(env.cfg.root_dir.as_deref(), spawn.cwd.as_deref());
        let proc = TaskProcess::spawn(&spawn.command, self.id, &cwd)?;
        self.set_process(Some(proc), env);
        self.next_check = None;
        self.stopping = None;
        self.remote_close_seen = false;

        match env.store.fetch_task(self.id).await? {
            Some(row) => self.rec.set_remote(row),
            None => self.rec.set_deleted(),
        }
        info!("任务{}: 已启动 {:?}", self.id, spawn.command);
        Ok(())
    }

    /// 暂存的状态字段做一次条件写；落空按冲突处理并强迫重读。
    async fn save(&mut self, env: &mut NodeEnv, token: Option<DateTime<Utc>>) -> Result<bool> {
        let ok = env.store.save_task(self.id, self.rec.pending(), token).await?;
        if ok {
            self.rec.committed();
        } else {
            self.rec.conflicted();
            if env.cfg.debug {
                warn!("任务{}: 状态条件更新落空，丢弃本地覆盖层", self.id);
            }
        }
        Ok(ok)
    }

    /// 记为失败或已取消，并确保本地进程不再存在。
    pub async fn fail(
        &mut self,
        env: &mut NodeEnv,
        error_msg: Option<String>,
        cancelled: bool,
        force: bool,
    ) -> Result<bool> {
        let state = if cancelled {
            TaskState::Cancelled
        } else {
            TaskState::Failed
        };
        let staged_error = error_msg.clone();
        self.rec.stage(|p| {
            p.state = Some(state);
            p.error = Some(staged_error);
        });
        let token = if force { None } else { self.claim_token };
        let saved = self.save(env, token).await?;
        self.kill_process(env);
        if cancelled {
            info!("任务{}: 已取消", self.id);
        } else {
            error!("任务{}: 失败: {}", self.id, error_msg.as_deref().unwrap_or("未知原因"));
        }
        Ok(saved)
    }

    /// 记为成功结束。
    pub async fn complete(&mut self, env: &mut NodeEnv) -> Result<bool> {
        self.rec.stage(|p| {
            p.state = Some(TaskState::Succeeded);
            p.error = Some(None);
        });
        let saved = self.save(env, self.claim_token).await?;
        if saved {
            info!("任务{}: 执行成功", self.id);
        }
        Ok(saved)
    }

    fn caught_by_other_side(&mut self, ctx: &mut Ctx<'_, NodeEnv>) {
        error!("任务{}: 已被对方接管，杀死本地进程", self.id);
        self.kill_process(ctx.env);
        // 下一轮再做收尾评估
        ctx.signal_self();
    }

    /// 对照远端行状态处理进程归属与停止请求。
    async fn reconcile_remote(&mut self, ctx: &mut Ctx<'_, NodeEnv>, row: &TaskRow) -> Result<()> {
        let now = ctx.now();
        if self.proc.is_some() {
            let foreign = row.worker_id != Some(ctx.env.cfg.worker_id)
                || row.change_token != self.claim_token;
            if foreign {
                self.caught_by_other_side(ctx);
                return Ok(());
            }
            match row.state {
                TaskState::Cancelling => {
                    self.stopping = Some(StopRequest::Cancel);
                    self.fail(ctx.env, Some("任务已取消".to_string()), true, false)
                        .await?;
                }
                TaskState::Stopping => {
                    if self.stopping.is_none() {
                        info!("任务{}: 收到优雅停止请求", self.id);
                        if let Some(p) = self.proc.as_mut() {
                            p.terminate();
                        }
                        let kill_at = now + ctx.env.cfg.stop_kill_timeout();
                        self.stopping = Some(StopRequest::Graceful { kill_at });
                        // 加快确认退出
                        self.next_check = None;
                        ctx.schedule(kill_at);
                    }
                }
                TaskState::Executing => {}
                s if s.is_closed() => {
                    if !self.remote_close_seen {
                        self.remote_close_seen = true;
                        // 任务自己在库里写了结束态，加快确认进程退出
                        self.next_check = None;
                    }
                }
                _ => self.caught_by_other_side(ctx),
            }
        } else if ctx.env.lease.has_lock && row.worker_id == Some(ctx.env.cfg.worker_id) {
            match row.state {
                TaskState::Cancelling => {
                    self.fail(ctx.env, Some("任务已取消".to_string()), true, true)
                        .await?;
                }
                TaskState::Executing | TaskState::Stopping => {
                    // 行显示在本节点执行但本地没有进程
                    self.fail(ctx.env, Some("任务进程不存在".to_string()), false, true)
                        .await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// 轮询OS进程；间隔翻倍封顶，退出时按停止流程与退出码落状态。
    async fn poll_process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        if self.proc.is_none() {
            return Ok(());
        }
        let now = ctx.now();
        if self.next_check.is_none() {
            self.check_interval = ctx.env.cfg.min_process_poll();
        }
        if !ctx.reached(self.next_check) {
            return Ok(());
        }
        let status = match self.proc.as_mut() {
            Some(p) => p.poll()?,
            None => None,
        };
        match status {
            None => {
                if let Some(StopRequest::Graceful { kill_at }) = self.stopping {
                    if now >= kill_at {
                        warn!("任务{}: 优雅停止超时，强制杀死", self.id);
                        if let Some(p) = self.proc.as_mut() {
                            p.kill();
                        }
                        self.stopping = Some(StopRequest::Cancel);
                    } else {
                        ctx.schedule(kill_at);
                    }
                }
                let t = now + self.check_interval;
                self.next_check = Some(t);
                ctx.schedule(t);
                let doubled = self.check_interval + self.check_interval;
                self.check_interval = doubled.min(ctx.env.cfg.max_process_poll());
            }
            Some(status) => {
                let code = status.code();
                let tail = self.proc.as_ref().and_then(|p| p.stderr_tail());
                self.next_check = None;
                self.set_process(None, ctx.env);
                match self.stopping.take() {
                    Some(StopRequest::Cancel) => {
                        self.fail(ctx.env, Some("任务已取消".to_string()), true, false)
                            .await?;
                    }
                    Some(StopRequest::Graceful { .. }) => {
                        if code == Some(0) {
                            self.complete(ctx.env).await?;
                        } else {
                            self.fail(ctx.env, Some("任务已取消".to_string()), true, false)
                                .await?;
                        }
                    }
                    None => {
                        if code == Some(0) {
                            self.complete(ctx.env).await?;
                        } else {
                            let msg = match (code, tail) {
                                (Some(c), Some(t)) => format!("退出码{c}: {t}"),
                                (Some(c), None) => format!("退出码{c}"),
                                (None, Some(t)) => format!("被信号终止: {t}"),
                                (None, None) => "被信号终止".to_string(),
                            };
                            self.fail(ctx.env, Some(msg), false, false).await?;
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// next_start到点后推进周期计划并实例化下一次运行。
    /// 条件更新保证竞争节点中只有一个赢得推进权。
    async fn advance_schedule(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        let Some(ns) = self.next_start else {
            return Ok(());
        };
        if !self.reached_limited(ctx, ns) {
            return Ok(());
        }
        if !ctx.env.lease.has_lock || ctx.env.effective_stop() != 0 {
            return Ok(());
        }
        if self.rec.remote().is_none() {
            match ctx.env.store.fetch_task(self.id).await? {
                Some(row) => self.rec.set_remote(row),
                None => {
                    self.rec.set_deleted();
                    ctx.signal_self();
                    return Ok(());
                }
            }
        }
        let Some(row) = self.rec.remote().cloned() else {
            return Ok(());
        };
        if !row.sched_enabled || row.cleanup_pending {
            return Ok(());
        }

        let next = match (row.sched_period_unit, row.sched_period_count) {
            (Some(unit), Some(count)) => period::next_occurrence(ns, ctx.now(), unit, count),
            _ => None,
        };
        if ctx.env.store.advance_next_start(self.id, Some(ns), next).await? {
            self.next_start = next;
            if let Some(t) = next {
                self.schedule_limited(ctx, t);
            }
            self.rec.invalidate();
            if let Some(new_id) = ctx.env.store.sched_start(self.id).await? {
                info!("任务{}: 周期到点，实例化新任务{}", self.id, new_id);
                if let Some(new_row) = ctx.env.store.fetch_task(new_id).await? {
                    upsert_task_row(ctx.ctl, ctx.env, new_row);
                }
            }
        } else {
            // 别的节点赢了推进竞赛
            self.next_start = None;
            self.rec.invalidate();
        }
        Ok(())
    }

    /// 太远的唤醒不安排定时器，让实体可以卸载，之后由周期刷新重新装入。
    fn schedule_limited(&self, ctx: &mut Ctx<'_, NodeEnv>, t: DateTime<Utc>) {
        if t < ctx.now() + ctx.env.cfg.schedule_horizon() {
            ctx.schedule(t);
        }
    }

    fn reached_limited(&self, ctx: &mut Ctx<'_, NodeEnv>, t: DateTime<Utc>) -> bool {
        if t <= ctx.now() {
            true
        } else {
            self.schedule_limited(ctx, t);
            false
        }
    }
}

#[async_trait(?Send)]
impl ActiveEntity<NodeEnv> for TaskEntity {
    async fn process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        // 硬停机：持锁则把执行中的任务记为被中断，然后卸载
        if ctx.env.effective_stop() >= 3 {
            if ctx.env.lease.has_lock && self.proc.is_some() {
                self.fail(ctx.env, Some("任务被停机中断".to_string()), false, true)
                    .await?;
            }
            ctx.close_self();
            return Ok(());
        }

        if self.rec.is_deleted() {
            self.kill_process(ctx.env);
            ctx.close_self();
            return Ok(());
        }

        // 失去租约时本地还在跑的进程一律按被接管处理
        if self.proc.is_some() && !ctx.env.lease.has_lock {
            self.caught_by_other_side(ctx);
            return Ok(());
        }

        if let Some(row) = self.rec.remote().cloned() {
            self.next_start = row.next_start;
            self.reconcile_remote(ctx, &row).await?;
        }

        self.poll_process(ctx).await?;
        self.advance_schedule(ctx).await?;

        // 卸载纪律：无进程、无定时器、无信号则从内存撤出
        let slot = ctx.slot();
        if !ctx.is_closing()
            && self.proc.is_none()
            && !ctx.ctl.is_signaled(slot)
            && !ctx.ctl.is_scheduled(slot)
        {
            ctx.close_self();
        }
        Ok(())
    }

    fn on_close(&mut self, env: &mut NodeEnv) {
        if self.proc.is_some() {
            warn!("任务{}: 卸载时进程仍在，杀死", self.id);
            self.kill_process(env);
        }
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
