//! 节点运行循环。
//!
//! 单线程驱动：调度轮跑到安静，算出等待时限，然后同时等通知、
//! 定时器到点和终止信号；醒来后把积累的变更兑现为批量重读。
//! 连接级故障向上抛到重连层，控制器状态与执行中的OS进程在重连
//! 之间原样保留，恢复后做一次全量刷新对齐。

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgListener, PgPoolOptions};
use sqlx::PgPool;
use tracing::{error, info, warn};

use longtask_core::{NodeConfig, NodeError, Result};
use longtask_scheduler::{Controller, ErrorAction, Pass};

use crate::admission::StartMoreTasks;
use crate::changes::ChangeRouter;
use crate::env::NodeEnv;
use crate::postgres::PgStore;
use crate::refresh::{retry_policy, RefreshTasks, RefreshWorkers};
use crate::worker::WorkerEntity;
use crate::{
    KIND_ADMISSION, KIND_REFRESH_TASKS, KIND_REFRESH_WORKERS, KIND_WORKER, MAX_BATCH,
    PRIORITY_BANDS, PRIO_CONTROL,
};

/// 节点入口：建池、装实体、进入重连循环。
pub async fn run(cfg: NodeConfig) -> Result<()> {
    let cfg = Arc::new(cfg);
    let pool = PgPoolOptions::new()
        .max_connections(cfg.database.max_connections)
        .acquire_timeout(std::time::Duration::from_secs(
            cfg.database.connect_timeout_seconds,
        ))
        .connect_lazy(&cfg.database.url)
        .map_err(|e| NodeError::Configuration(format!("数据库连接串无效: {e}")))?;
    let store = Arc::new(PgStore::new(pool.clone(), cfg.schema.clone()));

    let mut env = NodeEnv::new(cfg.clone(), store);
    let mut ctl: Controller<NodeEnv> = Controller::new(PRIORITY_BANDS);
    bootstrap(&mut ctl, &mut env);

    info!(
        "节点启动: worker_id={} group_id={} max_task_count={} node={}",
        cfg.worker_id, cfg.group_id, cfg.max_task_count, cfg.node_name
    );

    let mut backoff = cfg.min_db_retry_delay();
    loop {
        match serve(&mut ctl, &mut env, &pool, &mut backoff).await {
            Ok(()) => {
                info!("节点已退出");
                return Ok(());
            }
            Err(e) => {
                error!(
                    "数据库连接故障，{}秒后重连: {e}",
                    backoff.num_seconds()
                );
                tokio::time::sleep(
                    backoff
                        .to_std()
                        .unwrap_or(std::time::Duration::from_secs(1)),
                )
                .await;
                backoff = (backoff + backoff).min(cfg.max_db_retry_delay());
                if env.should_exit() {
                    warn!("停机请求期间数据库不可达，放弃清理直接退出");
                    return Ok(());
                }
            }
        }
    }
}

/// 装入常驻实体：准入、两个刷新器、本节点的worker。
pub fn bootstrap(ctl: &mut Controller<NodeEnv>, env: &mut NodeEnv) {
    let retry = retry_policy(&env.cfg);
    ctl.spawn(
        StartMoreTasks::key(),
        PRIO_CONTROL,
        Some(retry),
        Box::new(StartMoreTasks),
    );
    let rw = ctl.spawn(
        RefreshWorkers::key(),
        PRIO_CONTROL,
        Some(retry),
        Box::new(RefreshWorkers::new()),
    );
    let rt = ctl.spawn(
        RefreshTasks::key(),
        PRIO_CONTROL,
        Some(retry),
        Box::new(RefreshTasks::new()),
    );
    let own = ctl.spawn(
        WorkerEntity::key(env.cfg.worker_id),
        PRIO_CONTROL,
        Some(retry),
        Box::new(WorkerEntity::new(env.cfg.worker_id, true)),
    );
    ctl.signal(rw);
    ctl.signal(rt);
    ctl.signal(own);
}

/// 调度轮跑到安静，期间兑现实体登记的信号请求。
/// 返回最近的未来定时器时刻。
pub async fn step(
    ctl: &mut Controller<NodeEnv>,
    env: &mut NodeEnv,
) -> Result<Option<DateTime<Utc>>> {
    loop {
        let debug = env.cfg.debug;
        let pass = ctl
            .run(env, MAX_BATCH, |key, err| {
                error!("实体{key}处理失败: {err}");
                if debug || err.is_connection_lost() {
                    ErrorAction::Abort
                } else {
                    ErrorAction::Contain
                }
            })
            .await?;
        let moved = drain_requests(ctl, env);
        match pass {
            Pass::Busy => continue,
            Pass::Idle(next) => {
                if moved {
                    continue;
                }
                return Ok(next);
            }
        }
    }
}

/// 兑现实体处理期间登记的跨实体信号请求。
fn drain_requests(ctl: &mut Controller<NodeEnv>, env: &mut NodeEnv) -> bool {
    let mut moved = false;
    if env.kick_admission {
        env.kick_admission = false;
        if let Some(slot) = ctl.find(KIND_ADMISSION, 0) {
            ctl.signal(slot);
            moved = true;
        }
    }
    if env.signal_tasks {
        env.signal_tasks = false;
        ctl.signal_kind(crate::KIND_TASK);
        moved = true;
    }
    if env.force_task_refresh {
        env.force_task_refresh = false;
        if let Some(slot) = ctl.find(KIND_REFRESH_TASKS, 0) {
            ctl.with_entity::<RefreshTasks, _>(slot, |r| r.force());
            ctl.signal(slot);
            moved = true;
        }
    }
    moved
}

/// 重连后的全量对齐：两个刷新器立即重跑，worker实体全部重估。
fn force_refresh(ctl: &mut Controller<NodeEnv>) {
    if let Some(slot) = ctl.find(KIND_REFRESH_WORKERS, 0) {
        ctl.with_entity::<RefreshWorkers, _>(slot, |r| r.force());
        ctl.signal(slot);
    }
    if let Some(slot) = ctl.find(KIND_REFRESH_TASKS, 0) {
        ctl.with_entity::<RefreshTasks, _>(slot, |r| r.force());
        ctl.signal(slot);
    }
    ctl.signal_kind(KIND_WORKER);
}

struct StopSignals {
    #[cfg(unix)]
    sigterm: tokio::signal::unix::Signal,
}

impl StopSignals {
    fn new() -> Result<Self> {
        #[cfg(unix)]
        {
            let sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .map_err(|e| NodeError::Internal(format!("安装SIGTERM处理器失败: {e}")))?;
            Ok(Self { sigterm })
        }
        #[cfg(not(unix))]
        {
            Ok(Self {})
        }
    }

    async fn recv(&mut self) {
        #[cfg(unix)]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = self.sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

/// 连上通知通道后的主循环；任何连接级错误抛回重连层。
async fn serve(
    ctl: &mut Controller<NodeEnv>,
    env: &mut NodeEnv,
    pool: &PgPool,
    backoff: &mut chrono::Duration,
) -> Result<()> {
    let mut router = ChangeRouter::new(&env.cfg);
    let mut listener = PgListener::connect_with(pool).await?;
    listener.listen(&router.worker_channel).await?;
    listener.listen(&router.task_channel).await?;

    force_refresh(ctl);
    let mut signals = StopSignals::new()?;

    loop {
        let next = step(ctl, env).await?;
        // 第一轮顺利跑完说明连接健康，重置重连退避
        *backoff = env.cfg.min_db_retry_delay();

        if env.should_exit() {
            shutdown(ctl, env).await?;
            return Ok(());
        }

        let wait = wait_duration(ctl.now(), next, env.cfg.debug);
        tokio::select! {
            notification = listener.recv() => {
                let n = notification?;
                router.note(n.channel(), n.payload());
                // 短窗口微批，把同一阵风里的通知并成一次重读
                loop {
                    match tokio::time::timeout(
                        std::time::Duration::from_millis(20),
                        listener.recv(),
                    )
                    .await
                    {
                        Ok(Ok(n)) => router.note(n.channel(), n.payload()),
                        Ok(Err(e)) => return Err(e.into()),
                        Err(_) => break,
                    }
                }
            }
            _ = tokio::time::sleep(wait) => {}
            _ = signals.recv() => {
                let level = env.escalate_stop();
                info!("收到终止信号，本地停机级别升至{level}");
            }
        }

        router.apply(ctl, env).await?;
    }
}

/// 排空完成后的收尾：释放全部持有的锁并去激活本节点的worker行。
async fn shutdown(ctl: &mut Controller<NodeEnv>, env: &mut NodeEnv) -> Result<()> {
    info!("开始退出，释放持有的锁");
    for slot in ctl.slots_of(KIND_WORKER) {
        let Some(mut entity) = ctl.take(slot) else {
            continue;
        };
        if let Some(w) = entity.as_any_mut().downcast_mut::<WorkerEntity>() {
            if w.has_lock() {
                if let Err(e) = w.unlock_and_deactivate(env).await {
                    error!("释放锁失败: {e}");
                }
            }
        }
        ctl.restore(slot, entity);
    }
    ctl.terminate();
    Ok(())
}

fn wait_duration(
    now: DateTime<Utc>,
    next: Option<DateTime<Utc>>,
    debug: bool,
) -> std::time::Duration {
    let cap = std::time::Duration::from_secs(if debug { 5 } else { 60 });
    match next {
        Some(t) => {
            let dt = t - now;
            if dt <= chrono::Duration::zero() {
                std::time::Duration::from_millis(100)
            } else {
                dt.to_std().map(|d| d.min(cap)).unwrap_or(cap)
            }
        }
        None => cap,
    }
}
