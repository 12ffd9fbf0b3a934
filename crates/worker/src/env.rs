use std::sync::Arc;

use longtask_core::NodeConfig;

use crate::store::Store;

/// 本节点worker租约的本地镜像，任务状态机据此决策。
#[derive(Debug, Clone, Copy, Default)]
pub struct LeaseView {
    pub has_lock: bool,
    pub stop: i32,
}

/// 贯穿调度器与所有实体的运行时上下文。
///
/// 进程级可变状态（执行计数、停机级别、闩锁）集中在这里，
/// 而不是散落的全局变量。
pub struct NodeEnv {
    pub cfg: Arc<NodeConfig>,
    pub store: Arc<dyn Store>,

    /// 本地正在执行的任务进程数
    pub executing: i32,
    /// 为恢复他人任务而临时持有的外来锁数量
    pub locked_foreign: i32,
    /// “没有更多AW任务”闩锁，刷新看到AW行时清除
    pub no_more_waiting: bool,
    /// 本地停机级别，与worker行的stop取较大者生效
    pub local_stop: i32,
    pub lease: LeaseView,

    // 实体处理期间登记、本轮结束统一兑现的信号请求
    pub kick_admission: bool,
    pub signal_tasks: bool,
    pub force_task_refresh: bool,
}

impl NodeEnv {
    pub fn new(cfg: Arc<NodeConfig>, store: Arc<dyn Store>) -> Self {
        Self {
            cfg,
            store,
            executing: 0,
            locked_foreign: 0,
            no_more_waiting: false,
            local_stop: 0,
            lease: LeaseView::default(),
            kick_admission: false,
            signal_tasks: false,
            force_task_refresh: false,
        }
    }

    /// 生效的停机级别。
    pub fn effective_stop(&self) -> i32 {
        self.lease.stop.max(self.local_stop)
    }

    /// 是否还能领取新任务。
    pub fn can_start_more(&self) -> bool {
        self.executing < self.cfg.max_task_count
            && self.lease.has_lock
            && self.effective_stop() == 0
    }

    /// 有余力时请求唤醒任务领取实体。
    pub fn request_admission(&mut self) {
        if !self.no_more_waiting && self.can_start_more() {
            self.kick_admission = true;
        }
    }

    /// 排空完成、外来锁全部归还后节点才能退出。
    pub fn should_exit(&self) -> bool {
        self.effective_stop() > 1 && self.executing == 0 && self.locked_foreign == 0
    }

    /// 收到终止信号：第一次进入排空，再次收到升级为硬中断。
    pub fn escalate_stop(&mut self) -> i32 {
        self.local_stop = if self.local_stop >= 2 { 3 } else { 2 };
        self.signal_tasks = true;
        self.local_stop
    }
}
