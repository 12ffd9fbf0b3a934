use async_trait::async_trait;
use chrono::{DateTime, Utc};

use longtask_core::{Result, TaskPatch, TaskRow, TaskSpawn, WorkerRow};

/// worker锁调用的参数。
///
/// `group_id`与`task_count`为负表示外来探测/抢占，服务端保持这两列原值。
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub worker_id: i32,
    pub group_id: i32,
    pub node_name: String,
    pub task_count: i32,
    pub new_until: DateTime<Utc>,
    pub expected: Option<DateTime<Utc>>,
}

/// 共享存储的RPC边界。
///
/// 生产实现是[`crate::postgres::PgStore`]；测试用内存实现驱动多节点模拟。
#[async_trait]
pub trait Store: Send + Sync {
    async fn fetch_workers(&self) -> Result<Vec<WorkerRow>>;
    async fn fetch_workers_by_ids(&self, ids: &[i32]) -> Result<Vec<WorkerRow>>;
    async fn fetch_worker(&self, id: i32) -> Result<Option<WorkerRow>>;

    /// 本组内所有进行中的、或将在时间窗内启动的任务，外加指定的已加载行。
    async fn fetch_group_tasks(
        &self,
        group_id: i32,
        horizon: DateTime<Utc>,
        known: &[i64],
    ) -> Result<Vec<TaskRow>>;
    async fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<TaskRow>>;
    async fn fetch_task(&self, id: i64) -> Result<Option<TaskRow>>;
    /// 行镜像加启动命令模板。
    async fn fetch_task_spawn(&self, id: i64) -> Result<Option<TaskSpawn>>;

    /// 原子的“获取或续期或报告当前到期”调用。
    /// 返回None表示锁已属于请求方，否则为当前持有者的到期时刻。
    async fn lock_worker(&self, req: &LockRequest) -> Result<Option<DateTime<Utc>>>;
    /// 释放锁并把worker行置为不活跃，记录最终任务数。
    async fn unlock_worker(&self, id: i32, task_count: i32) -> Result<()>;
    /// 把该worker名下所有未结束任务重置为未分配等待态。
    async fn recover_worker_tasks(&self, id: i32) -> Result<()>;

    /// 领取一个等待中的任务，返回其编号；没有可领任务时返回None。
    async fn start_task(&self, group_id: i32, worker_id: i32) -> Result<Option<i64>>;
    /// 为周期定义实例化下一次运行。
    async fn sched_start(&self, id: i64) -> Result<Option<i64>>;

    /// 按(id, 令牌)条件写入暂存字段；false表示没有命中行（冲突）。
    async fn save_task(
        &self,
        id: i64,
        patch: &TaskPatch,
        token: Option<DateTime<Utc>>,
    ) -> Result<bool>;
    /// 条件推进next_start，竞争节点中只有一个会成功。
    async fn advance_next_start(
        &self,
        id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<bool>;
}
