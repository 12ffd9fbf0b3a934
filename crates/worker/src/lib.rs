//! 节点的Postgres侧实现。
//!
//! 共享表中的worker与task行被镜像为调度器里的活动实体；行级锁协议
//! 保证同一worker编号同一时刻只被一个节点持有，任务状态机监督本地
//! OS进程并以乐观并发方式把结果写回共享表。

pub mod admission;
pub mod changes;
pub mod env;
pub mod node;
pub mod period;
pub mod postgres;
pub mod process;
pub mod refresh;
pub mod store;
pub mod sync;
pub mod task;
pub mod worker;

pub use env::{LeaseView, NodeEnv};
pub use node::run;
pub use postgres::PgStore;
pub use store::{LockRequest, Store};

/// 实体类型标签
pub const KIND_WORKER: &str = "w";
pub const KIND_TASK: &str = "t";
pub const KIND_ADMISSION: &str = "sm";
pub const KIND_REFRESH_WORKERS: &str = "rw";
pub const KIND_REFRESH_TASKS: &str = "rt";

/// 控制类实体优先于任务实体派发
pub const PRIO_CONTROL: usize = 0;
pub const PRIO_TASK: usize = 1;
pub const PRIORITY_BANDS: usize = 2;

/// 每轮调度最多派发的实体数
pub const MAX_BATCH: usize = 10;
