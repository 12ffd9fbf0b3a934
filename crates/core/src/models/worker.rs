use chrono::{DateTime, Utc};

use super::{RowImage, RowPatch};

/// worker表一行的镜像
///
/// stop为分级停机信号：0运行中，1-2排空，3中断执行中的任务，4及以上终止。
#[derive(Debug, Clone)]
pub struct WorkerRow {
    pub id: i32,
    pub active: bool,
    pub locked_until: Option<DateTime<Utc>>,
    pub stop: i32,
    pub task_count: i32,
    pub group_id: i32,
    pub node_name: Option<String>,
}

impl RowImage for WorkerRow {
    type Patch = WorkerPatch;

    fn row_id(&self) -> i64 {
        self.id as i64
    }

    // worker行没有乐观并发列，锁协议本身保证互斥
    fn change_token(&self) -> Option<DateTime<Utc>> {
        None
    }
}

/// worker行不走暂存写路径，锁状态变更都是直接写
#[derive(Debug, Clone, Default)]
pub struct WorkerPatch;

impl RowPatch<WorkerRow> for WorkerPatch {
    fn is_empty(&self) -> bool {
        true
    }

    fn apply_to(&self, _row: &mut WorkerRow) {}
}
