pub mod task;
pub mod worker;

pub use task::{PeriodUnit, TaskPatch, TaskRow, TaskSpawn, TaskState};
pub use worker::{WorkerPatch, WorkerRow};

use chrono::{DateTime, Utc};

/// 同步记录层对行镜像的最小要求。
pub trait RowImage: Clone {
    type Patch: RowPatch<Self> + Default;

    fn row_id(&self) -> i64;

    /// 乐观并发令牌：远端该字段变化则本地覆盖层作废。
    fn change_token(&self) -> Option<DateTime<Utc>>;
}

/// 未提交的本地字段覆盖层。
pub trait RowPatch<R> {
    fn is_empty(&self) -> bool;

    /// 把覆盖层中的字段叠加到行镜像上。
    fn apply_to(&self, row: &mut R);
}
