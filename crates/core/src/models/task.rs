use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{RowImage, RowPatch};

/// 任务状态，两字母编码：A前缀=进行中，C前缀=已终结
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    /// AW: 等待分配
    Waiting,
    /// AE: 已分配执行中
    Executing,
    /// AS: 请求优雅停止
    Stopping,
    /// AC: 请求立即取消
    Cancelling,
    /// CS: 成功结束
    Succeeded,
    /// CF: 失败结束
    Failed,
    /// CC: 已取消
    Cancelled,
}

impl TaskState {
    pub fn as_code(&self) -> &'static str {
        match self {
            TaskState::Waiting => "AW",
            TaskState::Executing => "AE",
            TaskState::Stopping => "AS",
            TaskState::Cancelling => "AC",
            TaskState::Succeeded => "CS",
            TaskState::Failed => "CF",
            TaskState::Cancelled => "CC",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "AW" => Some(TaskState::Waiting),
            "AE" => Some(TaskState::Executing),
            "AS" => Some(TaskState::Stopping),
            "AC" => Some(TaskState::Cancelling),
            "CS" => Some(TaskState::Succeeded),
            "CF" => Some(TaskState::Failed),
            "CC" => Some(TaskState::Cancelled),
            _ => None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.as_code().starts_with('A')
    }

    pub fn is_closed(&self) -> bool {
        !self.is_open()
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_code())
    }
}

/// 调度周期单位
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PeriodUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
    Weeks,
    Months,
}

impl PeriodUnit {
    pub fn as_code(&self) -> &'static str {
        match self {
            PeriodUnit::Seconds => "SEC",
            PeriodUnit::Minutes => "MIN",
            PeriodUnit::Hours => "HOU",
            PeriodUnit::Days => "DAY",
            PeriodUnit::Weeks => "WEE",
            PeriodUnit::Months => "MON",
        }
    }

    pub fn from_code(code: &str) -> Option<Self> {
        match code {
            "SEC" => Some(PeriodUnit::Seconds),
            "MIN" => Some(PeriodUnit::Minutes),
            "HOU" => Some(PeriodUnit::Hours),
            "DAY" => Some(PeriodUnit::Days),
            "WEE" => Some(PeriodUnit::Weeks),
            "MON" => Some(PeriodUnit::Months),
            _ => None,
        }
    }
}

/// task表一行的镜像
#[derive(Debug, Clone)]
pub struct TaskRow {
    pub id: i64,
    pub state: TaskState,
    pub worker_id: Option<i32>,
    pub group_id: i32,
    pub next_start: Option<DateTime<Utc>>,
    pub sched_period_unit: Option<PeriodUnit>,
    pub sched_period_count: Option<i32>,
    pub sched_enabled: bool,
    pub cleanup_pending: bool,
    pub change_token: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl RowImage for TaskRow {
    type Patch = TaskPatch;

    fn row_id(&self) -> i64 {
        self.id
    }

    fn change_token(&self) -> Option<DateTime<Utc>> {
        self.change_token
    }
}

/// 任务行的暂存写集合
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub state: Option<TaskState>,
    /// 外层Some表示该字段被改写，内层None表示清空error列
    pub error: Option<Option<String>>,
}

impl RowPatch<TaskRow> for TaskPatch {
    fn is_empty(&self) -> bool {
        self.state.is_none() && self.error.is_none()
    }

    fn apply_to(&self, row: &mut TaskRow) {
        if let Some(state) = self.state {
            row.state = state;
        }
        if let Some(error) = &self.error {
            row.error = error.clone();
        }
    }
}

/// 启动任务所需的完整信息：行镜像加命令模板
#[derive(Debug, Clone)]
pub struct TaskSpawn {
    pub row: TaskRow,
    pub command: Vec<String>,
    pub cwd: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_codes_round_trip() {
        for code in ["AW", "AE", "AS", "AC", "CS", "CF", "CC"] {
            let state = TaskState::from_code(code).expect("未知状态码");
            assert_eq!(state.as_code(), code);
        }
        assert!(TaskState::from_code("XX").is_none());
    }

    #[test]
    fn test_open_closed_prefix() {
        assert!(TaskState::Waiting.is_open());
        assert!(TaskState::Stopping.is_open());
        assert!(TaskState::Cancelling.is_open());
        assert!(TaskState::Succeeded.is_closed());
        assert!(TaskState::Failed.is_closed());
        assert!(TaskState::Cancelled.is_closed());
    }

    #[test]
    fn test_patch_apply() {
        let mut row = TaskRow {
            id: 1,
            state: TaskState::Executing,
            worker_id: Some(1),
            group_id: 0,
            next_start: None,
            sched_period_unit: None,
            sched_period_count: None,
            sched_enabled: false,
            cleanup_pending: false,
            change_token: None,
            error: Some("old".to_string()),
        };
        let patch = TaskPatch {
            state: Some(TaskState::Succeeded),
            error: Some(None),
        };
        patch.apply_to(&mut row);
        assert_eq!(row.state, TaskState::Succeeded);
        assert!(row.error.is_none());
    }
}
