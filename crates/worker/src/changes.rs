use std::collections::BTreeSet;

use longtask_core::{NodeConfig, Result};
use longtask_scheduler::Controller;

use crate::env::NodeEnv;
use crate::refresh::{apply_task_rows, apply_worker_rows};
use crate::task::TaskEntity;
use crate::worker::WorkerEntity;
use crate::{KIND_TASK, KIND_WORKER};

/// 一张表在两轮调度之间积累的行变更。
#[derive(Debug, Default)]
pub struct ChangeSet {
    changed: BTreeSet<i64>,
    deleted: BTreeSet<i64>,
}

impl ChangeSet {
    /// 解析通知负载：`<I|U|D><空格><行id>`，格式不对的静默丢弃。
    pub fn note(&mut self, payload: &str) {
        let mut parts = payload.splitn(2, ' ');
        let (Some(op), Some(id)) = (parts.next(), parts.next()) else {
            return;
        };
        let Ok(id) = id.trim().parse::<i64>() else {
            return;
        };
        match op {
            "I" | "U" => {
                self.changed.insert(id);
            }
            "D" => {
                self.deleted.insert(id);
            }
            _ => {}
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.deleted.is_empty()
    }

    /// 取走积累的变更：（待重读的id，已删除的id）。
    pub fn take(&mut self) -> (Vec<i64>, Vec<i64>) {
        let deleted: Vec<i64> = std::mem::take(&mut self.deleted).into_iter().collect();
        let changed: Vec<i64> = std::mem::take(&mut self.changed)
            .into_iter()
            .filter(|id| !deleted.contains(id))
            .collect();
        (changed, deleted)
    }
}

/// 把两条通知通道的负载累积成变更集，在调度轮之间一次性兑现。
///
/// 变更上下文由运行循环显式持有，实体类型上没有任何静态可变状态。
pub struct ChangeRouter {
    pub worker_channel: String,
    pub task_channel: String,
    workers: ChangeSet,
    tasks: ChangeSet,
}

impl ChangeRouter {
    pub fn new(cfg: &NodeConfig) -> Self {
        Self {
            worker_channel: format!("!{}.worker", cfg.schema),
            task_channel: format!("!{}.task.{}", cfg.schema, cfg.group_id),
            workers: ChangeSet::default(),
            tasks: ChangeSet::default(),
        }
    }

    pub fn note(&mut self, channel: &str, payload: &str) {
        if channel == self.worker_channel {
            self.workers.note(payload);
        } else if channel == self.task_channel {
            self.tasks.note(payload);
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.workers.is_empty() || !self.tasks.is_empty()
    }

    /// 每张受影响的表发一次批量重读，删除按逻辑删除分发。
    pub async fn apply(
        &mut self,
        ctl: &mut Controller<NodeEnv>,
        env: &mut NodeEnv,
    ) -> Result<()> {
        if !self.workers.is_empty() {
            let (changed, deleted) = self.workers.take();
            if !changed.is_empty() {
                let ids: Vec<i32> = changed.iter().map(|&id| id as i32).collect();
                let rows = env.store.fetch_workers_by_ids(&ids).await?;
                apply_worker_rows(ctl, env, rows, None);
            }
            for id in deleted {
                if let Some(slot) = ctl.find(KIND_WORKER, id) {
                    ctl.with_entity::<WorkerEntity, _>(slot, |w| w.set_deleted());
                    ctl.signal(slot);
                }
            }
        }
        if !self.tasks.is_empty() {
            let (changed, deleted) = self.tasks.take();
            if !changed.is_empty() {
                let rows = env.store.fetch_tasks_by_ids(&changed).await?;
                apply_task_rows(ctl, env, rows, None);
            }
            for id in deleted {
                if let Some(slot) = ctl.find(KIND_TASK, id) {
                    ctl.with_entity::<TaskEntity, _>(slot, |t| t.set_deleted());
                    ctl.signal(slot);
                }
            }
        }
        Ok(())
    }
}
