use async_trait::async_trait;
use tracing::error;

use longtask_core::Result;
use longtask_scheduler::{ActiveEntity, Ctx, EntityKey};

use crate::env::NodeEnv;
use crate::refresh::retry_policy;
use crate::task::TaskEntity;
use crate::{KIND_ADMISSION, KIND_TASK, PRIO_TASK};

/// 任务准入实体：并发额度没用满时领取等待中的任务。
///
/// 每轮最多领一个，领到后给自己再发信号；领不到则落下“没有更多
/// 等待任务”的闩锁，由刷新或通知看到AW行时清除。
pub struct StartMoreTasks;

impl StartMoreTasks {
    pub fn key() -> EntityKey {
        EntityKey {
            kind: KIND_ADMISSION,
            id: 0,
        }
    }
}

#[async_trait(?Send)]
impl ActiveEntity<NodeEnv> for StartMoreTasks {
    async fn process(&mut self, ctx: &mut Ctx<'_, NodeEnv>) -> Result<()> {
        if !ctx.env.can_start_more() {
            return Ok(());
        }
        let group_id = ctx.env.cfg.group_id;
        let worker_id = ctx.env.cfg.worker_id;

        let Some(id) = ctx.env.store.start_task(group_id, worker_id).await? else {
            ctx.env.no_more_waiting = true;
            return Ok(());
        };
        // 领到一个，下一轮再试下一个
        ctx.signal_self();

        let Some(spawn) = ctx.env.store.fetch_task_spawn(id).await? else {
            return Ok(());
        };
        let slot = match ctx.ctl.find(KIND_TASK, id) {
            Some(s) => s,
            None => ctx.ctl.spawn(
                TaskEntity::key(id),
                PRIO_TASK,
                Some(retry_policy(&ctx.env.cfg)),
                Box::new(TaskEntity::new(id)),
            ),
        };
        let Some(mut entity) = ctx.ctl.take(slot) else {
            return Ok(());
        };
        let claim_result = match entity.as_any_mut().downcast_mut::<TaskEntity>() {
            Some(task) => task.claim(ctx.env, spawn).await,
            None => Ok(()),
        };
        // 启动异常只落一次失败状态
        let mut follow_up = Ok(());
        if let Err(e) = claim_result {
            error!("任务{id}: 启动失败: {e}");
            if let Some(task) = entity.as_any_mut().downcast_mut::<TaskEntity>() {
                follow_up = task
                    .fail(ctx.env, Some(e.to_string()), false, false)
                    .await
                    .map(|_| ());
            }
        }
        ctx.ctl.restore(slot, entity);
        ctx.ctl.signal(slot);
        follow_up
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
