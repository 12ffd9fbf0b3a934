//! 实体处理失败后的指数退避。
//!
//! 组合使用：控制器为带策略的实体维护一份退避状态，在派发前检查
//! 退避窗口，窗口未到则本次调用视为空转成功。

use chrono::{DateTime, Duration, Utc};

/// 指数退避参数
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub min: Duration,
    pub max: Duration,
}

#[derive(Debug)]
pub(crate) struct RetryState {
    policy: RetryPolicy,
    next_at: Option<DateTime<Utc>>,
    interval: Option<Duration>,
}

impl RetryState {
    pub(crate) fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            next_at: None,
            interval: None,
        }
    }

    /// 退避窗口未到时返回下次可执行时刻。
    pub(crate) fn suppressed_until(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.next_at.filter(|t| *t > now)
    }

    pub(crate) fn on_success(&mut self) {
        self.next_at = None;
        self.interval = None;
    }

    /// 记一次失败，返回下次重试时刻。连续失败延迟翻倍，封顶于max。
    pub(crate) fn on_failure(&mut self, now: DateTime<Utc>) -> DateTime<Utc> {
        let next = match self.interval {
            None => self.policy.min,
            Some(cur) => std::cmp::min(cur + cur, self.policy.max),
        };
        self.interval = Some(next);
        let at = now + next;
        self.next_at = Some(at);
        at
    }
}
