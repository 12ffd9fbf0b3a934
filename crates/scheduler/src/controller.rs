//! 活动实体控制器。
//!
//! 控制器统一持有定时器索引、就绪队列和按标识排序的实体索引。
//! `run`执行一轮调度：先把到期定时器转成信号，再按优先级FIFO派发
//! 一批信号；处理期间产生的信号和定时器只在下一轮被观察到。

use std::any::Any;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::warn;

use longtask_core::{NodeError, Result};

use crate::list::{ItemRef, ReadyQueue};
use crate::retry::{RetryPolicy, RetryState};
use crate::tree::{AvlArena, NodeRef};

/// 实体标识：类型标签内唯一
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct EntityKey {
    pub kind: &'static str,
    pub id: i64,
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{}", self.kind, self.id)
    }
}

/// 实体在控制器内的槽位句柄
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot(pub(crate) usize);

/// 可被调度的实体行为。
///
/// `process`在每次被信号唤醒时调用；实体通过[`Ctx`]重新安排自己的
/// 定时器、发信号或请求销毁。
#[async_trait(?Send)]
pub trait ActiveEntity<E>: Any {
    async fn process(&mut self, ctx: &mut Ctx<'_, E>) -> Result<()>;

    /// 槽位销毁时的清理钩子。
    fn on_close(&mut self, _env: &mut E) {}

    fn as_any_mut(&mut self) -> &mut dyn Any;
}

/// 一轮调度的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pass {
    /// 本轮处理过实体，调用方应继续执行下一轮
    Busy,
    /// 没有就绪实体；携带最近的未来定时器时刻
    Idle(Option<DateTime<Utc>>),
}

/// 实体处理失败后的处置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// 吞掉错误，退避重试已安排
    Contain,
    /// 上抛终止本轮（连接级故障或调试模式）
    Abort,
}

struct Cell<E> {
    key: EntityKey,
    priority: usize,
    wake_at: Option<DateTime<Utc>>,
    timer: Option<NodeRef>,
    queued: Option<ItemRef>,
    id_node: NodeRef,
    retry: Option<RetryState>,
    entity: Option<Box<dyn ActiveEntity<E>>>,
    closing: bool,
}

pub struct Controller<E> {
    cells: Vec<Option<Cell<E>>>,
    free: Vec<usize>,
    timers: AvlArena<(DateTime<Utc>, usize)>,
    by_id: AvlArena<EntityKey>,
    ready: ReadyQueue,
    clock: Option<DateTime<Utc>>,
    terminated: bool,
}

/// 实体process调用期间可见的调度接口。
///
/// `ctl`与`env`是独立字段，可以分别可变借用。
pub struct Ctx<'a, E> {
    pub ctl: &'a mut Controller<E>,
    pub env: &'a mut E,
    cur: Slot,
    now: DateTime<Utc>,
    close_cur: bool,
}

impl<E: 'static> Ctx<'_, E> {
    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn slot(&self) -> Slot {
        self.cur
    }

    pub fn schedule(&mut self, t: DateTime<Utc>) {
        self.ctl.schedule(self.cur, t);
    }

    pub fn schedule_delay(&mut self, delay: Duration) -> DateTime<Utc> {
        let t = self.now + delay;
        self.ctl.schedule(self.cur, t);
        t
    }

    pub fn signal_self(&mut self) {
        self.ctl.signal(self.cur);
    }

    /// 时刻是否已到；未到则顺手把定时器安排到该时刻。
    pub fn reached(&mut self, t: Option<DateTime<Utc>>) -> bool {
        match t {
            None => true,
            Some(t) if t <= self.now => true,
            Some(t) => {
                let cur = self.cur;
                self.ctl.schedule(cur, t);
                false
            }
        }
    }

    /// 请求在本次process返回后销毁当前实体。
    pub fn close_self(&mut self) {
        self.close_cur = true;
    }

    pub fn is_closing(&self) -> bool {
        self.close_cur
    }

    /// 销毁另一个实体。
    pub fn close(&mut self, slot: Slot) {
        let Ctx { ctl, env, .. } = self;
        ctl.close(slot, env);
    }
}

impl<E: 'static> Controller<E> {
    pub fn new(priority_bands: usize) -> Self {
        Self {
            cells: Vec::new(),
            free: Vec::new(),
            timers: AvlArena::new(),
            by_id: AvlArena::new(),
            ready: ReadyQueue::new(priority_bands),
            clock: None,
            terminated: false,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.unwrap_or_else(Utc::now)
    }

    /// 切换到仿真时钟（测试与多节点模拟用）。
    pub fn set_time(&mut self, t: DateTime<Utc>) {
        self.clock = Some(t);
    }

    pub fn advance_time(&mut self, d: Duration) {
        self.clock = Some(self.now() + d);
    }

    pub fn terminate(&mut self) {
        self.terminated = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn spawn(
        &mut self,
        key: EntityKey,
        priority: usize,
        retry: Option<RetryPolicy>,
        entity: Box<dyn ActiveEntity<E>>,
    ) -> Slot {
        assert!(
            self.find(key.kind, key.id).is_none(),
            "实体已存在: {key}"
        );
        assert!(priority < self.ready.bands(), "优先级越界");
        let idx = self.free.pop().unwrap_or_else(|| {
            self.cells.push(None);
            self.cells.len() - 1
        });
        let id_node = self.by_id.insert(key, idx);
        self.cells[idx] = Some(Cell {
            key,
            priority,
            wake_at: None,
            timer: None,
            queued: None,
            id_node,
            retry: retry.map(RetryState::new),
            entity: Some(entity),
            closing: false,
        });
        Slot(idx)
    }

    pub fn find(&self, kind: &'static str, id: i64) -> Option<Slot> {
        self.by_id
            .find(&EntityKey { kind, id })
            .map(|r| Slot(self.by_id.value(r)))
    }

    pub fn key_of(&self, slot: Slot) -> Option<EntityKey> {
        self.cells
            .get(slot.0)
            .and_then(Option::as_ref)
            .map(|c| c.key)
    }

    /// 某类型的全部槽位，按id升序。
    pub fn slots_of(&self, kind: &'static str) -> Vec<Slot> {
        let mut out = Vec::new();
        let mut cur = self.by_id.lower_bound(&EntityKey { kind, id: i64::MIN });
        while let Some(r) = cur {
            let key = *self.by_id.key(r);
            if key.kind != kind {
                break;
            }
            out.push(Slot(self.by_id.value(r)));
            cur = self.by_id.successor(r);
        }
        out
    }

    pub fn ids_of(&self, kind: &'static str) -> Vec<i64> {
        self.slots_of(kind)
            .into_iter()
            .filter_map(|s| self.key_of(s).map(|k| k.id))
            .collect()
    }

    /// 给某类型的全部实体发信号。
    pub fn signal_kind(&mut self, kind: &'static str) {
        for slot in self.slots_of(kind) {
            self.signal(slot);
        }
    }

    /// 标记实体立即可运行；对已就绪实体是幂等空操作。
    pub fn signal(&mut self, slot: Slot) {
        let (priority, already) = match self.cells.get(slot.0).and_then(Option::as_ref) {
            Some(c) => (c.priority, c.queued.is_some()),
            None => return,
        };
        if already {
            return;
        }
        let item = self.ready.push_back(priority, slot.0);
        if let Some(c) = self.cells[slot.0].as_mut() {
            c.queued = Some(item);
        }
    }

    pub fn is_signaled(&self, slot: Slot) -> bool {
        self.cells
            .get(slot.0)
            .and_then(Option::as_ref)
            .is_some_and(|c| c.queued.is_some())
    }

    /// 安排或提前定时器；比已安排时刻晚的请求是空操作。
    pub fn schedule(&mut self, slot: Slot, t: DateTime<Utc>) {
        let existing = {
            let Some(cell) = self.cells.get_mut(slot.0).and_then(Option::as_mut) else {
                return;
            };
            if cell.wake_at.is_some_and(|cur| t >= cur) {
                return;
            }
            cell.wake_at = Some(t);
            cell.timer.take()
        };
        if let Some(r) = existing {
            self.timers.remove(r);
        }
        let r = self.timers.insert((t, slot.0), slot.0);
        if let Some(cell) = self.cells[slot.0].as_mut() {
            cell.timer = Some(r);
        }
    }

    pub fn is_scheduled(&self, slot: Slot) -> bool {
        self.cells
            .get(slot.0)
            .and_then(Option::as_ref)
            .is_some_and(|c| c.timer.is_some())
    }

    pub fn wake_at(&self, slot: Slot) -> Option<DateTime<Utc>> {
        self.cells
            .get(slot.0)
            .and_then(Option::as_ref)
            .and_then(|c| c.wake_at)
    }

    pub fn unschedule(&mut self, slot: Slot) {
        let timer = match self.cells.get_mut(slot.0).and_then(Option::as_mut) {
            Some(c) => {
                c.wake_at = None;
                c.timer.take()
            }
            None => return,
        };
        if let Some(r) = timer {
            self.timers.remove(r);
        }
    }

    /// 清掉定时器和信号，但保留实体。
    pub fn deactivate(&mut self, slot: Slot) {
        self.unschedule(slot);
        let queued = match self.cells.get_mut(slot.0).and_then(Option::as_mut) {
            Some(c) => c.queued.take(),
            None => return,
        };
        if let Some(item) = queued {
            self.ready.remove(item);
        }
    }

    /// 取出实体行为对象；用完必须`restore`。
    pub fn take(&mut self, slot: Slot) -> Option<Box<dyn ActiveEntity<E>>> {
        self.cells
            .get_mut(slot.0)
            .and_then(Option::as_mut)
            .and_then(|c| c.entity.take())
    }

    pub fn restore(&mut self, slot: Slot, entity: Box<dyn ActiveEntity<E>>) {
        match self.cells.get_mut(slot.0).and_then(Option::as_mut) {
            Some(c) if !c.closing => c.entity = Some(entity),
            _ => warn!("restore时槽位已销毁，实体被丢弃"),
        }
    }

    /// 对具体类型的实体执行一个同步闭包。
    pub fn with_entity<T: 'static, R>(
        &mut self,
        slot: Slot,
        f: impl FnOnce(&mut T) -> R,
    ) -> Option<R> {
        let mut entity = self.take(slot)?;
        let result = entity.as_any_mut().downcast_mut::<T>().map(f);
        self.restore(slot, entity);
        result
    }

    /// 销毁实体：触发on_close并释放槽位。
    ///
    /// 若实体正被派发（行为对象已取出），只做标记，派发结束时完成销毁。
    pub fn close(&mut self, slot: Slot, env: &mut E) {
        let mut entity = match self.cells.get_mut(slot.0).and_then(Option::as_mut) {
            Some(c) => match c.entity.take() {
                Some(e) => e,
                None => {
                    c.closing = true;
                    return;
                }
            },
            None => return,
        };
        entity.on_close(env);
        self.remove_cell(slot);
    }

    fn remove_cell(&mut self, slot: Slot) {
        let Some(cell) = self.cells[slot.0].take() else {
            return;
        };
        if let Some(r) = cell.timer {
            self.timers.remove(r);
        }
        if let Some(item) = cell.queued {
            self.ready.remove(item);
        }
        self.by_id.remove(cell.id_node);
        self.free.push(slot.0);
    }

    fn finish_dispatch(
        &mut self,
        env: &mut E,
        slot: Slot,
        close_requested: bool,
        mut entity: Box<dyn ActiveEntity<E>>,
    ) {
        let closing = close_requested
            || self
                .cells
                .get(slot.0)
                .and_then(Option::as_ref)
                .map_or(true, |c| c.closing);
        if closing {
            entity.on_close(env);
            if self.cells.get(slot.0).is_some_and(Option::is_some) {
                self.remove_cell(slot);
            }
        } else if let Some(c) = self.cells[slot.0].as_mut() {
            c.entity = Some(entity);
        }
    }

    /// 执行一轮调度。
    ///
    /// 1. 把到期定时器转成信号，记录最近的未来时刻；
    /// 2. 从就绪队列按优先级弹出至多`max_batch`个实体快照后逐个派发；
    /// 3. 没有就绪实体时返回`Idle(最近时刻)`。
    ///
    /// 实体失败时退避定时器已安排好，再由`on_error`决定吞掉还是上抛。
    pub async fn run<F>(&mut self, env: &mut E, max_batch: usize, mut on_error: F) -> Result<Pass>
    where
        F: FnMut(&EntityKey, &NodeError) -> ErrorAction,
    {
        let now = self.now();

        let mut next_deadline = None;
        while let Some(r) = self.timers.leftmost() {
            let (t, idx) = *self.timers.key(r);
            if t > now {
                next_deadline = Some(t);
                break;
            }
            self.timers.remove(r);
            if let Some(cell) = self.cells[idx].as_mut() {
                cell.timer = None;
                cell.wake_at = None;
            }
            self.signal(Slot(idx));
        }

        // 先取快照：派发期间新产生的信号留到下一轮
        let mut batch = Vec::new();
        while batch.len() < max_batch {
            match self.ready.pop_front() {
                Some(idx) => {
                    if let Some(cell) = self.cells[idx].as_mut() {
                        cell.queued = None;
                    }
                    batch.push(idx);
                }
                None => break,
            }
        }
        if batch.is_empty() {
            return Ok(Pass::Idle(next_deadline));
        }

        let mut pending = batch.into_iter();
        while let Some(idx) = pending.next() {
            if self.terminated {
                // 终止时把没轮到的实体放回队列
                self.signal(Slot(idx));
                for rest in pending.by_ref() {
                    self.signal(Slot(rest));
                }
                break;
            }
            let slot = Slot(idx);
            let Some(cell) = self.cells[idx].as_ref() else {
                continue;
            };
            let key = cell.key;
            if let Some(suppressed) = cell
                .retry
                .as_ref()
                .and_then(|rs| rs.suppressed_until(now))
            {
                // 退避窗口未到：视为空转成功，窗口结束时再醒来
                self.schedule(slot, suppressed);
                continue;
            }
            let Some(mut entity) = self.cells[idx].as_mut().and_then(|c| c.entity.take()) else {
                continue;
            };

            let mut ctx = Ctx {
                ctl: &mut *self,
                env: &mut *env,
                cur: slot,
                now,
                close_cur: false,
            };
            let result = entity.process(&mut ctx).await;
            let close_requested = ctx.close_cur;

            match result {
                Ok(()) => {
                    if let Some(rs) = self.cells[idx].as_mut().and_then(|c| c.retry.as_mut()) {
                        rs.on_success();
                    }
                    self.finish_dispatch(env, slot, close_requested, entity);
                }
                Err(e) => {
                    let retry_at = self.cells[idx]
                        .as_mut()
                        .and_then(|c| c.retry.as_mut())
                        .map(|rs| rs.on_failure(now));
                    if let Some(at) = retry_at {
                        self.schedule(slot, at);
                    }
                    let action = on_error(&key, &e);
                    self.finish_dispatch(env, slot, close_requested, entity);
                    if matches!(action, ErrorAction::Abort) {
                        return Err(e);
                    }
                }
            }
        }
        Ok(Pass::Busy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct TestEnv {
        log: Vec<i64>,
        closed: Vec<i64>,
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    struct Echo {
        id: i64,
    }

    #[async_trait(?Send)]
    impl ActiveEntity<TestEnv> for Echo {
        async fn process(&mut self, ctx: &mut Ctx<'_, TestEnv>) -> Result<()> {
            ctx.env.log.push(self.id);
            Ok(())
        }

        fn on_close(&mut self, env: &mut TestEnv) {
            env.closed.push(self.id);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct SelfSignal {
        remaining: u32,
    }

    #[async_trait(?Send)]
    impl ActiveEntity<TestEnv> for SelfSignal {
        async fn process(&mut self, ctx: &mut Ctx<'_, TestEnv>) -> Result<()> {
            ctx.env.log.push(self.remaining as i64);
            if self.remaining > 0 {
                self.remaining -= 1;
                ctx.signal_self();
            }
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct Failer {
        fails_left: u32,
        calls: Rc<RefCell<u32>>,
    }

    #[async_trait(?Send)]
    impl ActiveEntity<TestEnv> for Failer {
        async fn process(&mut self, _ctx: &mut Ctx<'_, TestEnv>) -> Result<()> {
            *self.calls.borrow_mut() += 1;
            if self.fails_left > 0 {
                self.fails_left -= 1;
                return Err(NodeError::Internal("预期失败".to_string()));
            }
            Ok(())
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    struct CloseSelf;

    #[async_trait(?Send)]
    impl ActiveEntity<TestEnv> for CloseSelf {
        async fn process(&mut self, ctx: &mut Ctx<'_, TestEnv>) -> Result<()> {
            ctx.close_self();
            Ok(())
        }

        fn on_close(&mut self, env: &mut TestEnv) {
            env.closed.push(99);
        }

        fn as_any_mut(&mut self) -> &mut dyn Any {
            self
        }
    }

    fn contain(_k: &EntityKey, _e: &NodeError) -> ErrorAction {
        ErrorAction::Contain
    }

    #[tokio::test]
    async fn test_timer_fires_into_signal() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            None,
            Box::new(Echo { id: 1 }),
        );
        ctl.schedule(slot, t0() + Duration::seconds(5));

        let pass = ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(pass, Pass::Idle(Some(t0() + Duration::seconds(5))));
        assert!(env.log.is_empty());

        ctl.set_time(t0() + Duration::seconds(5));
        assert_eq!(ctl.run(&mut env, 10, contain).await.unwrap(), Pass::Busy);
        assert_eq!(env.log, vec![1]);
        assert!(!ctl.is_scheduled(slot));

        assert_eq!(
            ctl.run(&mut env, 10, contain).await.unwrap(),
            Pass::Idle(None)
        );
    }

    #[tokio::test]
    async fn test_signal_is_idempotent() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            None,
            Box::new(Echo { id: 1 }),
        );
        ctl.signal(slot);
        ctl.signal(slot);
        ctl.signal(slot);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(env.log, vec![1]);
    }

    #[tokio::test]
    async fn test_schedule_later_is_noop() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        ctl.set_time(t0());
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            None,
            Box::new(Echo { id: 1 }),
        );
        ctl.schedule(slot, t0() + Duration::seconds(10));
        ctl.schedule(slot, t0() + Duration::seconds(20));
        assert_eq!(ctl.wake_at(slot), Some(t0() + Duration::seconds(10)));
        // 更早的时刻会提前
        ctl.schedule(slot, t0() + Duration::seconds(3));
        assert_eq!(ctl.wake_at(slot), Some(t0() + Duration::seconds(3)));
    }

    #[tokio::test]
    async fn test_fifo_order_and_priority_bands() {
        let mut ctl: Controller<TestEnv> = Controller::new(2);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let a = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            1,
            None,
            Box::new(Echo { id: 1 }),
        );
        let b = ctl.spawn(
            EntityKey { kind: "e", id: 2 },
            0,
            None,
            Box::new(Echo { id: 2 }),
        );
        let c = ctl.spawn(
            EntityKey { kind: "e", id: 3 },
            0,
            None,
            Box::new(Echo { id: 3 }),
        );
        ctl.signal(a);
        ctl.signal(b);
        ctl.signal(c);
        ctl.run(&mut env, 10, contain).await.unwrap();
        // 低编号优先级先排空，组内FIFO
        assert_eq!(env.log, vec![2, 3, 1]);
    }

    #[tokio::test]
    async fn test_reentrant_signal_lands_next_pass() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            None,
            Box::new(SelfSignal { remaining: 2 }),
        );
        ctl.signal(slot);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(env.log, vec![2]);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(env.log, vec![2, 1]);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(env.log, vec![2, 1, 0]);
        assert_eq!(
            ctl.run(&mut env, 10, contain).await.unwrap(),
            Pass::Idle(None)
        );
    }

    #[tokio::test]
    async fn test_retry_backoff_suppresses_calls() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let calls = Rc::new(RefCell::new(0u32));
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            Some(RetryPolicy {
                min: Duration::seconds(1),
                max: Duration::seconds(8),
            }),
            Box::new(Failer {
                fails_left: 2,
                calls: calls.clone(),
            }),
        );
        ctl.signal(slot);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(ctl.wake_at(slot), Some(t0() + Duration::seconds(1)));

        // 退避窗口内的信号被吸收
        ctl.signal(slot);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(*calls.borrow(), 1);

        // 窗口到期：定时器唤醒，再失败一次，延迟翻倍
        ctl.set_time(t0() + Duration::seconds(1));
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(*calls.borrow(), 2);
        assert_eq!(ctl.wake_at(slot), Some(t0() + Duration::seconds(3)));

        // 第三次成功，退避清零
        ctl.set_time(t0() + Duration::seconds(3));
        ctl.run(&mut env, 10, contain).await.unwrap();
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(*calls.borrow(), 3);
        assert!(ctl.wake_at(slot).is_none());
    }

    #[tokio::test]
    async fn test_abort_propagates_error() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let calls = Rc::new(RefCell::new(0u32));
        let slot = ctl.spawn(
            EntityKey { kind: "e", id: 1 },
            0,
            None,
            Box::new(Failer {
                fails_left: 1,
                calls,
            }),
        );
        ctl.signal(slot);
        let res = ctl
            .run(&mut env, 10, |_k, _e| ErrorAction::Abort)
            .await;
        assert!(res.is_err());
        // 实体归还在位
        assert!(ctl.find("e", 1).is_some());
        assert!(ctl.take(slot).is_some());
    }

    #[tokio::test]
    async fn test_close_self_evicts_entity() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        let slot = ctl.spawn(EntityKey { kind: "e", id: 5 }, 0, None, Box::new(CloseSelf));
        ctl.schedule(slot, t0() + Duration::seconds(60));
        ctl.signal(slot);
        ctl.run(&mut env, 10, contain).await.unwrap();
        assert_eq!(env.closed, vec![99]);
        assert!(ctl.find("e", 5).is_none());
        assert_eq!(
            ctl.run(&mut env, 10, contain).await.unwrap(),
            Pass::Idle(None)
        );
    }

    #[tokio::test]
    async fn test_find_and_kind_enumeration() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        ctl.set_time(t0());
        for id in [3i64, 1, 2] {
            ctl.spawn(
                EntityKey { kind: "a", id },
                0,
                None,
                Box::new(Echo { id }),
            );
        }
        ctl.spawn(
            EntityKey { kind: "b", id: 9 },
            0,
            None,
            Box::new(Echo { id: 9 }),
        );
        assert_eq!(ctl.ids_of("a"), vec![1, 2, 3]);
        assert_eq!(ctl.ids_of("b"), vec![9]);
        assert!(ctl.find("a", 2).is_some());
        assert!(ctl.find("a", 4).is_none());
    }

    #[tokio::test]
    async fn test_max_batch_defers_remainder() {
        let mut ctl: Controller<TestEnv> = Controller::new(1);
        let mut env = TestEnv::default();
        ctl.set_time(t0());
        for id in 1i64..=5 {
            let slot = ctl.spawn(
                EntityKey { kind: "e", id },
                0,
                None,
                Box::new(Echo { id }),
            );
            ctl.signal(slot);
        }
        ctl.run(&mut env, 3, contain).await.unwrap();
        assert_eq!(env.log, vec![1, 2, 3]);
        ctl.run(&mut env, 3, contain).await.unwrap();
        assert_eq!(env.log, vec![1, 2, 3, 4, 5]);
    }
}
