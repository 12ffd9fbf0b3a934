//! 多节点模拟的公共设施：共享仿真时钟与内存版存储。

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};

use longtask_core::{NodeConfig, Result, TaskPatch, TaskRow, TaskSpawn, TaskState, WorkerRow};
use longtask_scheduler::Controller;
use longtask_worker::store::{LockRequest, Store};
use longtask_worker::{node, NodeEnv, PRIORITY_BANDS};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// 所有模拟节点共用的可推进时钟。
#[derive(Clone)]
pub struct TestClock(Arc<Mutex<DateTime<Utc>>>);

impl TestClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self(Arc::new(Mutex::new(start)))
    }

    pub fn now(&self) -> DateTime<Utc> {
        *self.0.lock().expect("时钟锁")
    }

    pub fn advance(&self, d: Duration) -> DateTime<Utc> {
        let mut t = self.0.lock().expect("时钟锁");
        *t += d;
        *t
    }
}

#[derive(Default)]
struct MemInner {
    workers: BTreeMap<i32, WorkerRow>,
    tasks: BTreeMap<i64, TaskRow>,
    commands: BTreeMap<i64, (Vec<String>, Option<String>)>,
    save_calls: BTreeMap<i64, u32>,
    recover_calls: u32,
}

/// 内存版存储：锁语义与存储过程语义按SQL边界复刻，时间取自仿真时钟。
pub struct MemStore {
    clock: TestClock,
    inner: Mutex<MemInner>,
}

impl MemStore {
    pub fn new(clock: TestClock) -> Arc<Self> {
        Arc::new(Self {
            clock,
            inner: Mutex::new(MemInner::default()),
        })
    }

    pub fn insert_task(&self, row: TaskRow, command: Vec<String>, cwd: Option<String>) {
        let mut inner = self.inner.lock().expect("存储锁");
        inner.commands.insert(row.id, (command, cwd));
        inner.tasks.insert(row.id, row);
    }

    pub fn task(&self, id: i64) -> Option<TaskRow> {
        self.inner.lock().expect("存储锁").tasks.get(&id).cloned()
    }

    pub fn worker(&self, id: i32) -> Option<WorkerRow> {
        self.inner.lock().expect("存储锁").workers.get(&id).cloned()
    }

    pub fn mutate_task(&self, id: i64, f: impl FnOnce(&mut TaskRow)) {
        let mut inner = self.inner.lock().expect("存储锁");
        if let Some(row) = inner.tasks.get_mut(&id) {
            f(row);
        }
    }

    pub fn save_calls(&self, id: i64) -> u32 {
        self.inner
            .lock()
            .expect("存储锁")
            .save_calls
            .get(&id)
            .copied()
            .unwrap_or(0)
    }

    pub fn recover_calls(&self) -> u32 {
        self.inner.lock().expect("存储锁").recover_calls
    }
}

#[async_trait]
impl Store for MemStore {
    async fn fetch_workers(&self) -> Result<Vec<WorkerRow>> {
        Ok(self
            .inner
            .lock()
            .expect("存储锁")
            .workers
            .values()
            .cloned()
            .collect())
    }

    async fn fetch_workers_by_ids(&self, ids: &[i32]) -> Result<Vec<WorkerRow>> {
        let inner = self.inner.lock().expect("存储锁");
        Ok(ids
            .iter()
            .filter_map(|id| inner.workers.get(id).cloned())
            .collect())
    }

    async fn fetch_worker(&self, id: i32) -> Result<Option<WorkerRow>> {
        Ok(self.inner.lock().expect("存储锁").workers.get(&id).cloned())
    }

    async fn fetch_group_tasks(
        &self,
        group_id: i32,
        horizon: DateTime<Utc>,
        known: &[i64],
    ) -> Result<Vec<TaskRow>> {
        let inner = self.inner.lock().expect("存储锁");
        Ok(inner
            .tasks
            .values()
            .filter(|t| {
                (t.group_id == group_id
                    && (t.state.is_open()
                        || t.next_start.map(|ns| ns < horizon).unwrap_or(false)))
                    || known.contains(&t.id)
            })
            .cloned()
            .collect())
    }

    async fn fetch_tasks_by_ids(&self, ids: &[i64]) -> Result<Vec<TaskRow>> {
        let inner = self.inner.lock().expect("存储锁");
        Ok(ids
            .iter()
            .filter_map(|id| inner.tasks.get(id).cloned())
            .collect())
    }

    async fn fetch_task(&self, id: i64) -> Result<Option<TaskRow>> {
        Ok(self.inner.lock().expect("存储锁").tasks.get(&id).cloned())
    }

    async fn fetch_task_spawn(&self, id: i64) -> Result<Option<TaskSpawn>> {
        let inner = self.inner.lock().expect("存储锁");
        let Some(row) = inner.tasks.get(&id).cloned() else {
            return Ok(None);
        };
        let (command, cwd) = inner.commands.get(&id).cloned().unwrap_or_default();
        Ok(Some(TaskSpawn { row, command, cwd }))
    }

    async fn lock_worker(&self, req: &LockRequest) -> Result<Option<DateTime<Utc>>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("存储锁");
        let worker = inner
            .workers
            .entry(req.worker_id)
            .or_insert_with(|| WorkerRow {
                id: req.worker_id,
                active: true,
                locked_until: None,
                stop: 0,
                task_count: 0,
                group_id: req.group_id.max(0),
                node_name: None,
            });
        let current = worker.locked_until;
        let acquirable =
            current.map(|c| c < now).unwrap_or(true) || current == req.expected;
        if acquirable {
            worker.locked_until = Some(req.new_until);
            if req.group_id >= 0 {
                worker.active = true;
                worker.group_id = req.group_id;
                worker.node_name = Some(req.node_name.clone());
            }
            if req.task_count >= 0 {
                worker.task_count = req.task_count;
            }
            Ok(None)
        } else {
            Ok(current)
        }
    }

    async fn unlock_worker(&self, id: i32, task_count: i32) -> Result<()> {
        let mut inner = self.inner.lock().expect("存储锁");
        if let Some(worker) = inner.workers.get_mut(&id) {
            worker.active = false;
            worker.locked_until = None;
            worker.task_count = task_count;
        }
        Ok(())
    }

    async fn recover_worker_tasks(&self, id: i32) -> Result<()> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("存储锁");
        inner.recover_calls += 1;
        for task in inner.tasks.values_mut() {
            if task.worker_id == Some(id) && task.state.is_open() {
                task.state = TaskState::Waiting;
                task.worker_id = None;
                task.change_token = Some(now);
            }
        }
        Ok(())
    }

    async fn start_task(&self, group_id: i32, worker_id: i32) -> Result<Option<i64>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock().expect("存储锁");
        let id = inner
            .tasks
            .values()
            .find(|t| t.group_id == group_id && t.state == TaskState::Waiting && t.worker_id.is_none())
            .map(|t| t.id);
        if let Some(id) = id {
            let task = inner.tasks.get_mut(&id).expect("刚查到的行");
            task.state = TaskState::Executing;
            task.worker_id = Some(worker_id);
            task.change_token = Some(now);
            task.error = None;
        }
        Ok(id)
    }

    async fn sched_start(&self, id: i64) -> Result<Option<i64>> {
        let mut inner = self.inner.lock().expect("存储锁");
        let Some(def) = inner.tasks.get(&id).cloned() else {
            return Ok(None);
        };
        let new_id = inner.tasks.keys().max().copied().unwrap_or(0) + 1;
        let command = inner.commands.get(&id).cloned().unwrap_or_default();
        inner.commands.insert(new_id, command);
        inner.tasks.insert(
            new_id,
            TaskRow {
                id: new_id,
                state: TaskState::Waiting,
                worker_id: None,
                group_id: def.group_id,
                next_start: None,
                sched_period_unit: None,
                sched_period_count: None,
                sched_enabled: false,
                cleanup_pending: false,
                change_token: None,
                error: None,
            },
        );
        Ok(Some(new_id))
    }

    async fn save_task(
        &self,
        id: i64,
        patch: &TaskPatch,
        token: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("存储锁");
        *inner.save_calls.entry(id).or_insert(0) += 1;
        let Some(state) = patch.state else {
            return Ok(true);
        };
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        let open = matches!(
            task.state,
            TaskState::Executing | TaskState::Stopping | TaskState::Cancelling
        );
        if !open || (token.is_some() && task.change_token != token) {
            return Ok(false);
        }
        task.state = state;
        if let Some(error) = &patch.error {
            task.error = error.clone();
        }
        Ok(true)
    }

    async fn advance_next_start(
        &self,
        id: i64,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().expect("存储锁");
        let Some(task) = inner.tasks.get_mut(&id) else {
            return Ok(false);
        };
        if task.next_start != from {
            return Ok(false);
        }
        task.next_start = to;
        Ok(true)
    }
}

/// 一个模拟节点：控制器 + 运行时上下文，时钟手动推进。
pub struct SimNode {
    pub ctl: Controller<NodeEnv>,
    pub env: NodeEnv,
}

impl SimNode {
    pub fn new(store: Arc<MemStore>, worker_id: i32, clock: &TestClock) -> Self {
        let cfg = NodeConfig {
            worker_id,
            group_id: 0,
            max_task_count: 1,
            node_name: format!("sim-{worker_id}"),
            half_locking_seconds: 5,
            failed_worker_recovery_seconds: 5,
            min_process_poll_ms: 10,
            max_process_poll_ms: 100,
            ..NodeConfig::default()
        };
        let mut env = NodeEnv::new(Arc::new(cfg), store);
        let mut ctl: Controller<NodeEnv> = Controller::new(PRIORITY_BANDS);
        ctl.set_time(clock.now());
        node::bootstrap(&mut ctl, &mut env);
        Self { ctl, env }
    }

    /// 把控制器推到当前仿真时刻并跑到安静。
    pub async fn step(&mut self, clock: &TestClock) {
        self.ctl.set_time(clock.now());
        let _ = node::step(&mut self.ctl, &mut self.env)
            .await
            .expect("调度轮不应失败");
    }
}

pub fn task_row(id: i64) -> TaskRow {
    TaskRow {
        id,
        state: TaskState::Waiting,
        worker_id: None,
        group_id: 0,
        next_start: None,
        sched_period_unit: None,
        sched_period_count: None,
        sched_enabled: false,
        cleanup_pending: false,
        change_token: None,
        error: None,
    }
}

pub fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}
