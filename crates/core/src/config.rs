use std::path::Path;

use chrono::Duration;
use config::{Config as ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::errors::{NodeError, Result};

/// 数据库连接配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connect_timeout_seconds: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "postgresql://localhost/longtask".to_string(),
            max_connections: 4,
            connect_timeout_seconds: 30,
        }
    }
}

/// 节点配置
///
/// 所有可调参数的静态类型定义。节点身份（worker_id、group_id、
/// max_task_count、node_name）在进程生命周期内不可变。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    /// 调试模式：实体处理异常直接上抛而不是退避吸收
    pub debug: bool,

    /// 本节点的worker编号，每个运行实例必须唯一
    pub worker_id: i32,
    /// 竞争组编号，同组节点竞争同一批任务
    pub group_id: i32,
    /// 本节点最大并发任务数
    pub max_task_count: i32,
    /// 节点显示名，默认为主机名
    pub node_name: String,

    /// 数据库schema名
    pub schema: String,
    /// 任务工作目录的根，相对cwd基于它解析；缺省为进程当前目录
    pub root_dir: Option<String>,

    /// worker锁续期周期的一半（锁有效期为它的两倍）
    pub half_locking_seconds: u64,
    /// 判定其他worker失效前额外等待的宽限期
    pub failed_worker_recovery_seconds: u64,
    /// worker表全量刷新周期
    pub workers_refresh_seconds: u64,
    /// task表刷新周期
    pub tasks_refresh_seconds: u64,
    /// 只为此时间窗之内的启动计划安排定时器，之外的等下次刷新
    pub schedule_horizon_seconds: u64,

    /// 实体处理失败后的最小重试延迟
    pub min_retry_seconds: u64,
    /// 实体处理失败后的最大重试延迟
    pub max_retry_seconds: u64,

    /// 进程状态轮询的最小间隔（每次未结束翻倍）
    pub min_process_poll_ms: u64,
    /// 进程状态轮询的最大间隔
    pub max_process_poll_ms: u64,
    /// 优雅终止未退出后升级为强杀的等待时间
    pub stop_kill_seconds: u64,

    /// 数据库连接失败后的最小重连延迟
    pub min_db_retry_seconds: u64,
    /// 数据库连接失败后的最大重连延迟
    pub max_db_retry_seconds: u64,

    pub database: DatabaseConfig,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            debug: false,
            worker_id: 1,
            group_id: 0,
            max_task_count: 1,
            node_name: hostname::get()
                .map(|h| h.to_string_lossy().to_string())
                .unwrap_or_else(|_| "unknown".to_string()),
            schema: "long_task".to_string(),
            root_dir: None,
            half_locking_seconds: 5,
            failed_worker_recovery_seconds: 5,
            workers_refresh_seconds: 30,
            tasks_refresh_seconds: 55 * 60,
            schedule_horizon_seconds: 60 * 60,
            min_retry_seconds: 1,
            max_retry_seconds: 60,
            min_process_poll_ms: 1000,
            max_process_poll_ms: 10000,
            stop_kill_seconds: 10,
            min_db_retry_seconds: 1,
            max_db_retry_seconds: 30,
            database: DatabaseConfig::default(),
        }
    }
}

impl NodeConfig {
    /// 加载配置：TOML文件 + LONGTASK_ 前缀环境变量覆盖。
    ///
    /// 显式传入的路径必须存在；未传入时依次尝试默认路径，都不存在则
    /// 使用内置默认值。
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_path {
            if !Path::new(path).exists() {
                return Err(NodeError::Configuration(format!("配置文件不存在: {path}")));
            }
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            let default_paths = ["config/longtask.toml", "longtask.toml", "/etc/longtask/config.toml"];
            for path in &default_paths {
                if Path::new(path).exists() {
                    builder = builder.add_source(File::new(path, FileFormat::Toml));
                    break;
                }
            }
        }

        builder = builder.add_source(
            Environment::with_prefix("LONGTASK")
                .separator("__")
                .try_parsing(true),
        );

        let config: NodeConfig = builder
            .build()
            .map_err(|e| NodeError::Configuration(format!("构建配置失败: {e}")))?
            .try_deserialize()
            .map_err(|e| NodeError::Configuration(format!("反序列化配置失败: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: NodeConfig = toml::from_str(toml_str)
            .map_err(|e| NodeError::Configuration(format!("解析TOML配置失败: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_task_count < 0 {
            return Err(NodeError::Configuration(
                "max_task_count不能为负数".to_string(),
            ));
        }
        if self.half_locking_seconds == 0 {
            return Err(NodeError::Configuration(
                "half_locking_seconds必须大于0".to_string(),
            ));
        }
        if self.min_retry_seconds > self.max_retry_seconds {
            return Err(NodeError::Configuration(
                "min_retry_seconds不能大于max_retry_seconds".to_string(),
            ));
        }
        if self.min_process_poll_ms == 0 || self.min_process_poll_ms > self.max_process_poll_ms {
            return Err(NodeError::Configuration(
                "进程轮询间隔配置无效".to_string(),
            ));
        }
        if self.min_db_retry_seconds == 0 || self.min_db_retry_seconds > self.max_db_retry_seconds {
            return Err(NodeError::Configuration(
                "数据库重连延迟配置无效".to_string(),
            ));
        }
        if self.database.url.is_empty() {
            return Err(NodeError::Configuration("database.url不能为空".to_string()));
        }
        Ok(())
    }

    pub fn half_locking_time(&self) -> Duration {
        Duration::seconds(self.half_locking_seconds as i64)
    }

    pub fn failed_worker_recovery_delay(&self) -> Duration {
        Duration::seconds(self.failed_worker_recovery_seconds as i64)
    }

    pub fn workers_refresh_interval(&self) -> Duration {
        Duration::seconds(self.workers_refresh_seconds as i64)
    }

    pub fn tasks_refresh_interval(&self) -> Duration {
        Duration::seconds(self.tasks_refresh_seconds as i64)
    }

    pub fn schedule_horizon(&self) -> Duration {
        Duration::seconds(self.schedule_horizon_seconds as i64)
    }

    pub fn min_retry_delay(&self) -> Duration {
        Duration::seconds(self.min_retry_seconds as i64)
    }

    pub fn max_retry_delay(&self) -> Duration {
        Duration::seconds(self.max_retry_seconds as i64)
    }

    pub fn min_process_poll(&self) -> Duration {
        Duration::milliseconds(self.min_process_poll_ms as i64)
    }

    pub fn max_process_poll(&self) -> Duration {
        Duration::milliseconds(self.max_process_poll_ms as i64)
    }

    pub fn stop_kill_timeout(&self) -> Duration {
        Duration::seconds(self.stop_kill_seconds as i64)
    }

    pub fn min_db_retry_delay(&self) -> Duration {
        Duration::seconds(self.min_db_retry_seconds as i64)
    }

    pub fn max_db_retry_delay(&self) -> Duration {
        Duration::seconds(self.max_db_retry_seconds as i64)
    }
}
