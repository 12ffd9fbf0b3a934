use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use longtask_core::{NodeError, Result};

/// 命令模板中替换为任务编号的占位符
pub const TASK_ID_PLACEHOLDER: &str = "%TASK";

/// stderr采集上限，只保留开头这么多字节作诊断
const STDERR_CAP: usize = 8192;

/// 任务OS进程的包装。
///
/// 生死由任务状态机轮询决定；stderr被截断采集，失败时写回任务行。
pub struct TaskProcess {
    task_id: i64,
    child: Child,
    stderr_buf: Arc<Mutex<Vec<u8>>>,
}

impl TaskProcess {
    /// 展开命令模板并启动进程。
    pub fn spawn(command: &[String], task_id: i64, cwd: &Path) -> Result<Self> {
        let argv: Vec<String> = command
            .iter()
            .map(|c| {
                if c == TASK_ID_PLACEHOLDER {
                    task_id.to_string()
                } else {
                    c.clone()
                }
            })
            .collect();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| NodeError::Process("任务命令为空".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .current_dir(cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .map_err(|e| NodeError::Process(format!("启动任务进程失败: {e}")))?;

        let stderr_buf = Arc::new(Mutex::new(Vec::new()));
        if let Some(mut stderr) = child.stderr.take() {
            let buf = Arc::clone(&stderr_buf);
            tokio::spawn(async move {
                let mut chunk = [0u8; 1024];
                loop {
                    match stderr.read(&mut chunk).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if let Ok(mut b) = buf.lock() {
                                let room = STDERR_CAP.saturating_sub(b.len());
                                b.extend_from_slice(&chunk[..n.min(room)]);
                            }
                        }
                    }
                }
            });
        }

        Ok(Self {
            task_id,
            child,
            stderr_buf,
        })
    }

    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// 非阻塞查询退出状态。
    pub fn poll(&mut self) -> Result<Option<std::process::ExitStatus>> {
        self.child
            .try_wait()
            .map_err(|e| NodeError::Process(format!("查询任务进程状态失败: {e}")))
    }

    /// 请求优雅终止（unix下发送SIGTERM），失败则退化为强杀。
    pub fn terminate(&mut self) {
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            match std::process::Command::new("kill").arg(pid.to_string()).output() {
                Ok(out) if out.status.success() => return,
                Ok(out) => warn!(
                    "任务{}发送终止信号失败: {}",
                    self.task_id,
                    String::from_utf8_lossy(&out.stderr).trim_end()
                ),
                Err(e) => warn!("任务{}执行kill命令失败: {e}", self.task_id),
            }
        }
        self.kill();
    }

    /// 立即强杀。
    pub fn kill(&mut self) {
        if let Err(e) = self.child.start_kill() {
            // 进程多半已经退出
            debug!("任务{}强杀失败: {e}", self.task_id);
        }
    }

    /// 已采集的stderr，供失败诊断。
    pub fn stderr_tail(&self) -> Option<String> {
        let buf = self.stderr_buf.lock().ok()?;
        if buf.is_empty() {
            None
        } else {
            Some(String::from_utf8_lossy(&buf).trim_end().to_string())
        }
    }
}

/// 解析任务工作目录：相对路径基于配置的根目录，缺省用进程当前目录。
pub fn resolve_cwd(root_dir: Option<&str>, cwd: Option<&str>) -> PathBuf {
    let root = root_dir
        .map(PathBuf::from)
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
    match cwd {
        None => root,
        Some(p) if Path::new(p).is_absolute() => PathBuf::from(p),
        Some(p) => root.join(p),
    }
}
