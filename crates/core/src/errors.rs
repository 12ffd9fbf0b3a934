use thiserror::Error;

/// 节点统一错误类型
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("任务进程错误: {0}")]
    Process(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl NodeError {
    /// 判断是否为连接级故障。
    ///
    /// 连接级故障会向上传播到重连层，其余错误在实体层面被退避重试吸收。
    pub fn is_connection_lost(&self) -> bool {
        match self {
            NodeError::Database(e) => matches!(
                e,
                sqlx::Error::Io(_)
                    | sqlx::Error::Tls(_)
                    | sqlx::Error::Protocol(_)
                    | sqlx::Error::PoolTimedOut
                    | sqlx::Error::PoolClosed
                    | sqlx::Error::WorkerCrashed
            ),
            _ => false,
        }
    }
}

/// 统一的Result类型
pub type Result<T> = std::result::Result<T, NodeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_lost_classification() {
        let io = NodeError::Database(sqlx::Error::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "reset",
        )));
        assert!(io.is_connection_lost());

        let row = NodeError::Database(sqlx::Error::RowNotFound);
        assert!(!row.is_connection_lost());

        let cfg = NodeError::Configuration("bad".to_string());
        assert!(!cfg.is_connection_lost());
    }
}
