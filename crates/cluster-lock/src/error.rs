//! 集群锁错误类型
//!
//! 区分配置错误、调用方误用（未加锁即解锁）、锁被抢占以及存储层故障。

use cluster_lock_shared::error::SharedError;
use thiserror::Error;

/// 集群锁错误类型
#[derive(Debug, Error)]
pub enum ClusterLockError {
    // === 配置错误 ===
    #[error("锁管理器配置无效: {0}")]
    Config(String),

    // === 锁状态错误 ===
    #[error("锁未被持有，无法解锁: {name}")]
    NotLocked { name: String },

    #[error("锁 {name} 已被 {} 抢占", .owner.as_deref().unwrap_or("未知集群节点"))]
    Stolen { name: String, owner: Option<String> },

    #[error("等待锁时被中断: {name}")]
    Interrupted { name: String },

    #[error("锁管理器已关闭")]
    ManagerShutdown,

    #[error("不支持的操作: {0}")]
    Unsupported(&'static str),

    // === 存储错误 ===
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("锁存储错误: {0}")]
    Store(String),
}

/// 集群锁 Result 类型别名
pub type Result<T> = std::result::Result<T, ClusterLockError>;

impl From<SharedError> for ClusterLockError {
    fn from(err: SharedError) -> Self {
        match err {
            SharedError::Database(e) => Self::Database(e),
            SharedError::Config(e) => Self::Config(e.to_string()),
            SharedError::Validation(msg) => Self::Config(msg),
        }
    }
}

impl ClusterLockError {
    /// 获取错误码
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "LOCK_CONFIG_INVALID",
            Self::NotLocked { .. } => "LOCK_NOT_LOCKED",
            Self::Stolen { .. } => "LOCK_STOLEN",
            Self::Interrupted { .. } => "LOCK_INTERRUPTED",
            Self::ManagerShutdown => "LOCK_MANAGER_SHUTDOWN",
            Self::Unsupported(_) => "UNSUPPORTED",
            Self::Database(_) => "DATABASE_ERROR",
            Self::Store(_) => "STORE_ERROR",
        }
    }

    /// 检查是否为可重试的错误（存储层瞬时故障）
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Database(_) | Self::Store(_))
    }

    /// 检查是否为锁语义错误（调用方需要按正确性问题处理，而不是重试）
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::NotLocked { .. } | Self::Stolen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stolen_message_names_owner() {
        let err = ClusterLockError::Stolen {
            name: "resource-1".to_string(),
            owner: Some("node-b".to_string()),
        };
        assert_eq!(err.to_string(), "锁 resource-1 已被 node-b 抢占");
        assert_eq!(err.code(), "LOCK_STOLEN");
    }

    #[test]
    fn test_stolen_message_without_owner() {
        let err = ClusterLockError::Stolen {
            name: "resource-1".to_string(),
            owner: None,
        };
        assert!(err.to_string().contains("未知集群节点"));
    }

    #[test]
    fn test_error_classification() {
        let not_locked = ClusterLockError::NotLocked {
            name: "r".to_string(),
        };
        assert!(not_locked.is_lock_error());
        assert!(!not_locked.is_retryable());

        let db = ClusterLockError::Database(sqlx::Error::PoolTimedOut);
        assert!(db.is_retryable());
        assert!(!db.is_lock_error());

        assert!(!ClusterLockError::ManagerShutdown.is_retryable());
        assert_eq!(
            ClusterLockError::Unsupported("conditions").code(),
            "UNSUPPORTED"
        );
    }

    #[test]
    fn test_from_shared_error() {
        let err: ClusterLockError = SharedError::Validation("database.url 不能为空".to_string()).into();
        assert_eq!(err.code(), "LOCK_CONFIG_INVALID");

        let err: ClusterLockError = SharedError::Database(sqlx::Error::PoolTimedOut).into();
        assert!(err.is_retryable());
    }
}
