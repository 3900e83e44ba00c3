//! 数据库连接管理模块
//!
//! 锁表所在的 PostgreSQL 连接池。集群锁的每次加锁、解锁各占用一个连接完成一个短事务，
//! 续约任务额外占用一个，连接池上限应大于并发等锁的调用方数量。

use crate::config::DatabaseConfig;
use crate::error::{Result, SharedError};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{info, instrument};

/// 数据库连接池包装
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// 创建数据库连接池并验证连通性
    #[instrument(skip(config), fields(max_connections = config.max_connections))]
    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        if config.url.trim().is_empty() {
            return Err(SharedError::Validation("database.url 不能为空".to_string()));
        }
        if config.min_connections > config.max_connections {
            return Err(SharedError::Validation(format!(
                "database.min_connections ({}) 不能大于 max_connections ({})",
                config.min_connections, config.max_connections
            )));
        }

        let pool = pool_options(config).connect(&config.url).await?;
        let database = Self { pool };
        database.health_check().await?;

        info!("Lock store connection pool ready");
        Ok(database)
    }

    /// 获取连接池引用
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// 健康检查
    pub async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// 关闭连接池，等待已借出的连接归还
    pub async fn close(&self) {
        self.pool.close().await;
        info!("Lock store connection pool closed");
    }
}

fn pool_options(config: &DatabaseConfig) -> PgPoolOptions {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.connect_timeout_seconds))
        .idle_timeout(Duration::from_secs(config.idle_timeout_seconds))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_url_rejected() {
        let config = DatabaseConfig {
            url: "  ".to_string(),
            ..Default::default()
        };
        let err = Database::connect(&config).await.err().unwrap();
        assert_eq!(err.code(), "VALIDATION_ERROR");
    }

    #[tokio::test]
    async fn test_inverted_pool_bounds_rejected() {
        let config = DatabaseConfig {
            min_connections: 8,
            max_connections: 2,
            ..Default::default()
        };
        let err = Database::connect(&config).await.err().unwrap();
        assert!(err.to_string().contains("min_connections"));
    }

    #[tokio::test]
    #[ignore = "需要 PostgreSQL 数据库连接"]
    async fn test_database_connection() {
        let config = crate::test_utils::test_database_config();
        let db = Database::connect(&config).await.unwrap();
        db.health_check().await.unwrap();
        db.close().await;
    }
}
