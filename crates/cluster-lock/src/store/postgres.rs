//! PostgreSQL 锁存储
//!
//! 所有对同一锁行的读写都在事务内先执行 `SELECT ... FOR UPDATE`，
//! 由数据库行锁串行化不同节点的"读取-判断-写入"过程。

use async_trait::async_trait;
use sqlx::{PgPool, Postgres, Transaction};
use tracing::{info, instrument};

use super::{LockStore, LockTransaction};
use crate::error::{ClusterLockError, Result};
use crate::record::{InsertOutcome, LockRecord};

/// PostgreSQL 锁存储
///
/// 使用单张 `cluster_lock` 表：
///
/// ```sql
/// CREATE TABLE IF NOT EXISTS cluster_lock (
///   name       TEXT PRIMARY KEY,
///   locked     BOOLEAN NOT NULL,
///   expiration BIGINT NOT NULL,
///   owner      TEXT
/// );
/// ```
#[derive(Clone)]
pub struct PgLockStore {
    pool: PgPool,
}

impl PgLockStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// 创建锁表（已存在则跳过）
    #[instrument(skip(self))]
    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_lock (
                name       TEXT PRIMARY KEY,
                locked     BOOLEAN NOT NULL,
                expiration BIGINT NOT NULL,
                owner      TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("cluster_lock table ready");
        Ok(())
    }
}

#[async_trait]
impl LockStore for PgLockStore {
    async fn begin(&self) -> Result<Box<dyn LockTransaction>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PgLockTransaction { tx: Some(tx) }))
    }

    async fn renew_leases(&self, names: &[String], owner: &str, expiration: i64) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE cluster_lock
            SET expiration = $1
            WHERE locked = TRUE AND owner = $2 AND name = ANY($3)
            "#,
        )
        .bind(expiration)
        .bind(owner)
        .bind(names)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn find(&self, name: &str) -> Result<Option<LockRecord>> {
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT name, locked, expiration, owner
            FROM cluster_lock
            WHERE name = $1
            "#,
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}

/// PostgreSQL 事务
///
/// sqlx 的 `Transaction` 在 commit / rollback 时被消费，结束后置为 None。
/// 被丢弃时 sqlx 会自动回滚。
struct PgLockTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgLockTransaction {
    fn active(&mut self) -> Result<&mut Transaction<'static, Postgres>> {
        self.tx
            .as_mut()
            .ok_or_else(|| ClusterLockError::Store("transaction already finished".to_string()))
    }
}

#[async_trait]
impl LockTransaction for PgLockTransaction {
    async fn fetch_for_update(&mut self, name: &str) -> Result<Option<LockRecord>> {
        let tx = self.active()?;
        let record = sqlx::query_as::<_, LockRecord>(
            r#"
            SELECT name, locked, expiration, owner
            FROM cluster_lock
            WHERE name = $1
            FOR UPDATE
            "#,
        )
        .bind(name)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(record)
    }

    async fn insert(&mut self, record: &LockRecord) -> Result<InsertOutcome> {
        let tx = self.active()?;
        // ON CONFLICT DO NOTHING 让主键冲突以受影响行数体现，事务不会因唯一约束错误而中止
        let result = sqlx::query(
            r#"
            INSERT INTO cluster_lock (name, locked, expiration, owner)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (name) DO NOTHING
            "#,
        )
        .bind(&record.name)
        .bind(record.locked)
        .bind(record.expiration)
        .bind(&record.owner)
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() > 0 {
            Ok(InsertOutcome::Inserted)
        } else {
            Ok(InsertOutcome::AlreadyExists)
        }
    }

    async fn update(&mut self, record: &LockRecord) -> Result<()> {
        let tx = self.active()?;
        sqlx::query(
            r#"
            UPDATE cluster_lock
            SET locked = $2, expiration = $3, owner = $4
            WHERE name = $1
            "#,
        )
        .bind(&record.name)
        .bind(record.locked)
        .bind(record.expiration)
        .bind(&record.owner)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        let tx = self.active()?;
        sqlx::query(r#"DELETE FROM cluster_lock WHERE name = $1"#)
            .bind(name)
            .execute(&mut **tx)
            .await?;

        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let tx = self
            .tx
            .take()
            .ok_or_else(|| ClusterLockError::Store("transaction already finished".to_string()))?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        if let Some(tx) = self.tx.take() {
            tx.rollback().await?;
        }
        Ok(())
    }
}
