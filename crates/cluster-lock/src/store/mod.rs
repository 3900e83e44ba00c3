//! 锁存储抽象
//!
//! 集群锁只依赖关系型存储的一小组能力：开启事务、加排他行锁读取、
//! 插入、更新、删除、提交、回滚，以及按条件批量续约。
//!
//! ```text
//! LockStore
//!  ├── PgLockStore      : PostgreSQL，SELECT ... FOR UPDATE 行锁（生产）
//!  └── MemoryLockStore  : 进程内实现，事务独占整张表（测试 / 单节点）
//! ```

mod memory;
mod postgres;

pub use memory::MemoryLockStore;
pub use postgres::PgLockStore;

use async_trait::async_trait;

use crate::error::Result;
use crate::record::{InsertOutcome, LockRecord};

/// 锁表存储接口
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockStore: Send + Sync {
    /// 开启会话并开始事务
    async fn begin(&self) -> Result<Box<dyn LockTransaction>>;

    /// 批量续约：仅更新 `locked = true` 且属于 `owner` 的指定锁行，返回更新行数
    async fn renew_leases(&self, names: &[String], owner: &str, expiration: i64) -> Result<u64>;

    /// 不加锁地读取一条记录
    async fn find(&self, name: &str) -> Result<Option<LockRecord>>;
}

/// 锁表事务
///
/// 事务在 `commit` / `rollback` 后结束；对已结束事务再次回滚是空操作，
/// 未结束即被丢弃的事务会被回滚。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait LockTransaction: Send {
    /// 读取锁行并持有排他行锁直到事务结束
    async fn fetch_for_update(&mut self, name: &str) -> Result<Option<LockRecord>>;

    async fn insert(&mut self, record: &LockRecord) -> Result<InsertOutcome>;

    async fn update(&mut self, record: &LockRecord) -> Result<()>;

    async fn delete(&mut self, name: &str) -> Result<()>;

    async fn commit(&mut self) -> Result<()>;

    async fn rollback(&mut self) -> Result<()>;
}
