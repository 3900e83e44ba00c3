//! 基于共享数据库表的集群锁
//!
//! 多个独立进程（集群节点）只通过一张 `cluster_lock` 表协调对具名资源的独占访问，
//! 不依赖额外的协调服务：
//!
//! - **锁记录**：每把锁对应一行 `(name, locked, expiration, owner)`
//! - **行锁事务**：每次加锁/解锁都在事务内 `SELECT ... FOR UPDATE` 后判断并写入
//! - **租约**：持有者每 1/3 租约续期一次；节点宕机后租约到期，其他节点即可抢占
//!
//! ```no_run
//! use std::sync::Arc;
//! use cluster_lock::{ClusterLockManager, LockManagerConfig, MemoryLockStore};
//!
//! # async fn demo() -> cluster_lock::Result<()> {
//! let config = LockManagerConfig::new("node-a", 100, 30_000)?;
//! let manager = ClusterLockManager::new(config, Arc::new(MemoryLockStore::new()));
//!
//! let lock = manager.allocate_lock("nightly-purge");
//! if lock.try_lock().await? {
//!     // 独占执行
//!     lock.unlock().await?;
//! }
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod access;
pub mod clock;
pub mod error;
pub mod leasing;
pub mod lock;
pub mod manager;
pub mod record;
pub mod store;

pub use access::{AttemptOutcome, LockStoreAccess};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{ClusterLockError, Result};
pub use leasing::LeaseRenewer;
pub use lock::{ClusterLock, LockState};
pub use manager::{ClusterLockManager, LockManagerConfig};
pub use record::{InsertOutcome, LockRecord};
pub use store::{LockStore, LockTransaction, MemoryLockStore, PgLockStore};
