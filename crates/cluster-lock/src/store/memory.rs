//! 进程内锁存储
//!
//! 用于测试和单节点部署。一个事务在开始时即独占整张表，
//! 比行锁粒度更粗，但"读取-判断-写入-提交"同样不会与其他事务交错。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, OwnedMutexGuard};

use super::{LockStore, LockTransaction};
use crate::error::{ClusterLockError, Result};
use crate::record::{InsertOutcome, LockRecord};

type Table = HashMap<String, LockRecord>;

/// 进程内锁存储
///
/// Clone 后共享同一张表，多个锁管理器共用一个实例即可模拟多个集群节点。
#[derive(Clone, Default)]
pub struct MemoryLockStore {
    table: Arc<Mutex<Table>>,
    faults: Arc<Faults>,
}

/// 故障注入开关
#[derive(Default)]
struct Faults {
    failing_begins: AtomicUsize,
    failing_renewals: AtomicBool,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次 `begin` 失败，模拟数据库连接中断
    pub fn fail_next_begins(&self, count: usize) {
        self.faults.failing_begins.store(count, Ordering::SeqCst);
    }

    /// 开启或关闭续约失败
    pub fn fail_renewals(&self, failing: bool) {
        self.faults.failing_renewals.store(failing, Ordering::SeqCst);
    }

    /// 读取记录（等待进行中的事务结束）
    pub async fn record(&self, name: &str) -> Option<LockRecord> {
        self.table.lock().await.get(name).cloned()
    }

    /// 直接写入记录，模拟其他节点或人工修改
    pub async fn put_record(&self, record: LockRecord) {
        self.table.lock().await.insert(record.name.clone(), record);
    }

    pub async fn is_empty(&self) -> bool {
        self.table.lock().await.is_empty()
    }

    fn take_begin_fault(&self) -> bool {
        self.faults
            .failing_begins
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl LockStore for MemoryLockStore {
    async fn begin(&self) -> Result<Box<dyn LockTransaction>> {
        if self.take_begin_fault() {
            return Err(ClusterLockError::Store(
                "injected failure: connection unavailable".to_string(),
            ));
        }

        let guard = self.table.clone().lock_owned().await;
        let staged = guard.clone();
        Ok(Box::new(MemoryLockTransaction {
            guard: Some(guard),
            staged,
        }))
    }

    async fn renew_leases(&self, names: &[String], owner: &str, expiration: i64) -> Result<u64> {
        if self.faults.failing_renewals.load(Ordering::SeqCst) {
            return Err(ClusterLockError::Store(
                "injected failure: renewal rejected".to_string(),
            ));
        }

        let mut table = self.table.lock().await;
        let mut renewed = 0;
        for name in names {
            if let Some(record) = table.get_mut(name) {
                if record.locked && record.is_owned_by(owner) {
                    record.expiration = expiration;
                    renewed += 1;
                }
            }
        }
        Ok(renewed)
    }

    async fn find(&self, name: &str) -> Result<Option<LockRecord>> {
        Ok(self.record(name).await)
    }
}

/// 进程内事务
///
/// 修改先写入 `staged` 副本，提交时整体替换；丢弃或回滚即放弃副本。
struct MemoryLockTransaction {
    guard: Option<OwnedMutexGuard<Table>>,
    staged: Table,
}

impl MemoryLockTransaction {
    fn ensure_active(&self) -> Result<()> {
        if self.guard.is_some() {
            Ok(())
        } else {
            Err(ClusterLockError::Store(
                "transaction already finished".to_string(),
            ))
        }
    }
}

#[async_trait]
impl LockTransaction for MemoryLockTransaction {
    async fn fetch_for_update(&mut self, name: &str) -> Result<Option<LockRecord>> {
        self.ensure_active()?;
        Ok(self.staged.get(name).cloned())
    }

    async fn insert(&mut self, record: &LockRecord) -> Result<InsertOutcome> {
        self.ensure_active()?;
        if self.staged.contains_key(&record.name) {
            return Ok(InsertOutcome::AlreadyExists);
        }
        self.staged.insert(record.name.clone(), record.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn update(&mut self, record: &LockRecord) -> Result<()> {
        self.ensure_active()?;
        if let Some(existing) = self.staged.get_mut(&record.name) {
            *existing = record.clone();
        }
        Ok(())
    }

    async fn delete(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        self.staged.remove(name);
        Ok(())
    }

    async fn commit(&mut self) -> Result<()> {
        let mut guard = self.guard.take().ok_or_else(|| {
            ClusterLockError::Store("transaction already finished".to_string())
        })?;
        *guard = std::mem::take(&mut self.staged);
        Ok(())
    }

    async fn rollback(&mut self) -> Result<()> {
        self.guard = None;
        self.staged.clear();
        Ok(())
    }
}
