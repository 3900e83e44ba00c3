//! 锁表访问协议
//!
//! 每一次加锁尝试、释放都是一个独立事务："加排他行锁读取 → 判断 → 写入 → 提交"，
//! 判断与写入之间不会释放行锁。续约是一条按条件批量更新的语句。

use std::sync::Arc;
use std::time::Duration;

use cluster_lock_shared::observability::metrics as lock_metrics;
use tracing::{debug, error, instrument, warn};

use crate::clock::{Clock, duration_millis};
use crate::error::{ClusterLockError, Result};
use crate::record::{InsertOutcome, LockRecord};
use crate::store::{LockStore, LockTransaction};

/// 单次加锁尝试的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// 本节点获得了锁
    Acquired,
    /// 锁被有效持有（包括被本节点重复加锁）
    Contended,
    /// 存储故障，本次尝试已回滚
    StoreFailure,
}

impl AttemptOutcome {
    pub fn is_acquired(self) -> bool {
        matches!(self, Self::Acquired)
    }

    fn as_label(self) -> &'static str {
        match self {
            Self::Acquired => "acquired",
            Self::Contended => "contended",
            Self::StoreFailure => "store_failure",
        }
    }
}

/// 锁表访问
#[derive(Clone)]
pub struct LockStoreAccess {
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
}

impl LockStoreAccess {
    pub fn new(store: Arc<dyn LockStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn now_millis(&self) -> i64 {
        self.clock.now_millis()
    }

    /// 尝试获取锁
    ///
    /// 不会返回错误：存储故障被记录日志并以 `StoreFailure` 表示，由调用方决定是否重试。
    #[instrument(skip(self, lease), fields(lock = %name, owner = %self_identifier))]
    pub async fn attempt_acquire(
        &self,
        name: &str,
        self_identifier: &str,
        lease: Duration,
    ) -> AttemptOutcome {
        let outcome = match self.acquire_row(name, self_identifier, lease).await {
            Ok(true) => AttemptOutcome::Acquired,
            Ok(false) => AttemptOutcome::Contended,
            Err(e) => {
                error!(lock = %name, error = %e, "Error locking cluster lock");
                AttemptOutcome::StoreFailure
            }
        };

        lock_metrics::record_lock_attempt(outcome.as_label());
        outcome
    }

    async fn acquire_row(&self, name: &str, self_identifier: &str, lease: Duration) -> Result<bool> {
        let mut tx = self.store.begin().await?;
        let result = self
            .acquire_within(&mut tx, name, self_identifier, lease)
            .await;
        if result.is_err() {
            rollback_quietly(tx.as_mut(), name).await;
        }
        result
    }

    /// 在事务内完成加锁判断
    ///
    /// 插入冲突时需要换一个新事务重新读取，因此接收 `&mut Box` 以便替换事务。
    async fn acquire_within(
        &self,
        tx: &mut Box<dyn LockTransaction>,
        name: &str,
        self_identifier: &str,
        lease: Duration,
    ) -> Result<bool> {
        let lease_millis = duration_millis(lease);

        let existing = match tx.fetch_for_update(name).await? {
            Some(record) => record,
            None => {
                let expiration = self.clock.now_millis().saturating_add(lease_millis);
                let record = LockRecord::held_by(name, self_identifier, expiration);
                match tx.insert(&record).await? {
                    InsertOutcome::Inserted => {
                        tx.commit().await?;
                        debug!(lock = %name, "Successfully created and locked cluster lock");
                        return Ok(true);
                    }
                    InsertOutcome::AlreadyExists => {
                        // 另一节点抢先创建了锁行，换新事务在已存在的行上继续判断
                        debug!(lock = %name, "Lock row created concurrently, re-reading");
                        tx.rollback().await?;
                        *tx = self.store.begin().await?;
                        tx.fetch_for_update(name).await?.ok_or_else(|| {
                            ClusterLockError::Store(format!(
                                "lock row {name} vanished after insert conflict"
                            ))
                        })?
                    }
                }
            }
        };

        let now = self.clock.now_millis();
        if existing.is_held_at(now) {
            // 其他节点持有且未过期，或本节点重复加锁
            tx.rollback().await?;
            return Ok(false);
        }

        let record = LockRecord::held_by(name, self_identifier, now.saturating_add(lease_millis));
        tx.update(&record).await?;
        tx.commit().await?;
        debug!(
            lock = %name,
            previous_owner = ?existing.owner,
            "Successfully locked cluster lock"
        );
        Ok(true)
    }

    /// 释放锁
    ///
    /// 锁行不存在返回 `NotLocked`，持有者不是本节点返回 `Stolen`，
    /// 其余存储错误回滚后原样返回。
    #[instrument(skip(self), fields(lock = %name, owner = %self_identifier))]
    pub async fn release(&self, name: &str, self_identifier: &str) -> Result<()> {
        let result = self.release_row(name, self_identifier).await;

        let label = match &result {
            Ok(()) => "released",
            Err(ClusterLockError::NotLocked { .. }) => "not_locked",
            Err(ClusterLockError::Stolen { .. }) => "stolen",
            Err(_) => "error",
        };
        lock_metrics::record_lock_release(label);

        result
    }

    async fn release_row(&self, name: &str, self_identifier: &str) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let result = release_within(tx.as_mut(), name, self_identifier).await;
        if result.is_err() {
            rollback_quietly(tx.as_mut(), name).await;
        }
        result
    }

    /// 批量续约
    ///
    /// 尽力而为：失败只记录日志并返回 None，锁会在租约到期后被其他节点抢占。
    pub async fn renew_all(
        &self,
        names: &[String],
        self_identifier: &str,
        new_expiration: i64,
    ) -> Option<u64> {
        match self
            .store
            .renew_leases(names, self_identifier, new_expiration)
            .await
        {
            Ok(renewed) => {
                if renewed < names.len() as u64 {
                    warn!(
                        owner = %self_identifier,
                        requested = names.len(),
                        renewed,
                        "Some held locks were not renewed, they may have been stolen"
                    );
                }
                lock_metrics::record_lease_renewal("ok", renewed);
                Some(renewed)
            }
            Err(e) => {
                error!(owner = %self_identifier, error = %e, "Error renewing lock leases");
                lock_metrics::record_lease_renewal("error", 0);
                None
            }
        }
    }

    /// 查看锁的当前记录（不加锁）
    pub async fn inspect(&self, name: &str) -> Result<Option<LockRecord>> {
        self.store.find(name).await
    }
}

async fn release_within(
    tx: &mut dyn LockTransaction,
    name: &str,
    self_identifier: &str,
) -> Result<()> {
    let record = tx
        .fetch_for_update(name)
        .await?
        .ok_or_else(|| ClusterLockError::NotLocked {
            name: name.to_string(),
        })?;

    if !record.is_owned_by(self_identifier) {
        return Err(ClusterLockError::Stolen {
            name: name.to_string(),
            owner: record.owner,
        });
    }

    tx.delete(name).await?;
    tx.commit().await?;
    debug!(lock = %name, "Successfully unlocked and deleted cluster lock");
    Ok(())
}

async fn rollback_quietly(tx: &mut dyn LockTransaction, name: &str) {
    if let Err(e) = tx.rollback().await {
        warn!(lock = %name, error = %e, "Error rolling back lock transaction");
    }
}
