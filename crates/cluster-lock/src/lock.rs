//! 分布式锁
//!
//! 与进程内互斥锁相同的使用方式：阻塞加锁、尝试加锁、限时尝试、解锁。
//! 每次尝试都是一次独立的锁表事务，两次尝试之间在调用方任务上休眠轮询间隔。
//!
//! ```text
//!            lock / try_lock 成功            unlock 成功
//! Unlocked ───────────────────────► Locked ──────────────► Unlocked
//!                                     │
//!                                     │ unlock 发现持有者已变更
//!                                     ▼
//!                                   Stolen（终态）
//! ```
//!
//! 不可重入：同一节点对已持有的锁再次加锁会一直等待到租约过期。

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::access::AttemptOutcome;
use crate::error::{ClusterLockError, Result};
use crate::manager::LockContext;

/// 锁实例的本地状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LockState {
    Unlocked,
    Locked,
    /// 解锁时发现锁已被其他节点持有
    Stolen { owner: Option<String> },
}

/// 集群锁
///
/// 由 [`ClusterLockManager::allocate_lock`](crate::ClusterLockManager::allocate_lock) 创建。
/// 同名的多个实例（同一节点或不同节点）通过锁表互斥。
pub struct ClusterLock {
    name: String,
    context: Arc<LockContext>,
    state: Mutex<LockState>,
}

impl ClusterLock {
    pub(crate) fn new(name: impl Into<String>, context: Arc<LockContext>) -> Self {
        Self {
            name: name.into(),
            context,
            state: Mutex::new(LockState::Unlocked),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LockState {
        self.state.lock().clone()
    }

    /// 单次加锁尝试
    ///
    /// 存储故障按竞争处理（返回 false），调用方的轮询会重试。
    async fn attempt(&self) -> Result<bool> {
        if self.context.is_shut_down() {
            return Err(ClusterLockError::ManagerShutdown);
        }
        if let LockState::Stolen { owner } = &*self.state.lock() {
            return Err(ClusterLockError::Stolen {
                name: self.name.clone(),
                owner: owner.clone(),
            });
        }

        let config = self.context.config();
        let outcome = self
            .context
            .access()
            .attempt_acquire(&self.name, &config.self_identifier, config.lease_duration)
            .await;

        // 尝试返回后到登记续约之间没有 await。若调用方在提交进行中丢弃 future，
        // 锁行可能已提交却未登记续约，该行会在租约到期后被其他节点接管
        if outcome != AttemptOutcome::Acquired {
            return Ok(false);
        }
        self.context.renewer().add(&self.name);
        *self.state.lock() = LockState::Locked;

        // 管理器在尝试进行中被关闭，关闭流程可能已经错过这把锁
        if self.context.is_shut_down() {
            self.context.renewer().remove(&self.name);
            if let Err(e) = self
                .context
                .access()
                .release(&self.name, &config.self_identifier)
                .await
            {
                warn!(lock = %self.name, error = %e, "Failed to release lock acquired during shutdown");
            }
            *self.state.lock() = LockState::Unlocked;
            return Err(ClusterLockError::ManagerShutdown);
        }
        Ok(true)
    }

    /// 阻塞直到获得锁
    ///
    /// 不保证公平性。
    pub async fn lock(&self) -> Result<()> {
        let poll_interval = self.context.config().poll_interval;
        loop {
            if self.attempt().await? {
                return Ok(());
            }
            tokio::time::sleep(poll_interval).await;
        }
    }

    /// 阻塞直到获得锁，或 `interrupt` 在两次尝试之间完成
    ///
    /// 进行中的尝试不会被中断。
    pub async fn lock_interruptibly<F>(&self, interrupt: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let poll_interval = self.context.config().poll_interval;
        tokio::pin!(interrupt);
        loop {
            if self.attempt().await? {
                return Ok(());
            }
            tokio::select! {
                _ = tokio::time::sleep(poll_interval) => {}
                _ = &mut interrupt => {
                    debug!(lock = %self.name, "Interrupted while waiting for cluster lock");
                    return Err(ClusterLockError::Interrupted {
                        name: self.name.clone(),
                    });
                }
            }
        }
    }

    /// 尝试一次加锁
    pub async fn try_lock(&self) -> Result<bool> {
        self.attempt().await
    }

    /// 在 `timeout` 内反复尝试加锁
    ///
    /// 每次休眠不超过剩余时间；超时返回 false 的时刻不早于 `timeout`，
    /// 不晚于 `timeout` 加一次尝试。
    pub async fn try_lock_for(&self, timeout: Duration) -> Result<bool> {
        let poll_interval = self.context.config().poll_interval;
        let deadline = Instant::now() + timeout;
        loop {
            if self.attempt().await? {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            tokio::time::sleep(poll_interval.min(deadline - now)).await;
        }
    }

    /// 解锁
    ///
    /// 先停止续约再删除锁行，删除失败时也不会恢复续约。锁行不存在返回 `NotLocked`，
    /// 锁已被其他节点持有返回 `Stolen`，此后该实例不能再加锁。
    pub async fn unlock(&self) -> Result<()> {
        self.context.renewer().remove(&self.name);

        let config = self.context.config();
        let result = self
            .context
            .access()
            .release(&self.name, &config.self_identifier)
            .await;

        let mut state = self.state.lock();
        match &result {
            Ok(()) | Err(ClusterLockError::NotLocked { .. }) => {
                *state = LockState::Unlocked;
            }
            Err(ClusterLockError::Stolen { owner, .. }) => {
                warn!(lock = %self.name, owner = ?owner, "Cluster lock was stolen");
                if *state == LockState::Locked {
                    *state = LockState::Stolen {
                        owner: owner.clone(),
                    };
                }
            }
            // 存储故障：不再续约，锁行保留到租约到期，调用方可以重试解锁
            Err(_) => {}
        }
        result
    }

    /// 条件变量不受支持
    pub fn new_condition(&self) -> Result<Infallible> {
        Err(ClusterLockError::Unsupported(
            "cluster locks do not support conditions",
        ))
    }
}

impl std::fmt::Debug for ClusterLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLock")
            .field("name", &self.name)
            .field("owner", &self.context.config().self_identifier)
            .field("state", &self.state())
            .finish()
    }
}
