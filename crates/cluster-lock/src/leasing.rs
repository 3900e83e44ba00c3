//! 租约续期
//!
//! 每个锁管理器拥有一个续约任务：每隔 1/3 租约时长，把本节点登记的所有锁的
//! 过期时间延长到 `now + lease`。续约失败只记录日志，锁会在租约到期后被其他节点抢占。

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cluster_lock_shared::observability::metrics as lock_metrics;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::access::LockStoreAccess;
use crate::clock::duration_millis;

/// 续约间隔下限，避免租约为 0 时空转
const MIN_RENEWAL_INTERVAL: Duration = Duration::from_millis(1);

/// 租约续期器
pub struct LeaseRenewer {
    access: LockStoreAccess,
    self_identifier: String,
    lease: Duration,
    held: Mutex<HashSet<String>>,
    shutdown_tx: watch::Sender<bool>,
}

impl LeaseRenewer {
    pub fn new(access: LockStoreAccess, self_identifier: impl Into<String>, lease: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            access,
            self_identifier: self_identifier.into(),
            lease,
            held: Mutex::new(HashSet::new()),
            shutdown_tx,
        }
    }

    /// 登记一个已获取的锁
    pub fn add(&self, name: &str) {
        let count = {
            let mut held = self.held.lock();
            held.insert(name.to_string());
            held.len()
        };
        lock_metrics::set_held_locks(&self.self_identifier, count);
    }

    /// 取消登记，返回该锁之前是否已登记
    pub fn remove(&self, name: &str) -> bool {
        let (removed, count) = {
            let mut held = self.held.lock();
            (held.remove(name), held.len())
        };
        lock_metrics::set_held_locks(&self.self_identifier, count);
        removed
    }

    /// 已登记锁名的快照（按名称排序）
    pub fn held(&self) -> Vec<String> {
        let mut names: Vec<String> = self.held.lock().iter().cloned().collect();
        names.sort();
        names
    }

    pub fn interval(&self) -> Duration {
        (self.lease / 3).max(MIN_RENEWAL_INTERVAL)
    }

    /// 执行一轮续约
    ///
    /// 先在锁内复制登记集合再访问存储，续约期间不阻塞加锁/解锁调用方。
    /// 没有登记的锁时不访问存储，返回 None。
    pub async fn renew_once(&self) -> Option<u64> {
        let names = self.held();
        if names.is_empty() {
            return None;
        }

        let expiration = self
            .access
            .now_millis()
            .saturating_add(duration_millis(self.lease));
        let renewed = self
            .access
            .renew_all(&names, &self.self_identifier, expiration)
            .await;

        if let Some(count) = renewed {
            debug!(
                owner = %self.self_identifier,
                renewed = count,
                expiration,
                "Renewed cluster lock leases"
            );
        }
        renewed
    }

    /// 启动后台续约任务
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let renewer = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = self.interval();

        tokio::spawn(async move {
            info!(
                owner = %renewer.self_identifier,
                interval_ms = interval.as_millis() as u64,
                "Lease renewal task started"
            );

            loop {
                if *shutdown_rx.borrow() {
                    break;
                }

                renewer.renew_once().await;

                tokio::select! {
                    _ = tokio::time::sleep(interval) => {}
                    changed = shutdown_rx.changed() => {
                        // 发送端已释放同样视为关闭
                        if changed.is_err() || *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(owner = %renewer.self_identifier, "Lease renewal task stopped");
        })
    }

    /// 通知续约任务停止
    pub fn stop(&self) {
        self.shutdown_tx.send_replace(true);
    }

    pub fn is_stopped(&self) -> bool {
        *self.shutdown_tx.borrow()
    }
}

impl std::fmt::Debug for LeaseRenewer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseRenewer")
            .field("self_identifier", &self.self_identifier)
            .field("lease", &self.lease)
            .field("held", &self.held())
            .finish()
    }
}
