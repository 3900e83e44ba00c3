//! 集群锁管理器
//!
//! 持有本节点标识、轮询间隔、租约时长，负责分配锁实例并运行唯一的续约任务。
//! 由应用构造并在组件之间传递（不是全局单例）。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cluster_lock_shared::config::{AppConfig, ClusterLockConfig};
use cluster_lock_shared::database::Database;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::access::LockStoreAccess;
use crate::clock::{Clock, SystemClock};
use crate::error::{ClusterLockError, Result};
use crate::leasing::LeaseRenewer;
use crate::lock::ClusterLock;
use crate::record::LockRecord;
use crate::store::{LockStore, PgLockStore};

/// 锁管理器配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockManagerConfig {
    /// 本节点标识，写入锁行的 owner 字段
    pub self_identifier: String,
    /// 两次加锁尝试之间的等待时间
    pub poll_interval: Duration,
    /// 租约时长
    pub lease_duration: Duration,
    /// 关闭时是否释放仍持有的锁
    pub release_on_shutdown: bool,
}

impl LockManagerConfig {
    /// 创建配置
    ///
    /// 节点标识不能为空，时间参数不能为负。
    pub fn new(
        self_identifier: impl Into<String>,
        poll_interval_ms: i64,
        lease_duration_ms: i64,
    ) -> Result<Self> {
        let self_identifier = self_identifier.into();
        if self_identifier.trim().is_empty() {
            return Err(ClusterLockError::Config(
                "self_identifier 不能为空".to_string(),
            ));
        }
        let poll_interval = non_negative_millis("poll_interval_ms", poll_interval_ms)?;
        let lease_duration = non_negative_millis("lease_duration_ms", lease_duration_ms)?;

        Ok(Self {
            self_identifier,
            poll_interval,
            lease_duration,
            release_on_shutdown: true,
        })
    }

    pub fn with_release_on_shutdown(mut self, release: bool) -> Self {
        self.release_on_shutdown = release;
        self
    }

    /// 从应用配置构造
    ///
    /// 未配置节点标识时使用 `{app_name}-{app_mode}-{hostname}`，
    /// 主机名不可用时以随机 UUID 代替。
    pub fn from_settings(settings: &ClusterLockConfig) -> Result<Self> {
        let self_identifier = match settings
            .self_identifier
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
        {
            Some(id) => id.to_string(),
            None => format!(
                "{}-{}-{}",
                settings.app_name,
                settings.app_mode,
                local_hostname()
            ),
        };

        Ok(Self::new(
            self_identifier,
            settings.poll_interval_ms,
            settings.lease_duration_ms,
        )?
        .with_release_on_shutdown(settings.release_on_shutdown))
    }
}

fn non_negative_millis(field: &str, value: i64) -> Result<Duration> {
    u64::try_from(value)
        .map(Duration::from_millis)
        .map_err(|_| ClusterLockError::Config(format!("{field} 不能为负数: {value}")))
}

fn local_hostname() -> String {
    match hostname::get() {
        Ok(name) if !name.is_empty() => name.to_string_lossy().into_owned(),
        Ok(_) => Uuid::new_v4().to_string(),
        Err(e) => {
            warn!(error = %e, "Unable to resolve hostname, using random node identifier");
            Uuid::new_v4().to_string()
        }
    }
}

/// 锁实例与管理器共享的上下文
pub(crate) struct LockContext {
    config: LockManagerConfig,
    access: LockStoreAccess,
    renewer: Arc<LeaseRenewer>,
    shut_down: AtomicBool,
}

impl LockContext {
    pub(crate) fn config(&self) -> &LockManagerConfig {
        &self.config
    }

    pub(crate) fn access(&self) -> &LockStoreAccess {
        &self.access
    }

    pub(crate) fn renewer(&self) -> &LeaseRenewer {
        &self.renewer
    }

    pub(crate) fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

/// 集群锁管理器
pub struct ClusterLockManager {
    context: Arc<LockContext>,
    renewal_task: Mutex<Option<JoinHandle<()>>>,
}

impl ClusterLockManager {
    /// 创建管理器并启动续约任务
    ///
    /// 必须在 Tokio 运行时内调用。
    pub fn new(config: LockManagerConfig, store: Arc<dyn LockStore>) -> Self {
        Self::with_clock(config, store, Arc::new(SystemClock))
    }

    /// 使用指定时钟创建管理器
    pub fn with_clock(
        config: LockManagerConfig,
        store: Arc<dyn LockStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let access = LockStoreAccess::new(store, clock);
        let renewer = Arc::new(LeaseRenewer::new(
            access.clone(),
            config.self_identifier.clone(),
            config.lease_duration,
        ));
        let renewal_task = renewer.spawn();

        info!(
            owner = %config.self_identifier,
            poll_interval_ms = config.poll_interval.as_millis() as u64,
            lease_duration_ms = config.lease_duration.as_millis() as u64,
            "Cluster lock manager started"
        );

        Self {
            context: Arc::new(LockContext {
                config,
                access,
                renewer,
                shut_down: AtomicBool::new(false),
            }),
            renewal_task: Mutex::new(Some(renewal_task)),
        }
    }

    /// 按应用配置连接 PostgreSQL 并创建管理器
    #[instrument(skip(app_config), fields(service = %app_config.service_name))]
    pub async fn connect(app_config: &AppConfig) -> Result<Self> {
        let config = LockManagerConfig::from_settings(&app_config.cluster_lock)?;
        let database = Database::connect(&app_config.database).await?;

        let store = PgLockStore::new(database.pool().clone());
        store.ensure_schema().await?;

        Ok(Self::new(config, Arc::new(store)))
    }

    /// 分配一个锁实例，不访问存储
    pub fn allocate_lock(&self, name: impl Into<String>) -> ClusterLock {
        ClusterLock::new(name, Arc::clone(&self.context))
    }

    pub fn self_identifier(&self) -> &str {
        &self.context.config.self_identifier
    }

    pub fn config(&self) -> &LockManagerConfig {
        &self.context.config
    }

    /// 本节点当前持有（正在续约）的锁名
    pub fn held_locks(&self) -> Vec<String> {
        self.context.renewer.held()
    }

    /// 查看锁表中的记录
    pub async fn inspect(&self, name: &str) -> Result<Option<LockRecord>> {
        self.context.access.inspect(name).await
    }

    pub fn is_shut_down(&self) -> bool {
        self.context.is_shut_down()
    }

    /// 关闭管理器
    ///
    /// 停止续约任务并等待其退出；启用 `release_on_shutdown` 时尽力释放仍持有的锁，
    /// 释放失败只记录日志。返回成功释放的锁数量。重复调用是空操作。
    pub async fn shutdown(&self) -> Result<usize> {
        if self.context.shut_down.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }

        self.context.renewer.stop();
        let task = self.renewal_task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "Lease renewal task ended abnormally");
            }
        }

        let mut released = 0;
        if self.context.config.release_on_shutdown {
            released += self.release_registered().await;
            // 关闭开始前已在进行中的尝试可能在第一轮之后才登记
            released += self.release_registered().await;
        }

        info!(
            owner = %self.context.config.self_identifier,
            released,
            "Cluster lock manager shut down"
        );
        Ok(released)
    }

    /// 释放续约集合中的所有锁，返回成功释放的数量
    async fn release_registered(&self) -> usize {
        let owner = &self.context.config.self_identifier;
        let mut released = 0;
        for name in self.context.renewer.held() {
            self.context.renewer.remove(&name);
            match self.context.access.release(&name, owner).await {
                Ok(()) => released += 1,
                Err(e) => {
                    warn!(lock = %name, error = %e, "Failed to release cluster lock on shutdown");
                }
            }
        }
        released
    }
}

impl Drop for ClusterLockManager {
    fn drop(&mut self) {
        // 续约停止后仍存活的锁实例不能再加锁
        self.context.shut_down.store(true, Ordering::SeqCst);
        self.context.renewer.stop();
    }
}

impl std::fmt::Debug for ClusterLockManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterLockManager")
            .field("config", &self.context.config)
            .field("shut_down", &self.is_shut_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryLockStore;

    #[test]
    fn test_config_validation() {
        let config = LockManagerConfig::new("node-a", 100, 30_000).unwrap();
        assert_eq!(config.poll_interval, Duration::from_millis(100));
        assert_eq!(config.lease_duration, Duration::from_secs(30));
        assert!(config.release_on_shutdown);

        assert!(LockManagerConfig::new("node-a", 0, 0).is_ok());
        for (id, poll, lease) in [("", 100, 100), ("  ", 100, 100), ("n", -1, 100), ("n", 100, -1)] {
            let err = LockManagerConfig::new(id, poll, lease).unwrap_err();
            assert_eq!(err.code(), "LOCK_CONFIG_INVALID");
        }
    }

    #[test]
    fn test_from_settings_uses_configured_identifier() {
        let settings = ClusterLockConfig {
            self_identifier: Some("edge-1".to_string()),
            poll_interval_ms: 20,
            lease_duration_ms: 600,
            release_on_shutdown: false,
            ..Default::default()
        };
        let config = LockManagerConfig::from_settings(&settings).unwrap();
        assert_eq!(config.self_identifier, "edge-1");
        assert_eq!(config.poll_interval, Duration::from_millis(20));
        assert_eq!(config.lease_duration, Duration::from_millis(600));
        assert!(!config.release_on_shutdown);
    }

    #[test]
    fn test_from_settings_derives_identifier() {
        let settings = ClusterLockConfig {
            self_identifier: Some(" ".to_string()),
            app_name: "ingest".to_string(),
            app_mode: "request".to_string(),
            ..Default::default()
        };
        let config = LockManagerConfig::from_settings(&settings).unwrap();
        assert!(config.self_identifier.starts_with("ingest-request-"));
        assert!(config.self_identifier.len() > "ingest-request-".len());
    }

    #[test]
    fn test_from_settings_rejects_negative_values() {
        let settings = ClusterLockConfig {
            self_identifier: Some("edge-1".to_string()),
            lease_duration_ms: -5,
            ..Default::default()
        };
        assert!(LockManagerConfig::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_allocate_does_not_touch_store() {
        let store = MemoryLockStore::new();
        let config = LockManagerConfig::new("node-a", 10, 1_000).unwrap();
        let manager = ClusterLockManager::new(config, Arc::new(store.clone()));

        let lock = manager.allocate_lock("resource-1");
        assert_eq!(lock.name(), "resource-1");
        assert_eq!(manager.self_identifier(), "node-a");
        assert!(store.is_empty().await);
        assert!(manager.inspect("resource-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shutdown_releases_held_locks() {
        let store = MemoryLockStore::new();
        let clock = Arc::new(ManualClock::new(1_000));
        let config = LockManagerConfig::new("node-a", 10, 1_000).unwrap();
        let manager = ClusterLockManager::with_clock(config, Arc::new(store.clone()), clock);

        assert!(manager.allocate_lock("a").try_lock().await.unwrap());
        assert!(manager.allocate_lock("b").try_lock().await.unwrap());

        assert_eq!(manager.shutdown().await.unwrap(), 2);
        assert!(manager.is_shut_down());
        assert!(manager.held_locks().is_empty());
        assert!(store.is_empty().await);

        // 重复关闭是空操作
        assert_eq!(manager.shutdown().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_without_release_keeps_rows() {
        let store = MemoryLockStore::new();
        let config = LockManagerConfig::new("node-a", 10, 1_000)
            .unwrap()
            .with_release_on_shutdown(false);
        let manager = ClusterLockManager::new(config, Arc::new(store.clone()));

        assert!(manager.allocate_lock("a").try_lock().await.unwrap());
        assert_eq!(manager.shutdown().await.unwrap(), 0);
        assert!(store.record("a").await.is_some());
    }

    #[tokio::test]
    async fn test_dropped_manager_rejects_acquisition() {
        let store = MemoryLockStore::new();
        let config = LockManagerConfig::new("node-a", 10, 1_000).unwrap();
        let manager = ClusterLockManager::new(config, Arc::new(store.clone()));
        let lock = manager.allocate_lock("resource-1");

        drop(manager);

        let err = lock.try_lock().await.unwrap_err();
        assert!(matches!(err, ClusterLockError::ManagerShutdown));
        assert!(store.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_in_flight_during_shutdown_is_released() {
        let store = MemoryLockStore::new();
        let config = LockManagerConfig::new("node-a", 10, 1_000).unwrap();
        let manager = ClusterLockManager::new(config, Arc::new(store.clone()));
        let lock = manager.allocate_lock("resource-1");

        // 占住锁表，让加锁尝试停在事务开始处
        let blocker = store.begin().await.unwrap();
        let attempt = tokio::spawn(async move { lock.try_lock().await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(manager.shutdown().await.unwrap(), 0);
        drop(blocker);

        let err = attempt.await.unwrap().unwrap_err();
        assert!(matches!(err, ClusterLockError::ManagerShutdown));
        assert!(manager.held_locks().is_empty());
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_connect_rejects_empty_database_url() {
        let mut app_config = AppConfig::default();
        app_config.cluster_lock.self_identifier = Some("node-a".to_string());
        app_config.database.url = String::new();

        let err = ClusterLockManager::connect(&app_config).await.unwrap_err();
        assert_eq!(err.code(), "LOCK_CONFIG_INVALID");
    }
}
