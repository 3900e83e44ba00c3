//! PostgreSQL 锁存储集成测试
//!
//! 使用真实数据库验证行锁事务、插入竞争和批量续约。
//! 锁名使用 UUID 后缀，多个测试可以并行共享同一张 cluster_lock 表。
//!
//! ## 运行方式
//!
//! ```bash
//! DATABASE_URL=postgres://... cargo test --test postgres_lock_test -- --ignored
//! ```

use std::sync::Arc;
use std::time::Duration;

use cluster_lock::{
    ClusterLockError, ClusterLockManager, LockManagerConfig, LockStore, PgLockStore,
};
use cluster_lock_shared::config::AppConfig;
use cluster_lock_shared::database::Database;
use cluster_lock_shared::test_utils::{
    test_cluster_lock_config, test_database_config, test_node_id, unique_lock_name,
};

// ==================== 辅助函数 ====================

async fn setup_store() -> (PgLockStore, Database) {
    let database = Database::connect(&test_database_config())
        .await
        .expect("数据库连接失败");
    let store = PgLockStore::new(database.pool().clone());
    store.ensure_schema().await.expect("创建 cluster_lock 表失败");
    (store, database)
}

fn node(store: &PgLockStore, label: &str, poll_ms: i64, lease_ms: i64) -> ClusterLockManager {
    let config = LockManagerConfig::new(test_node_id(label), poll_ms, lease_ms).unwrap();
    ClusterLockManager::new(config, Arc::new(store.clone()))
}

// ==================== 测试用例 ====================

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_lock_handoff_between_nodes() {
    let (store, _database) = setup_store().await;
    let node_a = node(&store, "a", 50, 10_000);
    let node_b = node(&store, "b", 50, 10_000);
    let name = unique_lock_name("handoff");

    let lock_a = node_a.allocate_lock(name.clone());
    lock_a.lock().await.unwrap();

    let record = store.find(&name).await.unwrap().unwrap();
    assert!(record.locked);
    assert!(record.is_owned_by(node_a.self_identifier()));

    let lock_b = node_b.allocate_lock(name.clone());
    assert!(!lock_b.try_lock().await.unwrap());

    lock_a.unlock().await.unwrap();
    assert!(store.find(&name).await.unwrap().is_none());

    assert!(lock_b.try_lock().await.unwrap());
    lock_b.unlock().await.unwrap();
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_concurrent_first_acquire_has_single_winner() {
    let (store, _database) = setup_store().await;
    let name = unique_lock_name("race");
    let nodes: Vec<_> = (0..8)
        .map(|i| node(&store, &format!("racer-{i}"), 50, 10_000))
        .collect();

    let attempts = nodes.iter().map(|n| {
        let lock = n.allocate_lock(name.clone());
        async move { lock.try_lock().await.unwrap() }
    });
    let results = spawn_all(attempts).await;

    assert_eq!(results.iter().filter(|won| **won).count(), 1);
}

/// 并发执行所有尝试并按顺序收集结果
async fn spawn_all<F>(futures: impl Iterator<Item = F>) -> Vec<bool>
where
    F: std::future::Future<Output = bool> + Send + 'static,
{
    let handles: Vec<_> = futures.map(tokio::spawn).collect();
    let mut results = Vec::with_capacity(handles.len());
    for handle in handles {
        results.push(handle.await.unwrap());
    }
    results
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_expired_lock_is_stolen_and_detected() {
    let (store, database) = setup_store().await;
    let node_a = node(&store, "a", 20, 10_000);
    let node_b = node(&store, "b", 20, 10_000);
    let name = unique_lock_name("steal");

    let lock_a = node_a.allocate_lock(name.clone());
    assert!(lock_a.try_lock().await.unwrap());

    // 模拟 node-a 长时间未续约
    sqlx::query("UPDATE cluster_lock SET expiration = 0 WHERE name = $1")
        .bind(&name)
        .execute(database.pool())
        .await
        .unwrap();

    let lock_b = node_b.allocate_lock(name.clone());
    assert!(lock_b.try_lock().await.unwrap());

    let err = lock_a.unlock().await.unwrap_err();
    assert!(matches!(err, ClusterLockError::Stolen { .. }));
    assert!(err.to_string().contains(node_b.self_identifier()));

    lock_b.unlock().await.unwrap();
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_renew_leases_only_extends_own_rows() {
    let (store, _database) = setup_store().await;
    let node_a = node(&store, "a", 20, 60_000);
    let node_b = node(&store, "b", 20, 60_000);
    let mine = unique_lock_name("renew-mine");
    let theirs = unique_lock_name("renew-theirs");

    assert!(node_a.allocate_lock(mine.clone()).try_lock().await.unwrap());
    assert!(node_b.allocate_lock(theirs.clone()).try_lock().await.unwrap());

    let far_future = i64::MAX / 2;
    let renewed = store
        .renew_leases(
            &[mine.clone(), theirs.clone()],
            node_a.self_identifier(),
            far_future,
        )
        .await
        .unwrap();

    assert_eq!(renewed, 1);
    assert_eq!(store.find(&mine).await.unwrap().unwrap().expiration, far_future);
    assert_ne!(store.find(&theirs).await.unwrap().unwrap().expiration, far_future);

    node_a.shutdown().await.unwrap();
    node_b.shutdown().await.unwrap();
    assert!(store.find(&mine).await.unwrap().is_none());
    assert!(store.find(&theirs).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_try_lock_for_times_out() {
    let (store, _database) = setup_store().await;
    let node_a = node(&store, "a", 50, 60_000);
    let node_b = node(&store, "b", 50, 60_000);
    let name = unique_lock_name("timeout");

    assert!(node_a.allocate_lock(name.clone()).try_lock().await.unwrap());

    let started = std::time::Instant::now();
    let timeout = Duration::from_millis(300);
    assert!(!node_b.allocate_lock(name.clone()).try_lock_for(timeout).await.unwrap());
    assert!(started.elapsed() >= timeout);

    node_a.shutdown().await.unwrap();
}

#[tokio::test]
#[ignore = "需要 PostgreSQL 数据库连接"]
async fn test_connect_from_app_config() {
    let app_config = AppConfig {
        service_name: "cluster-lock-test".to_string(),
        database: test_database_config(),
        cluster_lock: test_cluster_lock_config(&test_node_id("connect")),
        ..Default::default()
    };

    let manager = ClusterLockManager::connect(&app_config).await.unwrap();
    let name = unique_lock_name("connect");
    let lock = manager.allocate_lock(name.clone());
    assert!(lock.try_lock().await.unwrap());
    assert!(manager.inspect(&name).await.unwrap().is_some());

    assert_eq!(manager.shutdown().await.unwrap(), 1);
    assert!(manager.inspect(&name).await.unwrap().is_none());
}
