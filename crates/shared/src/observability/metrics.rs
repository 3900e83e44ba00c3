//! 集群锁指标模块
//!
//! 基于 metrics crate 的门面记录加锁、释放、续约指标。
//! 未安装 recorder 时所有记录均为空操作，由宿主进程决定导出方式（如 Prometheus）。

/// 注册指标描述
pub fn describe_metrics() {
    metrics::describe_counter!(
        "cluster_lock_attempts_total",
        "Total number of cluster lock acquisition attempts"
    );
    metrics::describe_counter!(
        "cluster_lock_releases_total",
        "Total number of cluster lock releases"
    );
    metrics::describe_counter!(
        "cluster_lock_renewals_total",
        "Total number of lease renewal rounds"
    );
    metrics::describe_counter!(
        "cluster_lock_leases_renewed_total",
        "Total number of lock rows whose lease was extended"
    );
    metrics::describe_gauge!(
        "cluster_lock_held",
        "Number of cluster locks currently held by this node"
    );
}

// ============================================================================
// 便捷的指标记录函数
// ============================================================================

/// 记录一次加锁尝试
///
/// result: acquired / contended / store_failure
#[inline]
pub fn record_lock_attempt(result: &str) {
    metrics::counter!("cluster_lock_attempts_total", "result" => result.to_string()).increment(1);
}

/// 记录一次释放
///
/// result: released / not_locked / stolen / error
#[inline]
pub fn record_lock_release(result: &str) {
    metrics::counter!("cluster_lock_releases_total", "result" => result.to_string()).increment(1);
}

/// 记录一轮续约
#[inline]
pub fn record_lease_renewal(result: &str, renewed: u64) {
    metrics::counter!("cluster_lock_renewals_total", "result" => result.to_string()).increment(1);
    metrics::counter!("cluster_lock_leases_renewed_total").increment(renewed);
}

/// 设置本节点当前持有的锁数量
#[inline]
pub fn set_held_locks(owner: &str, count: usize) {
    metrics::gauge!("cluster_lock_held", "owner" => owner.to_string()).set(count as f64);
}
