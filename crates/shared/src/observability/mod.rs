//! 统一可观测性模块
//!
//! 提供 logging 与 metrics 的统一初始化。
//! 所有使用集群锁的服务通过单一入口点配置可观测性，确保一致的日志格式和指标命名。

pub mod metrics;
pub mod tracing;

use ::tracing::info;
use anyhow::Result;
use serde::Deserialize;

/// 可观测性配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// 服务名称，用于标识日志来源
    pub service_name: String,

    /// 日志级别（如 "info", "debug"）
    pub log_level: String,

    /// 是否启用 JSON 格式日志
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            service_name: "unknown-service".to_string(),
            log_level: default_log_level(),
            json_logs: false,
        }
    }
}

impl ObservabilityConfig {
    /// 从环境变量加载配置
    pub fn from_env(service_name: &str) -> Self {
        Self {
            service_name: service_name.to_string(),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| default_log_level()),
            json_logs: std::env::var("JSON_LOGS")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        }
    }

    /// 注入服务名（配置文件中通常不重复填写）
    pub fn with_service_name(mut self, service_name: &str) -> Self {
        self.service_name = service_name.to_string();
        self
    }
}

/// 统一初始化可观测性
///
/// 初始化顺序：
/// 1. Tracing（日志）
/// 2. Metrics 描述（实际导出由宿主进程安装的 recorder 决定）
///
/// # Example
///
/// ```ignore
/// use cluster_lock_shared::observability::{init, ObservabilityConfig};
///
/// let config = ObservabilityConfig::from_env("ingest-worker");
/// init(&config)?;
/// ```
pub fn init(config: &ObservabilityConfig) -> Result<()> {
    tracing::init(config)?;
    metrics::describe_metrics();

    info!(
        service = %config.service_name,
        json_logs = config.json_logs,
        "Observability initialized"
    );

    Ok(())
}
