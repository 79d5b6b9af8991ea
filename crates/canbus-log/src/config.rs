//! 日志配置
//!
//! 从 TOML 的 `[log]` 段加载，所有字段都有默认值。

use crate::error::LogError;
use canbus_protocol::NameFilter;
use parking_lot::RwLock;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// 多个 Logger 共享的配置句柄（`config.changed` 时重新读取）
pub type SharedConfig = Arc<RwLock<LogConfig>>;

/// 日志配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// 每个 Logger 的入队容量（条）
    pub queue_size: usize,
    /// 每个连接允许积压的最大字节数
    pub max_outstanding_bytes: usize,
    /// UDP 服务端对端空闲超时（秒）
    pub udp_idle_timeout_secs: u64,
    /// TCP 客户端连接超时（秒）
    pub tcp_connect_timeout_secs: u64,
    /// 转发到日志的事件名模式
    pub event_filters: Vec<String>,
    /// 转发到日志的指标名模式
    pub metric_filters: Vec<String>,
    /// 禁止写入的路径前缀
    pub protected_paths: Vec<String>,
    /// 可移动存储挂载点
    pub removable_root: String,
    /// 车辆标识（出现在 Logger 信息中）
    pub vehicle: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            queue_size: 100,
            max_outstanding_bytes: 16 * 1024,
            udp_idle_timeout_secs: 30,
            tcp_connect_timeout_secs: 10,
            event_filters: vec!["vehicle*".to_string()],
            metric_filters: Vec::new(),
            protected_paths: vec!["/store".to_string()],
            removable_root: "/sd".to_string(),
            vehicle: String::new(),
        }
    }
}

impl LogConfig {
    pub fn from_toml_str(text: &str) -> Result<Self, LogError> {
        Ok(toml::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, LogError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn shared(self) -> SharedConfig {
        Arc::new(RwLock::new(self))
    }

    pub fn udp_idle_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_idle_timeout_secs)
    }

    pub fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_connect_timeout_secs)
    }

    pub fn event_filter(&self) -> Result<NameFilter, LogError> {
        Ok(NameFilter::from_patterns(&self.event_filters)?)
    }

    pub fn metric_filter(&self) -> Result<NameFilter, LogError> {
        Ok(NameFilter::from_patterns(&self.metric_filters)?)
    }

    /// 路径是否位于受保护目录下
    pub fn is_protected(&self, path: &str) -> bool {
        self.protected_paths
            .iter()
            .any(|p| path_has_prefix(path, p))
    }

    /// 路径是否位于可移动存储上
    pub fn is_removable(&self, path: &str) -> bool {
        !self.removable_root.is_empty() && path_has_prefix(path, &self.removable_root)
    }
}

/// 按路径分量比较前缀（`/sdcard` 不算在 `/sd` 下）
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('/'),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.queue_size, 100);
        assert_eq!(config.max_outstanding_bytes, 16384);
        assert_eq!(config.udp_idle_timeout(), Duration::from_secs(30));
        assert!(config.event_filter().unwrap().matches("vehicle.on"));
        assert!(!config.metric_filter().unwrap().matches("v.b.soc"));
    }

    #[test]
    fn test_partial_toml() {
        let config = LogConfig::from_toml_str(
            r#"
            queue_size = 250
            metric_filters = ["v.b.*"]
            "#,
        )
        .unwrap();
        assert_eq!(config.queue_size, 250);
        assert_eq!(config.tcp_connect_timeout_secs, 10);
        assert!(config.metric_filter().unwrap().matches("v.b.soc"));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            LogConfig::from_toml_str("queue_size = \"many\""),
            Err(LogError::Config(_))
        ));
    }

    #[test]
    fn test_paths() {
        let config = LogConfig::default();
        assert!(config.is_protected("/store/ovms_config"));
        assert!(!config.is_protected("/storage/x"));
        assert!(config.is_removable("/sd/can.crtd"));
        assert!(!config.is_removable("/sdcard/can.crtd"));
        assert!(!config.is_removable("/tmp/can.crtd"));
    }
}
