//! CLI 配置文件
//!
//! 默认位置 `<config_dir>/canbus/config.toml`，不存在时使用默认值。
//!
//! ```toml
//! network_up = true
//!
//! [log]
//! vehicle = "demo"
//! udp_idle_timeout_secs = 30
//!
//! [dispatch]
//! inbound_queue_size = 100
//!
//! [[bus]]
//! mode = "listen"
//! speed = "500"
//! ```

use anyhow::{Context, Result};
use canbus_driver::{BusMode, BusSpeed, DispatchConfig};
use canbus_log::LogConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// 单条总线的启动设置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BusEntry {
    /// 启动模式；`off` 表示不自动启动
    pub mode: String,
    pub speed: String,
}

impl Default for BusEntry {
    fn default() -> Self {
        Self {
            mode: "off".to_string(),
            speed: "500".to_string(),
        }
    }
}

impl BusEntry {
    pub fn mode(&self) -> Result<BusMode> {
        self.mode.parse().map_err(anyhow::Error::msg)
    }

    pub fn speed(&self) -> Result<BusSpeed> {
        self.speed.parse().map_err(anyhow::Error::msg)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CliConfig {
    /// 启动时网络是否可用
    pub network_up: bool,
    /// 启动时可移动存储是否已挂载
    pub sd_mounted: bool,
    pub log: LogConfig,
    pub dispatch: DispatchConfig,
    /// 模拟总线，按顺序编号为 1..=N
    pub bus: Vec<BusEntry>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            network_up: true,
            sd_mounted: false,
            log: LogConfig::default(),
            dispatch: DispatchConfig::default(),
            bus: vec![BusEntry::default(); 3],
        }
    }
}

impl CliConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("canbus").join("config.toml"))
    }

    /// 显式路径必须存在；默认路径不存在时回退到默认配置
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None => match Self::default_path() {
                Some(path) if path.exists() => Self::read(&path),
                _ => Ok(Self::default()),
            },
        }
    }

    fn read(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml_str(&text).with_context(|| format!("Failed to parse {}", path.display()))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: CliConfig = toml::from_str(text)?;
        if config.bus.is_empty() {
            anyhow::bail!("at least one [[bus]] entry is required");
        }
        for entry in &config.bus {
            entry.mode()?;
            entry.speed()?;
        }
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_has_three_idle_buses() {
        let config = CliConfig::default();
        assert_eq!(config.bus.len(), 3);
        assert!(config.bus.iter().all(|b| b.mode().unwrap() == BusMode::Off));
        assert!(config.network_up);
    }

    #[test]
    fn test_parse_sections() {
        let config = CliConfig::from_toml_str(
            r#"
            sd_mounted = true

            [log]
            vehicle = "demo"

            [dispatch]
            inbound_queue_size = 16

            [[bus]]
            mode = "listen"
            speed = "250"

            [[bus]]
            "#,
        )
        .unwrap();
        assert!(config.sd_mounted);
        assert_eq!(config.log.vehicle, "demo");
        assert_eq!(config.dispatch.inbound_queue_size, 16);
        assert_eq!(config.bus.len(), 2);
        assert_eq!(config.bus[0].mode().unwrap(), BusMode::Listen);
        assert_eq!(config.bus[0].speed().unwrap(), BusSpeed::K250);
        assert_eq!(config.bus[1], BusEntry::default());
    }

    #[test]
    fn test_rejects_bad_entries() {
        assert!(CliConfig::from_toml_str("bus = []").is_err());
        assert!(CliConfig::from_toml_str("[[bus]]\nmode = \"loud\"").is_err());
        assert!(CliConfig::from_toml_str("[[bus]]\nspeed = \"7\"").is_err());
    }

    #[test]
    fn test_explicit_path_must_exist() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CliConfig::load(Some(&dir.path().join("missing.toml"))).is_err());

        let path = dir.path().join("config.toml");
        std::fs::write(&path, "network_up = false\n").unwrap();
        assert!(!CliConfig::load(Some(&path)).unwrap().network_up);
    }
}
