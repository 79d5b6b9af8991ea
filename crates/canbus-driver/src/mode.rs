//! 总线模式与速率定义

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// 总线工作模式
///
/// - **Off**: 控制器处于复位状态，收发器断电
/// - **Listen**: 只听模式，不发送也不应答
/// - **Active**: 正常收发
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BusMode {
    #[default]
    Off = 0,
    Listen = 1,
    Active = 2,
}

impl BusMode {
    /// 从 u8 转换，无效值视为 Off
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Listen,
            2 => Self::Active,
            _ => Self::Off,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BusMode::Off => "Off",
            BusMode::Listen => "Listen",
            BusMode::Active => "Active",
        }
    }
}

impl fmt::Display for BusMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BusMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "off" => Ok(BusMode::Off),
            "listen" => Ok(BusMode::Listen),
            "active" => Ok(BusMode::Active),
            other => Err(format!("unknown bus mode '{}'", other)),
        }
    }
}

/// 总线模式（原子版本，中断上下文与命令上下文共享）
#[derive(Debug)]
pub struct AtomicBusMode {
    inner: AtomicU8,
}

impl AtomicBusMode {
    pub fn new(mode: BusMode) -> Self {
        Self {
            inner: AtomicU8::new(mode.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> BusMode {
        BusMode::from_u8(self.inner.load(ordering))
    }

    pub fn set(&self, mode: BusMode, ordering: Ordering) {
        self.inner.store(mode.as_u8(), ordering);
    }
}

impl Default for AtomicBusMode {
    fn default() -> Self {
        Self::new(BusMode::Off)
    }
}

/// 总线速率
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BusSpeed {
    /// 33.333 kbps（单线 CAN）
    K33_3,
    /// 83.333 kbps
    K83_3,
    K100,
    K125,
    K250,
    #[default]
    K500,
    K1000,
}

impl BusSpeed {
    /// 比特率（bps）
    pub const fn bps(self) -> u32 {
        match self {
            BusSpeed::K33_3 => 33_333,
            BusSpeed::K83_3 => 83_333,
            BusSpeed::K100 => 100_000,
            BusSpeed::K125 => 125_000,
            BusSpeed::K250 => 250_000,
            BusSpeed::K500 => 500_000,
            BusSpeed::K1000 => 1_000_000,
        }
    }

    pub fn from_bps(bps: u32) -> Option<Self> {
        [
            BusSpeed::K33_3,
            BusSpeed::K83_3,
            BusSpeed::K100,
            BusSpeed::K125,
            BusSpeed::K250,
            BusSpeed::K500,
            BusSpeed::K1000,
        ]
        .into_iter()
        .find(|s| s.bps() == bps)
    }
}

impl fmt::Display for BusSpeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BusSpeed::K33_3 => write!(f, "33.3kbps"),
            BusSpeed::K83_3 => write!(f, "83.3kbps"),
            other => write!(f, "{}kbps", other.bps() / 1000),
        }
    }
}

/// 接受 kbps（`500`、`33.3`）或 bps（`500000`）
impl FromStr for BusSpeed {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim().trim_end_matches("kbps");
        let speed = match s {
            "33" | "33.3" | "33.33" => Some(BusSpeed::K33_3),
            "83" | "83.3" | "83.33" => Some(BusSpeed::K83_3),
            "100" => Some(BusSpeed::K100),
            "125" => Some(BusSpeed::K125),
            "250" => Some(BusSpeed::K250),
            "500" => Some(BusSpeed::K500),
            "1000" => Some(BusSpeed::K1000),
            other => other.parse::<u32>().ok().and_then(BusSpeed::from_bps),
        };
        speed.ok_or_else(|| format!("unsupported bus speed '{}'", s))
    }
}
