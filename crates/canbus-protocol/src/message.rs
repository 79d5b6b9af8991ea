//! 日志消息定义
//!
//! 一条日志消息是帧、总线状态或文本三者之一，附带类型标签和采集时间戳。
//! 入队后不可变；文本负载由消息自身拥有，出队方释放一次。

use crate::{BusStatus, CanFrame};
use std::time::SystemTime;

/// 日志条目类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, num_enum::TryFromPrimitive)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u8)]
pub enum LogType {
    /// 接收帧
    Rx = 1,
    /// 发送成功的帧
    Tx = 2,
    /// 进入延迟发送队列的帧
    TxQueue = 3,
    /// 发送失败的帧
    TxFail = 4,
    /// 错误状态
    Error = 11,
    /// 周期统计
    Statistics = 12,
    /// 注释
    Comment = 21,
    /// 配置信息
    Config = 22,
    /// 系统事件
    Event = 23,
    /// 指标变化
    Metric = 24,
}

impl LogType {
    /// 日志格式中使用的类型名
    pub const fn name(self) -> &'static str {
        match self {
            LogType::Rx => "RX",
            LogType::Tx => "TX",
            LogType::TxQueue => "TX_Queue",
            LogType::TxFail => "TX_Fail",
            LogType::Error => "Error",
            LogType::Statistics => "Status",
            LogType::Comment => "Comment",
            LogType::Config => "Info",
            LogType::Event => "Event",
            LogType::Metric => "Metric",
        }
    }

    pub const fn is_frame(self) -> bool {
        matches!(
            self,
            LogType::Rx | LogType::Tx | LogType::TxQueue | LogType::TxFail
        )
    }

    pub const fn is_status(self) -> bool {
        matches!(self, LogType::Error | LogType::Statistics)
    }

    pub const fn is_info(self) -> bool {
        matches!(
            self,
            LogType::Comment | LogType::Config | LogType::Event | LogType::Metric
        )
    }
}

/// 日志负载
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogPayload {
    Frame(CanFrame),
    Status(BusStatus),
    Text(String),
}

/// 日志消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogMessage {
    pub kind: LogType,
    /// 来源总线（0 = 无）
    pub bus: u8,
    /// 采集时间（墙上时钟）
    pub timestamp: SystemTime,
    pub payload: LogPayload,
}

impl LogMessage {
    /// 帧消息，总线取自帧的 origin
    pub fn frame(kind: LogType, frame: CanFrame) -> Self {
        Self {
            kind,
            bus: frame.origin,
            timestamp: SystemTime::now(),
            payload: LogPayload::Frame(frame),
        }
    }

    pub fn status(kind: LogType, bus: u8, status: BusStatus) -> Self {
        Self {
            kind,
            bus,
            timestamp: SystemTime::now(),
            payload: LogPayload::Status(status),
        }
    }

    pub fn info(kind: LogType, bus: u8, text: impl Into<String>) -> Self {
        Self {
            kind,
            bus,
            timestamp: SystemTime::now(),
            payload: LogPayload::Text(text.into()),
        }
    }

    /// 覆盖采集时间（回放、测试）
    #[must_use]
    pub fn at(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn as_frame(&self) -> Option<&CanFrame> {
        match &self.payload {
            LogPayload::Frame(frame) => Some(frame),
            _ => None,
        }
    }
}
