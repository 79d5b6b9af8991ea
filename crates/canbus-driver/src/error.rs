//! 驱动层错误类型定义

use crate::mode::BusSpeed;
use canbus_protocol::ProtocolError;
use thiserror::Error;

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 协议值错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 总线不在 ACTIVE 模式，无法发送
    #[error("Bus can{0} is not in active mode")]
    NotActive(u8),

    /// 硬件发送缓冲区忙（调用方可以改为排队）
    #[error("Transmit buffer busy")]
    HardwareBusy,

    /// 延迟发送队列已满
    #[error("Transmit queue full")]
    TxQueueFull,

    /// 控制器模式切换超时（复位模式未生效）
    #[error("Controller mode change timed out")]
    ModeChangeTimeout,

    /// 控制器不支持该速率
    #[error("Unsupported bus speed: {0}")]
    UnsupportedSpeed(BusSpeed),

    /// 总线编号不存在
    #[error("Unknown bus: can{0}")]
    UnknownBus(u8),

    /// 分发通道已关闭（分发线程退出）
    #[error("Dispatch channel closed")]
    ChannelClosed,

    /// 无效输入（命令参数等）
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// 线程错误
    #[error("Thread error: {0}")]
    Thread(String),
}
