//! 协议层错误类型定义

use thiserror::Error;

/// 协议层错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// CAN ID 超出帧格式允许的范围
    #[error("Invalid CAN ID {id:#X} for {format} frame")]
    InvalidId { id: u32, format: &'static str },

    /// 数据长度超过 8 字节
    #[error("Invalid DLC: {0} (max 8)")]
    InvalidDlc(usize),

    /// 过滤器字符串无法解析
    #[error("Invalid filter '{0}': expected <bus> | <id>[-<id>] | <bus>:<id>[-<id>]")]
    InvalidFilter(String),

    /// 名称过滤模式无法解析
    #[error("Invalid name pattern '{0}'")]
    InvalidPattern(String),
}
