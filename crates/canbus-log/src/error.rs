//! 日志层错误类型定义

use canbus_driver::DriverError;
use canbus_protocol::ProtocolError;
use thiserror::Error;

/// 日志层错误类型
#[derive(Error, Debug)]
pub enum LogError {
    /// 格式未注册
    #[error("Unknown format: {0}")]
    UnknownFormat(String),

    /// 传输类型未知
    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    /// 受保护的路径
    #[error("Path is protected: {0}")]
    ProtectedPath(String),

    /// 可移动存储未挂载
    #[error("Storage not mounted for {0}")]
    MediumUnavailable(String),

    /// 网络未就绪
    #[error("Network is not available")]
    NetworkDown,

    /// 连接超时
    #[error("Connection to {0} timed out")]
    ConnectTimeout(String),

    /// 日志编号不存在
    #[error("No logger #{0}")]
    NotFound(u32),

    /// 参数错误
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// I/O 错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// 配置文件解析错误
    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 测试 LogError 的 Display 实现
    #[test]
    fn test_log_error_display() {
        assert_eq!(
            LogError::UnknownFormat("pcap".to_string()).to_string(),
            "Unknown format: pcap"
        );
        assert_eq!(LogError::NetworkDown.to_string(), "Network is not available");
        assert_eq!(LogError::NotFound(3).to_string(), "No logger #3");
    }

    /// 测试 From 转换
    #[test]
    fn test_from_conversions() {
        let err: LogError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, LogError::Io(_)));

        let err: LogError = ProtocolError::InvalidFilter("x".to_string()).into();
        assert!(matches!(err, LogError::Protocol(_)));

        let err: LogError = DriverError::UnknownBus(4).into();
        assert!(err.to_string().contains("can4"));
    }
}
