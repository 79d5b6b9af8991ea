//! # CAN Bus Log
//!
//! CAN 流量日志：格式编解码、连接、文件和网络出口。
//!
//! ## 模块
//!
//! - `format`: [`FormatCodec`]、[`FormatRegistry`] 与内置格式（crtd / gvret-a / gvret-b / lawricel / pcap / cs11）
//! - `connection`: [`Connection`]（一个对端）与 [`FormattableSink`]
//! - `logger`: [`Logger`]（队列 + 写线程 + 传输），实现 `canbus_driver::Loggable`
//! - `sinks`: vfs / tcpclient / tcpserver / udpclient / udpserver / monitor 传输
//! - `player`: [`VfsPlayer`]，按记录时间回放日志文件
//! - `events`: 最小的系统事件总线（网络、存储、配置、指标）
//! - `command`: `can log …` 与 `can play …` 命令
//!
//! ```no_run
//! use canbus_log::{EventBus, FormatRegistry, LogConfig, LogContext, Logger, LoggerOptions, TransportKind};
//! use std::sync::Arc;
//!
//! let ctx = LogContext::new(
//!     Arc::new(FormatRegistry::with_builtin()),
//!     LogConfig::default().shared(),
//!     Arc::new(EventBus::with_state(true, false)),
//! );
//! let logger = Logger::new(LoggerOptions::new(TransportKind::Vfs, "crtd", "/tmp/can.crtd"), ctx)?;
//! logger.open()?;
//! # Ok::<(), canbus_log::LogError>(())
//! ```

pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod events;
pub mod format;
pub mod logger;
pub mod player;
pub mod sinks;

pub use command::{LogCommands, PlayCommands};
pub use config::{LogConfig, SharedConfig};
pub use connection::{Connection, FormattableSink};
pub use error::LogError;
pub use events::{Event, EventBus, SubscriptionId};
pub use format::{
    BusParams, CodecFactory, ControlCommand, CrtdCodec, Cs11Codec, DecodedRecord, FormatCodec,
    FormatRegistry, GvretAsciiCodec, GvretBinaryCodec, LawricelCodec, PcapCodec, ServeMode,
    ServeTarget, serve_records,
};
pub use logger::{LogContext, Logger, LoggerOptions};
pub use player::{PlayerOptions, VfsPlayer};
pub use sinks::TransportKind;
