//! # CAN Bus Protocol
//!
//! CAN 总线子系统的值类型定义（无硬件依赖，无 I/O）
//!
//! ## 模块
//!
//! - `frame`: CAN 帧（标准帧/扩展帧）
//! - `status`: 总线状态计数器与错误标志解码
//! - `message`: 日志消息（帧 / 状态 / 文本）
//! - `filter`: 帧过滤规则（bus + id 范围）
//! - `name_filter`: 事件名 / 指标名的字符串过滤
//!
//! 所有类型都是值语义：跨队列传递时按值复制，从不共享指针。

pub mod error;
pub mod filter;
pub mod frame;
pub mod message;
pub mod name_filter;
pub mod status;

pub use error::ProtocolError;
pub use filter::{FilterRule, FrameFilter};
pub use frame::{CanFrame, EXT_ID_MASK, FrameFormat, MAX_DLC, STD_ID_MASK};
pub use message::{LogMessage, LogPayload, LogType};
pub use name_filter::NameFilter;
pub use status::{BusStatus, ErrorCapture, ErrorFlags};
