//! # CAN Bus Driver
//!
//! 控制器驱动、总线策略层与中央分发：
//!
//! - [`BusDriver`]：中断服务、帧提取、发送、控制器恢复
//! - [`Bus`]：模式 / 速率、发送排队、状态快照、看门狗
//! - [`CentralDispatch`]：单线程按序分发接收帧和发送完成事件，
//!   管理监听队列、帧回调、日志和回放注册表
//!
//! 硬件通过 [`CanController`] 接入；[`SimController`] 是软件模拟实现。

pub mod builder;
pub mod bus;
pub mod controller;
pub mod dispatch;
pub mod driver;
mod error;
pub mod hooks;
pub mod listener;
pub mod metrics;
pub mod mode;
pub mod registry;
pub mod sim;
mod thread;

pub use builder::DispatchBuilder;
pub use bus::{Bus, BusConfig, WriteOutcome};
pub use controller::{AcceptanceFilter, AcceptanceMode, CanController, RxWindow};
pub use dispatch::{CallbackKind, CentralDispatch, DispatchConfig, DispatchMessage};
pub use driver::{BusDriver, DriverConfig};
pub use error::DriverError;
pub use hooks::{CallbackRegistry, FrameCallback};
pub use listener::ListenerSet;
pub use metrics::BusCounters;
pub use mode::{AtomicBusMode, BusMode, BusSpeed};
pub use registry::{Loggable, Player, Registry};
pub use sim::SimController;
