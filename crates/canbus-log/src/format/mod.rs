//! 日志格式
//!
//! [`FormatCodec`] 把日志条目编码成线上字节，并解码连接上收到的字节
//! （帧记录、暂停 / 恢复 / 过滤器等控制命令、协议应答）。[`FormatRegistry`] 按名称创建编解码器。
//!
//! | 名称 | 形式 | 说明 |
//! |---|---|---|
//! | `crtd` | 文本 | 帧、状态、文本条目；控制命令 |
//! | `gvret-a` | 文本 | SavvyCAN / GVRET ASCII 帧 |
//! | `gvret-b` | 二进制 | GVRET 二进制协议，带命令应答 |
//! | `lawricel` | 文本 | SLCAN 风格 `t` / `T` 帧 |
//! | `pcap` | 二进制 | libpcap，链路类型 SocketCAN |
//! | `cs11` | 二进制 | CANswitch 帧与设置速率命令 |

pub mod crtd;
pub mod cs11;
pub mod gvret;
pub mod lawricel;
pub mod pcap;

use crate::connection::Connection;
use bytes::Bytes;
use canbus_driver::{BusMode, BusSpeed, CentralDispatch, DriverError};
use canbus_protocol::{CanFrame, LogMessage, LogType};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tracing::{debug, warn};

pub use crtd::CrtdCodec;
pub use cs11::Cs11Codec;
pub use gvret::{GvretAsciiCodec, GvretBinaryCodec};
pub use lawricel::LawricelCodec;
pub use pcap::PcapCodec;

/// 连接上收到的帧如何处理
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServeMode {
    /// 丢弃
    #[default]
    Discard,
    /// 当作接收帧注入分发器，不上总线
    Simulate,
    /// 真正发送到总线
    Transmit,
}

impl ServeMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ServeMode::Discard => "discard",
            ServeMode::Simulate => "simulate",
            ServeMode::Transmit => "transmit",
        }
    }
}

impl fmt::Display for ServeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServeMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "discard" => Ok(ServeMode::Discard),
            "simulate" => Ok(ServeMode::Simulate),
            "transmit" => Ok(ServeMode::Transmit),
            other => Err(format!("unknown serve mode '{}'", other)),
        }
    }
}

/// 流内控制命令
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlCommand {
    Pause,
    Resume,
    ClearFilters,
    /// 过滤器规格（`<bus>:<id>-<id>` 等）
    AddFilter(String),
}

/// 解码结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodedRecord {
    Frame { kind: LogType, frame: CanFrame },
    Control(ControlCommand),
    /// 后续帧的记录时间（只用于回放节奏，起点由格式决定）
    Timestamp(Duration),
    /// 直接回给对端的协议应答
    Reply(Bytes),
    /// 对端要求以新速率启动总线
    StartBus { bus: u8, speed: BusSpeed },
}

/// 一条总线的当前配置
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BusParams {
    pub mode: BusMode,
    pub speed: BusSpeed,
}

impl BusParams {
    /// GVRET 模式字节：bit0 启用，bit4 只听
    pub fn mode_bits(&self) -> u8 {
        let enabled = u8::from(self.mode != BusMode::Off);
        let listen = u8::from(self.mode == BusMode::Listen);
        enabled | (listen << 4)
    }

    /// 关闭的总线报告速率 0
    pub fn speed_bps(&self) -> u32 {
        if self.mode == BusMode::Off { 0 } else { self.speed.bps() }
    }
}

/// 回放帧的去处
pub trait ServeTarget: Send + Sync {
    /// 当作接收帧处理
    fn simulate(&self, frame: CanFrame);

    /// 发送到 `frame.origin` 指定的总线
    fn transmit(&self, frame: CanFrame) -> Result<(), DriverError>;

    /// 总线当前配置；总线不存在时返回 None
    fn bus_params(&self, bus: u8) -> Option<BusParams> {
        let _ = bus;
        None
    }

    /// 以 ACTIVE 模式和指定速率启动总线
    fn start_bus(&self, bus: u8, speed: BusSpeed) -> Result<(), DriverError> {
        let _ = speed;
        Err(DriverError::UnknownBus(bus))
    }
}

impl ServeTarget for CentralDispatch {
    fn simulate(&self, frame: CanFrame) {
        if !self.inject_frame(frame) {
            debug!("dispatch queue full, simulated frame dropped");
        }
    }

    fn transmit(&self, frame: CanFrame) -> Result<(), DriverError> {
        self.write(frame.origin, frame, Duration::ZERO).map(|_| ())
    }

    fn bus_params(&self, bus: u8) -> Option<BusParams> {
        self.bus(bus).map(|b| BusParams {
            mode: b.mode(),
            speed: b.speed(),
        })
    }

    fn start_bus(&self, bus: u8, speed: BusSpeed) -> Result<(), DriverError> {
        self.bus(bus)
            .ok_or(DriverError::UnknownBus(bus))?
            .start(BusMode::Active, speed)
    }
}

/// 按服务模式处理解码结果
///
/// 控制命令在任何模式下都作用于 `connection`，应答总是写回对端；
/// 帧按 `mode` 丢弃、注入或发送，启动总线只在 transmit 模式下执行。
pub fn serve_records(
    records: Vec<DecodedRecord>,
    mode: ServeMode,
    connection: &Connection,
    target: Option<&dyn ServeTarget>,
) {
    for record in records {
        match record {
            DecodedRecord::Control(cmd) => connection.apply_control(&cmd),
            DecodedRecord::Reply(bytes) => {
                if let Err(e) = connection.write_raw(&bytes) {
                    debug!("{}: reply failed: {}", connection.summary(), e);
                }
            },
            DecodedRecord::Frame { frame, .. } => match (mode, target) {
                (ServeMode::Simulate, Some(target)) => target.simulate(frame),
                (ServeMode::Transmit, Some(target)) => {
                    if let Err(e) = target.transmit(frame) {
                        debug!("{}: transmit failed: {}", connection.summary(), e);
                    }
                },
                _ => {},
            },
            DecodedRecord::StartBus { bus, speed } => match (mode, target) {
                (ServeMode::Transmit, Some(target)) => {
                    if let Err(e) = target.start_bus(bus, speed) {
                        warn!("{}: cannot start can{}: {}", connection.summary(), bus, e);
                    }
                },
                _ => debug!("{}: ignoring start request for can{}", connection.summary(), bus),
            },
            DecodedRecord::Timestamp(_) => {},
        }
    }
}

/// 日志格式编解码器
pub trait FormatCodec: Send {
    /// 注册名
    fn name(&self) -> &'static str;

    /// 编码一条日志；格式不支持的条目返回空
    fn encode(&self, msg: &LogMessage) -> Bytes;

    /// 新连接开头写入的文件头
    fn header(&self, timestamp: SystemTime) -> Bytes {
        let _ = timestamp;
        Bytes::new()
    }

    /// 连接建立时写入的内容；需要总线配置的格式覆盖这个方法
    fn session_header(&self, timestamp: SystemTime, target: Option<&dyn ServeTarget>) -> Bytes {
        let _ = target;
        self.header(timestamp)
    }

    /// 解码输入字节，返回消耗的字节数
    ///
    /// 不完整的记录由编解码器自己缓存，等待下一次调用。
    fn decode(&mut self, input: &[u8], out: &mut Vec<DecodedRecord>) -> usize;

    /// 解码并按服务模式处理，见 [`serve_records`]
    fn serve(
        &mut self,
        input: &[u8],
        mode: ServeMode,
        connection: &Connection,
        target: Option<&dyn ServeTarget>,
    ) -> usize {
        let mut records = Vec::new();
        let consumed = self.decode(input, &mut records);
        serve_records(records, mode, connection, target);
        consumed
    }
}

/// 编解码器工厂
pub type CodecFactory = Arc<dyn Fn() -> Box<dyn FormatCodec> + Send + Sync>;

/// 由构造函数生成工厂
pub fn factory<C: FormatCodec + 'static>(make: fn() -> C) -> CodecFactory {
    Arc::new(move || Box::new(make()) as Box<dyn FormatCodec>)
}

/// 格式注册表
pub struct FormatRegistry {
    factories: RwLock<BTreeMap<String, CodecFactory>>,
}

impl Default for FormatRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

impl FormatRegistry {
    /// 空注册表
    pub fn new() -> Self {
        Self {
            factories: RwLock::new(BTreeMap::new()),
        }
    }

    /// 注册了全部内置格式的注册表
    pub fn with_builtin() -> Self {
        let registry = Self::new();
        registry.register_format("crtd", factory(CrtdCodec::new));
        registry.register_format("gvret-a", factory(GvretAsciiCodec::new));
        registry.register_format("gvret-b", factory(GvretBinaryCodec::new));
        registry.register_format("lawricel", factory(LawricelCodec::new));
        registry.register_format("pcap", factory(PcapCodec::new));
        registry.register_format("cs11", factory(Cs11Codec::new));
        registry
    }

    /// 注册格式；同名格式被替换
    pub fn register_format(&self, name: &str, factory: CodecFactory) {
        debug!("registering CAN format: {}", name);
        self.factories.write().insert(name.to_string(), factory);
    }

    /// 按名称创建编解码器；未注册返回 None
    pub fn create(&self, name: &str) -> Option<Box<dyn FormatCodec>> {
        let factory = self.factories.read().get(name).cloned()?;
        Some(factory())
    }

    pub fn names(&self) -> Vec<String> {
        self.factories.read().keys().cloned().collect()
    }
}
