//! CAN 控制器寄存器抽象
//!
//! `CanController` 是硬件接缝：按 SJA1000 (PeliCAN) 风格暴露中断标志、
//! 状态寄存器、接收窗口、错误计数器和模式切换。BusDriver 只通过这个 trait
//! 访问硬件，测试和 CLI 使用 [`SimController`](crate::sim::SimController)。
//!
//! 寄存器读取也可能有副作用（读 IR / ECC 会清零），所以所有方法都取 `&mut self`，
//! 调用方必须持有驱动的临界区。

use crate::error::DriverError;
use crate::mode::BusSpeed;
use canbus_protocol::{CanFrame, FrameFormat, MAX_DLC};

/// 接收消息计数器（RMC）饱和值
///
/// 达到该值后控制器无法自行重新同步，只能复位。
pub const RMC_SATURATED: u8 = 64;

/// 接收窗口内容
///
/// `dlc` 是寄存器原始值（0-15），大于 8 表示帧无效。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RxWindow {
    pub id: u32,
    pub format: FrameFormat,
    pub rtr: bool,
    pub dlc: u8,
    pub data: [u8; MAX_DLC],
}

impl RxWindow {
    pub fn from_frame(frame: &CanFrame) -> Self {
        Self {
            id: frame.id,
            format: frame.format,
            rtr: frame.rtr,
            dlc: frame.dlc,
            data: frame.data,
        }
    }

    /// 转换为帧并标记来源总线；DLC 非法时返回 None
    pub fn to_frame(&self, bus: u8) -> Option<CanFrame> {
        if self.dlc as usize > MAX_DLC {
            return None;
        }
        Some(CanFrame {
            origin: bus,
            id: self.id & self.format.id_mask(),
            format: self.format,
            rtr: self.rtr,
            dlc: self.dlc,
            data: self.data,
        })
    }
}

/// 验收过滤器模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AcceptanceMode {
    /// 单个 32-bit 过滤器
    #[default]
    Single,
    /// 两个 16-bit 过滤器（仅比较标准帧 ID + RTR）
    Dual,
}

/// 硬件验收过滤器
///
/// mask 位为 1 表示"不关心"。默认 mask 全 1，接收所有帧。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcceptanceFilter {
    pub mode: AcceptanceMode,
    pub mask: u32,
    pub code: u32,
}

impl Default for AcceptanceFilter {
    fn default() -> Self {
        Self::accept_all()
    }
}

impl AcceptanceFilter {
    pub const fn accept_all() -> Self {
        Self {
            mode: AcceptanceMode::Single,
            mask: u32::MAX,
            code: 0,
        }
    }

    /// 解析 `<single|dual> <mask> <code>`（mask / code 为十六进制）
    pub fn parse(mode: &str, mask: &str, code: &str) -> Result<Self, DriverError> {
        let mode = match mode {
            "single" => AcceptanceMode::Single,
            "dual" => AcceptanceMode::Dual,
            other => {
                return Err(DriverError::InvalidInput(format!(
                    "filter mode must be single or dual, got '{}'",
                    other
                )));
            },
        };
        let parse = |text: &str| {
            let digits = text.trim_start_matches("0x").trim_start_matches("0X");
            u32::from_str_radix(digits, 16)
                .map_err(|_| DriverError::InvalidInput(format!("invalid hex value '{}'", text)))
        };
        Ok(Self {
            mode,
            mask: parse(mask)?,
            code: parse(code)?,
        })
    }

    /// 帧是否能通过过滤器
    pub fn accepts(&self, window: &RxWindow) -> bool {
        let rtr = window.rtr as u32;
        match self.mode {
            AcceptanceMode::Single => {
                let value = match window.format {
                    FrameFormat::Standard => (window.id & 0x7FF) << 21 | rtr << 20,
                    FrameFormat::Extended => (window.id & 0x1FFF_FFFF) << 3 | rtr << 2,
                };
                (value ^ self.code) & !self.mask == 0
            },
            AcceptanceMode::Dual => {
                let value = match window.format {
                    FrameFormat::Standard => (window.id & 0x7FF) << 5 | rtr << 4,
                    // 扩展帧只比较 ID 高 16 位
                    FrameFormat::Extended => (window.id >> 13) & 0xFFFF,
                };
                let hit = |code: u32, mask: u32| (value ^ code) & !mask & 0xFFFF == 0;
                hit(self.code >> 16, self.mask >> 16) || hit(self.code & 0xFFFF, self.mask & 0xFFFF)
            },
        }
    }
}

/// CAN 控制器寄存器接口
pub trait CanController: Send {
    /// 读取并清除中断标志（IR）
    fn take_interrupts(&mut self) -> u8;

    /// 状态寄存器（SR）
    fn status(&mut self) -> u8;

    /// 接收消息计数器（RMC）
    fn rx_message_count(&mut self) -> u8;

    /// 读取当前接收窗口
    fn read_rx(&mut self) -> RxWindow;

    /// 释放接收缓冲区（RRB），窗口移到下一帧
    fn release_rx(&mut self);

    /// 清除数据溢出（CDO）
    fn clear_overrun(&mut self);

    /// 读取并清除错误捕获码（ECC）
    fn take_error_capture(&mut self) -> u8;

    fn rx_error_counter(&mut self) -> u8;

    fn tx_error_counter(&mut self) -> u8;

    /// 写 TEC（只在复位模式下生效）
    fn set_tx_error_counter(&mut self, value: u8);

    /// 请求进入 / 退出复位模式；生效可能有延迟，用 `in_reset_mode` 确认
    fn set_reset_mode(&mut self, reset: bool);

    fn in_reset_mode(&mut self) -> bool;

    fn set_listen_only(&mut self, listen: bool);

    fn listen_only(&mut self) -> bool;

    /// 配置位时序（复位模式下调用）
    fn configure(&mut self, speed: BusSpeed) -> Result<(), DriverError>;

    /// 写验收过滤器（复位模式下调用）
    fn set_acceptance_filter(&mut self, filter: &AcceptanceFilter);

    /// 装载发送缓冲区
    fn load_tx(&mut self, frame: &CanFrame);

    /// 请求发送（TR）
    fn request_tx(&mut self);

    /// 请求中止发送（AT）
    fn abort_tx(&mut self);

    /// 收发器电源
    fn set_powered(&mut self, on: bool) {
        let _ = on;
    }
}
