//! 总线状态计数器与错误标志

use bilge::prelude::*;

/// 总线状态快照
///
/// 只由所属的 Bus / BusDriver 修改，其他地方只读。
/// `checksum()` 用于 O(1) 判断"自上次观察以来是否变化"。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct BusStatus {
    /// 中断次数
    pub interrupts: u32,
    /// 接收帧数
    pub packets_rx: u32,
    /// 发送成功帧数
    pub packets_tx: u32,
    /// 进入延迟发送队列的帧数
    pub txbuf_delay: u32,
    /// RX FIFO 溢出丢弃的帧数
    pub rxbuf_overflow: u32,
    /// 延迟发送队列满导致的丢帧数
    pub txbuf_overflow: u32,
    /// 错误标志（见 [`ErrorFlags`]）
    pub error_flags: u32,
    /// 接收错误计数器（REC）
    pub errors_rx: u32,
    /// 发送错误计数器（TEC）
    pub errors_tx: u32,
    /// 看门狗重启次数
    pub watchdog_resets: u32,
    /// 控制器强制复位次数（RMC 饱和 / bus-off 卡死）
    pub error_resets: u32,
    /// REC 勘误修正次数
    pub errata_fixes: u32,
    /// DLC 非法被丢弃的帧数
    pub invalid_frames: u32,
    /// 分发队列满导致的丢帧数
    pub dispatch_overflow: u32,
}

impl BusStatus {
    /// 状态校验和
    ///
    /// 只覆盖错误相关计数器，收发计数的正常增长不算"状态变化"。
    pub fn checksum(&self) -> u32 {
        self.errors_rx
            .wrapping_add(self.errors_tx)
            .wrapping_add(self.rxbuf_overflow)
            .wrapping_add(self.txbuf_overflow)
            .wrapping_add(self.error_flags)
            .wrapping_add(self.txbuf_delay)
            .wrapping_add(self.watchdog_resets)
            .wrapping_add(self.error_resets)
    }

    pub fn flags(&self) -> ErrorFlags {
        ErrorFlags(self.error_flags)
    }
}

// ============================================================================
// 错误标志
// ============================================================================

/// 中断标志位
pub mod irq {
    pub const RX: u8 = 0x01;
    pub const TX: u8 = 0x02;
    pub const ERROR_WARNING: u8 = 0x04;
    pub const DATA_OVERRUN: u8 = 0x08;
    pub const WAKEUP: u8 = 0x10;
    pub const ERROR_PASSIVE: u8 = 0x20;
    pub const ARB_LOST: u8 = 0x40;
    pub const BUS_ERROR: u8 = 0x80;

    /// 记录到错误标志中的中断位
    pub const ERRORS: u8 = ERROR_WARNING | DATA_OVERRUN | ERROR_PASSIVE | ARB_LOST | BUS_ERROR;
}

/// 状态寄存器位
pub mod sr {
    /// 接收缓冲区有数据
    pub const RX_BUFFER: u8 = 0x01;
    /// 数据溢出
    pub const DATA_OVERRUN: u8 = 0x02;
    /// 发送缓冲区空闲
    pub const TX_BUFFER: u8 = 0x04;
    /// 上次发送完成
    pub const TX_COMPLETE: u8 = 0x08;
    pub const RECEIVING: u8 = 0x10;
    pub const TRANSMITTING: u8 = 0x20;
    /// 错误警告（REC 或 TEC ≥ 96）
    pub const ERROR_STATUS: u8 = 0x40;
    /// bus-off
    pub const BUS_OFF: u8 = 0x80;

    /// 记录到错误标志中的状态位（去掉瞬态的收发位）
    pub const RECORDED: u8 = 0b1100_1111;
}

/// 错误捕获码（ECC 寄存器）
///
/// - Bit 0-4: 出错的帧段
/// - Bit 5: 方向（1 = 接收时出错）
/// - Bit 6-7: 错误类型（0 位错误，1 格式错误，2 填充错误，3 其他）
#[bitsize(8)]
#[derive(FromBits, DebugBits, Clone, Copy, Default)]
pub struct ErrorCapture {
    pub segment: u5,
    pub rx: bool,
    pub kind: u2,
}

impl ErrorCapture {
    pub fn kind_name(&self) -> &'static str {
        match self.kind().value() {
            0 => "bit error",
            1 => "form error",
            2 => "stuff error",
            _ => "other error",
        }
    }

    pub fn segment_name(&self) -> &'static str {
        match self.segment().value() {
            0x03 => "start of frame",
            0x02 => "ID.28-21",
            0x06 => "ID.20-18",
            0x04 => "SRTR bit",
            0x05 => "IDE bit",
            0x07 => "ID.17-13",
            0x0F => "ID.12-5",
            0x0E => "ID.4-0",
            0x0C => "RTR bit",
            0x0D => "reserved bit 1",
            0x09 => "reserved bit 0",
            0x0B => "data length code",
            0x0A => "data field",
            0x08 => "CRC sequence",
            0x18 => "CRC delimiter",
            0x19 => "acknowledge slot",
            0x1B => "acknowledge delimiter",
            0x1A => "end of frame",
            0x12 => "intermission",
            0x11 => "active error flag",
            0x16 => "passive error flag",
            0x13 => "tolerate dominant bits",
            0x17 => "error delimiter",
            0x1C => "overload flag",
            _ => "unknown segment",
        }
    }
}

/// 错误标志
///
/// 布局：`interrupt flags << 16 | status bits << 8 | error capture code`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ErrorFlags(pub u32);

impl ErrorFlags {
    pub fn compose(interrupts: u8, status: u8, capture: u8) -> Self {
        Self((interrupts as u32) << 16 | ((status & sr::RECORDED) as u32) << 8 | capture as u32)
    }

    pub fn interrupts(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn status(&self) -> u8 {
        (self.0 >> 8) as u8
    }

    pub fn capture(&self) -> ErrorCapture {
        ErrorCapture::from(u8::new(self.0 as u8))
    }

    /// 面向操作员的错误描述
    pub fn describe(&self) -> String {
        if self.0 == 0 {
            return "no errors".to_string();
        }

        let mut parts: Vec<String> = Vec::new();
        let ir = self.interrupts();
        for (bit, name) in [
            (irq::ERROR_WARNING, "error warning"),
            (irq::DATA_OVERRUN, "data overrun"),
            (irq::ERROR_PASSIVE, "error passive"),
            (irq::ARB_LOST, "arbitration lost"),
            (irq::BUS_ERROR, "bus error"),
        ] {
            if ir & bit != 0 {
                parts.push(name.to_string());
            }
        }

        let status = self.status();
        if status & sr::BUS_OFF != 0 {
            parts.push("bus-off".to_string());
        } else if status & sr::ERROR_STATUS != 0 {
            parts.push("error counter warning".to_string());
        }

        if ir & irq::BUS_ERROR != 0 {
            let capture = self.capture();
            parts.push(format!(
                "{} in {} while {}",
                capture.kind_name(),
                capture.segment_name(),
                if capture.rx() { "receiving" } else { "transmitting" }
            ));
        }

        parts.join(", ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum_ignores_traffic_counters() {
        let mut status = BusStatus::default();
        let base = status.checksum();

        status.packets_rx = 1000;
        status.packets_tx = 10;
        status.interrupts = 1010;
        assert_eq!(status.checksum(), base);

        status.rxbuf_overflow = 3;
        assert_ne!(status.checksum(), base);
    }

    #[test]
    fn test_checksum_wraps() {
        let status = BusStatus {
            errors_rx: u32::MAX,
            errors_tx: 2,
            ..Default::default()
        };
        assert_eq!(status.checksum(), 1);
    }

    #[test]
    fn test_error_flags_layout() {
        // 总线错误中断 + 错误警告状态 + 接收时 CRC 序列填充错误
        let capture = 0b10_1_01000; // stuff error, rx, CRC sequence
        let flags = ErrorFlags::compose(irq::BUS_ERROR, sr::ERROR_STATUS | sr::RECEIVING, capture);

        assert_eq!(flags.interrupts(), irq::BUS_ERROR);
        // RECEIVING 是瞬态位，不记录
        assert_eq!(flags.status(), sr::ERROR_STATUS);

        let c = flags.capture();
        assert!(c.rx());
        assert_eq!(c.kind_name(), "stuff error");
        assert_eq!(c.segment_name(), "CRC sequence");

        let text = flags.describe();
        assert!(text.contains("bus error"), "{}", text);
        assert!(text.contains("stuff error in CRC sequence while receiving"), "{}", text);
    }

    #[test]
    fn test_describe_empty() {
        assert_eq!(ErrorFlags(0).describe(), "no errors");
    }
}
