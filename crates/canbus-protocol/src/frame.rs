//! CAN 2.0 帧定义

use crate::ProtocolError;

/// 经典 CAN 帧的最大数据长度
pub const MAX_DLC: usize = 8;

/// 11-bit 标准帧 ID 掩码
pub const STD_ID_MASK: u32 = 0x7FF;

/// 29-bit 扩展帧 ID 掩码
pub const EXT_ID_MASK: u32 = 0x1FFF_FFFF;

/// 帧格式（标准帧 / 扩展帧）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum FrameFormat {
    /// 11-bit ID
    #[default]
    Standard,
    /// 29-bit ID
    Extended,
}

impl FrameFormat {
    /// 该格式允许的最大 ID
    pub const fn id_mask(self) -> u32 {
        match self {
            FrameFormat::Standard => STD_ID_MASK,
            FrameFormat::Extended => EXT_ID_MASK,
        }
    }

    /// ID 位宽（11 或 29），用于日志格式输出
    pub const fn bits(self) -> u8 {
        match self {
            FrameFormat::Standard => 11,
            FrameFormat::Extended => 29,
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            FrameFormat::Standard => "standard",
            FrameFormat::Extended => "extended",
        }
    }
}

/// CAN 帧
///
/// # 设计特性
///
/// - **Copy trait**：在中断上下文、分发线程、日志线程之间按值复制，
///   任何队列边界都不共享指针
/// - **固定 8 字节**：避免堆分配
/// - **origin**：产生该帧的总线编号（1 起始），0 表示未归属任何总线。
///   由 BusDriver 在入队前写入
///
/// ```rust
/// use canbus_protocol::CanFrame;
///
/// let frame = CanFrame::new_standard(0x123, &[1, 2, 3, 4]).with_origin(1);
/// assert_eq!(frame.id, 0x123);
/// assert_eq!(frame.data_slice(), &[1, 2, 3, 4]);
/// assert_eq!(frame.origin, 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanFrame {
    /// 来源总线编号（0 = 无）
    pub origin: u8,

    /// CAN ID（标准帧或扩展帧）
    pub id: u32,

    /// 帧格式
    pub format: FrameFormat,

    /// 远程帧标志
    pub rtr: bool,

    /// 有效数据长度 (0-8)
    pub dlc: u8,

    /// 帧数据（固定 8 字节，未使用部分为 0）
    pub data: [u8; MAX_DLC],
}

impl CanFrame {
    /// 创建标准帧（数据超过 8 字节时截断，ID 按 11-bit 掩码截断）
    pub fn new_standard(id: u32, data: &[u8]) -> Self {
        Self::new(id & STD_ID_MASK, data, FrameFormat::Standard)
    }

    /// 创建扩展帧（数据超过 8 字节时截断，ID 按 29-bit 掩码截断）
    pub fn new_extended(id: u32, data: &[u8]) -> Self {
        Self::new(id & EXT_ID_MASK, data, FrameFormat::Extended)
    }

    /// 带校验的构造器：ID 越界或数据超过 8 字节时返回错误
    pub fn try_new(id: u32, data: &[u8], format: FrameFormat) -> Result<Self, ProtocolError> {
        if id > format.id_mask() {
            return Err(ProtocolError::InvalidId {
                id,
                format: format.as_str(),
            });
        }
        if data.len() > MAX_DLC {
            return Err(ProtocolError::InvalidDlc(data.len()));
        }
        Ok(Self::new(id, data, format))
    }

    fn new(id: u32, data: &[u8], format: FrameFormat) -> Self {
        let mut fixed = [0u8; MAX_DLC];
        let len = data.len().min(MAX_DLC);
        fixed[..len].copy_from_slice(&data[..len]);

        Self {
            origin: 0,
            id,
            format,
            rtr: false,
            dlc: len as u8,
            data: fixed,
        }
    }

    /// 标记来源总线
    #[must_use]
    pub fn with_origin(mut self, bus: u8) -> Self {
        self.origin = bus;
        self
    }

    /// 标记为远程帧
    #[must_use]
    pub fn with_rtr(mut self, rtr: bool) -> Self {
        self.rtr = rtr;
        self
    }

    /// 获取数据切片（只包含有效数据）
    pub fn data_slice(&self) -> &[u8] {
        &self.data[..(self.dlc as usize).min(MAX_DLC)]
    }

    pub fn is_extended(&self) -> bool {
        self.format == FrameFormat::Extended
    }
}
