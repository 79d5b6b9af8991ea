//! CANswitch CS11 二进制格式
//!
//! 每条消息以长度字节开头：
//!
//! - `len bus id_lo id_hi data[len-3]`：一帧标准帧（只支持 11 位 ID）
//! - `0`：同步，之后每收到一帧回 `01 bus` 作为确认
//! - `255 bus code`：以指定速率启动总线（0=125k 1=250k 2=500k 3=1000k 4=83.3k）
//!
//! 线上总线号从 0 开始。日志只输出标准 RX 帧。

use super::{DecodedRecord, FormatCodec};
use bytes::{Buf, Bytes, BytesMut};
use canbus_driver::BusSpeed;
use canbus_protocol::{CanFrame, FrameFormat, LogMessage, LogPayload, LogType, MAX_DLC};
use tracing::{debug, warn};

const SYNC: u8 = 0;
const SET_SPEED: u8 = 255;

/// 帧消息中长度字节之外的固定部分：bus id_lo id_hi
const FRAME_OVERHEAD: usize = 3;

fn speed_of(code: u8) -> Option<BusSpeed> {
    match code {
        0 => Some(BusSpeed::K125),
        1 => Some(BusSpeed::K250),
        2 => Some(BusSpeed::K500),
        3 => Some(BusSpeed::K1000),
        4 => Some(BusSpeed::K83_3),
        _ => None,
    }
}

#[derive(Debug, Default)]
pub struct Cs11Codec {
    buf: BytesMut,
    syncing: bool,
}

impl Cs11Codec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(64),
            syncing: false,
        }
    }
}

impl FormatCodec for Cs11Codec {
    fn name(&self) -> &'static str {
        "cs11"
    }

    fn encode(&self, msg: &LogMessage) -> Bytes {
        let frame = match (&msg.payload, msg.kind) {
            (LogPayload::Frame(frame), LogType::Rx) if !frame.is_extended() => frame,
            _ => return Bytes::new(),
        };
        let mut out = Vec::with_capacity(1 + FRAME_OVERHEAD + MAX_DLC);
        out.push(frame.dlc + FRAME_OVERHEAD as u8);
        out.push(frame.origin.saturating_sub(1));
        out.extend_from_slice(&(frame.id as u16).to_le_bytes());
        out.extend_from_slice(frame.data_slice());
        Bytes::from(out)
    }

    fn decode(&mut self, input: &[u8], out: &mut Vec<DecodedRecord>) -> usize {
        self.buf.extend_from_slice(input);
        while let Some(&len) = self.buf.first() {
            match len {
                SYNC => {
                    debug!("CS11 sync");
                    self.syncing = true;
                    self.buf.advance(1);
                },
                SET_SPEED => {
                    if self.buf.len() < 3 {
                        break;
                    }
                    let (bus, code) = (self.buf[1], self.buf[2]);
                    self.buf.advance(3);
                    match speed_of(code) {
                        Some(speed) => out.push(DecodedRecord::StartBus {
                            bus: bus.saturating_add(1),
                            speed,
                        }),
                        None => warn!("CS11 unknown speed code {} for bus {}", code, bus),
                    }
                },
                _ => {
                    let len = usize::from(len);
                    if len < FRAME_OVERHEAD || len - FRAME_OVERHEAD > MAX_DLC {
                        warn!("CS11 invalid message length {}, skipping", len);
                        self.buf.advance(1);
                        continue;
                    }
                    if self.buf.len() < len + 1 {
                        break;
                    }
                    let msg = self.buf.split_to(len + 1);
                    let bus = msg[1];
                    let id = u32::from(u16::from_le_bytes([msg[2], msg[3]]));
                    if let Ok(frame) = CanFrame::try_new(id, &msg[4..], FrameFormat::Standard) {
                        out.push(DecodedRecord::Frame {
                            kind: LogType::Tx,
                            frame: frame.with_origin(bus.saturating_add(1)),
                        });
                    }
                    if self.syncing {
                        out.push(DecodedRecord::Reply(Bytes::copy_from_slice(&[1, bus])));
                    }
                },
            }
        }
        input.len()
    }
}
