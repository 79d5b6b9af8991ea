//! libpcap 格式，链路类型 `LINKTYPE_CAN_SOCKETCAN`
//!
//! 文件头之后每条记录是 16 字节记录头加 16 字节 SocketCAN 帧：
//! `can_id(u32 BE，含 EFF/RTR/ERR 标志) len pad[3] data[8]`。
//! 可以直接用 Wireshark 打开，远程帧标志和扩展 ID 都完整保留。

use super::{DecodedRecord, FormatCodec};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use canbus_protocol::{CanFrame, EXT_ID_MASK, FrameFormat, LogMessage, LogPayload, LogType, MAX_DLC};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// 微秒精度，大端
pub const MAGIC: u32 = 0xA1B2_C3D4;

/// 纳秒精度
const MAGIC_NANOS: u32 = 0xA1B2_3C4D;

pub const LINKTYPE_CAN_SOCKETCAN: u32 = 0xE3;

const HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;
const CAN_FRAME_LEN: usize = 16;

/// CAN FD 帧 72 字节，更长的记录说明文件损坏
const MAX_RECORD: usize = 72;

const CAN_EFF_FLAG: u32 = 0x8000_0000;
const CAN_RTR_FLAG: u32 = 0x4000_0000;
const CAN_ERR_FLAG: u32 = 0x2000_0000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// 等待文件头
    Header,
    Records,
    /// 无法识别的文件，丢弃全部输入
    Discard,
}

#[derive(Debug)]
pub struct PcapCodec {
    buf: BytesMut,
    state: State,
}

impl Default for PcapCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl PcapCodec {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(256),
            state: State::Header,
        }
    }

    fn parse_header(&mut self) {
        let mut header = self.buf.split_to(HEADER_LEN);
        let magic = header.get_u32();
        if magic != MAGIC {
            let order = if magic == MAGIC_NANOS || magic.swap_bytes() == MAGIC_NANOS {
                "nanosecond"
            } else if magic.swap_bytes() == MAGIC {
                "little-endian"
            } else {
                "unknown"
            };
            warn!("pcap: {} capture ({:#010x}) not supported, discarding input", order, magic);
            self.state = State::Discard;
            return;
        }
        // version, thiszone, sigfigs, snaplen
        header.advance(16);
        let network = header.get_u32();
        if network != LINKTYPE_CAN_SOCKETCAN {
            warn!("pcap: link type {} is not SocketCAN, discarding input", network);
            self.state = State::Discard;
            return;
        }
        self.state = State::Records;
    }

    fn parse_record(record: &mut BytesMut, out: &mut Vec<DecodedRecord>) {
        let secs = record.get_u32();
        let micros = record.get_u32();
        let incl = record.get_u32() as usize;
        record.advance(4);
        if incl < 8 {
            return;
        }

        let raw = record.get_u32();
        if raw & CAN_ERR_FLAG != 0 {
            return;
        }
        let len = usize::from(record.get_u8()).min(MAX_DLC);
        record.advance(3);
        let data = &record[..len.min(record.len())];

        let rtr = raw & CAN_RTR_FLAG != 0;
        let format = if raw & CAN_EFF_FLAG != 0 {
            FrameFormat::Extended
        } else {
            FrameFormat::Standard
        };
        let Ok(mut frame) = CanFrame::try_new(raw & EXT_ID_MASK, if rtr { &[] } else { data }, format) else {
            return;
        };
        if rtr {
            frame.dlc = len as u8;
        }
        out.push(DecodedRecord::Timestamp(
            Duration::from_secs(u64::from(secs)) + Duration::from_micros(u64::from(micros)),
        ));
        out.push(DecodedRecord::Frame {
            kind: LogType::Rx,
            frame: frame.with_rtr(rtr).with_origin(1),
        });
    }
}

impl FormatCodec for PcapCodec {
    fn name(&self) -> &'static str {
        "pcap"
    }

    fn encode(&self, msg: &LogMessage) -> Bytes {
        let frame = match (&msg.payload, msg.kind) {
            (LogPayload::Frame(frame), LogType::Rx | LogType::Tx) => frame,
            _ => return Bytes::new(),
        };
        let since = msg.timestamp.duration_since(UNIX_EPOCH).unwrap_or_default();
        let mut out = BytesMut::with_capacity(RECORD_HEADER_LEN + CAN_FRAME_LEN);
        out.put_u32(since.as_secs() as u32);
        out.put_u32(since.subsec_micros());
        out.put_u32(CAN_FRAME_LEN as u32);
        out.put_u32(CAN_FRAME_LEN as u32);

        let mut raw = frame.id;
        if frame.is_extended() {
            raw |= CAN_EFF_FLAG;
        }
        if frame.rtr {
            raw |= CAN_RTR_FLAG;
        }
        out.put_u32(raw);
        out.put_u8(frame.dlc);
        out.put_bytes(0, 3);
        if frame.rtr {
            out.put_bytes(0, MAX_DLC);
        } else {
            out.put_slice(&frame.data);
        }
        out.freeze()
    }

    fn header(&self, _timestamp: SystemTime) -> Bytes {
        let mut out = BytesMut::with_capacity(HEADER_LEN);
        out.put_u32(MAGIC);
        out.put_u16(2);
        out.put_u16(4);
        out.put_i32(0);
        out.put_u32(0);
        out.put_u32(CAN_FRAME_LEN as u32);
        out.put_u32(LINKTYPE_CAN_SOCKETCAN);
        out.freeze()
    }

    fn decode(&mut self, input: &[u8], out: &mut Vec<DecodedRecord>) -> usize {
        if self.state == State::Discard {
            return input.len();
        }
        self.buf.extend_from_slice(input);
        loop {
            match self.state {
                State::Header if self.buf.len() >= HEADER_LEN => self.parse_header(),
                State::Records if self.buf.len() >= RECORD_HEADER_LEN => {
                    let incl = u32::from_be_bytes([self.buf[8], self.buf[9], self.buf[10], self.buf[11]]);
                    if incl as usize > MAX_RECORD {
                        warn!("pcap: record of {} bytes, discarding input", incl);
                        self.state = State::Discard;
                        continue;
                    }
                    let total = RECORD_HEADER_LEN + incl as usize;
                    if self.buf.len() < total {
                        break;
                    }
                    let mut record = self.buf.split_to(total);
                    Self::parse_record(&mut record, out);
                },
                State::Discard => {
                    self.buf.clear();
                    break;
                },
                _ => break,
            }
        }
        input.len()
    }
}
