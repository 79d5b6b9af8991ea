//! Lawicel（SLCAN）格式
//!
//! 每帧一行：`t<id:3><len><data><ms:4>`，扩展帧用 `T` 和 8 位 ID，远程帧用 `r` / `R` 且不带数据。
//! 结尾的 4 位十六进制是秒内毫秒数。只处理 RX / TX 帧，解码出的帧归属 can1。

use super::{DecodedRecord, FormatCodec};
use bytes::Bytes;
use canbus_protocol::{CanFrame, FrameFormat, LogMessage, LogPayload, LogType, MAX_DLC};
use std::fmt::Write as _;
use std::time::UNIX_EPOCH;

const MAX_LINE: usize = 32;

#[derive(Debug, Default)]
pub struct LawricelCodec {
    line: Vec<u8>,
}

impl LawricelCodec {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(MAX_LINE),
        }
    }
}

fn hex(s: &str) -> Option<u32> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return None;
    }
    u32::from_str_radix(s, 16).ok()
}

fn parse_line(line: &str) -> Option<CanFrame> {
    let kind = line.chars().next()?;
    let (format, rtr) = match kind {
        't' => (FrameFormat::Standard, false),
        'T' => (FrameFormat::Extended, false),
        'r' => (FrameFormat::Standard, true),
        'R' => (FrameFormat::Extended, true),
        _ => return None,
    };
    let rest = line.get(1..)?;
    let id_len = if format == FrameFormat::Extended { 8 } else { 3 };
    let id = hex(rest.get(..id_len)?)?;
    let dlc = hex(rest.get(id_len..id_len + 1)?)? as usize;
    if dlc > MAX_DLC {
        return None;
    }

    let body = &rest[id_len + 1..];
    let data_len = if rtr { 0 } else { dlc * 2 };
    let data_hex = body.get(..data_len).filter(|s| s.is_ascii())?;
    // 结尾可以带 4 位时间戳
    let tail = &body[data_len..];
    if !tail.is_empty() && (tail.len() != 4 || hex(tail).is_none()) {
        return None;
    }

    let mut data = [0u8; MAX_DLC];
    for (i, byte) in data.iter_mut().take(data_len / 2).enumerate() {
        *byte = hex(&data_hex[i * 2..i * 2 + 2])? as u8;
    }

    let mut frame = CanFrame::try_new(id, &data[..data_len / 2], format)
        .ok()?
        .with_rtr(rtr)
        .with_origin(1);
    if rtr {
        frame.dlc = dlc as u8;
    }
    Some(frame)
}

impl FormatCodec for LawricelCodec {
    fn name(&self) -> &'static str {
        "lawricel"
    }

    fn encode(&self, msg: &LogMessage) -> Bytes {
        let frame = match (&msg.payload, msg.kind) {
            (LogPayload::Frame(frame), LogType::Rx | LogType::Tx) => frame,
            _ => return Bytes::new(),
        };
        let tag = match (frame.is_extended(), frame.rtr) {
            (false, false) => 't',
            (true, false) => 'T',
            (false, true) => 'r',
            (true, true) => 'R',
        };
        let mut out = String::with_capacity(MAX_LINE);
        out.push(tag);
        if frame.is_extended() {
            let _ = write!(out, "{:08x}", frame.id);
        } else {
            let _ = write!(out, "{:03x}", frame.id);
        }
        let _ = write!(out, "{}", frame.dlc);
        if !frame.rtr {
            for byte in frame.data_slice() {
                let _ = write!(out, "{:02x}", byte);
            }
        }
        let millis = msg
            .timestamp
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_millis();
        let _ = writeln!(out, "{:04x}", millis);
        Bytes::from(out)
    }

    fn decode(&mut self, input: &[u8], out: &mut Vec<DecodedRecord>) -> usize {
        for &byte in input {
            if byte == b'\r' || byte == b'\n' {
                if !self.line.is_empty() {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    if let Some(frame) = parse_line(&line) {
                        out.push(DecodedRecord::Frame {
                            kind: LogType::Rx,
                            frame,
                        });
                    }
                }
                continue;
            }
            if self.line.len() < MAX_LINE {
                self.line.push(byte);
            }
        }
        input.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canbus_protocol::{EXT_ID_MASK, STD_ID_MASK};
    use proptest::prelude::*;
    use std::time::{Duration, SystemTime};

    fn at_millis(ms: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_millis(ms)
    }

    fn decode_all(input: &[u8]) -> Vec<DecodedRecord> {
        let mut out = Vec::new();
        LawricelCodec::new().decode(input, &mut out);
        out
    }

    #[test]
    fn test_encode() {
        let codec = LawricelCodec::new();
        let frame = CanFrame::new_standard(0x7E8, &[0x03, 0x41, 0x0D]).with_origin(1);
        let msg = LogMessage::frame(LogType::Rx, frame).at(at_millis(1_700_000_000_123));
        assert_eq!(&codec.encode(&msg)[..], b"t7e8303410d007b\n");

        let frame = CanFrame::new_extended(0x18DAF110, &[]).with_rtr(true).with_origin(2);
        let msg = LogMessage::frame(LogType::Tx, frame).at(at_millis(5));
        assert_eq!(&codec.encode(&msg)[..], b"R18daf11000005\n");

        let failed = LogMessage::frame(LogType::TxFail, frame);
        assert!(codec.encode(&failed).is_empty());
    }

    #[test]
    fn test_decode_rejects_bad_lines() {
        let out = decode_all(b"t7e8301\nt7e8903\nx7e800000\nt7g80\nt7e80001\nT123\n");
        assert!(out.is_empty());
    }

    #[test]
    fn test_decode_without_timestamp() {
        let out = decode_all(b"t1002beef\r");
        let frame = CanFrame::new_standard(0x100, &[0xBE, 0xEF]).with_origin(1);
        assert_eq!(
            out,
            vec![DecodedRecord::Frame {
                kind: LogType::Rx,
                frame
            }]
        );
    }

    proptest! {
        /// 帧内容（ID、格式、远程标志、数据）经过编码解码不变，总线固定为 can1
        #[test]
        fn prop_frame_roundtrip(
            id in 0u32..=EXT_ID_MASK,
            extended in any::<bool>(),
            rtr in any::<bool>(),
            data in proptest::collection::vec(any::<u8>(), 0..=8),
            ms in any::<u32>(),
        ) {
            let frame = if extended {
                CanFrame::new_extended(id, &data)
            } else {
                CanFrame::new_standard(id & STD_ID_MASK, &data)
            };
            let frame = if rtr {
                // 远程帧只保留长度
                let mut remote = frame.with_rtr(true);
                remote.data = [0; MAX_DLC];
                remote
            } else {
                frame
            }
            .with_origin(1);
            let msg = LogMessage::frame(LogType::Rx, frame).at(at_millis(u64::from(ms)));
            let encoded = LawricelCodec::new().encode(&msg);
            prop_assert_eq!(decode_all(&encoded), vec![DecodedRecord::Frame { kind: LogType::Rx, frame }]);
        }
    }
}
