//! CRTD 文本格式
//!
//! 每条记录一行：
//!
//! ```text
//! 1700000000.123456 1R11 100 01 02 03
//! 1700000000.123457 1T29 18DAF110 02 10 03
//! 1700000000.123458 1CER TX_Fail T11 7DF 02 01 0d
//! 1700000000.123459 1CST Status intr=12 rxpkt=10 txpkt=2 errflags=0 rxerr=0 txerr=0 rxovr=0 txovr=0 txdelay=0 wdgreset=0
//! 1700000000.123460 CEV Event vehicle.on
//! ```
//!
//! 解码只恢复帧记录（R/T，连同记录时间）和控制命令
//! （`CXX PAUSE|RESUME|CLEARFILTERS|FILTER ...`），状态和文本条目被忽略。
//!
//! 帧记录不携带远程帧标志：RTR 帧按同 ID、同数据的数据帧写出，解码得到 `rtr == false`。
//! 需要保留 RTR 时用 `pcap`。

use super::{ControlCommand, DecodedRecord, FormatCodec};
use bytes::Bytes;
use canbus_protocol::{
    BusStatus, CanFrame, FrameFormat, LogMessage, LogPayload, LogType, MAX_DLC,
};
use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// 单行最大长度，超出部分截断
const MAX_LINE: usize = 200;

/// CRTD 编解码器
#[derive(Debug, Default)]
pub struct CrtdCodec {
    line: Vec<u8>,
}

impl CrtdCodec {
    pub fn new() -> Self {
        Self {
            line: Vec::with_capacity(MAX_LINE),
        }
    }
}

fn timestamp(time: SystemTime) -> String {
    let since = time.duration_since(UNIX_EPOCH).unwrap_or_default();
    format!("{}.{:06}", since.as_secs(), since.subsec_micros())
}

fn bus_label(bus: u8) -> String {
    if bus == 0 { String::new() } else { bus.to_string() }
}

fn push_frame(out: &mut String, direction: char, frame: &CanFrame) {
    let _ = match frame.format {
        FrameFormat::Standard => write!(out, "{}11 {:03X}", direction, frame.id),
        FrameFormat::Extended => write!(out, "{}29 {:08X}", direction, frame.id),
    };
    for byte in frame.data_slice() {
        let _ = write!(out, " {:02x}", byte);
    }
}

fn push_status(out: &mut String, status: &BusStatus) {
    let flags = if status.error_flags == 0 {
        "0".to_string()
    } else {
        format!("{:#x}", status.error_flags)
    };
    let _ = write!(
        out,
        "intr={} rxpkt={} txpkt={} errflags={} rxerr={} txerr={} rxovr={} txovr={} txdelay={} wdgreset={}",
        status.interrupts,
        status.packets_rx,
        status.packets_tx,
        flags,
        status.errors_rx,
        status.errors_tx,
        status.rxbuf_overflow,
        status.txbuf_overflow,
        status.txbuf_delay,
        status.watchdog_resets,
    );
}

/// `<sec>.<frac>`，小数部分按微秒截断
fn parse_timestamp(ts: &str) -> Option<Duration> {
    let (secs, frac) = ts.split_once('.').unwrap_or((ts, ""));
    let secs: u64 = secs.parse().ok()?;
    let digits: String = frac.chars().take(6).collect();
    let micros = if digits.is_empty() {
        0
    } else {
        digits.parse::<u64>().ok()? * 10u64.pow(6 - digits.len() as u32)
    };
    Some(Duration::from_secs(secs) + Duration::from_micros(micros))
}

fn parse_line(line: &str, out: &mut Vec<DecodedRecord>) {
    let mut parts = line.split_whitespace();
    let Some(ts) = parts.next() else {
        return;
    };
    if !ts.starts_with(|c: char| c.is_ascii_digit()) {
        return;
    }
    let Some(tag) = parts.next() else {
        return;
    };

    if tag == "CXX" {
        match parts.next() {
            Some("PAUSE") => out.push(DecodedRecord::Control(ControlCommand::Pause)),
            Some("RESUME") => out.push(DecodedRecord::Control(ControlCommand::Resume)),
            Some("CLEARFILTERS") => {
                out.push(DecodedRecord::Control(ControlCommand::ClearFilters))
            },
            Some("FILTER") => out.extend(
                parts.map(|spec| DecodedRecord::Control(ControlCommand::AddFilter(spec.to_string()))),
            ),
            _ => {},
        }
        return;
    }

    let (bus, kind) = match tag.as_bytes().first() {
        Some(c) if c.is_ascii_digit() => (c - b'0', &tag[1..]),
        _ => (1, tag),
    };
    let (kind, format) = match kind {
        "R11" => (LogType::Rx, FrameFormat::Standard),
        "R29" => (LogType::Rx, FrameFormat::Extended),
        "T11" => (LogType::Tx, FrameFormat::Standard),
        "T29" => (LogType::Tx, FrameFormat::Extended),
        _ => return,
    };
    let Some(id) = parts.next().and_then(|p| u32::from_str_radix(p, 16).ok()) else {
        return;
    };
    let data: Vec<u8> = parts
        .take(MAX_DLC)
        .map_while(|p| u8::from_str_radix(p, 16).ok())
        .collect();
    if let Ok(frame) = CanFrame::try_new(id, &data, format) {
        if let Some(time) = parse_timestamp(ts) {
            out.push(DecodedRecord::Timestamp(time));
        }
        out.push(DecodedRecord::Frame {
            kind,
            frame: frame.with_origin(bus),
        });
    }
}

impl FormatCodec for CrtdCodec {
    fn name(&self) -> &'static str {
        "crtd"
    }

    fn encode(&self, msg: &LogMessage) -> Bytes {
        let mut out = String::with_capacity(64);
        let _ = write!(out, "{} {}", timestamp(msg.timestamp), bus_label(msg.bus));

        match (&msg.payload, msg.kind) {
            (LogPayload::Frame(frame), LogType::Rx) => push_frame(&mut out, 'R', frame),
            (LogPayload::Frame(frame), LogType::Tx) => push_frame(&mut out, 'T', frame),
            (LogPayload::Frame(frame), kind @ (LogType::TxQueue | LogType::TxFail)) => {
                let _ = write!(out, "CER {} ", kind.name());
                push_frame(&mut out, 'T', frame);
            },
            (LogPayload::Status(status), kind @ (LogType::Error | LogType::Statistics)) => {
                let tag = if kind == LogType::Error { "CER" } else { "CST" };
                let _ = write!(out, "{} {} ", tag, kind.name());
                push_status(&mut out, status);
            },
            (LogPayload::Text(text), kind) if kind.is_info() => {
                let tag = if kind == LogType::Event { "CEV" } else { "CXX" };
                let _ = write!(out, "{} {} {}", tag, kind.name(), text);
            },
            _ => return Bytes::new(),
        }

        out.push('\n');
        Bytes::from(out)
    }

    fn header(&self, time: SystemTime) -> Bytes {
        Bytes::from(format!("{} CXX OVMS CRTD\n", timestamp(time)))
    }

    fn decode(&mut self, input: &[u8], out: &mut Vec<DecodedRecord>) -> usize {
        for &byte in input {
            if byte == b'\r' || byte == b'\n' {
                if !self.line.is_empty() {
                    let line = String::from_utf8_lossy(&self.line).into_owned();
                    self.line.clear();
                    parse_line(&line, out);
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
    use canbus_protocol::EXT_ID_MASK;
    use proptest::prelude::*;

    fn at(secs: u64, micros: u64) -> SystemTime {
        UNIX_EPOCH + Duration::from_secs(secs) + Duration::from_micros(micros)
    }

    fn encode(msg: LogMessage) -> String {
        let bytes = CrtdCodec::new().encode(&msg);
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    /// 去掉时间记录，只留帧和控制命令
    fn without_time(records: Vec<DecodedRecord>) -> Vec<DecodedRecord> {
        records
            .into_iter()
            .filter(|r| !matches!(r, DecodedRecord::Timestamp(_)))
            .collect()
    }

    #[test]
    fn test_encode_rx_standard() {
        let frame = CanFrame::new_standard(0x100, &[0x01, 0xAB, 0x03]).with_origin(1);
        let msg = LogMessage::frame(LogType::Rx, frame).at(at(1_524_311_386, 811_100));
        assert_eq!(encode(msg), "1524311386.811100 1R11 100 01 ab 03\n");
    }

    #[test]
    fn test_encode_tx_extended() {
        let frame = CanFrame::new_extended(0x18DAF110, &[0x02]).with_origin(2);
        let msg = LogMessage::frame(LogType::Tx, frame).at(at(10, 5));
        assert_eq!(encode(msg), "10.000005 2T29 18DAF110 02\n");
    }

    #[test]
    fn test_encode_queue_and_fail() {
        let frame = CanFrame::new_standard(0x7DF, &[0x02, 0x01, 0x0D]).with_origin(1);
        let queued = LogMessage::frame(LogType::TxQueue, frame).at(at(1, 0));
        let failed = LogMessage::frame(LogType::TxFail, frame).at(at(1, 0));
        assert_eq!(encode(queued), "1.000000 1CER TX_Queue T11 7DF 02 01 0d\n");
        assert_eq!(encode(failed), "1.000000 1CER TX_Fail T11 7DF 02 01 0d\n");
    }

    #[test]
    fn test_encode_status() {
        let status = BusStatus {
            interrupts: 12,
            packets_rx: 10,
            packets_tx: 2,
            ..Default::default()
        };
        let msg = LogMessage::status(LogType::Statistics, 1, status).at(at(1, 0));
        assert_eq!(
            encode(msg),
            "1.000000 1CST Status intr=12 rxpkt=10 txpkt=2 errflags=0 rxerr=0 txerr=0 rxovr=0 txovr=0 txdelay=0 wdgreset=0\n"
        );

        let status = BusStatus {
            error_flags: 0x0008_0200,
            rxbuf_overflow: 3,
            ..Default::default()
        };
        let line = encode(LogMessage::status(LogType::Error, 1, status).at(at(1, 0)));
        assert!(line.starts_with("1.000000 1CER Error "));
        assert!(line.contains("errflags=0x80200"));
        assert!(line.contains("rxovr=3"));
    }

    #[test]
    fn test_encode_info() {
        let event = LogMessage::info(LogType::Event, 0, "vehicle.on").at(at(2, 0));
        let comment = LogMessage::info(LogType::Comment, 3, "hello").at(at(2, 0));
        let metric = LogMessage::info(LogType::Metric, 0, "v.b.soc=81").at(at(2, 0));
        assert_eq!(encode(event), "2.000000 CEV Event vehicle.on\n");
        assert_eq!(encode(comment), "2.000000 3CXX Comment hello\n");
        assert_eq!(encode(metric), "2.000000 CXX Metric v.b.soc=81\n");
    }

    #[test]
    fn test_header() {
        let header = CrtdCodec::new().header(at(1_700_000_000, 42));
        assert_eq!(&header[..], b"1700000000.000042 CXX OVMS CRTD\n");
    }

    #[test]
    fn test_decode_frames_across_calls() {
        let mut codec = CrtdCodec::new();
        let mut out = Vec::new();

        assert_eq!(codec.decode(b"1524311386.811100 1R11 10", &mut out), 25);
        assert!(out.is_empty());
        codec.decode(b"0 01 02 03\r\n\n2.0 3T29 18DAF110\n", &mut out);

        assert_eq!(out.len(), 4);
        assert_eq!(
            out[0],
            DecodedRecord::Timestamp(Duration::new(1_524_311_386, 811_100_000))
        );
        assert_eq!(out[2], DecodedRecord::Timestamp(Duration::from_secs(2)));
        let out = without_time(out);
        assert_eq!(
            out[0],
            DecodedRecord::Frame {
                kind: LogType::Rx,
                frame: CanFrame::new_standard(0x100, &[1, 2, 3]).with_origin(1),
            }
        );
        assert_eq!(
            out[1],
            DecodedRecord::Frame {
                kind: LogType::Tx,
                frame: CanFrame::new_extended(0x18DAF110, &[]).with_origin(3),
            }
        );
    }

    #[test]
    fn test_decode_default_bus() {
        let mut codec = CrtdCodec::new();
        let mut out = Vec::new();
        codec.decode(b"1.0 R11 7E8 04\n", &mut out);
        assert!(matches!(&out[1], DecodedRecord::Frame { frame, .. } if frame.origin == 1));
    }

    #[test]
    fn test_decode_controls() {
        let mut codec = CrtdCodec::new();
        let mut out = Vec::new();
        codec.decode(
            b"1.0 CXX PAUSE\n1.0 CXX FILTER 1:100-200 7DF\n1.0 CXX CLEARFILTERS\n1.0 CXX RESUME\n",
            &mut out,
        );
        assert_eq!(
            out,
            vec![
                DecodedRecord::Control(ControlCommand::Pause),
                DecodedRecord::Control(ControlCommand::AddFilter("1:100-200".to_string())),
                DecodedRecord::Control(ControlCommand::AddFilter("7DF".to_string())),
                DecodedRecord::Control(ControlCommand::ClearFilters),
                DecodedRecord::Control(ControlCommand::Resume),
            ]
        );
    }

    #[test]
    fn test_decode_ignores_other_records() {
        let mut codec = CrtdCodec::new();
        let mut out = Vec::new();
        codec.decode(
            b"hello\n1.0 CXX OVMS CRTD\n1.0 1CST Status intr=1\n1.0 1X11 100\n1.0 1R11 zz\n",
            &mut out,
        );
        assert!(out.is_empty());
    }

    proptest! {
        /// 帧记录编码后能无损解码
        #[test]
        fn prop_frame_roundtrip(
            id in 0u32..0x800,
            data in proptest::collection::vec(any::<u8>(), 0..=8),
            bus in 1u8..10,
            tx in any::<bool>(),
        ) {
            let kind = if tx { LogType::Tx } else { LogType::Rx };
            let frame = CanFrame::new_standard(id, &data).with_origin(bus);
            let mut codec = CrtdCodec::new();
            let encoded = codec.encode(&LogMessage::frame(kind, frame));

            let mut out = Vec::new();
            codec.decode(&encoded, &mut out);
            prop_assert_eq!(without_time(out), vec![DecodedRecord::Frame { kind, frame }]);
        }

        /// 29 位扩展 ID 和时间戳
        #[test]
        fn prop_extended_roundtrip(
            id in 0u32..=EXT_ID_MASK,
            data in proptest::collection::vec(any::<u8>(), 0..=8),
            bus in 1u8..10,
            secs in 0u64..4_000_000_000,
            micros in 0u64..1_000_000,
        ) {
            let frame = CanFrame::new_extended(id, &data).with_origin(bus);
            let time = at(secs, micros);
            let mut codec = CrtdCodec::new();
            let encoded = codec.encode(&LogMessage::frame(LogType::Rx, frame).at(time));

            let mut out = Vec::new();
            codec.decode(&encoded, &mut out);
            prop_assert_eq!(
                out,
                vec![
                    DecodedRecord::Timestamp(time.duration_since(UNIX_EPOCH).unwrap()),
                    DecodedRecord::Frame { kind: LogType::Rx, frame },
                ]
            );
        }

        /// RTR 标志不进入 CRTD，其余字段保留
        #[test]
        fn prop_rtr_flag_dropped(
            id in 0u32..0x800,
            extended in any::<bool>(),
            data in proptest::collection::vec(any::<u8>(), 0..=8),
        ) {
            let frame = if extended {
                CanFrame::new_extended(id, &data)
            } else {
                CanFrame::new_standard(id, &data)
            }
            .with_origin(1);
            let mut codec = CrtdCodec::new();
            let plain = codec.encode(&LogMessage::frame(LogType::Rx, frame));
            let remote = codec.encode(&LogMessage::frame(LogType::Rx, frame.with_rtr(true)));
            prop_assert_eq!(&plain, &remote);

            let mut out = Vec::new();
            codec.decode(&remote, &mut out);
            prop_assert_eq!(
                without_time(out),
                vec![DecodedRecord::Frame { kind: LogType::Rx, frame }]
            );
        }
    }

    #[test]
    fn test_parse_timestamp() {
        assert_eq!(parse_timestamp("12"), Some(Duration::from_secs(12)));
        assert_eq!(parse_timestamp("1.5"), Some(Duration::from_millis(1500)));
        assert_eq!(
            parse_timestamp("3.1234567"),
            Some(Duration::new(3, 123_456_000))
        );
        assert_eq!(parse_timestamp("x.1"), None);
    }
}
