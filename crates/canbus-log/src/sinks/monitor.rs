//! 监视出口：编码后的条目写进本进程的 tracing 日志
//!
//! 帧在 trace 级别，错误状态在 error 级别，其它条目在 debug 级别。

use crate::connection::{Connection, FormattableSink};
use crate::error::LogError;
use crate::logger::LogCore;
use canbus_protocol::{LogMessage, LogType};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use tracing::{Level, debug, error, info, trace};

/// 监视连接的对端名
pub(crate) const MONITOR_PEER: &str = "MONITOR";

/// 条目类型对应的日志级别
pub(crate) fn level_of(kind: LogType) -> Level {
    match kind {
        k if k.is_frame() => Level::TRACE,
        LogType::Error => Level::ERROR,
        _ => Level::DEBUG,
    }
}

struct TraceSink;

impl FormattableSink for TraceSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        debug!(target: "canlog", "{}", String::from_utf8_lossy(data).trim_end());
        Ok(())
    }

    fn write_msg(&mut self, msg: &LogMessage, data: &[u8]) -> io::Result<()> {
        let text = String::from_utf8_lossy(data);
        let text = text.trim_end();
        let level = level_of(msg.kind);
        if level == Level::TRACE {
            trace!(target: "canlog", "{}", text);
        } else if level == Level::ERROR {
            error!(target: "canlog", "{}", text);
        } else {
            debug!(target: "canlog", "{}", text);
        }
        Ok(())
    }
}

/// 监视传输：打开时建立唯一的连接
pub(crate) struct MonitorSink {
    connection: Mutex<Option<Arc<Connection>>>,
}

impl MonitorSink {
    pub(crate) fn new() -> Self {
        Self {
            connection: Mutex::new(None),
        }
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        let mut slot = self.connection.lock();
        if slot.is_none() {
            *slot = Some(core.add_connection(MONITOR_PEER.to_string(), Box::new(TraceSink))?);
        }
        Ok(())
    }

    pub(crate) fn close(&self, core: &LogCore) {
        if let Some(connection) = self.connection.lock().take() {
            core.remove_connection(&connection);
            connection.close();
            info!("CAN monitor closed ({})", connection.stats());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_level_by_kind() {
        assert_eq!(level_of(LogType::Rx), Level::TRACE);
        assert_eq!(level_of(LogType::TxFail), Level::TRACE);
        assert_eq!(level_of(LogType::Error), Level::ERROR);
        assert_eq!(level_of(LogType::Statistics), Level::DEBUG);
        assert_eq!(level_of(LogType::Comment), Level::DEBUG);
    }
}
