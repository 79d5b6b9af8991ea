//! 文件出口

use crate::connection::{Connection, FormattableSink};
use crate::error::LogError;
use crate::logger::LogCore;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::sync::Arc;
use tracing::info;

/// 带缓冲的日志文件
struct FileSink {
    writer: BufWriter<File>,
}

impl FormattableSink for FileSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.writer.write_all(data)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 文件传输：打开时建立唯一的连接
pub(crate) struct VfsSink {
    path: String,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl VfsSink {
    pub(crate) fn new(path: &str) -> Self {
        Self {
            path: path.to_string(),
            connection: Mutex::new(None),
        }
    }

    pub(crate) fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        {
            let config = core.config().read();
            if config.is_protected(&self.path) {
                return Err(LogError::ProtectedPath(self.path.clone()));
            }
            if config.is_removable(&self.path) && !core.events().removable_mounted() {
                return Err(LogError::MediumUnavailable(self.path.clone()));
            }
        }

        let mut slot = self.connection.lock();
        if slot.is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let sink = FileSink {
            writer: BufWriter::new(file),
        };
        let connection = core.add_connection(self.path.clone(), Box::new(sink))?;
        info!("CAN log file opened: {}", self.path);
        *slot = Some(connection);
        Ok(())
    }

    pub(crate) fn close(&self, core: &LogCore) {
        if let Some(connection) = self.connection.lock().take() {
            core.remove_connection(&connection);
            connection.close();
            info!("CAN log file closed: {} ({})", self.path, connection.stats());
        }
    }
}
