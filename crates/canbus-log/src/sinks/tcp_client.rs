//! TCP 客户端出口

use super::resolve;
use super::stream::StreamWorker;
use crate::error::LogError;
use crate::logger::LogCore;
use parking_lot::Mutex;
use std::io;
use std::net::TcpStream;
use std::sync::Arc;
use tracing::info;

/// 主动连接到 `host:port`，连接建立后只有一个连接，不自动重连
pub(crate) struct TcpClientSink {
    target: String,
    worker: Mutex<Option<StreamWorker>>,
}

impl TcpClientSink {
    pub(crate) fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            worker: Mutex::new(None),
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let addr = resolve(&self.target)?;
        let timeout = core.config().read().tcp_connect_timeout();
        let stream = TcpStream::connect_timeout(&addr, timeout).map_err(|e| match e.kind() {
            io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => {
                LogError::ConnectTimeout(self.target.clone())
            },
            _ => LogError::Io(e),
        })?;
        stream.set_nodelay(true)?;
        stream.set_nonblocking(true)?;

        info!("CAN log connected to {}", addr);
        let stream = mio::net::TcpStream::from_std(stream);
        *worker = Some(StreamWorker::connected(core.clone(), stream, addr)?);
        Ok(())
    }

    pub(crate) fn close(&self, core: &LogCore) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
        core.close_connections();
    }
}
