//! TCP 服务端出口

use super::stream::StreamWorker;
use crate::error::LogError;
use crate::logger::LogCore;
use parking_lot::Mutex;
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use tracing::info;

/// 监听端口，每个入站连接一个 Connection
pub(crate) struct TcpServerSink {
    addr: Mutex<SocketAddr>,
    worker: Mutex<Option<StreamWorker>>,
}

impl TcpServerSink {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self {
            addr: Mutex::new(addr),
            worker: Mutex::new(None),
        }
    }

    /// 监听地址；打开后为实际绑定的地址
    pub(crate) fn local_addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }

        let listener = TcpListener::bind(self.local_addr())?;
        listener.set_nonblocking(true)?;
        let bound = listener.local_addr()?;
        *self.addr.lock() = bound;

        info!("CAN log TCP server listening on {}", bound);
        let listener = mio::net::TcpListener::from_std(listener);
        *worker = Some(StreamWorker::listen(core.clone(), listener)?);
        Ok(())
    }

    pub(crate) fn close(&self, core: &LogCore) {
        if let Some(worker) = self.worker.lock().take() {
            worker.stop();
        }
        core.close_connections();
    }
}
