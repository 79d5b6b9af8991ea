//! UDP 客户端出口

use super::{POLL_INTERVAL, READ_BUFFER, resolve};
use crate::connection::{Connection, FormattableSink};
use crate::error::LogError;
use crate::logger::LogCore;
use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info};

/// 已 connect 的 UDP socket，每次写一个数据报
struct DatagramSink {
    socket: Arc<UdpSocket>,
}

impl FormattableSink for DatagramSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send(data).map(|_| ())
    }
}

struct Reader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// 向 `host:port` 发送数据报；整个生命周期只有一个连接
pub(crate) struct UdpClientSink {
    target: String,
    reader: Mutex<Option<Reader>>,
}

impl UdpClientSink {
    pub(crate) fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            reader: Mutex::new(None),
        }
    }

    pub(crate) fn target(&self) -> &str {
        &self.target
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }

        let addr = resolve(&self.target)?;
        let local: SocketAddr = if addr.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let socket = UdpSocket::bind(local)?;
        socket.connect(addr)?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let socket = Arc::new(socket);

        let connection = core.add_connection(
            addr.to_string(),
            Box::new(DatagramSink {
                socket: socket.clone(),
            }),
        )?;
        info!("CAN log sending datagrams to {}", addr);

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread_core = core.clone();
        let handle = thread::Builder::new()
            .name("can-log-udp".into())
            .spawn(move || read_loop(&thread_core, &socket, &connection, &flag))?;
        *reader = Some(Reader { running, handle });
        Ok(())
    }

    pub(crate) fn close(&self, core: &LogCore) {
        if let Some(reader) = self.reader.lock().take() {
            reader.running.store(false, Ordering::Release);
            if reader.handle.join().is_err() {
                error!("UDP log thread panicked");
            }
        }
        core.close_connections();
    }
}

fn read_loop(core: &LogCore, socket: &UdpSocket, connection: &Connection, running: &AtomicBool) {
    let mut buf = vec![0u8; READ_BUFFER];
    while running.load(Ordering::Acquire) {
        match socket.recv(&mut buf) {
            Ok(n) => {
                connection.receive(&buf[..n], core.target());
            },
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionRefused
                ) => {},
            Err(e) => {
                debug!("UDP log receive failed: {}", e);
                break;
            },
        }
    }
}
