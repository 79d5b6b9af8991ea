//! UDP 服务端出口
//!
//! UDP 没有连接，按源地址（IP + 端口）区分对端：新地址的第一个数据报建立连接
//! 并回送格式头，空闲超时的连接在 tick 时删除。

use super::{POLL_INTERVAL, READ_BUFFER};
use crate::connection::{Connection, FormattableSink};
use crate::error::LogError;
use crate::logger::LogCore;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;
use tracing::{debug, error, info};

type PeerMap = Arc<Mutex<HashMap<SocketAddr, Arc<Connection>>>>;

/// 向一个对端地址发送
struct PeerSink {
    socket: Arc<UdpSocket>,
    peer: SocketAddr,
}

impl FormattableSink for PeerSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.socket.send_to(data, self.peer).map(|_| ())
    }
}

struct Reader {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

pub(crate) struct UdpServerSink {
    addr: Mutex<SocketAddr>,
    peers: PeerMap,
    reader: Mutex<Option<Reader>>,
}

impl UdpServerSink {
    pub(crate) fn new(addr: SocketAddr) -> Self {
        Self {
            addr: Mutex::new(addr),
            peers: Arc::new(Mutex::new(HashMap::new())),
            reader: Mutex::new(None),
        }
    }

    pub(crate) fn local_addr(&self) -> SocketAddr {
        *self.addr.lock()
    }

    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<(), LogError> {
        let mut reader = self.reader.lock();
        if reader.is_some() {
            return Ok(());
        }

        let socket = UdpSocket::bind(self.local_addr())?;
        socket.set_read_timeout(Some(POLL_INTERVAL))?;
        let bound = socket.local_addr()?;
        *self.addr.lock() = bound;
        info!("CAN log UDP server listening on {}", bound);

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let thread_core = core.clone();
        let peers = self.peers.clone();
        let socket = Arc::new(socket);
        let handle = thread::Builder::new()
            .name("can-log-udpd".into())
            .spawn(move || read_loop(&thread_core, &socket, &peers, &flag))?;
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
        self.peers.lock().clear();
        core.close_connections();
    }

    /// 删除空闲超时的对端
    pub(crate) fn expire_idle(&self, core: &LogCore, now: Instant) {
        let timeout = core.config().read().udp_idle_timeout();
        let expired: Vec<Arc<Connection>> = {
            let mut peers = self.peers.lock();
            let stale: Vec<SocketAddr> = peers
                .iter()
                .filter(|(_, c)| c.idle_for(now) > timeout)
                .map(|(addr, _)| *addr)
                .collect();
            stale.iter().filter_map(|addr| peers.remove(addr)).collect()
        };
        for connection in expired {
            debug!("timed out log connection from {}", connection.summary());
            core.remove_connection(&connection);
            connection.close();
        }
    }
}

fn read_loop(core: &Arc<LogCore>, socket: &Arc<UdpSocket>, peers: &PeerMap, running: &AtomicBool) {
    let mut buf = vec![0u8; READ_BUFFER];
    while running.load(Ordering::Acquire) {
        let (n, addr) = match socket.recv_from(&mut buf) {
            Ok(received) => received,
            Err(e)
                if matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::Interrupted
                        | io::ErrorKind::ConnectionReset
                ) =>
            {
                continue;
            },
            Err(e) => {
                error!("UDP log server receive failed: {}", e);
                break;
            },
        };

        let existing = peers.lock().get(&addr).cloned();
        let connection = match existing {
            Some(connection) => connection,
            None => {
                let sink = PeerSink {
                    socket: socket.clone(),
                    peer: addr,
                };
                match core.add_connection(addr.to_string(), Box::new(sink)) {
                    Ok(connection) => {
                        debug!("new log connection from {}", addr);
                        peers.lock().insert(addr, connection.clone());
                        connection
                    },
                    Err(e) => {
                        debug!("rejecting datagram from {}: {}", addr, e);
                        continue;
                    },
                }
            },
        };
        connection.receive(&buf[..n], core.target());
    }
}
