//! 传输出口
//!
//! 传输组成封闭集合：文件（vfs）、TCP 客户端 / 服务端、UDP 客户端 / 服务端，
//! 以及写进本进程日志的监视（monitor）。
//! 每种传输负责建立自己的 [`Connection`](crate::connection::Connection)，
//! 并把新连接交给 [`LogCore`] 登记（登记时写入格式头）。

mod monitor;
mod stream;
mod tcp_client;
mod tcp_server;
mod udp_client;
mod udp_server;
mod vfs;

use crate::error::LogError;
use crate::logger::LogCore;
use std::fmt;
use std::net::{SocketAddr, ToSocketAddrs};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

pub(crate) use monitor::MonitorSink;
pub(crate) use tcp_client::TcpClientSink;
pub(crate) use tcp_server::TcpServerSink;
pub(crate) use udp_client::UdpClientSink;
pub(crate) use udp_server::UdpServerSink;
pub(crate) use vfs::VfsSink;

/// 网络线程的轮询间隔
pub(crate) const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 单次读取缓冲区大小
pub(crate) const READ_BUFFER: usize = 2048;

/// 传输类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    Vfs,
    TcpClient,
    TcpServer,
    UdpClient,
    UdpServer,
    Monitor,
}

impl TransportKind {
    pub const ALL: [TransportKind; 6] = [
        TransportKind::Vfs,
        TransportKind::TcpClient,
        TransportKind::TcpServer,
        TransportKind::UdpClient,
        TransportKind::UdpServer,
        TransportKind::Monitor,
    ];

    /// 命令行 / 信息中使用的名称
    pub const fn as_str(self) -> &'static str {
        match self {
            TransportKind::Vfs => "vfs",
            TransportKind::TcpClient => "tcpclient",
            TransportKind::TcpServer => "tcpserver",
            TransportKind::UdpClient => "udpclient",
            TransportKind::UdpServer => "udpserver",
            TransportKind::Monitor => "monitor",
        }
    }

    /// 给人看的名称
    pub const fn label(self) -> &'static str {
        match self {
            TransportKind::Vfs => "VFS",
            TransportKind::TcpClient => "TCP client",
            TransportKind::TcpServer => "TCP server",
            TransportKind::UdpClient => "UDP client",
            TransportKind::UdpServer => "UDP server",
            TransportKind::Monitor => "MONITOR",
        }
    }

    /// 是否依赖网络
    pub const fn is_network(self) -> bool {
        !matches!(self, TransportKind::Vfs | TransportKind::Monitor)
    }

    /// 是否需要文件路径或地址
    pub const fn needs_target(self) -> bool {
        !matches!(self, TransportKind::Monitor)
    }

    /// 是否为服务端（支持服务模式）
    pub const fn is_server(self) -> bool {
        matches!(self, TransportKind::TcpServer | TransportKind::UdpServer)
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = LogError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TransportKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LogError::UnknownTransport(s.to_string()))
    }
}

/// 解析客户端目标 `host:port`
pub(crate) fn resolve(target: &str) -> Result<SocketAddr, LogError> {
    target
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| LogError::InvalidArgument(format!("cannot resolve '{}'", target)))
}

/// 解析服务端监听地址：`<port>` 或 `<host>:<port>`
pub(crate) fn listen_addr(target: &str) -> Result<SocketAddr, LogError> {
    if let Ok(port) = target.parse::<u16>() {
        return Ok(SocketAddr::from(([0, 0, 0, 0], port)));
    }
    resolve(target)
}

/// 一个 Logger 的传输
pub(crate) enum Sink {
    Vfs(VfsSink),
    TcpClient(TcpClientSink),
    TcpServer(TcpServerSink),
    UdpClient(UdpClientSink),
    UdpServer(UdpServerSink),
    Monitor(MonitorSink),
}

impl Sink {
    /// 按传输类型创建；只校验目标格式，不做 I/O
    pub(crate) fn new(kind: TransportKind, target: &str) -> Result<Self, LogError> {
        if kind.needs_target() && target.is_empty() {
            return Err(LogError::InvalidArgument(format!(
                "{} needs a target",
                kind.as_str()
            )));
        }
        Ok(match kind {
            TransportKind::Vfs => Sink::Vfs(VfsSink::new(target)),
            TransportKind::TcpClient => Sink::TcpClient(TcpClientSink::new(target)),
            TransportKind::TcpServer => {
                Sink::TcpServer(TcpServerSink::new(listen_addr(target)?))
            },
            TransportKind::UdpClient => Sink::UdpClient(UdpClientSink::new(target)),
            TransportKind::UdpServer => {
                Sink::UdpServer(UdpServerSink::new(listen_addr(target)?))
            },
            TransportKind::Monitor => Sink::Monitor(MonitorSink::new()),
        })
    }

    pub(crate) fn kind(&self) -> TransportKind {
        match self {
            Sink::Vfs(_) => TransportKind::Vfs,
            Sink::TcpClient(_) => TransportKind::TcpClient,
            Sink::TcpServer(_) => TransportKind::TcpServer,
            Sink::UdpClient(_) => TransportKind::UdpClient,
            Sink::UdpServer(_) => TransportKind::UdpServer,
            Sink::Monitor(_) => TransportKind::Monitor,
        }
    }

    /// 打开传输
    ///
    /// 返回 `Ok(true)` 表示已打开；网络传输在网络未就绪时返回 `Ok(false)`，
    /// 等 `network.up` 事件再打开。
    pub(crate) fn open(&self, core: &Arc<LogCore>) -> Result<bool, LogError> {
        if self.kind().is_network() && !core.events().network_up() {
            debug!(
                "delaying {} at {} (network not up)",
                self.kind().label(),
                self.path()
            );
            return Ok(false);
        }
        match self {
            Sink::Vfs(s) => s.open(core)?,
            Sink::TcpClient(s) => s.open(core)?,
            Sink::TcpServer(s) => s.open(core)?,
            Sink::UdpClient(s) => s.open(core)?,
            Sink::UdpServer(s) => s.open(core)?,
            Sink::Monitor(s) => s.open(core)?,
        }
        Ok(true)
    }

    /// 关闭传输并释放所有连接（可重复调用）
    pub(crate) fn close(&self, core: &LogCore) {
        match self {
            Sink::Vfs(s) => s.close(core),
            Sink::TcpClient(s) => s.close(core),
            Sink::TcpServer(s) => s.close(core),
            Sink::UdpClient(s) => s.close(core),
            Sink::UdpServer(s) => s.close(core),
            Sink::Monitor(s) => s.close(core),
        }
    }

    /// 周期维护
    pub(crate) fn tick(&self, core: &LogCore, now: Instant) {
        if let Sink::UdpServer(s) = self {
            s.expire_idle(core, now);
        }
    }

    /// 信息中显示的路径
    pub(crate) fn path(&self) -> String {
        match self {
            Sink::Vfs(s) => s.path().to_string(),
            Sink::TcpClient(s) => format!("tcp://{}", s.target()),
            Sink::UdpClient(s) => format!("udp://{}", s.target()),
            Sink::TcpServer(s) => format!("tcp://{}", s.local_addr()),
            Sink::UdpServer(s) => format!("udp://{}", s.local_addr()),
            Sink::Monitor(_) => monitor::MONITOR_PEER.to_string(),
        }
    }

    /// 服务端实际监听地址
    pub(crate) fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Sink::TcpServer(s) => Some(s.local_addr()),
            Sink::UdpServer(s) => Some(s.local_addr()),
            _ => None,
        }
    }

    /// 路径是否在可移动存储上
    pub(crate) fn is_removable(&self, core: &LogCore) -> bool {
        match self {
            Sink::Vfs(s) => core.config().read().is_removable(s.path()),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_parse() {
        for kind in TransportKind::ALL {
            assert_eq!(kind.as_str().parse::<TransportKind>().unwrap(), kind);
        }
        assert!(matches!(
            "serial".parse::<TransportKind>(),
            Err(LogError::UnknownTransport(_))
        ));
        assert!(TransportKind::UdpServer.is_server());
        assert!(!TransportKind::Vfs.is_network());
        assert_eq!(TransportKind::TcpClient.label(), "TCP client");
    }

    #[test]
    fn test_listen_addr() {
        assert_eq!(
            listen_addr("3000").unwrap(),
            SocketAddr::from(([0, 0, 0, 0], 3000))
        );
        assert_eq!(
            listen_addr("127.0.0.1:0").unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 0))
        );
    }

    #[test]
    fn test_sink_needs_target() {
        assert!(Sink::new(TransportKind::Vfs, "").is_err());
        let sink = Sink::new(TransportKind::TcpServer, "3000").unwrap();
        assert_eq!(sink.kind(), TransportKind::TcpServer);
        assert_eq!(sink.path(), "tcp://0.0.0.0:3000");

        let monitor = Sink::new(TransportKind::Monitor, "").unwrap();
        assert_eq!(monitor.kind(), TransportKind::Monitor);
        assert_eq!(monitor.path(), "MONITOR");
        assert!(!TransportKind::Monitor.is_network());
        assert!(!TransportKind::Monitor.needs_target());
    }
}
