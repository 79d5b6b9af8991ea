//! TCP 流的 mio 轮询线程（客户端和服务端共用）
//!
//! 线程持有监听 socket（服务端）和所有流；对端发来的字节交给连接的解码器，
//! 可写事件触发积压刷新。日志写线程通过 [`TcpStreamSink`] 直接写 socket，
//! 写不完的部分留在积压缓冲区里。

use super::{POLL_INTERVAL, READ_BUFFER};
use crate::connection::{Connection, FormattableSink};
use crate::logger::LogCore;
use bytes::{Buf, BytesMut};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use tracing::{debug, error, info, warn};

const LISTENER: Token = Token(0);

/// 非阻塞 TCP 出口
pub(crate) struct TcpStreamSink {
    stream: Arc<TcpStream>,
    pending: BytesMut,
}

impl TcpStreamSink {
    fn new(stream: Arc<TcpStream>) -> Self {
        Self {
            stream,
            pending: BytesMut::new(),
        }
    }

    fn drain(&mut self) -> io::Result<()> {
        while !self.pending.is_empty() {
            match (&*self.stream).write(&self.pending) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => self.pending.advance(n),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

impl FormattableSink for TcpStreamSink {
    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        self.drain()?;
        if !self.pending.is_empty() {
            self.pending.extend_from_slice(data);
            return Ok(());
        }
        match (&*self.stream).write(data) {
            Ok(n) if n < data.len() => self.pending.extend_from_slice(&data[n..]),
            Ok(_) => {},
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => self.pending.extend_from_slice(data),
            Err(e) => return Err(e),
        }
        Ok(())
    }

    fn outstanding(&self) -> usize {
        self.pending.len()
    }

    fn flush(&mut self) -> io::Result<()> {
        self.drain()
    }
}

struct Peer {
    stream: Arc<TcpStream>,
    connection: Arc<Connection>,
}

/// 轮询线程句柄
pub(crate) struct StreamWorker {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    /// 服务端：接受新连接
    pub(crate) fn listen(core: Arc<LogCore>, listener: TcpListener) -> io::Result<Self> {
        Self::spawn(core, Some(listener), None)
    }

    /// 客户端：单条已连接的流
    pub(crate) fn connected(
        core: Arc<LogCore>,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> io::Result<Self> {
        Self::spawn(core, None, Some((stream, peer)))
    }

    fn spawn(
        core: Arc<LogCore>,
        mut listener: Option<TcpListener>,
        stream: Option<(TcpStream, SocketAddr)>,
    ) -> io::Result<Self> {
        let poll = Poll::new()?;
        if let Some(listener) = listener.as_mut() {
            poll.registry()
                .register(listener, LISTENER, Interest::READABLE)?;
        }

        let mut state = PollState {
            core,
            poll,
            listener,
            peers: HashMap::new(),
            next_token: 1,
        };
        if let Some((stream, addr)) = stream {
            state.add_peer(stream, addr)?;
        }

        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let handle = thread::Builder::new()
            .name("can-log-tcp".into())
            .spawn(move || state.run(&flag))?;

        Ok(Self {
            running,
            handle: Some(handle),
        })
    }

    /// 停止线程并等待退出
    pub(crate) fn stop(mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take()
            && handle.join().is_err()
        {
            error!("TCP log thread panicked");
        }
    }
}

struct PollState {
    core: Arc<LogCore>,
    poll: Poll,
    listener: Option<TcpListener>,
    peers: HashMap<Token, Peer>,
    next_token: usize,
}

impl PollState {
    fn add_peer(&mut self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.poll
            .registry()
            .register(&mut stream, token, Interest::READABLE | Interest::WRITABLE)?;

        let stream = Arc::new(stream);
        let sink = TcpStreamSink::new(stream.clone());
        let connection = self
            .core
            .add_connection(addr.to_string(), Box::new(sink))
            .map_err(|e| io::Error::other(e.to_string()))?;
        self.peers.insert(token, Peer { stream, connection });
        Ok(())
    }

    fn run(mut self, running: &AtomicBool) {
        let mut events = Events::with_capacity(64);
        let mut buf = vec![0u8; READ_BUFFER];

        while running.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(POLL_INTERVAL)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!("TCP log poll failed: {}", e);
                break;
            }

            for event in events.iter() {
                if event.token() == LISTENER {
                    self.accept_all();
                    continue;
                }

                let token = event.token();
                let Some(peer) = self.peers.get(&token) else {
                    continue;
                };
                let mut closed = false;
                if event.is_readable() {
                    closed = self.read_peer(peer, &mut buf);
                }
                if event.is_writable()
                    && let Err(e) = peer.connection.flush_pending()
                {
                    debug!("{}: flush failed: {}", peer.connection.summary(), e);
                    closed = true;
                }
                if closed || !peer.connection.is_open() {
                    self.drop_peer(token);
                }
            }
        }
        debug!("TCP log thread exiting");
    }

    /// 读到 WouldBlock；返回对端是否已关闭
    fn read_peer(&self, peer: &Peer, buf: &mut [u8]) -> bool {
        loop {
            match (&*peer.stream).read(buf) {
                Ok(0) => return true,
                Ok(n) => {
                    peer.connection.receive(&buf[..n], self.core.target());
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return false,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    debug!("{}: read failed: {}", peer.connection.summary(), e);
                    return true;
                },
            }
        }
    }

    fn accept_all(&mut self) {
        loop {
            let accepted = match self.listener.as_ref() {
                Some(listener) => listener.accept(),
                None => return,
            };
            match accepted {
                Ok((stream, addr)) => {
                    info!("log connection from {}", addr);
                    if let Err(e) = self.add_peer(stream, addr) {
                        warn!("rejecting log connection from {}: {}", addr, e);
                    }
                },
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!("accept failed: {}", e);
                    return;
                },
            }
        }
    }

    fn drop_peer(&mut self, token: Token) {
        if let Some(peer) = self.peers.remove(&token) {
            self.core.remove_connection(&peer.connection);
            peer.connection.close();
            info!(
                "log connection {} closed: {}",
                peer.connection.summary(),
                peer.connection.stats()
            );
        }
    }
}
