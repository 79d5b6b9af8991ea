//! Logger：把日志条目排队、编码后扇出到传输的所有连接
//!
//! 状态机：Closed → Open（`open()` 成功）→ Closed（`close()` 或 drop）。
//! 网络传输在网络未就绪时 `open()` 返回成功但保持 Closed，等 `network.up` 再打开；
//! `network.down` / `sd.unmounting` 暂时关闭传输，Logger 本身保留。
//!
//! 每个 Logger 有自己的有界队列和写线程，慢出口不会阻塞分发线程或其它 Logger。

use crate::config::SharedConfig;
use crate::connection::{Connection, FormattableSink, drop_rate};
use crate::error::LogError;
use crate::events::{
    CONFIG_CHANGED, Event, EventBus, METRIC_PREFIX, NETWORK_DOWN, NETWORK_UP, SD_MOUNTED,
    SD_UNMOUNTING, SubscriptionId,
};
use crate::format::{FormatCodec, FormatRegistry, ServeMode, ServeTarget};
use crate::sinks::{POLL_INTERVAL, Sink, TransportKind};
use arc_swap::{ArcSwap, ArcSwapOption};
use canbus_driver::Loggable;
use canbus_protocol::{BusStatus, CanFrame, FrameFilter, LogMessage, LogType, NameFilter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Logger 共用的服务
#[derive(Clone)]
pub struct LogContext {
    pub formats: Arc<FormatRegistry>,
    pub config: SharedConfig,
    pub events: Arc<EventBus>,
    /// 服务模式下回放帧的去处
    pub target: Option<Arc<dyn ServeTarget>>,
}

impl LogContext {
    pub fn new(formats: Arc<FormatRegistry>, config: SharedConfig, events: Arc<EventBus>) -> Self {
        Self {
            formats,
            config,
            events,
            target: None,
        }
    }

    pub fn with_target(mut self, target: Arc<dyn ServeTarget>) -> Self {
        self.target = Some(target);
        self
    }
}

/// Logger 参数
#[derive(Debug, Clone)]
pub struct LoggerOptions {
    pub transport: TransportKind,
    pub format: String,
    /// 文件路径、`host:port` 或监听端口
    pub target: String,
    pub mode: ServeMode,
    pub filter: Option<FrameFilter>,
}

impl LoggerOptions {
    pub fn new(transport: TransportKind, format: &str, target: &str) -> Self {
        Self {
            transport,
            format: format.to_string(),
            target: target.to_string(),
            mode: ServeMode::default(),
            filter: None,
        }
    }

    pub fn mode(mut self, mode: ServeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn filter(mut self, filter: FrameFilter) -> Self {
        self.filter = Some(filter);
        self
    }
}

// ============================================================
// 传输共享的核心
// ============================================================

/// 传输与写线程共享的部分：连接表和创建连接所需的服务
pub(crate) struct LogCore {
    format: String,
    mode: ServeMode,
    ctx: LogContext,
    max_outstanding: usize,
    connections: Mutex<Vec<Arc<Connection>>>,
}

impl LogCore {
    pub(crate) fn events(&self) -> &EventBus {
        &self.ctx.events
    }

    pub(crate) fn config(&self) -> &RwLock<crate::config::LogConfig> {
        &self.ctx.config
    }

    pub(crate) fn target(&self) -> Option<&dyn ServeTarget> {
        self.ctx.target.as_deref()
    }

    /// 登记新连接：附加解码器并写入连接头
    pub(crate) fn add_connection(
        &self,
        peer: String,
        sink: Box<dyn FormattableSink>,
    ) -> Result<Arc<Connection>, LogError> {
        let codec = self
            .ctx
            .formats
            .create(&self.format)
            .ok_or_else(|| LogError::UnknownFormat(self.format.clone()))?;
        let header = codec.session_header(SystemTime::now(), self.target());
        let connection =
            Connection::new(peer, sink, self.max_outstanding).with_decoder(codec, self.mode);
        connection.write_raw(&header)?;

        let connection = Arc::new(connection);
        self.connections.lock().push(connection.clone());
        Ok(connection)
    }

    pub(crate) fn remove_connection(&self, connection: &Arc<Connection>) {
        self.connections
            .lock()
            .retain(|c| !Arc::ptr_eq(c, connection));
    }

    /// 关闭并移除所有连接
    pub(crate) fn close_connections(&self) {
        let connections = std::mem::take(&mut *self.connections.lock());
        for connection in connections {
            connection.close();
            debug!("closed {}: {}", connection.summary(), connection.stats());
        }
    }

    pub(crate) fn connections(&self) -> Vec<Arc<Connection>> {
        self.connections.lock().clone()
    }

    fn output(&self, codec: &dyn FormatCodec, msg: &LogMessage) {
        let bytes = codec.encode(msg);
        for connection in self.connections.lock().iter() {
            connection.output_msg(msg, &bytes);
        }
    }

    fn flush(&self) {
        for connection in self.connections.lock().iter() {
            if let Err(e) = connection.flush_pending() {
                debug!("{}: flush failed: {}", connection.summary(), e);
            }
        }
    }
}

// ============================================================
// Logger
// ============================================================

#[derive(Debug, Default)]
struct LoggerCounters {
    messages: AtomicU64,
    dropped: AtomicU64,
    filtered: AtomicU64,
}

/// 一个日志目的地
pub struct Logger {
    kind: TransportKind,
    format: String,
    core: Arc<LogCore>,
    sink: Sink,
    filter: ArcSwapOption<FrameFilter>,
    event_filter: ArcSwap<NameFilter>,
    metric_filter: ArcSwap<NameFilter>,
    open: AtomicBool,
    closed: AtomicBool,
    lifecycle: Mutex<()>,
    tx: Sender<LogMessage>,
    running: Arc<AtomicBool>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
    counters: LoggerCounters,
}

impl Logger {
    /// 创建 Logger 并启动写线程；传输尚未打开
    pub fn new(options: LoggerOptions, ctx: LogContext) -> Result<Arc<Self>, LogError> {
        let codec = ctx
            .formats
            .create(&options.format)
            .ok_or_else(|| LogError::UnknownFormat(options.format.clone()))?;
        let sink = Sink::new(options.transport, &options.target)?;

        let (queue_size, max_outstanding, event_filter, metric_filter) = {
            let config = ctx.config.read();
            (
                config.queue_size.max(1),
                config.max_outstanding_bytes,
                config.event_filter()?,
                config.metric_filter()?,
            )
        };

        let core = Arc::new(LogCore {
            format: options.format.clone(),
            mode: options.mode,
            ctx,
            max_outstanding,
            connections: Mutex::new(Vec::new()),
        });

        let (tx, rx) = bounded(queue_size);
        let running = Arc::new(AtomicBool::new(true));
        let worker = {
            let core = core.clone();
            let running = running.clone();
            thread::Builder::new()
                .name(format!("can-log-{}", options.transport))
                .spawn(move || write_loop(&core, codec, &rx, &running))?
        };

        let logger = Arc::new(Self {
            kind: options.transport,
            format: options.format,
            core,
            sink,
            filter: ArcSwapOption::from(options.filter.map(Arc::new)),
            event_filter: ArcSwap::from_pointee(event_filter),
            metric_filter: ArcSwap::from_pointee(metric_filter),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            lifecycle: Mutex::new(()),
            tx,
            running,
            worker: Mutex::new(Some(worker)),
            subscription: Mutex::new(None),
            counters: LoggerCounters::default(),
        });

        let weak: Weak<Logger> = Arc::downgrade(&logger);
        let id = logger.core.ctx.events.subscribe("*", move |event| {
            if let Some(logger) = weak.upgrade() {
                logger.on_event(event);
            }
        });
        *logger.subscription.lock() = Some(id);

        Ok(logger)
    }

    /// 打开传输
    ///
    /// 网络传输在网络未就绪时返回 `Ok(())` 但 `is_open()` 仍为 false。
    pub fn open(&self) -> Result<(), LogError> {
        let _guard = self.lifecycle.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(LogError::InvalidArgument("logger is closed".to_string()));
        }
        if self.open.load(Ordering::Acquire) {
            return Ok(());
        }
        if self.sink.open(&self.core)? {
            self.open.store(true, Ordering::Release);
            info!("CAN log opened: {}", self.info());
        }
        Ok(())
    }

    fn reopen(&self) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = self.open() {
            warn!("could not reopen CAN log {}: {}", self.sink.path(), e);
        }
    }

    /// 暂时关闭传输（网络断开、存储卸载），Logger 保留
    fn suspend(&self) {
        let _guard = self.lifecycle.lock();
        if self.open.swap(false, Ordering::AcqRel) {
            self.sink.close(&self.core);
            info!("CAN log suspended: {}", self.info());
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.kind
    }

    pub fn format(&self) -> &str {
        &self.format
    }

    /// 服务端实际监听地址
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.sink.local_addr()
    }

    /// 当前连接
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.core.connections()
    }

    pub fn set_filter(&self, filter: FrameFilter) {
        self.filter.store(Some(Arc::new(filter)));
    }

    pub fn clear_filter(&self) {
        self.filter.store(None);
    }

    pub fn messages(&self) -> u64 {
        self.counters.messages.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.counters.filtered.load(Ordering::Relaxed)
    }

    /// 队列中等待写出的条目数
    pub fn waiting(&self) -> usize {
        self.tx.len()
    }

    /// 重新读取事件 / 指标转发过滤器
    pub fn reload_filters(&self) {
        let config = self.core.ctx.config.read();
        match (config.event_filter(), config.metric_filter()) {
            (Ok(events), Ok(metrics)) => {
                self.event_filter.store(Arc::new(events));
                self.metric_filter.store(Arc::new(metrics));
                debug!("CAN log filters reloaded");
            },
            (Err(e), _) | (_, Err(e)) => warn!("keeping CAN log filters: {}", e),
        }
    }

    fn enqueue(&self, msg: LogMessage) {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);
        match self.tx.try_send(msg) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            },
        }
    }

    fn reject(&self) {
        self.counters.filtered.fetch_add(1, Ordering::Relaxed);
    }

    fn bus_passes(&self, bus: u8) -> bool {
        self.filter
            .load()
            .as_deref()
            .is_none_or(|f| f.is_filtered_bus(bus))
    }

    fn on_event(&self, event: &Event) {
        let removable = self.sink.is_removable(&self.core);
        match event.name.as_str() {
            NETWORK_UP if self.kind.is_network() => self.reopen(),
            SD_MOUNTED if removable => self.reopen(),
            NETWORK_DOWN if self.kind.is_network() => self.suspend(),
            SD_UNMOUNTING if removable => self.suspend(),
            CONFIG_CHANGED if event.payload.is_empty() || event.payload == "can" => {
                self.reload_filters()
            },
            _ => {},
        }

        if let Some(metric) = event.name.strip_prefix(METRIC_PREFIX) {
            if self.metric_filter.load().matches(metric) {
                self.log_info(0, LogType::Metric, &format!("{}={}", metric, event.payload));
            }
        } else if self.event_filter.load().matches(&event.name) {
            self.log_info(0, LogType::Event, &event.name);
        }
    }
}

impl Loggable for Logger {
    fn log_frame(&self, kind: LogType, frame: &CanFrame) {
        if !self.is_open() {
            return self.reject();
        }
        if let Some(filter) = self.filter.load().as_deref()
            && !filter.is_filtered(frame)
        {
            return self.reject();
        }
        self.enqueue(LogMessage::frame(kind, *frame));
    }

    fn log_status(&self, bus: u8, kind: LogType, status: &BusStatus) {
        if !self.is_open() || !self.bus_passes(bus) {
            return self.reject();
        }
        self.enqueue(LogMessage::status(kind, bus, *status));
    }

    fn log_info(&self, bus: u8, kind: LogType, text: &str) {
        if !self.is_open() || !self.bus_passes(bus) {
            return self.reject();
        }
        self.enqueue(LogMessage::info(kind, bus, text));
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// 停止接收、写完队列中的条目、关闭传输；可重复调用
    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.open.store(false, Ordering::Release);
        if let Some(id) = self.subscription.lock().take() {
            self.core.ctx.events.unsubscribe(id);
        }

        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("CAN log writer thread panicked");
        }

        let _guard = self.lifecycle.lock();
        self.sink.close(&self.core);
        info!("Closed CAN log: {} ({})", self.sink.path(), self.stats());
    }

    fn info(&self) -> String {
        let filter = self
            .filter
            .load()
            .as_deref()
            .map(|f| f.info())
            .unwrap_or_else(|| "off".to_string());
        format!(
            "Type:{} Format:{} Filter:{} Vehicle:{} Path:{}",
            self.kind,
            self.format,
            filter,
            self.core.ctx.config.read().vehicle,
            self.sink.path(),
        )
    }

    fn stats(&self) -> String {
        let messages = self.messages();
        let dropped = self.dropped();
        let mut line = format!(
            "total messages: {}, dropped: {}, filtered: {} = {:.1}%",
            messages,
            dropped,
            self.filtered(),
            drop_rate(messages, dropped),
        );
        let waiting = self.waiting();
        if waiting > 0 {
            line.push_str(&format!(", waiting: {}", waiting));
        }
        line
    }

    fn tick(&self, now: Instant) {
        self.sink.tick(&self.core, now);
    }
}

impl Drop for Logger {
    fn drop(&mut self) {
        Loggable::close(self);
    }
}

/// 写线程：出队、编码一次、扇出到所有连接；退出前写完剩余条目
fn write_loop(
    core: &LogCore,
    codec: Box<dyn FormatCodec>,
    rx: &Receiver<LogMessage>,
    running: &AtomicBool,
) {
    while running.load(Ordering::Acquire) {
        match rx.recv_timeout(POLL_INTERVAL) {
            Ok(msg) => core.output(codec.as_ref(), &msg),
            Err(RecvTimeoutError::Timeout) => core.flush(),
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    for msg in rx.try_iter() {
        core.output(codec.as_ref(), &msg);
    }
    core.flush();
    debug!("CAN log writer exiting");
}
