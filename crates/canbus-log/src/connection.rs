//! 日志连接
//!
//! 一个 [`Connection`] 对应 Logger 的一个对端（文件、TCP 连接、UDP 对端）。
//! Logger 的写线程把编码好的字节交给 [`Connection::output_msg`]，连接自己决定
//! 是否再过滤、是否暂停、积压是否超限。

use crate::format::{ControlCommand, FormatCodec, ServeMode, ServeTarget};
use arc_swap::ArcSwapOption;
use bytes::Bytes;
use canbus_protocol::{FrameFilter, LogMessage, LogPayload};
use parking_lot::Mutex;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 连接背后的字节出口
pub trait FormattableSink: Send {
    /// 写出字节；非阻塞出口写不完的部分自行缓存
    fn write(&mut self, data: &[u8]) -> io::Result<()>;

    /// 写出一条日志编码后的字节；需要按条目类型处理的出口覆盖这个方法
    fn write_msg(&mut self, msg: &LogMessage, data: &[u8]) -> io::Result<()> {
        let _ = msg;
        self.write(data)
    }

    /// 尚未写出的积压字节数
    fn outstanding(&self) -> usize {
        0
    }

    /// 尽量写出积压字节
    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// 连接计数器
#[derive(Debug, Default)]
struct ConnectionCounters {
    messages: AtomicU64,
    dropped: AtomicU64,
    discarded: AtomicU64,
    filtered: AtomicU64,
}

/// 一个日志对端
pub struct Connection {
    peer: String,
    sink: Mutex<Box<dyn FormattableSink>>,
    filter: ArcSwapOption<FrameFilter>,
    paused: AtomicBool,
    open: AtomicBool,
    decoder: Mutex<Option<Box<dyn FormatCodec>>>,
    mode: ServeMode,
    max_outstanding: usize,
    created: Instant,
    last_activity: Mutex<Instant>,
    counters: ConnectionCounters,
}

impl Connection {
    /// 创建连接；`max_outstanding` 为积压字节上限
    pub fn new(peer: impl Into<String>, sink: Box<dyn FormattableSink>, max_outstanding: usize) -> Self {
        let now = Instant::now();
        Self {
            peer: peer.into(),
            sink: Mutex::new(sink),
            filter: ArcSwapOption::empty(),
            paused: AtomicBool::new(false),
            open: AtomicBool::new(true),
            decoder: Mutex::new(None),
            mode: ServeMode::Discard,
            max_outstanding,
            created: now,
            last_activity: Mutex::new(now),
            counters: ConnectionCounters::default(),
        }
    }

    /// 附加解码器，对端发来的字节按 `mode` 处理
    pub fn with_decoder(mut self, codec: Box<dyn FormatCodec>, mode: ServeMode) -> Self {
        self.decoder = Mutex::new(Some(codec));
        self.mode = mode;
        self
    }

    /// 对端标识
    pub fn summary(&self) -> &str {
        &self.peer
    }

    pub fn serve_mode(&self) -> ServeMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// 写出一条已编码的日志
    ///
    /// 返回是否真正写出。暂停中计入 discarded，过滤掉计入 filtered，
    /// 积压超限或写失败计入 dropped。
    pub fn output_msg(&self, msg: &LogMessage, bytes: &[u8]) -> bool {
        self.counters.messages.fetch_add(1, Ordering::Relaxed);

        if self.is_paused() {
            self.counters.discarded.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        if let Some(filter) = self.filter.load().as_deref() {
            let pass = match &msg.payload {
                LogPayload::Frame(frame) => filter.is_filtered(frame),
                _ => filter.is_filtered_bus(msg.bus),
            };
            if !pass {
                self.counters.filtered.fetch_add(1, Ordering::Relaxed);
                return false;
            }
        }

        if bytes.is_empty() {
            return false;
        }

        if !self.is_open() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut sink = self.sink.lock();
        if sink.outstanding() + bytes.len() > self.max_outstanding {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        match sink.write_msg(msg, bytes) {
            Ok(()) => true,
            Err(e) => {
                debug!("{}: write failed: {}", self.peer, e);
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                self.open.store(false, Ordering::Release);
                false
            },
        }
    }

    /// 写出原始字节（文件头），不计数
    pub fn write_raw(&self, bytes: &Bytes) -> io::Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        self.sink.lock().write(bytes)
    }

    /// 写出积压字节
    pub fn flush_pending(&self) -> io::Result<()> {
        self.sink.lock().flush()
    }

    pub fn outstanding(&self) -> usize {
        self.sink.lock().outstanding()
    }

    /// 处理对端发来的字节，返回消耗的字节数
    pub fn receive(&self, input: &[u8], target: Option<&dyn ServeTarget>) -> usize {
        self.touch();
        let mut decoder = self.decoder.lock();
        match decoder.as_mut() {
            Some(codec) => codec.serve(input, self.mode, self, target),
            None => input.len(),
        }
    }

    /// 执行流内控制命令
    pub fn apply_control(&self, cmd: &ControlCommand) {
        match cmd {
            ControlCommand::Pause => self.pause(),
            ControlCommand::Resume => self.resume(),
            ControlCommand::ClearFilters => self.clear_filters(),
            ControlCommand::AddFilter(spec) => {
                if let Err(e) = self.add_filter(spec) {
                    warn!("{}: ignoring filter '{}': {}", self.peer, spec, e);
                }
            },
        }
    }

    pub fn pause(&self) {
        debug!("{}: transmission paused", self.peer);
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        debug!("{}: transmission resumed", self.peer);
        self.paused.store(false, Ordering::Release);
    }

    pub fn clear_filters(&self) {
        self.filter.store(None);
    }

    /// 追加一条过滤规则
    pub fn add_filter(&self, spec: &str) -> Result<(), canbus_protocol::ProtocolError> {
        let mut filter = self
            .filter
            .load()
            .as_deref()
            .cloned()
            .unwrap_or_default();
        filter.add_filter_str(spec)?;
        self.filter.store(Some(Arc::new(filter)));
        Ok(())
    }

    /// 当前过滤规则摘要；无过滤器返回 None
    pub fn filter_info(&self) -> Option<String> {
        self.filter.load().as_deref().map(|f| f.info())
    }

    /// 刷新活动时间
    pub fn touch(&self) {
        *self.last_activity.lock() = Instant::now();
    }

    /// 距最后一次活动的时长
    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_activity.lock())
    }

    pub fn created(&self) -> Instant {
        self.created
    }

    /// 关闭：停止写出，尽量写出积压字节
    pub fn close(&self) {
        if self.open.swap(false, Ordering::AcqRel)
            && let Err(e) = self.flush_pending()
        {
            warn!("{}: flush on close failed: {}", self.peer, e);
        }
    }

    pub fn messages(&self) -> u64 {
        self.counters.messages.load(Ordering::Relaxed)
    }

    pub fn dropped(&self) -> u64 {
        self.counters.dropped.load(Ordering::Relaxed)
    }

    pub fn discarded(&self) -> u64 {
        self.counters.discarded.load(Ordering::Relaxed)
    }

    pub fn filtered(&self) -> u64 {
        self.counters.filtered.load(Ordering::Relaxed)
    }

    /// 一行统计
    pub fn stats(&self) -> String {
        let messages = self.messages();
        let dropped = self.dropped();
        format!(
            "total messages: {}, dropped: {}, discarded: {}, filtered: {} = {:.1}%",
            messages,
            dropped,
            self.discarded(),
            self.filtered(),
            drop_rate(messages, dropped),
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// 丢弃率（百分比）
pub(crate) fn drop_rate(messages: u64, dropped: u64) -> f64 {
    if messages == 0 {
        0.0
    } else {
        dropped as f64 / messages as f64 * 100.0
    }
}
