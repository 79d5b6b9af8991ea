//! 日志回放
//!
//! [`VfsPlayer`] 从文件读取任一格式的日志，按记录时间戳的间隔（除以速度倍数）
//! 把帧交给 [`ServeTarget`]：simulate 模式注入分发器当作接收帧，transmit 模式发到总线。
//! 读到文件末尾后回放结束，回放器保持注册直到 `can play stop`。

use crate::error::LogError;
use crate::events::{SD_UNMOUNTING, SubscriptionId};
use crate::format::{DecodedRecord, FormatCodec, ServeMode, ServeTarget};
use crate::logger::LogContext;
use crate::sinks::READ_BUFFER;
use canbus_driver::Player;
use canbus_protocol::{CanFrame, FrameFilter};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError, bounded};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// 两条记录之间最长等待时间；日志中的长时间空白不原样回放
const MAX_GAP: Duration = Duration::from_secs(1);

/// 回放参数
#[derive(Debug, Clone)]
pub struct PlayerOptions {
    pub format: String,
    pub path: String,
    pub mode: ServeMode,
    pub filter: Option<FrameFilter>,
    /// 速度倍数，0 表示不等待
    pub speed: u32,
}

impl PlayerOptions {
    /// 默认 simulate 模式、原速回放
    pub fn new(format: &str, path: &str) -> Self {
        Self {
            format: format.to_string(),
            path: path.to_string(),
            mode: ServeMode::Simulate,
            filter: None,
            speed: 1,
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

    pub fn speed(mut self, speed: u32) -> Self {
        self.speed = speed;
        self
    }
}

/// 回放线程与回放器共享的状态
struct PlayShared {
    path: String,
    mode: ServeMode,
    filter: Option<FrameFilter>,
    speed: AtomicU32,
    open: AtomicBool,
    messages: AtomicU64,
    filtered: AtomicU64,
    target: Option<Arc<dyn ServeTarget>>,
}

impl PlayShared {
    fn stats(&self) -> String {
        format!(
            "total messages: {}, filtered: {}",
            self.messages.load(Ordering::Relaxed),
            self.filtered.load(Ordering::Relaxed)
        )
    }

    fn play(&self, frame: CanFrame) {
        if let Some(filter) = &self.filter
            && !filter.is_filtered(&frame)
        {
            self.filtered.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.messages.fetch_add(1, Ordering::Relaxed);
        match (self.mode, self.target.as_deref()) {
            (ServeMode::Simulate, Some(target)) => target.simulate(frame),
            (ServeMode::Transmit, Some(target)) => {
                if let Err(e) = target.transmit(frame) {
                    debug!("{}: transmit failed: {}", self.path, e);
                }
            },
            _ => {},
        }
    }

    /// 按时间戳间隔等待；收到停止请求返回 false
    fn pace(&self, gap: Duration, stop: &Receiver<()>) -> bool {
        let speed = self.speed.load(Ordering::Relaxed);
        if speed == 0 || gap.is_zero() {
            return true;
        }
        let wait = (gap / speed).min(MAX_GAP);
        matches!(stop.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
    }
}

/// 文件回放器
pub struct VfsPlayer {
    format: String,
    shared: Arc<PlayShared>,
    ctx: LogContext,
    closed: AtomicBool,
    stop: Mutex<Option<Sender<()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    subscription: Mutex<Option<SubscriptionId>>,
}

impl VfsPlayer {
    /// 打开文件并开始回放
    ///
    /// 受保护的路径、未挂载的可移动存储、未注册的格式在这里报错。
    pub fn start(options: PlayerOptions, ctx: LogContext) -> Result<Arc<Self>, LogError> {
        let codec = ctx
            .formats
            .create(&options.format)
            .ok_or_else(|| LogError::UnknownFormat(options.format.clone()))?;
        let removable = {
            let config = ctx.config.read();
            if config.is_protected(&options.path) {
                return Err(LogError::ProtectedPath(options.path));
            }
            config.is_removable(&options.path)
        };
        if removable && !ctx.events.removable_mounted() {
            return Err(LogError::MediumUnavailable(options.path));
        }
        let file = File::open(&options.path)?;

        let shared = Arc::new(PlayShared {
            path: options.path,
            mode: options.mode,
            filter: options.filter,
            speed: AtomicU32::new(options.speed),
            open: AtomicBool::new(true),
            messages: AtomicU64::new(0),
            filtered: AtomicU64::new(0),
            target: ctx.target.clone(),
        });

        let (stop_tx, stop_rx) = bounded(1);
        let worker = {
            let shared = shared.clone();
            thread::Builder::new()
                .name("can-play-vfs".to_string())
                .spawn(move || play_loop(&shared, file, codec, &stop_rx))?
        };
        info!("Now playing CAN messages from '{}'", shared.path);

        let player = Arc::new(Self {
            format: options.format,
            shared,
            ctx,
            closed: AtomicBool::new(false),
            stop: Mutex::new(Some(stop_tx)),
            worker: Mutex::new(Some(worker)),
            subscription: Mutex::new(None),
        });

        if removable {
            let weak: Weak<VfsPlayer> = Arc::downgrade(&player);
            let id = player.ctx.events.subscribe(SD_UNMOUNTING, move |_| {
                if let Some(player) = weak.upgrade() {
                    player.halt();
                }
            });
            *player.subscription.lock() = Some(id);
        }
        Ok(player)
    }

    pub fn path(&self) -> &str {
        &self.shared.path
    }

    pub fn speed(&self) -> u32 {
        self.shared.speed.load(Ordering::Relaxed)
    }

    pub fn messages(&self) -> u64 {
        self.shared.messages.load(Ordering::Relaxed)
    }

    /// 停止回放线程
    fn halt(&self) {
        // 丢弃发送端，线程在下一次等待或读取之间退出
        self.stop.lock().take();
        if let Some(handle) = self.worker.lock().take()
            && handle.join().is_err()
        {
            error!("CAN playback thread panicked");
        }
        self.shared.open.store(false, Ordering::Release);
    }
}

impl Player for VfsPlayer {
    fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(id) = self.subscription.lock().take() {
            self.ctx.events.unsubscribe(id);
        }
        self.halt();
    }

    fn info(&self) -> String {
        let filter = self
            .shared
            .filter
            .as_ref()
            .map(|f| f.info())
            .unwrap_or_else(|| "off".to_string());
        format!(
            "Type:vfs Format:{}({}) Speed:{}x Filter:{} Path:{}",
            self.format,
            self.shared.mode,
            self.speed(),
            filter,
            self.shared.path
        )
    }

    fn stats(&self) -> String {
        self.shared.stats()
    }

    fn set_speed(&self, speed: u32) {
        self.shared.speed.store(speed, Ordering::Relaxed);
    }
}

impl Drop for VfsPlayer {
    fn drop(&mut self) {
        Player::close(self);
    }
}

/// 回放线程：读取、解码、按节奏交出帧；读完或收到停止后退出
fn play_loop(
    shared: &PlayShared,
    mut file: File,
    mut codec: Box<dyn FormatCodec>,
    stop: &Receiver<()>,
) {
    let mut buf = vec![0u8; READ_BUFFER];
    let mut records = Vec::new();
    let mut last: Option<Duration> = None;

    'read: loop {
        match stop.try_recv() {
            Err(TryRecvError::Empty) => {},
            _ => break,
        }
        let n = match file.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("{}: read failed: {}", shared.path, e);
                break;
            },
        };

        codec.decode(&buf[..n], &mut records);
        for record in records.drain(..) {
            match record {
                DecodedRecord::Timestamp(at) => {
                    let gap = last.map_or(Duration::ZERO, |prev| at.saturating_sub(prev));
                    last = Some(at);
                    if !shared.pace(gap, stop) {
                        break 'read;
                    }
                },
                DecodedRecord::Frame { frame, .. } => shared.play(frame),
                _ => {},
            }
        }
    }

    shared.open.store(false, Ordering::Release);
    info!("Closed vfs playback '{}': {}", shared.path, shared.stats());
}
