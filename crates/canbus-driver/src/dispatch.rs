//! 中央分发
//!
//! 所有总线的中断结果都汇入一个有界入站队列，由单个分发线程按顺序处理：
//!
//! - 接收帧：更新统计 → 监听队列 → 接收回调 → 所有日志
//! - 发送完成：更新统计 / 写 TX 日志 → TX 监听 → 发送回调 → 装载下一帧
//! - 错误上报：状态变化时写 Error 日志
//!
//! 分发线程每隔 `tick_interval` 对所有总线和日志做一次周期维护
//! （卡死检测、看门狗、统计日志、空闲连接过期）。
//!
//! 也可以不启动线程，由调用方用 [`CentralDispatch::process_pending`] 同步处理。

use crate::bus::{Bus, WriteOutcome};
use crate::error::DriverError;
use crate::hooks::{CallbackRegistry, FrameCallback};
use crate::listener::ListenerSet;
use crate::registry::{Loggable, Player, Registry};
use crate::thread::JoinTimeout;
use canbus_protocol::{BusStatus, CanFrame, LogType};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// 入站消息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMessage {
    /// 收到一帧（`origin` 标明来源总线）
    Frame(CanFrame),
    /// 控制器有待服务的中断
    InterruptPending(u8),
    /// 发送结束
    TxComplete {
        bus: u8,
        frame: CanFrame,
        success: bool,
    },
    /// 队列中的帧无法装载
    TxFailed { bus: u8, frame: CanFrame },
    /// 错误状态变化
    ErrorReport(u8),
}

/// 分发配置
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// 入站队列容量（消息）
    pub inbound_queue_size: usize,
    /// 每条总线的延迟发送队列容量（帧）
    pub tx_queue_size: usize,
    /// 接收看门狗超时（秒）
    pub watchdog_timeout_secs: u64,
    /// 错误警告卡死判定（秒）
    pub stuck_timeout_secs: u64,
    /// 周期维护间隔（秒）
    pub tick_interval_secs: u64,
    /// 空闲时队列等待超时（毫秒），决定退出和维护的响应延迟
    pub poll_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            inbound_queue_size: 100,
            tx_queue_size: 30,
            watchdog_timeout_secs: 60,
            stuck_timeout_secs: 10,
            tick_interval_secs: 10,
            poll_interval_ms: 100,
        }
    }
}

/// 回调类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    Rx,
    Tx,
}

pub(crate) struct Shared {
    config: DispatchConfig,
    buses: Vec<Arc<Bus>>,
    inbound_tx: Sender<DispatchMessage>,
    inbound_rx: Receiver<DispatchMessage>,
    listeners: ListenerSet,
    rx_callbacks: CallbackRegistry,
    tx_callbacks: CallbackRegistry,
    loggers: Arc<Registry<dyn Loggable>>,
    players: Registry<dyn Player>,
}

impl Shared {
    fn bus(&self, number: u8) -> Option<&Arc<Bus>> {
        self.buses.iter().find(|b| b.number() == number)
    }

    fn process(&self, msg: DispatchMessage) {
        match msg {
            DispatchMessage::Frame(frame) => self.incoming_frame(&frame),
            DispatchMessage::InterruptPending(bus) => {
                if let Some(bus) = self.bus(bus) {
                    bus.service_interrupt();
                }
            },
            DispatchMessage::TxComplete {
                bus,
                frame,
                success,
            } => self.tx_done(bus, &frame, success),
            DispatchMessage::TxFailed { bus, frame } => {
                self.tx_done(bus, &frame, false);
                if let Some(bus) = self.bus(bus) {
                    self.loggers.log_status(bus.number(), LogType::Error, &bus.status());
                }
            },
            DispatchMessage::ErrorReport(bus) => {
                if let Some(bus) = self.bus(bus)
                    && bus.status_changed()
                {
                    let status = bus.status();
                    debug!("{}: error state {}", bus.name(), status.flags().describe());
                    self.loggers.log_status(bus.number(), LogType::Error, &status);
                }
            },
        }
    }

    fn incoming_frame(&self, frame: &CanFrame) {
        let Some(bus) = self.bus(frame.origin) else {
            trace!("dropping frame from unknown bus {}", frame.origin);
            return;
        };
        bus.note_rx();
        self.listeners.notify(frame, false);
        self.rx_callbacks.trigger_received(frame);
        self.loggers.log_frame(LogType::Rx, frame);
    }

    fn tx_done(&self, bus: u8, frame: &CanFrame, success: bool) {
        let Some(bus) = self.bus(bus) else {
            return;
        };
        bus.tx_complete(frame, success);
        if success {
            self.listeners.notify(frame, true);
        }
        self.tx_callbacks.trigger_sent(frame, success);
        if bus.driver().send_next_queued().is_some() {
            trace!("{}: loaded next queued frame", bus.name());
        }
    }

    fn tick(&self, now: Instant) {
        for bus in &self.buses {
            bus.tick(now);
        }
        self.loggers.tick(now);
    }
}

/// 中央分发器
pub struct CentralDispatch {
    shared: Arc<Shared>,
    is_running: Arc<AtomicBool>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl CentralDispatch {
    pub(crate) fn from_parts(
        config: DispatchConfig,
        buses: Vec<Arc<Bus>>,
        inbound_tx: Sender<DispatchMessage>,
        inbound_rx: Receiver<DispatchMessage>,
        loggers: Arc<Registry<dyn Loggable>>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                buses,
                inbound_tx,
                inbound_rx,
                listeners: ListenerSet::new(),
                rx_callbacks: CallbackRegistry::new(),
                tx_callbacks: CallbackRegistry::new(),
                loggers,
                players: Registry::new(),
            }),
            is_running: Arc::new(AtomicBool::new(false)),
            thread: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.shared.config
    }

    // ========================================================================
    // 分发线程
    // ========================================================================

    /// 启动分发线程（已启动时无操作）
    pub fn start(&self) -> Result<(), DriverError> {
        let mut slot = self.thread.lock();
        if slot.is_some() {
            return Ok(());
        }
        self.is_running.store(true, Ordering::Release);
        let shared = self.shared.clone();
        let is_running = self.is_running.clone();
        let handle = thread::Builder::new()
            .name("can-dispatch".to_string())
            .spawn(move || dispatch_loop(shared, is_running))
            .map_err(|e| DriverError::Thread(e.to_string()))?;
        *slot = Some(handle);
        info!("dispatch thread started ({} buses)", self.shared.buses.len());
        Ok(())
    }

    /// 停止分发线程，处理完已入队的消息
    pub fn shutdown(&self) {
        self.is_running.store(false, Ordering::Release);
        let join_timeout = Duration::from_secs(2);
        if let Some(handle) = self.thread.lock().take()
            && let Err(_e) = handle.join_timeout(join_timeout)
        {
            error!("dispatch thread failed to shut down within {:?}", join_timeout);
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// 在当前线程处理所有已入队消息，返回处理条数
    pub fn process_pending(&self) -> usize {
        let mut processed = 0;
        while let Ok(msg) = self.shared.inbound_rx.try_recv() {
            self.shared.process(msg);
            processed += 1;
        }
        processed
    }

    /// 立即执行一次周期维护
    pub fn tick(&self, now: Instant) {
        self.shared.tick(now);
    }

    // ========================================================================
    // 总线
    // ========================================================================

    pub fn bus(&self, number: u8) -> Option<&Arc<Bus>> {
        self.shared.bus(number)
    }

    pub fn buses(&self) -> &[Arc<Bus>] {
        &self.shared.buses
    }

    /// 入站队列发送端（给外部中断源使用）
    pub fn sender(&self) -> Sender<DispatchMessage> {
        self.shared.inbound_tx.clone()
    }

    /// 通知分发器某条总线有中断待服务
    pub fn raise_interrupt(&self, bus: u8) -> bool {
        self.shared
            .inbound_tx
            .try_send(DispatchMessage::InterruptPending(bus))
            .is_ok()
    }

    /// 把一帧当作接收帧注入（回放 / 模拟），队列满时返回 false
    pub fn inject_frame(&self, frame: CanFrame) -> bool {
        self.shared
            .inbound_tx
            .try_send(DispatchMessage::Frame(frame))
            .is_ok()
    }

    /// 同步处理一帧接收帧
    pub fn incoming_frame(&self, frame: &CanFrame) {
        self.shared.incoming_frame(frame);
    }

    /// 在指定总线上发送
    pub fn write(
        &self,
        bus: u8,
        frame: CanFrame,
        max_wait: Duration,
    ) -> Result<WriteOutcome, DriverError> {
        self.shared
            .bus(bus)
            .ok_or(DriverError::UnknownBus(bus))?
            .write(frame, max_wait)
    }

    // ========================================================================
    // 监听与回调
    // ========================================================================

    pub fn register_listener(&self, sender: Sender<CanFrame>, tx_feedback: bool) {
        self.shared.listeners.register(sender, tx_feedback);
    }

    pub fn deregister_listener(&self, sender: &Sender<CanFrame>) -> bool {
        self.shared.listeners.deregister(sender)
    }

    pub fn listener_drops(&self) -> u64 {
        self.shared.listeners.dropped()
    }

    pub fn register_callback(
        &self,
        caller: &str,
        kind: CallbackKind,
        callback: Arc<dyn FrameCallback>,
    ) {
        match kind {
            CallbackKind::Rx => self.shared.rx_callbacks.register(caller, callback),
            CallbackKind::Tx => self.shared.tx_callbacks.register(caller, callback),
        }
    }

    pub fn deregister_callback(&self, caller: &str, kind: CallbackKind) -> bool {
        match kind {
            CallbackKind::Rx => self.shared.rx_callbacks.deregister(caller),
            CallbackKind::Tx => self.shared.tx_callbacks.deregister(caller),
        }
    }

    // ========================================================================
    // 日志与回放
    // ========================================================================

    /// 注册日志，返回编号（从 1 开始）
    pub fn add_logger(&self, logger: Arc<dyn Loggable>) -> u32 {
        let id = self.shared.loggers.add(logger);
        debug!("logger #{} registered", id);
        id
    }

    pub fn logger(&self, id: u32) -> Option<Arc<dyn Loggable>> {
        self.shared.loggers.get(id)
    }

    pub fn loggers(&self) -> Arc<Vec<(u32, Arc<dyn Loggable>)>> {
        self.shared.loggers.snapshot()
    }

    /// 注销并关闭日志
    pub fn remove_logger(&self, id: u32) -> bool {
        match self.shared.loggers.remove(id) {
            Some(logger) => {
                logger.close();
                true
            },
            None => {
                warn!("no logger #{}", id);
                false
            },
        }
    }

    /// 关闭所有日志，返回数量
    pub fn remove_loggers(&self) -> usize {
        let drained = self.shared.loggers.drain();
        for (_, logger) in &drained {
            logger.close();
        }
        drained.len()
    }

    pub fn log_frame(&self, kind: LogType, frame: &CanFrame) {
        self.shared.loggers.log_frame(kind, frame);
    }

    pub fn log_status(&self, bus: u8, kind: LogType, status: &BusStatus) {
        self.shared.loggers.log_status(bus, kind, status);
    }

    pub fn log_info(&self, bus: u8, kind: LogType, text: &str) {
        self.shared.loggers.log_info(bus, kind, text);
    }

    /// 注册回放器，返回编号（从 1 开始）
    pub fn add_player(&self, player: Arc<dyn Player>) -> u32 {
        let id = self.shared.players.add(player);
        debug!("player #{} registered", id);
        id
    }

    pub fn player(&self, id: u32) -> Option<Arc<dyn Player>> {
        self.shared.players.get(id)
    }

    pub fn players(&self) -> Arc<Vec<(u32, Arc<dyn Player>)>> {
        self.shared.players.snapshot()
    }

    pub fn remove_player(&self, id: u32) -> bool {
        match self.shared.players.remove(id) {
            Some(player) => {
                player.close();
                true
            },
            None => false,
        }
    }

    pub fn remove_players(&self) -> usize {
        let drained = self.shared.players.drain();
        for (_, player) in &drained {
            player.close();
        }
        drained.len()
    }
}

impl Drop for CentralDispatch {
    fn drop(&mut self) {
        self.shutdown();
        for bus in &self.shared.buses {
            bus.stop();
        }
    }
}

fn dispatch_loop(shared: Arc<Shared>, is_running: Arc<AtomicBool>) {
    let poll = Duration::from_millis(shared.config.poll_interval_ms.max(1));
    let tick_interval = Duration::from_secs(shared.config.tick_interval_secs.max(1));
    let mut last_tick = Instant::now();

    while is_running.load(Ordering::Acquire) {
        match shared.inbound_rx.recv_timeout(poll) {
            Ok(msg) => shared.process(msg),
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }

        let now = Instant::now();
        if now.duration_since(last_tick) >= tick_interval {
            shared.tick(now);
            last_tick = now;
        }
    }

    while let Ok(msg) = shared.inbound_rx.try_recv() {
        shared.process(msg);
    }
    debug!("dispatch thread exited");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::DispatchBuilder;
    use crate::mode::{BusMode, BusSpeed};
    use crate::registry::tests::MemoryLog;
    use crate::sim::SimController;
    use crossbeam_channel::bounded;
    use std::sync::atomic::AtomicU32;

    struct Order {
        tag: &'static str,
        log: Arc<parking_lot::Mutex<Vec<String>>>,
    }

    impl FrameCallback for Order {
        fn on_frame_received(&self, frame: &CanFrame) {
            self.log.lock().push(format!("{}:{:X}", self.tag, frame.id));
        }

        fn on_frame_sent(&self, frame: &CanFrame, success: bool) {
            self.log
                .lock()
                .push(format!("{}:sent:{:X}:{}", self.tag, frame.id, success));
        }
    }

    fn setup() -> (CentralDispatch, SimController) {
        let sim = SimController::new();
        let dispatch = DispatchBuilder::new().bus(Box::new(sim.clone())).build();
        dispatch
            .bus(1)
            .unwrap()
            .start(BusMode::Active, BusSpeed::K500)
            .unwrap();
        (dispatch, sim)
    }

    #[test]
    fn test_frame_fanout_order() {
        let (dispatch, sim) = setup();
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let memory = Arc::new(MemoryLog::default());
        let (tx, rx) = bounded(10);

        dispatch.register_listener(tx, false);
        dispatch.register_callback("a", CallbackKind::Rx, Arc::new(Order { tag: "a", log: log.clone() }));
        dispatch.register_callback("b", CallbackKind::Rx, Arc::new(Order { tag: "b", log: log.clone() }));
        dispatch.add_logger(memory.clone());

        for id in [0x100, 0x200] {
            sim.inject_rx(&CanFrame::new_standard(id, &[]));
        }
        assert!(dispatch.raise_interrupt(1));
        dispatch.process_pending();

        assert_eq!(rx.try_iter().map(|f| f.id).collect::<Vec<_>>(), vec![0x100, 0x200]);
        assert_eq!(*log.lock(), vec!["a:100", "b:100", "a:200", "b:200"]);
        assert_eq!(memory.count(LogType::Rx), 2);
        assert_eq!(dispatch.bus(1).unwrap().status().packets_rx, 2);
    }

    #[test]
    fn test_tx_complete_loads_next_queued() {
        let (dispatch, sim) = setup();
        let memory = Arc::new(MemoryLog::default());
        let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let (tx, rx) = bounded(10);
        dispatch.add_logger(memory.clone());
        dispatch.register_listener(tx, true);
        dispatch.register_callback("t", CallbackKind::Tx, Arc::new(Order { tag: "t", log: log.clone() }));

        let first = CanFrame::new_standard(0x1, &[]);
        let second = CanFrame::new_standard(0x2, &[]);
        assert_eq!(dispatch.write(1, first, Duration::ZERO).unwrap(), WriteOutcome::Sent);
        assert_eq!(dispatch.write(1, second, Duration::ZERO).unwrap(), WriteOutcome::Queued);

        sim.complete_tx();
        dispatch.raise_interrupt(1);
        dispatch.process_pending();
        assert!(sim.tx_busy());

        sim.complete_tx();
        dispatch.raise_interrupt(1);
        dispatch.process_pending();

        assert_eq!(sim.transmitted().iter().map(|f| f.id).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(*log.lock(), vec!["t:sent:1:true", "t:sent:2:true"]);
        assert_eq!(memory.kinds(), vec![LogType::TxQueue, LogType::Tx, LogType::Tx]);
        assert_eq!(dispatch.bus(1).unwrap().status().packets_tx, 2);
    }

    /// 入站队列满丢掉 TX 完成消息后，周期维护继续推进延迟发送队列
    #[test]
    fn test_tick_recovers_dropped_tx_complete() {
        let sim = SimController::new();
        let dispatch = DispatchBuilder::new()
            .config(DispatchConfig {
                inbound_queue_size: 2,
                ..Default::default()
            })
            .bus(Box::new(sim.clone()))
            .build();
        let bus = dispatch.bus(1).unwrap().clone();
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        let memory = Arc::new(MemoryLog::default());
        dispatch.add_logger(memory.clone());

        let a = CanFrame::new_standard(0xA, &[]);
        let b = CanFrame::new_standard(0xB, &[]);
        assert_eq!(dispatch.write(1, a, Duration::ZERO).unwrap(), WriteOutcome::Sent);
        assert_eq!(dispatch.write(1, b, Duration::ZERO).unwrap(), WriteOutcome::Queued);

        sim.inject_rx(&CanFrame::new_standard(0x100, &[]));
        sim.inject_rx(&CanFrame::new_standard(0x101, &[]));
        sim.complete_tx();
        bus.driver().handle_interrupt();
        assert_eq!(bus.status().dispatch_overflow, 1);
        assert_eq!(dispatch.process_pending(), 2);
        assert!(!sim.tx_busy());

        dispatch.tick(Instant::now());
        assert!(sim.tx_busy());
        sim.complete_tx();
        bus.driver().handle_interrupt();
        dispatch.process_pending();

        assert_eq!(sim.transmitted().iter().map(|f| f.id).collect::<Vec<_>>(), vec![0xA, 0xB]);
        assert_eq!(memory.count(LogType::Tx), 1);
        assert_eq!(bus.driver().tx_queue_len(), 0);
    }

    #[test]
    fn test_player_registry() {
        struct Replay {
            open: AtomicBool,
            speed: AtomicU32,
        }

        impl Player for Replay {
            fn is_open(&self) -> bool {
                self.open.load(Ordering::Acquire)
            }

            fn close(&self) {
                self.open.store(false, Ordering::Release);
            }

            fn info(&self) -> String {
                format!("Type:test Speed:{}x", self.speed.load(Ordering::Relaxed))
            }

            fn set_speed(&self, speed: u32) {
                self.speed.store(speed, Ordering::Relaxed);
            }
        }

        let (dispatch, _sim) = setup();
        let player = Arc::new(Replay {
            open: AtomicBool::new(true),
            speed: AtomicU32::new(1),
        });
        let id = dispatch.add_player(player.clone());
        assert_eq!(id, 1);

        dispatch.player(id).unwrap().set_speed(4);
        assert_eq!(dispatch.players()[0].1.info(), "Type:test Speed:4x");
        assert!(dispatch.player(id).unwrap().stats().is_empty());

        assert!(dispatch.remove_player(id));
        assert!(!player.is_open());
        assert!(dispatch.player(id).is_none());
        assert_eq!(dispatch.remove_players(), 0);
    }

    #[test]
    fn test_error_report_logs_on_change() {
        let (dispatch, sim) = setup();
        let memory = Arc::new(MemoryLog::default());
        dispatch.add_logger(memory.clone());

        sim.force_overrun(3);
        dispatch.raise_interrupt(1);
        dispatch.process_pending();

        assert_eq!(memory.count(LogType::Error), 1);
        assert_eq!(memory.count(LogType::Rx), 0);
        assert_eq!(dispatch.bus(1).unwrap().status().rxbuf_overflow, 3);
    }

    #[test]
    fn test_unknown_origin_dropped() {
        let (dispatch, _sim) = setup();
        let memory = Arc::new(MemoryLog::default());
        dispatch.add_logger(memory.clone());

        assert!(dispatch.inject_frame(CanFrame::new_standard(0x10, &[]).with_origin(9)));
        dispatch.process_pending();
        assert!(memory.kinds().is_empty());
    }

    #[test]
    fn test_remove_logger_closes() {
        let (dispatch, _sim) = setup();
        let memory = Arc::new(MemoryLog::default());
        let id = dispatch.add_logger(memory.clone());

        assert!(dispatch.remove_logger(id));
        assert!(!memory.is_open());
        assert!(!dispatch.remove_logger(id));
        assert_eq!(dispatch.remove_loggers(), 0);
    }

    #[test]
    fn test_write_unknown_bus() {
        let (dispatch, _sim) = setup();
        assert!(matches!(
            dispatch.write(7, CanFrame::default(), Duration::ZERO),
            Err(DriverError::UnknownBus(7))
        ));
    }

    #[test]
    fn test_thread_processes_and_stops() {
        struct Counter(AtomicU32);

        impl FrameCallback for Counter {
            fn on_frame_received(&self, _frame: &CanFrame) {
                self.0.fetch_add(1, Ordering::Relaxed);
            }
        }

        let (dispatch, _sim) = setup();
        let counter = Arc::new(Counter(AtomicU32::new(0)));
        dispatch.register_callback("count", CallbackKind::Rx, counter.clone());
        dispatch.start().unwrap();
        dispatch.start().unwrap();

        for id in 0..10 {
            assert!(dispatch.inject_frame(CanFrame::new_standard(id, &[]).with_origin(1)));
        }
        dispatch.shutdown();
        assert!(!dispatch.is_running());
        assert_eq!(counter.0.load(Ordering::Relaxed), 10);
    }
}
