//! 总线策略层
//!
//! `Bus` 包装一个 [`BusDriver`]，负责模式 / 速率、发送策略（直接发送或排队）、
//! 状态快照与变化检测、接收看门狗，以及把 TX 相关事件写入日志。

use crate::controller::{AcceptanceFilter, CanController};
use crate::dispatch::DispatchMessage;
use crate::driver::{BusDriver, DriverConfig};
use crate::error::DriverError;
use crate::metrics::{BusCounters, bump};
use crate::mode::{AtomicBusMode, BusMode, BusSpeed};
use crate::registry::{Loggable, Registry};
use canbus_protocol::{BusStatus, CanFrame, LogType};
use crossbeam_channel::Sender;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, warn};

/// 写入结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// 已装入硬件发送缓冲区
    Sent,
    /// 硬件忙，已进入延迟发送队列
    Queued,
}

/// 单条总线配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusConfig {
    pub driver: DriverConfig,
    /// 接收看门狗超时
    pub watchdog_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            driver: DriverConfig::default(),
            watchdog_timeout: Duration::from_secs(60),
        }
    }
}

/// 一条 CAN 总线
pub struct Bus {
    number: u8,
    name: String,
    driver: BusDriver,
    counters: Arc<BusCounters>,
    mode: AtomicBusMode,
    speed: Mutex<BusSpeed>,
    powered: AtomicBool,
    watchdog_armed: AtomicBool,
    watchdog_timeout: Duration,
    last_rx: Mutex<Instant>,
    last_checksum: AtomicU32,
    loggers: Arc<Registry<dyn Loggable>>,
}

impl Bus {
    pub(crate) fn new(
        number: u8,
        controller: Box<dyn CanController>,
        inbound: Sender<DispatchMessage>,
        loggers: Arc<Registry<dyn Loggable>>,
        config: BusConfig,
    ) -> Self {
        let counters = Arc::new(BusCounters::new());
        Self {
            number,
            name: format!("can{}", number),
            driver: BusDriver::new(number, controller, counters.clone(), inbound, config.driver),
            counters,
            mode: AtomicBusMode::default(),
            speed: Mutex::new(BusSpeed::default()),
            powered: AtomicBool::new(false),
            watchdog_armed: AtomicBool::new(true),
            watchdog_timeout: config.watchdog_timeout,
            last_rx: Mutex::new(Instant::now()),
            last_checksum: AtomicU32::new(0),
            loggers,
        }
    }

    pub fn number(&self) -> u8 {
        self.number
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mode(&self) -> BusMode {
        self.mode.get(Ordering::Acquire)
    }

    pub fn speed(&self) -> BusSpeed {
        *self.speed.lock()
    }

    pub fn is_powered(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    pub fn driver(&self) -> &BusDriver {
        &self.driver
    }

    // ========================================================================
    // 启停与电源
    // ========================================================================

    /// 以指定模式和速率启动；`Off` 等同于 `stop`
    ///
    /// 启动会清零统计。
    pub fn start(&self, mode: BusMode, speed: BusSpeed) -> Result<(), DriverError> {
        if mode == BusMode::Off {
            self.stop();
            return Ok(());
        }
        self.driver.purge_tx_queue();
        self.driver.start(mode, speed)?;
        *self.speed.lock() = speed;
        self.mode.set(mode, Ordering::Release);
        self.powered.store(true, Ordering::Release);
        *self.last_rx.lock() = Instant::now();
        self.clear_status();
        info!("{}: started in {} mode at {}", self.name, mode, speed);
        Ok(())
    }

    /// 停止总线（重复调用无副作用）
    pub fn stop(&self) {
        if self.mode() == BusMode::Off {
            return;
        }
        self.driver.stop();
        let purged = self.driver.purge_tx_queue();
        self.mode.set(BusMode::Off, Ordering::Release);
        self.powered.store(false, Ordering::Release);
        info!("{}: stopped ({} queued frames discarded)", self.name, purged);
    }

    /// 收发器电源
    ///
    /// 断电保留配置的模式，重新上电时按原模式和速率恢复。
    pub fn set_power(&self, on: bool) -> Result<(), DriverError> {
        let mode = self.mode();
        if on == self.is_powered() || mode == BusMode::Off {
            return Ok(());
        }
        if on {
            self.driver.start(mode, self.speed())?;
            *self.last_rx.lock() = Instant::now();
        } else {
            self.driver.stop();
            self.driver.purge_tx_queue();
        }
        self.powered.store(on, Ordering::Release);
        info!("{}: power {}", self.name, if on { "on" } else { "off" });
        Ok(())
    }

    /// 启用 / 关闭接收看门狗
    pub fn set_watchdog(&self, armed: bool) {
        self.watchdog_armed.store(armed, Ordering::Release);
        *self.last_rx.lock() = Instant::now();
    }

    pub fn set_acceptance_filter(&self, filter: &AcceptanceFilter) -> Result<(), DriverError> {
        self.driver.set_acceptance_filter(filter)
    }

    // ========================================================================
    // 发送
    // ========================================================================

    /// 发送一帧
    ///
    /// 硬件空闲且队列为空时直接发送，否则排队。`max_wait` 为零时队列满立即失败，
    /// 否则最多等待这么久。`Sent`/`Queued` 之外的结果都会记录为 TX_Fail。
    pub fn write(&self, frame: CanFrame, max_wait: Duration) -> Result<WriteOutcome, DriverError> {
        if self.mode() != BusMode::Active || !self.is_powered() {
            warn!("{}: cannot write when not in ACTIVE mode", self.name);
            return Err(DriverError::NotActive(self.number));
        }
        let frame = frame.with_origin(self.number);

        let guard = self.driver.write_guard();
        if self.driver.tx_queue_len() == 0 {
            match self.driver.write_frame(&frame) {
                Ok(()) => return Ok(WriteOutcome::Sent),
                Err(DriverError::HardwareBusy) => {},
                Err(e) => {
                    drop(guard);
                    self.loggers.log_frame(LogType::TxFail, &frame);
                    return Err(e);
                },
            }
        }
        let queued = self.driver.try_queue(frame);
        drop(guard);

        let queued = match queued {
            Err(frame) if !max_wait.is_zero() => self.driver.queue_timeout(frame, max_wait),
            other => other,
        };
        match queued {
            Ok(()) => {
                bump(&self.counters.txbuf_delay);
                self.loggers.log_frame(LogType::TxQueue, &frame);
                Ok(WriteOutcome::Queued)
            },
            Err(frame) => {
                bump(&self.counters.txbuf_overflow);
                self.loggers.log_frame(LogType::TxFail, &frame);
                Err(DriverError::TxQueueFull)
            },
        }
    }

    /// 发送结束（分发线程调用）
    pub(crate) fn tx_complete(&self, frame: &CanFrame, success: bool) {
        if success {
            bump(&self.counters.packets_tx);
            self.loggers.log_frame(LogType::Tx, frame);
        } else {
            self.loggers.log_frame(LogType::TxFail, frame);
        }
    }

    /// 收到一帧（分发线程调用）
    pub(crate) fn note_rx(&self) {
        bump(&self.counters.packets_rx);
        *self.last_rx.lock() = Instant::now();
    }

    /// 服务控制器中断
    pub fn service_interrupt(&self) -> usize {
        self.driver.handle_interrupt()
    }

    // ========================================================================
    // 状态
    // ========================================================================

    pub fn status(&self) -> BusStatus {
        self.counters.snapshot()
    }

    /// 清零统计（同时重置变化检测基线）
    pub fn clear_status(&self) {
        self.counters.reset();
        self.last_checksum
            .store(self.counters.snapshot().checksum(), Ordering::Release);
    }

    /// 自上次调用以来错误相关状态是否变化
    pub fn status_changed(&self) -> bool {
        let checksum = self.status().checksum();
        self.last_checksum.swap(checksum, Ordering::AcqRel) != checksum
    }

    /// 周期维护
    ///
    /// 卡死检测、接收看门狗、写状态日志。
    pub fn tick(&self, now: Instant) {
        if self.mode() == BusMode::Off || !self.is_powered() {
            return;
        }

        if self.driver.health_check(now) {
            self.loggers.log_info(self.number, LogType::Comment, "controller reset: stuck in error state");
        }
        self.check_watchdog(now);
        self.resume_tx_queue();

        let status = self.status();
        self.loggers.log_status(self.number, LogType::Statistics, &status);
        if self.status_changed() {
            self.loggers.log_status(self.number, LogType::Error, &self.status());
        }
    }

    /// 发送空闲但延迟队列非空时重新装载
    ///
    /// 分发队列满时 TX 完成消息会被丢弃，队列不会再被推进。
    fn resume_tx_queue(&self) {
        if self.driver.is_transmitting() || self.driver.tx_queue_len() == 0 {
            return;
        }
        if let Some(frame) = self.driver.send_next_queued() {
            warn!(
                "{}: transmit queue stalled, resumed with {:X} ({} left)",
                self.name,
                frame.id,
                self.driver.tx_queue_len()
            );
        }
    }

    /// 接收看门狗：超时没有收到帧时重启控制器，保留统计
    fn check_watchdog(&self, now: Instant) {
        if !self.watchdog_armed.load(Ordering::Acquire) {
            return;
        }
        let idle = now.saturating_duration_since(*self.last_rx.lock());
        if idle < self.watchdog_timeout {
            return;
        }

        let snapshot = self.status();
        self.driver.stop();
        let restarted = self.driver.start(self.mode(), self.speed());
        self.counters.restore(&snapshot);
        bump(&self.counters.watchdog_resets);
        *self.last_rx.lock() = now;
        match restarted {
            Ok(()) => warn!("{}: no frames for {:?}, controller restarted", self.name, idle),
            Err(e) => warn!("{}: watchdog restart failed: {}", self.name, e),
        }
    }

    /// 面向操作员的多行状态报告
    pub fn status_report(&self) -> String {
        StatusReport(self).to_string()
    }
}

/// [`Bus::status_report`] 的格式化器
struct StatusReport<'a>(&'a Bus);

impl fmt::Display for StatusReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bus = self.0;
        let s = bus.status();
        writeln!(f, "CAN:       {}", bus.name)?;
        writeln!(f, "Mode:      {}", bus.mode())?;
        writeln!(f, "Speed:     {}", bus.speed())?;
        writeln!(f, "Power:     {}", if bus.is_powered() { "on" } else { "off" })?;
        writeln!(f, "Interrupts:{:>20}", s.interrupts)?;
        writeln!(f, "Rx pkt:    {:>20}", s.packets_rx)?;
        writeln!(f, "Rx ovrflw: {:>20}", s.rxbuf_overflow)?;
        writeln!(f, "Rx invalid:{:>20}", s.invalid_frames)?;
        writeln!(f, "Tx pkt:    {:>20}", s.packets_tx)?;
        writeln!(f, "Tx delays: {:>20}", s.txbuf_delay)?;
        writeln!(f, "Tx ovrflw: {:>20}", s.txbuf_overflow)?;
        writeln!(f, "Tx queued: {:>20}", bus.driver.tx_queue_len())?;
        writeln!(f, "Err flags: {:>#20X}", s.error_flags)?;
        writeln!(f, "Rx err:    {:>20}", s.errors_rx)?;
        writeln!(f, "Tx err:    {:>20}", s.errors_tx)?;
        writeln!(f, "Wdg resets:{:>20}", s.watchdog_resets)?;
        writeln!(f, "Err resets:{:>20}", s.error_resets)?;
        writeln!(f, "Errata:    {:>20}", s.errata_fixes)?;
        writeln!(f, "Dispatch drop:{:>17}", s.dispatch_overflow)?;
        if s.error_flags != 0 {
            writeln!(f, "  {}", s.flags().describe())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::tests::MemoryLog;
    use crate::sim::SimController;
    use crossbeam_channel::{Receiver, bounded};

    fn setup(config: BusConfig) -> (Bus, SimController, Arc<MemoryLog>, Receiver<DispatchMessage>) {
        let sim = SimController::new();
        let (tx, rx) = bounded(100);
        let loggers: Arc<Registry<dyn Loggable>> = Arc::new(Registry::new());
        let log = Arc::new(MemoryLog::default());
        loggers.add(log.clone());
        let bus = Bus::new(1, Box::new(sim.clone()), tx, loggers, config);
        (bus, sim, log, rx)
    }

    #[test]
    fn test_write_requires_active_mode() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        assert!(matches!(
            bus.write(CanFrame::new_standard(0x100, &[]), Duration::ZERO),
            Err(DriverError::NotActive(1))
        ));

        bus.start(BusMode::Listen, BusSpeed::K500).unwrap();
        assert!(matches!(
            bus.write(CanFrame::new_standard(0x100, &[]), Duration::ZERO),
            Err(DriverError::NotActive(1))
        ));
    }

    #[test]
    fn test_write_then_queue() {
        let (bus, sim, log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();

        let first = CanFrame::new_standard(0x7DF, &[0x02, 0x01, 0x00]);
        assert_eq!(bus.write(first, Duration::ZERO).unwrap(), WriteOutcome::Sent);
        assert_eq!(bus.write(first, Duration::ZERO).unwrap(), WriteOutcome::Queued);
        assert_eq!(bus.status().txbuf_delay, 1);
        assert_eq!(log.kinds(), vec![LogType::TxQueue]);
        assert!(sim.tx_busy());
    }

    #[test]
    fn test_queue_full_logs_failure() {
        let (bus, _sim, log, _rx) = setup(BusConfig {
            driver: DriverConfig {
                tx_queue_size: 1,
                ..Default::default()
            },
            ..Default::default()
        });
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();

        let frame = CanFrame::new_standard(0x10, &[]);
        bus.write(frame, Duration::ZERO).unwrap();
        bus.write(frame, Duration::ZERO).unwrap();
        assert!(matches!(
            bus.write(frame, Duration::ZERO),
            Err(DriverError::TxQueueFull)
        ));
        assert_eq!(bus.status().txbuf_overflow, 1);
        assert_eq!(log.count(LogType::TxFail), 1);
    }

    #[test]
    fn test_stop_is_idempotent_and_purges_queue() {
        let (bus, sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K250).unwrap();
        let frame = CanFrame::new_standard(0x10, &[]);
        bus.write(frame, Duration::ZERO).unwrap();
        bus.write(frame, Duration::ZERO).unwrap();

        bus.stop();
        bus.stop();
        assert_eq!(bus.mode(), BusMode::Off);
        assert_eq!(bus.driver().tx_queue_len(), 0);
        assert!(!sim.is_powered());
    }

    #[test]
    fn test_unsupported_speed_rejected() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        assert!(matches!(
            bus.start(BusMode::Active, BusSpeed::K33_3),
            Err(DriverError::UnsupportedSpeed(BusSpeed::K33_3))
        ));
        assert_eq!(bus.mode(), BusMode::Off);
    }

    #[test]
    fn test_start_off_stops() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Listen, BusSpeed::K125).unwrap();
        bus.start(BusMode::Off, BusSpeed::K125).unwrap();
        assert_eq!(bus.mode(), BusMode::Off);
    }

    #[test]
    fn test_status_changed() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        assert!(!bus.status_changed());

        bus.note_rx();
        assert!(!bus.status_changed());

        bump(&bus.counters.rxbuf_overflow);
        assert!(bus.status_changed());
        assert!(!bus.status_changed());
    }

    #[test]
    fn test_watchdog_restart_preserves_counters() {
        let (bus, sim, log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        bus.note_rx();
        bus.note_rx();
        let resets_before = sim.reset_entries();

        bus.tick(Instant::now() + Duration::from_secs(61));
        let status = bus.status();
        assert_eq!(status.packets_rx, 2);
        assert_eq!(status.watchdog_resets, 1);
        assert!(sim.reset_entries() > resets_before);
        assert_eq!(bus.mode(), BusMode::Active);

        // watchdog_resets 计入校验和，写一条 Error 状态
        assert_eq!(log.count(LogType::Statistics), 1);
        assert_eq!(log.count(LogType::Error), 1);
    }

    #[test]
    fn test_watchdog_disarmed() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        bus.set_watchdog(false);
        bus.tick(Instant::now() + Duration::from_secs(120));
        assert_eq!(bus.status().watchdog_resets, 0);
    }

    #[test]
    fn test_power_cycle_keeps_mode() {
        let (bus, sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Listen, BusSpeed::K500).unwrap();

        bus.set_power(false).unwrap();
        assert!(!sim.is_powered());
        assert_eq!(bus.mode(), BusMode::Listen);

        bus.set_power(true).unwrap();
        assert!(sim.is_powered());
        assert!(sim.is_listen_only());
    }

    #[test]
    fn test_tx_complete_logging() {
        let (bus, _sim, log, _rx) = setup(BusConfig::default());
        let frame = CanFrame::new_standard(0x55, &[]).with_origin(1);
        bus.tx_complete(&frame, true);
        bus.tx_complete(&frame, false);
        assert_eq!(log.kinds(), vec![LogType::Tx, LogType::TxFail]);
        assert_eq!(bus.status().packets_tx, 1);
    }

    #[test]
    fn test_tick_resumes_queue_after_lost_tx_complete() {
        let sim = SimController::new();
        let (tx, rx) = bounded(2);
        let loggers: Arc<Registry<dyn Loggable>> = Arc::new(Registry::new());
        let bus = Bus::new(1, Box::new(sim.clone()), tx, loggers, BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();

        let a = CanFrame::new_standard(0xA, &[0x01]);
        let b = CanFrame::new_standard(0xB, &[0x02]);
        assert_eq!(bus.write(a, Duration::ZERO).unwrap(), WriteOutcome::Sent);
        assert_eq!(bus.write(b, Duration::ZERO).unwrap(), WriteOutcome::Queued);

        // 两个接收帧占满分发队列，TX 完成消息被丢弃
        sim.inject_rx(&CanFrame::new_standard(0x100, &[]));
        sim.inject_rx(&CanFrame::new_standard(0x101, &[]));
        assert!(sim.complete_tx());
        bus.driver().handle_interrupt();
        assert_eq!(bus.status().dispatch_overflow, 1);
        assert!(!bus.driver().is_transmitting());
        assert_eq!(bus.driver().tx_queue_len(), 1);

        bus.tick(Instant::now());
        assert!(bus.driver().is_transmitting());
        assert_eq!(bus.driver().tx_queue_len(), 0);
        assert!(sim.complete_tx());
        assert_eq!(sim.transmitted().iter().map(|f| f.id).collect::<Vec<_>>(), vec![0xA, 0xB]);

        // 队列恢复后直接写入又能发送
        assert_eq!(rx.try_iter().count(), 2);
        bus.driver().handle_interrupt();
        let c = CanFrame::new_standard(0xC, &[]);
        assert_eq!(bus.write(c, Duration::ZERO).unwrap(), WriteOutcome::Sent);
    }

    #[test]
    fn test_send_next_queued_waits_for_in_flight() {
        let (bus, sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        bus.write(CanFrame::new_standard(0x1, &[]), Duration::ZERO).unwrap();
        bus.write(CanFrame::new_standard(0x2, &[]), Duration::ZERO).unwrap();

        assert!(bus.driver().send_next_queued().is_none());
        assert_eq!(bus.driver().tx_queue_len(), 1);
        bus.tick(Instant::now());
        assert_eq!(bus.driver().tx_queue_len(), 1);
        assert!(sim.tx_busy());
    }

    #[test]
    fn test_status_report() {
        let (bus, _sim, _log, _rx) = setup(BusConfig::default());
        bus.start(BusMode::Active, BusSpeed::K500).unwrap();
        let report = bus.status_report();
        assert!(report.contains("can1"));
        assert!(report.contains("Active"));
        assert!(report.contains("500kbps"));
    }
}
