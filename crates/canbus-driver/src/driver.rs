//! 控制器驱动层
//!
//! `BusDriver` 负责中断服务、帧提取、发送和控制器恢复：
//!
//! - 中断处理在一个短临界区内完成，只读写寄存器，把结果收集成
//!   [`DispatchMessage`]，出临界区后再非阻塞地投递给分发器
//! - 发送与"下一帧装载"、验收过滤器修改由 `write_lock` 串行化
//! - 延迟发送队列（硬件缓冲忙时排队）由驱动持有
//!
//! 临界区不做任何可能阻塞的操作，分发队列满时直接丢弃并计数。

use crate::controller::{AcceptanceFilter, CanController, RMC_SATURATED};
use crate::dispatch::DispatchMessage;
use crate::error::DriverError;
use crate::metrics::{BusCounters, bump};
use crate::mode::{BusMode, BusSpeed};
use canbus_protocol::status::{irq, sr};
use canbus_protocol::{CanFrame, ErrorFlags};
use crossbeam_channel::{Receiver, SendTimeoutError, Sender, TrySendError, bounded};
use parking_lot::{Mutex, MutexGuard};
use smallvec::SmallVec;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, trace, warn};

/// 模式切换确认的查询次数
const MODE_CHANGE_ATTEMPTS: u32 = 10;

/// 模式切换查询间隔（总计约 50µs）
const MODE_CHANGE_POLL: Duration = Duration::from_micros(5);

/// 单次中断服务最多提取的帧数（FIFO 深度加余量）
const MAX_EXTRACT_PER_PASS: usize = 2 * RMC_SATURATED as usize;

/// 驱动配置
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DriverConfig {
    /// 延迟发送队列容量（帧）
    pub tx_queue_size: usize,
    /// 错误警告持续多久没有收发进展就强制复位
    pub stuck_timeout: Duration,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            tx_queue_size: 30,
            stuck_timeout: Duration::from_secs(10),
        }
    }
}

/// 临界区保护的硬件状态
struct Hardware {
    controller: Box<dyn CanController>,
    /// 正在发送的帧
    tx_frame: Option<CanFrame>,
    /// 当前发送已请求中止
    abort_requested: bool,
    /// 上次上报的错误标志
    last_error_flags: u32,
    /// 错误警告开始的时间和当时的收发计数
    warning_since: Option<(Instant, u32)>,
}

impl Hardware {
    /// 请求模式切换并等待生效
    fn enter_reset_mode(&mut self, reset: bool) -> bool {
        self.controller.set_reset_mode(reset);
        for _ in 0..MODE_CHANGE_ATTEMPTS {
            if self.controller.in_reset_mode() == reset {
                return true;
            }
            spin_sleep::sleep(MODE_CHANGE_POLL);
        }
        self.controller.in_reset_mode() == reset
    }

    /// 通过 TEC 写 255 再写 0 清除 REC
    ///
    /// 控制器在 bus-off 时可能保留非零 REC，导致无法恢复。
    fn clear_rx_error_counter(&mut self) {
        let listen = self.controller.listen_only();
        self.controller.set_reset_mode(true);
        self.controller.set_listen_only(true);
        self.controller.set_tx_error_counter(u8::MAX);
        self.controller.set_tx_error_counter(0);
        self.controller.set_listen_only(listen);
        self.controller.set_reset_mode(false);
    }
}

/// 控制器驱动
pub struct BusDriver {
    bus: u8,
    hw: Mutex<Hardware>,
    write_lock: Mutex<()>,
    tx_in_flight: AtomicBool,
    counters: Arc<BusCounters>,
    inbound: Sender<DispatchMessage>,
    tx_queue_tx: Sender<CanFrame>,
    tx_queue_rx: Receiver<CanFrame>,
    stuck_timeout: Duration,
}

impl BusDriver {
    pub fn new(
        bus: u8,
        controller: Box<dyn CanController>,
        counters: Arc<BusCounters>,
        inbound: Sender<DispatchMessage>,
        config: DriverConfig,
    ) -> Self {
        let (tx_queue_tx, tx_queue_rx) = bounded(config.tx_queue_size.max(1));
        Self {
            bus,
            hw: Mutex::new(Hardware {
                controller,
                tx_frame: None,
                abort_requested: false,
                last_error_flags: 0,
                warning_since: None,
            }),
            write_lock: Mutex::new(()),
            tx_in_flight: AtomicBool::new(false),
            counters,
            inbound,
            tx_queue_tx,
            tx_queue_rx,
            stuck_timeout: config.stuck_timeout,
        }
    }

    pub fn bus(&self) -> u8 {
        self.bus
    }

    // ========================================================================
    // 启停
    // ========================================================================

    /// 配置并启动控制器
    pub fn start(&self, mode: BusMode, speed: BusSpeed) -> Result<(), DriverError> {
        let mut hw = self.hw.lock();
        hw.controller.set_powered(true);
        if !hw.enter_reset_mode(true) {
            return Err(DriverError::ModeChangeTimeout);
        }
        hw.controller.configure(speed)?;
        hw.controller.set_listen_only(mode == BusMode::Listen);
        hw.controller.set_tx_error_counter(0);
        hw.tx_frame = None;
        hw.abort_requested = false;
        hw.last_error_flags = 0;
        hw.warning_since = None;
        self.tx_in_flight.store(false, Ordering::Release);
        // 清掉复位期间残留的中断
        hw.controller.take_interrupts();
        if !hw.enter_reset_mode(false) {
            return Err(DriverError::ModeChangeTimeout);
        }
        debug!("can{}: controller started ({}, {})", self.bus, mode, speed);
        Ok(())
    }

    /// 停止控制器（进入复位模式并断电）
    pub fn stop(&self) {
        let mut hw = self.hw.lock();
        if !hw.enter_reset_mode(true) {
            warn!("can{}: controller did not enter reset mode on stop", self.bus);
        }
        hw.controller.set_powered(false);
        hw.tx_frame = None;
        hw.abort_requested = false;
        self.tx_in_flight.store(false, Ordering::Release);
        debug!("can{}: controller stopped", self.bus);
    }

    // ========================================================================
    // 中断服务
    // ========================================================================

    /// 服务一次中断
    ///
    /// 循环读取中断标志直到清零，返回投递给分发器的消息数。
    pub fn handle_interrupt(&self) -> usize {
        let mut outbox: SmallVec<[DispatchMessage; 16]> = SmallVec::new();
        {
            let mut hw = self.hw.lock();
            loop {
                let mut interrupts = hw.controller.take_interrupts();
                if interrupts == 0 {
                    break;
                }
                bump(&self.counters.interrupts);

                if interrupts & (irq::RX | irq::DATA_OVERRUN) != 0 {
                    interrupts |= self.extract_frames(&mut hw, &mut outbox);
                }

                if interrupts & irq::TX != 0 {
                    let success = !hw.abort_requested;
                    hw.abort_requested = false;
                    self.tx_in_flight.store(false, Ordering::Release);
                    if let Some(frame) = hw.tx_frame.take() {
                        outbox.push(DispatchMessage::TxComplete {
                            bus: self.bus,
                            frame,
                            success,
                        });
                    }
                }

                let errors = interrupts & irq::ERRORS;
                if errors != 0
                    && let Some(msg) = self.record_errors(&mut hw, errors)
                {
                    outbox.push(msg);
                }
            }
        }

        let delivered = outbox.len();
        for msg in outbox {
            self.post(msg);
        }
        delivered
    }

    /// 提取 FIFO 中所有帧
    ///
    /// 以状态寄存器为准循环（中断标志在排空前可能已被清除），
    /// 返回需要额外记录的错误中断位。
    fn extract_frames(
        &self,
        hw: &mut Hardware,
        outbox: &mut SmallVec<[DispatchMessage; 16]>,
    ) -> u8 {
        let mut errors = 0;
        for _ in 0..MAX_EXTRACT_PER_PASS {
            let status = hw.controller.status();
            if status & (sr::RX_BUFFER | sr::DATA_OVERRUN) == 0 {
                break;
            }
            let pending = hw.controller.rx_message_count();

            if pending >= RMC_SATURATED {
                // 控制器失去同步，只能复位
                hw.controller.set_reset_mode(true);
                hw.controller.set_reset_mode(false);
                bump(&self.counters.error_resets);
                errors |= irq::DATA_OVERRUN;
                warn!("can{}: rx message counter saturated, controller reset", self.bus);
            } else if status & sr::DATA_OVERRUN != 0 {
                // 溢出后 FIFO 内容不可信，全部丢弃
                hw.controller.clear_overrun();
                for _ in 0..pending {
                    hw.controller.release_rx();
                    bump(&self.counters.rxbuf_overflow);
                }
                errors |= irq::DATA_OVERRUN;
                trace!("can{}: rx overrun, discarded {} frames", self.bus, pending);
            } else {
                let window = hw.controller.read_rx();
                hw.controller.release_rx();
                match window.to_frame(self.bus) {
                    Some(frame) => outbox.push(DispatchMessage::Frame(frame)),
                    None => {
                        bump(&self.counters.invalid_frames);
                        trace!("can{}: dropped frame with DLC {}", self.bus, window.dlc);
                    },
                }
            }
        }
        errors
    }

    /// 记录错误状态，标志变化时返回上报消息
    fn record_errors(&self, hw: &mut Hardware, errors: u8) -> Option<DispatchMessage> {
        let status = hw.controller.status();
        let capture = hw.controller.take_error_capture();

        if status & sr::BUS_OFF != 0 && hw.controller.rx_error_counter() > 0 {
            hw.clear_rx_error_counter();
            bump(&self.counters.errata_fixes);
            debug!("can{}: cleared REC in bus-off state", self.bus);
        }

        let flags = ErrorFlags::compose(errors, status, capture);
        let rec = hw.controller.rx_error_counter();
        let tec = hw.controller.tx_error_counter();
        self.counters.error_flags.store(flags.0, Ordering::Relaxed);
        self.counters.errors_rx.store(rec as u32, Ordering::Relaxed);
        self.counters.errors_tx.store(tec as u32, Ordering::Relaxed);

        if flags.0 == hw.last_error_flags {
            return None;
        }
        hw.last_error_flags = flags.0;
        Some(DispatchMessage::ErrorReport(self.bus))
    }

    fn post(&self, msg: DispatchMessage) {
        match self.inbound.try_send(msg) {
            Ok(()) => {},
            Err(TrySendError::Full(_)) => bump(&self.counters.dispatch_overflow),
            Err(TrySendError::Disconnected(_)) => {
                trace!("can{}: dispatch channel closed", self.bus);
            },
        }
    }

    // ========================================================================
    // 发送
    // ========================================================================

    /// 发送互斥锁
    ///
    /// 持有期间不会有其他写入、下一帧装载或过滤器修改。
    pub fn write_guard(&self) -> MutexGuard<'_, ()> {
        self.write_lock.lock()
    }

    /// 直接写入硬件发送缓冲区
    ///
    /// 缓冲区忙（或有帧正在发送）时返回 `HardwareBusy`，调用方决定是否排队。
    pub fn write_frame(&self, frame: &CanFrame) -> Result<(), DriverError> {
        let mut hw = self.hw.lock();
        if self.tx_in_flight.load(Ordering::Acquire)
            || hw.controller.status() & sr::TX_BUFFER == 0
        {
            return Err(DriverError::HardwareBusy);
        }
        hw.controller.load_tx(frame);
        hw.tx_frame = Some(*frame);
        hw.abort_requested = false;
        self.tx_in_flight.store(true, Ordering::Release);
        hw.controller.request_tx();
        Ok(())
    }

    pub fn is_transmitting(&self) -> bool {
        self.tx_in_flight.load(Ordering::Acquire)
    }

    /// 中止正在进行的发送；完成中断会以失败上报
    pub fn abort_transmission(&self) -> bool {
        let mut hw = self.hw.lock();
        if !self.tx_in_flight.load(Ordering::Acquire) {
            return false;
        }
        hw.abort_requested = true;
        hw.controller.abort_tx();
        true
    }

    /// 放入延迟发送队列（不等待）；队列满时原样返回帧
    pub fn try_queue(&self, frame: CanFrame) -> Result<(), CanFrame> {
        self.tx_queue_tx.try_send(frame).map_err(|e| e.into_inner())
    }

    /// 放入延迟发送队列，最多等待 `max_wait`
    ///
    /// 调用方不能持有 `write_guard`，否则发送完成路径无法腾出队列空间。
    pub fn queue_timeout(&self, frame: CanFrame, max_wait: Duration) -> Result<(), CanFrame> {
        self.tx_queue_tx
            .send_timeout(frame, max_wait)
            .map_err(|e| match e {
                SendTimeoutError::Timeout(frame) | SendTimeoutError::Disconnected(frame) => frame,
            })
    }

    pub fn tx_queue_len(&self) -> usize {
        self.tx_queue_rx.len()
    }

    /// 清空延迟发送队列，返回丢弃的帧数
    pub fn purge_tx_queue(&self) -> usize {
        let _guard = self.write_lock.lock();
        self.tx_queue_rx.try_iter().count()
    }

    /// 发送完成后装载队列中的下一帧
    ///
    /// 成功返回装载的帧。已有帧在发送时不出队，直接返回 `None`。
    /// 硬件意外忙时该帧作为发送失败上报，继续尝试后续帧，避免队列卡住。
    pub fn send_next_queued(&self) -> Option<CanFrame> {
        let _guard = self.write_lock.lock();
        if self.tx_in_flight.load(Ordering::Acquire) {
            return None;
        }
        while let Ok(frame) = self.tx_queue_rx.try_recv() {
            match self.write_frame(&frame) {
                Ok(()) => return Some(frame),
                Err(e) => {
                    error!("can{}: failed to load queued frame: {}", self.bus, e);
                    self.post(DispatchMessage::TxFailed {
                        bus: self.bus,
                        frame,
                    });
                },
            }
        }
        None
    }

    // ========================================================================
    // 配置与恢复
    // ========================================================================

    /// 修改硬件验收过滤器
    ///
    /// 需要短暂进入复位模式；复位模式未在约 50µs 内生效则放弃修改。
    /// 复位会丢弃正在进行的发送，按失败上报。
    pub fn set_acceptance_filter(&self, filter: &AcceptanceFilter) -> Result<(), DriverError> {
        let _guard = self.write_lock.lock();
        let aborted = {
            let mut hw = self.hw.lock();
            let was_reset = hw.controller.in_reset_mode();
            if !hw.enter_reset_mode(true) {
                hw.controller.set_reset_mode(was_reset);
                warn!("can{}: acceptance filter not applied, reset mode timeout", self.bus);
                return Err(DriverError::ModeChangeTimeout);
            }
            hw.controller.set_acceptance_filter(filter);
            let aborted = self.take_in_flight(&mut hw);
            if !hw.enter_reset_mode(was_reset) {
                return Err(DriverError::ModeChangeTimeout);
            }
            aborted
        };
        if let Some(frame) = aborted {
            self.post(DispatchMessage::TxComplete {
                bus: self.bus,
                frame,
                success: false,
            });
        }
        debug!(
            "can{}: acceptance filter {:?} mask={:08X} code={:08X}",
            self.bus, filter.mode, filter.mask, filter.code
        );
        Ok(())
    }

    /// 错误警告状态卡住检测
    ///
    /// 错误警告持续 `stuck_timeout` 且期间没有任何收发进展时完整复位控制器，
    /// 返回是否执行了复位。
    pub fn health_check(&self, now: Instant) -> bool {
        let progress = {
            let snap = self.counters.snapshot();
            snap.packets_rx.wrapping_add(snap.packets_tx)
        };
        let aborted = {
            let mut hw = self.hw.lock();
            if hw.controller.status() & sr::ERROR_STATUS == 0 {
                hw.warning_since = None;
                return false;
            }
            match hw.warning_since {
                Some((since, seen)) if seen == progress => {
                    if now.saturating_duration_since(since) < self.stuck_timeout {
                        return false;
                    }
                },
                _ => {
                    hw.warning_since = Some((now, progress));
                    return false;
                },
            }

            hw.warning_since = None;
            hw.last_error_flags = 0;
            hw.clear_rx_error_counter();
            self.take_in_flight(&mut hw)
        };

        bump(&self.counters.error_resets);
        error!(
            "can{}: stuck in error state for {:?}, controller reset",
            self.bus, self.stuck_timeout
        );
        if let Some(frame) = aborted {
            self.post(DispatchMessage::TxComplete {
                bus: self.bus,
                frame,
                success: false,
            });
        }
        true
    }

    fn take_in_flight(&self, hw: &mut Hardware) -> Option<CanFrame> {
        if self.tx_in_flight.swap(false, Ordering::AcqRel) {
            hw.abort_requested = false;
            hw.tx_frame.take()
        } else {
            None
        }
    }
}
