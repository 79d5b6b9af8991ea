//! 软件模拟的 CAN 控制器
//!
//! 行为贴近 SJA1000：64 帧 RX FIFO、数据溢出、RMC 饱和、TEC/REC、
//! 复位模式清空收发缓冲。`SimController` 是可克隆的句柄，一份交给 BusDriver，
//! 另一份留给测试 / CLI 注入帧、制造错误、观察发送结果。
//!
//! 中断只置标志位，不会主动调用驱动；由调用方服务中断
//! （`Bus::service_interrupt` 或 `DispatchMessage::InterruptPending`）。

use crate::controller::{AcceptanceFilter, CanController, RMC_SATURATED, RxWindow};
use crate::error::DriverError;
use crate::mode::BusSpeed;
use canbus_protocol::CanFrame;
use canbus_protocol::status::{irq, sr};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

/// RX FIFO 深度（帧）
pub const SIM_FIFO_DEPTH: usize = 64;

/// 错误警告阈值
const WARNING_LIMIT: u8 = 96;

#[derive(Debug)]
struct SimState {
    ir: u8,
    ecc: u8,
    fifo: VecDeque<RxWindow>,
    overrun: bool,
    rmc_saturated: bool,
    rec: u8,
    tec: u8,
    bus_off: bool,
    forced_warning: bool,
    reset: bool,
    reset_delay: u32,
    reset_pending: Option<(bool, u32)>,
    stuck: bool,
    listen_only: bool,
    speed: Option<BusSpeed>,
    acceptance: AcceptanceFilter,
    tx_buffer: Option<CanFrame>,
    tx_busy: bool,
    auto_complete: bool,
    transmitted: Vec<CanFrame>,
    reset_entries: u32,
    powered: bool,
}

impl Default for SimState {
    fn default() -> Self {
        Self {
            ir: 0,
            ecc: 0,
            fifo: VecDeque::with_capacity(SIM_FIFO_DEPTH),
            overrun: false,
            rmc_saturated: false,
            rec: 0,
            tec: 0,
            bus_off: false,
            forced_warning: false,
            // 上电默认处于复位模式
            reset: true,
            reset_delay: 0,
            reset_pending: None,
            stuck: false,
            listen_only: false,
            speed: None,
            acceptance: AcceptanceFilter::accept_all(),
            tx_buffer: None,
            tx_busy: false,
            auto_complete: false,
            transmitted: Vec::new(),
            reset_entries: 0,
            powered: false,
        }
    }
}

impl SimState {
    fn apply_reset(&mut self, reset: bool) {
        if reset && !self.reset {
            self.reset_entries += 1;
            self.fifo.clear();
            self.overrun = false;
            self.rmc_saturated = false;
            self.tx_busy = false;
            self.forced_warning = false;
        }
        self.reset = reset;
    }

    fn complete_tx(&mut self) -> bool {
        if !self.tx_busy {
            return false;
        }
        if let Some(frame) = self.tx_buffer {
            self.transmitted.push(frame);
        }
        self.tx_busy = false;
        self.ir |= irq::TX;
        true
    }
}

/// 模拟控制器句柄
#[derive(Debug, Clone, Default)]
pub struct SimController {
    state: Arc<Mutex<SimState>>,
}

impl SimController {
    pub fn new() -> Self {
        Self::default()
    }

    /// 发送请求立即完成（不需要手动 `complete_tx`）
    pub fn with_auto_complete(self, enabled: bool) -> Self {
        self.state.lock().auto_complete = enabled;
        self
    }

    // ========================================================================
    // 接收侧
    // ========================================================================

    /// 线上出现一帧
    ///
    /// 返回 false 表示没有进入 FIFO（复位模式 / 被验收过滤器拒绝 / 断电）。
    /// FIFO 满时置数据溢出。
    pub fn inject_rx(&self, frame: &CanFrame) -> bool {
        self.inject_window(RxWindow::from_frame(frame))
    }

    /// 注入原始接收窗口（可构造 DLC > 8 的非法帧）
    pub fn inject_window(&self, window: RxWindow) -> bool {
        let mut state = self.state.lock();
        if state.reset || !state.powered || !state.acceptance.accepts(&window) {
            return false;
        }
        if state.fifo.len() >= SIM_FIFO_DEPTH {
            state.overrun = true;
            state.ir |= irq::DATA_OVERRUN;
            return false;
        }
        state.fifo.push_back(window);
        state.ir |= irq::RX;
        true
    }

    /// 制造数据溢出：FIFO 中留下 `backlog` 帧无效数据
    pub fn force_overrun(&self, backlog: usize) {
        let mut state = self.state.lock();
        for _ in 0..backlog.min(SIM_FIFO_DEPTH) {
            state.fifo.push_back(RxWindow::default());
        }
        state.overrun = true;
        state.ir |= irq::DATA_OVERRUN;
    }

    /// 制造 RMC 饱和（控制器失去同步，只能复位）
    pub fn saturate_rx_counter(&self) {
        let mut state = self.state.lock();
        while state.fifo.len() < SIM_FIFO_DEPTH {
            state.fifo.push_back(RxWindow::default());
        }
        state.rmc_saturated = true;
        state.ir |= irq::RX;
    }

    pub fn rx_pending(&self) -> usize {
        self.state.lock().fifo.len()
    }

    // ========================================================================
    // 发送侧
    // ========================================================================

    /// 完成当前发送；没有发送在进行时返回 false
    pub fn complete_tx(&self) -> bool {
        self.state.lock().complete_tx()
    }

    pub fn tx_busy(&self) -> bool {
        self.state.lock().tx_busy
    }

    /// 已经发到线上的帧
    pub fn transmitted(&self) -> Vec<CanFrame> {
        self.state.lock().transmitted.clone()
    }

    // ========================================================================
    // 错误注入
    // ========================================================================

    pub fn set_error_counters(&self, rec: u8, tec: u8) {
        let mut state = self.state.lock();
        state.rec = rec;
        state.tec = tec;
    }

    /// 置中断位并写入错误捕获码
    pub fn raise_error(&self, interrupts: u8, capture: u8) {
        let mut state = self.state.lock();
        state.ir |= interrupts & irq::ERRORS;
        state.ecc = capture;
    }

    /// 强制错误警告状态，直到下一次进入复位模式
    pub fn set_error_warning(&self, on: bool) {
        self.state.lock().forced_warning = on;
    }

    pub fn set_bus_off(&self, on: bool) {
        self.state.lock().bus_off = on;
    }

    // ========================================================================
    // 模式切换行为
    // ========================================================================

    /// 模式切换请求在 `polls` 次查询后才生效
    pub fn set_reset_delay(&self, polls: u32) {
        self.state.lock().reset_delay = polls;
    }

    /// 模式切换请求永远不生效
    pub fn set_stuck(&self, stuck: bool) {
        self.state.lock().stuck = stuck;
    }

    /// 进入复位模式的累计次数
    pub fn reset_entries(&self) -> u32 {
        self.state.lock().reset_entries
    }

    pub fn acceptance(&self) -> AcceptanceFilter {
        self.state.lock().acceptance
    }

    pub fn is_powered(&self) -> bool {
        self.state.lock().powered
    }

    pub fn is_listen_only(&self) -> bool {
        self.state.lock().listen_only
    }

    pub fn speed(&self) -> Option<BusSpeed> {
        self.state.lock().speed
    }
}

impl CanController for SimController {
    fn take_interrupts(&mut self) -> u8 {
        std::mem::take(&mut self.state.lock().ir)
    }

    fn status(&mut self) -> u8 {
        let state = self.state.lock();
        let mut status = 0;
        if !state.fifo.is_empty() {
            status |= sr::RX_BUFFER;
        }
        if state.overrun {
            status |= sr::DATA_OVERRUN;
        }
        if !state.tx_busy {
            status |= sr::TX_BUFFER | sr::TX_COMPLETE;
        } else {
            status |= sr::TRANSMITTING;
        }
        if state.forced_warning || state.rec >= WARNING_LIMIT || state.tec >= WARNING_LIMIT {
            status |= sr::ERROR_STATUS;
        }
        if state.bus_off {
            status |= sr::BUS_OFF;
        }
        status
    }

    fn rx_message_count(&mut self) -> u8 {
        let state = self.state.lock();
        if state.rmc_saturated {
            RMC_SATURATED
        } else {
            state.fifo.len().min(RMC_SATURATED as usize) as u8
        }
    }

    fn read_rx(&mut self) -> RxWindow {
        self.state.lock().fifo.front().copied().unwrap_or_default()
    }

    fn release_rx(&mut self) {
        self.state.lock().fifo.pop_front();
    }

    fn clear_overrun(&mut self) {
        self.state.lock().overrun = false;
    }

    fn take_error_capture(&mut self) -> u8 {
        std::mem::take(&mut self.state.lock().ecc)
    }

    fn rx_error_counter(&mut self) -> u8 {
        self.state.lock().rec
    }

    fn tx_error_counter(&mut self) -> u8 {
        self.state.lock().tec
    }

    fn set_tx_error_counter(&mut self, value: u8) {
        let mut state = self.state.lock();
        if !state.reset {
            return;
        }
        state.tec = value;
        // 写 255 强制进入 bus-off，同时清零 REC；再写其他值退出 bus-off
        if value == u8::MAX {
            state.rec = 0;
            state.bus_off = true;
        } else {
            state.bus_off = false;
        }
    }

    fn set_reset_mode(&mut self, reset: bool) {
        let mut state = self.state.lock();
        if state.stuck {
            return;
        }
        if state.reset_delay == 0 {
            state.apply_reset(reset);
        } else {
            let delay = state.reset_delay;
            state.reset_pending = Some((reset, delay));
        }
    }

    fn in_reset_mode(&mut self) -> bool {
        let mut state = self.state.lock();
        if let Some((target, polls)) = state.reset_pending {
            if polls <= 1 {
                state.reset_pending = None;
                state.apply_reset(target);
            } else {
                state.reset_pending = Some((target, polls - 1));
            }
        }
        state.reset
    }

    fn set_listen_only(&mut self, listen: bool) {
        let mut state = self.state.lock();
        if state.reset {
            state.listen_only = listen;
        }
    }

    fn listen_only(&mut self) -> bool {
        self.state.lock().listen_only
    }

    fn configure(&mut self, speed: BusSpeed) -> Result<(), DriverError> {
        if matches!(speed, BusSpeed::K33_3 | BusSpeed::K83_3) {
            return Err(DriverError::UnsupportedSpeed(speed));
        }
        self.state.lock().speed = Some(speed);
        Ok(())
    }

    fn set_acceptance_filter(&mut self, filter: &AcceptanceFilter) {
        let mut state = self.state.lock();
        if state.reset {
            state.acceptance = *filter;
        }
    }

    fn load_tx(&mut self, frame: &CanFrame) {
        let mut state = self.state.lock();
        if !state.tx_busy {
            state.tx_buffer = Some(*frame);
        }
    }

    fn request_tx(&mut self) {
        let mut state = self.state.lock();
        if state.reset || state.listen_only || state.tx_buffer.is_none() {
            return;
        }
        state.tx_busy = true;
        if state.auto_complete {
            state.complete_tx();
        }
    }

    fn abort_tx(&mut self) {
        let mut state = self.state.lock();
        if state.tx_busy {
            state.tx_busy = false;
            state.ir |= irq::TX;
        }
    }

    fn set_powered(&mut self, on: bool) {
        self.state.lock().powered = on;
    }
}
