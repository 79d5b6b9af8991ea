//! 总线状态计数器
//!
//! 原子计数器，中断上下文（BusDriver）和分发线程（Bus）都可以无锁更新，
//! 任何线程都可以读取快照。

use canbus_protocol::BusStatus;
use std::sync::atomic::{AtomicU32, Ordering};

/// 总线计数器
///
/// 与 [`BusStatus`] 字段一一对应。
#[derive(Debug, Default)]
pub struct BusCounters {
    pub interrupts: AtomicU32,
    pub packets_rx: AtomicU32,
    pub packets_tx: AtomicU32,
    pub txbuf_delay: AtomicU32,
    pub rxbuf_overflow: AtomicU32,
    pub txbuf_overflow: AtomicU32,
    pub error_flags: AtomicU32,
    pub errors_rx: AtomicU32,
    pub errors_tx: AtomicU32,
    pub watchdog_resets: AtomicU32,
    pub error_resets: AtomicU32,
    pub errata_fixes: AtomicU32,
    pub invalid_frames: AtomicU32,
    pub dispatch_overflow: AtomicU32,
}

/// 计数器加一
#[inline]
pub(crate) fn bump(counter: &AtomicU32) {
    counter.fetch_add(1, Ordering::Relaxed);
}

impl BusCounters {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取快照
    ///
    /// 不同计数器之间可能有微小的时间差，不影响监控用途。
    pub fn snapshot(&self) -> BusStatus {
        BusStatus {
            interrupts: self.interrupts.load(Ordering::Relaxed),
            packets_rx: self.packets_rx.load(Ordering::Relaxed),
            packets_tx: self.packets_tx.load(Ordering::Relaxed),
            txbuf_delay: self.txbuf_delay.load(Ordering::Relaxed),
            rxbuf_overflow: self.rxbuf_overflow.load(Ordering::Relaxed),
            txbuf_overflow: self.txbuf_overflow.load(Ordering::Relaxed),
            error_flags: self.error_flags.load(Ordering::Relaxed),
            errors_rx: self.errors_rx.load(Ordering::Relaxed),
            errors_tx: self.errors_tx.load(Ordering::Relaxed),
            watchdog_resets: self.watchdog_resets.load(Ordering::Relaxed),
            error_resets: self.error_resets.load(Ordering::Relaxed),
            errata_fixes: self.errata_fixes.load(Ordering::Relaxed),
            invalid_frames: self.invalid_frames.load(Ordering::Relaxed),
            dispatch_overflow: self.dispatch_overflow.load(Ordering::Relaxed),
        }
    }

    /// 用快照覆盖所有计数器（看门狗重启后恢复统计）
    pub fn restore(&self, status: &BusStatus) {
        self.interrupts.store(status.interrupts, Ordering::Relaxed);
        self.packets_rx.store(status.packets_rx, Ordering::Relaxed);
        self.packets_tx.store(status.packets_tx, Ordering::Relaxed);
        self.txbuf_delay.store(status.txbuf_delay, Ordering::Relaxed);
        self.rxbuf_overflow.store(status.rxbuf_overflow, Ordering::Relaxed);
        self.txbuf_overflow.store(status.txbuf_overflow, Ordering::Relaxed);
        self.error_flags.store(status.error_flags, Ordering::Relaxed);
        self.errors_rx.store(status.errors_rx, Ordering::Relaxed);
        self.errors_tx.store(status.errors_tx, Ordering::Relaxed);
        self.watchdog_resets.store(status.watchdog_resets, Ordering::Relaxed);
        self.error_resets.store(status.error_resets, Ordering::Relaxed);
        self.errata_fixes.store(status.errata_fixes, Ordering::Relaxed);
        self.invalid_frames.store(status.invalid_frames, Ordering::Relaxed);
        self.dispatch_overflow.store(status.dispatch_overflow, Ordering::Relaxed);
    }

    /// 清零
    pub fn reset(&self) {
        self.restore(&BusStatus::default());
    }
}
