//! 日志 / 回放注册表
//!
//! 分发器持有一个 `Registry<dyn Loggable>`，每条总线持有它的 `Arc`，这样
//! Bus 可以直接把状态和 TX 事件写入所有日志，不需要反向引用分发器。
//! 读路径（每帧扇出）只加载 `ArcSwap` 快照。

use arc_swap::ArcSwap;
use canbus_protocol::{BusStatus, CanFrame, LogType};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Instant;

/// 可接收日志条目的对象（Logger 实现）
pub trait Loggable: Send + Sync {
    /// 帧事件（RX / TX / TX_Queue / TX_Fail），总线号取自 `frame.origin`
    fn log_frame(&self, kind: LogType, frame: &CanFrame);

    /// 状态快照（Error / Status）
    fn log_status(&self, bus: u8, kind: LogType, status: &BusStatus);

    /// 文本条目（Comment / Info / Event / Metric）
    fn log_info(&self, bus: u8, kind: LogType, text: &str);

    fn is_open(&self) -> bool;

    /// 关闭：停止接收条目、刷新已排队的条目、释放传输
    fn close(&self);

    /// 一行描述（类型、路径、过滤器）
    fn info(&self) -> String;

    /// 一行统计
    fn stats(&self) -> String;

    /// 周期维护（空闲连接过期等）
    fn tick(&self, now: Instant) {
        let _ = now;
    }
}

/// 回放器：从日志源读取帧，按服务模式注入或发送
pub trait Player: Send + Sync {
    fn is_open(&self) -> bool;

    fn close(&self);

    fn info(&self) -> String;

    /// 一行统计
    fn stats(&self) -> String {
        String::new()
    }

    /// 回放速度倍数（0 表示不按时间戳节奏，尽快回放）
    fn set_speed(&self, speed: u32) {
        let _ = speed;
    }
}

/// 带编号的共享注册表
///
/// 编号从 1 开始递增，不复用。
pub struct Registry<T: ?Sized> {
    entries: ArcSwap<Vec<(u32, Arc<T>)>>,
    next_id: AtomicU32,
    write: Mutex<()>,
}

impl<T: ?Sized> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: ?Sized> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: ArcSwap::from_pointee(Vec::new()),
            next_id: AtomicU32::new(1),
            write: Mutex::new(()),
        }
    }

    /// 加入注册表，返回编号
    pub fn add(&self, item: Arc<T>) -> u32 {
        let _guard = self.write.lock();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let mut entries = self.cloned();
        entries.push((id, item));
        self.entries.store(Arc::new(entries));
        id
    }

    pub fn get(&self, id: u32) -> Option<Arc<T>> {
        self.entries
            .load()
            .iter()
            .find(|(entry_id, _)| *entry_id == id)
            .map(|(_, item)| item.clone())
    }

    /// 从注册表移除（不关闭）
    pub fn remove(&self, id: u32) -> Option<Arc<T>> {
        let _guard = self.write.lock();
        let mut entries = self.cloned();
        let index = entries.iter().position(|(entry_id, _)| *entry_id == id)?;
        let (_, item) = entries.remove(index);
        self.entries.store(Arc::new(entries));
        Some(item)
    }

    /// 移除全部
    pub fn drain(&self) -> Vec<(u32, Arc<T>)> {
        let _guard = self.write.lock();
        let entries = self.cloned();
        self.entries.store(Arc::new(Vec::new()));
        entries
    }

    /// 当前内容的快照
    pub fn snapshot(&self) -> Arc<Vec<(u32, Arc<T>)>> {
        self.entries.load_full()
    }

    pub fn len(&self) -> usize {
        self.entries.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn cloned(&self) -> Vec<(u32, Arc<T>)> {
        self.entries
            .load()
            .iter()
            .map(|(id, item)| (*id, item.clone()))
            .collect()
    }
}

// ============================================================================
// 日志扇出
// ============================================================================

impl Registry<dyn Loggable> {
    pub fn log_frame(&self, kind: LogType, frame: &CanFrame) {
        for (_, logger) in self.entries.load().iter() {
            logger.log_frame(kind, frame);
        }
    }

    pub fn log_status(&self, bus: u8, kind: LogType, status: &BusStatus) {
        for (_, logger) in self.entries.load().iter() {
            logger.log_status(bus, kind, status);
        }
    }

    pub fn log_info(&self, bus: u8, kind: LogType, text: &str) {
        for (_, logger) in self.entries.load().iter() {
            logger.log_info(bus, kind, text);
        }
    }

    pub fn tick(&self, now: Instant) {
        for (_, logger) in self.entries.load().iter() {
            logger.tick(now);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// 记录所有条目的测试日志
    #[derive(Default)]
    pub(crate) struct MemoryLog {
        pub(crate) entries: Mutex<Vec<(LogType, u8, String)>>,
        pub(crate) closed: std::sync::atomic::AtomicBool,
    }

    impl MemoryLog {
        pub(crate) fn kinds(&self) -> Vec<LogType> {
            self.entries.lock().iter().map(|(kind, _, _)| *kind).collect()
        }

        pub(crate) fn count(&self, kind: LogType) -> usize {
            self.entries.lock().iter().filter(|(k, _, _)| *k == kind).count()
        }
    }

    impl Loggable for MemoryLog {
        fn log_frame(&self, kind: LogType, frame: &CanFrame) {
            self.entries
                .lock()
                .push((kind, frame.origin, format!("{:X}", frame.id)));
        }

        fn log_status(&self, bus: u8, kind: LogType, status: &BusStatus) {
            self.entries
                .lock()
                .push((kind, bus, format!("{:08X}", status.error_flags)));
        }

        fn log_info(&self, bus: u8, kind: LogType, text: &str) {
            self.entries.lock().push((kind, bus, text.to_string()));
        }

        fn is_open(&self) -> bool {
            !self.closed.load(Ordering::Relaxed)
        }

        fn close(&self) {
            self.closed.store(true, Ordering::Relaxed);
        }

        fn info(&self) -> String {
            "Type:memory".to_string()
        }

        fn stats(&self) -> String {
            format!("Entries: {}", self.entries.lock().len())
        }
    }

    #[test]
    fn test_ids_start_at_one_and_are_not_reused() {
        let registry: Registry<dyn Loggable> = Registry::new();
        let a = registry.add(Arc::new(MemoryLog::default()));
        let b = registry.add(Arc::new(MemoryLog::default()));
        assert_eq!((a, b), (1, 2));

        assert!(registry.remove(a).is_some());
        assert!(registry.remove(a).is_none());
        let c = registry.add(Arc::new(MemoryLog::default()));
        assert_eq!(c, 3);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_fanout_reaches_every_logger() {
        let registry: Registry<dyn Loggable> = Registry::new();
        let first = Arc::new(MemoryLog::default());
        let second = Arc::new(MemoryLog::default());
        registry.add(first.clone());
        registry.add(second.clone());

        let frame = CanFrame::new_standard(0x123, &[1]).with_origin(1);
        registry.log_frame(LogType::Rx, &frame);
        registry.log_info(0, LogType::Event, "vehicle.on");

        assert_eq!(first.kinds(), vec![LogType::Rx, LogType::Event]);
        assert_eq!(second.kinds(), vec![LogType::Rx, LogType::Event]);
    }

    #[test]
    fn test_drain() {
        let registry: Registry<dyn Loggable> = Registry::new();
        registry.add(Arc::new(MemoryLog::default()));
        registry.add(Arc::new(MemoryLog::default()));

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert!(registry.is_empty());
    }
}
