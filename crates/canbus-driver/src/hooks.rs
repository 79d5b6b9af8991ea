//! 帧回调注册表
//!
//! 其他模块按调用方名字注册回调，接收帧 / 发送完成时在分发线程上同步调用。
//! 同一调用方重复注册会替换旧回调（并移到末尾）。
//!
//! 触发路径只读取一份 `ArcSwap` 快照，不持锁；回调里可以安全地注册或注销回调，
//! 修改只对下一帧生效。
//!
//! # 示例
//!
//! ```rust
//! use canbus_driver::hooks::{CallbackRegistry, FrameCallback};
//! use canbus_protocol::CanFrame;
//! use crossbeam_channel::{Sender, bounded};
//! use std::sync::Arc;
//!
//! struct Forward {
//!     sender: Sender<CanFrame>,
//! }
//!
//! impl FrameCallback for Forward {
//!     fn on_frame_received(&self, frame: &CanFrame) {
//!         let _ = self.sender.try_send(*frame);
//!     }
//! }
//!
//! let (tx, rx) = bounded(8);
//! let registry = CallbackRegistry::new();
//! registry.register("obd2", Arc::new(Forward { sender: tx }));
//! registry.trigger_received(&CanFrame::new_standard(0x7E8, &[0x02]));
//! assert_eq!(rx.len(), 1);
//! ```

use arc_swap::ArcSwap;
use canbus_protocol::CanFrame;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// 帧回调
///
/// 在分发线程上调用，实现应尽快返回；耗时处理请转发到自己的 channel。
pub trait FrameCallback: Send + Sync {
    /// 收到一帧
    fn on_frame_received(&self, frame: &CanFrame);

    /// 发送结束（`success = false` 表示发送被中止或失败）
    fn on_frame_sent(&self, frame: &CanFrame, success: bool) {
        let _ = (frame, success);
    }
}

#[derive(Default)]
struct Entries {
    next_seq: u64,
    by_caller: HashMap<String, u64>,
    ordered: BTreeMap<u64, Arc<dyn FrameCallback>>,
}

/// 按调用方名字索引的回调表
pub struct CallbackRegistry {
    entries: Mutex<Entries>,
    snapshot: ArcSwap<Vec<Arc<dyn FrameCallback>>>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Entries::default()),
            snapshot: ArcSwap::from_pointee(Vec::new()),
        }
    }

    /// 注册回调；同名调用方的旧回调被替换
    pub fn register(&self, caller: &str, callback: Arc<dyn FrameCallback>) {
        let mut entries = self.entries.lock();
        if let Some(seq) = entries.by_caller.remove(caller) {
            entries.ordered.remove(&seq);
        }
        let seq = entries.next_seq;
        entries.next_seq += 1;
        entries.by_caller.insert(caller.to_string(), seq);
        entries.ordered.insert(seq, callback);
        self.publish(&entries);
    }

    /// 注销回调；调用方不存在时返回 false
    pub fn deregister(&self, caller: &str) -> bool {
        let mut entries = self.entries.lock();
        let Some(seq) = entries.by_caller.remove(caller) else {
            return false;
        };
        entries.ordered.remove(&seq);
        self.publish(&entries);
        true
    }

    pub fn clear(&self) {
        let mut entries = self.entries.lock();
        *entries = Entries::default();
        self.publish(&entries);
    }

    pub fn len(&self) -> usize {
        self.snapshot.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 按注册顺序调用所有 `on_frame_received`
    pub fn trigger_received(&self, frame: &CanFrame) {
        for callback in self.snapshot.load().iter() {
            callback.on_frame_received(frame);
        }
    }

    /// 按注册顺序调用所有 `on_frame_sent`
    pub fn trigger_sent(&self, frame: &CanFrame, success: bool) {
        for callback in self.snapshot.load().iter() {
            callback.on_frame_sent(frame, success);
        }
    }

    fn publish(&self, entries: &Entries) {
        let callbacks: Vec<_> = entries.ordered.values().cloned().collect();
        self.snapshot.store(Arc::new(callbacks));
    }
}
