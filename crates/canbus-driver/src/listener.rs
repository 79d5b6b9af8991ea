//! 帧监听队列
//!
//! 监听者提供一个 crossbeam `Sender`，分发线程把收到的帧（以及可选的发送完成帧）
//! 非阻塞地投递进去。队列满时丢弃并计数，不会阻塞分发。

use arc_swap::ArcSwap;
use canbus_protocol::CanFrame;
use crossbeam_channel::{Sender, TrySendError};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Clone)]
struct Listener {
    sender: Sender<CanFrame>,
    tx_feedback: bool,
}

/// 监听队列集合
pub struct ListenerSet {
    write: Mutex<()>,
    listeners: ArcSwap<Vec<Listener>>,
    dropped: AtomicU64,
}

impl Default for ListenerSet {
    fn default() -> Self {
        Self::new()
    }
}

impl ListenerSet {
    pub fn new() -> Self {
        Self {
            write: Mutex::new(()),
            listeners: ArcSwap::from_pointee(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    /// 注册监听队列
    ///
    /// `tx_feedback = true` 时发送成功的帧也会投递。同一个队列重复注册只更新标志。
    pub fn register(&self, sender: Sender<CanFrame>, tx_feedback: bool) {
        let _guard = self.write.lock();
        let mut listeners = (**self.listeners.load()).clone();
        match listeners.iter_mut().find(|l| l.sender.same_channel(&sender)) {
            Some(existing) => existing.tx_feedback = tx_feedback,
            None => listeners.push(Listener {
                sender,
                tx_feedback,
            }),
        }
        self.listeners.store(Arc::new(listeners));
    }

    /// 注销监听队列；未注册时返回 false
    pub fn deregister(&self, sender: &Sender<CanFrame>) -> bool {
        let _guard = self.write.lock();
        let mut listeners = (**self.listeners.load()).clone();
        let before = listeners.len();
        listeners.retain(|l| !l.sender.same_channel(sender));
        let removed = listeners.len() != before;
        self.listeners.store(Arc::new(listeners));
        removed
    }

    /// 投递一帧
    ///
    /// `tx = true` 表示这是发送完成的帧，只投递给要求 TX 反馈的监听者。
    /// 已断开的队列自动移除。
    pub fn notify(&self, frame: &CanFrame, tx: bool) {
        let mut disconnected = Vec::new();
        for listener in self.listeners.load().iter() {
            if tx && !listener.tx_feedback {
                continue;
            }
            match listener.sender.try_send(*frame) {
                Ok(()) => {},
                Err(TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                },
                Err(TrySendError::Disconnected(_)) => disconnected.push(listener.sender.clone()),
            }
        }
        for sender in &disconnected {
            self.deregister(sender);
        }
    }

    /// 因队列满被丢弃的帧数
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn len(&self) -> usize {
        self.listeners.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::bounded;

    #[test]
    fn test_rx_and_tx_feedback() {
        let set = ListenerSet::new();
        let (rx_only, rx_only_q) = bounded(8);
        let (with_tx, with_tx_q) = bounded(8);
        set.register(rx_only, false);
        set.register(with_tx, true);

        let frame = CanFrame::new_standard(0x100, &[1]);
        set.notify(&frame, false);
        set.notify(&frame, true);

        assert_eq!(rx_only_q.len(), 1);
        assert_eq!(with_tx_q.len(), 2);
    }

    #[test]
    fn test_reregister_updates_flag() {
        let set = ListenerSet::new();
        let (tx, rx) = bounded(8);
        set.register(tx.clone(), false);
        set.register(tx.clone(), true);
        assert_eq!(set.len(), 1);

        set.notify(&CanFrame::default(), true);
        assert_eq!(rx.len(), 1);

        assert!(set.deregister(&tx));
        assert!(!set.deregister(&tx));
    }

    #[test]
    fn test_full_queue_drops() {
        let set = ListenerSet::new();
        let (tx, rx) = bounded(1);
        set.register(tx, false);

        for _ in 0..3 {
            set.notify(&CanFrame::default(), false);
        }
        assert_eq!(rx.len(), 1);
        assert_eq!(set.dropped(), 2);
    }

    #[test]
    fn test_disconnected_listener_removed() {
        let set = ListenerSet::new();
        let (tx, rx) = bounded(1);
        set.register(tx, false);
        drop(rx);

        set.notify(&CanFrame::default(), false);
        assert!(set.is_empty());
    }
}
