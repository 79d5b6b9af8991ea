//! 系统事件总线
//!
//! 最小的发布 / 订阅实现：日志订阅网络、存储、配置变化事件，以及事件 / 指标转发。
//! 处理函数在发布者线程上同步执行；订阅表的锁不会在执行处理函数时持有，
//! 处理函数里可以再订阅或发布。
//!
//! 约定的事件名：
//!
//! | 名称 | 含义 |
//! |---|---|
//! | `network.up` / `network.down` | 网络可用性变化 |
//! | `sd.mounted` / `sd.unmounting` | 可移动存储挂载状态 |
//! | `config.changed` | 配置变化，payload 为配置命名空间 |
//! | `metric.<name>` | 指标变化，payload 为新值 |

use canbus_protocol::NameFilter;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tracing::{trace, warn};

pub const NETWORK_UP: &str = "network.up";
pub const NETWORK_DOWN: &str = "network.down";
pub const SD_MOUNTED: &str = "sd.mounted";
pub const SD_UNMOUNTING: &str = "sd.unmounting";
pub const CONFIG_CHANGED: &str = "config.changed";
pub const METRIC_PREFIX: &str = "metric.";

/// 一条事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub payload: String,
}

/// 订阅编号
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

struct Subscription {
    id: u64,
    pattern: NameFilter,
    handler: Handler,
}

/// 事件总线
///
/// 同时维护主机状态（网络是否可用、存储是否挂载），状态在处理函数执行前更新。
pub struct EventBus {
    subscriptions: Mutex<Vec<Subscription>>,
    next_id: AtomicU64,
    network_up: AtomicBool,
    removable_mounted: AtomicBool,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    /// 初始状态：网络不可用、存储未挂载
    pub fn new() -> Self {
        Self::with_state(false, false)
    }

    pub fn with_state(network_up: bool, removable_mounted: bool) -> Self {
        Self {
            subscriptions: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            network_up: AtomicBool::new(network_up),
            removable_mounted: AtomicBool::new(removable_mounted),
        }
    }

    pub fn network_up(&self) -> bool {
        self.network_up.load(Ordering::Acquire)
    }

    pub fn removable_mounted(&self) -> bool {
        self.removable_mounted.load(Ordering::Acquire)
    }

    /// 订阅：`*`、`prefix*`、`*suffix` 或完整名称
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let pattern = match NameFilter::from_patterns(&[pattern]) {
            Ok(p) => p,
            Err(e) => {
                warn!("event subscription '{}' matches nothing: {}", pattern, e);
                NameFilter::new()
            },
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscriptions.lock().push(Subscription {
            id,
            pattern,
            handler: Arc::new(handler),
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id.0);
        subscriptions.len() != before
    }

    /// 发布事件，返回执行的处理函数数量
    pub fn publish(&self, name: &str, payload: &str) -> usize {
        match name {
            NETWORK_UP => self.network_up.store(true, Ordering::Release),
            NETWORK_DOWN => self.network_up.store(false, Ordering::Release),
            SD_MOUNTED => self.removable_mounted.store(true, Ordering::Release),
            SD_UNMOUNTING => self.removable_mounted.store(false, Ordering::Release),
            _ => {},
        }

        let handlers: Vec<Handler> = self
            .subscriptions
            .lock()
            .iter()
            .filter(|s| s.pattern.matches(name))
            .map(|s| s.handler.clone())
            .collect();

        trace!("event {} ({} handlers)", name, handlers.len());
        let event = Event {
            name: name.to_string(),
            payload: payload.to_string(),
        };
        for handler in &handlers {
            handler(&event);
        }
        handlers.len()
    }

    /// 发布指标变化（`metric.<name>`）
    pub fn publish_metric(&self, name: &str, value: &str) -> usize {
        self.publish(&format!("{}{}", METRIC_PREFIX, name), value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_pattern_dispatch() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicUsize::new(0));

        let h = hits.clone();
        bus.subscribe("network.*", move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });
        let h = hits.clone();
        bus.subscribe("*", move |_| {
            h.fetch_add(10, Ordering::Relaxed);
        });

        assert_eq!(bus.publish(NETWORK_UP, ""), 2);
        assert_eq!(bus.publish("vehicle.on", ""), 1);
        assert_eq!(hits.load(Ordering::Relaxed), 21);
    }

    #[test]
    fn test_host_state_updated_before_handlers() {
        let bus = Arc::new(EventBus::new());
        let seen = Arc::new(AtomicBool::new(false));

        let (b, s) = (bus.clone(), seen.clone());
        bus.subscribe(NETWORK_UP, move |_| {
            s.store(b.network_up(), Ordering::Relaxed);
        });

        assert!(!bus.network_up());
        bus.publish(NETWORK_UP, "");
        assert!(seen.load(Ordering::Relaxed));

        bus.publish(SD_MOUNTED, "");
        assert!(bus.removable_mounted());
        bus.publish(SD_UNMOUNTING, "");
        assert!(!bus.removable_mounted());
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let id = bus.subscribe("*", |_| {});
        assert!(bus.unsubscribe(id));
        assert!(!bus.unsubscribe(id));
        assert_eq!(bus.publish("x", ""), 0);
    }

    /// 处理函数内可以发布事件（订阅表锁不在执行期间持有）
    #[test]
    fn test_publish_from_handler() {
        let bus = Arc::new(EventBus::new());
        let b = bus.clone();
        bus.subscribe("first", move |_| {
            b.publish("second", "");
        });
        let hits = Arc::new(AtomicUsize::new(0));
        let h = hits.clone();
        bus.subscribe("second", move |_| {
            h.fetch_add(1, Ordering::Relaxed);
        });

        bus.publish("first", "");
        assert_eq!(hits.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_metric() {
        let bus = EventBus::new();
        let got = Arc::new(Mutex::new(None));
        let g = got.clone();
        bus.subscribe("metric.*", move |e| {
            *g.lock() = Some((e.name.clone(), e.payload.clone()));
        });
        bus.publish_metric("v.b.soc", "81");
        assert_eq!(
            *got.lock(),
            Some(("metric.v.b.soc".to_string(), "81".to_string()))
        );
    }
}
