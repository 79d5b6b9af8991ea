//! Builder 模式实现
//!
//! 链式构造 [`CentralDispatch`]：按添加顺序给控制器编号（从 1 开始）。

use crate::bus::{Bus, BusConfig};
use crate::controller::CanController;
use crate::dispatch::{CentralDispatch, DispatchConfig};
use crate::driver::DriverConfig;
use crate::registry::{Loggable, Registry};
use crossbeam_channel::bounded;
use std::sync::Arc;
use std::time::Duration;

/// 分发器 Builder
///
/// # Example
///
/// ```
/// use canbus_driver::{BusMode, BusSpeed, DispatchBuilder, SimController};
///
/// let dispatch = DispatchBuilder::new()
///     .bus(Box::new(SimController::new()))
///     .bus(Box::new(SimController::new()))
///     .build();
///
/// assert_eq!(dispatch.buses().len(), 2);
/// dispatch.bus(1).unwrap().start(BusMode::Listen, BusSpeed::K500).unwrap();
/// ```
#[derive(Default)]
pub struct DispatchBuilder {
    config: DispatchConfig,
    controllers: Vec<Box<dyn CanController>>,
}

impl DispatchBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn config(mut self, config: DispatchConfig) -> Self {
        self.config = config;
        self
    }

    /// 添加一个控制器，编号为当前数量加一
    pub fn bus(mut self, controller: Box<dyn CanController>) -> Self {
        self.controllers.push(controller);
        self
    }

    pub fn build(self) -> CentralDispatch {
        let (inbound_tx, inbound_rx) = bounded(self.config.inbound_queue_size.max(1));
        let loggers: Arc<Registry<dyn Loggable>> = Arc::new(Registry::new());
        let bus_config = BusConfig {
            driver: DriverConfig {
                tx_queue_size: self.config.tx_queue_size,
                stuck_timeout: Duration::from_secs(self.config.stuck_timeout_secs),
            },
            watchdog_timeout: Duration::from_secs(self.config.watchdog_timeout_secs),
        };

        let buses = self
            .controllers
            .into_iter()
            .zip(1u8..)
            .map(|(controller, number)| {
                Arc::new(Bus::new(
                    number,
                    controller,
                    inbound_tx.clone(),
                    loggers.clone(),
                    bus_config,
                ))
            })
            .collect();

        CentralDispatch::from_parts(self.config, buses, inbound_tx, inbound_rx, loggers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimController;

    #[test]
    fn test_bus_numbering() {
        let dispatch = DispatchBuilder::new()
            .bus(Box::new(SimController::new()))
            .bus(Box::new(SimController::new()))
            .bus(Box::new(SimController::new()))
            .build();

        let numbers: Vec<u8> = dispatch.buses().iter().map(|b| b.number()).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
        assert_eq!(dispatch.bus(2).unwrap().name(), "can2");
        assert!(dispatch.bus(0).is_none());
    }

    #[test]
    fn test_config_applied() {
        let dispatch = DispatchBuilder::new()
            .config(DispatchConfig {
                inbound_queue_size: 4,
                ..Default::default()
            })
            .build();
        assert_eq!(dispatch.config().inbound_queue_size, 4);

        for _ in 0..4 {
            assert!(dispatch.raise_interrupt(1));
        }
        assert!(!dispatch.raise_interrupt(1));
    }
}
