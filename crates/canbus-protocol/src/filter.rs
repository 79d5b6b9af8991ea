//! 帧过滤器
//!
//! 有序的 (bus, id 范围) 规则列表，回答"这个帧 / 这条总线是否需要"。
//!
//! # 语义
//!
//! - 规则列表为空：全部通过
//! - 否则任意一条规则满足即通过：规则的 bus 为 0（通配）或等于帧的来源总线，
//!   且帧 ID 落在 `[from, to]` 内
//!
//! 纯值类型，无 I/O。构造完成后可以只读共享；修改需要由持有者加锁。
//!
//! # 字符串语法
//!
//! ```text
//! <bus>                 单个十进制数字，匹配该总线上所有 ID
//! <id>[-<id>]           十六进制 ID 或范围（可带 0x 前缀），任意总线
//! <bus>:<id>[-<id>]     指定总线上的 ID 或范围
//! <id>-                 上界省略表示 u32::MAX
//! ```

use crate::{CanFrame, ProtocolError};
use std::fmt;
use std::str::FromStr;

/// 单条过滤规则
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FilterRule {
    /// 总线编号，0 = 任意总线
    pub bus: u8,
    pub from: u32,
    pub to: u32,
}

impl FilterRule {
    pub fn matches_bus(&self, bus: u8) -> bool {
        self.bus == 0 || self.bus == bus
    }

    pub fn matches(&self, frame: &CanFrame) -> bool {
        self.matches_bus(frame.origin) && frame.id >= self.from && frame.id <= self.to
    }
}

impl fmt::Display for FilterRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.from == 0 && self.to == u32::MAX {
            return if self.bus > 0 {
                write!(f, "{}", self.bus)
            } else {
                write!(f, "*")
            };
        }
        if self.bus > 0 {
            write!(f, "{}:", self.bus)?;
        }
        if self.from == self.to {
            write!(f, "{:03X}", self.from)
        } else {
            write!(f, "{:03X}-{:03X}", self.from, self.to)
        }
    }
}

impl FromStr for FilterRule {
    type Err = ProtocolError;

    fn from_str(spec: &str) -> Result<Self, Self::Err> {
        let spec = spec.trim();
        let invalid = || ProtocolError::InvalidFilter(spec.to_string());

        // 单个数字：总线
        if spec.len() == 1 {
            let bus = spec
                .chars()
                .next()
                .and_then(|c| c.to_digit(10))
                .ok_or_else(invalid)?;
            return Ok(FilterRule {
                bus: bus as u8,
                from: 0,
                to: u32::MAX,
            });
        }

        let (bus, ids) = match spec.split_once(':') {
            Some((bus, ids)) => (bus.parse::<u8>().map_err(|_| invalid())?, ids),
            None => (0, spec),
        };

        let (from, to) = match ids.split_once('-') {
            Some((from, "")) => (parse_hex(from).ok_or_else(invalid)?, u32::MAX),
            Some((from, to)) => (
                parse_hex(from).ok_or_else(invalid)?,
                parse_hex(to).ok_or_else(invalid)?,
            ),
            None => {
                let id = parse_hex(ids).ok_or_else(invalid)?;
                (id, id)
            },
        };

        if from > to {
            return Err(invalid());
        }

        Ok(FilterRule { bus, from, to })
    }
}

fn parse_hex(text: &str) -> Option<u32> {
    let text = text.trim();
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 16).ok()
}

/// 帧过滤器（规则列表）
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct FrameFilter {
    rules: Vec<FilterRule>,
}

impl FrameFilter {
    #[must_use]
    pub const fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// 添加一条规则
    pub fn add_filter(&mut self, bus: u8, from: u32, to: u32) {
        self.rules.push(FilterRule { bus, from, to });
    }

    /// 解析并添加一条规则
    pub fn add_filter_str(&mut self, spec: &str) -> Result<(), ProtocolError> {
        let rule = spec.parse::<FilterRule>()?;
        self.rules.push(rule);
        Ok(())
    }

    /// 从多个规则字符串构造
    pub fn from_specs<S: AsRef<str>>(specs: &[S]) -> Result<Self, ProtocolError> {
        let mut filter = Self::new();
        for spec in specs {
            filter.add_filter_str(spec.as_ref())?;
        }
        Ok(filter)
    }

    /// 移除所有完全相同的规则，返回是否有规则被移除
    pub fn remove_filter(&mut self, bus: u8, from: u32, to: u32) -> bool {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.bus == bus && r.from == from && r.to == to));
        self.rules.len() != before
    }

    pub fn clear(&mut self) {
        self.rules.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn rules(&self) -> &[FilterRule] {
        &self.rules
    }

    /// 帧是否通过
    pub fn is_filtered(&self, frame: &CanFrame) -> bool {
        self.rules.is_empty() || self.rules.iter().any(|r| r.matches(frame))
    }

    /// 总线是否通过（状态 / 文本消息使用）
    ///
    /// 总线 0 表示消息不属于任何总线，总是通过。只有 ID 范围、没有指定总线的
    /// 规则（总线 0）匹配任何总线，所以过滤器里有这样一条规则时，所有总线的
    /// 状态消息都会通过。
    pub fn is_filtered_bus(&self, bus: u8) -> bool {
        self.rules.is_empty() || bus == 0 || self.rules.iter().any(|r| r.matches_bus(bus))
    }

    /// 规则摘要，如 `1:100-200 7DF`
    pub fn info(&self) -> String {
        self.rules
            .iter()
            .map(|r| r.to_string())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frame(bus: u8, id: u32) -> CanFrame {
        CanFrame::new_standard(id, &[0]).with_origin(bus)
    }

    #[test]
    fn test_empty_filter_passes_everything() {
        let filter = FrameFilter::new();
        assert!(filter.is_filtered(&frame(1, 0x123)));
        assert!(filter.is_filtered_bus(2));
        assert_eq!(filter.info(), "");
    }

    #[test]
    fn test_parse_bus_only() {
        let rule: FilterRule = "2".parse().unwrap();
        assert_eq!(
            rule,
            FilterRule {
                bus: 2,
                from: 0,
                to: u32::MAX
            }
        );
    }

    #[test]
    fn test_parse_forms() {
        assert_eq!(
            "7df".parse::<FilterRule>().unwrap(),
            FilterRule {
                bus: 0,
                from: 0x7DF,
                to: 0x7DF
            }
        );
        assert_eq!(
            "2:2a0-37f".parse::<FilterRule>().unwrap(),
            FilterRule {
                bus: 2,
                from: 0x2A0,
                to: 0x37F
            }
        );
        assert_eq!(
            "1:0x100-0x200".parse::<FilterRule>().unwrap(),
            FilterRule {
                bus: 1,
                from: 0x100,
                to: 0x200
            }
        );
        assert_eq!("400-".parse::<FilterRule>().unwrap().to, u32::MAX);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!("x".parse::<FilterRule>().is_err());
        assert!("1:zz".parse::<FilterRule>().is_err());
        assert!("300-100".parse::<FilterRule>().is_err());
        assert!("a:100".parse::<FilterRule>().is_err());
        assert!("".parse::<FilterRule>().is_err());
    }

    #[test]
    fn test_bus_and_range_matching() {
        let filter = FrameFilter::from_specs(&["1:100-200"]).unwrap();

        assert!(filter.is_filtered(&frame(1, 0x100)));
        assert!(filter.is_filtered(&frame(1, 0x200)));
        assert!(!filter.is_filtered(&frame(1, 0x300)));
        assert!(!filter.is_filtered(&frame(2, 0x150)));

        assert!(filter.is_filtered_bus(1));
        assert!(!filter.is_filtered_bus(2));
        assert!(filter.is_filtered_bus(0));
    }

    #[test]
    fn test_wildcard_bus_rule() {
        let filter = FrameFilter::from_specs(&["7df"]).unwrap();
        assert!(filter.is_filtered(&frame(1, 0x7DF)));
        assert!(filter.is_filtered(&frame(3, 0x7DF)));
        assert!(!filter.is_filtered(&frame(3, 0x7E0)));
        assert!(filter.is_filtered_bus(3));

        // 混合规则：不带总线的规则让所有总线的状态消息通过
        let mixed = FrameFilter::from_specs(&["2:100-200", "7df"]).unwrap();
        assert!(mixed.is_filtered_bus(1));
        assert!(mixed.is_filtered_bus(2));
        let bus_only = FrameFilter::from_specs(&["2:100-200"]).unwrap();
        assert!(!bus_only.is_filtered_bus(1));
    }

    #[test]
    fn test_remove_filter() {
        let mut filter = FrameFilter::new();
        filter.add_filter(1, 0x100, 0x200);
        filter.add_filter(2, 0x7DF, 0x7DF);
        filter.add_filter(1, 0x100, 0x200);

        assert!(filter.remove_filter(1, 0x100, 0x200));
        assert_eq!(filter.rules().len(), 1);
        assert!(!filter.remove_filter(1, 0x100, 0x200));
    }

    #[test]
    fn test_info() {
        let filter = FrameFilter::from_specs(&["1:100-200", "7df", "3"]).unwrap();
        assert_eq!(filter.info(), "1:100-200 7DF 3");
    }

    fn arb_rule() -> impl Strategy<Value = FilterRule> {
        (0u8..4, 0u32..0x800, 0u32..0x800).prop_map(|(bus, a, b)| FilterRule {
            bus,
            from: a.min(b),
            to: a.max(b),
        })
    }

    proptest! {
        /// 相同输入在未修改的过滤器上总是得到相同结果
        #[test]
        fn prop_is_filtered_is_pure(
            rules in proptest::collection::vec(arb_rule(), 0..6),
            bus in 0u8..4,
            id in 0u32..0x800,
        ) {
            let mut filter = FrameFilter::new();
            for r in &rules {
                filter.add_filter(r.bus, r.from, r.to);
            }
            let f = frame(bus, id);
            prop_assert_eq!(filter.is_filtered(&f), filter.is_filtered(&f));
        }

        /// 在非空过滤器上加规则只会放宽：之前通过的仍然通过，
        /// 新通过的一定匹配新规则
        #[test]
        fn prop_adding_rule_widens(
            rules in proptest::collection::vec(arb_rule(), 1..6),
            extra in arb_rule(),
            bus in 0u8..4,
            id in 0u32..0x800,
        ) {
            let mut filter = FrameFilter::new();
            for r in &rules {
                filter.add_filter(r.bus, r.from, r.to);
            }
            let f = frame(bus, id);
            let before = filter.is_filtered(&f);

            filter.add_filter(extra.bus, extra.from, extra.to);
            let after = filter.is_filtered(&f);

            if before {
                prop_assert!(after);
            }
            if !before && after {
                prop_assert!(extra.matches(&f));
            }
        }
    }
}
