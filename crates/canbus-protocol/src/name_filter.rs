//! 事件名 / 指标名过滤
//!
//! 决定哪些系统事件、指标变化要作为 info 条目转发到日志。
//! 模式：`*`（全部）、`prefix*`、`*suffix`、完全相等。空列表不转发任何名称。

use crate::ProtocolError;
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Pattern {
    Any,
    Prefix(String),
    Suffix(String),
    Exact(String),
}

impl Pattern {
    fn matches(&self, name: &str) -> bool {
        match self {
            Pattern::Any => true,
            Pattern::Prefix(p) => name.starts_with(p.as_str()),
            Pattern::Suffix(s) => name.ends_with(s.as_str()),
            Pattern::Exact(e) => name == e,
        }
    }
}

impl FromStr for Pattern {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Pattern::Any);
        }
        if s.is_empty() || s.matches('*').count() > 1 {
            return Err(ProtocolError::InvalidPattern(s.to_string()));
        }
        if let Some(prefix) = s.strip_suffix('*') {
            return Ok(Pattern::Prefix(prefix.to_string()));
        }
        if let Some(suffix) = s.strip_prefix('*') {
            return Ok(Pattern::Suffix(suffix.to_string()));
        }
        if s.contains('*') {
            return Err(ProtocolError::InvalidPattern(s.to_string()));
        }
        Ok(Pattern::Exact(s.to_string()))
    }
}

/// 名称过滤器
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameFilter {
    patterns: Vec<Pattern>,
}

impl NameFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从模式列表构造
    pub fn from_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Self, ProtocolError> {
        let patterns = patterns
            .iter()
            .map(|p| p.as_ref().parse())
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    pub fn add(&mut self, pattern: &str) -> Result<(), ProtocolError> {
        self.patterns.push(pattern.parse()?);
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    pub fn matches(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }
}

/// 逗号或空白分隔的模式列表
impl FromStr for NameFilter {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();
        Self::from_patterns(&parts)
    }
}
