use crate::error::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 条目序号：流内唯一、无间隙、从 0 开始单调递增
///
/// 序号由生产方在暂存前分配（见 `AppendableStream`），流存储只负责唯一性校验。
///
/// # 示例
///
/// ```
/// use es_domain::entry::EntrySequence;
///
/// let first = EntrySequence::first();
/// assert_eq!(first.value(), 0);
/// assert_eq!(first.next().map(|s| s.value()), Some(1));
/// assert_eq!(first.offset(3), Some(EntrySequence::from_value(3)));
/// assert_eq!(EntrySequence::from_value(u64::MAX).next(), None);
/// ```
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct EntrySequence(u64);

impl EntrySequence {
    /// 流的第一个序号（0）
    pub const fn first() -> Self {
        Self(0)
    }

    pub const fn from_value(value: u64) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u64 {
        self.0
    }

    /// 下一个序号；序号空间耗尽时返回 None
    pub const fn next(&self) -> Option<Self> {
        self.offset(1)
    }

    /// 向后偏移 `n` 个位置
    pub const fn offset(&self, n: u64) -> Option<Self> {
        match self.0.checked_add(n) {
            Some(value) => Some(Self(value)),
            None => None,
        }
    }

    pub const fn is_first(&self) -> bool {
        self.0 == 0
    }
}

impl From<u64> for EntrySequence {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl FromStr for EntrySequence {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl fmt::Display for EntrySequence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}
