use super::{Entry, EntryId, EntrySequence, StreamId};
use crate::error::{DomainError, DomainResult};
use serde::{Deserialize, Serialize};

/// 条目批次：同一流内、从当前下一个序号开始的连续升序区间
///
/// 连续性由生产方保证，构造时校验；存储层只校验序号唯一性。
/// 反序列化同样经过校验，避免从存储中读出非法批次。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<Entry>", into = "Vec<Entry>")]
pub struct EntryBatch {
    entries: Vec<Entry>,
}

impl EntryBatch {
    /// 校验并构造批次：同一 StreamId、序号连续升序
    pub fn try_new(entries: Vec<Entry>) -> DomainResult<Self> {
        if let Some((first, rest)) = entries.split_first() {
            let stream_id = first.stream_id();
            let mut expected = first.sequence();

            for entry in rest {
                expected = expected.next().ok_or_else(|| {
                    DomainError::invalid_argument(format!(
                        "batch overflows the sequence space after {expected}"
                    ))
                })?;

                if entry.stream_id() != stream_id {
                    return Err(DomainError::invalid_argument(format!(
                        "batch mixes streams: expected={stream_id}, found={}",
                        entry.stream_id()
                    )));
                }
                if entry.sequence() != expected {
                    return Err(DomainError::invalid_argument(format!(
                        "batch sequence gap: expected={expected}, found={}",
                        entry.sequence()
                    )));
                }
            }
        }

        Ok(Self { entries })
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 批次所属流；空批次没有流
    pub fn stream_id(&self) -> Option<StreamId> {
        self.entries.first().map(Entry::stream_id)
    }

    pub fn first_sequence(&self) -> Option<EntrySequence> {
        self.entries.first().map(Entry::sequence)
    }

    pub fn last_sequence(&self) -> Option<EntrySequence> {
        self.entries.last().map(Entry::sequence)
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry_ids(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.entries.iter().map(Entry::entry_id)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Entry> {
        self.entries.iter()
    }

    pub fn into_entries(self) -> Vec<Entry> {
        self.entries
    }
}

impl TryFrom<Vec<Entry>> for EntryBatch {
    type Error = DomainError;

    fn try_from(entries: Vec<Entry>) -> Result<Self, Self::Error> {
        Self::try_new(entries)
    }
}

impl From<EntryBatch> for Vec<Entry> {
    fn from(batch: EntryBatch) -> Self {
        batch.entries
    }
}

impl<'a> IntoIterator for &'a EntryBatch {
    type Item = &'a Entry;
    type IntoIter = std::slice::Iter<'a, Entry>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}
