use super::{Entry, EntryBatch, EntryMetadata, EntrySequence, EventDescriptor, StreamId};
use crate::error::{DomainError, DomainResult};

/// 可追加流：生产方在内存中跟踪下一个可用序号，并把新事件组装成连续批次
///
/// 发布遇到乐观并发冲突后，调用方应重新读取流的下一个序号，
/// 通过 `from_existing` 重建后再生成新的批次。
#[derive(Debug, Clone)]
pub struct AppendableStream {
    stream_id: StreamId,
    next: EntrySequence,
    uncommitted: Vec<Entry>,
}

impl AppendableStream {
    /// 全新的流，从序号 0 开始
    pub fn new(stream_id: StreamId) -> Self {
        Self::from_existing(stream_id, EntrySequence::first())
    }

    /// 已有流，从存储层读到的下一个序号继续
    pub fn from_existing(stream_id: StreamId, next: EntrySequence) -> Self {
        Self {
            stream_id,
            next,
            uncommitted: Vec::new(),
        }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    /// 下一个将被分配的序号
    pub fn next_sequence(&self) -> EntrySequence {
        self.next
    }

    pub fn uncommitted(&self) -> &[Entry] {
        &self.uncommitted
    }

    /// 以下一个序号追加一条事件；序号空间耗尽时拒绝
    pub fn append(
        &mut self,
        descriptor: EventDescriptor,
        metadata: EntryMetadata,
    ) -> DomainResult<&Entry> {
        let next = self.next.next().ok_or_else(|| {
            DomainError::invalid_argument(format!(
                "stream {} has no sequence left after {}",
                self.stream_id, self.next
            ))
        })?;
        let entry = Entry::builder()
            .stream_id(self.stream_id)
            .sequence(self.next)
            .descriptor(descriptor)
            .metadata(metadata)
            .build();
        self.next = next;
        self.uncommitted.push(entry);
        Ok(&self.uncommitted[self.uncommitted.len() - 1])
    }

    /// 取出尚未提交的条目组成批次
    pub fn take_batch(&mut self) -> DomainResult<EntryBatch> {
        EntryBatch::try_new(std::mem::take(&mut self.uncommitted))
    }
}
