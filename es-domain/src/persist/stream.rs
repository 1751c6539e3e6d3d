//! 流存储协议
//!
//! 每个流一条只追加日志；序号唯一性约束即乐观并发保护，
//! 成功追加是“条目已持久成为流的一部分”的唯一事实来源。
//!
use crate::entry::{Entry, EntryBatch, EntrySequence, StreamId};
use crate::error::DomainResult as Result;
use async_trait::async_trait;
use std::sync::Arc;

/// 追加结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteResult {
    Success,
    /// 区间内任一序号已存在，整批被拒绝
    SequenceAlreadyTaken,
    /// 其他存储层失败
    UnknownFailure,
    /// 空批次，未触及存储
    EmptyInput,
}

/// 流写入端
#[async_trait]
pub trait StreamWriter: Send + Sync {
    /// 原子追加整批；对同一流序号区间重叠的并发追加，恰有一个返回 `Success`
    async fn append(&self, batch: &EntryBatch) -> WriteResult;
}

/// 流读取端
#[async_trait]
pub trait StreamReader: Send + Sync {
    /// 读取 `[first, last]` 闭区间内已存在的条目，按序号升序
    async fn read_range(
        &self,
        stream_id: StreamId,
        first: EntrySequence,
        last: EntrySequence,
    ) -> Result<Vec<Entry>>;

    /// 流的下一个可用序号（空流为 0）
    async fn next_sequence(&self, stream_id: StreamId) -> Result<EntrySequence>;
}

/// 读写合一的流存储
pub trait StreamStore: StreamWriter + StreamReader {}

impl<T> StreamStore for T where T: StreamWriter + StreamReader + ?Sized {}

#[async_trait]
impl<T> StreamWriter for Arc<T>
where
    T: StreamWriter + ?Sized,
{
    async fn append(&self, batch: &EntryBatch) -> WriteResult {
        (**self).append(batch).await
    }
}

#[async_trait]
impl<T> StreamReader for Arc<T>
where
    T: StreamReader + ?Sized,
{
    async fn read_range(
        &self,
        stream_id: StreamId,
        first: EntrySequence,
        last: EntrySequence,
    ) -> Result<Vec<Entry>> {
        (**self).read_range(stream_id, first, last).await
    }

    async fn next_sequence(&self, stream_id: StreamId) -> Result<EntrySequence> {
        (**self).next_sequence(stream_id).await
    }
}
