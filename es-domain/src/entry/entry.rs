use super::{EntryId, EntryMetadata, EntrySequence, EventDescriptor, StreamId};
use bon::Builder;
use serde::{Deserialize, Serialize};

/// 条目：一条已记录的事件及其位置与元数据，构造后不可变
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// 所属流
    stream_id: StreamId,
    /// 条目唯一标识（幂等键），未指定时随机生成
    #[builder(default)]
    entry_id: EntryId,
    /// 流内序号
    sequence: EntrySequence,
    /// 事件描述
    descriptor: EventDescriptor,
    /// 元数据
    #[builder(default)]
    metadata: EntryMetadata,
}

impl Entry {
    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn entry_id(&self) -> EntryId {
        self.entry_id
    }

    pub fn sequence(&self) -> EntrySequence {
        self.sequence
    }

    pub fn descriptor(&self) -> &EventDescriptor {
        &self.descriptor
    }

    pub fn metadata(&self) -> &EntryMetadata {
        &self.metadata
    }

    /// 事件类型标识的便捷访问
    pub fn type_identifier(&self) -> &str {
        self.descriptor.type_identifier()
    }
}
