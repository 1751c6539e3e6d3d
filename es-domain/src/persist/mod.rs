//! 持久化协议（persist）
//!
//! 定义暂存（Outbox）与流存储的读写契约，以及与之语义一致的内存实现：
//! - 暂存写入/读取（`StagingWriter`、`StagingReader`）；
//! - 流追加与区间读取（`StreamWriter`、`StreamReader`）；
//! - 内存后端（`InMemoryStagingStore`、`InMemoryStreamStore`）。
//!
//! 该模块聚焦协议，具体存储后端（如关系型数据库）由上层提供实现并注入。
//!
mod inmemory;
mod staging;
mod stream;

pub use inmemory::{InMemoryStagingStore, InMemoryStreamStore};
pub use staging::{
    StagedBatch, StagedOutcome, StagingReader, StagingStore, StagingWriter, ensure_stageable,
};
pub use stream::{StreamReader, StreamStore, StreamWriter, WriteResult};
