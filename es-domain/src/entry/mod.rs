//! 条目（Entry）与序号模型
//!
//! 定义流标识、条目位置与条目批次等不可变值类型：
//! - `StreamId` / `EntryId` / `StagingId`：不透明的全局唯一标识；
//! - `EntrySequence`：流内单调递增、无间隙、从 0 开始的序号；
//! - `EventDescriptor`：序列化后的事件载荷与类型标识；
//! - `Entry` / `EntryBatch`：单条记录与同一流内连续序号的有序批次；
//! - `AppendableStream`：生产方在内存中跟踪下一个可用序号并组装批次。
//!
mod appendable;
mod batch;
mod descriptor;
mod entry;
mod event;
mod ids;
mod metadata;
mod sequence;

pub use appendable::AppendableStream;
pub use batch::EntryBatch;
pub use descriptor::EventDescriptor;
pub use entry::Entry;
pub use event::Event;
pub use ids::{EntryId, StagingId, StreamId};
pub use metadata::EntryMetadata;
pub use sequence::EntrySequence;
