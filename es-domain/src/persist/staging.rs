//! 暂存（Outbox）协议
//!
//! 批次在追加到流日志之前先持久化到暂存区，使对账作业在进程崩溃后
//! 仍有记录可依。已发布的批次另有一个“已交付总线”标记，
//! 未交付的批次由对账作业重新转发给总线。
//!
use crate::entry::{EntryBatch, StagingId};
use crate::error::{DomainError, DomainResult as Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// 暂存批次的结果状态：只允许 Pending→Published 或 Pending→FailedToStore 一次转换
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StagedOutcome {
    Pending,
    Published,
    FailedToStore,
}

impl StagedOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// 一个暂存批次（一组 Outbox 记录）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StagedBatch {
    staging_id: StagingId,
    batch: EntryBatch,
    staged_at: DateTime<Utc>,
    outcome: StagedOutcome,
    /// 条目已被总线确认接收
    #[serde(default)]
    forwarded: bool,
}

impl StagedBatch {
    /// 新暂存的批次，状态为 Pending
    pub fn pending(staging_id: StagingId, batch: EntryBatch, staged_at: DateTime<Utc>) -> Self {
        Self {
            staging_id,
            batch,
            staged_at,
            outcome: StagedOutcome::Pending,
            forwarded: false,
        }
    }

    pub fn staging_id(&self) -> StagingId {
        self.staging_id
    }

    pub fn batch(&self) -> &EntryBatch {
        &self.batch
    }

    pub fn staged_at(&self) -> DateTime<Utc> {
        self.staged_at
    }

    pub fn outcome(&self) -> StagedOutcome {
        self.outcome
    }

    pub fn is_forwarded(&self) -> bool {
        self.forwarded
    }

    /// 记录总线已接收；重复调用返回 false
    pub fn mark_forwarded(&mut self) -> bool {
        !std::mem::replace(&mut self.forwarded, true)
    }

    /// 已发布但总线仍欠一次投递
    pub fn awaits_forwarding(&self) -> bool {
        self.outcome == StagedOutcome::Published && !self.forwarded
    }

    /// 终态转换；已处于终态时保持不变并返回 false
    pub fn resolve(&mut self, outcome: StagedOutcome) -> bool {
        if self.outcome.is_terminal() || !outcome.is_terminal() {
            return false;
        }
        self.outcome = outcome;
        true
    }
}

/// 暂存写入端
///
/// 标记操作必须幂等：对已标记的批次再次标记既不报错也不改变状态。
#[async_trait]
pub trait StagingWriter: Send + Sync {
    /// 持久化插入批次；空批次属于调用方错误，须在任何 I/O 之前拒绝
    async fn write(&self, batch: &EntryBatch) -> Result<StagingId>;

    async fn mark_published(&self, staging_id: StagingId) -> Result<()>;

    async fn mark_failed_to_store(&self, staging_id: StagingId) -> Result<()>;

    /// 记录批次条目已被总线接收，与结果状态相互独立
    async fn mark_forwarded(&self, staging_id: StagingId) -> Result<()>;
}

/// 暂存读取端
#[async_trait]
pub trait StagingReader: Send + Sync {
    /// 全部仍处于 Pending 的批次
    async fn read_pending(&self) -> Result<Vec<StagedBatch>>;

    /// 指定批次（仅当仍为 Pending 时返回）
    async fn read_pending_by_id(&self, staging_id: StagingId) -> Result<Option<StagedBatch>>;

    /// 已发布但尚未交付总线的批次，按暂存时间排序
    async fn read_unforwarded(&self) -> Result<Vec<StagedBatch>>;
}

/// 读写合一的暂存存储
pub trait StagingStore: StagingWriter + StagingReader {}

impl<T> StagingStore for T where T: StagingWriter + StagingReader + ?Sized {}

/// 暂存写入前的参数校验
pub fn ensure_stageable(batch: &EntryBatch) -> Result<()> {
    if batch.is_empty() {
        return Err(DomainError::invalid_argument("cannot stage an empty batch"));
    }
    Ok(())
}

#[async_trait]
impl<T> StagingWriter for Arc<T>
where
    T: StagingWriter + ?Sized,
{
    async fn write(&self, batch: &EntryBatch) -> Result<StagingId> {
        (**self).write(batch).await
    }

    async fn mark_published(&self, staging_id: StagingId) -> Result<()> {
        (**self).mark_published(staging_id).await
    }

    async fn mark_failed_to_store(&self, staging_id: StagingId) -> Result<()> {
        (**self).mark_failed_to_store(staging_id).await
    }

    async fn mark_forwarded(&self, staging_id: StagingId) -> Result<()> {
        (**self).mark_forwarded(staging_id).await
    }
}

#[async_trait]
impl<T> StagingReader for Arc<T>
where
    T: StagingReader + ?Sized,
{
    async fn read_pending(&self) -> Result<Vec<StagedBatch>> {
        (**self).read_pending().await
    }

    async fn read_pending_by_id(&self, staging_id: StagingId) -> Result<Option<StagedBatch>> {
        (**self).read_pending_by_id(staging_id).await
    }

    async fn read_unforwarded(&self) -> Result<Vec<StagedBatch>> {
        (**self).read_unforwarded().await
    }
}
