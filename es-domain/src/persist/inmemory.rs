//! 内存版暂存与流存储
//!
//! 提供与持久化后端相同语义的轻量实现，典型用途：测试环境、示例与本地开发。
//! - `InMemoryStagingStore`：标记幂等、终态不可逆，单独记录总线交付；
//! - `InMemoryStreamStore`：按流加锁的原子“检查 + 插入”，序号冲突整批拒绝；
//!   可注入追加失败，用于模拟存储层故障。
//!
use super::{
    StagedBatch, StagedOutcome, StagingReader, StagingWriter, StreamReader, StreamWriter,
    WriteResult, ensure_stageable,
};
use crate::entry::{Entry, EntryBatch, EntrySequence, StagingId, StreamId};
use crate::error::{DomainError, DomainResult as Result};
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Default)]
pub struct InMemoryStagingStore {
    rows: DashMap<StagingId, StagedBatch>,
}

impl InMemoryStagingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 任意状态的批次（测试与诊断用）
    pub fn get(&self, staging_id: StagingId) -> Option<StagedBatch> {
        self.rows.get(&staging_id).map(|row| row.clone())
    }

    /// 全部记录，按暂存时间排序
    pub fn all(&self) -> Vec<StagedBatch> {
        let mut rows: Vec<StagedBatch> = self.rows.iter().map(|row| row.clone()).collect();
        rows.sort_by_key(StagedBatch::staged_at);
        rows
    }

    pub fn outcome(&self, staging_id: StagingId) -> Option<StagedOutcome> {
        self.rows.get(&staging_id).map(|row| row.outcome())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// 直接插入一条记录（用于模拟历史遗留的 Pending 批次）
    pub fn insert(&self, staged: StagedBatch) {
        self.rows.insert(staged.staging_id(), staged);
    }

    fn update(&self, staging_id: StagingId, f: impl FnOnce(&mut StagedBatch)) -> Result<()> {
        let Some(mut row) = self.rows.get_mut(&staging_id) else {
            return Err(DomainError::staging_store(format!(
                "unknown staging id: {staging_id}"
            )));
        };
        f(row.value_mut());
        Ok(())
    }
}

#[async_trait]
impl StagingWriter for InMemoryStagingStore {
    async fn write(&self, batch: &EntryBatch) -> Result<StagingId> {
        ensure_stageable(batch)?;

        let staging_id = StagingId::new();
        self.rows.insert(
            staging_id,
            StagedBatch::pending(staging_id, batch.clone(), Utc::now()),
        );
        Ok(staging_id)
    }

    async fn mark_published(&self, staging_id: StagingId) -> Result<()> {
        self.update(staging_id, |row| {
            row.resolve(StagedOutcome::Published);
        })
    }

    async fn mark_failed_to_store(&self, staging_id: StagingId) -> Result<()> {
        self.update(staging_id, |row| {
            row.resolve(StagedOutcome::FailedToStore);
        })
    }

    async fn mark_forwarded(&self, staging_id: StagingId) -> Result<()> {
        self.update(staging_id, |row| {
            row.mark_forwarded();
        })
    }
}

#[async_trait]
impl StagingReader for InMemoryStagingStore {
    async fn read_pending(&self) -> Result<Vec<StagedBatch>> {
        let mut pending: Vec<StagedBatch> = self
            .rows
            .iter()
            .filter(|row| row.outcome() == StagedOutcome::Pending)
            .map(|row| row.clone())
            .collect();
        pending.sort_by_key(StagedBatch::staged_at);
        Ok(pending)
    }

    async fn read_pending_by_id(&self, staging_id: StagingId) -> Result<Option<StagedBatch>> {
        Ok(self
            .rows
            .get(&staging_id)
            .filter(|row| row.outcome() == StagedOutcome::Pending)
            .map(|row| row.clone()))
    }

    async fn read_unforwarded(&self) -> Result<Vec<StagedBatch>> {
        let mut owed: Vec<StagedBatch> = self
            .rows
            .iter()
            .filter(|row| row.awaits_forwarding())
            .map(|row| row.clone())
            .collect();
        owed.sort_by_key(StagedBatch::staged_at);
        Ok(owed)
    }
}

#[derive(Default)]
pub struct InMemoryStreamStore {
    streams: DashMap<StreamId, BTreeMap<EntrySequence, Entry>>,
    failures_to_inject: AtomicUsize,
}

impl InMemoryStreamStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `n` 次追加返回 `UnknownFailure`
    pub fn fail_next_appends(&self, n: usize) {
        self.failures_to_inject.store(n, Ordering::SeqCst);
    }

    /// 流中全部条目（按序号升序）
    pub fn entries(&self, stream_id: StreamId) -> Vec<Entry> {
        self.streams
            .get(&stream_id)
            .map(|log| log.values().cloned().collect())
            .unwrap_or_default()
    }

    fn take_injected_failure(&self) -> bool {
        self.failures_to_inject
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StreamWriter for InMemoryStreamStore {
    async fn append(&self, batch: &EntryBatch) -> WriteResult {
        let (Some(stream_id), Some(first), Some(last)) =
            (batch.stream_id(), batch.first_sequence(), batch.last_sequence())
        else {
            return WriteResult::EmptyInput;
        };

        if self.take_injected_failure() {
            return WriteResult::UnknownFailure;
        }

        // 分片写锁覆盖“检查 + 插入”，等价于存储层的唯一约束
        let mut log = self.streams.entry(stream_id).or_default();
        if log.range(first..=last).next().is_some() {
            return WriteResult::SequenceAlreadyTaken;
        }
        for entry in batch {
            log.insert(entry.sequence(), entry.clone());
        }
        WriteResult::Success
    }
}

#[async_trait]
impl StreamReader for InMemoryStreamStore {
    async fn read_range(
        &self,
        stream_id: StreamId,
        first: EntrySequence,
        last: EntrySequence,
    ) -> Result<Vec<Entry>> {
        if first > last {
            return Err(DomainError::invalid_argument(format!(
                "invalid range: first={first}, last={last}"
            )));
        }
        Ok(self
            .streams
            .get(&stream_id)
            .map(|log| log.range(first..=last).map(|(_, e)| e.clone()).collect())
            .unwrap_or_default())
    }

    async fn next_sequence(&self, stream_id: StreamId) -> Result<EntrySequence> {
        let Some(last) = self
            .streams
            .get(&stream_id)
            .and_then(|log| log.keys().next_back().copied())
        else {
            return Ok(EntrySequence::first());
        };
        last.next().ok_or_else(|| {
            DomainError::stream_store(format!("stream {stream_id} has no sequence left after {last}"))
        })
    }
}
