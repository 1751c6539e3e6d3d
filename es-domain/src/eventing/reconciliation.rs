//! 对账作业（ReconciliationJob）
//!
//! 周期性扫描超过宽限期仍为 Pending 的暂存批次，并补齐缺失的步骤：
//! - 日志中已存在（按 EntryId 匹配）→ 标记 Published（追加成功但标记丢失）；
//! - 不存在 → 重新追加：成功标记 Published；序号冲突标记 FailedToStore；
//!   未知失败保留 Pending，等待下一轮；
//! - 超过最大尝试次数或最大存活时间的批次标记 FailedToStore，避免无限重试。
//!
//! 配置了总线时，随后把已发布但尚未交付总线的批次（含本轮修复的批次）
//! 按暂存顺序重新转发；同一流中前一个批次转发失败时，本轮不再转发其后的批次。
//!
//! 作业可与在线发布器并发运行，流存储的序号唯一约束是最终仲裁者。
//!
use super::EntryBus;
use crate::entry::{StagingId, StreamId};
use crate::error::{DomainError, DomainResult as Result};
use crate::persist::{
    StagedBatch, StagingReader, StagingStore, StagingWriter, StreamReader, StreamStore,
    StreamWriter, WriteResult,
};
use bon::Builder;
use chrono::{DateTime, TimeDelta, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use std::collections::HashSet;
use std::{sync::Arc, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// 对账配置
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ReconciliationConfig {
    /// 扫描间隔
    #[serde(with = "humantime_serde")]
    pub interval: Duration,
    /// 宽限期：比它年轻的批次可能仍在发布中，跳过
    #[serde(with = "humantime_serde")]
    pub grace_period: Duration,
    /// 单个批次在本进程内的最大重试次数
    pub max_attempts: u32,
    /// 批次自暂存起的最大存活时间
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for ReconciliationConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            grace_period: Duration::from_secs(60),
            max_attempts: 10,
            max_age: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// 单轮对账的结果统计
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// 日志中已存在，仅补标记
    pub published: usize,
    /// 重新追加成功
    pub reappended: usize,
    /// 被其他写入者抢占或放弃重试，标记 FailedToStore
    pub failed: usize,
    /// 重新交付总线
    pub forwarded: usize,
    /// 保留 Pending 或仍欠总线投递，等待下一轮
    pub retried: usize,
    /// 仍在宽限期内
    pub skipped: usize,
}

enum Resolution {
    AlreadyPresent,
    Reappended,
    Conflict,
    Abandoned,
    Retry,
}

#[derive(Builder)]
pub struct ReconciliationJob {
    staging: Arc<dyn StagingStore>,
    stream: Arc<dyn StreamStore>,
    /// 补发未交付批次的总线（可选）
    bus: Option<Arc<dyn EntryBus>>,
    #[builder(default)]
    config: ReconciliationConfig,
    #[builder(skip)]
    attempts: DashMap<StagingId, u32>,
}

impl ReconciliationJob {
    pub fn config(&self) -> &ReconciliationConfig {
        &self.config
    }

    /// 启动周期任务，返回可用于关闭/等待的句柄
    pub fn start(self: Arc<Self>) -> ReconciliationHandle {
        let token = CancellationToken::new();
        let interval = self.config.interval;
        let job = self.clone();

        let task = Self::spawn_periodic(token.clone(), interval, move || {
            let job = job.clone();
            async move {
                if let Err(err) = job.run_once().await {
                    tracing::error!(error = %err, "reconciliation sweep failed");
                }
            }
        });

        ReconciliationHandle { token, task: Some(task) }
    }

    fn spawn_periodic<F, Fut>(
        token: CancellationToken,
        interval: Duration,
        mut f: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send + 'static,
    {
        tokio::spawn(async move {
            let mut ticker = time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => f().await,
                }
            }
        })
    }

    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        self.run_once_at(Utc::now()).await
    }

    /// 以给定时间作为“现在”执行一轮扫描
    pub async fn run_once_at(&self, now: DateTime<Utc>) -> Result<ReconciliationReport> {
        let grace = to_delta(self.config.grace_period);
        let mut report = ReconciliationReport::default();

        let pending = self.staging.read_pending().await?;
        let live: HashSet<StagingId> = pending.iter().map(StagedBatch::staging_id).collect();

        for staged in pending {
            if now - staged.staged_at() < grace {
                report.skipped += 1;
                continue;
            }

            match self.reconcile(&staged, now).await {
                Ok(Resolution::AlreadyPresent) => report.published += 1,
                Ok(Resolution::Reappended) => report.reappended += 1,
                Ok(Resolution::Conflict | Resolution::Abandoned) => report.failed += 1,
                Ok(Resolution::Retry) => report.retried += 1,
                Err(err) => {
                    tracing::warn!(
                        staging_id = %staged.staging_id(),
                        error = %err,
                        "reconciliation of staged batch failed"
                    );
                    report.retried += 1;
                }
            }
        }

        // 被其他写入者终结的批次不再占用计数
        self.attempts.retain(|id, _| live.contains(id));

        if let Some(bus) = &self.bus {
            self.forward_owed(bus.as_ref(), now, grace, &mut report).await?;
        }

        if report != ReconciliationReport::default() {
            tracing::info!(?report, "reconciliation sweep finished");
        }
        Ok(report)
    }

    async fn reconcile(&self, staged: &StagedBatch, now: DateTime<Utc>) -> Result<Resolution> {
        let staging_id = staged.staging_id();
        let batch = staged.batch();
        let (Some(stream_id), Some(first), Some(last)) =
            (batch.stream_id(), batch.first_sequence(), batch.last_sequence())
        else {
            // 空批次不应进入暂存区，直接终结
            self.staging.mark_failed_to_store(staging_id).await?;
            return Ok(Resolution::Abandoned);
        };

        let stored = match self.stream.read_range(stream_id, first, last).await {
            Ok(stored) => stored,
            Err(err) => return self.record_failure(staged, now, err).await,
        };
        let present = stored.len() == batch.len()
            && stored
                .iter()
                .zip(batch.iter())
                .all(|(s, b)| s.entry_id() == b.entry_id() && s.sequence() == b.sequence());

        if present {
            self.staging.mark_published(staging_id).await?;
            self.attempts.remove(&staging_id);
            tracing::info!(%stream_id, %staging_id, "staged batch already in log, marked published");
            return Ok(Resolution::AlreadyPresent);
        }

        match self.stream.append(batch).await {
            WriteResult::Success => {
                self.staging.mark_published(staging_id).await?;
                self.attempts.remove(&staging_id);
                tracing::info!(%stream_id, %staging_id, "staged batch re-appended");
                Ok(Resolution::Reappended)
            }
            WriteResult::SequenceAlreadyTaken => {
                self.staging.mark_failed_to_store(staging_id).await?;
                self.attempts.remove(&staging_id);
                tracing::warn!(%stream_id, %staging_id, "sequence taken by another writer");
                Ok(Resolution::Conflict)
            }
            WriteResult::UnknownFailure | WriteResult::EmptyInput => {
                let err = DomainError::AppendFailed {
                    stream_id,
                    batch_size: batch.len(),
                };
                self.record_failure(staged, now, err).await
            }
        }
    }

    async fn forward_owed(
        &self,
        bus: &dyn EntryBus,
        now: DateTime<Utc>,
        grace: TimeDelta,
        report: &mut ReconciliationReport,
    ) -> Result<()> {
        let mut blocked: HashSet<StreamId> = HashSet::new();

        for staged in self.staging.read_unforwarded().await? {
            let staging_id = staged.staging_id();
            let Some(stream_id) = staged.batch().stream_id() else {
                continue;
            };
            // 在线发布器可能仍在转发
            if now - staged.staged_at() < grace {
                report.skipped += 1;
                continue;
            }
            if blocked.contains(&stream_id) {
                report.retried += 1;
                continue;
            }

            if let Err(err) = bus.publish_batch(staged.batch().entries()).await {
                tracing::warn!(%stream_id, %staging_id, error = %err, "re-forwarding staged batch failed");
                blocked.insert(stream_id);
                report.retried += 1;
                continue;
            }
            match self.staging.mark_forwarded(staging_id).await {
                Ok(()) => {
                    tracing::info!(%stream_id, %staging_id, "staged batch forwarded to bus");
                    report.forwarded += 1;
                }
                Err(err) => {
                    tracing::warn!(%staging_id, error = %err, "forwarded batch not marked");
                    report.retried += 1;
                }
            }
        }
        Ok(())
    }

    async fn record_failure(
        &self,
        staged: &StagedBatch,
        now: DateTime<Utc>,
        err: DomainError,
    ) -> Result<Resolution> {
        let staging_id = staged.staging_id();
        let attempts = {
            let mut counter = self.attempts.entry(staging_id).or_insert(0);
            *counter += 1;
            *counter
        };
        let expired = now - staged.staged_at() >= to_delta(self.config.max_age);

        if attempts >= self.config.max_attempts || expired {
            self.staging.mark_failed_to_store(staging_id).await?;
            self.attempts.remove(&staging_id);
            tracing::error!(
                %staging_id,
                attempts,
                expired,
                error = %err,
                "giving up on staged batch"
            );
            return Ok(Resolution::Abandoned);
        }

        tracing::warn!(%staging_id, attempts, error = %err, "staged batch left pending");
        Ok(Resolution::Retry)
    }
}

fn to_delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

/// 对账作业运行句柄：用于优雅关闭与等待任务结束
pub struct ReconciliationHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ReconciliationHandle {
    pub fn shutdown(&self) {
        self.token.cancel();
    }

    pub async fn join(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ReconciliationHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{
        AppendableStream, Entry, EntryBatch, EntryMetadata, EntrySequence, EventDescriptor,
    };
    use crate::persist::{InMemoryStagingStore, InMemoryStreamStore, StagedOutcome};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 记录收到的条目；可让接下来的若干次发布失败
    #[derive(Default)]
    struct RecordingBus {
        failures_left: AtomicUsize,
        received: Mutex<Vec<Entry>>,
    }

    impl RecordingBus {
        fn sequences(&self) -> Vec<u64> {
            self.received
                .lock()
                .unwrap()
                .iter()
                .map(|e| e.sequence().value())
                .collect()
        }
    }

    #[async_trait]
    impl EntryBus for RecordingBus {
        async fn publish(&self, entry: &Entry) -> Result<()> {
            let refused = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if refused {
                return Err(DomainError::event_bus("broker unavailable"));
            }
            self.received.lock().unwrap().push(entry.clone());
            Ok(())
        }
    }

    struct Fixture {
        staging: Arc<InMemoryStagingStore>,
        stream: Arc<InMemoryStreamStore>,
        job: ReconciliationJob,
    }

    fn fixture(config: ReconciliationConfig) -> Fixture {
        fixture_with_bus(config, None)
    }

    fn fixture_with_bus(config: ReconciliationConfig, bus: Option<Arc<dyn EntryBus>>) -> Fixture {
        let staging = Arc::new(InMemoryStagingStore::new());
        let stream = Arc::new(InMemoryStreamStore::new());
        let job = ReconciliationJob::builder()
            .staging(staging.clone())
            .stream(stream.clone())
            .maybe_bus(bus)
            .config(config)
            .build();
        Fixture {
            staging,
            stream,
            job,
        }
    }

    fn no_grace() -> ReconciliationConfig {
        ReconciliationConfig {
            grace_period: Duration::ZERO,
            ..Default::default()
        }
    }

    fn batch(stream_id: StreamId, n: usize) -> EntryBatch {
        batch_at(stream_id, 0, n)
    }

    fn batch_at(stream_id: StreamId, next: u64, n: usize) -> EntryBatch {
        let mut stream =
            AppendableStream::from_existing(stream_id, EntrySequence::from_value(next));
        for i in 0..n {
            stream.append(
                EventDescriptor::new("cart.item_added", serde_json::json!({ "i": i })),
                EntryMetadata::default(),
            )
            .unwrap();
        }
        stream.take_batch().unwrap()
    }

    #[tokio::test]
    async fn young_batches_are_skipped() {
        let f = fixture(ReconciliationConfig::default());
        f.staging.write(&batch(StreamId::new(), 1)).await.unwrap();

        let report = f.job.run_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(f.staging.read_pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn missing_batch_is_reappended() {
        let f = fixture(no_grace());
        let s = StreamId::new();
        let id = f.staging.write(&batch(s, 2)).await.unwrap();

        let report = f.job.run_once().await.unwrap();
        assert_eq!(report.reappended, 1);
        assert_eq!(f.staging.outcome(id), Some(StagedOutcome::Published));
        assert_eq!(f.stream.entries(s).len(), 2);
    }

    #[tokio::test]
    async fn batch_beaten_by_other_writer_is_marked_failed() {
        let f = fixture(no_grace());
        let s = StreamId::new();
        let id = f.staging.write(&batch(s, 2)).await.unwrap();
        // 另一个写入者占用了相同序号
        assert_eq!(f.stream.append(&batch(s, 2)).await, WriteResult::Success);

        let report = f.job.run_once().await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.staging.outcome(id), Some(StagedOutcome::FailedToStore));
        assert_eq!(f.stream.entries(s).len(), 2);
    }

    #[tokio::test]
    async fn unknown_failure_retries_until_max_attempts() {
        let f = fixture(ReconciliationConfig {
            max_attempts: 2,
            ..no_grace()
        });
        let id = f.staging.write(&batch(StreamId::new(), 1)).await.unwrap();
        f.stream.fail_next_appends(5);

        let first = f.job.run_once().await.unwrap();
        assert_eq!(first.retried, 1);
        assert_eq!(f.staging.outcome(id), Some(StagedOutcome::Pending));

        let second = f.job.run_once().await.unwrap();
        assert_eq!(second.failed, 1);
        assert_eq!(f.staging.outcome(id), Some(StagedOutcome::FailedToStore));
    }

    #[tokio::test]
    async fn expired_batch_is_abandoned_on_first_failure() {
        let f = fixture(ReconciliationConfig {
            max_age: Duration::from_secs(60),
            ..no_grace()
        });
        let id = f.staging.write(&batch(StreamId::new(), 1)).await.unwrap();
        f.stream.fail_next_appends(1);

        let later = Utc::now() + TimeDelta::minutes(5);
        let report = f.job.run_once_at(later).await.unwrap();
        assert_eq!(report.failed, 1);
        assert_eq!(f.staging.outcome(id), Some(StagedOutcome::FailedToStore));
    }

    #[tokio::test]
    async fn started_job_converges_and_shuts_down() {
        let f = fixture(ReconciliationConfig {
            interval: Duration::from_millis(20),
            ..no_grace()
        });
        let s = StreamId::new();
        let id = f.staging.write(&batch(s, 3)).await.unwrap();
        let staging = f.staging.clone();

        let handle = Arc::new(f.job).start();
        let _ = tokio::time::timeout(Duration::from_secs(2), async {
            while staging.outcome(id) != Some(StagedOutcome::Published) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        handle.shutdown();
        handle.join().await;

        assert_eq!(staging.outcome(id), Some(StagedOutcome::Published));
        assert_eq!(f.stream.entries(s).len(), 3);
    }

    #[tokio::test]
    async fn counters_of_batches_resolved_elsewhere_are_dropped() {
        let f = fixture(no_grace());
        let id = f.staging.write(&batch(StreamId::new(), 1)).await.unwrap();
        f.stream.fail_next_appends(1);

        assert_eq!(f.job.run_once().await.unwrap().retried, 1);
        assert_eq!(f.job.attempts.len(), 1);

        // 在线发布器抢先完成了该批次
        f.staging.mark_published(id).await.unwrap();
        f.job.run_once().await.unwrap();
        assert!(f.job.attempts.is_empty());
    }

    #[tokio::test]
    async fn repaired_batches_are_forwarded_to_the_bus() {
        let bus = Arc::new(RecordingBus::default());
        let f = fixture_with_bus(no_grace(), Some(bus.clone()));
        let missing = f.staging.write(&batch(StreamId::new(), 2)).await.unwrap();
        let appended_batch = batch(StreamId::new(), 1);
        let appended = f.staging.write(&appended_batch).await.unwrap();
        assert_eq!(f.stream.append(&appended_batch).await, WriteResult::Success);

        let report = f.job.run_once().await.unwrap();

        assert_eq!(report.reappended, 1);
        assert_eq!(report.published, 1);
        assert_eq!(report.forwarded, 2);
        assert_eq!(bus.received.lock().unwrap().len(), 3);
        for id in [missing, appended] {
            assert!(f.staging.get(id).is_some_and(|row| row.is_forwarded()));
        }
        assert!(f.staging.read_unforwarded().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failed_forward_holds_back_later_batches_of_the_stream() {
        let bus = Arc::new(RecordingBus::default());
        let f = fixture_with_bus(no_grace(), Some(bus.clone()));
        let s = StreamId::new();
        let staged_at = Utc::now() - TimeDelta::seconds(10);
        for (offset, batch) in [batch_at(s, 0, 2), batch_at(s, 2, 2)].into_iter().enumerate() {
            let id = StagingId::new();
            assert_eq!(f.stream.append(&batch).await, WriteResult::Success);
            f.staging.insert(StagedBatch::pending(
                id,
                batch,
                staged_at + TimeDelta::seconds(offset as i64),
            ));
            f.staging.mark_published(id).await.unwrap();
        }
        bus.failures_left.store(1, Ordering::SeqCst);

        let first = f.job.run_once().await.unwrap();
        assert_eq!(first.forwarded, 0);
        assert_eq!(first.retried, 2);
        assert!(bus.sequences().is_empty());

        let second = f.job.run_once().await.unwrap();
        assert_eq!(second.forwarded, 2);
        assert_eq!(bus.sequences(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn forwarding_waits_out_the_grace_period() {
        let bus = Arc::new(RecordingBus::default());
        let f = fixture_with_bus(ReconciliationConfig::default(), Some(bus.clone()));
        let id = f.staging.write(&batch(StreamId::new(), 1)).await.unwrap();
        f.staging.mark_published(id).await.unwrap();

        let report = f.job.run_once().await.unwrap();
        assert_eq!(report.skipped, 1);
        assert!(bus.sequences().is_empty());

        let later = Utc::now() + TimeDelta::minutes(5);
        assert_eq!(f.job.run_once_at(later).await.unwrap().forwarded, 1);
    }
}
