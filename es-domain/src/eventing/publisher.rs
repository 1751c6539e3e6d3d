//! 事件发布器（EventPublisher）
//!
//! 编排“暂存 → 追加日志 → 标记暂存结果”：
//! - 先暂存，使条目在高风险的追加步骤之前就已持久，对账作业总有记录可依；
//! - 追加成功后标记 Published，并异步交给总线（不阻塞调用方），
//!   总线接收后再记录“已交付”，未交付的批次由对账作业补发；
//! - 序号冲突标记 FailedToStore 并返回乐观并发错误；
//! - 未知失败保留 Pending，交由对账作业重试。
//!
//! 追加结果一旦确定就如实返回：标记失败只记录日志，由对账作业补齐。
//!
use super::EntryBus;
use crate::entry::{EntryBatch, StagingId};
use crate::error::{DomainError, DomainResult as Result};
use crate::persist::{StagingWriter, StreamWriter, WriteResult};
use bon::Builder;
use std::sync::Arc;

#[derive(Builder)]
pub struct EventPublisher {
    staging: Arc<dyn StagingWriter>,
    stream: Arc<dyn StreamWriter>,
    /// 追加成功后的总线投递（可选）
    bus: Option<Arc<dyn EntryBus>>,
}

impl EventPublisher {
    /// 发布一个批次；空批次直接返回
    pub async fn publish(&self, batch: &EntryBatch) -> Result<()> {
        let Some(stream_id) = batch.stream_id() else {
            return Ok(());
        };
        let batch_size = batch.len();

        let staging_id = self.staging.write(batch).await?;

        match self.stream.append(batch).await {
            WriteResult::Success => {
                if let Err(err) = self.staging.mark_published(staging_id).await {
                    tracing::warn!(
                        %stream_id,
                        %staging_id,
                        error = %err,
                        "batch appended but not marked published, left for reconciliation"
                    );
                }
                tracing::debug!(%stream_id, %staging_id, batch_size, "batch published");
                self.forward_to_bus(staging_id, batch);
                Ok(())
            }
            WriteResult::SequenceAlreadyTaken => {
                if let Err(err) = self.staging.mark_failed_to_store(staging_id).await {
                    tracing::warn!(
                        %stream_id,
                        %staging_id,
                        error = %err,
                        "conflicting batch not marked failed, left for reconciliation"
                    );
                }
                tracing::warn!(%stream_id, %staging_id, batch_size, "sequence already taken");
                Err(DomainError::OptimisticConcurrency {
                    stream_id,
                    batch_size,
                })
            }
            WriteResult::UnknownFailure | WriteResult::EmptyInput => {
                tracing::error!(
                    %stream_id,
                    %staging_id,
                    batch_size,
                    "append failed, batch left pending for reconciliation"
                );
                Err(DomainError::AppendFailed {
                    stream_id,
                    batch_size,
                })
            }
        }
    }

    fn forward_to_bus(&self, staging_id: StagingId, batch: &EntryBatch) {
        let Some(bus) = self.bus.clone() else {
            return;
        };
        let staging = self.staging.clone();
        let entries = batch.entries().to_vec();

        tokio::spawn(async move {
            if let Err(err) = bus.publish_batch(&entries).await {
                tracing::warn!(
                    %staging_id,
                    error = %err,
                    count = entries.len(),
                    "bus publication failed, left for reconciliation"
                );
                return;
            }
            if let Err(err) = staging.mark_forwarded(staging_id).await {
                tracing::warn!(%staging_id, error = %err, "forwarded batch not marked");
            }
        });
    }
}
