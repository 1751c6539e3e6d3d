//! 代理发布器（BrokerPublisher）
//!
//! `EntryBus` 的代理实现：事件发布器在批次落盘后把条目交给它，
//! 它按流选择工作者通道逐条发布并等待确认。发布失败只影响总线投递。
//!
use crate::config::BrokerConfig;
use crate::error::BrokerResult;
use crate::pool::ChannelPool;
use crate::transport::BrokerConnection;
use async_trait::async_trait;
use es_domain::entry::Entry;
use es_domain::error::DomainResult;
use es_domain::eventing::EntryBus;
use es_domain::serializer::EntrySerializer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

pub struct BrokerPublisher {
    pool: Arc<ChannelPool>,
    shutdown: CancellationToken,
}

impl BrokerPublisher {
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        Self {
            pool,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn connect(
        connection: Arc<dyn BrokerConnection>,
        config: &BrokerConfig,
        serializer: EntrySerializer,
    ) -> BrokerResult<Self> {
        Ok(Self::new(Arc::new(ChannelPool::new(connection, config, serializer)?)))
    }

    pub fn pool(&self) -> &Arc<ChannelPool> {
        &self.pool
    }

    /// 发布单个条目；`cancel` 只中止本地等待，已发出的消息不会撤回
    pub async fn publish_with(&self, entry: &Entry, cancel: &CancellationToken) -> BrokerResult<()> {
        let mut channel = self.pool.acquire(self.pool.worker_for(&entry.stream_id())).await?;
        channel.publish(entry, cancel).await
    }

    /// 在同一工作者通道上按顺序发布，遇到第一个失败即返回
    pub async fn publish_all_with(
        &self,
        entries: &[Entry],
        cancel: &CancellationToken,
    ) -> BrokerResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };
        let worker = self.pool.worker_for(&first.stream_id());
        let mut channel = self.pool.acquire(worker).await?;
        for entry in entries {
            if entry.stream_id() != first.stream_id() {
                drop(channel);
                channel = self.pool.acquire(self.pool.worker_for(&entry.stream_id())).await?;
            }
            channel.publish(entry, cancel).await?;
        }
        Ok(())
    }

    /// 中止所有等待中的发布并关闭通道池
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.pool.shutdown().await;
    }
}

#[async_trait]
impl EntryBus for BrokerPublisher {
    async fn publish(&self, entry: &Entry) -> DomainResult<()> {
        Ok(self.publish_with(entry, &self.shutdown).await?)
    }

    async fn publish_batch(&self, entries: &[Entry]) -> DomainResult<()> {
        Ok(self.publish_all_with(entries, &self.shutdown).await?)
    }
}
