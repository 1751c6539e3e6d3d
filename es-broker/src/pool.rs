//! 发布通道池（ChannelPool）
//!
//! 按工作者下标划分的槽位数组，每个槽位至多持有一个发布通道：
//! - 首次使用时惰性打开，通道关闭后在下次获取时重新打开；
//! - 获取返回槽位的独占守卫，同一通道不会被并发的发布调用共享；
//! - 同一流的条目总是映射到同一工作者，保持流内的发布顺序；
//! - `shutdown` 关闭全部通道，之后的获取返回 `ShutDown`。
//!
use crate::ack_tracker::AckTracker;
use crate::channel::{PublishSettings, PublishingChannel};
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::transport::BrokerConnection;
use es_domain::entry::StreamId;
use es_domain::serializer::EntrySerializer;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{MappedMutexGuard, Mutex, MutexGuard};

pub struct ChannelPool {
    connection: Arc<dyn BrokerConnection>,
    tracker: Arc<AckTracker>,
    settings: PublishSettings,
    slots: Vec<Mutex<Option<PublishingChannel>>>,
    closed: AtomicBool,
}

impl ChannelPool {
    pub fn new(
        connection: Arc<dyn BrokerConnection>,
        config: &BrokerConfig,
        serializer: EntrySerializer,
    ) -> BrokerResult<Self> {
        config.validate()?;
        Ok(Self {
            connection,
            tracker: Arc::new(AckTracker::new()),
            settings: PublishSettings {
                topology: config.topology(),
                serializer,
                publish_timeout: config.publish_timeout,
            },
            slots: (0..config.channel_pool_size).map(|_| Mutex::new(None)).collect(),
            closed: AtomicBool::new(false),
        })
    }

    pub fn size(&self) -> usize {
        self.slots.len()
    }

    pub fn tracker(&self) -> &Arc<AckTracker> {
        &self.tracker
    }

    pub fn is_shut_down(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// 流到工作者下标的稳定映射
    pub fn worker_for(&self, stream_id: &StreamId) -> usize {
        let mut hasher = DefaultHasher::new();
        stream_id.hash(&mut hasher);
        (hasher.finish() % self.slots.len() as u64) as usize
    }

    /// 独占获取工作者的发布通道，必要时打开或重开
    pub async fn acquire(&self, worker: usize) -> BrokerResult<MappedMutexGuard<'_, PublishingChannel>> {
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }
        let mut slot = self.slots[worker % self.slots.len()].lock().await;
        if self.is_shut_down() {
            return Err(BrokerError::ShutDown);
        }

        if let Some(stale) = slot.take_if(|channel| !channel.is_open()) {
            tracing::debug!(worker, channel = stale.id(), "discarding closed publishing channel");
            let _ = stale.close().await;
        }
        if slot.is_none() {
            let channel = PublishingChannel::open(
                self.connection.as_ref(),
                self.tracker.clone(),
                self.settings.clone(),
            )
            .await?;
            tracing::debug!(worker, channel = channel.id(), "publishing channel assigned");
            *slot = Some(channel);
        }

        MutexGuard::try_map(slot, Option::as_mut)
            .map_err(|_| BrokerError::transport("publishing channel slot is empty"))
    }

    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        for slot in &self.slots {
            if let Some(channel) = slot.lock().await.take() {
                let id = channel.id();
                if let Err(err) = channel.close().await {
                    tracing::warn!(channel = id, error = %err, "failed to close publishing channel");
                }
            }
        }
        tracing::info!("channel pool shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inmemory::InMemoryBroker;

    fn pool(broker: &InMemoryBroker, size: usize) -> ChannelPool {
        let config = BrokerConfig {
            channel_pool_size: size,
            ..BrokerConfig::for_bounded_context("Pool")
        };
        ChannelPool::new(Arc::new(broker.clone()), &config, EntrySerializer::default()).unwrap()
    }

    #[tokio::test]
    async fn same_worker_reuses_its_channel() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker, 2);

        let first = pool.acquire(0).await.unwrap().id();
        let again = pool.acquire(0).await.unwrap().id();
        let other = pool.acquire(1).await.unwrap().id();

        assert_eq!(first, again);
        assert_ne!(first, other);
    }

    #[tokio::test]
    async fn closed_channel_is_reopened_lazily() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker, 1);
        let before = pool.acquire(0).await.unwrap().id();

        broker.disconnect();
        let after = pool.acquire(0).await.unwrap();
        assert!(after.is_open());
        assert_ne!(after.id(), before);
    }

    #[tokio::test]
    async fn stream_maps_to_a_stable_worker() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker, 4);
        let stream_id = StreamId::new();
        let worker = pool.worker_for(&stream_id);
        assert!(worker < 4);
        assert_eq!(pool.worker_for(&stream_id), worker);
    }

    #[tokio::test]
    async fn acquire_after_shutdown_fails() {
        let broker = InMemoryBroker::new();
        let pool = pool(&broker, 1);
        drop(pool.acquire(0).await.unwrap());

        pool.shutdown().await;
        assert!(matches!(pool.acquire(0).await, Err(BrokerError::ShutDown)));
    }

    #[test]
    fn zero_sized_pool_is_rejected() {
        let config = BrokerConfig {
            channel_pool_size: 0,
            ..Default::default()
        };
        let result = ChannelPool::new(
            Arc::new(InMemoryBroker::new()),
            &config,
            EntrySerializer::default(),
        );
        assert!(matches!(result, Err(BrokerError::InvalidConfig { .. })));
    }
}
