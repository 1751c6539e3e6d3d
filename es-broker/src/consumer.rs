//! 代理消费者（BrokerConsumer）
//!
//! 从限界上下文队列消费条目并交给分发函数：
//! - prefetch 限制未确认消息数，`dispatch_concurrency` 限制同时分发的数量；
//! - 分发结束（无论成功与否）即确认，处理器失败不由消费者重试；
//! - 分发完成前收到取消则不确认，消息由代理在通道关闭后重新投递；
//! - 无法反序列化的消息拒绝且不重新入队。
//!
use crate::config::BrokerConfig;
use crate::error::{BrokerError, BrokerResult};
use crate::topology::EVENT_TYPE_HEADER;
use crate::transport::{BrokerConnection, Delivery};
use bon::Builder;
use es_domain::entry::Entry;
use es_domain::error::{DomainError, DomainResult};
use es_domain::eventing::EntryDispatcher;
use es_domain::serializer::EntrySerializer;
use futures_util::StreamExt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Builder)]
pub struct BrokerConsumer {
    connection: Arc<dyn BrokerConnection>,
    #[builder(default)]
    serializer: EntrySerializer,
    #[builder(default)]
    config: BrokerConfig,
    #[builder(default = String::from("es-consumer"), into)]
    consumer_tag: String,
}

impl BrokerConsumer {
    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// 消费直到 `cancel` 被触发；通道意外关闭时返回 `ChannelClosed`
    pub async fn run<F, Fut>(&self, dispatch: F, cancel: CancellationToken) -> BrokerResult<()>
    where
        F: Fn(Entry, CancellationToken) -> Fut + Send + Sync,
        Fut: Future<Output = DomainResult<()>> + Send,
    {
        self.config.validate()?;
        let topology = self.config.topology();

        let mut channel = self.connection.create_channel().await?;
        let channel_id = channel.id();
        topology.declare(channel.as_mut()).await?;
        channel.basic_qos(self.config.prefetch_count).await?;
        let deliveries = channel
            .basic_consume(topology.queue(), &self.consumer_tag)
            .await?;

        tracing::info!(
            queue = topology.queue(),
            consumer_tag = %self.consumer_tag,
            prefetch = self.config.prefetch_count,
            concurrency = self.config.dispatch_concurrency,
            "consumer started"
        );

        deliveries
            .take_until(cancel.clone().cancelled_owned())
            .for_each_concurrent(self.config.dispatch_concurrency, |delivery| {
                self.handle(delivery, &dispatch, &cancel)
            })
            .await;

        if let Err(err) = channel.close().await {
            tracing::debug!(channel = channel_id, error = %err, "consumer channel close failed");
        }
        if !cancel.is_cancelled() {
            tracing::warn!(channel = channel_id, "consumer channel closed unexpectedly");
            return Err(BrokerError::ChannelClosed {
                channel: channel_id,
            });
        }
        tracing::info!(consumer_tag = %self.consumer_tag, "consumer stopped");
        Ok(())
    }

    /// 以条目分发器作为分发函数运行
    pub async fn run_with_dispatcher(
        &self,
        dispatcher: Arc<EntryDispatcher>,
        cancel: CancellationToken,
    ) -> BrokerResult<()> {
        self.run(
            move |entry, cancel| {
                let dispatcher = dispatcher.clone();
                async move { dispatcher.dispatch(&entry, &cancel).await }
            },
            cancel,
        )
        .await
    }

    async fn handle<F, Fut>(&self, delivery: Delivery, dispatch: &F, cancel: &CancellationToken)
    where
        F: Fn(Entry, CancellationToken) -> Fut,
        Fut: Future<Output = DomainResult<()>>,
    {
        let delivery_tag = delivery.delivery_tag;
        let entry = match self.serializer.from_bytes(&delivery.body) {
            Ok(entry) => entry,
            Err(err) => {
                tracing::error!(
                    delivery_tag,
                    event_type = delivery.properties.header(EVENT_TYPE_HEADER),
                    error = %err,
                    "undecodable delivery rejected"
                );
                if let Err(err) = delivery.reject(false).await {
                    tracing::warn!(delivery_tag, error = %err, "reject failed");
                }
                return;
            }
        };

        let entry_id = entry.entry_id();
        let event_type = entry.type_identifier().to_string();
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            outcome = dispatch(entry, cancel.clone()) => Some(outcome),
        };

        match outcome {
            None | Some(Err(DomainError::Cancelled)) => {
                tracing::debug!(delivery_tag, %entry_id, "dispatch cancelled, delivery left unacknowledged");
                return;
            }
            Some(Err(err)) => tracing::error!(
                delivery_tag,
                %entry_id,
                %event_type,
                redelivered = delivery.redelivered,
                error = %err,
                "dispatch failed, acknowledging without retry"
            ),
            Some(Ok(())) => tracing::trace!(delivery_tag, %entry_id, "dispatched"),
        }

        if let Err(err) = delivery.ack().await {
            tracing::warn!(delivery_tag, %entry_id, error = %err, "ack failed");
        }
    }
}
