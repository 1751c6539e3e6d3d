//! 发布通道（PublishingChannel）
//!
//! 独占一个代理通道：创建时声明拓扑并开启确认模式，后台确认循环把
//! ack / nack 转交给共享的 `AckTracker`；确认流结束（通道或连接丢失）时，
//! 该通道下全部未解析的发布以失败结束。
//!
use crate::ack_tracker::{AckTracker, DeliveryKey};
use crate::error::{BrokerError, BrokerResult};
use crate::topology::{BrokerTopology, CONTENT_TYPE, EVENT_TYPE_HEADER};
use crate::transport::{BrokerChannel, BrokerConnection, ChannelId, Confirmation, MessageProperties};
use es_domain::entry::Entry;
use es_domain::serializer::EntrySerializer;
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// 每个发布通道共用的发布参数
#[derive(Clone, Debug)]
pub struct PublishSettings {
    pub topology: BrokerTopology,
    pub serializer: EntrySerializer,
    pub publish_timeout: Duration,
}

pub struct PublishingChannel {
    channel: Box<dyn BrokerChannel>,
    tracker: Arc<AckTracker>,
    settings: PublishSettings,
    confirm_loop: JoinHandle<()>,
}

impl PublishingChannel {
    pub async fn open(
        connection: &dyn BrokerConnection,
        tracker: Arc<AckTracker>,
        settings: PublishSettings,
    ) -> BrokerResult<Self> {
        let mut channel = connection.create_channel().await?;
        settings.topology.declare(channel.as_mut()).await?;
        let confirms = channel.confirm_select().await?;

        let id = channel.id();
        let confirm_loop = tokio::spawn(run_confirm_loop(id, confirms, tracker.clone()));
        tracing::debug!(channel = id, exchange = settings.topology.exchange(), "publishing channel opened");

        Ok(Self {
            channel,
            tracker,
            settings,
            confirm_loop,
        })
    }

    pub fn id(&self) -> ChannelId {
        self.channel.id()
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open() && !self.confirm_loop.is_finished()
    }

    /// 发布一个条目并等待代理确认
    ///
    /// 超时、取消、nack 与通道丢失都视为发布失败，消息是否送达未知。
    pub async fn publish(&mut self, entry: &Entry, cancel: &CancellationToken) -> BrokerResult<()> {
        if !self.is_open() {
            return Err(BrokerError::ChannelClosed { channel: self.id() });
        }

        let body = self.settings.serializer.to_bytes(entry)?;
        let properties = MessageProperties::persistent(CONTENT_TYPE)
            .with_header(EVENT_TYPE_HEADER, entry.type_identifier());

        // 先登记再发送，确认不会早于登记到达
        let key = DeliveryKey::new(self.channel.id(), self.channel.next_publish_seq_no());
        let handle = self.tracker.wait_for_acknowledgment(key);

        if let Err(err) = self
            .channel
            .basic_publish(
                self.settings.topology.exchange(),
                self.settings.topology.routing_key(),
                properties,
                body,
            )
            .await
        {
            self.tracker.forget(key);
            return Err(err);
        }

        let timeout = self.settings.publish_timeout;
        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                self.tracker.forget(key);
                Err(BrokerError::Cancelled {
                    channel: key.channel,
                    delivery_tag: key.delivery_tag,
                })
            }
            waited = tokio::time::timeout(timeout, handle.wait()) => match waited {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.tracker.forget(key);
                    Err(BrokerError::PublishTimeout {
                        channel: key.channel,
                        delivery_tag: key.delivery_tag,
                        timeout,
                    })
                }
            },
        };

        match &outcome {
            Ok(()) => tracing::trace!(%key, entry_id = %entry.entry_id(), "publish confirmed"),
            Err(err) => tracing::warn!(
                %key,
                stream_id = %entry.stream_id(),
                sequence = %entry.sequence(),
                error = %err,
                "publish not confirmed"
            ),
        }
        outcome
    }

    /// 关闭通道，尚未解析的发布以失败结束
    pub async fn close(mut self) -> BrokerResult<()> {
        let id = self.id();
        let closed = self.channel.close().await;
        self.tracker.fail_channel(id);
        self.confirm_loop.abort();
        tracing::debug!(channel = id, "publishing channel closed");
        closed
    }
}

async fn run_confirm_loop(
    channel: ChannelId,
    mut confirms: BoxStream<'static, Confirmation>,
    tracker: Arc<AckTracker>,
) {
    while let Some(confirmation) = confirms.next().await {
        match confirmation {
            Confirmation::Ack {
                delivery_tag,
                multiple,
            } => {
                tracker.ack(channel, delivery_tag, multiple);
            }
            Confirmation::Nack {
                delivery_tag,
                multiple,
            } => {
                let resolved = tracker.nack(channel, delivery_tag, multiple);
                tracing::warn!(channel, delivery_tag, multiple, resolved, "broker nacked publish");
            }
        }
    }

    let failed = tracker.fail_channel(channel);
    if failed > 0 {
        tracing::warn!(channel, failed, "confirmation stream ended with pending publishes");
    } else {
        tracing::debug!(channel, "confirmation stream ended");
    }
}
