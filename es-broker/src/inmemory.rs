//! 内存版代理（InMemoryBroker）
//!
//! 满足 `BrokerConnection` / `BrokerChannel` 协议的轻量实现，典型用途：测试环境、
//! 示例与本地开发。
//! - 发布确认：按 `ConfirmBehavior` 回送 ack / nack（被 nack 的消息不入队），
//!   或保持沉默以模拟确认丢失；
//! - 消费：按 prefetch 限制未确认数量，通道关闭时未确认消息以 `redelivered`
//!   标记重新入队；
//! - `disconnect`：模拟连接断开，关闭当前全部通道，之后新建的通道可正常使用。
//!
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{
    Acknowledger, BrokerChannel, BrokerConnection, ChannelId, Confirmation, Delivery, DeliveryTag,
    MessageProperties,
};
use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use futures_core::stream::BoxStream;
use futures_util::StreamExt;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;

/// 发布确认行为
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmBehavior {
    #[default]
    Ack,
    Nack,
    /// 不回送任何确认
    Silent,
}

#[derive(Clone)]
struct StoredMessage {
    properties: MessageProperties,
    body: Vec<u8>,
    redelivered: bool,
}

#[derive(Default)]
struct QueueState {
    ready: Mutex<VecDeque<StoredMessage>>,
    notify: Notify,
}

impl QueueState {
    fn ready(&self) -> MutexGuard<'_, VecDeque<StoredMessage>> {
        self.ready.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn push(&self, message: StoredMessage) {
        self.ready().push_back(message);
        self.notify.notify_one();
    }

    fn requeue(&self, mut message: StoredMessage) {
        message.redelivered = true;
        self.ready().push_front(message);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<StoredMessage> {
        self.ready().pop_front()
    }
}

#[derive(Default)]
struct BrokerState {
    next_channel_id: AtomicU64,
    exchanges: DashSet<String>,
    /// (交换机, 路由键) -> 队列
    bindings: DashMap<(String, String), Vec<String>>,
    queues: DashMap<String, Arc<QueueState>>,
    confirm_behavior: Mutex<ConfirmBehavior>,
    connection: Mutex<CancellationToken>,
}

impl BrokerState {
    fn route(&self, exchange: &str, routing_key: &str) -> BrokerResult<Vec<Arc<QueueState>>> {
        if !self.exchanges.contains(exchange) {
            return Err(BrokerError::transport(format!("no exchange '{exchange}'")));
        }
        let names: Vec<String> = self
            .bindings
            .get(&(exchange.to_string(), routing_key.to_string()))
            .map(|queues| queues.clone())
            .unwrap_or_default();

        Ok(names
            .iter()
            .filter_map(|name| self.queues.get(name).map(|q| q.clone()))
            .collect())
    }

    fn confirm_behavior(&self) -> ConfirmBehavior {
        *self
            .confirm_behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn connection_token(&self) -> CancellationToken {
        self.connection
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// 内存代理，克隆后共享同一份状态
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<BrokerState>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_confirm_behavior(&self, behavior: ConfirmBehavior) {
        *self
            .state
            .confirm_behavior
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = behavior;
    }

    /// 断开连接：关闭当前全部通道
    pub fn disconnect(&self) {
        let old = std::mem::replace(
            &mut *self
                .state
                .connection
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
            CancellationToken::new(),
        );
        old.cancel();
        tracing::debug!("in-memory broker connection dropped");
    }

    /// 队列中待投递（未被消费者取走）的消息数
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state
            .queues
            .get(queue)
            .map(|q| q.ready().len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl BrokerConnection for InMemoryBroker {
    async fn create_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>> {
        let id = self.state.next_channel_id.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(InMemoryChannel {
            id,
            state: self.state.clone(),
            token: self.state.connection_token().child_token(),
            next_seq: 1,
            confirms: None,
            prefetch: 0,
        }))
    }
}

pub struct InMemoryChannel {
    id: ChannelId,
    state: Arc<BrokerState>,
    token: CancellationToken,
    next_seq: DeliveryTag,
    confirms: Option<mpsc::UnboundedSender<Confirmation>>,
    prefetch: u16,
}

impl InMemoryChannel {
    fn ensure_open(&self) -> BrokerResult<()> {
        if self.token.is_cancelled() {
            return Err(BrokerError::ChannelClosed { channel: self.id });
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> BrokerResult<Arc<QueueState>> {
        self.state
            .queues
            .get(name)
            .map(|q| q.clone())
            .ok_or_else(|| BrokerError::transport(format!("no queue '{name}'")))
    }
}

#[async_trait]
impl BrokerChannel for InMemoryChannel {
    fn id(&self) -> ChannelId {
        self.id
    }

    fn is_open(&self) -> bool {
        !self.token.is_cancelled()
    }

    async fn declare_exchange(&mut self, name: &str, _durable: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        self.state.exchanges.insert(name.to_string());
        Ok(())
    }

    async fn declare_queue(&mut self, name: &str, _durable: bool) -> BrokerResult<()> {
        self.ensure_open()?;
        self.state.queues.entry(name.to_string()).or_default();
        Ok(())
    }

    async fn bind_queue(
        &mut self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        self.queue(queue)?;
        if !self.state.exchanges.contains(exchange) {
            return Err(BrokerError::transport(format!("no exchange '{exchange}'")));
        }
        let mut bound = self
            .state
            .bindings
            .entry((exchange.to_string(), routing_key.to_string()))
            .or_default();
        if !bound.iter().any(|q| q == queue) {
            bound.push(queue.to_string());
        }
        Ok(())
    }

    async fn confirm_select(&mut self) -> BrokerResult<BoxStream<'static, Confirmation>> {
        self.ensure_open()?;
        let (tx, rx) = mpsc::unbounded_channel();
        self.confirms = Some(tx);
        Ok(UnboundedReceiverStream::new(rx)
            .take_until(self.token.clone().cancelled_owned())
            .boxed())
    }

    fn next_publish_seq_no(&self) -> DeliveryTag {
        self.next_seq
    }

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()> {
        self.ensure_open()?;
        let queues = self.state.route(exchange, routing_key)?;
        let delivery_tag = self.next_seq;
        self.next_seq += 1;

        let behavior = self.state.confirm_behavior();
        // 被 nack 的消息不入队
        if behavior != ConfirmBehavior::Nack {
            let message = StoredMessage {
                properties,
                body,
                redelivered: false,
            };
            for queue in queues {
                queue.push(message.clone());
            }
        }

        if let Some(confirms) = &self.confirms {
            let confirmation = match behavior {
                ConfirmBehavior::Ack => Some(Confirmation::Ack {
                    delivery_tag,
                    multiple: false,
                }),
                ConfirmBehavior::Nack => Some(Confirmation::Nack {
                    delivery_tag,
                    multiple: false,
                }),
                ConfirmBehavior::Silent => None,
            };
            if let Some(confirmation) = confirmation {
                let _ = confirms.send(confirmation);
            }
        }
        Ok(())
    }

    async fn basic_qos(&mut self, prefetch_count: u16) -> BrokerResult<()> {
        self.ensure_open()?;
        self.prefetch = prefetch_count;
        Ok(())
    }

    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, Delivery>> {
        self.ensure_open()?;
        let queue = self.queue(queue)?;
        let permits = match self.prefetch {
            0 => Semaphore::MAX_PERMITS,
            n => n as usize,
        };
        let acker = Arc::new(InMemoryAcker {
            channel: self.id,
            queue,
            token: self.token.clone(),
            unacked: DashMap::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(pump(
            acker,
            Arc::new(Semaphore::new(permits)),
            tx,
            consumer_tag.to_string(),
        ));
        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn close(&mut self) -> BrokerResult<()> {
        self.token.cancel();
        self.confirms = None;
        Ok(())
    }
}

impl Drop for InMemoryChannel {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

async fn pump(
    acker: Arc<InMemoryAcker>,
    prefetch: Arc<Semaphore>,
    tx: mpsc::UnboundedSender<Delivery>,
    consumer_tag: String,
) {
    let mut next_tag: DeliveryTag = 1;
    loop {
        let permit = tokio::select! {
            biased;
            _ = acker.token.cancelled() => break,
            _ = tx.closed() => break,
            permit = prefetch.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };
        let Some(message) = next_message(&acker, &tx).await else {
            break;
        };

        let delivery = Delivery::new(
            next_tag,
            message.redelivered,
            message.properties.clone(),
            message.body.clone(),
            acker.clone(),
        );
        acker.unacked.insert(next_tag, (message, permit));
        if tx.send(delivery).is_err() {
            break;
        }
        next_tag += 1;
    }

    // 未确认的消息重新入队，交给下一个消费者
    let tags: Vec<DeliveryTag> = acker.unacked.iter().map(|e| *e.key()).collect();
    let requeued = tags.len();
    for tag in tags.into_iter().rev() {
        if let Some((_, (message, _permit))) = acker.unacked.remove(&tag) {
            acker.queue.requeue(message);
        }
    }
    tracing::debug!(
        channel = acker.channel,
        %consumer_tag,
        requeued,
        "in-memory consumer stopped"
    );
}

async fn next_message(
    acker: &InMemoryAcker,
    tx: &mpsc::UnboundedSender<Delivery>,
) -> Option<StoredMessage> {
    loop {
        if let Some(message) = acker.queue.pop() {
            return Some(message);
        }
        tokio::select! {
            biased;
            _ = acker.token.cancelled() => return None,
            _ = tx.closed() => return None,
            _ = acker.queue.notify.notified() => {}
        }
    }
}

struct InMemoryAcker {
    channel: ChannelId,
    queue: Arc<QueueState>,
    token: CancellationToken,
    unacked: DashMap<DeliveryTag, (StoredMessage, OwnedSemaphorePermit)>,
}

impl InMemoryAcker {
    fn settle(&self, delivery_tag: DeliveryTag) -> BrokerResult<StoredMessage> {
        if self.token.is_cancelled() {
            return Err(BrokerError::ChannelClosed {
                channel: self.channel,
            });
        }
        self.unacked
            .remove(&delivery_tag)
            .map(|(_, (message, _permit))| message)
            .ok_or_else(|| {
                BrokerError::transport(format!("unknown delivery tag {delivery_tag}"))
            })
    }
}

#[async_trait]
impl Acknowledger for InMemoryAcker {
    async fn ack(&self, delivery_tag: DeliveryTag) -> BrokerResult<()> {
        self.settle(delivery_tag).map(|_| ())
    }

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> BrokerResult<()> {
        let message = self.settle(delivery_tag)?;
        if requeue {
            self.queue.requeue(message);
        }
        Ok(())
    }
}
