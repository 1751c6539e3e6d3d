//! 代理传输协议
//!
//! 对 AMQP 风格代理客户端的最小抽象：连接创建通道，通道负责拓扑声明、
//! 确认模式下的发布、限流消费。底层通道对象不支持并发使用，
//! 因此通道方法以 `&mut self` 接收，由所有权保证单一使用者。
//!
use crate::error::BrokerResult;
use async_trait::async_trait;
use futures_core::stream::BoxStream;
use std::collections::BTreeMap;
use std::sync::Arc;

/// 通道标识（连接内唯一）
pub type ChannelId = u64;
/// 投递标签：发布侧为通道内单调递增的发布序号，消费侧为通道内的投递序号
pub type DeliveryTag = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub persistent: bool,
    pub content_type: Option<String>,
    pub headers: BTreeMap<String, String>,
}

impl MessageProperties {
    pub fn persistent(content_type: &str) -> Self {
        Self {
            persistent: true,
            content_type: Some(content_type.to_string()),
            headers: BTreeMap::new(),
        }
    }

    pub fn with_header(mut self, key: &str, value: &str) -> Self {
        self.headers.insert(key.to_string(), value.to_string());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// 发布确认事件（来自通道的接收循环）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Confirmation {
    Ack {
        delivery_tag: DeliveryTag,
        multiple: bool,
    },
    Nack {
        delivery_tag: DeliveryTag,
        multiple: bool,
    },
}

/// 消费侧确认：与投递绑定，可在分发任务中并发调用
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self, delivery_tag: DeliveryTag) -> BrokerResult<()>;

    async fn reject(&self, delivery_tag: DeliveryTag, requeue: bool) -> BrokerResult<()>;
}

/// 一条投递给消费者的消息
pub struct Delivery {
    pub delivery_tag: DeliveryTag,
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
    acker: Arc<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: DeliveryTag,
        redelivered: bool,
        properties: MessageProperties,
        body: Vec<u8>,
        acker: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            redelivered,
            properties,
            body,
            acker,
        }
    }

    pub async fn ack(&self) -> BrokerResult<()> {
        self.acker.ack(self.delivery_tag).await
    }

    pub async fn reject(&self, requeue: bool) -> BrokerResult<()> {
        self.acker.reject(self.delivery_tag, requeue).await
    }
}

/// 代理连接：负责创建通道
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> BrokerResult<Box<dyn BrokerChannel>>;
}

/// 代理通道：同一时刻只允许一个使用者
#[async_trait]
pub trait BrokerChannel: Send {
    fn id(&self) -> ChannelId;

    fn is_open(&self) -> bool;

    /// 声明直连（direct）交换机；重复声明是幂等的
    async fn declare_exchange(&mut self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn declare_queue(&mut self, name: &str, durable: bool) -> BrokerResult<()>;

    async fn bind_queue(&mut self, queue: &str, exchange: &str, routing_key: &str)
    -> BrokerResult<()>;

    /// 开启发布确认模式，返回确认事件流；流结束表示通道已关闭
    async fn confirm_select(&mut self) -> BrokerResult<BoxStream<'static, Confirmation>>;

    /// 下一次发布将使用的投递标签
    fn next_publish_seq_no(&self) -> DeliveryTag;

    async fn basic_publish(
        &mut self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BrokerResult<()>;

    async fn basic_qos(&mut self, prefetch_count: u16) -> BrokerResult<()>;

    /// 开始消费，返回投递流；流结束表示消费已终止
    async fn basic_consume(
        &mut self,
        queue: &str,
        consumer_tag: &str,
    ) -> BrokerResult<BoxStream<'static, Delivery>>;

    async fn close(&mut self) -> BrokerResult<()>;
}
