//! 代理拓扑命名与声明
//!
//! 由限界上下文名称 `B` 派生：交换机与队列均为 `EventSourcing.{B}`，
//! 交换机类型 direct、持久化，队列以同名路由键绑定到交换机。
//!
use crate::error::BrokerResult;
use crate::transport::BrokerChannel;

/// 携带事件类型标识的消息头
pub const EVENT_TYPE_HEADER: &str = "event-type-identifier";
/// 消息内容类型
pub const CONTENT_TYPE: &str = "text/plain";

const NAME_PREFIX: &str = "EventSourcing";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrokerTopology {
    exchange: String,
    queue: String,
    routing_key: String,
}

impl BrokerTopology {
    pub fn for_bounded_context(bounded_context: &str) -> Self {
        let name = format!("{NAME_PREFIX}.{bounded_context}");
        Self {
            exchange: name.clone(),
            queue: name.clone(),
            routing_key: name,
        }
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    /// 在通道上声明交换机、队列与绑定（每个通道创建时一次）
    pub async fn declare(&self, channel: &mut dyn BrokerChannel) -> BrokerResult<()> {
        channel
            .declare_exchange(&self.exchange, true)
            .await?;
        channel.declare_queue(&self.queue, true).await?;
        channel
            .bind_queue(&self.queue, &self.exchange, &self.routing_key)
            .await
    }
}
