//! 条目总线（EntryBus）协议
//!
//! 发布器在条目成功追加并标记后，通过该协议把条目交给消息总线，
//! 与具体传输实现（如 AMQP 代理）解耦。
//!
//! 投递语义是至少一次：失败或中断的投递由对账作业整批重发。
//! 单个批次内保持流内顺序；同一流的不同批次由各自的任务转发，
//! 总线上的先后不作保证，消费方按条目序号判断先后。
//!
use crate::{entry::Entry, error::DomainResult as Result};
use async_trait::async_trait;

/// 条目总线：负责把已持久化的条目投递到消息系统
#[async_trait]
pub trait EntryBus: Send + Sync {
    async fn publish(&self, entry: &Entry) -> Result<()>;

    /// 按顺序发布，遇到第一个失败即返回；调用方整批重试
    async fn publish_batch(&self, entries: &[Entry]) -> Result<()> {
        for entry in entries {
            self.publish(entry).await?;
        }
        Ok(())
    }
}
