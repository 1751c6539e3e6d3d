//! 代理配置
//!
use crate::error::{BrokerError, BrokerResult};
use crate::topology::BrokerTopology;
use serde::Deserialize;
use std::time::Duration;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// 限界上下文名称，决定交换机/队列/路由键命名
    pub bounded_context: String,
    /// 消费者未确认消息上限
    pub prefetch_count: u16,
    /// 同时交给分发函数的消息数上限
    pub dispatch_concurrency: usize,
    /// 等待发布确认的超时
    #[serde(with = "humantime_serde")]
    pub publish_timeout: Duration,
    /// 发布通道池的槽位数（每个槽位一个独占通道）
    pub channel_pool_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            bounded_context: "Default".to_string(),
            prefetch_count: 100,
            dispatch_concurrency: 16,
            publish_timeout: Duration::from_secs(9),
            channel_pool_size: 4,
        }
    }
}

impl BrokerConfig {
    pub fn for_bounded_context(bounded_context: impl Into<String>) -> Self {
        Self {
            bounded_context: bounded_context.into(),
            ..Default::default()
        }
    }

    pub fn topology(&self) -> BrokerTopology {
        BrokerTopology::for_bounded_context(&self.bounded_context)
    }

    pub fn validate(&self) -> BrokerResult<()> {
        if self.bounded_context.trim().is_empty() {
            return Err(BrokerError::invalid_config("bounded_context must not be empty"));
        }
        if self.prefetch_count == 0 {
            return Err(BrokerError::invalid_config("prefetch_count must be positive"));
        }
        if self.dispatch_concurrency == 0 {
            return Err(BrokerError::invalid_config(
                "dispatch_concurrency must be positive",
            ));
        }
        if self.channel_pool_size == 0 {
            return Err(BrokerError::invalid_config("channel_pool_size must be positive"));
        }
        Ok(())
    }
}
