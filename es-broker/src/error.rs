//! 代理侧错误定义
//!
//! 发布失败（超时、nack、连接丢失、取消）只影响总线投递，
//! 不回滚已经提交的暂存/日志写入。
//!
use crate::transport::{ChannelId, DeliveryTag};
use es_domain::error::DomainError;
use std::time::Duration;
use thiserror::Error;

#[non_exhaustive]
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("broker transport error: {reason}")]
    Transport { reason: String },
    #[error("invalid broker config: {reason}")]
    InvalidConfig { reason: String },
    #[error("channel closed: channel={channel}")]
    ChannelClosed { channel: ChannelId },
    #[error("publish nacked: channel={channel}, delivery_tag={delivery_tag}")]
    Nacked {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    },
    #[error("publish confirmation timed out after {timeout:?}: channel={channel}, delivery_tag={delivery_tag}")]
    PublishTimeout {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        timeout: Duration,
    },
    #[error("publish cancelled: channel={channel}, delivery_tag={delivery_tag}")]
    Cancelled {
        channel: ChannelId,
        delivery_tag: DeliveryTag,
    },
    #[error("channel pool is shut down")]
    ShutDown,
    #[error(transparent)]
    Domain(#[from] DomainError),
}

impl BrokerError {
    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// 消息可能已送达也可能没有，调用方只能视为“结果未知”
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(
            self,
            Self::PublishTimeout { .. } | Self::Cancelled { .. } | Self::ChannelClosed { .. }
        )
    }
}

pub type BrokerResult<T> = Result<T, BrokerError>;

impl From<BrokerError> for DomainError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Domain(inner) => inner,
            other => DomainError::event_bus(other.to_string()),
        }
    }
}
