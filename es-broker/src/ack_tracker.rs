//! 发布确认跟踪器（AckTracker）
//!
//! 以（通道, 投递标签）为键的并发表，保存等待代理确认的发布调用：
//! - 发布前先登记，避免确认先于登记到达；
//! - ack 解析为成功，nack 解析为失败；`multiple` 时一并解析同通道内
//!   不大于该标签的全部待确认项；
//! - 通道或连接丢失时，该通道下全部未解析项以失败结束。
//!
//! 这是多个发布工作者之间唯一真正共享的结构。
//!
use crate::error::{BrokerError, BrokerResult};
use crate::transport::{ChannelId, DeliveryTag};
use dashmap::DashMap;
use std::fmt;
use tokio::sync::oneshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeliveryKey {
    pub channel: ChannelId,
    pub delivery_tag: DeliveryTag,
}

impl DeliveryKey {
    pub const fn new(channel: ChannelId, delivery_tag: DeliveryTag) -> Self {
        Self {
            channel,
            delivery_tag,
        }
    }
}

impl fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.channel, self.delivery_tag)
    }
}

/// 待确认句柄
pub struct AckHandle {
    key: DeliveryKey,
    rx: oneshot::Receiver<BrokerResult<()>>,
}

impl AckHandle {
    pub fn key(&self) -> DeliveryKey {
        self.key
    }

    /// 等待确认结果；发送端被丢弃（登记被覆盖或跟踪器被释放）视为通道关闭
    pub async fn wait(self) -> BrokerResult<()> {
        match self.rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(BrokerError::ChannelClosed {
                channel: self.key.channel,
            }),
        }
    }
}

#[derive(Default)]
pub struct AckTracker {
    pending: DashMap<DeliveryKey, oneshot::Sender<BrokerResult<()>>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记一个待确认的发布，须在真正发送之前调用
    pub fn wait_for_acknowledgment(&self, key: DeliveryKey) -> AckHandle {
        let (tx, rx) = oneshot::channel();
        if self.pending.insert(key, tx).is_some() {
            tracing::warn!(%key, "delivery tag registered twice, previous waiter dropped");
        }
        AckHandle { key, rx }
    }

    /// 处理 ack，返回被解析的待确认项数量
    pub fn ack(&self, channel: ChannelId, delivery_tag: DeliveryTag, multiple: bool) -> usize {
        self.resolve(channel, delivery_tag, multiple, |_| Ok(()))
    }

    /// 处理 nack，返回被解析的待确认项数量
    pub fn nack(&self, channel: ChannelId, delivery_tag: DeliveryTag, multiple: bool) -> usize {
        self.resolve(channel, delivery_tag, multiple, |key| {
            Err(BrokerError::Nacked {
                channel: key.channel,
                delivery_tag: key.delivery_tag,
            })
        })
    }

    /// 通道丢失：以失败结束该通道下全部未解析项
    pub fn fail_channel(&self, channel: ChannelId) -> usize {
        let keys: Vec<DeliveryKey> = self
            .pending
            .iter()
            .map(|e| *e.key())
            .filter(|k| k.channel == channel)
            .collect();

        self.complete(keys, |key| {
            Err(BrokerError::ChannelClosed {
                channel: key.channel,
            })
        })
    }

    /// 放弃等待（超时、取消或发送失败），不通知任何一方
    pub fn forget(&self, key: DeliveryKey) {
        self.pending.remove(&key);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    fn resolve(
        &self,
        channel: ChannelId,
        delivery_tag: DeliveryTag,
        multiple: bool,
        outcome: impl Fn(DeliveryKey) -> BrokerResult<()>,
    ) -> usize {
        let keys = if multiple {
            self.pending
                .iter()
                .map(|e| *e.key())
                .filter(|k| k.channel == channel && k.delivery_tag <= delivery_tag)
                .collect()
        } else {
            vec![DeliveryKey::new(channel, delivery_tag)]
        };

        self.complete(keys, outcome)
    }

    fn complete(
        &self,
        keys: Vec<DeliveryKey>,
        outcome: impl Fn(DeliveryKey) -> BrokerResult<()>,
    ) -> usize {
        let mut resolved = 0;
        for key in keys {
            if let Some((key, tx)) = self.pending.remove(&key) {
                // 等待方可能已超时放弃
                let _ = tx.send(outcome(key));
                resolved += 1;
            }
        }
        resolved
    }
}
