//! 事件条目的消息代理集成
//!
//! - 拓扑：`EventSourcing.{限界上下文}` 命名的 direct 交换机与持久化队列；
//! - 传输协议：`BrokerConnection` / `BrokerChannel`，以及内存实现 `InMemoryBroker`；
//! - 发布：`AckTracker` 关联发布确认，`ChannelPool` 为每个工作者提供独占通道，
//!   `BrokerPublisher` 作为 `EntryBus` 接入事件发布器；
//! - 消费：`BrokerConsumer` 在 prefetch 与并发上限内分发条目并确认。
//!
pub mod ack_tracker;
pub mod channel;
pub mod config;
pub mod consumer;
pub mod error;
pub mod inmemory;
pub mod pool;
pub mod publisher;
pub mod topology;
pub mod transport;

pub use ack_tracker::{AckHandle, AckTracker, DeliveryKey};
pub use channel::{PublishSettings, PublishingChannel};
pub use config::BrokerConfig;
pub use consumer::BrokerConsumer;
pub use error::{BrokerError, BrokerResult};
pub use inmemory::{ConfirmBehavior, InMemoryBroker};
pub use pool::ChannelPool;
pub use publisher::BrokerPublisher;
pub use topology::BrokerTopology;
