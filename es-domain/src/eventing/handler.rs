//! 条目处理器（EntryHandler）
//!
//! 定义消费某类/多类/全部条目的处理逻辑与元信息（名称、订阅类型），
//! 以及把强类型事件处理器适配为条目处理器的 `TypedHandler`。
//!
use crate::entry::{Entry, Event};
use crate::serializer::EntrySerializer;
use async_trait::async_trait;
use std::marker::PhantomData;

#[derive(Clone, Debug)]
pub enum HandledEventType {
    One(String),
    Many(Vec<String>),
    All,
}

/// 条目处理器：处理某一类型的条目
#[async_trait]
pub trait EntryHandler: Send + Sync {
    /// 处理器名称（用于失败聚合与日志）
    fn handler_name(&self) -> &str;
    /// 返回该处理器支持的事件类型
    fn handled_event_type(&self) -> HandledEventType;
    /// 处理条目
    async fn handle(&self, entry: &Entry) -> anyhow::Result<()>;
}

/// 强类型事件处理器：只关心一种具体事件
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    fn handler_name(&self) -> &str;

    async fn handle(&self, event: E, entry: &Entry) -> anyhow::Result<()>;
}

/// 把 `EventHandler<E>` 适配为 `EntryHandler`：按 `E::TYPE_ID` 注册，处理前解码载荷
pub struct TypedHandler<E, H> {
    inner: H,
    serializer: EntrySerializer,
    _event: PhantomData<fn() -> E>,
}

impl<E, H> TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    pub fn new(inner: H, serializer: EntrySerializer) -> Self {
        Self {
            inner,
            serializer,
            _event: PhantomData,
        }
    }
}

#[async_trait]
impl<E, H> EntryHandler for TypedHandler<E, H>
where
    E: Event,
    H: EventHandler<E>,
{
    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }

    fn handled_event_type(&self) -> HandledEventType {
        HandledEventType::One(E::TYPE_ID.to_string())
    }

    async fn handle(&self, entry: &Entry) -> anyhow::Result<()> {
        let event: E = self.serializer.decode_event(entry.descriptor())?;
        self.inner.handle(event, entry).await
    }
}
