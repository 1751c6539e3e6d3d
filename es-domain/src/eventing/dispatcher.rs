//! 条目分发器（EntryDispatcher）
//!
//! 按条目携带的类型标识查找全部已注册处理器，同时调用：
//! - 注册表在启动时填充，分发只是一次查表加普通调用；
//! - 没有匹配的处理器不是错误；
//! - 收集全部处理器失败，合并为一个聚合错误，而不是遇到第一个就返回。
//!
use super::handler::{EntryHandler, EventHandler, HandledEventType, TypedHandler};
use crate::entry::{Entry, Event};
use crate::error::{DomainError, DomainResult as Result, HandlerFailure};
use crate::serializer::EntrySerializer;
use futures_util::future::{self, BoxFuture, FutureExt};
use std::{collections::HashMap, sync::Arc};
use tokio_util::sync::CancellationToken;

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    by_type: HashMap<String, Vec<Arc<dyn EntryHandler>>>,
    all: Vec<Arc<dyn EntryHandler>>,
}

impl HandlerRegistry {
    pub fn new(handlers: Vec<Arc<dyn EntryHandler>>) -> Self {
        handlers
            .into_iter()
            .fold(Self::default(), |registry, h| registry.with_handler(h))
    }

    pub fn with_handler(mut self, h: Arc<dyn EntryHandler>) -> Self {
        match h.handled_event_type() {
            HandledEventType::All => self.all.push(h),
            HandledEventType::One(t) => {
                self.by_type.entry(t).or_default().push(h);
            }
            HandledEventType::Many(ts) => {
                for t in ts {
                    self.by_type.entry(t).or_default().push(h.clone());
                }
            }
        }
        self
    }

    /// 注册强类型事件处理器
    pub fn with_event_handler<E, H>(self, handler: H, serializer: &EntrySerializer) -> Self
    where
        E: Event,
        H: EventHandler<E> + 'static,
    {
        self.with_handler(Arc::new(TypedHandler::<E, H>::new(
            handler,
            serializer.clone(),
        )))
    }

    pub fn matching(&self, event_type: &str) -> Vec<Arc<dyn EntryHandler>> {
        let mut merged: Vec<Arc<dyn EntryHandler>> = Vec::new();
        if let Some(list) = self.by_type.get(event_type) {
            merged.extend(list.iter().cloned());
        }
        merged.extend(self.all.iter().cloned());
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty() && self.all.is_empty()
    }
}

pub struct EntryDispatcher {
    registry: HandlerRegistry,
}

impl EntryDispatcher {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &HandlerRegistry {
        &self.registry
    }

    /// 分发一个条目；全部匹配的处理器同时执行，取消只中止本地等待
    pub async fn dispatch(&self, entry: &Entry, cancel: &CancellationToken) -> Result<()> {
        let event_type = entry.type_identifier();
        let handlers = self.registry.matching(event_type);
        if handlers.is_empty() {
            tracing::trace!(event_type, "no handler registered");
            return Ok(());
        }

        let calls: Vec<BoxFuture<'_, std::result::Result<(), HandlerFailure>>> = handlers
            .into_iter()
            .map(|h| {
                async move {
                    h.handle(entry)
                        .await
                        .map_err(|err| HandlerFailure::new(h.handler_name(), format!("{err:#}")))
                }
                .boxed()
            })
            .collect();
        let run = future::join_all(calls);

        let outcomes = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DomainError::Cancelled),
            outcomes = run => outcomes,
        };
        let failures: Vec<HandlerFailure> = outcomes.into_iter().filter_map(|o| o.err()).collect();

        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            tracing::warn!(event_type, entry_id = %entry.entry_id(), %failure, "handler failed");
        }
        Err(DomainError::Dispatch {
            event_type: event_type.to_string(),
            failures,
        })
    }
}
