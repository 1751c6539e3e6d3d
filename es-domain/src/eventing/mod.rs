//! 事件子系统（eventing）
//!
//! 提供可靠发布与消费侧分发的运行时：
//! - `EventPublisher`：暂存 → 追加 → 标记，并把成功的批次交给总线；
//! - `ReconciliationJob`：周期性修复崩溃遗留的 Pending 暂存批次；
//! - `EntryBus`：总线投递协议，由代理实现；
//! - `EntryHandler` / `EventHandler`：条目与强类型事件处理器；
//! - `EntryDispatcher`：按类型查表并发调用处理器，聚合全部失败。
//!
//! 该模块仅定义协议与编排，不绑定具体存储或传输实现。
//!
pub mod bus;
pub mod dispatcher;
pub mod handler;
pub mod publisher;
pub mod reconciliation;

pub use bus::EntryBus;
pub use dispatcher::{EntryDispatcher, HandlerRegistry};
pub use handler::{EntryHandler, EventHandler, HandledEventType, TypedHandler};
pub use publisher::EventPublisher;
pub use reconciliation::{
    ReconciliationConfig, ReconciliationHandle, ReconciliationJob, ReconciliationReport,
};
