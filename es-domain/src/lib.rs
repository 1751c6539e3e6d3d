//! 事件溯源可靠发布核心（es-domain）
//!
//! 提供以追加式事件流为中心的通用构件，用于在应用中实现：
//! - 条目与序号模型（`entry`）：流标识、连续序号、不可变条目与批次
//! - 暂存（Outbox）与流存储契约及内存实现（`persist`）
//! - 可靠发布、崩溃对账与处理器分发（`eventing`）
//! - 显式传递的序列化配置（`serializer`）
//!
//! 本 crate 与存储与传输实现解耦，仅定义契约与编排逻辑，
//! 以便在不同基础设施（例如关系型数据库、消息代理等）上进行适配实现。
//!
//! 典型用法：
//! 1. 通过 `AppendableStream` 为新事件分配序号并组装 `EntryBatch`；
//! 2. 提供 `persist` 中暂存与流存储契约的具体实现；
//! 3. 用 `EventPublisher` 发布批次，用 `ReconciliationJob` 修复部分失败；
//! 4. 在消费侧用 `EntryDispatcher` 把条目分发给已注册的处理器。
//!
pub mod entry;
pub mod error;
pub mod eventing;
pub mod persist;
pub mod serializer;
