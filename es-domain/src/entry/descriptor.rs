use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 事件描述：序列化后的事件载荷 + 类型标识
///
/// 类型标识用于在不依赖具体 Rust 类型的情况下把条目路由到处理器。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventDescriptor {
    type_identifier: String,
    payload: Value,
}

impl EventDescriptor {
    pub fn new(type_identifier: impl Into<String>, payload: Value) -> Self {
        Self {
            type_identifier: type_identifier.into(),
            payload,
        }
    }

    pub fn type_identifier(&self) -> &str {
        &self.type_identifier
    }

    pub fn payload(&self) -> &Value {
        &self.payload
    }
}
