//! 条目序列化（EntrySerializer）
//!
//! 序列化配置在启动时构建一次（`SerializerOptions`），之后以不可变值的形式
//! 显式传给每个调用点，不依赖任何全局静态状态。
//!
use crate::entry::{Entry, Event, EventDescriptor};
use crate::error::{DomainError, DomainResult as Result};
use serde::Deserialize;
use std::sync::Arc;

/// 序列化配置
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SerializerOptions {
    /// 输出带缩进的 JSON（便于人工排查消息内容）
    pub pretty: bool,
    /// 解码具体事件时要求描述中的类型标识与目标类型一致
    pub strict_type_check: bool,
}

impl Default for SerializerOptions {
    fn default() -> Self {
        Self {
            pretty: false,
            strict_type_check: true,
        }
    }
}

/// JSON 条目序列化器，克隆代价低（内部共享同一份配置）
#[derive(Clone, Debug, Default)]
pub struct EntrySerializer {
    options: Arc<SerializerOptions>,
}

impl EntrySerializer {
    pub fn new(options: SerializerOptions) -> Self {
        Self {
            options: Arc::new(options),
        }
    }

    pub fn options(&self) -> &SerializerOptions {
        &self.options
    }

    /// 将具体事件描述为 `EventDescriptor`
    pub fn describe<E: Event>(&self, event: &E) -> Result<EventDescriptor> {
        Ok(EventDescriptor::new(E::TYPE_ID, serde_json::to_value(event)?))
    }

    /// 从描述中还原具体事件
    pub fn decode_event<E: Event>(&self, descriptor: &EventDescriptor) -> Result<E> {
        if self.options.strict_type_check && descriptor.type_identifier() != E::TYPE_ID {
            return Err(DomainError::TypeMismatch {
                expected: E::TYPE_ID.to_string(),
                found: descriptor.type_identifier().to_string(),
            });
        }
        Ok(E::deserialize(descriptor.payload())?)
    }

    pub fn to_bytes(&self, entry: &Entry) -> Result<Vec<u8>> {
        let bytes = if self.options.pretty {
            serde_json::to_vec_pretty(entry)?
        } else {
            serde_json::to_vec(entry)?
        };
        Ok(bytes)
    }

    pub fn from_bytes(&self, bytes: &[u8]) -> Result<Entry> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::{EntrySequence, StreamId};
    use serde::Serialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Deposited {
        amount: i64,
    }

    impl Event for Deposited {
        const TYPE_ID: &'static str = "account.deposited";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Withdrawn {
        amount: i64,
    }

    impl Event for Withdrawn {
        const TYPE_ID: &'static str = "account.withdrawn";
    }

    #[test]
    fn describe_and_decode_typed_event() {
        let ser = EntrySerializer::default();
        let descriptor = ser.describe(&Deposited { amount: 42 }).unwrap();
        assert_eq!(descriptor.type_identifier(), "account.deposited");

        let decoded: Deposited = ser.decode_event(&descriptor).unwrap();
        assert_eq!(decoded, Deposited { amount: 42 });
    }

    #[test]
    fn strict_decode_rejects_foreign_type() {
        let ser = EntrySerializer::default();
        let descriptor = ser.describe(&Deposited { amount: 1 }).unwrap();
        let err = ser.decode_event::<Withdrawn>(&descriptor).unwrap_err();
        assert!(matches!(err, DomainError::TypeMismatch { .. }));
    }

    #[test]
    fn lenient_decode_only_checks_shape() {
        let ser = EntrySerializer::new(SerializerOptions {
            strict_type_check: false,
            ..Default::default()
        });
        let descriptor = ser.describe(&Deposited { amount: 5 }).unwrap();
        let w: Withdrawn = ser.decode_event(&descriptor).unwrap();
        assert_eq!(w.amount, 5);
    }

    #[test]
    fn entry_bytes_preserve_identity_and_position() {
        let ser = EntrySerializer::new(SerializerOptions {
            pretty: true,
            ..Default::default()
        });
        let entry = Entry::builder()
            .stream_id(StreamId::new())
            .sequence(EntrySequence::from_value(9))
            .descriptor(ser.describe(&Deposited { amount: 3 }).unwrap())
            .build();

        let restored = ser.from_bytes(&ser.to_bytes(&entry).unwrap()).unwrap();
        assert_eq!(restored, entry);
    }

    #[test]
    fn garbage_bytes_are_a_serde_error() {
        let err = EntrySerializer::default().from_bytes(b"not json").unwrap_err();
        assert!(matches!(err, DomainError::Serde { .. }));
    }
}
