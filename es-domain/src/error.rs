//! 领域层统一错误定义
//!
//! 聚焦参数校验、序列化、暂存/流存储、乐观并发与事件分发的最小必要集合，
//! 便于在各实现层统一转换为 `DomainError`。
//!
use crate::entry::StreamId;
use std::fmt;
use thiserror::Error;

/// 统一错误类型（基础库最小必要集）
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum DomainError {
    // --- 参数校验 ---
    #[error("invalid argument: {reason}")]
    InvalidArgument { reason: String },

    // --- 序列化 ---
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },
    #[error("parse error: {reason}")]
    Parse { reason: String },
    #[error("type mismatch: expected={expected}, found={found}")]
    TypeMismatch { expected: String, found: String },

    // --- 暂存/流存储 ---
    #[error("staging store error: {reason}")]
    StagingStore { reason: String },
    #[error("stream store error: {reason}")]
    StreamStore { reason: String },
    #[error("optimistic concurrency conflict: stream={stream_id}, batch_size={batch_size}")]
    OptimisticConcurrency {
        stream_id: StreamId,
        batch_size: usize,
    },
    #[error("append failed: stream={stream_id}, batch_size={batch_size}")]
    AppendFailed {
        stream_id: StreamId,
        batch_size: usize,
    },

    // --- 事件系统 ---
    #[error("event bus error: {reason}")]
    EventBus { reason: String },
    #[error("dispatch failed: event_type={event_type}, failures={}", .failures.len())]
    Dispatch {
        event_type: String,
        failures: Vec<HandlerFailure>,
    },
    #[error("operation cancelled")]
    Cancelled,
}

impl DomainError {
    pub fn invalid_argument(reason: impl Into<String>) -> Self {
        Self::InvalidArgument {
            reason: reason.into(),
        }
    }

    pub fn staging_store(reason: impl Into<String>) -> Self {
        Self::StagingStore {
            reason: reason.into(),
        }
    }

    pub fn stream_store(reason: impl Into<String>) -> Self {
        Self::StreamStore {
            reason: reason.into(),
        }
    }

    pub fn event_bus(reason: impl Into<String>) -> Self {
        Self::EventBus {
            reason: reason.into(),
        }
    }

    /// 是否为乐观并发冲突（调用方应重新读取流并以新的序号重试）
    pub fn is_concurrency_conflict(&self) -> bool {
        matches!(self, Self::OptimisticConcurrency { .. })
    }
}

/// 单个处理器的失败记录，聚合在 `DomainError::Dispatch` 中
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandlerFailure {
    handler: String,
    reason: String,
}

impl HandlerFailure {
    pub fn new(handler: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            handler: handler.into(),
            reason: reason.into(),
        }
    }

    pub fn handler(&self) -> &str {
        &self.handler
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "handler={}, reason={}", self.handler, self.reason)
    }
}

/// 统一 Result 类型别名
pub type DomainResult<T> = Result<T, DomainError>;

// 允许在基础设施层直接使用 `?` 将 uuid 等错误转换为 DomainError

impl From<uuid::Error> for DomainError {
    fn from(err: uuid::Error) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}

impl From<std::num::ParseIntError> for DomainError {
    fn from(err: std::num::ParseIntError) -> Self {
        DomainError::Parse {
            reason: err.to_string(),
        }
    }
}
