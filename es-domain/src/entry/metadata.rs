use bon::Builder;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 条目元数据：由生产方设置，未设置时在构造时取默认值
#[derive(Builder, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// 因果ID
    causation_id: Option<String>,
    /// 关联ID
    correlation_id: Option<String>,
    /// 创建时间
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,
}

impl Default for EntryMetadata {
    fn default() -> Self {
        Self {
            causation_id: None,
            correlation_id: None,
            created_at: Utc::now(),
        }
    }
}

impl EntryMetadata {
    pub fn causation_id(&self) -> Option<&str> {
        self.causation_id.as_deref()
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }
}
