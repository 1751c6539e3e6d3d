use serde::Serialize;
use serde::de::DeserializeOwned;

/// 具体事件类型需要满足的能力边界
///
/// `TYPE_ID` 写入 `EventDescriptor`，并作为处理器注册表的键。
pub trait Event: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// 事件类型标识（形如 `account.opened`）
    const TYPE_ID: &'static str;
}
