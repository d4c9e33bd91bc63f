//! Copyright (c) 2025-2026, Kirky.X
//!
//! MIT License
//!
//! 该模块定义了跨节点失效消息的数据模型。

use std::fmt;

/// 失效动作
///
/// 未知的动作码在解码时保留为 `Unknown`，由 [`InvalidationMessage::is_valid`] 拒绝。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// 条目被写入
    EntrySet,
    /// 条目被删除
    EntryRemove,
    /// 条目被标记过期
    EntryExpire,
    /// 哨兵消息，不携带键，用于探活
    Sentinel,
    /// 未识别的动作码
    Unknown(u8),
}

impl Action {
    /// 线协议中的动作码
    pub fn code(self) -> u8 {
        match self {
            Action::Unknown(code) => code,
            Action::EntrySet => 1,
            Action::EntryRemove => 2,
            Action::EntryExpire => 3,
            Action::Sentinel => 4,
        }
    }

    pub fn from_code(code: u8) -> Self {
        match code {
            1 => Action::EntrySet,
            2 => Action::EntryRemove,
            3 => Action::EntryExpire,
            4 => Action::Sentinel,
            other => Action::Unknown(other),
        }
    }

    /// 是否是已知动作
    pub fn is_known(self) -> bool {
        !matches!(self, Action::Unknown(_))
    }

    /// 该动作是否要求非空的缓存键
    pub fn requires_key(self) -> bool {
        matches!(
            self,
            Action::EntrySet | Action::EntryRemove | Action::EntryExpire
        )
    }

    /// 用于日志和指标标签的名称
    pub fn as_str(self) -> &'static str {
        match self {
            Action::EntrySet => "set",
            Action::EntryRemove => "remove",
            Action::EntryExpire => "expire",
            Action::Sentinel => "sentinel",
            Action::Unknown(_) => "unknown",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Unknown(code) => write!(f, "unknown({})", code),
            other => f.write_str(other.as_str()),
        }
    }
}

/// 跨节点失效消息
///
/// 不可变的值类型：一次变更操作创建一条，传输、处理后即丢弃。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidationMessage {
    source_id: String,
    timestamp: i64,
    action: Action,
    cache_key: String,
}

impl InvalidationMessage {
    /// 创建新的失效消息
    ///
    /// 构造不做语义校验，调用方在处理前必须调用 [`is_valid`](Self::is_valid)。
    pub fn new(
        source_id: impl Into<String>,
        timestamp: i64,
        action: Action,
        cache_key: impl Into<String>,
    ) -> Self {
        Self {
            source_id: source_id.into(),
            timestamp,
            action,
            cache_key: cache_key.into(),
        }
    }

    pub fn entry_set(source_id: impl Into<String>, timestamp: i64, key: impl Into<String>) -> Self {
        Self::new(source_id, timestamp, Action::EntrySet, key)
    }

    pub fn entry_remove(
        source_id: impl Into<String>,
        timestamp: i64,
        key: impl Into<String>,
    ) -> Self {
        Self::new(source_id, timestamp, Action::EntryRemove, key)
    }

    pub fn entry_expire(
        source_id: impl Into<String>,
        timestamp: i64,
        key: impl Into<String>,
    ) -> Self {
        Self::new(source_id, timestamp, Action::EntryExpire, key)
    }

    pub fn sentinel(source_id: impl Into<String>, timestamp: i64) -> Self {
        Self::new(source_id, timestamp, Action::Sentinel, String::new())
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn action(&self) -> Action {
        self.action
    }

    pub fn cache_key(&self) -> &str {
        &self.cache_key
    }

    /// 语义校验
    ///
    /// 来源非空、时间戳为正、动作已知，且需要键的动作携带非空键。
    pub fn is_valid(&self) -> bool {
        if self.source_id.is_empty() || self.timestamp <= 0 || !self.action.is_known() {
            return false;
        }
        !(self.action.requires_key() && self.cache_key.is_empty())
    }

    /// 是否由指定实例发出
    pub fn is_from(&self, instance_id: &str) -> bool {
        self.source_id == instance_id
    }
}
