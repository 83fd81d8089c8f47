//! 错误类型
//!
//! 三个层级：
//! - 单条目软错误（[`ItemError`]），挂在 `Record` 上，通常可以容忍
//! - 流级硬错误，终止对应一侧的列举流
//! - 配置错误，在构造 `Filter` 时同步返回，任何后台任务启动之前

use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

use crate::core::record::ItemError;

pub type Result<T> = std::result::Result<T, SyncError>;

/// 稳定的错误码，供调用方区分错误类别
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    FilterConflict,
    InvalidPattern,
    InvalidTimeRange,
    InvalidLocation,
    Timeout,
    StreamClosed,
    MalformedTimestamp,
    ReadDir,
    ItemError,
    Io,
    Storage,
    Config,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::FilterConflict => "FilterConflict",
            ErrorCode::InvalidPattern => "InvalidPattern",
            ErrorCode::InvalidTimeRange => "InvalidTimeRange",
            ErrorCode::InvalidLocation => "InvalidLocation",
            ErrorCode::Timeout => "Timeout",
            ErrorCode::StreamClosed => "StreamClosed",
            ErrorCode::MalformedTimestamp => "MalformedTimestamp",
            ErrorCode::ReadDir => "ReadDir",
            ErrorCode::ItemError => "ItemError",
            ErrorCode::Io => "Io",
            ErrorCode::Storage => "Storage",
            ErrorCode::Config => "Config",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 过滤器冲突的种类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Pattern,
    Time,
}

impl std::fmt::Display for FilterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FilterKind::Pattern => f.write_str("pattern"),
            FilterKind::Time => f.write_str("time"),
        }
    }
}

#[derive(Debug, Clone, Error)]
pub enum SyncError {
    /// include 与 exclude 同时配置
    #[error("不能同时指定 include 和 exclude {kind} 过滤条件")]
    ConflictingFilters { kind: FilterKind },

    #[error("无效的匹配模式 {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("无效的时间范围: {0}")]
    InvalidTimeRange(String),

    #[error("无效的路径: {0}")]
    InvalidLocation(String),

    /// 在截止时间内没有等到下一个元素
    #[error("{what} 等待超时 ({secs}s)")]
    Timeout { what: String, secs: u64 },

    /// 生产者在发送结束标记之前退出
    #[error("{0} 的数据流意外关闭")]
    StreamClosed(String),

    #[error("对象 {key} 的修改时间格式错误: {value:?}")]
    MalformedTimestamp { key: String, value: String },

    #[error("读取目录失败 {path:?}: {source}")]
    ReadDir {
        path: PathBuf,
        #[source]
        source: Arc<std::io::Error>,
    },

    /// 比较器遇到不可容忍的单条目错误
    #[error("条目 {key} 出错: {error}")]
    Item { key: String, error: ItemError },

    #[error("IO 错误: {0}")]
    Io(Arc<std::io::Error>),

    #[error("存储错误: {0}")]
    Storage(String),

    #[error("配置错误: {0}")]
    Config(String),
}

impl SyncError {
    pub fn code(&self) -> ErrorCode {
        match self {
            SyncError::ConflictingFilters { .. } => ErrorCode::FilterConflict,
            SyncError::InvalidPattern { .. } => ErrorCode::InvalidPattern,
            SyncError::InvalidTimeRange(_) => ErrorCode::InvalidTimeRange,
            SyncError::InvalidLocation(_) => ErrorCode::InvalidLocation,
            SyncError::Timeout { .. } => ErrorCode::Timeout,
            SyncError::StreamClosed(_) => ErrorCode::StreamClosed,
            SyncError::MalformedTimestamp { .. } => ErrorCode::MalformedTimestamp,
            SyncError::ReadDir { .. } => ErrorCode::ReadDir,
            SyncError::Item { .. } => ErrorCode::ItemError,
            SyncError::Io(_) => ErrorCode::Io,
            SyncError::Storage(_) => ErrorCode::Storage,
            SyncError::Config(_) => ErrorCode::Config,
        }
    }

    /// 是否属于配置错误（在任何列举开始前就能发现）
    pub fn is_config_error(&self) -> bool {
        matches!(
            self.code(),
            ErrorCode::FilterConflict
                | ErrorCode::InvalidPattern
                | ErrorCode::InvalidTimeRange
                | ErrorCode::InvalidLocation
                | ErrorCode::Config
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::Io(Arc::new(e))
    }
}

impl From<opendal::Error> for SyncError {
    fn from(e: opendal::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Config(e.to_string())
    }
}
