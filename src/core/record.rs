//! 列举结果的数据模型
//!
//! 本地遍历和远程列举产出同一种 [`Record`]，`key` 统一使用 `/` 作为分隔符，
//! 两侧的 key 可以直接按字典序比较。

use std::fmt;
use std::io;
use std::path::{Component, Path};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::SyncError;

/// key 中使用的统一分隔符
pub const KEY_SEPARATOR: char = '/';

/// 单条目错误的类别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemErrorKind {
    /// 文件在列举和 stat 之间消失
    NotFound,
    PermissionDenied,
    Other,
}

/// 单条目软错误：这一项元数据读取失败，但不终止整个列举
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemError {
    pub kind: ItemErrorKind,
    pub message: String,
}

impl ItemError {
    pub fn new(kind: ItemErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_io(e: &io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => ItemErrorKind::NotFound,
            io::ErrorKind::PermissionDenied => ItemErrorKind::PermissionDenied,
            _ => ItemErrorKind::Other,
        };
        Self::new(kind, e.to_string())
    }

    /// 文件已不存在，比较器对这种错误跳过该条目
    pub fn is_vanished(&self) -> bool {
        self.kind == ItemErrorKind::NotFound
    }
}

impl fmt::Display for ItemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

/// 一个文件或对象
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Record {
    /// 在其所在位置的完整地址：对象 key 或本地路径
    pub path: String,
    /// 相对扫描根的地址，统一用 `/` 分隔
    pub key: String,
    pub size: u64,
    /// 修改时间（Unix 秒）
    pub mtime: i64,
    /// 获取这份元数据的时间（Unix 秒）
    pub gtime: i64,
    /// 存储类型，仅远程对象有
    pub storage_class: Option<String>,
    /// 校验和，只在策略需要时才填充
    pub crc32: Option<u32>,
    pub err: Option<ItemError>,
}

impl Record {
    pub fn new(path: impl Into<String>, key: impl Into<String>, size: u64, mtime: i64) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            size,
            mtime,
            gtime: now_secs(),
            ..Default::default()
        }
    }

    /// 元数据读取失败的条目
    pub fn with_error(path: impl Into<String>, key: impl Into<String>, err: ItemError) -> Self {
        Self {
            path: path.into(),
            key: key.into(),
            gtime: now_secs(),
            err: Some(err),
            ..Default::default()
        }
    }

    /// 距离获取元数据已经过去的时间
    pub fn metadata_age(&self) -> Duration {
        Duration::from_secs(now_secs().saturating_sub(self.gtime).max(0) as u64)
    }

    /// 元数据是否已经过期，执行昂贵的传输前应重新获取
    pub fn is_stale(&self, max_age: Duration) -> bool {
        self.metadata_age() > max_age
    }
}

/// 分页续传信息
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EndInfo {
    pub next_marker: Option<String>,
    pub is_truncated: bool,
}

/// 列举流中的一个元素
#[derive(Debug, Clone)]
pub enum StreamElement {
    File(Record),
    /// 伪目录（common prefix），仅非递归的远程列举会产生
    Dir(String),
    EndInfo(EndInfo),
    /// 硬错误，之后紧跟 `Ended`
    Err(SyncError),
    Ended,
}

impl StreamElement {
    pub fn is_ended(&self) -> bool {
        matches!(self, StreamElement::Ended)
    }
}

pub(crate) fn now_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

pub(crate) fn system_time_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

/// 把本地相对路径转换成统一的 key 形式
pub fn to_key(relative: &Path) -> String {
    let mut key = String::new();
    for component in relative.components() {
        if let Component::Normal(part) = component {
            if !key.is_empty() {
                key.push(KEY_SEPARATOR);
            }
            key.push_str(&part.to_string_lossy());
        }
    }
    key
}

/// 以 `/` 拼接前缀与 key，避免出现重复分隔符
pub fn join_key(prefix: &str, key: &str) -> String {
    let key = key.trim_start_matches(KEY_SEPARATOR);
    if prefix.is_empty() {
        key.to_string()
    } else if key.is_empty() {
        prefix.to_string()
    } else if prefix.ends_with(KEY_SEPARATOR) {
        format!("{}{}", prefix, key)
    } else {
        format!("{}{}{}", prefix, KEY_SEPARATOR, key)
    }
}
