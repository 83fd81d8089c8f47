//! 同步参数：两侧位置、并发数、是否删除
//!
//! 路径前缀的语义只在这里定义。

use glob::Pattern;
use std::fmt;
use std::path::{PathBuf, MAIN_SEPARATOR};
use std::str::FromStr;

use crate::core::filter::Side;
use crate::core::record::{join_key, Record, KEY_SEPARATOR};
use crate::core::strategy::ChangeDetection;
use crate::error::{Result, SyncError};

const S3_SCHEME: &str = "s3://";

/// 一侧的根位置
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Location {
    Local { root: PathBuf },
    /// `prefix` 为空或以 `/` 结尾
    Remote { bucket: String, prefix: String },
}

impl Location {
    pub fn remote(bucket: impl Into<String>, prefix: &str) -> Self {
        let prefix = if prefix.is_empty() || prefix.ends_with(KEY_SEPARATOR) {
            prefix.to_string()
        } else {
            format!("{}{}", prefix, KEY_SEPARATOR)
        };
        Location::Remote {
            bucket: bucket.into(),
            prefix,
        }
    }

    pub fn local(root: impl Into<PathBuf>) -> Self {
        Location::Local { root: root.into() }
    }

    pub fn side(&self) -> Side {
        match self {
            Location::Local { .. } => Side::Local,
            Location::Remote { .. } => Side::Remote,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Location::Remote { .. })
    }

    /// 列举得到的记录在这一侧的完整地址
    pub fn path_for(&self, record: &Record) -> ObjectPath {
        match self {
            Location::Local { .. } => ObjectPath::Local(PathBuf::from(&record.path)),
            Location::Remote { bucket, .. } => ObjectPath::Remote {
                bucket: bucket.clone(),
                key: record.path.clone(),
            },
        }
    }

    /// 由相对 key 推导出在这一侧“应当存在”的地址
    ///
    /// 只有源存在的条目在目标侧从未被列举过，只能拼出来。
    pub fn synthesize(&self, key: &str) -> ObjectPath {
        match self {
            Location::Local { root } => {
                let mut path = root.clone();
                for part in key.split(KEY_SEPARATOR).filter(|p| !p.is_empty()) {
                    path.push(part);
                }
                ObjectPath::Local(path)
            }
            Location::Remote { bucket, prefix } => ObjectPath::Remote {
                bucket: bucket.clone(),
                key: join_key(prefix, key),
            },
        }
    }
}

impl Location {
    /// 把相对于根的匹配模式变成这一侧过滤器实际匹配的形式
    ///
    /// 本地过滤器匹配完整路径，远程过滤器匹配完整对象 key，
    /// 同一个相对模式在两侧因此选中同一批 key。根部分按字面量转义。
    pub fn anchor_pattern(&self, pattern: &str) -> String {
        let pattern = pattern.trim_start_matches(KEY_SEPARATOR);
        match self {
            Location::Local { root } => {
                // 单文件根的 key 是文件名，模式相对于所在目录
                let base = if root.is_file() {
                    root.parent().map(|p| p.to_path_buf()).unwrap_or_default()
                } else {
                    root.clone()
                };
                let mut anchored = Pattern::escape(&base.to_string_lossy());
                if !anchored.is_empty() && !anchored.ends_with(MAIN_SEPARATOR) {
                    anchored.push(MAIN_SEPARATOR);
                }
                anchored.push_str(&pattern.replace(KEY_SEPARATOR, &MAIN_SEPARATOR.to_string()));
                anchored
            }
            Location::Remote { prefix, .. } => format!("{}{}", Pattern::escape(prefix), pattern),
        }
    }
}

/// `s3://bucket/prefix` 为远程，其余按本地路径处理
impl FromStr for Location {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix(S3_SCHEME) else {
            if s.is_empty() {
                return Err(SyncError::InvalidLocation("路径为空".to_string()));
            }
            return Ok(Location::local(s));
        };
        let (bucket, prefix) = rest.split_once(KEY_SEPARATOR).unwrap_or((rest, ""));
        if bucket.is_empty() {
            return Err(SyncError::InvalidLocation(format!("缺少 bucket: {}", s)));
        }
        Ok(Location::remote(bucket, prefix))
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Location::Local { root } => write!(f, "{}", root.display()),
            Location::Remote { bucket, prefix } => write!(f, "{}{}/{}", S3_SCHEME, bucket, prefix),
        }
    }
}

/// 动作所指向的具体地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectPath {
    Local(PathBuf),
    Remote { bucket: String, key: String },
}

impl fmt::Display for ObjectPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectPath::Local(path) => write!(f, "{}", path.display()),
            ObjectPath::Remote { bucket, key } => write!(f, "{}{}/{}", S3_SCHEME, bucket, key),
        }
    }
}

/// 同步模式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// 两边都存在时总是复制
    Always,
    /// 两边都存在时从不复制
    Never,
    /// 内容变化时复制
    Changed(ChangeDetection),
}

impl Default for SyncMode {
    fn default() -> Self {
        SyncMode::Changed(ChangeDetection::Metadata)
    }
}

/// 一次同步的参数
#[derive(Debug, Clone)]
pub struct SyncArgs {
    pub src: Location,
    pub dst: Location,
    /// 并发数，决定动作流的容量
    pub concurrency: usize,
    /// 是否删除源中不存在的目标文件
    pub delete: bool,
    pub mode: SyncMode,
}

impl SyncArgs {
    pub fn new(src: Location, dst: Location) -> Self {
        Self {
            src,
            dst,
            concurrency: 4,
            delete: false,
            mode: SyncMode::default(),
        }
    }
}
