pub mod memory;
pub mod s3;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::config::S3Settings;
use crate::error::Result;

pub use memory::MemoryStore;
pub use s3::S3Store;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- list, stat 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 单页列举请求
#[derive(Debug, Clone, Default)]
pub struct ListObjectsRequest {
    pub bucket: String,
    pub prefix: String,
    /// `Some("/")` 表示非递归列举，子目录以 common prefix 返回
    pub delimiter: Option<String>,
    /// 从该 key 之后开始列举
    pub marker: Option<String>,
    pub max_keys: usize,
}

/// 列举返回的对象摘要
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectSummary {
    pub key: String,
    pub size: u64,
    /// 服务端返回的原始时间字符串（RFC 3339）
    pub last_modified: String,
    pub storage_class: Option<String>,
}

/// 单页列举结果
#[derive(Debug, Clone, Default)]
pub struct ListObjectsPage {
    pub objects: Vec<ObjectSummary>,
    pub common_prefixes: Vec<String>,
    pub is_truncated: bool,
    pub next_marker: Option<String>,
}

/// 单个对象的元数据
#[derive(Debug, Clone)]
pub struct ObjectMeta {
    pub size: u64,
    pub last_modified: String,
    pub storage_class: Option<String>,
    pub crc32: Option<u32>,
}

/// 比较引擎需要的存储能力：分页列举 + 元数据查询
///
/// 引擎本身从不调用任何传输接口。
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// 列举一页对象，key 严格升序
    async fn list_objects(&self, req: &ListObjectsRequest) -> Result<ListObjectsPage>;

    /// 获取对象元数据，不存在时返回 `None`
    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>>;

    /// 对象的 CRC32 校验和，默认取元数据里保存的值
    async fn object_crc32(&self, bucket: &str, key: &str) -> Result<Option<u32>> {
        Ok(self.head_object(bucket, key).await?.and_then(|m| m.crc32))
    }

    /// 存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建 S3 存储客户端
pub fn create_store(settings: &S3Settings) -> Result<Arc<dyn ObjectStore>> {
    tracing::info!(
        "初始化S3存储: region={:?}, endpoint={:?}",
        settings.region,
        settings.endpoint
    );
    Ok(Arc::new(S3Store::new(settings.clone())) as Arc<dyn ObjectStore>)
}

/// 分页续传：`key` 是否位于 `marker` 之后
///
/// 非递归列举时 marker 可能是一个 common prefix（以分隔符结尾），
/// 这时整个前缀下的 key 都已经在上一页以 common prefix 的形式返回过。
pub(crate) fn is_after_marker(key: &str, marker: Option<&str>, delimiter: Option<&str>) -> bool {
    match (marker, delimiter) {
        (None, _) => true,
        (Some(m), Some(d)) if !d.is_empty() && m.ends_with(d) => key > m && !key.starts_with(m),
        (Some(m), _) => key > m,
    }
}
