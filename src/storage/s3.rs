use super::{
    is_after_marker, ListObjectsPage, ListObjectsRequest, ObjectMeta, ObjectStore, ObjectSummary,
    IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
};
use crate::config::S3Settings;
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metakey, Operator};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

/// 上传时写入的用户元数据（`x-amz-meta-crc32`）
const CRC32_META_KEY: &str = "crc32";

/// 缺少修改时间的条目（例如目录本身）按 Unix 纪元处理
const EPOCH_RFC3339: &str = "1970-01-01T00:00:00+00:00";

pub struct S3Store {
    settings: S3Settings,
    /// 每个 bucket 一个 operator
    operators: Mutex<HashMap<String, Operator>>,
    name: String,
}

impl S3Store {
    pub fn new(settings: S3Settings) -> Self {
        let name = format!(
            "s3:{}",
            settings.endpoint.as_deref().unwrap_or("default")
        );
        Self {
            settings,
            operators: Mutex::new(HashMap::new()),
            name,
        }
    }

    fn operator(&self, bucket: &str) -> Result<Operator> {
        let mut operators = self
            .operators
            .lock()
            .map_err(|_| SyncError::Storage("operator 缓存锁已失效".to_string()))?;
        if let Some(op) = operators.get(bucket) {
            return Ok(op.clone());
        }

        use opendal::services::S3;

        let mut builder = S3::default().bucket(bucket);
        if let Some(ref region) = self.settings.region {
            builder = builder.region(region);
        }
        if let Some(ref ak) = self.settings.access_key {
            builder = builder.access_key_id(ak);
        }
        if let Some(ref sk) = self.settings.secret_key {
            builder = builder.secret_access_key(sk);
        }
        if let Some(ref ep) = self.settings.endpoint {
            builder = builder.endpoint(ep);
        }

        // 添加超时层
        let op = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        debug!("创建 bucket operator: {}", bucket);
        operators.insert(bucket.to_string(), op.clone());
        Ok(op)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn list_objects(&self, req: &ListObjectsRequest) -> Result<ListObjectsPage> {
        let op = self.operator(&req.bucket)?;
        let recursive = req.delimiter.is_none();

        let mut builder = op
            .lister_with(&req.prefix)
            .recursive(recursive)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode);
        if let Some(ref marker) = req.marker {
            builder = builder.start_after(marker);
        }
        let mut lister = builder.await?;

        let max_keys = req.max_keys.max(1);
        let mut page = ListObjectsPage::default();
        let mut last_key: Option<String> = None;

        while let Some(entry) = lister.try_next().await? {
            let key = entry.path().trim_start_matches('/').to_string();
            // start_after 之后服务端仍可能再次返回上一页最后的 common prefix
            if !is_after_marker(&key, req.marker.as_deref(), req.delimiter.as_deref()) {
                continue;
            }
            if page.objects.len() + page.common_prefixes.len() >= max_keys {
                page.is_truncated = true;
                break;
            }

            let meta = entry.metadata();

            if !recursive && meta.is_dir() && key != req.prefix {
                page.common_prefixes.push(key.clone());
            } else {
                page.objects.push(ObjectSummary {
                    key: key.clone(),
                    size: meta.content_length(),
                    last_modified: meta
                        .last_modified()
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| EPOCH_RFC3339.to_string()),
                    storage_class: None,
                });
            }
            last_key = Some(key);
        }

        if page.is_truncated {
            page.next_marker = last_key;
        }
        Ok(page)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let op = self.operator(bucket)?;
        match op.stat(key).await {
            Ok(meta) => Ok(Some(ObjectMeta {
                size: meta.content_length(),
                last_modified: meta
                    .last_modified()
                    .map(|t| t.to_rfc3339())
                    .unwrap_or_else(|| EPOCH_RFC3339.to_string()),
                storage_class: None,
                crc32: stored_crc32(&meta),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// 对象元数据里保存的 CRC32，没有或无法解析时返回 `None`
fn stored_crc32(meta: &opendal::Metadata) -> Option<u32> {
    meta.user_metadata()
        .and_then(|m| m.get(CRC32_META_KEY))
        .and_then(|v| parse_crc32(v))
}

/// 十进制或 `0x` 前缀的十六进制
fn parse_crc32(value: &str) -> Option<u32> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}
