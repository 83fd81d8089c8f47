//! 内存存储
//!
//! 按 marker 分页，行为与真实 bucket 一致；测试时也可以注入错误时间戳或失败页。

use super::{
    is_after_marker, ListObjectsPage, ListObjectsRequest, ObjectMeta, ObjectStore, ObjectSummary,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

#[derive(Debug, Clone)]
struct MemObject {
    size: u64,
    last_modified: String,
    storage_class: Option<String>,
    crc32: Option<u32>,
}

#[derive(Default)]
pub struct MemoryStore {
    buckets: RwLock<BTreeMap<String, BTreeMap<String, MemObject>>>,
    list_calls: AtomicUsize,
    /// 第 N 次（从 1 开始）列举调用返回错误
    fail_on_call: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 第 `call` 次列举调用失败
    pub fn failing_on_call(mut self, call: usize) -> Self {
        self.fail_on_call = Some(call);
        self
    }

    /// 写入一个对象，`mtime` 为 Unix 秒
    pub fn put(&self, bucket: &str, key: &str, size: u64, mtime: i64) {
        let last_modified = chrono::DateTime::from_timestamp(mtime, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        self.put_raw(bucket, key, size, &last_modified, None);
    }

    pub fn put_with_crc32(&self, bucket: &str, key: &str, size: u64, mtime: i64, crc32: u32) {
        let last_modified = chrono::DateTime::from_timestamp(mtime, 0)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        self.put_raw(bucket, key, size, &last_modified, Some(crc32));
    }

    /// 直接写入原始时间字符串
    pub fn put_raw(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        last_modified: &str,
        crc32: Option<u32>,
    ) {
        if let Ok(mut buckets) = self.buckets.write() {
            buckets.entry(bucket.to_string()).or_default().insert(
                key.to_string(),
                MemObject {
                    size,
                    last_modified: last_modified.to_string(),
                    storage_class: Some("STANDARD".to_string()),
                    crc32,
                },
            );
        }
    }

    /// 已发生的列举调用次数
    pub fn list_calls(&self) -> usize {
        self.list_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn list_objects(&self, req: &ListObjectsRequest) -> Result<ListObjectsPage> {
        let call = self.list_calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_call == Some(call) {
            return Err(SyncError::Storage(format!("第 {} 次列举失败", call)));
        }

        let buckets = self
            .buckets
            .read()
            .map_err(|_| SyncError::Storage("内存存储锁已失效".to_string()))?;
        let Some(objects) = buckets.get(&req.bucket) else {
            return Err(SyncError::Storage(format!("bucket 不存在: {}", req.bucket)));
        };

        let max_keys = req.max_keys.max(1);
        let mut page = ListObjectsPage::default();
        let mut last: Option<String> = None;
        let mut last_common: Option<String> = None;

        let marker = req.marker.as_deref();
        let delimiter = req.delimiter.as_deref();

        for (key, obj) in objects.iter().filter(|(key, _)| {
            key.starts_with(&req.prefix) && is_after_marker(key, marker, delimiter)
        }) {
            if let Some(ref common) = last_common {
                if key.starts_with(common.as_str()) {
                    continue;
                }
            }

            if page.objects.len() + page.common_prefixes.len() >= max_keys {
                page.is_truncated = true;
                break;
            }

            if let Some(ref delimiter) = req.delimiter {
                let rest = &key[req.prefix.len()..];
                if let Some(pos) = rest.find(delimiter.as_str()) {
                    let common = format!("{}{}", req.prefix, &rest[..pos + delimiter.len()]);
                    page.common_prefixes.push(common.clone());
                    last = Some(common.clone());
                    last_common = Some(common);
                    continue;
                }
            }

            page.objects.push(ObjectSummary {
                key: key.clone(),
                size: obj.size,
                last_modified: obj.last_modified.clone(),
                storage_class: obj.storage_class.clone(),
            });
            last = Some(key.clone());
        }

        if page.is_truncated {
            page.next_marker = last;
        }
        Ok(page)
    }

    async fn head_object(&self, bucket: &str, key: &str) -> Result<Option<ObjectMeta>> {
        let buckets = self
            .buckets
            .read()
            .map_err(|_| SyncError::Storage("内存存储锁已失效".to_string()))?;
        Ok(buckets.get(bucket).and_then(|b| b.get(key)).map(|obj| ObjectMeta {
            size: obj.size,
            last_modified: obj.last_modified.clone(),
            storage_class: obj.storage_class.clone(),
            crc32: obj.crc32,
        }))
    }

    fn name(&self) -> &str {
        "memory"
    }
}
