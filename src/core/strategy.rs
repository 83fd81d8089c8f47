//! 同步决策策略
//!
//! 比较器针对“两边都有 / 只有源 / 只有目标”三种情况各持有一个策略，
//! 策略回答两个问题：这一对记录是否需要同步，以及需要的是哪种动作。

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::io;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::debug;

use crate::core::filter::Filter;
use crate::core::record::Record;
use crate::error::Result;
use crate::storage::ObjectStore;

/// 策略对应的动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActionKind {
    Copy,
    Delete,
    Nothing,
}

#[async_trait]
pub trait SyncStrategy: Send + Sync {
    async fn should_sync(&self, src: Option<&Record>, dst: Option<&Record>) -> Result<bool>;

    fn which_action(&self) -> ActionKind;

    fn name(&self) -> &'static str;
}

/// 只要源存在就同步
pub struct AlwaysSync;

#[async_trait]
impl SyncStrategy for AlwaysSync {
    async fn should_sync(&self, src: Option<&Record>, _dst: Option<&Record>) -> Result<bool> {
        Ok(src.is_some())
    }

    fn which_action(&self) -> ActionKind {
        ActionKind::Copy
    }

    fn name(&self) -> &'static str {
        "always"
    }
}

pub struct NeverSync;

#[async_trait]
impl SyncStrategy for NeverSync {
    async fn should_sync(&self, _src: Option<&Record>, _dst: Option<&Record>) -> Result<bool> {
        Ok(false)
    }

    fn which_action(&self) -> ActionKind {
        ActionKind::Nothing
    }

    fn name(&self) -> &'static str {
        "never"
    }
}

/// 源不存在时删除目标
///
/// 配置了过滤器时，被过滤器排除的目标文件不会被删除。
pub struct DeleteAbsent {
    filter: Option<Arc<Filter>>,
}

impl DeleteAbsent {
    pub fn new(filter: Option<Arc<Filter>>) -> Self {
        Self { filter }
    }
}

#[async_trait]
impl SyncStrategy for DeleteAbsent {
    async fn should_sync(&self, src: Option<&Record>, dst: Option<&Record>) -> Result<bool> {
        let (None, Some(dst)) = (src, dst) else {
            return Ok(false);
        };
        if let Some(ref filter) = self.filter {
            if filter.should_exclude(&dst.path, dst.mtime) {
                debug!("{} 被过滤，保留", dst.path);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn which_action(&self) -> ActionKind {
        ActionKind::Delete
    }

    fn name(&self) -> &'static str {
        "delete"
    }
}

/// 变化检测方式
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ChangeDetection {
    /// 只比较修改时间和大小
    #[default]
    Metadata,
    /// 只比较校验和
    Checksum,
    /// 元数据判断为相同时跳过，否则再比较校验和
    MetadataThenChecksum,
}

/// 某一侧获取校验和的方式
#[derive(Clone)]
pub enum ChecksumSource {
    /// 读取整个本地文件计算
    Local,
    /// 通过元数据接口读取远程对象保存的校验和
    Remote {
        store: Arc<dyn ObjectStore>,
        bucket: String,
    },
}

impl ChecksumSource {
    /// 记录上已有校验和时直接使用，否则按需获取
    pub async fn crc32(&self, record: &Record) -> Result<Option<u32>> {
        if record.crc32.is_some() {
            return Ok(record.crc32);
        }
        match self {
            ChecksumSource::Local => local_crc32(&record.path).await,
            ChecksumSource::Remote { store, bucket } => {
                store.object_crc32(bucket, &record.path).await
            }
        }
    }
}

/// 本地文件 CRC32，文件不存在时返回 `None`
pub async fn local_crc32(path: &str) -> Result<Option<u32>> {
    let mut file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let mut hasher = crc32fast::Hasher::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(Some(hasher.finalize()))
}

/// 源较新或同一时间大小不同时需要同步
pub fn metadata_changed(src: &Record, dst: &Record) -> bool {
    src.mtime > dst.mtime || (src.mtime == dst.mtime && src.size != dst.size)
}

/// 内容变化时复制
pub struct ChangedSync {
    detection: ChangeDetection,
    src_checksums: ChecksumSource,
    dst_checksums: ChecksumSource,
}

impl ChangedSync {
    pub fn new(
        detection: ChangeDetection,
        src_checksums: ChecksumSource,
        dst_checksums: ChecksumSource,
    ) -> Self {
        Self {
            detection,
            src_checksums,
            dst_checksums,
        }
    }

    /// 只比较元数据，不需要校验和来源
    pub fn metadata_only() -> Self {
        Self::new(
            ChangeDetection::Metadata,
            ChecksumSource::Local,
            ChecksumSource::Local,
        )
    }

    async fn checksum_differs(&self, src: &Record, dst: &Record) -> Result<bool> {
        let Some(src_crc) = self.src_checksums.crc32(src).await? else {
            debug!("{} 源校验和不可用，需要同步", src.key);
            return Ok(true);
        };
        let dst_crc = self.dst_checksums.crc32(dst).await?;
        debug!("{} 校验和: src={:08x}, dst={:?}", src.key, src_crc, dst_crc);
        Ok(dst_crc != Some(src_crc))
    }
}

#[async_trait]
impl SyncStrategy for ChangedSync {
    async fn should_sync(&self, src: Option<&Record>, dst: Option<&Record>) -> Result<bool> {
        let Some(src) = src else {
            return Ok(false);
        };
        let Some(dst) = dst else {
            return Ok(true);
        };

        match self.detection {
            ChangeDetection::Metadata => Ok(metadata_changed(src, dst)),
            ChangeDetection::Checksum => self.checksum_differs(src, dst).await,
            ChangeDetection::MetadataThenChecksum => {
                if src.mtime <= dst.mtime && src.size == dst.size {
                    return Ok(false);
                }
                self.checksum_differs(src, dst).await
            }
        }
    }

    fn which_action(&self) -> ActionKind {
        ActionKind::Copy
    }

    fn name(&self) -> &'static str {
        match self.detection {
            ChangeDetection::Metadata => "metadata",
            ChangeDetection::Checksum => "checksum",
            ChangeDetection::MetadataThenChecksum => "metadata-then-checksum",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::{FilterConfig, Side};
    use crate::storage::MemoryStore;

    fn rec(key: &str, size: u64, mtime: i64) -> Record {
        Record::new(key, key, size, mtime)
    }

    #[tokio::test]
    async fn test_always_and_never() {
        let r = rec("a", 1, 1);
        assert!(AlwaysSync.should_sync(Some(&r), None).await.unwrap());
        assert!(!AlwaysSync.should_sync(None, Some(&r)).await.unwrap());
        assert!(!NeverSync.should_sync(Some(&r), Some(&r)).await.unwrap());
        assert_eq!(NeverSync.which_action(), ActionKind::Nothing);
    }

    #[tokio::test]
    async fn test_delete_absent() {
        let r = rec("a", 1, 1);
        let strategy = DeleteAbsent::new(None);
        assert!(strategy.should_sync(None, Some(&r)).await.unwrap());
        assert!(!strategy.should_sync(Some(&r), Some(&r)).await.unwrap());
        assert!(!strategy.should_sync(None, None).await.unwrap());
        assert_eq!(strategy.which_action(), ActionKind::Delete);
    }

    #[tokio::test]
    async fn test_delete_absent_respects_filter() {
        let filter = Filter::new(
            &FilterConfig {
                exclude: vec!["keep/*".to_string()],
                ..Default::default()
            },
            Side::Remote,
        )
        .unwrap();
        let strategy = DeleteAbsent::new(Some(Arc::new(filter)));
        assert!(!strategy.should_sync(None, Some(&rec("keep/a", 1, 1))).await.unwrap());
        assert!(strategy.should_sync(None, Some(&rec("drop/a", 1, 1))).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_rule() {
        let strategy = ChangedSync::metadata_only();
        let check = |s: Record, d: Record| {
            let strategy = &strategy;
            async move { strategy.should_sync(Some(&s), Some(&d)).await.unwrap() }
        };
        // 源更旧：即使大小不同也不同步
        assert!(!check(rec("a", 1, 10), rec("a", 2, 20)).await);
        // 源更新
        assert!(check(rec("a", 1, 30), rec("a", 1, 20)).await);
        // 时间相同，只看大小
        assert!(check(rec("a", 1, 20), rec("a", 2, 20)).await);
        assert!(!check(rec("a", 2, 20), rec("a", 2, 20)).await);
        // 目标不存在
        assert!(strategy.should_sync(Some(&rec("a", 1, 1)), None).await.unwrap());
    }

    #[tokio::test]
    async fn test_checksum_local_against_remote() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"hello").unwrap();
        let crc = crc32fast::hash(b"hello");

        let store = Arc::new(MemoryStore::new());
        store.put_with_crc32("bkt", "same", 5, 0, crc);
        store.put_with_crc32("bkt", "other", 5, 0, crc ^ 1);

        let strategy = ChangedSync::new(
            ChangeDetection::Checksum,
            ChecksumSource::Local,
            ChecksumSource::Remote {
                store: store.clone(),
                bucket: "bkt".to_string(),
            },
        );
        let src = Record::new(path.to_string_lossy(), "f.txt", 5, 100);
        assert!(!strategy
            .should_sync(Some(&src), Some(&Record::new("same", "f.txt", 5, 0)))
            .await
            .unwrap());
        assert!(strategy
            .should_sync(Some(&src), Some(&Record::new("other", "f.txt", 5, 0)))
            .await
            .unwrap());
        // 目标没有校验和
        assert!(strategy
            .should_sync(Some(&src), Some(&Record::new("missing", "f.txt", 5, 0)))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_checksum_unavailable_source_syncs() {
        let strategy = ChangedSync::new(
            ChangeDetection::Checksum,
            ChecksumSource::Local,
            ChecksumSource::Local,
        );
        let src = rec("/nonexistent/synctools/src", 1, 1);
        let dst = rec("/nonexistent/synctools/dst", 1, 1);
        assert!(strategy.should_sync(Some(&src), Some(&dst)).await.unwrap());
    }

    #[tokio::test]
    async fn test_metadata_then_checksum() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        std::fs::write(&a, b"same").unwrap();
        std::fs::write(&b, b"same").unwrap();
        let strategy = ChangedSync::new(
            ChangeDetection::MetadataThenChecksum,
            ChecksumSource::Local,
            ChecksumSource::Local,
        );

        // 源较旧且大小相同：直接跳过，不读文件
        let src = Record::new("/nonexistent", "k", 4, 10);
        let dst = Record::new("/nonexistent", "k", 4, 20);
        assert!(!strategy.should_sync(Some(&src), Some(&dst)).await.unwrap());

        // 源较新但内容相同：校验和一致，不同步
        let src = Record::new(a.to_string_lossy(), "k", 4, 30);
        let dst = Record::new(b.to_string_lossy(), "k", 4, 20);
        assert!(!strategy.should_sync(Some(&src), Some(&dst)).await.unwrap());

        std::fs::write(&b, b"diff").unwrap();
        assert!(strategy.should_sync(Some(&src), Some(&dst)).await.unwrap());
    }

    #[tokio::test]
    async fn test_precomputed_checksum_used() {
        let strategy = ChangedSync::new(
            ChangeDetection::Checksum,
            ChecksumSource::Local,
            ChecksumSource::Local,
        );
        let mut src = rec("/nonexistent/a", 1, 1);
        let mut dst = rec("/nonexistent/b", 1, 1);
        src.crc32 = Some(7);
        dst.crc32 = Some(7);
        assert!(!strategy.should_sync(Some(&src), Some(&dst)).await.unwrap());
    }
}
