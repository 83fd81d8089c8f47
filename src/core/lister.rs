//! 列举器：把一侧（本地目录或远程前缀）变成按 key 严格升序的记录流
//!
//! 两种列举器都在后台任务里生产，写入有界管道；`next()` 带截止时间拉取。
//! 流的最后一个元素总是 `Ended`，硬错误以 `Err` 元素出现并紧跟 `Ended`。

use async_trait::async_trait;
use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use walkdir::{DirEntry, WalkDir};

use crate::config::SyncSettings;
use crate::core::args::Location;
use crate::core::filter::Filter;
use crate::core::pipe::{pipe, Pipe, PipeSender};
use crate::core::record::{
    now_secs, system_time_secs, to_key, EndInfo, ItemError, Record, StreamElement, KEY_SEPARATOR,
};
use crate::error::{Result, SyncError};
use crate::storage::{ListObjectsRequest, ObjectStore, ObjectSummary};

#[async_trait]
pub trait Lister: Send {
    /// 拉取下一个元素，超过截止时间返回 `Timeout`
    async fn next(&mut self) -> Result<StreamElement>;
}

/// 两种列举器共用的消费端
struct ElementStream {
    pipe: Pipe<StreamElement>,
    finished: bool,
}

impl ElementStream {
    async fn next(&mut self) -> Result<StreamElement> {
        if self.finished {
            return Ok(StreamElement::Ended);
        }
        match self.pipe.recv().await {
            Ok(Some(element)) => {
                if element.is_ended() {
                    self.finished = true;
                }
                Ok(element)
            }
            Ok(None) => {
                self.finished = true;
                Err(SyncError::StreamClosed(self.pipe.name().to_string()))
            }
            Err(e) => Err(e),
        }
    }
}

// ============ 远程列举 ============

#[derive(Debug, Clone)]
pub struct RemoteListOptions {
    pub bucket: String,
    /// 为空或以 `/` 结尾
    pub prefix: String,
    pub recursive: bool,
    pub emit_empty_dir: bool,
    pub page_size: usize,
    pub deadline: Duration,
}

pub struct RemoteLister {
    stream: ElementStream,
}

impl RemoteLister {
    pub fn spawn(
        store: Arc<dyn ObjectStore>,
        opts: RemoteListOptions,
        filter: Option<Arc<Filter>>,
    ) -> Self {
        let name = format!("remote lister s3://{}/{}", opts.bucket, opts.prefix);
        let (tx, rx) = pipe(name, opts.page_size, opts.deadline);
        tokio::spawn(produce_remote(store, opts, filter, tx));
        Self {
            stream: ElementStream {
                pipe: rx,
                finished: false,
            },
        }
    }
}

#[async_trait]
impl Lister for RemoteLister {
    async fn next(&mut self) -> Result<StreamElement> {
        self.stream.next().await
    }
}

/// 单个对象的处理结果
enum Converted {
    Keep(Record),
    Skip,
    /// 前缀本身对应的目录对象
    PrefixMarker(Record),
}

fn convert_object(
    obj: ObjectSummary,
    opts: &RemoteListOptions,
    filter: Option<&Filter>,
) -> Result<Converted> {
    let is_dir_marker = obj.key.ends_with(KEY_SEPARATOR);
    let is_prefix_marker = is_dir_marker && !opts.prefix.is_empty() && obj.key == opts.prefix;
    if is_dir_marker && !opts.recursive && !is_prefix_marker {
        return Ok(Converted::Skip);
    }

    let mtime = chrono::DateTime::parse_from_rfc3339(&obj.last_modified)
        .map(|t| t.timestamp())
        .map_err(|_| SyncError::MalformedTimestamp {
            key: obj.key.clone(),
            value: obj.last_modified.clone(),
        })?;

    if let Some(filter) = filter {
        if filter.should_exclude_path(&obj.key) || filter.should_exclude_time(mtime) {
            debug!("排除对象: {}", obj.key);
            return Ok(Converted::Skip);
        }
    }

    let key = obj
        .key
        .strip_prefix(opts.prefix.as_str())
        .unwrap_or(&obj.key)
        .trim_start_matches(KEY_SEPARATOR)
        .to_string();
    let record = Record {
        path: obj.key,
        key,
        size: obj.size,
        mtime,
        gtime: now_secs(),
        storage_class: obj.storage_class,
        crc32: None,
        err: None,
    };

    if is_prefix_marker {
        Ok(Converted::PrefixMarker(record))
    } else {
        Ok(Converted::Keep(record))
    }
}

async fn produce_remote(
    store: Arc<dyn ObjectStore>,
    opts: RemoteListOptions,
    filter: Option<Arc<Filter>>,
    tx: PipeSender<StreamElement>,
) {
    info!("开始列举远程对象: {}/{}", opts.bucket, opts.prefix);

    let mut marker: Option<String> = None;
    let mut prefix_marker: Option<Record> = None;
    let mut emitted = 0usize;

    loop {
        let req = ListObjectsRequest {
            bucket: opts.bucket.clone(),
            prefix: opts.prefix.clone(),
            delimiter: (!opts.recursive).then(|| KEY_SEPARATOR.to_string()),
            marker: marker.clone(),
            max_keys: opts.page_size,
        };

        let page = match store.list_objects(&req).await {
            Ok(page) => page,
            Err(e) => {
                error!("列举 {}/{} 失败: {}", opts.bucket, opts.prefix, e);
                fail(&tx, e).await;
                return;
            }
        };

        if !opts.recursive {
            for dir in page.common_prefixes {
                if !tx.send(StreamElement::Dir(dir)).await {
                    return;
                }
            }
        }

        let last_object_key = page.objects.last().map(|o| o.key.clone());
        for obj in page.objects {
            match convert_object(obj, &opts, filter.as_deref()) {
                Ok(Converted::Keep(record)) => {
                    emitted += 1;
                    if !tx.send(StreamElement::File(record)).await {
                        return;
                    }
                }
                Ok(Converted::Skip) => {}
                Ok(Converted::PrefixMarker(record)) => prefix_marker = Some(record),
                Err(e) => {
                    error!("{}", e);
                    fail(&tx, e).await;
                    return;
                }
            }
        }

        if !page.is_truncated {
            break;
        }

        marker = page.next_marker.or(last_object_key);
        let info = EndInfo {
            next_marker: marker.clone(),
            is_truncated: true,
        };
        if !tx.send(StreamElement::EndInfo(info)).await {
            return;
        }
        if marker.is_none() {
            // 截断但没有续传位置，继续请求只会重复同一页
            warn!("列举结果被截断但没有返回 marker: {}/{}", opts.bucket, opts.prefix);
            break;
        }
    }

    // 前缀本身是空目录
    if let Some(record) = prefix_marker {
        if opts.emit_empty_dir && emitted == 0 {
            emitted += 1;
            if !tx.send(StreamElement::File(record)).await {
                return;
            }
        }
    }

    info!("远程列举完成: {}/{}, {} 个对象", opts.bucket, opts.prefix, emitted);
    tx.send(StreamElement::Ended).await;
}

async fn fail(tx: &PipeSender<StreamElement>, e: SyncError) {
    if tx.send(StreamElement::Err(e)).await {
        tx.send(StreamElement::Ended).await;
    }
}

// ============ 本地遍历 ============

#[derive(Debug, Clone)]
pub struct LocalListOptions {
    pub root: PathBuf,
    pub follow_symlinks: bool,
    pub page_size: usize,
    pub deadline: Duration,
}

pub struct LocalLister {
    stream: ElementStream,
}

impl LocalLister {
    pub fn spawn(opts: LocalListOptions, filter: Option<Arc<Filter>>) -> Self {
        let name = format!("local lister {}", opts.root.display());
        let (tx, rx) = pipe(name, opts.page_size, opts.deadline);
        // 使用 spawn_blocking 避免阻塞 async runtime
        tokio::task::spawn_blocking(move || walk_local(opts, filter, tx));
        Self {
            stream: ElementStream {
                pipe: rx,
                finished: false,
            },
        }
    }
}

#[async_trait]
impl Lister for LocalLister {
    async fn next(&mut self) -> Result<StreamElement> {
        self.stream.next().await
    }
}

/// 目录名后追加 `/` 再排序，使遍历顺序与 key 的字典序一致
fn sort_name(entry: &DirEntry) -> String {
    let mut name = entry.file_name().to_string_lossy().into_owned();
    let file_type = entry.file_type();
    // 排序时条目还未跟随链接，指向目录的链接也按目录排序
    if file_type.is_dir() || (file_type.is_symlink() && entry.path().is_dir()) {
        name.push(KEY_SEPARATOR);
    }
    name
}

fn compare_entries(a: &DirEntry, b: &DirEntry) -> Ordering {
    sort_name(a).cmp(&sort_name(b))
}

fn relative_key(root: &Path, path: &Path) -> String {
    to_key(path.strip_prefix(root).unwrap_or(path))
}

fn walk_local(opts: LocalListOptions, filter: Option<Arc<Filter>>, tx: PipeSender<StreamElement>) {
    let root = opts.root;
    let send = |element: StreamElement| tx.blocking_send(element);
    let excluded = |path: &str, mtime: i64| {
        filter
            .as_ref()
            .is_some_and(|f| f.should_exclude(path, mtime))
    };

    info!("开始遍历本地目录: {}", root.display());

    let root_meta = match fs::metadata(&root) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            debug!("本地路径不存在: {}", root.display());
            send(StreamElement::Ended);
            return;
        }
        Err(e) => {
            if send(StreamElement::Err(SyncError::ReadDir {
                path: root.clone(),
                source: Arc::new(e),
            })) {
                send(StreamElement::Ended);
            }
            return;
        }
    };

    // 单个文件
    if root_meta.is_file() {
        let path = root.to_string_lossy().into_owned();
        let key = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let mtime = root_meta.modified().map(system_time_secs).unwrap_or(0);
        if !excluded(&path, mtime) {
            send(StreamElement::File(Record::new(path, key, root_meta.len(), mtime)));
        }
        send(StreamElement::Ended);
        return;
    }

    let walker = WalkDir::new(&root)
        .follow_links(opts.follow_symlinks)
        .sort_by(compare_entries)
        .into_iter()
        .filter_entry(|entry| {
            // 目录只做排除判断，不做包含判断
            if entry.depth() == 0 || !entry.file_type().is_dir() {
                return true;
            }
            let pruned = filter
                .as_ref()
                .is_some_and(|f| f.should_exclude_dir(&entry.path().to_string_lossy()));
            if pruned {
                debug!("排除目录: {}", entry.path().display());
            }
            !pruned
        });

    let mut emitted = 0usize;
    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => match classify_walk_error(&root, e) {
                WalkFailure::Soft(record) => {
                    warn!("读取条目失败: {} ({:?})", record.path, record.err);
                    if !send(StreamElement::File(record)) {
                        return;
                    }
                    continue;
                }
                WalkFailure::Skip => continue,
                WalkFailure::Hard(err) => {
                    error!("{}", err);
                    if send(StreamElement::Err(err)) {
                        send(StreamElement::Ended);
                    }
                    return;
                }
            },
        };

        if entry.depth() == 0 || entry.file_type().is_dir() {
            continue;
        }
        if !entry.file_type().is_file() {
            // 未跟随的符号链接、设备文件、socket 等
            debug!("跳过非常规文件: {}", entry.path().display());
            continue;
        }

        let path = entry.path().to_string_lossy().into_owned();
        let key = relative_key(&root, entry.path());

        // 跟随链接时 metadata() 返回的是目标文件的元数据
        let record = match entry.metadata() {
            Ok(meta) => match meta.modified() {
                Ok(modified) => {
                    let mtime = system_time_secs(modified);
                    if excluded(&path, mtime) {
                        continue;
                    }
                    Record::new(path, key, meta.len(), mtime)
                }
                Err(e) => Record::with_error(path, key, ItemError::from_io(&e)),
            },
            Err(e) => {
                let io_err = io::Error::from(e);
                Record::with_error(path, key, ItemError::from_io(&io_err))
            }
        };

        if record.err.is_some() {
            if filter.as_ref().is_some_and(|f| f.should_exclude_path(&record.path)) {
                continue;
            }
            warn!("读取元数据失败: {} ({:?})", record.path, record.err);
        }

        emitted += 1;
        if !send(StreamElement::File(record)) {
            return;
        }
    }

    info!("本地遍历完成: {}, {} 个文件", root.display(), emitted);
    send(StreamElement::Ended);
}

enum WalkFailure {
    Soft(Record),
    Skip,
    Hard(SyncError),
}

/// 目录读取失败是硬错误；单个条目（失效链接、中途消失）是软错误
fn classify_walk_error(root: &Path, e: walkdir::Error) -> WalkFailure {
    if let Some(ancestor) = e.loop_ancestor() {
        warn!("检测到符号链接循环: {}", ancestor.display());
        return WalkFailure::Skip;
    }
    let Some(path) = e.path().map(Path::to_path_buf) else {
        return WalkFailure::Hard(SyncError::Io(Arc::new(io::Error::from(e))));
    };
    let io_err = io::Error::from(e);

    let is_dir = fs::symlink_metadata(&path)
        .map(|m| m.is_dir())
        .unwrap_or(false);
    if is_dir {
        return WalkFailure::Hard(SyncError::ReadDir {
            path,
            source: Arc::new(io_err),
        });
    }

    let key = relative_key(root, &path);
    let path = path.to_string_lossy().into_owned();
    WalkFailure::Soft(Record::with_error(path, key, ItemError::from_io(&io_err)))
}

// ============ 构造 ============

/// 为一侧位置创建列举器
pub fn spawn_lister(
    location: &Location,
    store: Option<Arc<dyn ObjectStore>>,
    settings: &SyncSettings,
    filter: Option<Arc<Filter>>,
) -> Result<Box<dyn Lister>> {
    match location {
        Location::Local { root } => Ok(Box::new(LocalLister::spawn(
            LocalListOptions {
                root: root.clone(),
                follow_symlinks: settings.follow_symlinks,
                page_size: settings.page_size,
                deadline: settings.list_timeout(),
            },
            filter,
        ))),
        Location::Remote { bucket, prefix } => {
            let store = store.ok_or_else(|| {
                SyncError::Config(format!("{} 需要对象存储客户端", location))
            })?;
            Ok(Box::new(RemoteLister::spawn(
                store,
                RemoteListOptions {
                    bucket: bucket.clone(),
                    prefix: prefix.clone(),
                    recursive: true,
                    emit_empty_dir: settings.emit_empty_dir,
                    page_size: settings.page_size,
                    deadline: settings.list_timeout(),
                },
                filter,
            )))
        }
    }
}
