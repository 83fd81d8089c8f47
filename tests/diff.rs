use filetime::{set_file_mtime, FileTime};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use synctools_lib::config::SyncSettings;
use synctools_lib::core::filter::{Filter, FilterConfig};
use synctools_lib::core::strategy::{ChangeDetection, ChecksumSource};
use synctools_lib::storage::{MemoryStore, ObjectStore};
use synctools_lib::{
    spawn_lister, ActionSummary, Comparator, Location, Strategies, SyncAction, SyncArgs, SyncMode,
};

fn write_file(root: &Path, rel: &str, content: &str, mtime: i64) {
    let path = root.join(rel);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, content).unwrap();
    set_file_mtime(&path, FileTime::from_unix_time(mtime, 0)).unwrap();
}

fn describe(actions: &[SyncAction]) -> Vec<String> {
    actions
        .iter()
        .map(|a| match a {
            SyncAction::Copy { src, .. } => format!("copy:{}", src.key),
            SyncAction::Delete { dst, .. } => format!("delete:{}", dst.key),
            other => format!("{:?}", other),
        })
        .collect()
}

#[tokio::test]
async fn test_local_to_local_diff() {
    let src = TempDir::new().unwrap();
    let dst = TempDir::new().unwrap();

    write_file(src.path(), "a.txt", "new content", 2_000);
    write_file(src.path(), "new.txt", "n", 1_000);
    write_file(src.path(), "same.txt", "same", 1_000);
    write_file(src.path(), "sub/b.txt", "b", 1_000);
    write_file(src.path(), "skip.log", "log", 1_000);

    write_file(dst.path(), "a.txt", "old content", 1_000);
    write_file(dst.path(), "same.txt", "same", 1_000);
    write_file(dst.path(), "stale.txt", "gone", 1_000);
    write_file(dst.path(), "keep.log", "log", 1_000);

    let settings = SyncSettings::default();
    let filter_config = FilterConfig {
        exclude: vec!["*.log".to_string()],
        ..Default::default()
    };

    let src_loc = Location::local(src.path());
    let dst_loc = Location::local(dst.path());
    let src_filter = Filter::for_location(&filter_config, &src_loc).unwrap();
    let dst_filter = Filter::for_location(&filter_config, &dst_loc).unwrap();
    let src_lister = spawn_lister(&src_loc, None, &settings, src_filter).unwrap();
    let dst_lister = spawn_lister(&dst_loc, None, &settings, dst_filter.clone()).unwrap();

    let mode = SyncMode::Changed(ChangeDetection::Metadata);
    let strategies = Strategies::for_mode(
        mode,
        true,
        dst_filter,
        ChecksumSource::Local,
        ChecksumSource::Local,
    );
    let mut args = SyncArgs::new(src_loc, dst_loc);
    args.delete = true;
    args.mode = mode;

    let actions = Comparator::spawn(
        src_lister,
        dst_lister,
        strategies,
        Arc::new(args),
        Duration::from_secs(10),
    )
    .collect()
    .await
    .unwrap();

    // keep.log 被过滤掉，不会被删除
    assert_eq!(
        describe(&actions),
        vec!["copy:a.txt", "copy:new.txt", "delete:stale.txt", "copy:sub/b.txt"]
    );

    match &actions[3] {
        SyncAction::Copy { dst: None, dst_path, .. } => {
            assert_eq!(
                dst_path.to_string(),
                dst.path().join("sub").join("b.txt").display().to_string()
            );
        }
        other => panic!("unexpected {:?}", other),
    }

    let summary = ActionSummary::summarize(&actions);
    assert_eq!(summary.copy_count, 3);
    assert_eq!(summary.delete_count, 1);
}

#[tokio::test]
async fn test_remote_to_local_diff() {
    let store = Arc::new(MemoryStore::new());
    store.put("bkt", "data/x", 3, 1_000);
    store.put("bkt", "data/y/z", 5, 1_000);
    store.put("bkt", "other/w", 1, 1_000);

    let dst = TempDir::new().unwrap();
    write_file(dst.path(), "x", "abc", 1_000);
    write_file(dst.path(), "orphan", "o", 1_000);

    let settings = SyncSettings {
        page_size: 1,
        ..Default::default()
    };
    let store: Arc<dyn ObjectStore> = store;
    let src_loc = Location::remote("bkt", "data");
    let dst_loc = Location::local(dst.path());
    let src_lister = spawn_lister(&src_loc, Some(store.clone()), &settings, None).unwrap();
    let dst_lister = spawn_lister(&dst_loc, None, &settings, None).unwrap();

    // 不开启删除，orphan 保持不动
    let strategies = Strategies::for_mode(
        SyncMode::default(),
        false,
        None,
        ChecksumSource::Remote {
            store,
            bucket: "bkt".to_string(),
        },
        ChecksumSource::Local,
    );
    let actions = Comparator::spawn(
        src_lister,
        dst_lister,
        strategies,
        Arc::new(SyncArgs::new(src_loc, dst_loc)),
        Duration::from_secs(10),
    )
    .collect()
    .await
    .unwrap();

    assert_eq!(describe(&actions), vec!["copy:y/z"]);
    match &actions[0] {
        SyncAction::Copy { src_path, dst_path, .. } => {
            assert_eq!(src_path.to_string(), "s3://bkt/data/y/z");
            assert_eq!(
                dst_path.to_string(),
                dst.path().join("y").join("z").display().to_string()
            );
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[tokio::test]
async fn test_local_to_remote_with_include_patterns() {
    let src = TempDir::new().unwrap();
    write_file(src.path(), "a.txt", "abc", 1_000);
    write_file(src.path(), "b.log", "x", 1_000);
    write_file(src.path(), "sub/c.txt", "cc", 1_000);

    let store = Arc::new(MemoryStore::new());
    store.put("bkt", "p/a.txt", 3, 1_000);
    store.put("bkt", "p/keep.log", 1, 1_000);
    store.put("bkt", "p/old.txt", 1, 1_000);
    let store: Arc<dyn ObjectStore> = store;

    // 同一组相对模式在两侧选中同样的 key
    let filter_config = FilterConfig {
        include: vec!["*.txt".to_string(), "sub/*.txt".to_string()],
        ..Default::default()
    };
    let src_loc = Location::local(src.path());
    let dst_loc: Location = "s3://bkt/p".parse().unwrap();
    let src_filter = Filter::for_location(&filter_config, &src_loc).unwrap();
    let dst_filter = Filter::for_location(&filter_config, &dst_loc).unwrap();

    let settings = SyncSettings::default();
    let src_lister = spawn_lister(&src_loc, None, &settings, src_filter).unwrap();
    let dst_lister =
        spawn_lister(&dst_loc, Some(store.clone()), &settings, dst_filter.clone()).unwrap();

    let strategies = Strategies::for_mode(
        SyncMode::default(),
        true,
        dst_filter,
        ChecksumSource::Local,
        ChecksumSource::Remote {
            store,
            bucket: "bkt".to_string(),
        },
    );
    let mut args = SyncArgs::new(src_loc, dst_loc);
    args.delete = true;

    let actions = Comparator::spawn(
        src_lister,
        dst_lister,
        strategies,
        Arc::new(args),
        Duration::from_secs(10),
    )
    .collect()
    .await
    .unwrap();

    // a.txt 两边相同；keep.log 不在包含范围内，不会被删除
    assert_eq!(describe(&actions), vec!["delete:old.txt", "copy:sub/c.txt"]);
    match &actions[1] {
        SyncAction::Copy { dst_path, .. } => {
            assert_eq!(dst_path.to_string(), "s3://bkt/p/sub/c.txt");
        }
        other => panic!("unexpected {:?}", other),
    }
}
