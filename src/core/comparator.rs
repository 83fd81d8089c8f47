//! 归并比较器
//!
//! 同时消费源和目标两条按 key 升序的记录流，每侧只保留一条待比较记录，
//! 线性时间内把每个位置归类为“两边都有 / 只有源 / 只有目标”，交给对应策略决定动作。
//! 两条输入流必须严格升序，否则结果是错的。

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::core::args::{Location, ObjectPath, SyncArgs, SyncMode};
use crate::core::filter::Filter;
use crate::core::lister::Lister;
use crate::core::pipe::{pipe, Pipe, PipeSender};
use crate::core::record::{Record, StreamElement};
use crate::core::strategy::{
    ActionKind, AlwaysSync, ChangedSync, ChecksumSource, DeleteAbsent, NeverSync, SyncStrategy,
};
use crate::error::{Result, SyncError};

/// 同步动作
#[derive(Debug, Clone)]
pub enum SyncAction {
    /// 复制文件：源路径 -> 目标路径
    Copy {
        src: Record,
        /// 只有源存在时为 `None`
        dst: Option<Record>,
        src_path: ObjectPath,
        dst_path: ObjectPath,
    },
    /// 删除目标文件
    Delete { dst: Record, dst_path: ObjectPath },
    Nothing {
        src: Option<Record>,
        dst: Option<Record>,
    },
    /// 比较中止，之后不会再有动作
    Error(SyncError),
    Ended,
}

impl SyncAction {
    /// 是否为最后一个动作
    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncAction::Ended | SyncAction::Error(_))
    }
}

/// 三种情况各自的策略，`None` 表示该情况直接忽略
pub struct Strategies {
    pub both: Box<dyn SyncStrategy>,
    pub src_only: Option<Box<dyn SyncStrategy>>,
    pub dst_only: Option<Box<dyn SyncStrategy>>,
}

impl Strategies {
    /// 根据同步模式和删除开关选择策略
    ///
    /// 只有源存在时总是复制；开启删除时只有目标存在的文件会被删除，
    /// `delete_filter` 中被排除的目标文件保留。
    pub fn for_mode(
        mode: SyncMode,
        delete: bool,
        delete_filter: Option<Arc<Filter>>,
        src_checksums: ChecksumSource,
        dst_checksums: ChecksumSource,
    ) -> Self {
        let both: Box<dyn SyncStrategy> = match mode {
            SyncMode::Always => Box::new(AlwaysSync),
            SyncMode::Never => Box::new(NeverSync),
            SyncMode::Changed(detection) => {
                Box::new(ChangedSync::new(detection, src_checksums, dst_checksums))
            }
        };
        let dst_only: Option<Box<dyn SyncStrategy>> = if delete {
            Some(Box::new(DeleteAbsent::new(delete_filter)))
        } else {
            None
        };
        Self {
            both,
            src_only: Some(Box::new(AlwaysSync)),
            dst_only,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Case {
    Both,
    SrcOnly,
    DstOnly,
}

pub struct Comparator;

impl Comparator {
    /// 在后台启动归并比较，返回动作流
    ///
    /// `deadline` 是调用方每次拉取动作的最长等待时间。
    pub fn spawn(
        src: Box<dyn Lister>,
        dst: Box<dyn Lister>,
        strategies: Strategies,
        args: Arc<SyncArgs>,
        deadline: Duration,
    ) -> ActionStream {
        let (tx, rx) = pipe("comparator", args.concurrency, deadline);
        let join = MergeJoin {
            src,
            dst,
            strategies,
            args,
            tx,
            stats: DecisionStats::default(),
        };
        tokio::spawn(join.run());
        ActionStream {
            pipe: rx,
            finished: false,
        }
    }
}

/// 比较器输出的动作流
pub struct ActionStream {
    pipe: Pipe<SyncAction>,
    finished: bool,
}

impl ActionStream {
    /// 拉取下一个动作，结束后持续返回 `Ended`
    pub async fn next(&mut self) -> Result<SyncAction> {
        if self.finished {
            return Ok(SyncAction::Ended);
        }
        match self.pipe.recv().await {
            Ok(Some(action)) => {
                if action.is_terminal() {
                    self.finished = true;
                }
                Ok(action)
            }
            Ok(None) => {
                self.finished = true;
                Err(SyncError::StreamClosed(self.pipe.name().to_string()))
            }
            Err(e) => Err(e),
        }
    }

    /// 拉取到结束，返回不含 `Ended` 的全部动作
    pub async fn collect(mut self) -> Result<Vec<SyncAction>> {
        let mut actions = Vec::new();
        loop {
            match self.next().await? {
                SyncAction::Ended => return Ok(actions),
                action => {
                    let is_error = matches!(action, SyncAction::Error(_));
                    actions.push(action);
                    if is_error {
                        return Ok(actions);
                    }
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct DecisionStats {
    both: u64,
    src_only: u64,
    dst_only: u64,
    actions: u64,
}

struct MergeJoin {
    src: Box<dyn Lister>,
    dst: Box<dyn Lister>,
    strategies: Strategies,
    args: Arc<SyncArgs>,
    tx: PipeSender<SyncAction>,
    stats: DecisionStats,
}

/// 拉取一侧的下一条记录，`Ok(None)` 表示这一侧已结束
///
/// “文件已消失”的软错误按出错的那一侧判断并跳过，其余软错误中止比较。
async fn pull(lister: &mut dyn Lister, side: &str) -> Result<Option<Record>> {
    loop {
        match lister.next().await? {
            StreamElement::File(record) => {
                if let Some(ref err) = record.err {
                    if err.is_vanished() {
                        warn!("{} 侧文件已不存在，跳过: {}", side, record.path);
                        continue;
                    }
                    return Err(SyncError::Item {
                        key: record.key.clone(),
                        error: err.clone(),
                    });
                }
                return Ok(Some(record));
            }
            StreamElement::Dir(_) | StreamElement::EndInfo(_) => continue,
            StreamElement::Err(e) => return Err(e),
            StreamElement::Ended => return Ok(None),
        }
    }
}

impl MergeJoin {
    async fn run(mut self) {
        info!("开始比较: {} -> {}", self.args.src, self.args.dst);

        let mut src_cur: Option<Record> = None;
        let mut dst_cur: Option<Record> = None;
        let mut src_done = false;
        let mut dst_done = false;
        let mut take_src = true;
        let mut take_dst = true;

        loop {
            if take_src && !src_done {
                match pull(self.src.as_mut(), "源").await {
                    Ok(Some(record)) => src_cur = Some(record),
                    Ok(None) => src_done = true,
                    Err(e) => return self.abort(e).await,
                }
                take_src = false;
            }
            if take_dst && !dst_done {
                match pull(self.dst.as_mut(), "目标").await {
                    Ok(Some(record)) => dst_cur = Some(record),
                    Ok(None) => dst_done = true,
                    Err(e) => return self.abort(e).await,
                }
                take_dst = false;
            }

            let keep_going = match (src_cur.take(), dst_cur.take()) {
                (Some(src), Some(dst)) => match src.key.cmp(&dst.key) {
                    Ordering::Equal => {
                        take_src = true;
                        take_dst = true;
                        self.decide(Case::Both, Some(src), Some(dst)).await
                    }
                    Ordering::Less => {
                        dst_cur = Some(dst);
                        take_src = true;
                        self.decide(Case::SrcOnly, Some(src), None).await
                    }
                    Ordering::Greater => {
                        src_cur = Some(src);
                        take_dst = true;
                        self.decide(Case::DstOnly, None, Some(dst)).await
                    }
                },
                (Some(src), None) => {
                    // 目标已结束
                    if self.strategies.src_only.is_none() {
                        break;
                    }
                    take_src = true;
                    self.decide(Case::SrcOnly, Some(src), None).await
                }
                (None, Some(dst)) => {
                    // 源已结束，没有删除策略时不必继续读目标
                    if self.strategies.dst_only.is_none() {
                        break;
                    }
                    take_dst = true;
                    self.decide(Case::DstOnly, None, Some(dst)).await
                }
                (None, None) => break,
            };
            if !keep_going {
                return;
            }
        }

        info!(
            "比较完成: 两边都有 {}, 仅源 {}, 仅目标 {}, 产生动作 {}",
            self.stats.both, self.stats.src_only, self.stats.dst_only, self.stats.actions
        );
        self.tx.send(SyncAction::Ended).await;
    }

    async fn abort(self, e: SyncError) {
        error!("比较中止: {}", e);
        self.tx.send(SyncAction::Error(e)).await;
    }

    /// 应用策略并输出动作，返回 `false` 表示应当停止
    async fn decide(&mut self, case: Case, src: Option<Record>, dst: Option<Record>) -> bool {
        let strategy = match case {
            Case::Both => {
                self.stats.both += 1;
                Some(&self.strategies.both)
            }
            Case::SrcOnly => {
                self.stats.src_only += 1;
                self.strategies.src_only.as_ref()
            }
            Case::DstOnly => {
                self.stats.dst_only += 1;
                self.strategies.dst_only.as_ref()
            }
        };
        let Some(strategy) = strategy else {
            return true;
        };

        let key = src
            .as_ref()
            .or(dst.as_ref())
            .map(|r| r.key.clone())
            .unwrap_or_default();
        let should_sync = match strategy.should_sync(src.as_ref(), dst.as_ref()).await {
            Ok(v) => v,
            Err(e) => {
                error!("{} 策略 {} 出错: {}", key, strategy.name(), e);
                self.tx.send(SyncAction::Error(e)).await;
                return false;
            }
        };
        debug!("{:?} {} [{}] -> {}", case, key, strategy.name(), should_sync);
        if !should_sync {
            return true;
        }

        let action = build_action(strategy.which_action(), &self.args.src, &self.args.dst, src, dst);
        self.stats.actions += 1;
        self.tx.send(action).await
    }
}

fn build_action(
    kind: ActionKind,
    src_loc: &Location,
    dst_loc: &Location,
    src: Option<Record>,
    dst: Option<Record>,
) -> SyncAction {
    match (kind, src, dst) {
        (ActionKind::Copy, Some(src), dst) => {
            let src_path = src_loc.path_for(&src);
            let dst_path = match dst {
                Some(ref d) => dst_loc.path_for(d),
                None => dst_loc.synthesize(&src.key),
            };
            SyncAction::Copy {
                src,
                dst,
                src_path,
                dst_path,
            }
        }
        (ActionKind::Delete, _, Some(dst)) => SyncAction::Delete {
            dst_path: dst_loc.path_for(&dst),
            dst,
        },
        (_, src, dst) => SyncAction::Nothing { src, dst },
    }
}

/// 动作统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActionSummary {
    pub copy_count: usize,
    pub copy_bytes: u64,
    pub delete_count: usize,
    pub nothing_count: usize,
}

impl ActionSummary {
    pub fn record(&mut self, action: &SyncAction) {
        match action {
            SyncAction::Copy { src, .. } => {
                self.copy_count += 1;
                self.copy_bytes += src.size;
            }
            SyncAction::Delete { .. } => self.delete_count += 1,
            SyncAction::Nothing { .. } => self.nothing_count += 1,
            SyncAction::Error(_) | SyncAction::Ended => {}
        }
    }

    pub fn summarize(actions: &[SyncAction]) -> Self {
        let mut summary = Self::default();
        for action in actions {
            summary.record(action);
        }
        summary
    }

    pub fn total_actions(&self) -> usize {
        self.copy_count + self.delete_count + self.nothing_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::strategy::ChangeDetection;
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// 按给定顺序吐出元素的假列举器
    struct VecLister(VecDeque<StreamElement>);

    impl VecLister {
        fn files(records: Vec<Record>) -> Box<dyn Lister> {
            let mut elements: VecDeque<_> = records.into_iter().map(StreamElement::File).collect();
            elements.push_back(StreamElement::Ended);
            Box::new(VecLister(elements))
        }

        fn keys(keys: &[&str]) -> Box<dyn Lister> {
            Self::files(keys.iter().map(|k| rec(k, 1, 1)).collect())
        }
    }

    #[async_trait]
    impl Lister for VecLister {
        async fn next(&mut self) -> Result<StreamElement> {
            Ok(self.0.pop_front().unwrap_or(StreamElement::Ended))
        }
    }

    fn rec(key: &str, size: u64, mtime: i64) -> Record {
        Record::new(format!("/src/{}", key), key, size, mtime)
    }

    fn args() -> Arc<SyncArgs> {
        Arc::new(SyncArgs::new(
            Location::local("/src"),
            Location::remote("bkt", "dst"),
        ))
    }

    fn strategies(both: Box<dyn SyncStrategy>, delete: bool) -> Strategies {
        Strategies {
            both,
            src_only: Some(Box::new(AlwaysSync)),
            dst_only: if delete {
                Some(Box::new(DeleteAbsent::new(None)))
            } else {
                None
            },
        }
    }

    async fn run(src: Box<dyn Lister>, dst: Box<dyn Lister>, strategies: Strategies) -> Vec<SyncAction> {
        Comparator::spawn(src, dst, strategies, args(), Duration::from_secs(5))
            .collect()
            .await
            .unwrap()
    }

    /// 把动作写成 "copy:a" / "delete:c" 便于断言
    fn describe(actions: &[SyncAction]) -> Vec<String> {
        actions
            .iter()
            .map(|a| match a {
                SyncAction::Copy { src, .. } => format!("copy:{}", src.key),
                SyncAction::Delete { dst, .. } => format!("delete:{}", dst.key),
                SyncAction::Nothing { .. } => "nothing".to_string(),
                SyncAction::Error(e) => format!("error:{}", e.code()),
                SyncAction::Ended => "ended".to_string(),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_merge_join_scenario() {
        // 源 {a, b, d}，目标 {b, c}
        let actions = run(
            VecLister::keys(&["a", "b", "d"]),
            VecLister::keys(&["b", "c"]),
            strategies(Box::new(AlwaysSync), true),
        )
        .await;
        assert_eq!(
            describe(&actions),
            vec!["copy:a", "copy:b", "delete:c", "copy:d"]
        );
    }

    #[tokio::test]
    async fn test_identical_sides_produce_no_actions() {
        let records = || vec![rec("a", 1, 10), rec("b/c", 2, 20), rec("d", 3, 30)];
        let actions = run(
            VecLister::files(records()),
            VecLister::files(records()),
            strategies(Box::new(ChangedSync::metadata_only()), true),
        )
        .await;
        assert!(actions.is_empty());
    }

    #[tokio::test]
    async fn test_src_only_run_does_not_consume_destination() {
        let actions = run(
            VecLister::keys(&["a", "b", "c", "x"]),
            VecLister::keys(&["x"]),
            strategies(Box::new(NeverSync), true),
        )
        .await;
        assert_eq!(describe(&actions), vec!["copy:a", "copy:b", "copy:c"]);
    }

    #[tokio::test]
    async fn test_equal_keys_use_both_side_strategy_once() {
        let src = vec![rec("a", 1, 20), rec("b", 1, 10)];
        let dst = vec![rec("a", 1, 10), rec("b", 1, 20)];
        let actions = run(
            VecLister::files(src),
            VecLister::files(dst),
            strategies(Box::new(ChangedSync::metadata_only()), true),
        )
        .await;
        assert_eq!(describe(&actions), vec!["copy:a"]);
        match &actions[0] {
            SyncAction::Copy { dst: Some(d), .. } => assert_eq!(d.key, "a"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_without_delete_destination_leftovers_ignored() {
        let actions = run(
            VecLister::keys(&["a"]),
            VecLister::keys(&["b", "c", "d"]),
            strategies(Box::new(AlwaysSync), false),
        )
        .await;
        assert_eq!(describe(&actions), vec!["copy:a"]);
    }

    #[tokio::test]
    async fn test_destination_path_synthesized_for_source_only() {
        let actions = run(
            VecLister::keys(&["dir/a.txt"]),
            VecLister::keys(&[]),
            strategies(Box::new(AlwaysSync), false),
        )
        .await;
        match &actions[0] {
            SyncAction::Copy {
                dst: None,
                src_path,
                dst_path,
                ..
            } => {
                assert_eq!(src_path.to_string(), "/src/dir/a.txt");
                assert_eq!(dst_path.to_string(), "s3://bkt/dst/dir/a.txt");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_hard_error_emits_single_error_action() {
        let mut dst: VecDeque<_> = vec![
            StreamElement::File(rec("b", 1, 1)),
            StreamElement::Err(SyncError::Storage("boom".to_string())),
            StreamElement::Ended,
        ]
        .into();
        dst.push_back(StreamElement::Ended);

        let mut stream = Comparator::spawn(
            VecLister::keys(&["a", "b", "c", "d", "e"]),
            Box::new(VecLister(dst)),
            strategies(Box::new(NeverSync), true),
            args(),
            Duration::from_secs(5),
        );

        let mut seen = Vec::new();
        loop {
            let action = stream.next().await.unwrap();
            let terminal = action.is_terminal();
            seen.push(action);
            if terminal {
                break;
            }
        }
        assert_eq!(describe(&seen), vec!["copy:a", "error:Storage"]);
        // 错误之后不再有动作
        assert!(matches!(stream.next().await.unwrap(), SyncAction::Ended));
    }

    #[tokio::test]
    async fn test_vanished_destination_item_skipped() {
        let vanished = Record::with_error(
            "/dst/b",
            "b",
            crate::core::record::ItemError::new(crate::core::record::ItemErrorKind::NotFound, "gone"),
        );
        let dst = VecDeque::from(vec![StreamElement::File(vanished), StreamElement::Ended]);
        let actions = run(
            VecLister::keys(&["a", "b"]),
            Box::new(VecLister(dst)),
            strategies(Box::new(NeverSync), true),
        )
        .await;
        // b 在目标侧消失，视为只有源存在
        assert_eq!(describe(&actions), vec!["copy:a", "copy:b"]);
    }

    #[tokio::test]
    async fn test_vanished_source_item_skipped() {
        let vanished = Record::with_error(
            "/src/b",
            "b",
            crate::core::record::ItemError::new(crate::core::record::ItemErrorKind::NotFound, "gone"),
        );
        let src = VecDeque::from(vec![
            StreamElement::File(rec("a", 1, 1)),
            StreamElement::File(vanished),
            StreamElement::Ended,
        ]);
        let actions = run(
            Box::new(VecLister(src)),
            VecLister::keys(&["b"]),
            strategies(Box::new(AlwaysSync), true),
        )
        .await;
        // b 在源侧消失，目标上的 b 变成只有目标存在
        assert_eq!(describe(&actions), vec!["copy:a", "delete:b"]);
    }

    #[tokio::test]
    async fn test_slow_consumer_receives_every_action() {
        let keys: Vec<String> = (0..10).map(|i| format!("k{}", i)).collect();
        let key_refs: Vec<&str> = keys.iter().map(String::as_str).collect();
        let deadline = Duration::from_millis(100);
        let mut stream = Comparator::spawn(
            VecLister::keys(&key_refs),
            VecLister::keys(&[]),
            strategies(Box::new(AlwaysSync), false),
            args(),
            deadline,
        );

        let mut seen = Vec::new();
        loop {
            // 执行器处理一个动作的时间超过截止时间
            tokio::time::sleep(deadline * 3).await;
            let action = stream.next().await.unwrap();
            let terminal = action.is_terminal();
            seen.push(action);
            if terminal {
                break;
            }
        }
        let mut expected: Vec<String> = keys.iter().map(|k| format!("copy:{}", k)).collect();
        expected.push("ended".to_string());
        assert_eq!(describe(&seen), expected);
    }

    #[tokio::test]
    async fn test_other_soft_error_aborts() {
        let broken = Record::with_error(
            "/src/b",
            "b",
            crate::core::record::ItemError::new(
                crate::core::record::ItemErrorKind::PermissionDenied,
                "denied",
            ),
        );
        let src = VecDeque::from(vec![
            StreamElement::File(rec("a", 1, 1)),
            StreamElement::File(broken),
            StreamElement::Ended,
        ]);
        let actions = run(
            Box::new(VecLister(src)),
            VecLister::keys(&[]),
            strategies(Box::new(NeverSync), false),
        )
        .await;
        assert_eq!(describe(&actions), vec!["copy:a", "error:ItemError"]);
    }

    #[tokio::test]
    async fn test_dir_and_end_info_elements_ignored() {
        let src = VecDeque::from(vec![
            StreamElement::Dir("p/".to_string()),
            StreamElement::File(rec("a", 1, 1)),
            StreamElement::EndInfo(Default::default()),
            StreamElement::File(rec("b", 1, 1)),
            StreamElement::Ended,
        ]);
        let actions = run(
            Box::new(VecLister(src)),
            VecLister::keys(&[]),
            strategies(Box::new(NeverSync), false),
        )
        .await;
        assert_eq!(describe(&actions), vec!["copy:a", "copy:b"]);
    }

    #[test]
    fn test_for_mode_selects_strategies() {
        let s = Strategies::for_mode(
            SyncMode::Changed(ChangeDetection::Checksum),
            false,
            None,
            ChecksumSource::Local,
            ChecksumSource::Local,
        );
        assert_eq!(s.both.name(), "checksum");
        assert!(s.dst_only.is_none());

        let s = Strategies::for_mode(
            SyncMode::Never,
            true,
            None,
            ChecksumSource::Local,
            ChecksumSource::Local,
        );
        assert_eq!(s.both.name(), "never");
        assert_eq!(s.dst_only.map(|d| d.which_action()), Some(ActionKind::Delete));
    }

    #[test]
    fn test_summary() {
        let actions = vec![
            SyncAction::Copy {
                src: rec("a", 10, 1),
                dst: None,
                src_path: ObjectPath::Local("/src/a".into()),
                dst_path: ObjectPath::Local("/dst/a".into()),
            },
            SyncAction::Delete {
                dst: rec("b", 5, 1),
                dst_path: ObjectPath::Local("/dst/b".into()),
            },
            SyncAction::Ended,
        ];
        let summary = ActionSummary::summarize(&actions);
        assert_eq!(summary.copy_count, 1);
        assert_eq!(summary.copy_bytes, 10);
        assert_eq!(summary.delete_count, 1);
        assert_eq!(summary.total_actions(), 2);
    }
}
