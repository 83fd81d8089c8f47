//! 路径与时间过滤
//!
//! 每个 `Lister` 各持有一个 [`Filter`]，条目在进入比较器之前就已经过滤完毕。
//! 删除策略也会复用同一个过滤器来保护被排除的目标文件。

use std::path::MAIN_SEPARATOR;
use std::str::FromStr;
use std::sync::Arc;

use glob::{MatchOptions, Pattern};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::args::Location;
use crate::error::{FilterKind, Result, SyncError};

/// 过滤器所在的一侧，决定路径分隔符和规范化方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Local,
    Remote,
}

impl Side {
    pub fn separator(&self) -> char {
        match self {
            Side::Local => MAIN_SEPARATOR,
            Side::Remote => '/',
        }
    }
}

/// 闭区间 `[start, end]`，单位为 Unix 秒
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: i64,
    pub end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Result<Self> {
        if start > end {
            return Err(SyncError::InvalidTimeRange(format!(
                "起始时间 {} 晚于结束时间 {}",
                start, end
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t <= self.end
    }
}

/// 解析 `START,END`，每一端可以是 Unix 秒或 RFC 3339 时间
impl FromStr for TimeRange {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once(',')
            .ok_or_else(|| SyncError::InvalidTimeRange(format!("缺少逗号分隔: {:?}", s)))?;
        TimeRange::new(parse_instant(start)?, parse_instant(end)?)
    }
}

fn parse_instant(s: &str) -> Result<i64> {
    let s = s.trim();
    if let Ok(secs) = s.parse::<i64>() {
        return Ok(secs);
    }
    chrono::DateTime::parse_from_rfc3339(s)
        .map(|t| t.timestamp())
        .map_err(|e| SyncError::InvalidTimeRange(format!("{:?}: {}", s, e)))
}

/// 过滤器的配置面：四组条件，同类 include/exclude 互斥
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilterConfig {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
    #[serde(default)]
    pub include_time: Vec<TimeRange>,
    #[serde(default)]
    pub exclude_time: Vec<TimeRange>,
}

impl FilterConfig {
    /// 把相对于根的模式锚定到某一侧，时间条件原样保留
    ///
    /// 命令行给出的模式对源和目标含义相同，需要分别锚定后再构造过滤器。
    pub fn anchored_to(&self, location: &Location) -> Self {
        let anchor = |patterns: &[String]| -> Vec<String> {
            patterns.iter().map(|p| location.anchor_pattern(p)).collect()
        };
        Self {
            include: anchor(&self.include),
            exclude: anchor(&self.exclude),
            include_time: self.include_time.clone(),
            exclude_time: self.exclude_time.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Polarity {
    Include,
    Exclude,
}

#[derive(Debug, Clone)]
struct CompiledPattern {
    raw: String,
    pattern: Pattern,
    /// 追加了结尾分隔符的版本，用于匹配目录形式的路径
    dir_pattern: Option<Pattern>,
}

/// 构造后不可变的过滤器
#[derive(Debug, Clone)]
pub struct Filter {
    side: Side,
    path_mode: Option<Polarity>,
    patterns: Vec<CompiledPattern>,
    time_mode: Option<Polarity>,
    ranges: Vec<TimeRange>,
}

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: true,
    require_literal_leading_dot: false,
};

impl Filter {
    /// 构造过滤器，同时给出 include 和 exclude 会直接报错
    pub fn new(config: &FilterConfig, side: Side) -> Result<Self> {
        if !config.include.is_empty() && !config.exclude.is_empty() {
            return Err(SyncError::ConflictingFilters {
                kind: FilterKind::Pattern,
            });
        }
        if !config.include_time.is_empty() && !config.exclude_time.is_empty() {
            return Err(SyncError::ConflictingFilters {
                kind: FilterKind::Time,
            });
        }

        let (path_mode, raw_patterns) = if !config.include.is_empty() {
            (Some(Polarity::Include), &config.include)
        } else if !config.exclude.is_empty() {
            (Some(Polarity::Exclude), &config.exclude)
        } else {
            (None, &config.exclude)
        };

        let (time_mode, ranges) = if !config.include_time.is_empty() {
            (Some(Polarity::Include), config.include_time.clone())
        } else if !config.exclude_time.is_empty() {
            (Some(Polarity::Exclude), config.exclude_time.clone())
        } else {
            (None, Vec::new())
        };

        let mut patterns = Vec::with_capacity(raw_patterns.len());
        for raw in raw_patterns {
            patterns.push(compile(raw, side)?);
        }

        Ok(Self {
            side,
            path_mode,
            patterns,
            time_mode,
            ranges,
        })
    }

    /// 按相对于根的配置为某一侧构造过滤器，没有任何条件时返回 `None`
    pub fn for_location(config: &FilterConfig, location: &Location) -> Result<Option<Arc<Self>>> {
        let filter = Self::new(&config.anchored_to(location), location.side())?;
        Ok((!filter.is_empty()).then(|| Arc::new(filter)))
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// 没有任何条件
    pub fn is_empty(&self) -> bool {
        self.path_mode.is_none() && self.time_mode.is_none()
    }

    /// 路径是否应被排除
    pub fn should_exclude_path(&self, path: &str) -> bool {
        let Some(mode) = self.path_mode else {
            return false;
        };
        let matched = self.any_pattern_matches(path);
        match mode {
            Polarity::Include => !matched,
            Polarity::Exclude => matched,
        }
    }

    /// 修改时间是否应被排除
    pub fn should_exclude_time(&self, mtime: i64) -> bool {
        let Some(mode) = self.time_mode else {
            return false;
        };
        let matched = self.ranges.iter().any(|r| r.contains(mtime));
        match mode {
            Polarity::Include => !matched,
            Polarity::Exclude => matched,
        }
    }

    /// 先路径后时间
    pub fn should_exclude(&self, path: &str, mtime: i64) -> bool {
        self.should_exclude_path(path) || self.should_exclude_time(mtime)
    }

    /// 目录剪枝：只应用 exclude 规则，从不应用 include
    ///
    /// 不满足 include 的目录下仍可能有满足 include 的文件，所以遍历时目录只做
    /// 排除判断。
    pub fn should_exclude_dir(&self, dir_path: &str) -> bool {
        if self.path_mode != Some(Polarity::Exclude) {
            return false;
        }
        let sep = self.side.separator();
        if dir_path.ends_with(sep) {
            self.any_pattern_matches(dir_path)
        } else {
            self.any_pattern_matches(&format!("{}{}", dir_path, sep))
        }
    }

    fn any_pattern_matches(&self, path: &str) -> bool {
        let candidate = normalize(path, self.side);
        let is_dir = candidate.ends_with(self.side.separator());
        self.patterns.iter().any(|p| {
            let pattern = match (&p.dir_pattern, is_dir) {
                (Some(dir_pattern), true) => dir_pattern,
                _ => &p.pattern,
            };
            let matched = pattern.matches_with(&candidate, MATCH_OPTIONS);
            if matched {
                trace!("{} 匹配规则 {}", candidate, p.raw);
            }
            matched
        })
    }
}

fn compile(raw: &str, side: Side) -> Result<CompiledPattern> {
    let normalized = normalize(raw, side);
    let invalid = |e: glob::PatternError| SyncError::InvalidPattern {
        pattern: raw.to_string(),
        reason: e.to_string(),
    };
    let pattern = Pattern::new(&normalized).map_err(invalid)?;
    let sep = side.separator();
    let dir_pattern = if normalized.ends_with(sep) {
        None
    } else {
        Some(Pattern::new(&format!("{}{}", normalized, sep)).map_err(invalid)?)
    };
    Ok(CompiledPattern {
        raw: raw.to_string(),
        pattern,
        dir_pattern,
    })
}

/// 规范化为该侧自己的表示
///
/// 远程路径去掉 `s3://bucket/` 这类前缀，只保留对象 key 部分。
fn normalize(path: &str, side: Side) -> String {
    match side {
        Side::Local => path.to_string(),
        Side::Remote => strip_scheme(path).to_string(),
    }
}

fn strip_scheme(path: &str) -> &str {
    let Some(idx) = path.find(":/") else {
        return path;
    };
    let scheme = &path[..idx];
    let is_scheme = !scheme.is_empty()
        && scheme.starts_with(|c: char| c.is_ascii_alphabetic())
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'));
    if !is_scheme {
        return path;
    }
    let rest = path[idx + 1..].trim_start_matches('/');
    // 第一段是 bucket
    match rest.find('/') {
        Some(slash) => &rest[slash + 1..],
        None => "",
    }
}
