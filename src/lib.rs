//! 对象存储同步工具的差异计算引擎
//!
//! 源和目标各自产出按 key 升序的记录流，比较器归并两条流并按策略给出复制/删除动作。

pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::core::{
    spawn_lister, ActionStream, ActionSummary, Comparator, Filter, FilterConfig, Location,
    Record, Strategies, SyncAction, SyncArgs, SyncMode,
};
pub use config::AppConfig;
pub use error::{ErrorCode, Result, SyncError};
