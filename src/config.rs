//! 应用配置模块
//!
//! 配置保存在 `config.json` 中，每一节都有默认值，缺失的文件等价于全默认。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::strategy::ChangeDetection;
use crate::error::{Result, SyncError};
use crate::logging::LogConfig;

/// 比较引擎配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    /// 每页列举数量，同时也是列举队列容量
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// 每次拉取的截止时间（秒）
    #[serde(default = "default_list_timeout_secs")]
    pub list_timeout_secs: u64,
    /// 并发数，决定动作流的容量
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub follow_symlinks: bool,
    /// 远程前缀本身是空目录时也输出
    #[serde(default)]
    pub emit_empty_dir: bool,
    #[serde(default)]
    pub check_mode: ChangeDetection,
}

fn default_page_size() -> usize {
    1000
}

fn default_list_timeout_secs() -> u64 {
    300 // 5 分钟
}

fn default_concurrency() -> usize {
    4
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            list_timeout_secs: default_list_timeout_secs(),
            concurrency: default_concurrency(),
            follow_symlinks: false,
            emit_empty_dir: false,
            check_mode: ChangeDetection::default(),
        }
    }
}

impl SyncSettings {
    pub fn list_timeout(&self) -> Duration {
        Duration::from_secs(self.list_timeout_secs)
    }
}

/// S3 连接配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Settings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_key: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub s3: S3Settings,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从文件加载配置，文件不存在时返回默认值
    pub fn load(config_file: &Path) -> Result<Self> {
        if !config_file.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(config_file)?;
        serde_json::from_str(&content)
            .map_err(|e| SyncError::Config(format!("{}: {}", config_file.display(), e)))
    }

    /// 保存配置
    pub fn save(&self, config_file: &Path) -> Result<()> {
        if let Some(parent) = config_file.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(config_file, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}

/// 默认配置文件位置
pub fn default_config_file() -> PathBuf {
    config_dir()
        .map(|p| p.join("synctools"))
        .unwrap_or_else(|| PathBuf::from(".synctools"))
        .join("config.json")
}

fn config_dir() -> Option<PathBuf> {
    if cfg!(target_os = "windows") {
        std::env::var("APPDATA").ok().map(PathBuf::from)
    } else if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME") {
        Some(PathBuf::from(xdg))
    } else {
        std::env::var("HOME")
            .ok()
            .map(|h| PathBuf::from(h).join(".config"))
    }
}
