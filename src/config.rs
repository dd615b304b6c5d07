//! 应用配置模块

use crate::error::SyncError;
use crate::storage::Side;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 每棵目录树内的隐藏备份目录名，始终被忽略
pub const BACKUP_DIR_NAME: &str = ".lazymirror";

/// 读取 `config.json` 中的某个配置段，缺失或损坏时返回 None
pub(crate) fn load_section<T: for<'de> Deserialize<'de>>(config_dir: &Path, key: &str) -> Option<T> {
    let content = fs::read_to_string(config_dir.join("config.json")).ok()?;
    let config = serde_json::from_str::<serde_json::Value>(&content).ok()?;
    serde_json::from_value::<T>(config.get(key)?.clone()).ok()
}

/// 调优参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TuningConfig {
    /// 一次访问事件大约对应的读取量（字节）
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    /// 读取量超过文件大小的该比例时下载
    #[serde(default = "default_threshold_fraction")]
    pub threshold_fraction: f64,
    /// 访问计数每秒衰减比例
    #[serde(default = "default_decay_per_second")]
    pub decay_per_second: f64,
    /// 两次全量扫描的最小间隔（毫秒）
    #[serde(default = "default_min_scan_interval_ms")]
    pub min_scan_interval_ms: u64,
    /// 空闲时单次休眠上限（毫秒）
    #[serde(default = "default_idle_sleep_ms")]
    pub idle_sleep_ms: u64,
    /// 打开文件扫描器的轮询间隔（毫秒）
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// 等待目录挂载时的最大退避（毫秒）
    #[serde(default = "default_startup_backoff_max_ms")]
    pub startup_backoff_max_ms: u64,
}

fn default_chunk_size() -> u64 {
    160_000
}

fn default_threshold_fraction() -> f64 {
    0.45
}

fn default_decay_per_second() -> f64 {
    0.1
}

fn default_min_scan_interval_ms() -> u64 {
    1900
}

fn default_idle_sleep_ms() -> u64 {
    1900
}

fn default_poll_interval_ms() -> u64 {
    700
}

fn default_startup_backoff_max_ms() -> u64 {
    30_000
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            threshold_fraction: default_threshold_fraction(),
            decay_per_second: default_decay_per_second(),
            min_scan_interval_ms: default_min_scan_interval_ms(),
            idle_sleep_ms: default_idle_sleep_ms(),
            poll_interval_ms: default_poll_interval_ms(),
            startup_backoff_max_ms: default_startup_backoff_max_ms(),
        }
    }
}

impl TuningConfig {
    /// 从配置文件加载调优参数
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "tuning").unwrap_or_default()
    }

    pub fn min_scan_interval(&self) -> Duration {
        Duration::from_millis(self.min_scan_interval_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.idle_sleep_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn startup_backoff_max(&self) -> Duration {
        Duration::from_millis(self.startup_backoff_max_ms)
    }

    fn validate(&self) -> Result<(), SyncError> {
        if self.chunk_size == 0 {
            return Err(SyncError::InvalidConfig("chunkSize 必须大于 0".into()));
        }
        if !(self.threshold_fraction > 0.0 && self.threshold_fraction <= 1.0) {
            return Err(SyncError::InvalidConfig(format!(
                "thresholdFraction 必须在 (0, 1] 内: {}",
                self.threshold_fraction
            )));
        }
        if self.decay_per_second <= 0.0 {
            return Err(SyncError::InvalidConfig("decayPerSecond 必须大于 0".into()));
        }
        if self.min_scan_interval_ms == 0 || self.idle_sleep_ms == 0 {
            return Err(SyncError::InvalidConfig(
                "minScanIntervalMs 和 idleSleepMs 必须大于 0".into(),
            ));
        }
        if self.poll_interval_ms == 0 || self.startup_backoff_max_ms == 0 {
            return Err(SyncError::InvalidConfig("轮询间隔和退避上限必须大于 0".into()));
        }
        Ok(())
    }
}

/// 忽略规则：相对路径前缀，或含 `*` 的 glob 模式
#[derive(Debug, Clone)]
pub struct IgnoreRules {
    prefixes: Vec<PathBuf>,
    patterns: Vec<(String, Regex)>,
}

impl Default for IgnoreRules {
    fn default() -> Self {
        Self {
            prefixes: vec![PathBuf::from(BACKUP_DIR_NAME)],
            patterns: Vec::new(),
        }
    }
}

impl IgnoreRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// 添加一条规则
    pub fn add(&mut self, rule: &str) -> Result<(), SyncError> {
        let rule = rule.trim().trim_start_matches("./").trim_matches('/');
        if rule.is_empty() {
            return Err(SyncError::InvalidConfig("忽略规则不能为空".into()));
        }

        if rule.contains('*') || rule.contains('?') {
            let re = Regex::new(&glob_to_regex(rule))
                .map_err(|e| SyncError::InvalidConfig(format!("无效的忽略模式 {}: {}", rule, e)))?;
            self.patterns.push((rule.to_string(), re));
        } else {
            self.prefixes.push(PathBuf::from(rule));
        }
        Ok(())
    }

    /// 相对路径（或其任一上级目录）是否被忽略
    pub fn is_ignored(&self, relative: &Path) -> bool {
        if relative.as_os_str().is_empty() {
            return false;
        }
        if self.prefixes.iter().any(|p| relative.starts_with(p)) {
            return true;
        }
        if self.patterns.is_empty() {
            return false;
        }

        relative
            .ancestors()
            .filter(|a| !a.as_os_str().is_empty())
            .any(|a| {
                let normalized = a.to_string_lossy().replace('\\', "/");
                self.patterns.iter().any(|(_, re)| re.is_match(&normalized))
            })
    }

    pub fn rules(&self) -> Vec<String> {
        self.prefixes
            .iter()
            .map(|p| p.display().to_string())
            .chain(self.patterns.iter().map(|(raw, _)| raw.clone()))
            .collect()
    }
}

/// glob 转正则：`**` 跨目录，`*`/`?` 不跨目录，可匹配路径末尾的任意层级
fn glob_to_regex(pattern: &str) -> String {
    let mut out = String::from("^(?:.*/)?");
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '*' if chars.peek() == Some(&'*') => {
                chars.next();
                out.push_str(".*");
            }
            '*' => out.push_str("[^/]*"),
            '?' => out.push_str("[^/]"),
            other => out.push_str(&regex::escape(&other.to_string())),
        }
    }
    out.push('$');
    out
}

/// 同步配置，进程生命周期内只读
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub remote: PathBuf,
    pub local: PathBuf,
    /// 懒加载模式：本地先用符号链接占位
    pub lazy: bool,
    pub dry_run: bool,
    pub ignore: IgnoreRules,
    pub tuning: TuningConfig,
}

impl SyncConfig {
    pub fn new(remote: impl Into<PathBuf>, local: impl Into<PathBuf>) -> Self {
        Self {
            remote: remote.into(),
            local: local.into(),
            lazy: true,
            dry_run: false,
            ignore: IgnoreRules::default(),
            tuning: TuningConfig::default(),
        }
    }

    pub fn with_lazy(mut self, lazy: bool) -> Self {
        self.lazy = lazy;
        self
    }

    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    pub fn with_ignore(mut self, ignore: IgnoreRules) -> Self {
        self.ignore = ignore;
        self
    }

    pub fn with_tuning(mut self, tuning: TuningConfig) -> Self {
        self.tuning = tuning;
        self
    }

    pub fn root(&self, side: Side) -> &Path {
        match side {
            Side::Remote => &self.remote,
            Side::Local => &self.local,
        }
    }

    /// 校验配置
    pub fn validate(&self) -> Result<(), SyncError> {
        if !self.remote.is_absolute() || !self.local.is_absolute() {
            return Err(SyncError::InvalidConfig("同步目录必须是绝对路径".into()));
        }
        if self.remote == self.local {
            return Err(SyncError::InvalidConfig(format!(
                "远程和本地目录相同: {}",
                self.remote.display()
            )));
        }
        if self.remote.starts_with(&self.local) || self.local.starts_with(&self.remote) {
            return Err(SyncError::InvalidConfig(format!(
                "远程和本地目录不能互相嵌套: {} / {}",
                self.remote.display(),
                self.local.display()
            )));
        }
        self.tuning.validate()
    }
}
