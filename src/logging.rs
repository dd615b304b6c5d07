//! 日志模块 - 控制台日志、带大小限制的文件日志

use crate::config::load_section;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

const LOG_FILE: &str = "lazymirror.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写入日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 从配置文件加载日志配置
    pub fn load(config_dir: &Path) -> Self {
        load_section(config_dir, "log").unwrap_or_default()
    }

    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 带大小限制的日志写入器，超过限制时轮转为 `.log.old`
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    written: u64,
    writer: BufWriter<File>,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        Self::with_limit(log_dir, (max_size_mb as u64) * 1024 * 1024)
    }

    pub fn with_limit(log_dir: &Path, max_size: u64) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;
        let file_path = log_dir.join(LOG_FILE);

        // 检查现有文件大小，如果超过限制则轮转
        let existing = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);
        if existing > max_size {
            Self::rotate_log(&file_path)?;
        }
        let written = fs::metadata(&file_path).map(|m| m.len()).unwrap_or(0);

        Ok(Self {
            writer: Self::open_file(&file_path)?,
            file_path,
            max_size,
            written,
        })
    }

    fn open_file(file_path: &Path) -> io::Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        Ok(BufWriter::new(file))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.written > 0 && self.written + buf.len() as u64 > self.max_size {
            self.writer.flush()?;
            Self::rotate_log(&self.file_path)?;
            self.writer = Self::open_file(&self.file_path)?;
            self.written = 0;
        }

        let n = self.writer.write(buf)?;
        self.written += n as u64;
        self.writer.flush()?;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 日志目录
pub fn get_log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

/// 初始化日志系统：控制台输出到 stderr，启用时同时写入日志文件
///
/// 返回的 guard 必须在整个进程生命周期内持有，否则文件日志会丢失。
pub fn init_logging(config_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let config = LogConfig::load(config_dir);
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };

    // RUST_LOG 优先于配置的级别
    let mut env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::from_level(level).into())
        .from_env_lossy();
    if let Ok(directive) = "notify=warn".parse() {
        env_filter = env_filter.add_directive(directive);
    }

    let console_layer = tracing_subscriber::fmt::layer()
        .with_writer(io::stderr)
        .with_target(false);

    let mut guard = None;
    let file_layer = if config.enabled {
        match SizeRotatingWriter::new(&get_log_dir(config_dir), config.max_size_mb) {
            Ok(writer) => {
                let (non_blocking, worker_guard) = tracing_appender::non_blocking(writer);
                guard = Some(worker_guard);
                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(non_blocking)
                        .with_ansi(false)
                        .with_target(false)
                        .with_thread_ids(false)
                        .with_thread_names(false),
                )
            }
            Err(e) => {
                // 文件日志创建失败，回退到控制台
                eprintln!("无法创建日志文件，仅输出到控制台: {}", e);
                None
            }
        }
    } else {
        None
    };

    let _ = tracing_subscriber::registry()
        .with(env_filter)
        .with(console_layer)
        .with(file_layer)
        .try_init();

    guard
}
