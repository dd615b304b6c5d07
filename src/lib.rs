pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;
pub mod watch;

pub use config::{IgnoreRules, SyncConfig, TuningConfig};
pub use core::{EngineStats, SyncAction, SyncEngine};
pub use error::SyncError;
pub use storage::Side;

use std::path::{Path, PathBuf};

const APP_NAME: &str = "lazymirror";

/// 应用配置目录，`override_dir` 优先；找不到系统目录时使用当前目录下的 `.lazymirror-config`
pub fn app_config_dir(override_dir: Option<&Path>) -> PathBuf {
    if let Some(dir) = override_dir {
        return dir.to_path_buf();
    }
    dirs::config_dir()
        .map(|p| p.join(APP_NAME))
        .unwrap_or_else(|| PathBuf::from(".lazymirror-config"))
}

// 系统目录查找，不引入额外依赖
pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux: 优先 XDG_CONFIG_HOME
            std::env::var("XDG_CONFIG_HOME")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from)
                .or_else(|| {
                    std::env::var("HOME")
                        .ok()
                        .map(|h| PathBuf::from(h).join(".config"))
                })
        }
    }
}
