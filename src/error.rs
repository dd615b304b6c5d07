//! 错误类型
//!
//! 引擎内部以 `anyhow::Result` 传递错误，需要调用方区分处理的情况使用 `SyncError`。

use std::path::PathBuf;
use thiserror::Error;

/// 可识别的同步错误
#[derive(Debug, Error)]
pub enum SyncError {
    /// 同步根目录（或其备份目录）尚未挂载/不存在
    #[error("目录不可用: {}", path.display())]
    RootUnavailable { path: PathBuf },

    /// 收到中断信号
    #[error("操作已取消")]
    Cancelled,

    /// 命令行参数或配置错误
    #[error("配置无效: {0}")]
    InvalidConfig(String),

    #[error("备份索引读写失败 {}: {source}", path.display())]
    BackupIndex {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("不支持的备份索引版本: {found}")]
    UnsupportedIndexVersion { found: u32 },

    #[error("路径不在同步目录内: {}", .0.display())]
    OutsideRoots(PathBuf),

    #[error("文件操作失败 {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SyncError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        SyncError::Io {
            path: path.into(),
            source,
        }
    }

    /// 用户错误在创建任何引擎状态之前就应失败
    pub fn is_user_error(&self) -> bool {
        matches!(self, SyncError::InvalidConfig(_) | SyncError::OutsideRoots(_))
    }
}
