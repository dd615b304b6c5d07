use crate::config::IgnoreRules;
use crate::error::SyncError;
use anyhow::Result;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

/// 目录树列表，路径均相对于根目录
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TreeListing {
    pub folders: BTreeSet<PathBuf>,
    pub files: BTreeSet<PathBuf>,
}

impl TreeListing {
    pub fn len(&self) -> usize {
        self.folders.len() + self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folders.is_empty() && self.files.is_empty()
    }
}

/// 文件扫描器
pub struct FileScanner<'a> {
    ignore: &'a IgnoreRules,
    cancel: Option<CancellationToken>,
}

impl<'a> FileScanner<'a> {
    pub fn new(ignore: &'a IgnoreRules) -> Self {
        Self {
            ignore,
            cancel: None,
        }
    }

    /// 创建带取消令牌的扫描器
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.as_ref().is_some_and(|t| t.is_cancelled())
    }

    /// 递归遍历根目录，符号链接（包括指向目录的）计为文件
    pub fn walk(&self, root: &Path) -> Result<TreeListing> {
        debug!("开始扫描目录: {}", root.display());

        let mut listing = TreeListing::default();
        let mut seen = 0usize;
        let mut skipped = 0usize;

        let walker = WalkDir::new(root)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|entry| match entry.path().strip_prefix(root) {
                Ok(relative) => !self.ignore.is_ignored(relative),
                Err(_) => false,
            });

        for entry in walker {
            seen += 1;
            // 每处理一定数量检查一次取消状态
            if seen % 1000 == 0 && self.is_cancelled() {
                return Err(SyncError::Cancelled.into());
            }

            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    debug!("跳过无法读取的条目: {}", e);
                    skipped += 1;
                    continue;
                }
            };

            let Ok(relative) = entry.path().strip_prefix(root) else {
                continue;
            };
            let relative = relative.to_path_buf();

            if entry.file_type().is_dir() {
                listing.folders.insert(relative);
            } else {
                listing.files.insert(relative);
            }
        }

        if skipped > 0 {
            info!("扫描 {} 完成，跳过 {} 个无法读取的条目", root.display(), skipped);
        }
        debug!(
            "扫描完成: {} 个目录, {} 个文件",
            listing.folders.len(),
            listing.files.len()
        );
        Ok(listing)
    }
}

/// 扫描整棵目录树
pub fn walk(root: &Path, ignore: &IgnoreRules) -> Result<TreeListing> {
    FileScanner::new(ignore).walk(root)
}
