//! 文件状态管理 - 记录每个路径最后一次确认一致时两侧的元数据

use crate::core::comparator::Metadata;
use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 已跟踪文件：最后一次一致（或有意链接）时的远程/本地快照
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackedFile {
    pub remote: Metadata,
    pub local: Metadata,
}

/// 文件状态表，只存在于内存中
///
/// 不存在的条目表示"未知"，下一次扫描会重新分类。
#[derive(Debug, Default)]
pub struct TrackedFiles {
    entries: BTreeMap<PathBuf, TrackedFile>,
}

impl TrackedFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, relative: &Path) -> Option<&TrackedFile> {
        self.entries.get(relative)
    }

    pub fn contains(&self, relative: &Path) -> bool {
        self.entries.contains_key(relative)
    }

    pub fn record(&mut self, relative: &Path, remote: Metadata, local: Metadata) {
        self.entries
            .insert(relative.to_path_buf(), TrackedFile { remote, local });
    }

    pub fn forget(&mut self, relative: &Path) -> Option<TrackedFile> {
        self.entries.remove(relative)
    }

    /// 删除路径本身及其所有子路径的记录，返回删除数量
    pub fn forget_subtree(&mut self, relative: &Path) -> usize {
        let before = self.entries.len();
        self.entries.retain(|path, _| !path.starts_with(relative));
        let removed = before - self.entries.len();
        if removed > 1 {
            debug!("清理了 {} 个子路径的状态记录: {}", removed, relative.display());
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// 计算文件内容的 hash（BLAKE3，流式读取）
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("打开文件失败: {}", path.display()))?;
    let mut hasher = blake3::Hasher::new();
    io::copy(&mut BufReader::new(file), &mut hasher)
        .with_context(|| format!("读取文件失败: {}", path.display()))?;
    Ok(hasher.finalize().to_hex().to_string())
}

/// 两个文件内容是否完全相同
pub fn same_content(a: &Path, b: &Path) -> Result<bool> {
    let (len_a, len_b) = (a.metadata()?.len(), b.metadata()?.len());
    if len_a != len_b {
        return Ok(false);
    }
    Ok(hash_file(a)? == hash_file(b)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn meta(size: u64) -> Metadata {
        Metadata {
            is_dir: false,
            is_file: true,
            is_symlink: false,
            mtime: 1.0,
            atime: 1.0,
            size,
        }
    }

    #[test]
    fn test_forget_subtree() {
        let mut tracked = TrackedFiles::new();
        tracked.record(Path::new("d"), meta(0), meta(0));
        tracked.record(Path::new("d/a"), meta(1), meta(1));
        tracked.record(Path::new("d/b/c"), meta(2), meta(2));
        tracked.record(Path::new("dd"), meta(3), meta(3));

        assert_eq!(tracked.forget_subtree(Path::new("d")), 3);
        assert_eq!(tracked.len(), 1);
        assert!(tracked.contains(Path::new("dd")));
    }

    #[test]
    fn test_same_content() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a");
        let b = dir.path().join("b");
        let c = dir.path().join("c");
        fs::write(&a, b"same bytes").unwrap();
        fs::write(&b, b"same bytes").unwrap();
        fs::write(&c, b"other byte").unwrap();

        assert!(same_content(&a, &b).unwrap());
        assert!(!same_content(&a, &c).unwrap());
        assert_eq!(hash_file(&a).unwrap().len(), 64);
    }
}
