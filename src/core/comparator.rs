use crate::core::scanner::TreeListing;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

/// 单个路径的元数据快照（不跟随符号链接）
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    pub is_dir: bool,
    pub is_file: bool,
    pub is_symlink: bool,
    /// 修改时间（Unix 秒，含小数）
    pub mtime: f64,
    pub atime: f64,
    pub size: u64,
}

fn unix_seconds(time: io::Result<SystemTime>) -> f64 {
    time.ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

impl From<&fs::Metadata> for Metadata {
    fn from(m: &fs::Metadata) -> Self {
        let file_type = m.file_type();
        Self {
            is_dir: file_type.is_dir(),
            is_file: file_type.is_file(),
            is_symlink: file_type.is_symlink(),
            mtime: unix_seconds(m.modified()),
            atime: unix_seconds(m.accessed()),
            size: m.len(),
        }
    }
}

/// 读取路径快照，路径不存在时返回 None
pub fn snapshot(path: &Path) -> io::Result<Option<Metadata>> {
    match fs::symlink_metadata(path) {
        Ok(m) => Ok(Some(Metadata::from(&m))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// 判断两个快照是否相同
///
/// 类型必须一致；目录和符号链接只比较类型，普通文件比较取整后的修改时间和大小。
/// 访问时间始终不参与比较。
pub fn metadata_equal(a: &Metadata, b: &Metadata) -> bool {
    if a.is_dir != b.is_dir || a.is_file != b.is_file || a.is_symlink != b.is_symlink {
        return false;
    }
    if a.is_dir || a.is_symlink {
        return true;
    }
    a.mtime.floor() == b.mtime.floor() && a.size == b.size
}

/// 两棵目录树的划分结果
#[derive(Debug, Clone, Default)]
pub struct TreeDiff {
    pub folders_both: BTreeSet<PathBuf>,
    pub folders_remote_only: BTreeSet<PathBuf>,
    pub folders_local_only: BTreeSet<PathBuf>,
    pub files_both: BTreeSet<PathBuf>,
    pub files_remote_only: BTreeSet<PathBuf>,
    pub files_local_only: BTreeSet<PathBuf>,
}

impl TreeDiff {
    /// 将远程和本地列表划分为六个集合
    pub fn partition(remote: &TreeListing, local: &TreeListing) -> Self {
        Self {
            folders_both: remote.folders.intersection(&local.folders).cloned().collect(),
            folders_remote_only: remote.folders.difference(&local.folders).cloned().collect(),
            folders_local_only: local.folders.difference(&remote.folders).cloned().collect(),
            files_both: remote.files.intersection(&local.files).cloned().collect(),
            files_remote_only: remote.files.difference(&local.files).cloned().collect(),
            files_local_only: local.files.difference(&remote.files).cloned().collect(),
        }
    }

    /// 两侧都存在的路径（目录在前）
    pub fn both(&self) -> impl Iterator<Item = &PathBuf> {
        self.folders_both.iter().chain(self.files_both.iter())
    }

    pub fn summary(&self) -> DiffSummary {
        DiffSummary {
            folders_both: self.folders_both.len(),
            folders_remote_only: self.folders_remote_only.len(),
            folders_local_only: self.folders_local_only.len(),
            files_both: self.files_both.len(),
            files_remote_only: self.files_remote_only.len(),
            files_local_only: self.files_local_only.len(),
        }
    }
}

/// 划分统计
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiffSummary {
    pub folders_both: usize,
    pub folders_remote_only: usize,
    pub folders_local_only: usize,
    pub files_both: usize,
    pub files_remote_only: usize,
    pub files_local_only: usize,
}

impl DiffSummary {
    pub fn one_sided(&self) -> usize {
        self.folders_remote_only
            + self.folders_local_only
            + self.files_remote_only
            + self.files_local_only
    }

    pub fn total(&self) -> usize {
        self.folders_both + self.files_both + self.one_sided()
    }
}
