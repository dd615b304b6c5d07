use super::{resolve_root, resolve_under};
use crate::core::{BackupRecord, BackupStore};
use crate::error::SyncError;
use anyhow::Result;
use std::path::{Path, PathBuf};

/// 某个原始路径的全部备份，版本号 0 为最新
#[derive(Debug, Clone)]
pub struct BackupListing {
    pub original: PathBuf,
    pub versions: Vec<BackupRecord>,
}

fn open_store(root: &Path) -> Result<(PathBuf, BackupStore)> {
    let root = resolve_root(root)?;
    if !root.is_dir() {
        return Err(SyncError::RootUnavailable { path: root }.into());
    }
    let (store, _) = BackupStore::open(&root)?;
    Ok((root, store))
}

/// 列出备份记录；指定 `path` 时只列出该路径
pub fn list(root: &Path, path: Option<&Path>) -> Result<Vec<BackupListing>> {
    let (root, store) = open_store(root)?;
    let filter = path.map(|p| resolve_under(&root, p)).transpose()?;

    Ok(store
        .entries()
        .filter(|(original, _)| filter.as_ref().map_or(true, |f| f.as_path() == *original))
        .map(|(original, records)| BackupListing {
            original: original.to_path_buf(),
            versions: records.iter().rev().cloned().collect(),
        })
        .collect())
}

/// 打印备份列表
pub fn print_listing(listings: &[BackupListing]) {
    if listings.is_empty() {
        println!("没有备份记录");
        return;
    }
    for listing in listings {
        println!("{}", listing.original.display());
        for (version, record) in listing.versions.iter().enumerate() {
            println!(
                "  [{}] {}  {}",
                version,
                record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
                record.backup_file.display()
            );
        }
    }
}

/// 将 `relative` 的第 `version` 个备份（0 为最新）恢复到原位置
pub fn restore(root: &Path, relative: &Path, version: usize) -> Result<PathBuf> {
    let (root, mut store) = open_store(root)?;
    let original = resolve_under(&root, relative)?;
    store.restore(&original, version)
}
