//! 备份存储
//!
//! 每棵目录树在 `<root>/.lazymirror/` 下保存被删除或覆盖的文件版本：
//! 备份文件以 hash 命名放在 `files/` 中，索引保存在 `index.json`。

use crate::config::BACKUP_DIR_NAME;
use crate::core::file_state::same_content;
use crate::error::SyncError;
use crate::storage::local::{copy_file_with_attributes, path_exists};
use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const INDEX_VERSION: u32 = 1;
const INDEX_FILE: &str = "index.json";
const FILES_DIR: &str = "files";

/// 单个备份版本
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupRecord {
    pub backup_file: PathBuf,
    pub timestamp: DateTime<Utc>,
}

/// 持久化的备份索引：原始绝对路径 -> 按时间排序的备份列表
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupIndex {
    pub version: u32,
    #[serde(default)]
    pub entries: BTreeMap<PathBuf, Vec<BackupRecord>>,
}

impl Default for BackupIndex {
    fn default() -> Self {
        Self {
            version: INDEX_VERSION,
            entries: BTreeMap::new(),
        }
    }
}

/// 启动时一致性修复结果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    /// 找不到备份文件而被移除的记录
    pub dropped_records: usize,
    /// 没有记录引用而被删除的备份文件
    pub deleted_files: usize,
    /// 索引损坏被移到一旁
    pub index_reset: bool,
}

impl RepairReport {
    pub fn is_clean(&self) -> bool {
        self.dropped_records == 0 && self.deleted_files == 0 && !self.index_reset
    }
}

/// 单棵目录树的备份存储
#[derive(Debug)]
pub struct BackupStore {
    dir: PathBuf,
    files_dir: PathBuf,
    index_path: PathBuf,
    index: BackupIndex,
    seq: u64,
}

impl BackupStore {
    /// 打开（必要时创建）备份目录，加载索引并执行一致性修复
    pub fn open(root: &Path) -> Result<(Self, RepairReport)> {
        let dir = root.join(BACKUP_DIR_NAME);
        let files_dir = dir.join(FILES_DIR);
        fs::create_dir_all(&files_dir)
            .map_err(|e| SyncError::io(&files_dir, e))?;

        let index_path = dir.join(INDEX_FILE);
        let (index, index_reset) = Self::load_index(&index_path)?;

        let mut store = Self {
            dir,
            files_dir,
            index_path,
            index,
            seq: 0,
        };
        let mut report = store.repair()?;
        report.index_reset = index_reset;

        if report.is_clean() {
            debug!("备份存储已加载: {}", store.dir.display());
        } else {
            warn!(
                "备份存储已修复 {}: 移除 {} 条记录, 删除 {} 个孤立文件",
                store.dir.display(),
                report.dropped_records,
                report.deleted_files
            );
        }
        Ok((store, report))
    }

    fn load_index(index_path: &Path) -> Result<(BackupIndex, bool)> {
        let content = match fs::read_to_string(index_path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok((BackupIndex::default(), false))
            }
            Err(e) => return Err(SyncError::io(index_path, e).into()),
        };

        let value = match serde_json::from_str::<serde_json::Value>(&content) {
            Ok(value) => value,
            Err(e) => return Self::set_aside(index_path, e),
        };

        if let Some(found) = value.get("version").and_then(|v| v.as_u64()) {
            if found != INDEX_VERSION as u64 {
                return Err(SyncError::UnsupportedIndexVersion {
                    found: found as u32,
                }
                .into());
            }
        }

        match serde_json::from_value::<BackupIndex>(value) {
            Ok(index) => Ok((index, false)),
            Err(e) => Self::set_aside(index_path, e),
        }
    }

    /// 损坏的索引移到 `index.json.corrupt`，以空索引继续
    fn set_aside(index_path: &Path, cause: serde_json::Error) -> Result<(BackupIndex, bool)> {
        let corrupt = index_path.with_extension("json.corrupt");
        warn!(
            "备份索引损坏，已移至 {}: {}",
            corrupt.display(),
            SyncError::BackupIndex {
                path: index_path.to_path_buf(),
                source: cause,
            }
        );
        fs::rename(index_path, &corrupt).map_err(|e| SyncError::io(index_path, e))?;
        Ok((BackupIndex::default(), true))
    }

    /// 让索引和备份目录的实际内容重新一致
    pub fn repair(&mut self) -> Result<RepairReport> {
        let mut report = RepairReport::default();
        let mut referenced = HashSet::new();

        for records in self.index.entries.values_mut() {
            let before = records.len();
            records.retain(|r| r.backup_file.is_file() && referenced.insert(r.backup_file.clone()));
            report.dropped_records += before - records.len();
        }
        self.index.entries.retain(|_, records| !records.is_empty());

        let entries = fs::read_dir(&self.files_dir)
            .with_context(|| format!("读取备份目录失败: {}", self.files_dir.display()))?;
        for entry in entries.flatten() {
            let path = entry.path();
            if referenced.contains(&path) {
                continue;
            }
            debug!("删除孤立备份文件: {}", path.display());
            let removed = if path.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            };
            match removed {
                Ok(()) => report.deleted_files += 1,
                Err(e) => warn!("删除孤立备份文件失败 {}: {}", path.display(), e),
            }
        }

        if report.dropped_records > 0 || report.deleted_files > 0 {
            self.persist()?;
        }
        Ok(report)
    }

    /// 将文件移入备份存储并同步写入索引
    pub fn backup(&mut self, original: &Path) -> Result<BackupRecord> {
        let timestamp = Utc::now();
        self.seq += 1;

        let mut hasher = blake3::Hasher::new();
        hasher.update(original.as_os_str().as_encoded_bytes());
        hasher.update(timestamp.to_rfc3339().as_bytes());
        hasher.update(&self.seq.to_le_bytes());
        let backup_file = self.files_dir.join(hasher.finalize().to_hex().as_str());

        if let Err(e) = fs::rename(original, &backup_file) {
            // 跨文件系统时退回到复制后删除
            debug!("重命名失败，改为复制 {}: {}", original.display(), e);
            copy_file_with_attributes(original, &backup_file)?;
            fs::remove_file(original).map_err(|e| SyncError::io(original, e))?;
        }

        let record = BackupRecord {
            backup_file,
            timestamp,
        };
        self.index
            .entries
            .entry(original.to_path_buf())
            .or_default()
            .push(record.clone());
        self.persist()?;

        info!(
            "已备份 {} -> {}",
            original.display(),
            record.backup_file.display()
        );
        Ok(record)
    }

    pub fn records(&self, original: &Path) -> &[BackupRecord] {
        self.index
            .entries
            .get(original)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn newest(&self, original: &Path) -> Option<&BackupRecord> {
        self.records(original).last()
    }

    /// 如果最新备份与当前文件内容相同，删除该备份
    pub fn prune_if_redundant(&mut self, original: &Path, current: &Path) -> Result<bool> {
        let Some(newest) = self.newest(original) else {
            return Ok(false);
        };
        if !same_content(&newest.backup_file, current)? {
            return Ok(false);
        }

        let backup_file = newest.backup_file.clone();
        fs::remove_file(&backup_file).map_err(|e| SyncError::io(&backup_file, e))?;
        if let Some(records) = self.index.entries.get_mut(original) {
            records.pop();
            if records.is_empty() {
                self.index.entries.remove(original);
            }
        }
        self.persist()?;

        debug!("删除冗余备份: {} ({})", original.display(), backup_file.display());
        Ok(true)
    }

    /// 将第 `version` 个版本（0 为最新）复制回原位置，原位置已有的文件先备份
    pub fn restore(&mut self, original: &Path, version: usize) -> Result<PathBuf> {
        let records = self.records(original);
        if version >= records.len() {
            bail!(
                "{} 没有第 {} 个备份版本（共 {} 个）",
                original.display(),
                version,
                records.len()
            );
        }
        let source = records[records.len() - 1 - version].backup_file.clone();

        if path_exists(original) {
            let meta = fs::symlink_metadata(original).map_err(|e| SyncError::io(original, e))?;
            if meta.is_dir() {
                bail!("恢复目标是目录: {}", original.display());
            } else if meta.file_type().is_symlink() {
                fs::remove_file(original).map_err(|e| SyncError::io(original, e))?;
            } else {
                self.backup(original)?;
            }
        }

        copy_file_with_attributes(&source, original)?;
        info!("已恢复 {} (版本 {})", original.display(), version);
        Ok(original.to_path_buf())
    }

    /// 全部索引条目
    pub fn entries(&self) -> impl Iterator<Item = (&Path, &[BackupRecord])> {
        self.index
            .entries
            .iter()
            .map(|(path, records)| (path.as_path(), records.as_slice()))
    }

    /// 先写临时文件再重命名
    fn persist(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.index).map_err(|e| SyncError::BackupIndex {
            path: self.index_path.clone(),
            source: e,
        })?;
        let temp_path = self.index_path.with_extension("json.tmp");
        fs::write(&temp_path, data).map_err(|e| SyncError::io(&temp_path, e))?;
        fs::rename(&temp_path, &self.index_path).map_err(|e| SyncError::io(&self.index_path, e))?;
        Ok(())
    }
}
