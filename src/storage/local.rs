//! 本地文件系统操作
//!
//! 所有函数都不跟随符号链接，除非显式说明。

use anyhow::{Context, Result};
use std::fs::{self, FileTimes, OpenOptions};
use std::io;
use std::path::{Component, Path, PathBuf};

/// 路径或符号链接（包括失效链接）是否存在
pub fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

/// 纯词法的路径规范化：去掉 `.`，折叠 `..`，不访问文件系统
pub fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// 读取符号链接目标并转换为绝对路径（链接失效时同样可用）
pub fn link_target_abs(link: &Path) -> io::Result<PathBuf> {
    let target = fs::read_link(link)?;
    let joined = if target.is_absolute() {
        target
    } else {
        link.parent().unwrap_or_else(|| Path::new("/")).join(target)
    };
    Ok(lexical_normalize(&joined))
}

/// 计算从 `from_dir` 指向 `to` 的相对路径，两者都应为规范化后的绝对路径
pub fn relative_path(from_dir: &Path, to: &Path) -> PathBuf {
    let from: Vec<_> = from_dir.components().collect();
    let to_parts: Vec<_> = to.components().collect();
    let common = from
        .iter()
        .zip(to_parts.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let mut out = PathBuf::new();
    for _ in common..from.len() {
        out.push("..");
    }
    for part in &to_parts[common..] {
        out.push(part.as_os_str());
    }
    if out.as_os_str().is_empty() {
        out.push(".");
    }
    out
}

/// 复制文件内容、权限和时间戳，必要时创建父目录
pub fn copy_file_with_attributes(from: &Path, to: &Path) -> Result<u64> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("创建目录失败: {}", parent.display()))?;
    }

    let bytes = fs::copy(from, to)
        .with_context(|| format!("复制失败: {} -> {}", from.display(), to.display()))?;
    copy_times(from, to)?;
    Ok(bytes)
}

/// 复制目录的权限和时间戳（尽力而为）
pub fn copy_dir_attributes(from: &Path, to: &Path) -> Result<()> {
    let metadata =
        fs::metadata(from).with_context(|| format!("读取目录元数据失败: {}", from.display()))?;
    fs::set_permissions(to, metadata.permissions())
        .with_context(|| format!("设置目录权限失败: {}", to.display()))?;
    // 部分平台无法以只读方式打开目录设置时间
    if let Err(e) = copy_times(from, to) {
        tracing::debug!("目录时间戳未复制 {}: {:#}", to.display(), e);
    }
    Ok(())
}

fn copy_times(from: &Path, to: &Path) -> Result<()> {
    let metadata = fs::metadata(from)?;
    let mut times = FileTimes::new().set_modified(metadata.modified()?);
    if let Ok(accessed) = metadata.accessed() {
        times = times.set_accessed(accessed);
    }

    // 只读文件在 Unix 上用只读句柄即可设置时间；Windows 需要写权限
    let file = match fs::File::open(to) {
        Ok(file) if metadata.is_dir() || cfg!(unix) => file,
        _ => OpenOptions::new().write(true).open(to)?,
    };
    file.set_times(times)
        .with_context(|| format!("设置时间戳失败: {}", to.display()))?;
    Ok(())
}

/// 创建符号链接 `link` -> `target`
pub fn create_symlink(target: &Path, link: &Path) -> io::Result<()> {
    if let Some(parent) = link.parent() {
        fs::create_dir_all(parent)?;
    }

    #[cfg(unix)]
    {
        std::os::unix::fs::symlink(target, link)
    }

    #[cfg(windows)]
    {
        let resolved = link.parent().map(|p| p.join(target)).unwrap_or_else(|| target.to_path_buf());
        if resolved.is_dir() {
            std::os::windows::fs::symlink_dir(target, link)
        } else {
            std::os::windows::fs::symlink_file(target, link)
        }
    }
}
