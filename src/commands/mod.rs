//! 命令行子命令的实现，`main` 只负责解析参数和设置日志

pub mod backup;
pub mod sync;

use crate::error::SyncError;
use crate::storage::local::lexical_normalize;
use std::path::{Path, PathBuf};

/// 将命令行给出的目录转换为规范化的绝对路径（目录可以尚不存在）
pub fn resolve_root(path: &Path) -> Result<PathBuf, SyncError> {
    if path.as_os_str().is_empty() {
        return Err(SyncError::InvalidConfig("目录不能为空".into()));
    }
    let absolute = std::path::absolute(path).map_err(|e| SyncError::io(path, e))?;
    Ok(lexical_normalize(&absolute))
}

/// 将相对路径（或根目录下的绝对路径）解析到根目录下，越出根目录时报错
pub fn resolve_under(root: &Path, path: &Path) -> Result<PathBuf, SyncError> {
    let joined = lexical_normalize(&root.join(path));
    if joined == root || !joined.starts_with(root) {
        return Err(SyncError::OutsideRoots(joined));
    }
    Ok(joined)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_root() {
        let resolved = resolve_root(Path::new("a/./b/../c")).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("a/c"));
        assert!(resolve_root(Path::new("")).is_err());
    }

    #[test]
    fn test_resolve_under() {
        let root = Path::new("/data/remote");
        assert_eq!(
            resolve_under(root, Path::new("x/y.txt")).unwrap(),
            PathBuf::from("/data/remote/x/y.txt")
        );
        assert_eq!(
            resolve_under(root, Path::new("/data/remote/z")).unwrap(),
            PathBuf::from("/data/remote/z")
        );
        assert!(matches!(
            resolve_under(root, Path::new("../local/x")),
            Err(SyncError::OutsideRoots(_))
        ));
        assert!(resolve_under(root, Path::new(".")).is_err());
    }
}
