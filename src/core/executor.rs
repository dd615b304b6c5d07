//! 动作执行器
//!
//! 每个动作在对侧缺失时都是幂等的：重复或多余的事件只会被跳过。
//! 被删除或覆盖的普通文件交给所在一侧的备份存储。

use crate::config::SyncConfig;
use crate::core::backup::BackupStore;
use crate::core::comparator::{metadata_equal, snapshot};
use crate::core::file_state::TrackedFiles;
use crate::core::materialize::AccessTracker;
use crate::core::queue::{ChangeEvent, ChangeKind, SyncAction, SyncTask, TaskSender};
use crate::storage::local::{
    copy_dir_attributes, copy_file_with_attributes, create_symlink, link_target_abs, path_exists,
    relative_path,
};
use crate::storage::Side;
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// 单个路径当前所处的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Untracked,
    TrackedEqual,
    /// 本地是指向远程文件的占位链接
    RemoteSymlink,
    InFlight,
}

/// 动作执行器，持有所有可变同步状态，只在分发器中使用
pub struct Executor {
    config: Arc<SyncConfig>,
    tracked: TrackedFiles,
    remote_backups: BackupStore,
    local_backups: BackupStore,
    access: AccessTracker,
    sender: TaskSender,
    in_flight: Option<PathBuf>,
}

impl Executor {
    pub fn new(
        config: Arc<SyncConfig>,
        remote_backups: BackupStore,
        local_backups: BackupStore,
        sender: TaskSender,
    ) -> Self {
        let access = AccessTracker::new(&config.tuning);
        Self {
            config,
            tracked: TrackedFiles::new(),
            remote_backups,
            local_backups,
            access,
            sender,
            in_flight: None,
        }
    }

    pub fn tracked(&self) -> &TrackedFiles {
        &self.tracked
    }

    pub fn backups(&self, side: Side) -> &BackupStore {
        match side {
            Side::Remote => &self.remote_backups,
            Side::Local => &self.local_backups,
        }
    }

    fn backups_mut(&mut self, side: Side) -> &mut BackupStore {
        match side {
            Side::Remote => &mut self.remote_backups,
            Side::Local => &mut self.local_backups,
        }
    }

    fn abs(&self, side: Side, relative: &Path) -> PathBuf {
        self.config.root(side).join(relative)
    }

    fn dry_run_marker(&self) -> &'static str {
        if self.config.dry_run {
            " (dry-run)"
        } else {
            ""
        }
    }

    pub fn path_state(&self, relative: &Path) -> PathState {
        if self.in_flight.as_deref() == Some(relative) {
            PathState::InFlight
        } else if self.is_placeholder(relative) {
            PathState::RemoteSymlink
        } else if self.tracked.contains(relative) {
            PathState::TrackedEqual
        } else {
            PathState::Untracked
        }
    }

    /// 本地路径是否为指向同名远程路径的占位链接
    pub fn is_placeholder(&self, relative: &Path) -> bool {
        let local = self.abs(Side::Local, relative);
        match fs::read_link(&local) {
            Ok(target) => target == self.abs(Side::Remote, relative),
            Err(_) => false,
        }
    }

    /// `side` 一侧的符号链接是否指向同侧根目录之内（失效链接同样按目标判断）
    fn links_within_root(&self, side: Side, link: &Path) -> bool {
        link_target_abs(link).is_ok_and(|target| target.starts_with(self.config.root(side)))
    }

    /// 按两侧当前元数据刷新跟踪记录；任一侧不存在时移除记录
    pub fn refresh_tracked(&mut self, relative: &Path) {
        if self.config.dry_run {
            return;
        }
        let remote = snapshot(&self.abs(Side::Remote, relative));
        let local = snapshot(&self.abs(Side::Local, relative));
        match (remote, local) {
            (Ok(Some(remote)), Ok(Some(local))) => self.tracked.record(relative, remote, local),
            _ => {
                self.tracked.forget(relative);
            }
        }
    }

    /// 执行一个同步动作
    pub fn execute(&mut self, relative: &Path, action: SyncAction) -> Result<()> {
        self.in_flight = Some(relative.to_path_buf());
        let result = match action {
            SyncAction::CopyToRemote => self.copy(relative, Side::Local),
            SyncAction::CopyToLocal => self.copy(relative, Side::Remote),
            SyncAction::LinkToRemote => self.link_to_remote(relative),
            SyncAction::DeleteRemote => self.delete(relative, Side::Remote),
            SyncAction::DeleteLocal => self.delete(relative, Side::Local),
        };
        self.in_flight = None;
        result
    }

    /// 处理远程文件的访问事件，返回是否已下载为真实副本
    pub fn handle_access(&mut self, relative: &Path) -> Result<bool> {
        if !self.is_placeholder(relative) {
            return Ok(false);
        }
        let remote = self.abs(Side::Remote, relative);
        let Some(meta) = snapshot(&remote)? else {
            return Ok(false);
        };
        if !meta.is_file {
            return Ok(false);
        }

        let count = self.access.record_access(relative, Instant::now());
        debug!("访问 {} count={:.2} size={}", relative.display(), count, meta.size);
        if !self
            .access
            .should_materialize(count, meta.size, self.config.lazy)
        {
            return Ok(false);
        }

        let local = self.abs(Side::Local, relative);
        warn!("下载 {}{}", local.display(), self.dry_run_marker());
        if self.config.dry_run {
            return Ok(false);
        }

        self.in_flight = Some(relative.to_path_buf());
        let result = self.materialize(relative, &remote, &local);
        self.in_flight = None;
        result.map(|()| true)
    }

    fn materialize(&mut self, relative: &Path, remote: &Path, local: &Path) -> Result<()> {
        self.access.clear(relative);
        fs::remove_file(local).with_context(|| format!("删除占位链接失败: {}", local.display()))?;
        copy_file_with_attributes(remote, local)?;
        self.prune_redundant(Side::Local, local);
        self.refresh_tracked(relative);
        Ok(())
    }

    /// 从 `from` 一侧复制到另一侧
    fn copy(&mut self, relative: &Path, from: Side) -> Result<()> {
        let to = from.other();
        let src = self.abs(from, relative);
        let dst = self.abs(to, relative);

        let Some(src_meta) = snapshot(&src)? else {
            debug!("源路径已不存在，跳过: {}", src.display());
            return Ok(());
        };

        if src_meta.is_symlink {
            return self.copy_symlink(relative, from);
        }
        if src_meta.is_dir {
            return self.copy_dir(relative, &src, &dst, to);
        }

        if let Some(dst_meta) = snapshot(&dst)? {
            if metadata_equal(&src_meta, &dst_meta) {
                debug!("两侧文件相同，无需复制: {}", relative.display());
                self.refresh_tracked(relative);
                return Ok(());
            }
        }

        let verb = if from == Side::Local { "上传" } else { "下载" };
        warn!(
            "{} {} -> {}{}",
            verb,
            src.display(),
            dst.display(),
            self.dry_run_marker()
        );
        if self.config.dry_run {
            return Ok(());
        }

        if path_exists(&dst) {
            self.remove_with_backup(to, relative)?;
        }
        copy_file_with_attributes(&src, &dst)?;
        self.prune_redundant(to, &dst);
        self.refresh_tracked(relative);
        Ok(())
    }

    fn copy_dir(&mut self, relative: &Path, src: &Path, dst: &Path, to: Side) -> Result<()> {
        if let Some(dst_meta) = snapshot(dst)? {
            if dst_meta.is_dir {
                self.refresh_tracked(relative);
                return Ok(());
            }
        }

        warn!("创建目录 {}{}", dst.display(), self.dry_run_marker());
        if self.config.dry_run {
            return Ok(());
        }

        if path_exists(dst) {
            self.remove_with_backup(to, relative)?;
        }
        fs::create_dir_all(dst).with_context(|| format!("创建目录失败: {}", dst.display()))?;
        if let Err(e) = copy_dir_attributes(src, dst) {
            debug!("目录属性未复制 {}: {:#}", dst.display(), e);
        }
        self.refresh_tracked(relative);
        Ok(())
    }

    fn copy_symlink(&mut self, relative: &Path, from: Side) -> Result<()> {
        let to = from.other();
        let src = self.abs(from, relative);
        let dst = self.abs(to, relative);

        // 有效的占位链接只需刷新记录
        if from == Side::Local && self.is_placeholder(relative) && src.exists() {
            self.refresh_tracked(relative);
            return Ok(());
        }

        let target = link_target_abs(&src)?;
        let inner = target
            .strip_prefix(self.config.root(from))
            .ok()
            .map(Path::to_path_buf);

        let link_value = if let Some(inner) = inner {
            // 树内链接在对侧重建为相对链接
            let mirrored = self.config.root(to).join(inner);
            let parent = dst.parent().unwrap_or(self.config.root(to));
            relative_path(parent, &mirrored)
        } else if from == Side::Remote {
            // 远程的树外链接不改动，本地用占位链接表示
            return self.link_to_remote(relative);
        } else if !src.exists() {
            warn!(
                "删除失效的符号链接 {} -> {}{}",
                src.display(),
                target.display(),
                self.dry_run_marker()
            );
            if !self.config.dry_run {
                fs::remove_file(&src)
                    .with_context(|| format!("删除符号链接失败: {}", src.display()))?;
                self.tracked.forget(relative);
            }
            return Ok(());
        } else {
            target
        };

        if fs::read_link(&dst).is_ok_and(|existing| existing == link_value) {
            self.refresh_tracked(relative);
            return Ok(());
        }

        warn!(
            "符号链接 {} -> {}{}",
            dst.display(),
            link_value.display(),
            self.dry_run_marker()
        );
        if self.config.dry_run {
            return Ok(());
        }

        if path_exists(&dst) {
            self.remove_with_backup(to, relative)?;
        }
        create_symlink(&link_value, &dst)
            .with_context(|| format!("创建符号链接失败: {}", dst.display()))?;
        self.refresh_tracked(relative);
        Ok(())
    }

    /// 本地创建指向远程文件的占位链接
    fn link_to_remote(&mut self, relative: &Path) -> Result<()> {
        let remote = self.abs(Side::Remote, relative);
        let local = self.abs(Side::Local, relative);

        let Some(remote_meta) = snapshot(&remote)? else {
            debug!("远程路径已不存在，跳过: {}", remote.display());
            return Ok(());
        };
        // 树内链接按相对链接镜像，其余符号链接与普通文件一样使用占位链接
        if remote_meta.is_dir
            || (remote_meta.is_symlink && self.links_within_root(Side::Remote, &remote))
        {
            return self.copy(relative, Side::Remote);
        }

        if self.is_placeholder(relative) {
            self.refresh_tracked(relative);
            if !self.config.lazy && remote_meta.is_file {
                self.request_download(&remote);
            }
            return Ok(());
        }

        if let Some(local_meta) = snapshot(&local)? {
            if metadata_equal(&remote_meta, &local_meta) {
                debug!("两侧文件相同，无需链接: {}", relative.display());
                self.refresh_tracked(relative);
                return Ok(());
            }
        }

        warn!(
            "符号链接 {} -> {}{}",
            local.display(),
            remote.display(),
            self.dry_run_marker()
        );
        if self.config.dry_run {
            return Ok(());
        }

        if path_exists(&local) {
            self.remove_with_backup(Side::Local, relative)?;
        }
        create_symlink(&remote, &local)
            .with_context(|| format!("创建占位链接失败: {}", local.display()))?;
        self.refresh_tracked(relative);

        if !self.config.lazy && remote_meta.is_file {
            self.request_download(&remote);
        }
        Ok(())
    }

    /// 非懒加载模式下追加一个访问事件，促使占位链接立即下载
    fn request_download(&self, remote: &Path) {
        debug!("追加访问事件以下载: {}", remote.display());
        self.sender.push(SyncTask::Event(ChangeEvent::new(
            remote,
            ChangeKind::Access,
            false,
        )));
    }

    /// 删除 `target` 一侧的路径
    fn delete(&mut self, relative: &Path, target: Side) -> Result<()> {
        let target_path = self.abs(target, relative);
        let other_path = self.abs(target.other(), relative);
        let target_exists = path_exists(&target_path);

        // 两侧都在：删除事件是其他动作的副作用
        if target_exists && path_exists(&other_path) {
            debug!("两侧都存在，不删除: {}", relative.display());
            return Ok(());
        }
        if !target_exists {
            debug!("{} 侧已不存在，不删除: {}", target, relative.display());
            if !self.config.dry_run {
                self.tracked.forget_subtree(relative);
            }
            return Ok(());
        }

        warn!("删除 {}{}", target_path.display(), self.dry_run_marker());
        if self.config.dry_run {
            return Ok(());
        }

        self.remove_with_backup(target, relative)?;
        self.access.clear(relative);
        self.tracked.forget_subtree(relative);
        Ok(())
    }

    /// 符号链接直接删除，目录逐项递归，普通文件移入备份存储
    fn remove_with_backup(&mut self, side: Side, relative: &Path) -> Result<()> {
        let path = self.abs(side, relative);
        let meta = fs::symlink_metadata(&path)
            .with_context(|| format!("读取元数据失败: {}", path.display()))?;

        if meta.file_type().is_symlink() {
            fs::remove_file(&path)
                .with_context(|| format!("删除符号链接失败: {}", path.display()))?;
        } else if meta.is_dir() {
            let children = fs::read_dir(&path)
                .with_context(|| format!("读取目录失败: {}", path.display()))?;
            for child in children {
                let child = child?;
                self.remove_with_backup(side, &relative.join(child.file_name()))?;
            }
            fs::remove_dir(&path).with_context(|| format!("删除目录失败: {}", path.display()))?;
        } else {
            self.backups_mut(side).backup(&path)?;
        }
        Ok(())
    }

    fn prune_redundant(&mut self, side: Side, path: &Path) {
        if let Err(e) = self.backups_mut(side).prune_if_redundant(path, path) {
            warn!("检查冗余备份失败 {}: {:#}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::queue::TaskQueue;
    use std::fs::FileTimes;
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn setup(lazy: bool) -> (TempDir, Executor, TaskQueue) {
        let dir = TempDir::new().unwrap();
        let remote = dir.path().join("remote");
        let local = dir.path().join("local");
        fs::create_dir_all(&remote).unwrap();
        fs::create_dir_all(&local).unwrap();

        let (remote_backups, _) = BackupStore::open(&remote).unwrap();
        let (local_backups, _) = BackupStore::open(&local).unwrap();
        let queue = TaskQueue::new();
        let config = Arc::new(SyncConfig::new(remote, local).with_lazy(lazy));
        let executor = Executor::new(config, remote_backups, local_backups, queue.sender());
        (dir, executor, queue)
    }

    fn write_at(path: &Path, content: &[u8], secs: u64) {
        fs::write(path, content).unwrap();
        set_mtime(path, secs);
    }

    fn set_mtime(path: &Path, secs: u64) {
        let t = SystemTime::UNIX_EPOCH + Duration::from_secs(secs);
        let file = if path.is_dir() {
            fs::File::open(path).unwrap()
        } else {
            fs::File::options().write(true).open(path).unwrap()
        };
        file.set_times(FileTimes::new().set_modified(t).set_accessed(t))
            .unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_broken_local_link_outside_tree_removed() {
        let (dir, mut executor, _queue) = setup(true);
        let rel = Path::new("dangling");
        let link = executor.abs(Side::Local, rel);
        std::os::unix::fs::symlink(dir.path().join("gone/file"), &link).unwrap();

        executor.execute(rel, SyncAction::CopyToRemote).unwrap();

        assert!(fs::symlink_metadata(&link).is_err());
        assert!(fs::symlink_metadata(executor.abs(Side::Remote, rel)).is_err());
        assert!(!executor.tracked().contains(rel));
    }

    #[cfg(unix)]
    #[test]
    fn test_remote_link_outside_tree_kept() {
        let (_dir, mut executor, _queue) = setup(true);
        let rel = Path::new("ext");
        let remote_link = executor.abs(Side::Remote, rel);
        std::os::unix::fs::symlink("/mnt/not-mounted/data", &remote_link).unwrap();

        for action in [SyncAction::LinkToRemote, SyncAction::CopyToLocal] {
            executor.execute(rel, action).unwrap();
            assert_eq!(
                fs::read_link(&remote_link).unwrap(),
                PathBuf::from("/mnt/not-mounted/data")
            );
            assert!(executor.is_placeholder(rel));
        }
        assert_eq!(executor.backups(Side::Local).entries().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_eager_placeholder_queues_download() {
        let (_dir, mut executor, mut queue) = setup(false);
        let rel = Path::new("f.bin");
        let remote = executor.abs(Side::Remote, rel);
        fs::write(&remote, b"data").unwrap();

        executor.execute(rel, SyncAction::LinkToRemote).unwrap();
        assert!(executor.is_placeholder(rel));
        match queue.pop() {
            Some(SyncTask::Event(event)) => {
                assert_eq!(event.path, remote);
                assert_eq!(event.kind, ChangeKind::Access);
            }
            other => panic!("unexpected task: {:?}", other),
        }

        assert!(executor.handle_access(rel).unwrap());
        let local = executor.abs(Side::Local, rel);
        assert!(!fs::symlink_metadata(&local).unwrap().file_type().is_symlink());
        assert_eq!(fs::read(&local).unwrap(), b"data");
    }

    #[test]
    fn test_copy_prunes_identical_backup() {
        let (_dir, mut executor, _queue) = setup(true);
        let same = Path::new("same.txt");
        let changed = Path::new("changed.txt");
        write_at(&executor.abs(Side::Remote, same), b"content", 1_000_000_000);
        write_at(&executor.abs(Side::Local, same), b"content", 1_100_000_000);
        write_at(&executor.abs(Side::Remote, changed), b"old", 1_000_000_000);
        write_at(&executor.abs(Side::Local, changed), b"new", 1_100_000_000);

        executor.execute(same, SyncAction::CopyToRemote).unwrap();
        executor.execute(changed, SyncAction::CopyToRemote).unwrap();

        let remote_same = executor.abs(Side::Remote, same);
        assert_eq!(
            fs::metadata(&remote_same).unwrap().modified().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_100_000_000)
        );
        // 内容未变的备份被删除，内容不同的保留
        assert!(executor.backups(Side::Remote).records(&remote_same).is_empty());
        let records = executor
            .backups(Side::Remote)
            .records(&executor.abs(Side::Remote, changed));
        assert_eq!(records.len(), 1);
        assert_eq!(fs::read(&records[0].backup_file).unwrap(), b"old");
        assert_eq!(executor.path_state(same), PathState::TrackedEqual);
    }

    #[test]
    fn test_delete_skipped_when_both_exist() {
        let (_dir, mut executor, _queue) = setup(true);
        let rel = Path::new("keep.txt");
        fs::write(executor.abs(Side::Remote, rel), b"r").unwrap();
        fs::write(executor.abs(Side::Local, rel), b"l").unwrap();

        executor.execute(rel, SyncAction::DeleteRemote).unwrap();
        executor.execute(rel, SyncAction::DeleteLocal).unwrap();

        assert_eq!(fs::read(executor.abs(Side::Remote, rel)).unwrap(), b"r");
        assert_eq!(fs::read(executor.abs(Side::Local, rel)).unwrap(), b"l");
        assert_eq!(executor.backups(Side::Remote).entries().count(), 0);
        assert_eq!(executor.backups(Side::Local).entries().count(), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_copied_dir_keeps_mode_and_mtime() {
        use std::os::unix::fs::PermissionsExt;

        let (_dir, mut executor, _queue) = setup(true);
        let rel = Path::new("d");
        let remote_dir = executor.abs(Side::Remote, rel);
        fs::create_dir(&remote_dir).unwrap();
        fs::set_permissions(&remote_dir, fs::Permissions::from_mode(0o750)).unwrap();
        set_mtime(&remote_dir, 1_234_567_890);

        executor.execute(rel, SyncAction::LinkToRemote).unwrap();

        let local_dir = executor.abs(Side::Local, rel);
        let meta = fs::metadata(&local_dir).unwrap();
        assert!(meta.is_dir());
        assert_eq!(meta.permissions().mode() & 0o777, 0o750);
        assert_eq!(
            meta.modified().unwrap(),
            SystemTime::UNIX_EPOCH + Duration::from_secs(1_234_567_890)
        );
        assert_eq!(executor.path_state(rel), PathState::TrackedEqual);
    }
}
