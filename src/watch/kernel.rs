use super::{ChangeSource, WatchFilter};
use crate::core::queue::{ChangeEvent, ChangeKind};
use anyhow::{bail, Context, Result};
use notify::event::{AccessKind, AccessMode, CreateKind, ModifyKind, RemoveKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::Path;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::time::Duration;
use tracing::warn;

/// 基于 notify 的内核文件监听，递归监听两个根目录（非 Linux 平台）
pub struct KernelWatcher {
    _watcher: RecommendedWatcher,
    rx: Receiver<notify::Result<Event>>,
    filter: WatchFilter,
}

impl KernelWatcher {
    pub fn new(filter: WatchFilter) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(tx).context("创建文件监听失败")?;
        for root in filter.roots() {
            watcher
                .watch(root, RecursiveMode::Recursive)
                .with_context(|| format!("监听目录失败: {}", root.display()))?;
        }

        Ok(Self {
            _watcher: watcher,
            rx,
            filter,
        })
    }

    fn collect(&self, result: notify::Result<Event>, batch: &mut Vec<ChangeEvent>) {
        match result {
            Ok(event) => batch.extend(
                translate(&event)
                    .into_iter()
                    .filter(|e| self.filter.is_relevant(&e.path)),
            ),
            Err(e) => warn!("文件监听错误: {}", e),
        }
    }
}

impl ChangeSource for KernelWatcher {
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<ChangeEvent>> {
        let first = match self.rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => return Ok(Vec::new()),
            Err(RecvTimeoutError::Disconnected) => bail!("文件监听通道已关闭"),
        };

        let mut batch = Vec::new();
        self.collect(first, &mut batch);
        while let Ok(result) = self.rx.try_recv() {
            self.collect(result, &mut batch);
        }
        Ok(batch)
    }

    fn name(&self) -> &str {
        "kernel"
    }
}

fn is_dir(path: &Path) -> bool {
    std::fs::symlink_metadata(path)
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

/// notify 事件转换为变更事件；内容修改由写入后关闭和定期扫描覆盖，不单独上报
pub(crate) fn translate(event: &Event) -> Vec<ChangeEvent> {
    let each = |kind: ChangeKind, dir: Option<bool>| -> Vec<ChangeEvent> {
        event
            .paths
            .iter()
            .map(|p| ChangeEvent::new(p.clone(), kind, dir.unwrap_or_else(|| is_dir(p))))
            .collect()
    };

    match &event.kind {
        EventKind::Access(AccessKind::Close(AccessMode::Write)) => each(ChangeKind::CloseWrite, Some(false)),
        EventKind::Access(_) => each(ChangeKind::Access, None),
        EventKind::Create(CreateKind::Folder) => each(ChangeKind::Create, Some(true)),
        EventKind::Create(_) => each(ChangeKind::Create, None),
        EventKind::Remove(RemoveKind::Folder) => each(ChangeKind::Delete, Some(true)),
        EventKind::Remove(_) => each(ChangeKind::Delete, Some(false)),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(ChangeKind::Delete, Some(false)),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(ChangeKind::Create, None),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.as_slice() {
            [from, to] => vec![
                ChangeEvent::new(from.clone(), ChangeKind::Delete, false),
                ChangeEvent::new(to.clone(), ChangeKind::Create, is_dir(to)),
            ],
            _ => Vec::new(),
        },
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_translate_kinds() {
        let close = Event::new(EventKind::Access(AccessKind::Close(AccessMode::Write)))
            .add_path(PathBuf::from("/r/a"));
        assert_eq!(
            translate(&close),
            vec![ChangeEvent::new("/r/a", ChangeKind::CloseWrite, false)]
        );

        let mkdir = Event::new(EventKind::Create(CreateKind::Folder)).add_path(PathBuf::from("/l/d"));
        assert_eq!(
            translate(&mkdir),
            vec![ChangeEvent::new("/l/d", ChangeKind::Create, true)]
        );

        let rename = Event::new(EventKind::Modify(ModifyKind::Name(RenameMode::Both)))
            .add_path(PathBuf::from("/l/old"))
            .add_path(PathBuf::from("/l/new"));
        let events = translate(&rename);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].kind, ChangeKind::Delete);
        assert_eq!(events[1].kind, ChangeKind::Create);

        let modify = Event::new(EventKind::Modify(ModifyKind::Any)).add_path(PathBuf::from("/r/a"));
        assert!(translate(&modify).is_empty());
    }

    #[test]
    fn test_open_counts_as_access() {
        let open = Event::new(EventKind::Access(AccessKind::Open(AccessMode::Any)))
            .add_path(PathBuf::from("/r/missing-file"));
        assert_eq!(
            translate(&open),
            vec![ChangeEvent::new("/r/missing-file", ChangeKind::Access, false)]
        );
    }
}
