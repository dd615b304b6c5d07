//! Linux 上直接基于 inotify 的文件监听
//!
//! 每个目录单独添加监听并订阅读取事件（IN_ACCESS）。分块读取一个大文件时，
//! 每次 read 都会产生一个访问事件，访问计数才能反映实际读取量。

use super::{ChangeSource, WatchFilter};
use crate::core::queue::{ChangeEvent, ChangeKind};
use anyhow::{Context, Result};
use inotify::{EventMask, Inotify, WatchDescriptor, WatchMask};
use std::collections::HashMap;
use std::ffi::OsString;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 没有事件时两次读取之间的间隔
const POLL_STEP: Duration = Duration::from_millis(20);
const BUFFER_SIZE: usize = 64 * 1024;

fn watch_mask() -> WatchMask {
    WatchMask::ACCESS
        | WatchMask::CREATE
        | WatchMask::CLOSE_WRITE
        | WatchMask::DELETE
        | WatchMask::MOVED_FROM
        | WatchMask::MOVED_TO
        | WatchMask::ONLYDIR
        | WatchMask::DONT_FOLLOW
        | WatchMask::EXCL_UNLINK
}

pub struct InotifyWatcher {
    inotify: Inotify,
    dirs: HashMap<WatchDescriptor, PathBuf>,
    filter: WatchFilter,
    buffer: Vec<u8>,
}

impl InotifyWatcher {
    pub fn new(filter: WatchFilter) -> Result<Self> {
        let inotify = Inotify::init().context("初始化 inotify 失败")?;
        let roots: Vec<PathBuf> = filter.roots().iter().map(|r| r.to_path_buf()).collect();
        let mut watcher = Self {
            inotify,
            dirs: HashMap::new(),
            filter,
            buffer: vec![0; BUFFER_SIZE],
        };

        for root in &roots {
            watcher
                .add_dir(root)
                .with_context(|| format!("监听目录失败: {}", root.display()))?;
            watcher.watch_subdirs(root);
        }
        debug!("inotify 已监听 {} 个目录", watcher.dirs.len());
        Ok(watcher)
    }

    fn add_dir(&mut self, dir: &Path) -> io::Result<()> {
        let wd = self.inotify.watches().add(dir, watch_mask())?;
        self.dirs.insert(wd, dir.to_path_buf());
        Ok(())
    }

    /// 为 `dir` 下所有未忽略的子目录添加监听
    fn watch_subdirs(&mut self, dir: &Path) {
        let subdirs: Vec<PathBuf> = WalkDir::new(dir)
            .follow_links(false)
            .min_depth(1)
            .into_iter()
            .filter_entry(|e| e.file_type().is_dir() && self.filter.is_relevant(e.path()))
            .filter_map(|e| e.ok())
            .map(|e| e.into_path())
            .collect();

        for subdir in subdirs {
            if let Err(e) = self.add_dir(&subdir) {
                warn!("监听子目录失败 {}: {}", subdir.display(), e);
            }
        }
    }

    /// 非阻塞地读出内核中已排队的全部事件
    fn read_available(&mut self) -> Result<Vec<ChangeEvent>> {
        let mut raw = Vec::new();
        loop {
            match self.inotify.read_events(&mut self.buffer) {
                Ok(events) => {
                    let before = raw.len();
                    raw.extend(events.map(|e| (e.wd, e.mask, e.name.map(|n| n.to_os_string()))));
                    if raw.len() == before {
                        break;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e).context("读取 inotify 事件失败"),
            }
        }

        let mut batch = Vec::new();
        for (wd, mask, name) in raw {
            self.handle(wd, mask, name, &mut batch);
        }
        Ok(batch)
    }

    fn handle(
        &mut self,
        wd: WatchDescriptor,
        mask: EventMask,
        name: Option<OsString>,
        batch: &mut Vec<ChangeEvent>,
    ) {
        if mask.contains(EventMask::Q_OVERFLOW) {
            warn!("inotify 事件队列溢出，等待下一轮扫描");
            return;
        }
        // 目录被删除或移出后内核自动移除监听
        if mask.contains(EventMask::IGNORED) {
            self.dirs.remove(&wd);
            return;
        }

        let Some(dir) = self.dirs.get(&wd) else {
            return;
        };
        let path = match name {
            Some(name) => dir.join(name),
            None => dir.clone(),
        };
        if !self.filter.is_relevant(&path) {
            return;
        }

        let is_dir = mask.contains(EventMask::ISDIR);
        let Some(kind) = classify(mask) else {
            return;
        };
        // 扫描时读取目录也会产生访问事件
        if kind == ChangeKind::Access && is_dir {
            return;
        }
        if kind == ChangeKind::Create && is_dir {
            match self.add_dir(&path) {
                Ok(()) => self.watch_subdirs(&path),
                Err(e) => debug!("新目录未能监听 {}: {}", path.display(), e),
            }
        }
        batch.push(ChangeEvent::new(path, kind, is_dir));
    }
}

impl ChangeSource for InotifyWatcher {
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<ChangeEvent>> {
        let deadline = Instant::now() + timeout;
        loop {
            let batch = self.read_available()?;
            let now = Instant::now();
            if !batch.is_empty() || now >= deadline {
                return Ok(batch);
            }
            std::thread::sleep(POLL_STEP.min(deadline - now));
        }
    }

    fn name(&self) -> &str {
        "inotify"
    }
}

/// inotify 事件掩码转换为变更类型；移入视为创建，移出视为删除
pub(crate) fn classify(mask: EventMask) -> Option<ChangeKind> {
    if mask.contains(EventMask::CLOSE_WRITE) {
        Some(ChangeKind::CloseWrite)
    } else if mask.intersects(EventMask::CREATE | EventMask::MOVED_TO) {
        Some(ChangeKind::Create)
    } else if mask.intersects(EventMask::DELETE | EventMask::MOVED_FROM) {
        Some(ChangeKind::Delete)
    } else if mask.contains(EventMask::ACCESS) {
        Some(ChangeKind::Access)
    } else {
        None
    }
}
