use super::{ChangeSource, WatchFilter};
use crate::core::queue::{ChangeEvent, ChangeKind};
use anyhow::Result;
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 轮询所有进程打开的文件
///
/// 新出现的打开文件上报为访问，不再打开的文件上报为写入后关闭。
/// 只在 Linux 上通过 `/proc/<pid>/fd` 实现，其他平台只返回空批次。
pub struct OpenFilesScanner {
    filter: WatchFilter,
    interval: Duration,
    open: HashSet<PathBuf>,
    next_poll: Instant,
    warned: bool,
}

impl OpenFilesScanner {
    pub fn new(filter: WatchFilter, interval: Duration) -> Self {
        Self {
            filter,
            interval,
            open: HashSet::new(),
            next_poll: Instant::now(),
            warned: false,
        }
    }

    #[cfg(target_os = "linux")]
    fn open_files(&mut self) -> HashSet<PathBuf> {
        use std::fs;

        let mut files = HashSet::new();
        let procs = match fs::read_dir("/proc") {
            Ok(procs) => procs,
            Err(e) => {
                if !self.warned {
                    warn!("无法读取 /proc，打开文件扫描不可用: {}", e);
                    self.warned = true;
                }
                return files;
            }
        };

        for proc_entry in procs.flatten() {
            let is_pid = proc_entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.bytes().all(|b| b.is_ascii_digit()));
            if !is_pid {
                continue;
            }
            // 进程已退出或无权限时跳过
            let Ok(fds) = fs::read_dir(proc_entry.path().join("fd")) else {
                continue;
            };
            for fd in fds.flatten() {
                let Ok(target) = fs::read_link(fd.path()) else {
                    continue;
                };
                if !target.is_absolute() || !self.filter.is_relevant(&target) {
                    continue;
                }
                if fs::symlink_metadata(&target).is_ok_and(|m| m.is_file()) {
                    files.insert(target);
                }
            }
        }
        files
    }

    #[cfg(not(target_os = "linux"))]
    fn open_files(&mut self) -> HashSet<PathBuf> {
        if !self.warned {
            warn!("当前平台不支持打开文件扫描，仅依靠定期扫描");
            self.warned = true;
        }
        HashSet::new()
    }

    fn poll(&mut self) -> Vec<ChangeEvent> {
        let current = self.open_files();
        let mut events = Vec::new();

        for path in current.difference(&self.open) {
            events.push(ChangeEvent::new(path.clone(), ChangeKind::Access, false));
        }
        for path in self.open.difference(&current) {
            events.push(ChangeEvent::new(path.clone(), ChangeKind::CloseWrite, false));
        }

        if !events.is_empty() {
            debug!("打开文件变化: {} 个事件, 当前打开 {} 个", events.len(), current.len());
        }
        self.open = current;
        events
    }
}

impl ChangeSource for OpenFilesScanner {
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<ChangeEvent>> {
        let wait = self.next_poll.saturating_duration_since(Instant::now());
        if wait > timeout {
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }
        std::thread::sleep(wait);

        self.next_poll = Instant::now() + self.interval;
        Ok(self.poll())
    }

    fn name(&self) -> &str {
        "open-files"
    }
}
