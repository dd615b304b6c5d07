//! 文件变更监听源
//!
//! 引擎只依赖 `ChangeSource`：每次取一批事件。监听源运行在单独的阻塞线程上，
//! 只向任务队列追加事件，从不读取或修改同步状态。

#[cfg(target_os = "linux")]
pub mod inotify_watcher;
#[cfg(not(target_os = "linux"))]
pub mod kernel;
pub mod open_files;

use crate::config::{IgnoreRules, SyncConfig};
use crate::core::queue::{ChangeEvent, SyncTask, TaskSender};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[cfg(target_os = "linux")]
pub use inotify_watcher::InotifyWatcher;
#[cfg(not(target_os = "linux"))]
pub use kernel::KernelWatcher;
pub use open_files::OpenFilesScanner;

/// 单次取事件的最长等待，决定监听线程响应取消的延迟
const PUMP_TIMEOUT: Duration = Duration::from_millis(500);

/// 文件变更事件源
pub trait ChangeSource: Send {
    /// 等待至多 `timeout`，返回这段时间内的事件（可能为空）
    fn next_batch(&mut self, timeout: Duration) -> Result<Vec<ChangeEvent>>;

    fn name(&self) -> &str;
}

/// 监听方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum WatcherKind {
    /// 内核文件系统通知（Linux 直接使用 inotify，其他平台经由 notify）
    #[default]
    Kernel,
    /// 轮询所有进程当前打开的文件
    OpenFiles,
    /// 只依靠定期扫描
    None,
}

/// 判断事件路径是否位于同步目录内且未被忽略
#[derive(Debug, Clone)]
pub struct WatchFilter {
    remote: PathBuf,
    local: PathBuf,
    ignore: IgnoreRules,
}

impl WatchFilter {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            remote: config.remote.clone(),
            local: config.local.clone(),
            ignore: config.ignore.clone(),
        }
    }

    pub fn roots(&self) -> [&Path; 2] {
        [&self.remote, &self.local]
    }

    pub fn is_relevant(&self, path: &Path) -> bool {
        self.roots().iter().any(|root| match path.strip_prefix(root) {
            Ok(relative) => !relative.as_os_str().is_empty() && !self.ignore.is_ignored(relative),
            Err(_) => false,
        })
    }
}

/// 按类型创建监听源，`WatcherKind::None` 返回 None
pub fn create_source(kind: WatcherKind, config: &SyncConfig) -> Result<Option<Box<dyn ChangeSource>>> {
    let filter = WatchFilter::from_config(config);
    let source: Box<dyn ChangeSource> = match kind {
        #[cfg(target_os = "linux")]
        WatcherKind::Kernel => Box::new(InotifyWatcher::new(filter)?),
        #[cfg(not(target_os = "linux"))]
        WatcherKind::Kernel => Box::new(KernelWatcher::new(filter)?),
        WatcherKind::OpenFiles => Box::new(OpenFilesScanner::new(filter, config.tuning.poll_interval())),
        WatcherKind::None => return Ok(None),
    };
    info!("文件监听已启动: {}", source.name());
    Ok(Some(source))
}

/// 在后台阻塞线程上运行监听源，直到令牌被取消
pub fn spawn_pump(
    mut source: Box<dyn ChangeSource>,
    sender: TaskSender,
    token: CancellationToken,
) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        while !token.is_cancelled() {
            match source.next_batch(PUMP_TIMEOUT) {
                Ok(events) => {
                    for event in events {
                        debug!("{} 事件: {:?} {}", source.name(), event.kind, event.path.display());
                        sender.push(SyncTask::Event(event));
                    }
                }
                Err(e) => {
                    warn!("{} 读取事件失败: {:#}", source.name(), e);
                    std::thread::sleep(PUMP_TIMEOUT);
                }
            }
        }
        info!("文件监听已停止: {}", source.name());
    })
}
