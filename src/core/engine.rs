use crate::config::SyncConfig;
use crate::core::backup::BackupStore;
use crate::core::comparator::{metadata_equal, snapshot, TreeDiff};
use crate::core::executor::{Executor, PathState};
use crate::core::file_state::TrackedFiles;
use crate::core::queue::{ChangeEvent, ChangeKind, SyncAction, SyncTask, TaskQueue, TaskSender};
use crate::core::scanner::FileScanner;
use crate::error::SyncError;
use crate::storage::Side;
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// 运行统计
#[derive(Debug, Clone, Default)]
pub struct EngineStats {
    pub scans: u64,
    pub tasks: u64,
    pub actions_ok: u64,
    pub actions_failed: u64,
    pub materialized: u64,
    /// 扫描和执行动作累计耗时
    pub busy: Duration,
}

/// 原始事件的分类结果
enum Dispatch {
    Action(PathBuf, SyncAction),
    Access(PathBuf),
}

/// 同步引擎：扫描两侧目录、分发任务队列
pub struct SyncEngine {
    config: Arc<SyncConfig>,
    queue: TaskQueue,
    executor: Executor,
    cancel: CancellationToken,
    stats: EngineStats,
}

impl SyncEngine {
    /// 打开两侧的备份存储（执行一致性修复）并创建任务队列
    ///
    /// 两个根目录都必须已经存在，否则返回 `SyncError::RootUnavailable`。
    pub fn new(config: SyncConfig) -> Result<Self> {
        for root in [&config.remote, &config.local] {
            if !root.is_dir() {
                return Err(SyncError::RootUnavailable { path: root.clone() }.into());
            }
        }

        let (remote_backups, remote_report) = BackupStore::open(&config.remote)?;
        let (local_backups, local_report) = BackupStore::open(&config.local)?;
        debug!(
            "备份存储修复结果: remote={:?}, local={:?}",
            remote_report, local_report
        );

        let config = Arc::new(config);
        let queue = TaskQueue::new();
        let executor = Executor::new(
            Arc::clone(&config),
            remote_backups,
            local_backups,
            queue.sender(),
        );

        Ok(Self {
            config,
            queue,
            executor,
            cancel: CancellationToken::new(),
            stats: EngineStats::default(),
        })
    }

    /// 使用外部的取消令牌
    pub fn with_cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// 供文件监听源使用的生产端
    pub fn sender(&self) -> TaskSender {
        self.queue.sender()
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    pub fn tracked(&self) -> &TrackedFiles {
        self.executor.tracked()
    }

    pub fn backups(&self, side: Side) -> &BackupStore {
        self.executor.backups(side)
    }

    pub fn path_state(&self, relative: &Path) -> PathState {
        self.executor.path_state(relative)
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    /// 扫描两侧目录并将需要的动作加入队列，返回加入的任务数
    pub fn reconcile(&mut self) -> Result<usize> {
        for root in [&self.config.remote, &self.config.local] {
            if !root.is_dir() {
                warn!("目录不可用，跳过本轮扫描: {}", root.display());
                return Ok(0);
            }
        }

        let scanner = FileScanner::new(&self.config.ignore).with_cancel(self.cancel.clone());
        let remote = scanner.walk(&self.config.remote)?;
        let local = scanner.walk(&self.config.local)?;
        self.stats.scans += 1;

        let diff = TreeDiff::partition(&remote, &local);
        let summary = diff.summary();
        debug!(
            "对比结果: 共 {} 个路径, 仅一侧存在 {} 个 ({:?})",
            summary.total(),
            summary.one_sided(),
            summary
        );

        let sender = self.queue.sender();
        let mut queued = 0;

        for relative in diff.both() {
            if let Some(action) = self.classify_both(relative) {
                debug!("{} -> {}", relative.display(), action.name());
                sender.push_action(relative.clone(), action);
                queued += 1;
            }
        }

        // 同一侧的目录先于文件入队
        let one_sided = [
            (&diff.folders_remote_only, Side::Remote),
            (&diff.folders_local_only, Side::Local),
            (&diff.files_remote_only, Side::Remote),
            (&diff.files_local_only, Side::Local),
        ];
        for (paths, present_on) in one_sided {
            for relative in paths {
                let action = match (self.executor.tracked().contains(relative), present_on) {
                    (true, Side::Remote) => SyncAction::DeleteRemote,
                    (true, Side::Local) => SyncAction::DeleteLocal,
                    (false, Side::Remote) => SyncAction::LinkToRemote,
                    (false, Side::Local) => SyncAction::CopyToRemote,
                };
                debug!("{} -> {}", relative.display(), action.name());
                sender.push_action(relative.clone(), action);
                queued += 1;
            }
        }

        if queued > 0 {
            info!("扫描完成，新增 {} 个同步任务", queued);
        }
        Ok(queued)
    }

    /// 两侧都存在的路径：一致则刷新记录，否则按修改时间决定方向
    fn classify_both(&mut self, relative: &Path) -> Option<SyncAction> {
        if self.executor.is_placeholder(relative) {
            let remote_is_file = matches!(
                snapshot(&self.config.remote.join(relative)),
                Ok(Some(meta)) if meta.is_file
            );
            if !self.config.lazy && remote_is_file {
                return Some(SyncAction::CopyToLocal);
            }
            self.executor.refresh_tracked(relative);
            return None;
        }

        let remote = snapshot(&self.config.remote.join(relative));
        let local = snapshot(&self.config.local.join(relative));
        let (remote, local) = match (remote, local) {
            (Ok(Some(remote)), Ok(Some(local))) => (remote, local),
            // 扫描后已变化，交给下一轮
            _ => return None,
        };

        if metadata_equal(&remote, &local) {
            self.executor.refresh_tracked(relative);
            None
        } else if local.mtime > remote.mtime {
            Some(SyncAction::CopyToRemote)
        } else {
            Some(SyncAction::LinkToRemote)
        }
    }

    /// 原始事件分类；根目录之外、根目录本身和被忽略的路径返回 None
    fn classify_event(&self, event: &ChangeEvent) -> Option<Dispatch> {
        let (side, relative) = if let Ok(rel) = event.path.strip_prefix(&self.config.remote) {
            (Side::Remote, rel)
        } else if let Ok(rel) = event.path.strip_prefix(&self.config.local) {
            (Side::Local, rel)
        } else {
            debug!("{}", SyncError::OutsideRoots(event.path.clone()));
            return None;
        };

        if relative.as_os_str().is_empty() || self.config.ignore.is_ignored(relative) {
            return None;
        }
        let relative = relative.to_path_buf();

        match (event.kind, side) {
            (ChangeKind::Access, Side::Remote) if !event.is_dir => Some(Dispatch::Access(relative)),
            (ChangeKind::Access, _) => None,
            (ChangeKind::CloseWrite, _) if event.is_dir => None,
            (ChangeKind::Create | ChangeKind::CloseWrite, Side::Local) => {
                Some(Dispatch::Action(relative, SyncAction::CopyToRemote))
            }
            (ChangeKind::Create | ChangeKind::CloseWrite, Side::Remote) => {
                Some(Dispatch::Action(relative, SyncAction::LinkToRemote))
            }
            (ChangeKind::Delete, Side::Local) => {
                Some(Dispatch::Action(relative, SyncAction::DeleteRemote))
            }
            (ChangeKind::Delete, Side::Remote) => {
                Some(Dispatch::Action(relative, SyncAction::DeleteLocal))
            }
        }
    }

    /// 执行一个任务；失败只记录日志，由下一轮扫描纠正
    pub fn dispatch(&mut self, task: SyncTask) {
        self.stats.tasks += 1;

        let dispatch = match task {
            SyncTask::Action { path, action } => Dispatch::Action(path, action),
            SyncTask::Event(event) => match self.classify_event(&event) {
                Some(dispatch) => dispatch,
                None => {
                    debug!("忽略事件: {:?} {}", event.kind, event.path.display());
                    return;
                }
            },
        };

        match dispatch {
            Dispatch::Action(path, action) => match self.executor.execute(&path, action) {
                Ok(()) => self.stats.actions_ok += 1,
                Err(e) => {
                    self.stats.actions_failed += 1;
                    error!("{} {} 失败: {:#}", action.name(), path.display(), e);
                }
            },
            Dispatch::Access(path) => match self.executor.handle_access(&path) {
                Ok(true) => self.stats.materialized += 1,
                Ok(false) => {}
                Err(e) => {
                    self.stats.actions_failed += 1;
                    error!("下载 {} 失败: {:#}", path.display(), e);
                }
            },
        }
    }

    /// 取出并执行队首任务，队列为空时返回 false
    pub fn process_next(&mut self) -> bool {
        match self.queue.pop() {
            Some(task) => {
                self.dispatch(task);
                true
            }
            None => false,
        }
    }

    /// 执行任务直到队列为空或被取消，返回执行的任务数
    pub fn drain(&mut self) -> usize {
        let mut processed = 0;
        while !self.cancel.is_cancelled() && self.process_next() {
            processed += 1;
        }
        processed
    }

    /// 主循环：队列为空且到达扫描时间时扫描，每次迭代执行一个任务，空闲时休眠
    pub async fn run(&mut self, token: CancellationToken) -> EngineStats {
        self.cancel = token.clone();
        let min_interval = self.config.tuning.min_scan_interval();
        let idle_sleep = self.config.tuning.idle_sleep();
        let mut next_scan_at = Instant::now();

        info!(
            "开始同步: {} <-> {} (lazy={}, dry_run={})",
            self.config.remote.display(),
            self.config.local.display(),
            self.config.lazy,
            self.config.dry_run
        );

        loop {
            if token.is_cancelled() {
                break;
            }

            let cycle_start = Instant::now();
            let mut busy = false;

            if self.queue.is_empty() && cycle_start >= next_scan_at {
                match self.reconcile() {
                    Ok(_) => {}
                    Err(e) if token.is_cancelled() => {
                        debug!("扫描被中断: {:#}", e);
                        break;
                    }
                    Err(e) => warn!("扫描失败: {:#}", e),
                }
                let scan_end = Instant::now();
                // 扫描耗时超过最小间隔时按耗时推迟，扫描不会占满时间
                next_scan_at = scan_end + min_interval.max(scan_end - cycle_start);
                busy = true;
            }

            if self.process_next() {
                busy = true;
            }
            self.stats.busy += cycle_start.elapsed();

            if busy {
                tokio::task::yield_now().await;
                continue;
            }

            let nap = idle_sleep.min(next_scan_at.saturating_duration_since(Instant::now()));
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(nap) => {}
            }
        }

        info!(
            "同步已停止: 扫描 {} 次, 任务 {} 个 (成功 {}, 失败 {}), 下载 {} 个, 累计耗时 {:.1}s",
            self.stats.scans,
            self.stats.tasks,
            self.stats.actions_ok,
            self.stats.actions_failed,
            self.stats.materialized,
            self.stats.busy.as_secs_f64()
        );
        self.stats.clone()
    }
}

/// 等待两个根目录可用，退避间隔从 250ms 开始翻倍
pub async fn wait_for_roots(config: &SyncConfig, token: &CancellationToken) -> Result<()> {
    let max_delay = config.tuning.startup_backoff_max();
    let mut delay = Duration::from_millis(250).min(max_delay);

    loop {
        let missing: Vec<&Path> = [config.remote.as_path(), config.local.as_path()]
            .into_iter()
            .filter(|root| !root.is_dir())
            .collect();
        if missing.is_empty() {
            return Ok(());
        }

        for root in &missing {
            warn!("目录不可用，{}ms 后重试: {}", delay.as_millis(), root.display());
        }

        tokio::select! {
            _ = token.cancelled() => return Err(SyncError::Cancelled.into()),
            _ = tokio::time::sleep(delay) => {}
        }
        delay = (delay * 2).min(max_delay);
    }
}
