//! 任务队列
//!
//! 多生产者、单消费者的 FIFO 队列。扫描和文件监听都只向队列追加任务，
//! 分发器按到达顺序逐个取出。

use std::path::PathBuf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::debug;

/// 同步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncAction {
    /// 本地 -> 远程（上传）
    CopyToRemote,
    /// 远程 -> 本地（下载）
    CopyToLocal,
    /// 本地创建指向远程的占位符号链接
    LinkToRemote,
    /// 删除远程副本
    DeleteRemote,
    /// 删除本地副本
    DeleteLocal,
}

impl SyncAction {
    pub fn name(self) -> &'static str {
        match self {
            SyncAction::CopyToRemote => "upload",
            SyncAction::CopyToLocal => "download",
            SyncAction::LinkToRemote => "link",
            SyncAction::DeleteRemote => "delete-remote",
            SyncAction::DeleteLocal => "delete-local",
        }
    }
}

/// 文件变更事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeKind {
    Access,
    Create,
    CloseWrite,
    Delete,
}

/// 监听源上报的原始事件，路径为绝对路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    pub kind: ChangeKind,
    pub is_dir: bool,
}

impl ChangeEvent {
    pub fn new(path: impl Into<PathBuf>, kind: ChangeKind, is_dir: bool) -> Self {
        Self {
            path: path.into(),
            kind,
            is_dir,
        }
    }
}

/// 同步任务，创建后不可修改，只被消费一次
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncTask {
    /// 扫描得出的动作，路径相对于同步根目录
    Action { path: PathBuf, action: SyncAction },
    /// 监听源的原始事件，由分发器分类
    Event(ChangeEvent),
}

/// 队列生产端
#[derive(Debug, Clone)]
pub struct TaskSender {
    tx: UnboundedSender<SyncTask>,
}

impl TaskSender {
    /// 追加任务；队列已随引擎释放时丢弃
    pub fn push(&self, task: SyncTask) {
        if let Err(e) = self.tx.send(task) {
            debug!("任务队列已关闭，丢弃任务: {:?}", e.0);
        }
    }

    pub fn push_action(&self, path: PathBuf, action: SyncAction) {
        self.push(SyncTask::Action { path, action })
    }
}

/// 队列消费端
#[derive(Debug)]
pub struct TaskQueue {
    rx: UnboundedReceiver<SyncTask>,
    tx: TaskSender,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            rx,
            tx: TaskSender { tx },
        }
    }

    pub fn sender(&self) -> TaskSender {
        self.tx.clone()
    }

    /// 非阻塞取出队首任务
    pub fn pop(&mut self) -> Option<SyncTask> {
        self.rx.try_recv().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_across_producers() {
        let mut queue = TaskQueue::new();
        let a = queue.sender();
        let b = queue.sender();

        a.push_action("x".into(), SyncAction::CopyToRemote);
        b.push(SyncTask::Event(ChangeEvent::new("/r/y", ChangeKind::Access, false)));
        a.push_action("z".into(), SyncAction::DeleteLocal);
        assert_eq!(queue.len(), 3);

        assert_eq!(
            queue.pop(),
            Some(SyncTask::Action {
                path: "x".into(),
                action: SyncAction::CopyToRemote
            })
        );
        assert!(matches!(queue.pop(), Some(SyncTask::Event(_))));
        assert!(matches!(
            queue.pop(),
            Some(SyncTask::Action {
                action: SyncAction::DeleteLocal,
                ..
            })
        ));
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_after_queue_dropped_is_discarded() {
        let queue = TaskQueue::new();
        let sender = queue.sender();
        drop(queue);
        sender.push_action("a".into(), SyncAction::LinkToRemote);
    }
}
