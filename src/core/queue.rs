//! 动作队列
//!
//! 调用方把 target 和动作放进队列，`QueueRunner` 逐个顺序执行并通过通道发出事件。

use super::engine::{ActionProgress, ActionReport, SyncEngine, TransferCounts};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::sync::mpsc;
use tracing::{error, info};

/// 队列动作
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Pull,
    Push,
    /// 需要拉取检查点的删除
    Delete,
    /// 不检查检查点的删除
    DeleteForce,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Pull => "pull",
            QueueAction::Push => "push",
            QueueAction::Delete => "delete",
            QueueAction::DeleteForce => "delete_force",
        }
    }
}

impl fmt::Display for QueueAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QueueAction {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pull" => Ok(QueueAction::Pull),
            "push" => Ok(QueueAction::Push),
            "delete" => Ok(QueueAction::Delete),
            "delete_force" => Ok(QueueAction::DeleteForce),
            other => Err(SyncError::UnknownAction(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub enum QueueItemStatus {
    #[default]
    Queued,
    Running,
    Done,
    #[serde(rename = "Done with errors")]
    DoneWithErrors,
    Failed,
}

impl fmt::Display for QueueItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            QueueItemStatus::Queued => "Queued",
            QueueItemStatus::Running => "Running",
            QueueItemStatus::Done => "Done",
            QueueItemStatus::DoneWithErrors => "Done with errors",
            QueueItemStatus::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// 队列项的执行状态，每次运行前重置
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueItemState {
    pub status: QueueItemStatus,
    pub progress_percent: u8,
    pub total: usize,
    pub copied: usize,
    pub skipped: usize,
    pub errors: usize,
    pub primary: TransferCounts,
    pub flats: TransferCounts,
    pub log_path: Option<PathBuf>,
}

impl QueueItemState {
    fn finish(&mut self, report: &ActionReport) {
        self.status = if report.success() {
            QueueItemStatus::Done
        } else {
            QueueItemStatus::DoneWithErrors
        };
        self.progress_percent = 100;
        self.total = report.total_files;
        self.copied = report.copied_files;
        self.skipped = report.skipped_files;
        self.errors = report.error_files;
        self.primary = report.primary;
        self.flats = report.flats;
        self.log_path = Some(report.log_path.clone());
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QueueItem {
    pub target: String,
    pub action: QueueAction,
    pub include_flats: bool,
    pub state: QueueItemState,
}

/// 队列文件中的一项，动作名稍后解析
#[derive(Debug, Deserialize)]
struct RawQueueItem {
    target: String,
    action: String,
    #[serde(default)]
    include_flats: bool,
}

impl QueueItem {
    pub fn new(target: &str, action: QueueAction, include_flats: bool) -> Self {
        Self {
            target: target.to_string(),
            action,
            include_flats,
            state: QueueItemState::default(),
        }
    }
}

/// 等待执行的队列
#[derive(Debug, Clone, Default)]
pub struct ActionQueue {
    items: Vec<QueueItem>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// 从 JSON 数组解析，未知的动作直接报错，整个队列都不会执行
    pub fn from_json(content: &str) -> Result<Self> {
        let raw: Vec<RawQueueItem> = serde_json::from_str(content)?;
        let mut queue = Self::new();
        for item in raw {
            let action = item.action.parse()?;
            queue.enqueue(&item.target, action, item.include_flats);
        }
        Ok(queue)
    }

    pub fn load(path: &Path) -> Result<Self> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }

    /// 已在队列中的 target 只更新动作和选项，返回是否新增
    pub fn enqueue(&mut self, target: &str, action: QueueAction, include_flats: bool) -> bool {
        if let Some(existing) = self.items.iter_mut().find(|i| i.target == target) {
            existing.action = action;
            existing.include_flats = include_flats;
            info!("{} 已在队列中，更新为 {}", target, action);
            return false;
        }
        self.items.push(QueueItem::new(target, action, include_flats));
        true
    }

    pub fn remove(&mut self, index: usize) -> Option<QueueItem> {
        if index < self.items.len() {
            Some(self.items.remove(index))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    /// 重置所有执行状态
    pub fn reset(&mut self) {
        for item in &mut self.items {
            item.state = QueueItemState::default();
        }
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn items_mut(&mut self) -> &mut [QueueItem] {
        &mut self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// 队列执行事件
#[derive(Debug, Clone)]
pub enum QueueEvent {
    /// 开始处理 current，之后是 next
    Position {
        current: String,
        next: Option<String>,
    },
    ItemProgress {
        target: String,
        processed: usize,
        total: usize,
    },
    ItemFinished {
        target: String,
        report: ActionReport,
    },
    Failed {
        target: String,
        message: String,
    },
    /// 总是最后一个事件
    Finished,
}

/// 顺序执行队列
pub struct QueueRunner<'a> {
    engine: &'a SyncEngine,
}

impl<'a> QueueRunner<'a> {
    pub fn new(engine: &'a SyncEngine) -> Self {
        Self { engine }
    }

    /// 逐项执行。某一项出错时停止整个队列；无论结果如何都会发出 `Finished`
    pub async fn run(
        &self,
        items: &mut [QueueItem],
        events: &mpsc::UnboundedSender<QueueEvent>,
    ) -> Result<()> {
        for item in items.iter_mut() {
            item.state = QueueItemState::default();
        }
        let result = self.run_items(items, events).await;
        let _ = events.send(QueueEvent::Finished);
        result
    }

    async fn run_items(
        &self,
        items: &mut [QueueItem],
        events: &mpsc::UnboundedSender<QueueEvent>,
    ) -> Result<()> {
        for i in 0..items.len() {
            let next = items.get(i + 1).map(|n| n.target.clone());
            let item = &mut items[i];
            let target = item.target.clone();

            let _ = events.send(QueueEvent::Position {
                current: target.clone(),
                next,
            });
            item.state.status = QueueItemStatus::Running;
            info!("队列执行: {} {}", item.action, target);

            let progress = |p: &ActionProgress| {
                let _ = events.send(QueueEvent::ItemProgress {
                    target: target.clone(),
                    processed: p.processed,
                    total: p.total,
                });
            };

            let outcome = self
                .engine
                .execute(&target, item.action, item.include_flats, Some(&progress))
                .await;

            match outcome {
                Ok(report) => {
                    if report.action == QueueAction::Pull && report.success() {
                        if let Err(e) = self.engine.mark_pulled(&target, None) {
                            item.state.status = QueueItemStatus::Failed;
                            return Err(self.fail(events, &target, e));
                        }
                    }
                    item.state.finish(&report);
                    let _ = events.send(QueueEvent::ItemFinished { target, report });
                }
                Err(e) => {
                    item.state.status = QueueItemStatus::Failed;
                    return Err(self.fail(events, &target, e));
                }
            }
        }
        Ok(())
    }

    fn fail(
        &self,
        events: &mpsc::UnboundedSender<QueueEvent>,
        target: &str,
        e: SyncError,
    ) -> SyncError {
        error!("队列在 {} 处停止: {}", target, e);
        let _ = events.send(QueueEvent::Failed {
            target: target.to_string(),
            message: e.to_string(),
        });
        e
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_updates_existing_target() {
        let mut queue = ActionQueue::new();
        assert!(queue.enqueue("A", QueueAction::Pull, false));
        assert!(queue.enqueue("B", QueueAction::Push, false));
        assert!(!queue.enqueue("A", QueueAction::Pull, true));

        assert_eq!(queue.len(), 2);
        assert!(queue.items()[0].include_flats);

        queue.items_mut()[0].state.status = QueueItemStatus::Done;
        queue.reset();
        assert_eq!(queue.items()[0].state.status, QueueItemStatus::Queued);

        assert_eq!(queue.remove(1).map(|i| i.target), Some("B".to_string()));
        assert!(queue.remove(5).is_none());
        queue.clear();
        assert!(queue.is_empty());
    }

    #[test]
    fn unknown_action_rejected_when_parsing() {
        let err = ActionQueue::from_json(r#"[{"target":"A","action":"pull"},{"target":"B","action":"explode"}]"#)
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownAction(ref a) if a == "explode"));

        let queue = ActionQueue::from_json(
            r#"[{"target":"A","action":"delete_force"},{"target":"B","action":"pull","include_flats":true}]"#,
        )
        .unwrap();
        assert_eq!(queue.items()[0].action, QueueAction::DeleteForce);
        assert!(queue.items()[1].include_flats);
    }

    #[test]
    fn status_display_strings() {
        assert_eq!(QueueItemStatus::DoneWithErrors.to_string(), "Done with errors");
        assert_eq!("push".parse::<QueueAction>().unwrap(), QueueAction::Push);
    }
}
