//! 把远程独有的文件移到按日期分目录的回收站

use super::engine::{
    check_target, report_progress, ActionReport, ProgressFn, SyncEngine, TransferCounts,
    TRASH_DIR,
};
use super::queue::QueueAction;
use super::remote_index::IndexMutation;
use super::run_log::{LogTag, RunLog};
use crate::error::{Result, SyncError};
use std::collections::BTreeSet;
use tracing::{debug, info, warn};

/// 同一天同一路径再次移入时覆盖之前的副本
pub fn trash_path(date: &str, relative_path: &str) -> String {
    format!("{}/{}/{}", TRASH_DIR, date, relative_path)
}

/// 从文件的父目录一直到 target 目录本身，按路径长度从长到短
fn dirs_to_check(target: &str, moved: &[String]) -> Vec<String> {
    let mut dirs = BTreeSet::new();
    for path in moved {
        let mut current = path.as_str();
        while let Some((parent, _)) = current.rsplit_once('/') {
            dirs.insert(parent.to_string());
            if parent == target {
                break;
            }
            current = parent;
        }
    }
    let mut dirs: Vec<String> = dirs.into_iter().collect();
    dirs.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    dirs
}

impl SyncEngine {
    /// 远程有、本地没有的文件移到 `_Trash/<日期>/`
    ///
    /// `require_checkpoint` 时必须先有成功拉取的记录，且只移动不晚于该记录的文件；
    /// 没有记录时直接失败，不做任何移动。否则移动全部远程独有文件。
    pub async fn delete_to_trash(
        &self,
        target: &str,
        require_checkpoint: bool,
        progress: ProgressFn<'_>,
    ) -> Result<ActionReport> {
        check_target(target)?;

        let last_pull = self.target_states().last_pull(target);
        if require_checkpoint && last_pull <= 0 {
            return Err(SyncError::Precondition(format!(
                "{} 没有成功拉取的记录，不能删除远程文件",
                target
            )));
        }

        let local = self.refresh_local_index(None).await?;
        let remote = self.remote_index.fetch(false, None).await?.load().await?;

        let candidates: Vec<String> = remote
            .entries_for(target)
            .filter(|e| !local.contains(&e.relative_path))
            .filter(|e| !require_checkpoint || e.mtime_epoch <= last_pull)
            .map(|e| e.relative_path.clone())
            .collect();

        let action = if require_checkpoint {
            QueueAction::Delete
        } else {
            QueueAction::DeleteForce
        };
        info!("开始移到回收站: {} ({} 个文件)", target, candidates.len());

        let mut log = RunLog::create(&self.logs_dir(), action.as_str(), target)?;
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        let total = candidates.len();
        let mut counts = TransferCounts::default();
        let mut moved = Vec::new();

        for (i, path) in candidates.iter().enumerate() {
            let dest = trash_path(&date, path);
            match self.move_to_trash(path, &dest).await {
                Ok(()) => {
                    counts.copied += 1;
                    log.moved(path, &dest);
                    moved.push(path.clone());
                }
                Err(e) => {
                    counts.errors += 1;
                    warn!("移动失败 {}: {:#}", path, e);
                    log.error(LogTag::Trash, path, &format!("{:#}", e));
                }
            }
            report_progress(progress, i + 1, total, path);
        }

        // 本地已不存在对应目录的空远程目录一并删除
        for dir in dirs_to_check(target, &moved) {
            if self.local_root().join(&dir).exists() {
                continue;
            }
            match self.remote.remove_empty_dir(&dir).await {
                Ok(true) => log.removed_dir(&dir),
                Ok(false) => debug!("目录非空，保留: {}", dir),
                Err(e) => warn!("删除空目录失败 {}: {:#}", dir, e),
            }
        }

        // 移动失败的文件也从索引中去掉，下次重建时会重新出现
        self.remote_index
            .apply(IndexMutation::Remove(candidates))
            .await?;

        let report = ActionReport::new(
            target,
            action,
            total,
            counts,
            TransferCounts::default(),
            log.path(),
        );
        log.summary(total, counts.copied, 0, counts.errors);
        info!(
            "回收站移动完成: {} 移动 {}, 错误 {}",
            target, counts.copied, counts.errors
        );
        Ok(report)
    }

    async fn move_to_trash(&self, path: &str, dest: &str) -> anyhow::Result<()> {
        if self.remote.exists(dest).await? {
            self.remote.delete(dest).await?;
        }
        self.remote.rename(path, dest).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dirs_walk_up_to_target_longest_first() {
        let moved = vec![
            "A/night1/lights/1.fits".to_string(),
            "A/night1/2.fits".to_string(),
            "A/3.fits".to_string(),
        ];
        assert_eq!(
            dirs_to_check("A", &moved),
            vec![
                "A/night1/lights".to_string(),
                "A/night1".to_string(),
                "A".to_string()
            ]
        );
    }

    #[test]
    fn trash_keeps_relative_path() {
        assert_eq!(
            trash_path("2024-01-05", "A/lights/1.fits"),
            "_Trash/2024-01-05/A/lights/1.fits"
        );
    }
}
