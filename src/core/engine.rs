use super::comparator::{
    compare_local_to_remote, scan_pull_candidates, CompareMode, CompareSummary, FolderResult,
    PullScanSummary, PullTargetResult,
};
use super::index::{FileIndex, IndexEntry};
use super::queue::QueueAction;
use super::remote_index::RemoteIndexSync;
use super::scanner::{FileScanner, ScanConfig, ScanProgress};
use super::target_state::TargetStateStore;
use crate::config::AppConfig;
use crate::db::IndexStore;
use crate::error::{Result, SyncError};
use crate::storage::{create_storage, LocalStorage, Storage};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

// ============ 公共常量 ============

/// 本地根目录下的私有目录，所有本地扫描都排除它
pub const PRIVATE_DIR: &str = ".capsync";
pub const LOCAL_INDEX_FILENAME: &str = "local_index.sqlite";
pub const LOGS_DIR: &str = "logs";
/// 远程回收站，按日期分目录
pub const TRASH_DIR: &str = "_Trash";
/// 远程平场目录
pub const FLATS_DIR: &str = "_FlatWizard";

/// 动作执行进度：已处理数、总数、当前文件
#[derive(Debug, Clone, Serialize)]
pub struct ActionProgress {
    pub processed: usize,
    pub total: usize,
    pub current_path: String,
}

impl ActionProgress {
    /// 总数为 0 时视为完成
    pub fn percent(&self) -> u8 {
        if self.total == 0 {
            100
        } else {
            ((self.processed.min(self.total) * 100) / self.total) as u8
        }
    }
}

/// 动作进度回调，不能阻塞
pub type ProgressFn<'a> = Option<&'a (dyn Fn(&ActionProgress) + Send + Sync)>;

pub(crate) fn report_progress(progress: ProgressFn<'_>, processed: usize, total: usize, path: &str) {
    if let Some(cb) = progress {
        cb(&ActionProgress {
            processed,
            total,
            current_path: path.to_string(),
        });
    }
}

/// 一棵文件树上的复制/跳过/错误计数
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferCounts {
    pub copied: usize,
    pub skipped: usize,
    pub errors: usize,
}

impl TransferCounts {
    pub fn processed(&self) -> usize {
        self.copied + self.skipped + self.errors
    }
}

/// 一次拉取/推送/删除的结果
///
/// 删除时 `copied_files` 是移到回收站的文件数。
#[derive(Debug, Clone, Serialize)]
pub struct ActionReport {
    pub target: String,
    pub action: QueueAction,
    pub total_files: usize,
    pub copied_files: usize,
    pub skipped_files: usize,
    pub error_files: usize,
    pub primary: TransferCounts,
    pub flats: TransferCounts,
    pub log_path: PathBuf,
}

impl ActionReport {
    pub(crate) fn new(
        target: &str,
        action: QueueAction,
        total_files: usize,
        primary: TransferCounts,
        flats: TransferCounts,
        log_path: &Path,
    ) -> Self {
        Self {
            target: target.to_string(),
            action,
            total_files,
            copied_files: primary.copied + flats.copied,
            skipped_files: primary.skipped + flats.skipped,
            error_files: primary.errors + flats.errors,
            primary,
            flats,
            log_path: log_path.to_path_buf(),
        }
    }

    pub fn success(&self) -> bool {
        self.error_files == 0
    }
}

/// 同步引擎
///
/// 同一时间只应有一个操作在运行：比较、扫描和队列执行都不会互相交错。
pub struct SyncEngine {
    local_root: PathBuf,
    pub(crate) local: Arc<dyn Storage>,
    pub(crate) remote: Arc<dyn Storage>,
    pub(crate) remote_index: RemoteIndexSync,
    local_scanner: FileScanner,
    states: TargetStateStore,
}

impl SyncEngine {
    /// 本地根目录必须已存在
    pub fn new(local_root: &Path, remote: Arc<dyn Storage>) -> Result<Self> {
        let local = LocalStorage::new(local_root).map_err(|e| {
            SyncError::Configuration(format!("本地根目录不可用: {:#}", e))
        })?;
        let local_root = local.base_path().to_path_buf();
        let private_dir = local_root.join(PRIVATE_DIR);

        Ok(Self {
            local: Arc::new(local),
            remote_index: RemoteIndexSync::new(remote.clone()),
            remote,
            local_scanner: FileScanner::with_config(ScanConfig {
                exclude_dirs: vec![PRIVATE_DIR.to_string()],
                exclude_files: vec![],
            }),
            states: TargetStateStore::new(&private_dir),
            local_root,
        })
    }

    /// 校验配置后连接远程存储
    pub async fn from_config(config: &AppConfig) -> Result<Self> {
        let (local_root, remote_config) = config.validate()?;
        let remote = create_storage(remote_config).await?;
        info!("同步引擎就绪: {} <-> {}", local_root.display(), remote.name());
        Self::new(local_root, remote)
    }

    pub fn local_root(&self) -> &Path {
        &self.local_root
    }

    pub fn private_dir(&self) -> PathBuf {
        self.local_root.join(PRIVATE_DIR)
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.private_dir().join(LOGS_DIR)
    }

    pub fn local_index_path(&self) -> PathBuf {
        self.private_dir().join(LOCAL_INDEX_FILENAME)
    }

    pub fn target_states(&self) -> &TargetStateStore {
        &self.states
    }

    pub fn remote_name(&self) -> &str {
        self.remote.name()
    }

    /// 完整重建本地索引并保存
    pub async fn refresh_local_index(&self, progress: ScanProgress<'_>) -> Result<FileIndex> {
        let outcome = self
            .local_scanner
            .build_index(self.local.as_ref(), progress)
            .await?;

        let store = IndexStore::open(&self.local_index_path()).await?;
        let saved = store.save(&outcome.index).await;
        store.close().await;
        saved?;

        info!("本地索引已更新: {} 个文件", outcome.index.len());
        Ok(outcome.index)
    }

    /// 本地文件在远程的备份情况
    pub async fn compare(
        &self,
        mode: CompareMode,
        progress: ScanProgress<'_>,
    ) -> Result<(Vec<FolderResult>, CompareSummary)> {
        let local = self.refresh_local_index(progress).await?;
        let remote = self.remote_index.fetch(false, progress).await?.load().await?;
        Ok(compare_local_to_remote(&local, &remote, mode))
    }

    /// 每个 target 的拉取状态和推荐动作
    pub async fn scan(
        &self,
        force_rebuild: bool,
        progress: ScanProgress<'_>,
    ) -> Result<(Vec<PullTargetResult>, PullScanSummary)> {
        let local = self.refresh_local_index(progress).await?;
        let remote = self
            .remote_index
            .fetch(force_rebuild, progress)
            .await?
            .load()
            .await?;
        let states = self.states.load();

        let (results, summary) = scan_pull_candidates(&local, &remote, &states);
        info!(
            "扫描完成: {} 个 target, {} 个需要处理, {} 个已是最新",
            summary.total_targets, summary.pull_candidates, summary.up_to_date_targets
        );
        Ok((results, summary))
    }

    /// 重建远程索引，返回文件数
    pub async fn rebuild_remote_index(&self, progress: ScanProgress<'_>) -> Result<usize> {
        self.remote_index.rebuild(progress).await
    }

    /// 手动记录拉取检查点
    pub fn mark_pulled(&self, target: &str, timestamp: Option<i64>) -> Result<i64> {
        check_target(target)?;
        self.states.mark_pulled(target, timestamp)
    }

    /// 按队列动作分发
    pub async fn execute(
        &self,
        target: &str,
        action: QueueAction,
        include_flats: bool,
        progress: ProgressFn<'_>,
    ) -> Result<ActionReport> {
        match action {
            QueueAction::Pull => self.pull(target, include_flats, progress).await,
            QueueAction::Push => self.push(target, progress).await,
            QueueAction::Delete => self.delete_to_trash(target, true, progress).await,
            QueueAction::DeleteForce => self.delete_to_trash(target, false, progress).await,
        }
    }

    /// 把拉取复制的文件写入本地索引；失败只记录，下次刷新会完整重建
    pub(crate) async fn upsert_local_index(&self, entries: &[IndexEntry]) {
        if entries.is_empty() {
            return;
        }
        let result: anyhow::Result<()> = async {
            let store = IndexStore::open(&self.local_index_path()).await?;
            let result = store.upsert(entries).await;
            store.close().await;
            result
        }
        .await;
        if let Err(e) = result {
            warn!("更新本地索引失败: {:#}", e);
        }
    }
}

/// target 必须是单个顶层目录名，下划线开头的回收站、平场等保留目录不能作为 target
pub(crate) fn check_target(target: &str) -> Result<()> {
    let invalid = target.is_empty()
        || target.starts_with('_')
        || target == "."
        || target == ".."
        || target.contains('/')
        || target.contains('\\')
        || target == PRIVATE_DIR;
    if invalid {
        return Err(SyncError::Precondition(format!("无效的 target: {:?}", target)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percent_is_complete_for_empty_runs() {
        let p = ActionProgress {
            processed: 0,
            total: 0,
            current_path: String::new(),
        };
        assert_eq!(p.percent(), 100);

        let p = ActionProgress {
            processed: 1,
            total: 3,
            current_path: "A/1.fits".to_string(),
        };
        assert_eq!(p.percent(), 33);
    }

    #[test]
    fn report_totals_add_both_trees() {
        let primary = TransferCounts {
            copied: 2,
            skipped: 1,
            errors: 0,
        };
        let flats = TransferCounts {
            copied: 1,
            skipped: 0,
            errors: 1,
        };
        let report = ActionReport::new("A", QueueAction::Pull, 5, primary, flats, Path::new("x.log"));
        assert_eq!(report.copied_files, 3);
        assert_eq!(report.error_files, 1);
        assert!(!report.success());
    }

    #[test]
    fn target_must_be_single_segment() {
        assert!(check_target("M31").is_ok());
        assert!(check_target("").is_err());
        assert!(check_target("A/B").is_err());
        assert!(check_target("..").is_err());
        assert!(check_target(PRIVATE_DIR).is_err());
        assert!(check_target(TRASH_DIR).is_err());
        assert!(check_target(FLATS_DIR).is_err());
    }
}
