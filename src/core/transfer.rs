//! 拉取与推送
//!
//! 逐个文件顺序处理。大小和秒级修改时间都相同就跳过，否则整文件复制并保留修改时间。
//! 单个文件失败只计数、写日志，不中断本次运行。

use super::engine::{
    check_target, report_progress, ActionReport, ProgressFn, SyncEngine, TransferCounts,
    FLATS_DIR,
};
use super::index::IndexEntry;
use super::queue::QueueAction;
use super::remote_index::IndexMutation;
use super::run_log::{LogTag, RunLog};
use crate::error::{Result, SyncError};
use crate::storage::{FileInfo, Storage};
use tracing::{debug, info, warn};

/// 一棵待复制的文件树
struct TransferSet {
    tag: LogTag,
    files: Vec<FileInfo>,
    /// 列目录时无法读取的条目
    errors: Vec<String>,
}

/// 顺序复制过程中的共享状态
struct TransferRun<'a> {
    source: &'a dyn Storage,
    dest: &'a dyn Storage,
    log: &'a mut RunLog,
    progress: ProgressFn<'a>,
    processed: usize,
    total: usize,
    /// 已复制的文件，用于更新索引
    copied: Vec<IndexEntry>,
}

impl TransferRun<'_> {
    /// 把一棵树从 source 复制到 dest，返回这棵树的计数
    async fn run_set(&mut self, set: &TransferSet, missing_reason: &str) -> TransferCounts {
        let mut counts = TransferCounts::default();

        for error in &set.errors {
            counts.errors += 1;
            self.log.error(set.tag, error, "无法读取元数据");
            self.processed += 1;
            report_progress(self.progress, self.processed, self.total, error);
        }

        for file in &set.files {
            match self.transfer_file(set.tag, file, missing_reason).await {
                Ok(true) => counts.copied += 1,
                Ok(false) => counts.skipped += 1,
                Err(e) => {
                    counts.errors += 1;
                    warn!("传输失败 {}: {:#}", file.path, e);
                    self.log.error(set.tag, &file.path, &format!("{:#}", e));
                }
            }
            self.processed += 1;
            report_progress(self.progress, self.processed, self.total, &file.path);
        }

        counts
    }

    /// 返回是否复制
    async fn transfer_file(
        &mut self,
        tag: LogTag,
        file: &FileInfo,
        missing_reason: &str,
    ) -> anyhow::Result<bool> {
        let reason = match self.dest.stat(&file.path).await? {
            Some(meta) if meta.same_as(file.size, file.modified_time) => {
                debug!("跳过相同文件: {}", file.path);
                self.log.skip(tag, &file.path);
                return Ok(false);
            }
            Some(_) => "size+mtime differ",
            None => missing_reason,
        };

        let data = self.source.read(&file.path).await?;
        self.dest.write(&file.path, data).await?;
        self.log.copy(tag, &file.path, reason);

        // 目标端不能设置修改时间时，索引记录实际写入后的值
        let (size, mtime) = if self.dest.set_modified(&file.path, file.modified_time).await? {
            (file.size, file.modified_time)
        } else {
            self.log.mtime_not_preserved(tag, &file.path);
            match self.dest.stat(&file.path).await? {
                Some(meta) => (meta.size, meta.modified_time),
                None => (file.size, file.modified_time),
            }
        };

        self.copied.push(IndexEntry::new(&file.path, size as i64, mtime));
        Ok(true)
    }
}

/// 列出 prefix 下的所有普通文件，按路径排序
async fn list_set(storage: &dyn Storage, prefix: &str, tag: LogTag) -> Result<TransferSet> {
    let listing = storage.list_files(Some(prefix)).await?;
    let mut files: Vec<FileInfo> = listing.files.into_iter().filter(|f| !f.is_dir).collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(TransferSet {
        tag,
        files,
        errors: listing.errors,
    })
}

impl SyncEngine {
    /// 把远程 target 拉到本地
    ///
    /// `include_flats` 时，target 下每个顶层子目录如果在 `_FlatWizard` 下有同名目录，也一并拉取。
    pub async fn pull(
        &self,
        target: &str,
        include_flats: bool,
        progress: ProgressFn<'_>,
    ) -> Result<ActionReport> {
        check_target(target)?;
        info!("开始拉取: {} (平场: {})", target, include_flats);

        let mut log = RunLog::create(&self.logs_dir(), "pull", target)?;

        let primary = list_set(self.remote.as_ref(), target, LogTag::Primary).await?;
        if primary.files.is_empty() && primary.errors.is_empty() {
            warn!("远程 target 为空或不存在: {}", target);
        }

        let mut flat_sets = Vec::new();
        if include_flats {
            for sub in self.flat_sources(target).await {
                flat_sets.push(list_set(self.remote.as_ref(), &sub, LogTag::Flats).await?);
            }
        }

        let total = primary.files.len()
            + primary.errors.len()
            + flat_sets
                .iter()
                .map(|s| s.files.len() + s.errors.len())
                .sum::<usize>();

        self.local.create_dir(target).await?;

        let mut run = TransferRun {
            source: self.remote.as_ref(),
            dest: self.local.as_ref(),
            log: &mut log,
            progress,
            processed: 0,
            total,
            copied: Vec::new(),
        };

        let primary_counts = run.run_set(&primary, "missing locally").await;
        let mut flats_counts = TransferCounts::default();
        for set in &flat_sets {
            let counts = run.run_set(set, "missing locally").await;
            flats_counts.copied += counts.copied;
            flats_counts.skipped += counts.skipped;
            flats_counts.errors += counts.errors;
        }
        let copied = std::mem::take(&mut run.copied);

        self.upsert_local_index(&copied).await;

        let report = ActionReport::new(
            target,
            QueueAction::Pull,
            total,
            primary_counts,
            flats_counts,
            log.path(),
        );
        log.summary(
            report.total_files,
            report.copied_files,
            report.skipped_files,
            report.error_files,
        );
        info!(
            "拉取完成: {} 复制 {}, 跳过 {}, 错误 {}",
            target, report.copied_files, report.skipped_files, report.error_files
        );
        Ok(report)
    }

    /// 与 target 顶层子目录同名、且在远程存在的平场目录
    async fn flat_sources(&self, target: &str) -> Vec<String> {
        let entries = match self.remote.list_dir(target).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("列出 target 子目录失败 {}: {:#}", target, e);
                return Vec::new();
            }
        };

        let mut sources = Vec::new();
        for entry in entries.iter().filter(|e| e.is_dir) {
            let name = match entry.path.rsplit('/').next() {
                Some(n) if !n.is_empty() => n,
                _ => continue,
            };
            let flat_dir = format!("{}/{}", FLATS_DIR, name);
            match self.remote.stat(&flat_dir).await {
                Ok(Some(meta)) if meta.is_dir => sources.push(flat_dir),
                Ok(_) => debug!("没有对应的平场目录: {}", flat_dir),
                Err(e) => warn!("检查平场目录失败 {}: {:#}", flat_dir, e),
            }
        }
        sources.sort();
        sources
    }

    /// 把本地 target 推送到远程，并增量更新远程索引
    pub async fn push(&self, target: &str, progress: ProgressFn<'_>) -> Result<ActionReport> {
        check_target(target)?;

        match self.local.stat(target).await? {
            Some(meta) if meta.is_dir => {}
            _ => {
                return Err(SyncError::NotFound(format!(
                    "本地 target 不存在: {}",
                    self.local_root().join(target).display()
                )))
            }
        }
        info!("开始推送: {}", target);

        let mut log = RunLog::create(&self.logs_dir(), "push", target)?;

        let listing = self.local.list_files(Some(target)).await?;
        let mut dirs: Vec<String> = listing
            .files
            .iter()
            .filter(|f| f.is_dir)
            .map(|f| f.path.clone())
            .collect();
        dirs.push(target.to_string());
        dirs.sort();
        for dir in &dirs {
            if let Err(e) = self.remote.create_dir(dir).await {
                warn!("创建远程目录失败 {}: {:#}", dir, e);
            }
        }

        let mut files: Vec<FileInfo> = listing.files.into_iter().filter(|f| !f.is_dir).collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        let set = TransferSet {
            tag: LogTag::Push,
            files,
            errors: listing.errors,
        };
        let total = set.files.len() + set.errors.len();

        let mut run = TransferRun {
            source: self.local.as_ref(),
            dest: self.remote.as_ref(),
            log: &mut log,
            progress,
            processed: 0,
            total,
            copied: Vec::new(),
        };
        let counts = run.run_set(&set, "missing on remote").await;
        let copied = std::mem::take(&mut run.copied);

        let report = ActionReport::new(
            target,
            QueueAction::Push,
            total,
            counts,
            TransferCounts::default(),
            log.path(),
        );
        log.summary(
            report.total_files,
            report.copied_files,
            report.skipped_files,
            report.error_files,
        );

        self.remote_index
            .apply(IndexMutation::Upsert(copied))
            .await?;

        info!(
            "推送完成: {} 复制 {}, 跳过 {}, 错误 {}",
            target, report.copied_files, report.skipped_files, report.error_files
        );
        Ok(report)
    }
}
