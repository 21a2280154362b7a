//! 本地索引与远程索引的比较
//!
//! 只比较大小和秒级修改时间，从不读取文件内容。所有结果都是每次重新计算的值，不做持久化。

use super::index::{FileIndex, IndexEntry};
use super::queue::QueueAction;
use super::target_state::TargetStates;
use chrono::NaiveDate;
use regex::Regex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// 表示中间处理结果的路径标记，区分大小写
pub const WIP_MARKERS: &[&str] = &["WBPP", "Processing"];

pub fn is_wip_path(relative_path: &str) -> bool {
    WIP_MARKERS.iter().any(|m| relative_path.contains(m))
}

/// 比较模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompareMode {
    /// 只比较原始图像（排除 WIP 路径）
    #[default]
    Images,
    /// 只比较 WIP 路径
    Wip,
}

impl CompareMode {
    pub fn includes(&self, relative_path: &str) -> bool {
        match self {
            CompareMode::Images => !is_wip_path(relative_path),
            CompareMode::Wip => is_wip_path(relative_path),
        }
    }
}

/// 同一路径两侧记录的关系
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileRelation {
    /// 大小和修改时间都相同
    Equal,
    /// 另一侧没有
    Missing,
    /// 大小或修改时间不同
    Different,
}

pub fn relation(entry: &IndexEntry, other: Option<&IndexEntry>) -> FileRelation {
    match other {
        None => FileRelation::Missing,
        Some(o) if entry.same_content(o) => FileRelation::Equal,
        Some(_) => FileRelation::Different,
    }
}

// ============ 本地 -> 远程 备份检查 ============

/// 一个本地顶层目录的备份情况
#[derive(Debug, Clone, Default, Serialize)]
pub struct FolderResult {
    pub folder: String,
    pub local_files: usize,
    pub backed_up_files: usize,
    pub missing_on_remote_files: usize,
    pub different_files: usize,
}

impl FolderResult {
    /// 所有本地文件都在远程有相同的副本
    pub fn safe_to_delete(&self) -> bool {
        self.local_files > 0 && self.missing_on_remote_files == 0 && self.different_files == 0
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CompareSummary {
    pub total_local_files: usize,
    pub total_backed_up_files: usize,
    pub total_missing_on_remote_files: usize,
    pub total_different_files: usize,
}

/// 按顶层目录统计本地文件在远程的备份情况
pub fn compare_local_to_remote(
    local: &FileIndex,
    remote: &FileIndex,
    mode: CompareMode,
) -> (Vec<FolderResult>, CompareSummary) {
    let mut folders: HashMap<&str, FolderResult> = HashMap::new();

    for entry in local.iter().filter(|e| mode.includes(&e.relative_path)) {
        let folder = folders
            .entry(entry.target.as_str())
            .or_insert_with(|| FolderResult {
                folder: entry.target.clone(),
                ..Default::default()
            });
        folder.local_files += 1;

        match relation(entry, remote.get(&entry.relative_path)) {
            FileRelation::Equal => folder.backed_up_files += 1,
            FileRelation::Missing => folder.missing_on_remote_files += 1,
            FileRelation::Different => folder.different_files += 1,
        }
    }

    let mut results: Vec<FolderResult> = folders.into_values().collect();
    results.sort_by(|a, b| {
        a.folder
            .to_lowercase()
            .cmp(&b.folder.to_lowercase())
            .then_with(|| a.folder.cmp(&b.folder))
    });

    let summary = CompareSummary {
        total_local_files: results.iter().map(|r| r.local_files).sum(),
        total_backed_up_files: results.iter().map(|r| r.backed_up_files).sum(),
        total_missing_on_remote_files: results.iter().map(|r| r.missing_on_remote_files).sum(),
        total_different_files: results.iter().map(|r| r.different_files).sum(),
    };

    (results, summary)
}

// ============ 远程 -> 本地 拉取检查 ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TargetStatus {
    #[serde(rename = "Empty on remote")]
    EmptyOnRemote,
    #[serde(rename = "Not pulled")]
    NotPulled,
    #[serde(rename = "Partially pulled")]
    PartiallyPulled,
    #[serde(rename = "Local differs")]
    LocalDiffers,
    #[serde(rename = "Up to date")]
    UpToDate,
}

impl TargetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TargetStatus::EmptyOnRemote => "Empty on remote",
            TargetStatus::NotPulled => "Not pulled",
            TargetStatus::PartiallyPulled => "Partially pulled",
            TargetStatus::LocalDiffers => "Local differs",
            TargetStatus::UpToDate => "Up to date",
        }
    }
}

impl fmt::Display for TargetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RecommendedAction {
    #[serde(rename = "Delete on remote (trash)")]
    DeleteOnRemote,
    #[serde(rename = "Pull to local")]
    PullToLocal,
    #[serde(rename = "Push to remote")]
    PushToRemote,
    #[serde(rename = "No action")]
    NoAction,
}

impl RecommendedAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecommendedAction::DeleteOnRemote => "Delete on remote (trash)",
            RecommendedAction::PullToLocal => "Pull to local",
            RecommendedAction::PushToRemote => "Push to remote",
            RecommendedAction::NoAction => "No action",
        }
    }

    /// 对应的队列动作，"No action" 没有
    pub fn queue_action(&self) -> Option<QueueAction> {
        match self {
            RecommendedAction::DeleteOnRemote => Some(QueueAction::Delete),
            RecommendedAction::PullToLocal => Some(QueueAction::Pull),
            RecommendedAction::PushToRemote => Some(QueueAction::Push),
            RecommendedAction::NoAction => None,
        }
    }
}

impl fmt::Display for RecommendedAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 从 `DATE_YYYY-MM-DD...` 形式的 target 名中取出拍摄日期
pub fn session_date(target: &str) -> Option<NaiveDate> {
    let re = Regex::new(r"^DATE_(\d{4}-\d{2}-\d{2})").ok()?;
    let caps = re.captures(target)?;
    NaiveDate::parse_from_str(caps.get(1)?.as_str(), "%Y-%m-%d").ok()
}

/// 一个 target 在两侧的对比结果
#[derive(Debug, Clone, Default, Serialize)]
pub struct PullTargetResult {
    pub target: String,
    pub session_date: Option<NaiveDate>,
    pub remote_files: usize,
    pub local_files: usize,
    pub matched_files: usize,
    pub missing_locally_files: usize,
    pub different_files: usize,
    pub local_only_files: usize,
    pub wip_local_only_files: usize,
    /// 远程独有文件中最新的修改时间
    pub missing_latest_mtime: i64,
    /// 最近一次成功拉取，0 表示没有
    pub last_pull_epoch: i64,
}

impl PullTargetResult {
    fn new(target: &str) -> Self {
        Self {
            target: target.to_string(),
            session_date: session_date(target),
            ..Default::default()
        }
    }

    /// 按顺序判断，第一个命中的为准
    pub fn status(&self) -> TargetStatus {
        if self.remote_files == 0 {
            TargetStatus::EmptyOnRemote
        } else if self.local_files == 0 && self.missing_locally_files > 0 {
            TargetStatus::NotPulled
        } else if self.missing_locally_files > 0 {
            TargetStatus::PartiallyPulled
        } else if self.different_files > 0 {
            TargetStatus::LocalDiffers
        } else {
            TargetStatus::UpToDate
        }
    }

    /// 远程独有的文件如果都不晚于上次拉取，说明是本地有意删除的，可以移到回收站
    pub fn recommended_action(&self) -> RecommendedAction {
        if self.missing_locally_files > 0 {
            if self.last_pull_epoch > 0 && self.missing_latest_mtime <= self.last_pull_epoch {
                RecommendedAction::DeleteOnRemote
            } else {
                RecommendedAction::PullToLocal
            }
        } else if self.local_only_files > 0 {
            RecommendedAction::PushToRemote
        } else if self.status() == TargetStatus::LocalDiffers {
            RecommendedAction::PullToLocal
        } else {
            RecommendedAction::NoAction
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PullScanSummary {
    pub total_targets: usize,
    /// 推荐动作不是 "No action" 的 target 数
    pub pull_candidates: usize,
    pub up_to_date_targets: usize,
}

/// 下划线开头的顶层目录（回收站、平场等）不参与比较
fn is_reserved_target(target: &str) -> bool {
    target.starts_with('_')
}

/// 按 target 合并两侧索引
pub fn scan_pull_candidates(
    local: &FileIndex,
    remote: &FileIndex,
    states: &TargetStates,
) -> (Vec<PullTargetResult>, PullScanSummary) {
    let mut results: BTreeMap<String, PullTargetResult> = BTreeMap::new();

    for entry in remote.iter() {
        if is_reserved_target(&entry.target) {
            continue;
        }
        let result = results
            .entry(entry.target.clone())
            .or_insert_with(|| PullTargetResult::new(&entry.target));
        result.remote_files += 1;

        match relation(entry, local.get(&entry.relative_path)) {
            FileRelation::Missing => {
                result.missing_locally_files += 1;
                result.missing_latest_mtime = result.missing_latest_mtime.max(entry.mtime_epoch);
            }
            FileRelation::Equal => result.matched_files += 1,
            FileRelation::Different => result.different_files += 1,
        }
    }

    for entry in local.iter() {
        if is_reserved_target(&entry.target) {
            continue;
        }
        let result = results
            .entry(entry.target.clone())
            .or_insert_with(|| PullTargetResult::new(&entry.target));
        result.local_files += 1;

        if !remote.contains(&entry.relative_path) {
            result.local_only_files += 1;
            if is_wip_path(&entry.relative_path) {
                result.wip_local_only_files += 1;
            }
        }
    }

    let mut ordered: Vec<PullTargetResult> = results
        .into_values()
        .map(|mut r| {
            r.last_pull_epoch = states.last_pull(&r.target);
            r
        })
        .collect();
    ordered.sort_by(|a, b| {
        a.target
            .to_lowercase()
            .cmp(&b.target.to_lowercase())
            .then_with(|| a.target.cmp(&b.target))
    });

    let summary = PullScanSummary {
        total_targets: ordered.len(),
        pull_candidates: ordered
            .iter()
            .filter(|r| r.recommended_action() != RecommendedAction::NoAction)
            .count(),
        up_to_date_targets: ordered
            .iter()
            .filter(|r| r.status() == TargetStatus::UpToDate)
            .count(),
    };

    (ordered, summary)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index(entries: &[(&str, i64, i64)]) -> FileIndex {
        entries
            .iter()
            .map(|(p, s, m)| IndexEntry::new(p, *s, *m))
            .collect()
    }

    fn missing(count: usize, latest: i64, checkpoint: i64) -> PullTargetResult {
        PullTargetResult {
            target: "A".to_string(),
            remote_files: count,
            local_files: 1,
            missing_locally_files: count,
            missing_latest_mtime: latest,
            last_pull_epoch: checkpoint,
            ..Default::default()
        }
    }

    #[test]
    fn wip_markers_are_case_sensitive() {
        assert!(is_wip_path("M31/WBPP/master.xisf"));
        assert!(is_wip_path("M31/Processing/x.fits"));
        assert!(!is_wip_path("M31/processing/x.fits"));
        assert!(CompareMode::Images.includes("M31/lights/1.fits"));
        assert!(!CompareMode::Wip.includes("M31/lights/1.fits"));
    }

    #[test]
    fn recommendation_uses_checkpoint() {
        let r = missing(3, 500, 1000);
        assert_eq!(r.recommended_action(), RecommendedAction::DeleteOnRemote);
        assert_eq!(r.recommended_action().to_string(), "Delete on remote (trash)");

        let r = missing(3, 1500, 1000);
        assert_eq!(r.recommended_action(), RecommendedAction::PullToLocal);

        let r = missing(3, 500, 0);
        assert_eq!(r.recommended_action(), RecommendedAction::PullToLocal);
    }

    #[test]
    fn status_table_first_match_wins() {
        let mut r = PullTargetResult::new("A");
        assert_eq!(r.status(), TargetStatus::EmptyOnRemote);

        r.remote_files = 2;
        r.missing_locally_files = 2;
        assert_eq!(r.status(), TargetStatus::NotPulled);

        r.local_files = 1;
        assert_eq!(r.status(), TargetStatus::PartiallyPulled);

        r.missing_locally_files = 0;
        r.different_files = 1;
        assert_eq!(r.status(), TargetStatus::LocalDiffers);
        assert_eq!(r.recommended_action(), RecommendedAction::PullToLocal);

        r.different_files = 0;
        r.local_only_files = 1;
        assert_eq!(r.status(), TargetStatus::UpToDate);
        assert_eq!(r.recommended_action(), RecommendedAction::PushToRemote);
        assert_eq!(r.recommended_action().queue_action(), Some(QueueAction::Push));
    }

    #[test]
    fn partially_pulled_target() {
        let local = index(&[("A/1.fits", 100, 1000)]);
        let remote = index(&[("A/1.fits", 100, 1000), ("A/2.fits", 50, 2000)]);

        let (results, summary) = scan_pull_candidates(&local, &remote, &TargetStates::default());
        assert_eq!(results.len(), 1);
        let a = &results[0];
        assert_eq!(a.target, "A");
        assert_eq!(a.remote_files, 2);
        assert_eq!(a.local_files, 1);
        assert_eq!(a.matched_files, 1);
        assert_eq!(a.missing_locally_files, 1);
        assert_eq!(a.missing_latest_mtime, 2000);
        assert_eq!(a.status().as_str(), "Partially pulled");
        assert_eq!(a.recommended_action().as_str(), "Pull to local");
        assert_eq!(summary.pull_candidates, 1);
    }

    #[test]
    fn reserved_targets_are_skipped_and_local_only_counted() {
        let local = index(&[
            ("b/1.fits", 1, 1),
            ("b/WBPP/m.xisf", 1, 1),
            ("_FlatWizard/L/f.fits", 1, 1),
        ]);
        let remote = index(&[("b/1.fits", 1, 1), ("_Trash/2024-01-01/x", 1, 1)]);
        let mut states = TargetStates::default();
        states.last_successful_pull.insert("b".to_string(), 42);

        let (results, _) = scan_pull_candidates(&local, &remote, &states);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].local_only_files, 1);
        assert_eq!(results[0].wip_local_only_files, 1);
        assert_eq!(results[0].last_pull_epoch, 42);
    }

    #[test]
    fn folders_sorted_case_insensitively() {
        let local = index(&[
            ("beta/1.fits", 10, 10),
            ("Alpha/1.fits", 10, 10),
            ("Alpha/2.fits", 10, 10),
            ("Alpha/WBPP/3.fits", 10, 10),
        ]);
        let remote = index(&[("Alpha/1.fits", 10, 10), ("Alpha/2.fits", 10, 11)]);

        let (results, summary) = compare_local_to_remote(&local, &remote, CompareMode::Images);
        let names: Vec<_> = results.iter().map(|r| r.folder.as_str()).collect();
        assert_eq!(names, vec!["Alpha", "beta"]);
        assert_eq!(results[0].backed_up_files, 1);
        assert_eq!(results[0].different_files, 1);
        assert!(!results[0].safe_to_delete());
        assert_eq!(results[1].missing_on_remote_files, 1);
        assert_eq!(summary.total_local_files, 3);
    }

    #[test]
    fn session_date_parsed_from_prefix() {
        assert_eq!(
            session_date("DATE_2024-01-05_M31"),
            NaiveDate::from_ymd_opt(2024, 1, 5)
        );
        assert_eq!(session_date("M31_DATE_2024-01-05"), None);
    }
}
