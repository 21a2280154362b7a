//! 元数据索引
//!
//! 一个索引就是 `相对路径 -> (target, 大小, 修改时间)` 的映射，本地和远程各有一份。

use crate::storage::normalize_path;
use serde::{Deserialize, Serialize};
use std::collections::{btree_map, BTreeMap, BTreeSet};

/// 直接位于根目录下的文件所属的 target
pub const ROOT_TARGET: &str = "(root)";

/// 统一分隔符并去掉首尾的 `/`
pub fn normalize_rel_path(path: &str) -> String {
    normalize_path(path)
}

/// 相对路径的第一段就是 target（拍摄会话目录）
pub fn target_of(relative_path: &str) -> String {
    let path = normalize_rel_path(relative_path);
    match path.split_once('/') {
        Some((first, _)) => first.to_string(),
        None => ROOT_TARGET.to_string(),
    }
}

/// 一条索引记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub relative_path: String,
    pub target: String,
    pub size_bytes: i64,
    /// 秒级 Unix 时间戳
    pub mtime_epoch: i64,
}

impl IndexEntry {
    pub fn new(relative_path: &str, size_bytes: i64, mtime_epoch: i64) -> Self {
        let relative_path = normalize_rel_path(relative_path);
        Self {
            target: target_of(&relative_path),
            relative_path,
            size_bytes,
            mtime_epoch,
        }
    }

    /// 大小和秒级修改时间都一致
    pub fn same_content(&self, other: &IndexEntry) -> bool {
        self.size_bytes == other.size_bytes && self.mtime_epoch == other.mtime_epoch
    }
}

/// 内存中的索引，按相对路径排序
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    entries: BTreeMap<String, IndexEntry>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, relative_path: &str) -> Option<&IndexEntry> {
        self.entries.get(relative_path)
    }

    pub fn contains(&self, relative_path: &str) -> bool {
        self.entries.contains_key(relative_path)
    }

    /// 按路径插入或覆盖
    pub fn upsert(&mut self, entry: IndexEntry) {
        self.entries.insert(entry.relative_path.clone(), entry);
    }

    pub fn remove(&mut self, relative_path: &str) -> Option<IndexEntry> {
        self.entries.remove(relative_path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, IndexEntry> {
        self.entries.values()
    }

    /// 某个 target 下的全部记录
    pub fn entries_for<'a>(&'a self, target: &'a str) -> impl Iterator<Item = &'a IndexEntry> + 'a {
        self.entries.values().filter(move |e| e.target == target)
    }

    /// 出现过的全部 target
    pub fn targets(&self) -> BTreeSet<String> {
        self.entries.values().map(|e| e.target.clone()).collect()
    }
}

impl FromIterator<IndexEntry> for FileIndex {
    fn from_iter<I: IntoIterator<Item = IndexEntry>>(iter: I) -> Self {
        let mut index = FileIndex::new();
        for entry in iter {
            index.upsert(entry);
        }
        index
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_is_first_path_segment() {
        assert_eq!(target_of("M31_DATE_2024-01-05/lights/1.fits"), "M31_DATE_2024-01-05");
        assert_eq!(target_of("M31\\lights\\1.fits"), "M31");
        assert_eq!(target_of("readme.txt"), ROOT_TARGET);
        assert_eq!(target_of("/readme.txt"), ROOT_TARGET);
    }

    #[test]
    fn upsert_replaces_by_path() {
        let mut index = FileIndex::new();
        index.upsert(IndexEntry::new("A/1.fits", 10, 100));
        index.upsert(IndexEntry::new("A/1.fits", 20, 200));
        index.upsert(IndexEntry::new("B/2.fits", 5, 50));

        assert_eq!(index.len(), 2);
        assert_eq!(index.get("A/1.fits").map(|e| e.size_bytes), Some(20));
        assert_eq!(index.entries_for("B").count(), 1);
        assert_eq!(
            index.targets().into_iter().collect::<Vec<_>>(),
            vec!["A".to_string(), "B".to_string()]
        );
    }
}
