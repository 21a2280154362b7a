use crate::core::index::IndexEntry;

// 数据库表模型
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct IndexEntryRow {
    pub rel_path: String,
    pub target: String,
    pub size_bytes: i64,
    pub mtime_int: i64,
}

impl From<IndexEntryRow> for IndexEntry {
    /// target 列只用于查询，读回时总是由路径重新计算
    fn from(row: IndexEntryRow) -> Self {
        IndexEntry::new(&row.rel_path, row.size_bytes, row.mtime_int)
    }
}

impl From<&IndexEntry> for IndexEntryRow {
    fn from(entry: &IndexEntry) -> Self {
        Self {
            rel_path: entry.relative_path.clone(),
            target: entry.target.clone(),
            size_bytes: entry.size_bytes,
            mtime_int: entry.mtime_epoch,
        }
    }
}
