//! 索引数据库
//!
//! 本地索引和远程索引使用同一个表结构。使用回滚日志而不是 WAL，
//! 关闭之后数据库就是一个可以直接上传的单文件。

pub mod models;
pub use models::*;

use crate::core::index::{FileIndex, IndexEntry};
use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS file_index (
        rel_path TEXT PRIMARY KEY,
        target TEXT NOT NULL,
        size_bytes INTEGER NOT NULL,
        mtime_int INTEGER NOT NULL
    )
    "#,
    "CREATE INDEX IF NOT EXISTS idx_file_index_target ON file_index(target)",
];

/// 打开的索引数据库
pub struct IndexStore {
    pool: SqlitePool,
    path: PathBuf,
}

impl IndexStore {
    /// 打开（不存在则创建）数据库并确保表结构
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete);

        // 单连接：同一时间只有一个写入者，关闭后文件立即可用
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await
            .with_context(|| format!("打开索引数据库失败: {}", path.display()))?;

        let store = Self {
            pool,
            path: path.to_path_buf(),
        };
        store.ensure_schema().await?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// 读出全部记录
    pub async fn load(&self) -> Result<FileIndex> {
        let rows = sqlx::query_as::<_, IndexEntryRow>(
            "SELECT rel_path, target, size_bytes, mtime_int FROM file_index",
        )
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("读取索引失败: {}", self.path.display()))?;

        Ok(rows.into_iter().map(IndexEntry::from).collect())
    }

    /// 用给定索引整体替换表内容
    pub async fn save(&self, index: &FileIndex) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM file_index")
            .execute(&mut *tx)
            .await?;
        for entry in index.iter() {
            Self::insert(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// 按路径插入或更新
    pub async fn upsert(&self, entries: &[IndexEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for entry in entries {
            Self::insert(&mut tx, entry).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn delete(&self, relative_paths: &[String]) -> Result<()> {
        if relative_paths.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for path in relative_paths {
            sqlx::query("DELETE FROM file_index WHERE rel_path = ?")
                .bind(path)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn count(&self) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM file_index")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// 关闭连接池，之后可以安全地复制或删除数据库文件
    pub async fn close(self) {
        self.pool.close().await;
    }

    async fn insert(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        entry: &IndexEntry,
    ) -> Result<()> {
        let row = IndexEntryRow::from(entry);
        sqlx::query(
            r#"
            INSERT INTO file_index (rel_path, target, size_bytes, mtime_int)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(rel_path) DO UPDATE SET
                target = excluded.target,
                size_bytes = excluded.size_bytes,
                mtime_int = excluded.mtime_int
            "#,
        )
        .bind(&row.rel_path)
        .bind(&row.target)
        .bind(row.size_bytes)
        .bind(row.mtime_int)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn save_load_and_mutate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index.sqlite");

        let store = IndexStore::open(&path).await.unwrap();
        let index: FileIndex = vec![
            IndexEntry::new("A/1.fits", 10, 100),
            IndexEntry::new("A/2.fits", 20, 200),
        ]
        .into_iter()
        .collect();
        store.save(&index).await.unwrap();

        store
            .upsert(&[IndexEntry::new("B/3.fits", 30, 300)])
            .await
            .unwrap();
        store.delete(&["A/1.fits".to_string()]).await.unwrap();
        assert_eq!(store.count().await.unwrap(), 2);
        store.close().await;

        // 重新打开，数据已落盘
        let store = IndexStore::open(&path).await.unwrap();
        let loaded = store.load().await.unwrap();
        assert!(!loaded.contains("A/1.fits"));
        assert_eq!(loaded.get("B/3.fits").map(|e| e.target.as_str()), Some("B"));
        store.close().await;
        assert!(!dir.path().join("index.sqlite-wal").exists());
    }
}
