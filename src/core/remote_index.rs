//! 远程索引同步
//!
//! 远程索引是放在共享目录根下的一个 SQLite 文件。它从不在远程原地修改：
//! 总是下载到本地临时副本，修改后整体上传。临时副本在任何退出路径上都会被删除。
//!
//! 没有任何锁，两台机器同时写入时后上传的一方覆盖先上传的一方。

use super::index::{FileIndex, IndexEntry};
use super::scanner::{FileScanner, ScanConfig, ScanProgress};
use crate::db::IndexStore;
use crate::error::Result;
use crate::storage::Storage;
use anyhow::Context;
use scopeguard::ScopeGuard;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// 远程索引在共享目录根下的文件名
pub const REMOTE_INDEX_FILENAME: &str = "__capsync_remote_index.sqlite";

fn discard(path: PathBuf) {
    let _ = std::fs::remove_file(&path);
    let mut journal = path.into_os_string();
    journal.push("-journal");
    let _ = std::fs::remove_file(PathBuf::from(journal));
}

/// 远程索引的本地临时副本，离开作用域时删除
pub struct RemoteIndexCopy {
    path: ScopeGuard<PathBuf, fn(PathBuf)>,
}

impl RemoteIndexCopy {
    fn new_temp() -> Self {
        let path = std::env::temp_dir().join(format!(
            "capsync_remote_{}.sqlite",
            uuid::Uuid::new_v4().simple()
        ));
        Self {
            path: scopeguard::guard(path, discard as fn(PathBuf)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn open(&self) -> Result<IndexStore> {
        Ok(IndexStore::open(self.path()).await?)
    }

    /// 读出全部记录
    pub async fn load(&self) -> Result<FileIndex> {
        let store = self.open().await?;
        let index = store.load().await;
        store.close().await;
        Ok(index?)
    }
}

/// 对远程索引的一次增量修改
#[derive(Debug, Clone)]
pub enum IndexMutation {
    Upsert(Vec<IndexEntry>),
    Remove(Vec<String>),
}

impl IndexMutation {
    pub fn is_empty(&self) -> bool {
        match self {
            IndexMutation::Upsert(entries) => entries.is_empty(),
            IndexMutation::Remove(paths) => paths.is_empty(),
        }
    }
}

/// 远程索引同步器
pub struct RemoteIndexSync {
    remote: Arc<dyn Storage>,
    scanner: FileScanner,
}

impl RemoteIndexSync {
    pub fn new(remote: Arc<dyn Storage>) -> Self {
        let scanner = FileScanner::with_config(ScanConfig {
            exclude_dirs: vec![],
            exclude_files: vec![REMOTE_INDEX_FILENAME.to_string()],
        });
        Self { remote, scanner }
    }

    /// 取得远程索引的本地副本
    ///
    /// 下载失败（包括文件不存在或不是有效的索引）时完整重建并上传，直接使用重建出的副本。
    /// `force_rebuild` 时先重建上传，再下载刚上传的文件。
    pub async fn fetch(
        &self,
        force_rebuild: bool,
        progress: ScanProgress<'_>,
    ) -> Result<RemoteIndexCopy> {
        if force_rebuild {
            self.rebuild(progress).await?;
        }

        match self.download().await {
            Ok(copy) => Ok(copy),
            Err(e) => {
                warn!("下载远程索引失败，重新构建: {}", e);
                let (copy, count) = self.build_copy(progress).await?;
                self.publish(&copy).await?;
                info!("远程索引已重建: {} 个文件", count);
                Ok(copy)
            }
        }
    }

    /// 完整遍历远程存储，重建并上传索引，返回文件数
    pub async fn rebuild(&self, progress: ScanProgress<'_>) -> Result<usize> {
        let (copy, count) = self.build_copy(progress).await?;
        self.publish(&copy).await?;
        info!("远程索引已重建: {} 个文件", count);
        Ok(count)
    }

    /// 上传本地副本并把远程文件的修改时间设为当前时间
    pub async fn publish(&self, copy: &RemoteIndexCopy) -> Result<()> {
        let data = tokio::fs::read(copy.path()).await?;
        self.remote
            .write(REMOTE_INDEX_FILENAME, data)
            .await
            .context("上传远程索引失败")?;

        let now = chrono::Utc::now().timestamp();
        if !self.remote.set_modified(REMOTE_INDEX_FILENAME, now).await? {
            debug!("远程存储不支持设置修改时间: {}", self.remote.name());
        }
        Ok(())
    }

    /// 下载、修改、上传
    pub async fn apply(&self, mutation: IndexMutation) -> Result<()> {
        if mutation.is_empty() {
            return Ok(());
        }

        let copy = self.fetch(false, None).await?;
        let store = copy.open().await?;
        let result = match &mutation {
            IndexMutation::Upsert(entries) => store.upsert(entries).await,
            IndexMutation::Remove(paths) => store.delete(paths).await,
        };
        store.close().await;
        result?;

        self.publish(&copy).await?;
        debug!("远程索引已更新: {:?}", mutation_size(&mutation));
        Ok(())
    }

    async fn download(&self) -> Result<RemoteIndexCopy> {
        let copy = RemoteIndexCopy::new_temp();
        let data = self
            .remote
            .read(REMOTE_INDEX_FILENAME)
            .await
            .context("读取远程索引失败")?;
        tokio::fs::write(copy.path(), data).await?;

        // 能打开并查询才算有效
        let store = copy.open().await?;
        let count = store.count().await;
        store.close().await;
        debug!("已下载远程索引: {} 条记录", count?);

        Ok(copy)
    }

    async fn build_copy(&self, progress: ScanProgress<'_>) -> Result<(RemoteIndexCopy, usize)> {
        let outcome = self
            .scanner
            .build_index(self.remote.as_ref(), progress)
            .await?;

        let copy = RemoteIndexCopy::new_temp();
        let store = copy.open().await?;
        let saved = store.save(&outcome.index).await;
        store.close().await;
        saved?;

        Ok((copy, outcome.index.len()))
    }
}

fn mutation_size(mutation: &IndexMutation) -> (&'static str, usize) {
    match mutation {
        IndexMutation::Upsert(entries) => ("upsert", entries.len()),
        IndexMutation::Remove(paths) => ("remove", paths.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;

    fn share() -> (tempfile::TempDir, RemoteIndexSync) {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A")).unwrap();
        std::fs::write(dir.path().join("A/1.fits"), vec![1u8; 10]).unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();
        (dir, RemoteIndexSync::new(Arc::new(storage)))
    }

    #[tokio::test]
    async fn missing_index_falls_back_to_rebuild() {
        let (dir, sync) = share();

        let copy = sync.fetch(false, None).await.unwrap();
        let index = copy.load().await.unwrap();
        assert_eq!(index.len(), 1);
        assert!(index.contains("A/1.fits"));
        assert!(dir.path().join(REMOTE_INDEX_FILENAME).exists());

        let temp = copy.path().to_path_buf();
        drop(copy);
        assert!(!temp.exists());
    }

    #[tokio::test]
    async fn corrupt_index_is_rebuilt() {
        let (dir, sync) = share();
        std::fs::write(dir.path().join(REMOTE_INDEX_FILENAME), vec![b'x'; 4096]).unwrap();

        let index = sync.fetch(false, None).await.unwrap().load().await.unwrap();
        assert_eq!(index.len(), 1);
    }

    #[tokio::test]
    async fn apply_upserts_without_rebuilding() {
        let (dir, sync) = share();
        assert_eq!(sync.rebuild(None).await.unwrap(), 1);

        // 新文件不在远程索引里，只有 apply 写入的记录
        std::fs::write(dir.path().join("A/untracked.fits"), b"u").unwrap();
        sync.apply(IndexMutation::Upsert(vec![IndexEntry::new("A/2.fits", 5, 50)]))
            .await
            .unwrap();

        let index = sync.fetch(false, None).await.unwrap().load().await.unwrap();
        assert_eq!(index.len(), 2);
        assert!(index.contains("A/2.fits"));
        assert!(!index.contains("A/untracked.fits"));
    }
}
