use super::index::{FileIndex, IndexEntry};
use crate::storage::Storage;
use anyhow::Result;
use tracing::{debug, info, warn};

/// 扫描进度回调，参数为当前文件的相对路径
pub type ScanProgress<'a> = Option<&'a (dyn Fn(&str) + Send + Sync)>;

/// 文件扫描器配置
#[derive(Debug, Clone, Default)]
pub struct ScanConfig {
    /// 排除的目录（连同其下所有内容）
    pub exclude_dirs: Vec<String>,
    /// 排除的文件（相对路径完全匹配）
    pub exclude_files: Vec<String>,
}

impl ScanConfig {
    fn should_exclude(&self, path: &str) -> bool {
        self.exclude_files.iter().any(|f| f == path)
            || self
                .exclude_dirs
                .iter()
                .any(|d| path == d || path.starts_with(&format!("{}/", d)))
    }
}

/// 一次完整扫描的结果
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub index: FileIndex,
    /// 无法读取元数据的条目，已跳过
    pub errors: Vec<String>,
}

/// 文件扫描器：完整遍历一棵树并生成索引
#[derive(Debug, Clone, Default)]
pub struct FileScanner {
    config: ScanConfig,
}

impl FileScanner {
    pub fn with_config(config: ScanConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// 遍历存储，每个普通文件生成一条记录
    ///
    /// 单个文件出错只记录并继续。
    pub async fn build_index(
        &self,
        storage: &dyn Storage,
        progress: ScanProgress<'_>,
    ) -> Result<ScanOutcome> {
        info!("开始扫描存储: {}", storage.name());

        let listing = storage.list_files(None).await?;
        let mut outcome = ScanOutcome {
            index: FileIndex::new(),
            errors: listing.errors,
        };
        let mut excluded_count = 0;

        for file in listing.files {
            if file.is_dir {
                continue;
            }

            if self.config.should_exclude(&file.path) {
                debug!("排除文件: {}", file.path);
                excluded_count += 1;
                continue;
            }

            if let Some(cb) = progress {
                cb(&file.path);
            }

            outcome.index.upsert(IndexEntry::new(
                &file.path,
                file.size as i64,
                file.modified_time,
            ));
        }

        for error in &outcome.errors {
            warn!("扫描时无法读取: {}", error);
        }

        info!(
            "扫描完成: {} 个文件, {} 个被排除, {} 个错误",
            outcome.index.len(),
            excluded_count,
            outcome.errors.len()
        );

        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::LocalStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn build_index_matches_tree_and_skips_private_area() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("A/lights")).unwrap();
        std::fs::create_dir_all(root.join(".capsync/logs")).unwrap();
        std::fs::write(root.join("A/lights/1.fits"), vec![0u8; 100]).unwrap();
        std::fs::write(root.join("A/2.fits"), vec![0u8; 50]).unwrap();
        std::fs::write(root.join("top.txt"), b"t").unwrap();
        std::fs::write(root.join(".capsync/local_index.sqlite"), b"db").unwrap();
        filetime::set_file_mtime(
            root.join("A/lights/1.fits"),
            filetime::FileTime::from_unix_time(1000, 0),
        )
        .unwrap();

        let scanner = FileScanner::with_config(ScanConfig {
            exclude_dirs: vec![".capsync".to_string()],
            exclude_files: vec![],
        });
        let seen = AtomicUsize::new(0);
        let progress = |_: &str| {
            seen.fetch_add(1, Ordering::Relaxed);
        };

        let storage = LocalStorage::new(root).unwrap();
        let outcome = scanner.build_index(&storage, Some(&progress)).await.unwrap();

        assert_eq!(outcome.index.len(), 3);
        assert_eq!(seen.load(Ordering::Relaxed), 3);
        let entry = outcome.index.get("A/lights/1.fits").unwrap();
        assert_eq!(entry.target, "A");
        assert_eq!(entry.size_bytes, 100);
        assert_eq!(entry.mtime_epoch, 1000);
        assert_eq!(outcome.index.get("top.txt").unwrap().target, "(root)");
        assert!(!outcome.index.contains(".capsync/local_index.sqlite"));
    }
}
