use super::{normalize_path, FileInfo, FileListing, FileMeta, Storage, PART_SUFFIX};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use filetime::FileTime;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tokio::fs;
use walkdir::WalkDir;

/// 文件系统上的一个目录
///
/// 既用作本地工作站的根目录，也用作挂载到本机的网络共享。
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

impl LocalStorage {
    /// 打开已存在的目录，不存在时返回错误（不会自动创建）
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let base_path = path.as_ref().to_path_buf();
        if !base_path.is_dir() {
            bail!("目录不存在: {}", base_path.display());
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn resolve_path(&self, path: &str) -> PathBuf {
        let path = normalize_path(path);
        if path.is_empty() {
            self.base_path.clone()
        } else {
            self.base_path.join(path)
        }
    }

    fn modified_secs(metadata: &std::fs::Metadata) -> Result<i64> {
        let modified = metadata.modified()?;
        let secs = match modified.duration_since(UNIX_EPOCH) {
            Ok(d) => d.as_secs() as i64,
            // 1970 年之前的时间戳
            Err(e) => -(e.duration().as_secs() as i64),
        };
        Ok(secs)
    }

    fn to_meta(metadata: &std::fs::Metadata) -> Result<FileMeta> {
        Ok(FileMeta {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified_time: Self::modified_secs(metadata)?,
            is_dir: metadata.is_dir(),
        })
    }
}

#[async_trait]
impl Storage for LocalStorage {
    async fn list_files(&self, prefix: Option<&str>) -> Result<FileListing> {
        let base = prefix.map_or_else(|| self.base_path.clone(), |p| self.resolve_path(p));

        if !base.exists() {
            return Ok(FileListing::default());
        }

        let base_path = self.base_path.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let listing = tokio::task::spawn_blocking(move || {
            let mut listing = FileListing::default();

            for entry in WalkDir::new(&base).follow_links(false).min_depth(1) {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        let at = e
                            .path()
                            .map(|p| p.display().to_string())
                            .unwrap_or_default();
                        listing.errors.push(format!("{}: {}", at, e));
                        continue;
                    }
                };

                let relative_path = match entry.path().strip_prefix(&base_path) {
                    Ok(p) => normalize_path(&p.to_string_lossy()),
                    Err(_) => continue,
                };

                if relative_path.ends_with(PART_SUFFIX) {
                    continue;
                }

                // 只收录普通文件和目录，符号链接等一律跳过
                let file_type = entry.file_type();
                if !file_type.is_file() && !file_type.is_dir() {
                    tracing::debug!("跳过非普通文件: {}", relative_path);
                    continue;
                }

                let meta = entry
                    .metadata()
                    .map_err(anyhow::Error::from)
                    .and_then(|m| Self::to_meta(&m));

                match meta {
                    Ok(meta) => listing.files.push(FileInfo {
                        path: relative_path,
                        size: meta.size,
                        modified_time: meta.modified_time,
                        is_dir: meta.is_dir,
                    }),
                    Err(e) => listing.errors.push(format!("{}: {}", relative_path, e)),
                }
            }

            listing
        })
        .await?;

        Ok(listing)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = self.resolve_path(path);
        let prefix = normalize_path(path);
        let mut entries = Vec::new();

        let mut read_dir = fs::read_dir(&dir)
            .await
            .with_context(|| format!("读取目录失败: {}", dir.display()))?;

        while let Some(entry) = read_dir.next_entry().await? {
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(PART_SUFFIX) {
                continue;
            }
            let meta = Self::to_meta(&entry.metadata().await?)?;
            let child = if prefix.is_empty() {
                file_name
            } else {
                format!("{}/{}", prefix, file_name)
            };
            entries.push(FileInfo {
                path: child,
                size: meta.size,
                modified_time: meta.modified_time,
                is_dir: meta.is_dir,
            });
        }

        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        match fs::metadata(self.resolve_path(path)).await {
            Ok(metadata) => Ok(Some(Self::to_meta(&metadata)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let full_path = self.resolve_path(path);
        let data = fs::read(&full_path)
            .await
            .with_context(|| format!("读取文件失败: {}", full_path.display()))?;
        Ok(data)
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let full_path = self.resolve_path(path);

        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        // 先写临时文件，再重命名，避免留下半个文件
        let mut temp_name = full_path.as_os_str().to_owned();
        temp_name.push(PART_SUFFIX);
        let temp_path = PathBuf::from(temp_name);

        fs::write(&temp_path, data)
            .await
            .with_context(|| format!("写入文件失败: {}", temp_path.display()))?;
        if let Err(e) = fs::rename(&temp_path, &full_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(e).with_context(|| format!("重命名失败: {}", full_path.display()));
        }

        Ok(())
    }

    async fn set_modified(&self, path: &str, modified_time: i64) -> Result<bool> {
        let full_path = self.resolve_path(path);
        filetime::set_file_mtime(&full_path, FileTime::from_unix_time(modified_time, 0))
            .with_context(|| format!("设置修改时间失败: {}", full_path.display()))?;
        Ok(true)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from_path = self.resolve_path(from);
        let to_path = self.resolve_path(to);

        if let Some(parent) = to_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        fs::rename(&from_path, &to_path).await.with_context(|| {
            format!("移动失败: {} -> {}", from_path.display(), to_path.display())
        })?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        fs::create_dir_all(self.resolve_path(path)).await?;
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &str) -> Result<bool> {
        let full_path = self.resolve_path(path);
        let mut read_dir = match fs::read_dir(&full_path).await {
            Ok(r) => r,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        if read_dir.next_entry().await?.is_some() {
            return Ok(false);
        }
        fs::remove_dir(&full_path).await?;
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.resolve_path(path)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_then_stat_preserves_requested_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let storage = LocalStorage::new(dir.path()).unwrap();

        storage
            .write("A/lights/1.fits", b"0123456789".to_vec())
            .await
            .unwrap();
        assert!(storage.set_modified("A/lights/1.fits", 1_000_000).await.unwrap());

        let meta = storage.stat("A/lights/1.fits").await.unwrap().unwrap();
        assert_eq!(meta.size, 10);
        assert_eq!(meta.modified_time, 1_000_000);
        assert!(storage.stat("A/missing.fits").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_files_is_relative_and_skips_part_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A/sub")).unwrap();
        std::fs::write(dir.path().join("A/sub/x.fits"), b"x").unwrap();
        std::fs::write(dir.path().join("A/y.fits.capsync-part"), b"y").unwrap();

        let storage = LocalStorage::new(dir.path()).unwrap();
        let listing = storage.list_files(Some("A")).await.unwrap();

        let mut files: Vec<_> = listing
            .files
            .iter()
            .filter(|f| !f.is_dir)
            .map(|f| f.path.clone())
            .collect();
        files.sort();
        assert_eq!(files, vec!["A/sub/x.fits".to_string()]);
        assert!(listing.errors.is_empty());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn list_files_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        let calib = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A")).unwrap();
        std::fs::write(dir.path().join("A/1.fits"), b"1").unwrap();
        std::os::unix::fs::symlink(calib.path(), dir.path().join("A/calib")).unwrap();
        std::os::unix::fs::symlink(
            dir.path().join("A/1.fits"),
            dir.path().join("A/link.fits"),
        )
        .unwrap();

        let storage = LocalStorage::new(dir.path()).unwrap();
        let listing = storage.list_files(Some("A")).await.unwrap();

        let paths: Vec<_> = listing.files.iter().map(|f| f.path.clone()).collect();
        assert_eq!(paths, vec!["A/1.fits".to_string()]);
        assert!(listing.errors.is_empty());
    }

    #[tokio::test]
    async fn remove_empty_dir_keeps_non_empty_directories() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("A/empty")).unwrap();
        std::fs::write(dir.path().join("A/keep.fits"), b"k").unwrap();

        let storage = LocalStorage::new(dir.path()).unwrap();
        assert!(storage.remove_empty_dir("A/empty").await.unwrap());
        assert!(!storage.remove_empty_dir("A").await.unwrap());
        assert!(!storage.remove_empty_dir("A/gone").await.unwrap());
        assert!(dir.path().join("A/keep.fits").exists());
    }

    #[test]
    fn new_rejects_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        assert!(LocalStorage::new(dir.path().join("nope")).is_err());
    }
}
