use super::{
    normalize_path, FileInfo, FileListing, FileMeta, Storage, IO_TIMEOUT_SECS, OP_TIMEOUT_SECS,
    PART_SUFFIX,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::TryStreamExt;
use opendal::{layers::TimeoutLayer, Metadata, Metakey, Operator};
use std::time::Duration;

/// 通过 WebDAV 访问的共享目录
///
/// WebDAV 不支持设置修改时间，`set_modified` 总是返回 false。
pub struct WebDavStorage {
    operator: Operator,
    name: String,
}

impl WebDavStorage {
    pub async fn new(
        endpoint: &str,
        username: &str,
        password: &str,
        root: Option<String>,
    ) -> Result<Self> {
        use opendal::services::Webdav;

        let mut builder = Webdav::default()
            .endpoint(endpoint)
            .username(username)
            .password(password);

        if let Some(ref r) = root {
            builder = builder.root(r);
        }

        let operator = Operator::new(builder)?
            .layer(
                TimeoutLayer::default()
                    .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                    .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
            )
            .finish();

        let name = format!(
            "webdav://{}{}",
            endpoint.trim_end_matches('/'),
            root.as_deref()
                .map(|r| format!("/{}", r.trim_start_matches('/')))
                .unwrap_or_default()
        );

        Ok(Self { operator, name })
    }

    fn dir_path(path: &str) -> String {
        let path = normalize_path(path);
        if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        }
    }

    fn to_info(path: &str, meta: &Metadata) -> FileInfo {
        FileInfo {
            path: normalize_path(path),
            size: if meta.is_dir() { 0 } else { meta.content_length() },
            modified_time: meta.last_modified().map_or(0, |t| t.timestamp()),
            is_dir: meta.is_dir(),
        }
    }

    /// 逐级创建父目录，已存在的目录忽略错误
    async fn ensure_parent(&self, path: &str) {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        if parts.len() < 2 {
            return;
        }
        let mut current_path = String::new();
        for part in &parts[..parts.len() - 1] {
            current_path.push_str(part);
            current_path.push('/');
            let _ = self.operator.create_dir(&current_path).await;
        }
    }
}

#[async_trait]
impl Storage for WebDavStorage {
    async fn list_files(&self, prefix: Option<&str>) -> Result<FileListing> {
        let mut listing = FileListing::default();
        let path = Self::dir_path(prefix.unwrap_or(""));

        let mut lister = match self
            .operator
            .lister_with(&path)
            .recursive(true)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await
        {
            Ok(l) => l,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(listing),
            Err(e) => return Err(e.into()),
        };

        loop {
            match lister.try_next().await {
                Ok(Some(entry)) => {
                    let path_str = normalize_path(entry.path());
                    // 跳过列表根目录本身
                    if path_str.is_empty() || path_str == normalize_path(&path) {
                        continue;
                    }
                    if path_str.ends_with(PART_SUFFIX) {
                        continue;
                    }
                    listing.files.push(Self::to_info(&path_str, entry.metadata()));
                }
                Ok(None) => break,
                Err(e) => {
                    // 中途失败时保留已经列出的部分
                    listing.errors.push(format!("{}: {}", path, e));
                    break;
                }
            }
        }

        Ok(listing)
    }

    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>> {
        let dir = Self::dir_path(path);
        let entries = self
            .operator
            .list_with(&dir)
            .metakey(Metakey::ContentLength | Metakey::LastModified | Metakey::Mode)
            .await?;

        let own = normalize_path(&dir);
        Ok(entries
            .iter()
            .filter(|e| {
                let p = normalize_path(e.path());
                !p.is_empty() && p != own && !p.ends_with(PART_SUFFIX)
            })
            .map(|e| Self::to_info(e.path(), e.metadata()))
            .collect())
    }

    async fn stat(&self, path: &str) -> Result<Option<FileMeta>> {
        match self.operator.stat(&normalize_path(path)).await {
            Ok(meta) => Ok(Some(FileMeta {
                size: if meta.is_dir() { 0 } else { meta.content_length() },
                modified_time: meta.last_modified().map_or(0, |t| t.timestamp()),
                is_dir: meta.is_dir(),
            })),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let data = self.operator.read(&normalize_path(path)).await?;
        Ok(data.to_vec())
    }

    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()> {
        let path = normalize_path(path);
        self.ensure_parent(&path).await;

        // 先上传到临时名，再 MOVE 到最终位置
        let temp_path = format!("{}{}", path, PART_SUFFIX);
        self.operator.write(&temp_path, data).await?;
        if let Err(e) = self.operator.rename(&temp_path, &path).await {
            let _ = self.operator.delete(&temp_path).await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn set_modified(&self, _path: &str, _modified_time: i64) -> Result<bool> {
        Ok(false)
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let to = normalize_path(to);
        self.ensure_parent(&to).await;
        self.operator.rename(&normalize_path(from), &to).await?;
        Ok(())
    }

    async fn create_dir(&self, path: &str) -> Result<()> {
        let dir = Self::dir_path(path);
        if dir.is_empty() {
            return Ok(());
        }
        self.ensure_parent(&format!("{}x", dir)).await;
        self.operator.create_dir(&dir).await?;
        Ok(())
    }

    async fn remove_empty_dir(&self, path: &str) -> Result<bool> {
        let dir = Self::dir_path(path);
        if dir.is_empty() {
            return Ok(false);
        }
        let children = match self.operator.list(&dir).await {
            Ok(c) => c,
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(e.into()),
        };
        let own = normalize_path(&dir);
        if children.iter().any(|e| normalize_path(e.path()) != own) {
            return Ok(false);
        }
        self.operator.delete(&dir).await?;
        Ok(true)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.operator.delete(&normalize_path(path)).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}
