pub mod local;
pub mod webdav;

use crate::config::{RemoteConfig, RemoteType};
use crate::error::SyncError;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalStorage;
pub use webdav::WebDavStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, rename 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;

/// 写入过程中使用的临时文件后缀，列目录时总是跳过
pub const PART_SUFFIX: &str = ".capsync-part";

/// 文件信息
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileInfo {
    /// 相对存储根目录的路径，统一使用 /
    pub path: String,
    pub size: u64,
    /// 秒级 Unix 时间戳
    pub modified_time: i64,
    pub is_dir: bool,
}

/// 文件元数据（用于快速检查）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMeta {
    pub size: u64,
    pub modified_time: i64,
    pub is_dir: bool,
}

impl FileMeta {
    /// 大小和修改时间（秒）都相同即认为是同一个文件，从不读取内容
    pub fn same_as(&self, size: u64, modified_time: i64) -> bool {
        !self.is_dir && self.size == size && self.modified_time == modified_time
    }
}

/// 递归列表的结果
///
/// 单个条目读取元数据失败只记录到 `errors`，不会中断整个列表。
#[derive(Debug, Default)]
pub struct FileListing {
    pub files: Vec<FileInfo>,
    pub errors: Vec<String>,
}

/// 存储抽象接口
///
/// 所有路径都是相对存储根目录、以 `/` 分隔的字符串。
#[async_trait]
pub trait Storage: Send + Sync {
    /// 递归列出 prefix 下的所有文件和目录
    async fn list_files(&self, prefix: Option<&str>) -> Result<FileListing>;

    /// 列出目录的直接子项
    async fn list_dir(&self, path: &str) -> Result<Vec<FileInfo>>;

    /// 获取文件元数据，不存在时返回 None
    async fn stat(&self, path: &str) -> Result<Option<FileMeta>>;

    /// 读取整个文件
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// 写入整个文件，父目录不存在时自动创建
    async fn write(&self, path: &str, data: Vec<u8>) -> Result<()>;

    /// 设置修改时间，后端不支持时返回 false
    async fn set_modified(&self, path: &str, modified_time: i64) -> Result<bool>;

    /// 移动文件，目标父目录不存在时自动创建
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// 递归创建目录
    async fn create_dir(&self, path: &str) -> Result<()>;

    /// 仅在目录为空时删除，返回是否删除
    async fn remove_empty_dir(&self, path: &str) -> Result<bool>;

    /// 删除文件，不存在时视为成功
    async fn delete(&self, path: &str) -> Result<()>;

    /// 检查文件是否存在
    async fn exists(&self, path: &str) -> Result<bool> {
        Ok(self.stat(path).await?.is_some())
    }

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 规范化路径分隔符（统一使用 /，去掉首尾的 /）
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_matches('/').to_string()
}

/// 根据配置创建远程存储实例
pub async fn create_storage(config: &RemoteConfig) -> crate::Result<Arc<dyn Storage>> {
    match config.typ {
        RemoteType::Share => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("共享目录存储需要 path".to_string()))?;
            tracing::info!("初始化共享目录存储: {}", path);
            let storage = LocalStorage::new(path)
                .map_err(|e| SyncError::Configuration(format!("{:#}", e)))?;
            Ok(Arc::new(storage) as Arc<dyn Storage>)
        }
        RemoteType::WebDav => {
            let endpoint = config.webdav_endpoint.as_ref().ok_or_else(|| {
                SyncError::Configuration("WebDAV 存储需要 webdavEndpoint".to_string())
            })?;
            let username = config
                .username
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("WebDAV 存储需要 username".to_string()))?;
            let password = config
                .password
                .as_ref()
                .ok_or_else(|| SyncError::Configuration("WebDAV 存储需要 password".to_string()))?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            let storage =
                WebDavStorage::new(endpoint, username, password, config.root.clone()).await?;
            Ok(Arc::new(storage) as Arc<dyn Storage>)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_path_uses_forward_slashes() {
        assert_eq!(normalize_path("A\\lights\\1.fits"), "A/lights/1.fits");
        assert_eq!(normalize_path("/A/b/"), "A/b");
        assert_eq!(normalize_path(""), "");
    }

    #[test]
    fn same_as_compares_size_and_seconds() {
        let meta = FileMeta {
            size: 100,
            modified_time: 1000,
            is_dir: false,
        };
        assert!(meta.same_as(100, 1000));
        assert!(!meta.same_as(100, 1001));
        assert!(!meta.same_as(99, 1000));

        let dir = FileMeta { is_dir: true, ..meta };
        assert!(!dir.same_as(100, 1000));
    }
}
