//! 应用配置模块

use crate::error::{Result, SyncError};
use crate::logging::LogConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 可以代替配置文件提供远程密码的环境变量
pub const PASSWORD_ENV: &str = "CAPSYNC_REMOTE_PASSWORD";

/// 远程存储类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteType {
    /// 挂载到本机的共享目录
    #[serde(rename = "share")]
    Share,
    #[serde(rename = "webdav")]
    WebDav,
}

/// 远程存储连接参数
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    #[serde(rename = "type")]
    pub typ: RemoteType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdav_endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl RemoteConfig {
    pub fn share(path: impl Into<String>) -> Self {
        Self {
            typ: RemoteType::Share,
            path: Some(path.into()),
            webdav_endpoint: None,
            username: None,
            password: None,
            root: None,
        }
    }

    fn validate(&self) -> Result<()> {
        let missing = |name: &str| {
            SyncError::Configuration(format!("远程存储缺少参数: {}", name))
        };
        match self.typ {
            RemoteType::Share => {
                let path = self.path.as_deref().ok_or_else(|| missing("path"))?;
                if !Path::new(path).is_dir() {
                    return Err(SyncError::Configuration(format!(
                        "共享目录不存在: {}",
                        path
                    )));
                }
            }
            RemoteType::WebDav => {
                self.webdav_endpoint
                    .as_deref()
                    .ok_or_else(|| missing("webdavEndpoint"))?;
                self.username.as_deref().ok_or_else(|| missing("username"))?;
                self.password.as_deref().ok_or_else(|| missing("password"))?;
            }
        }
        Ok(())
    }
}

/// config.json 的全部内容
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从配置目录加载，文件不存在或无法解析时使用默认值
    pub fn load(config_dir: &Path) -> Self {
        Self::try_load(config_dir).unwrap_or_else(|e| {
            tracing::warn!("配置文件解析失败，使用默认配置: {}", e);
            Self::default().with_env()
        })
    }

    /// 文件不存在时返回默认值，无法读取或解析时返回错误
    pub fn try_load(config_dir: &Path) -> Result<Self> {
        let config_file = config_dir.join(CONFIG_FILE);
        let config = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str::<AppConfig>(&content)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => AppConfig::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(config.with_env())
    }

    /// 环境变量中的密码优先于配置文件
    pub(crate) fn with_env(mut self) -> Self {
        if let Ok(password) = std::env::var(PASSWORD_ENV) {
            if let Some(remote) = self.remote.as_mut() {
                remote.password = Some(password);
            }
        }
        self
    }

    /// 保存配置，合并到已有的 JSON 中以保留其他键
    pub fn save(&self, config_dir: &Path) -> Result<()> {
        fs::create_dir_all(config_dir)?;
        let config_file = config_dir.join(CONFIG_FILE);

        // 读取现有配置
        let mut existing: serde_json::Value = match fs::read_to_string(&config_file) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|_| serde_json::json!({})),
            Err(_) => serde_json::json!({}),
        };
        if !existing.is_object() {
            existing = serde_json::json!({});
        }

        if let serde_json::Value::Object(fields) = serde_json::to_value(self)? {
            for (key, value) in fields {
                existing[key] = value;
            }
        }

        fs::write(&config_file, serde_json::to_string_pretty(&existing)?)?;
        Ok(())
    }

    /// 在任何 IO 之前检查本地根目录和远程参数
    pub fn validate(&self) -> Result<(&Path, &RemoteConfig)> {
        let local_root = self
            .local_root
            .as_deref()
            .ok_or_else(|| SyncError::Configuration("未配置 localRoot".to_string()))?;
        if !local_root.is_dir() {
            return Err(SyncError::Configuration(format!(
                "本地根目录不存在: {}",
                local_root.display()
            )));
        }
        let remote = self
            .remote
            .as_ref()
            .ok_or_else(|| SyncError::Configuration("未配置远程存储".to_string()))?;
        remote.validate()?;
        Ok((local_root, remote))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(dir.path());
        assert!(config.local_root.is_none());
        assert!(config.remote.is_none());
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn broken_file_is_an_error_for_try_load_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "{ not json").unwrap();

        assert!(matches!(
            AppConfig::try_load(dir.path()),
            Err(SyncError::Serialization(_))
        ));
        assert!(AppConfig::load(dir.path()).local_root.is_none());
    }

    #[test]
    fn save_keeps_unrelated_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE),
            r#"{"theme":"dark","localRoot":"/old"}"#,
        )
        .unwrap();

        let config = AppConfig {
            local_root: Some(PathBuf::from("/data/captures")),
            remote: Some(RemoteConfig::share("/mnt/nas")),
            log: LogConfig::default(),
        };
        config.save(dir.path()).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join(CONFIG_FILE)).unwrap())
                .unwrap();
        assert_eq!(raw["theme"], "dark");
        assert_eq!(raw["localRoot"], "/data/captures");
        assert_eq!(raw["remote"]["type"], "share");
    }

    #[test]
    fn validate_rejects_missing_parameters() {
        let dir = tempfile::tempdir().unwrap();

        let config = AppConfig::default();
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let config = AppConfig {
            local_root: Some(dir.path().to_path_buf()),
            remote: Some(RemoteConfig {
                typ: RemoteType::WebDav,
                path: None,
                webdav_endpoint: Some("https://nas.local/dav".to_string()),
                username: Some("astro".to_string()),
                password: None,
                root: None,
            }),
            log: LogConfig::default(),
        };
        assert!(matches!(config.validate(), Err(SyncError::Configuration(_))));

        let config = AppConfig {
            local_root: Some(dir.path().to_path_buf()),
            remote: Some(RemoteConfig::share(dir.path().to_string_lossy())),
            log: LogConfig::default(),
        };
        assert!(config.validate().is_ok());
    }
}
