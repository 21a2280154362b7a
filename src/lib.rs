use std::path::PathBuf;

pub mod config;
pub mod core;
pub mod db;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::AppConfig;
pub use crate::core::{ActionQueue, ActionReport, CompareMode, QueueAction, QueueRunner, SyncEngine};
pub use error::{Result, SyncError};

/// 应用状态：配置目录和从中读出的配置
#[derive(Debug, Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub config_dir: PathBuf,
    /// 配置文件无法读取时的说明，日志初始化之后由调用方输出
    pub config_warning: Option<String>,
}

impl AppState {
    /// `config_dir` 为空时使用默认配置目录
    pub fn new(config_dir: Option<PathBuf>) -> Result<Self> {
        let config_dir = config_dir.unwrap_or_else(default_config_dir);
        std::fs::create_dir_all(&config_dir)?;

        let (config, config_warning) = match AppConfig::try_load(&config_dir) {
            Ok(config) => (config, None),
            Err(e) => (
                AppConfig::default().with_env(),
                Some(format!("配置文件无法读取，使用默认配置: {}", e)),
            ),
        };

        Ok(Self {
            config,
            config_dir,
            config_warning,
        })
    }

    /// 校验配置并连接远程存储
    pub async fn engine(&self) -> Result<SyncEngine> {
        SyncEngine::from_config(&self.config).await
    }
}

/// 默认配置目录
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("capsync"))
        .unwrap_or_else(|| PathBuf::from(".capsync-config"))
}

pub mod dirs {
    use std::path::PathBuf;

    pub fn config_dir() -> Option<PathBuf> {
        if let Some(xdg) = std::env::var_os("XDG_CONFIG_HOME").filter(|v| !v.is_empty()) {
            return Some(PathBuf::from(xdg));
        }
        if cfg!(target_os = "windows") {
            std::env::var("APPDATA").ok().map(PathBuf::from)
        } else if cfg!(target_os = "macos") {
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join("Library").join("Application Support"))
        } else {
            // Linux
            std::env::var("HOME")
                .ok()
                .map(|h| PathBuf::from(h).join(".config"))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn broken_config_is_kept_as_a_warning() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(config::CONFIG_FILE), "[1, 2").unwrap();

        let state = AppState::new(Some(dir.path().to_path_buf())).unwrap();
        assert!(state.config.local_root.is_none());
        assert!(state.config_warning.is_some());

        std::fs::write(dir.path().join(config::CONFIG_FILE), "{}").unwrap();
        let state = AppState::new(Some(dir.path().to_path_buf())).unwrap();
        assert!(state.config_warning.is_none());
    }
}
