//! 每个 target 最近一次成功拉取的时间
//!
//! 只有拉取零错误完成时才写入，从不自动删除。删除到回收站依赖这个检查点。

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const TARGET_STATE_FILENAME: &str = "target_state.json";

const PULLS_KEY: &str = "last_successful_pull";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TargetStates {
    #[serde(default)]
    pub last_successful_pull: BTreeMap<String, i64>,
}

impl TargetStates {
    /// 没有记录时为 0
    pub fn last_pull(&self, target: &str) -> i64 {
        self.last_successful_pull.get(target).copied().unwrap_or(0)
    }
}

/// `target_state.json` 的读写
#[derive(Debug, Clone)]
pub struct TargetStateStore {
    path: PathBuf,
}

impl TargetStateStore {
    pub fn new(private_dir: &Path) -> Self {
        Self {
            path: private_dir.join(TARGET_STATE_FILENAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 文件不存在或无法解析时视为空
    pub fn load(&self) -> TargetStates {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(_) => return TargetStates::default(),
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            warn!("无法解析 {}: {}", self.path.display(), e);
            TargetStates::default()
        })
    }

    pub fn last_pull(&self, target: &str) -> i64 {
        self.load().last_pull(target)
    }

    /// 记录检查点，`timestamp` 为空时使用当前时间。返回写入的时间戳
    pub fn mark_pulled(&self, target: &str, timestamp: Option<i64>) -> Result<i64> {
        let timestamp = timestamp.unwrap_or_else(|| chrono::Utc::now().timestamp());

        // 合并到已有文件，保留其他键
        let mut raw: serde_json::Value = fs::read_to_string(&self.path)
            .ok()
            .and_then(|c| serde_json::from_str(&c).ok())
            .filter(serde_json::Value::is_object)
            .unwrap_or_else(|| serde_json::json!({}));

        if !raw[PULLS_KEY].is_object() {
            raw[PULLS_KEY] = serde_json::json!({});
        }
        raw[PULLS_KEY][target] = serde_json::json!(timestamp);

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(&raw)?)?;

        info!("已记录拉取检查点: {} = {}", target, timestamp);
        Ok(timestamp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_or_broken_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = TargetStateStore::new(dir.path());
        assert_eq!(store.last_pull("A"), 0);

        fs::write(store.path(), "{not json").unwrap();
        assert!(store.load().last_successful_pull.is_empty());
    }

    #[test]
    fn mark_pulled_keeps_other_targets_and_keys() {
        let dir = tempfile::tempdir().unwrap();
        let store = TargetStateStore::new(dir.path());
        fs::write(
            store.path(),
            r#"{"last_successful_pull":{"B":5},"note":"kept"}"#,
        )
        .unwrap();

        assert_eq!(store.mark_pulled("A", Some(1000)).unwrap(), 1000);

        let states = store.load();
        assert_eq!(states.last_pull("A"), 1000);
        assert_eq!(states.last_pull("B"), 5);
        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["note"], "kept");
    }
}
