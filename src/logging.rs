//! 日志模块 - 程序日志文件和大小管理
//!
//! 这里只管 tracing 的输出。每次拉取/推送/删除的活动日志见 `core::run_log`。

use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing_subscriber::fmt::MakeWriter;

/// 程序日志文件名
pub const LOG_FILE: &str = "capsync.log";

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否写日志文件
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

type SharedWriter = Arc<Mutex<Option<BufWriter<File>>>>;

fn lock(writer: &SharedWriter) -> io::Result<MutexGuard<'_, Option<BufWriter<File>>>> {
    writer
        .lock()
        .map_err(|_| io::Error::new(io::ErrorKind::Other, "日志写入器锁已损坏"))
}

/// 带大小限制的日志写入器
///
/// 超过上限时把当前文件改名为 `capsync.log.old`（覆盖旧备份），然后重新打开。
#[derive(Clone)]
pub struct RotatingFileWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: SharedWriter,
}

impl RotatingFileWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE);
        let max_size = (max_size_mb.max(1) as u64) * 1024 * 1024;
        let writer = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer: Arc::new(Mutex::new(Some(writer))),
        })
    }

    pub fn file_path(&self) -> &Path {
        &self.file_path
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<BufWriter<File>> {
        if Self::too_large(file_path, max_size) {
            Self::rotate_log(file_path)?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;

        Ok(BufWriter::new(file))
    }

    fn too_large(file_path: &Path, max_size: u64) -> bool {
        fs::metadata(file_path)
            .map(|m| m.len() > max_size)
            .unwrap_or(false)
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");
        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }
        fs::rename(file_path, &backup_path)
    }

    /// 关闭当前文件、轮转、重新打开
    fn rotate_locked(
        guard: &mut Option<BufWriter<File>>,
        file_path: &Path,
        max_size: u64,
    ) -> io::Result<()> {
        if let Some(mut w) = guard.take() {
            let _ = w.flush();
        }
        Self::rotate_log(file_path)?;
        *guard = Some(Self::open_file(file_path, max_size)?);
        Ok(())
    }
}

/// 单次写入使用的句柄
pub struct LogWriter {
    inner: SharedWriter,
    file_path: PathBuf,
    max_size: u64,
}

impl Write for LogWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut guard = lock(&self.inner)?;

        let written = match guard.as_mut() {
            Some(writer) => {
                let n = writer.write(buf)?;
                writer.flush()?;
                n
            }
            None => return Err(io::Error::new(io::ErrorKind::Other, "日志写入器不可用")),
        };

        if RotatingFileWriter::too_large(&self.file_path, self.max_size) {
            let _ = RotatingFileWriter::rotate_locked(&mut guard, &self.file_path, self.max_size);
        }

        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        match lock(&self.inner)?.as_mut() {
            Some(writer) => writer.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for RotatingFileWriter {
    type Writer = LogWriter;

    fn make_writer(&'a self) -> Self::Writer {
        LogWriter {
            inner: self.writer.clone(),
            file_path: self.file_path.clone(),
            max_size: self.max_size,
        }
    }
}

/// 程序日志目录
pub fn log_dir(config_dir: &Path) -> PathBuf {
    config_dir.join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_falls_back_to_info() {
        let mut config = LogConfig::default();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
        config.level = "DEBUG".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::DEBUG);
        config.level = "verbose".to_string();
        assert_eq!(config.tracing_level(), tracing::Level::INFO);
    }

    #[test]
    fn oversized_log_is_rotated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOG_FILE);
        fs::write(&path, vec![b'x'; 2 * 1024 * 1024]).unwrap();

        let writer = RotatingFileWriter::new(dir.path(), 1).unwrap();
        let mut handle = writer.make_writer();
        handle.write_all(b"fresh\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "fresh\n");
        assert!(dir.path().join("capsync.log.old").exists());
    }
}
