//! 每次拉取/推送/删除的活动日志
//!
//! 纯文本、只追加，每个被检查的文件一行。文件名按动作、target 和时间唯一。

use crate::error::Result;
use regex::Regex;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{LineWriter, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// 日志行所属的文件树
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTag {
    Primary,
    Flats,
    Push,
    Trash,
}

impl fmt::Display for LogTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            LogTag::Primary => "[PRIMARY]",
            LogTag::Flats => "[FLATS]",
            LogTag::Push => "[PUSH]",
            LogTag::Trash => "[TRASH]",
        };
        f.write_str(tag)
    }
}

/// 把 target 名转成可以放进文件名的形式
pub fn safe_target_name(target: &str) -> String {
    let safe = match Regex::new(r"[^A-Za-z0-9_.-]+") {
        Ok(re) => re.replace_all(target, "_").into_owned(),
        Err(_) => target.to_string(),
    };
    let safe = safe.trim_matches('_');
    if safe.is_empty() {
        "target".to_string()
    } else {
        safe.to_string()
    }
}

pub struct RunLog {
    path: PathBuf,
    writer: LineWriter<File>,
}

impl RunLog {
    /// 在 `logs_dir` 下创建新的日志文件并写入头部
    pub fn create(logs_dir: &Path, action: &str, target: &str) -> Result<Self> {
        fs::create_dir_all(logs_dir)?;

        let now = chrono::Local::now();
        let file_name = format!(
            "{}_{}_{}.log",
            action,
            safe_target_name(target),
            now.format("%Y%m%d_%H%M%S%3f")
        );
        let path = logs_dir.join(file_name);

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let mut log = Self {
            path,
            writer: LineWriter::new(file),
        };
        log.line(format_args!("Activity log: {} {}", action, target));
        log.line(format_args!("Generated: {}", now.to_rfc3339()));
        log.line("");
        Ok(log)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 写一行；写日志失败不影响同步本身
    pub fn line(&mut self, text: impl fmt::Display) {
        if let Err(e) = writeln!(self.writer, "{}", text) {
            warn!("写入活动日志失败 {}: {}", self.path.display(), e);
        }
    }

    pub fn copy(&mut self, tag: LogTag, path: &str, reason: &str) {
        self.line(format_args!("{} COPY ({}): {}", tag, reason, path));
    }

    pub fn skip(&mut self, tag: LogTag, path: &str) {
        self.line(format_args!("{} SKIP same size+mtime: {}", tag, path));
    }

    pub fn error(&mut self, tag: LogTag, path: &str, message: &str) {
        self.line(format_args!("{} ERROR {}: {}", tag, message, path));
    }

    pub fn mtime_not_preserved(&mut self, tag: LogTag, path: &str) {
        self.line(format_args!("{} MTIME NOT PRESERVED: {}", tag, path));
    }

    pub fn moved(&mut self, from: &str, to: &str) {
        self.line(format_args!("{} MOVED {} -> {}", LogTag::Trash, from, to));
    }

    pub fn removed_dir(&mut self, dir: &str) {
        self.line(format_args!("{} REMOVED EMPTY DIR {}", LogTag::Trash, dir));
    }

    pub fn summary(&mut self, total: usize, copied: usize, skipped: usize, errors: usize) {
        self.line("");
        self.line(format_args!(
            "Summary: total={} copied={} skipped={} errors={}",
            total, copied, skipped, errors
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_name_collapses_unsafe_runs() {
        assert_eq!(safe_target_name("M31 / Andromeda"), "M31_Andromeda");
        assert_eq!(safe_target_name("NGC-7000_DATE_2024-01-05"), "NGC-7000_DATE_2024-01-05");
        assert_eq!(safe_target_name("///"), "target");
    }

    #[test]
    fn log_has_header_lines_and_summary() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RunLog::create(dir.path(), "pull", "M31 x").unwrap();
        log.skip(LogTag::Primary, "M31 x/1.fits");
        log.copy(LogTag::Flats, "_FlatWizard/L/f.fits", "missing locally");
        log.summary(2, 1, 1, 0);
        let path = log.path().to_path_buf();
        drop(log);

        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert!(name.starts_with("pull_M31_x_"));
        assert!(name.ends_with(".log"));

        let content = fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("Activity log: pull M31 x\n"));
        assert!(content.contains("[PRIMARY] SKIP same size+mtime: M31 x/1.fits"));
        assert!(content.contains("[FLATS] COPY (missing locally): _FlatWizard/L/f.fits"));
        assert!(content.contains("Summary: total=2 copied=1 skipped=1 errors=0"));
    }
}
