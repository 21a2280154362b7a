//! 同步错误类型
//!
//! 单个文件的读写失败不会出现在这里：它们被计入运行统计并写入活动日志。
//! 这里只描述会让整个操作失败的错误。

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// 本地或远程路径不存在
    #[error("路径不存在: {0}")]
    NotFound(String),

    /// 前置条件不满足（例如删除前没有拉取检查点），不做任何破坏性操作
    #[error("前置条件不满足: {0}")]
    Precondition(String),

    /// 缺少连接参数、本地根目录不存在等
    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("未知的队列动作: {0}")]
    UnknownAction(String),

    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO 错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("存储错误: {0:#}")]
    Storage(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;
