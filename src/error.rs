//! 统一错误类型模块
//!
//! # 设计思路
//!
//! 流水线内部按层拆分错误（见 `upload_pipeline::error`），
//! 对外入口（命令行、宿主应用）只需要一个 `AppError`。
//!
//! # 实现思路
//!
//! - 使用 `thiserror` 派生可读错误消息，并为各层错误提供 `From` 转换。
//! - 实现 `Serialize` 将错误序列化为字符串，便于宿主以 JSON 形式透传。

use serde::Serialize;

use crate::upload_pipeline::{ConfigError, PipelineError};

/// 应用级统一错误类型
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// 配置非法
    #[error("配置错误: {0}")]
    Config(#[from] ConfigError),

    /// 编排器操作失败（未知任务、状态不符、已关闭）
    #[error("{0}")]
    Pipeline(#[from] PipelineError),

    /// 文件系统 I/O 错误
    #[error("文件系统错误: {0}")]
    Io(#[from] std::io::Error),

    /// 设置文件无法解析或写入
    #[error("设置文件错误: {0}")]
    Settings(String),
}

impl Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}
