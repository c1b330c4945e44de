//! # 错误模型模块
//!
//! ## 设计思路
//!
//! 按“错误在哪一层被消化”拆分枚举，而不是一个大而全的错误类型：
//!
//! | 类型 | 产生位置 | 去向 |
//! |------|----------|------|
//! | `ValidationError` | 校验闸门 / 入队 | 同步返回给 `add` 调用方，不创建任务 |
//! | `RenderFailure` | 渲染流水线 | 记录在任务上（`Failed`），不自动重试 |
//! | `UploadError` | 远端存储 | 记录在任务上（`Failed`），可手动重试 |
//! | `PipelineError` | 编排器操作误用 | 同步返回（未知任务、状态不符、已关闭） |
//! | `ConfigError` | 初始化 | 构造阶段失败 |
//!
//! 通过 `thiserror` 保持人类可读错误，同时让调用侧可按分支匹配；
//! `code()` / `stage()` 提供稳定字符串，供 UI 层做分支展示。

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use super::TaskId;

/// 文件校验失败原因。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("不支持的文件类型：{0}")]
    InvalidType(String),

    #[error("文件过大：{size} 字节（限制：{limit} 字节）")]
    TooLarge { size: u64, limit: u64 },

    #[error("图片数量已达上限：{limit}")]
    TooMany { limit: usize },

    #[error("图片无法解码：{0}")]
    Undecodable(String),
}

impl ValidationError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidType(_) => "E_INVALID_TYPE",
            Self::TooLarge { .. } => "E_TOO_LARGE",
            Self::TooMany { .. } => "E_TOO_MANY",
            Self::Undecodable(_) => "E_UNDECODABLE",
        }
    }
}

/// 渲染失败原因。对单次提交是致命的，不会自动重试。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderFailure {
    #[error("无法获取绘制表面：{0}")]
    SurfaceUnavailable(String),

    #[error("编码失败：{0}")]
    EncodeFailed(String),

    #[error("裁剪区域面积为零")]
    DegenerateCrop,
}

impl RenderFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::SurfaceUnavailable(_) => "E_SURFACE_UNAVAILABLE",
            Self::EncodeFailed(_) => "E_ENCODE_FAILED",
            Self::DegenerateCrop => "E_DEGENERATE_CROP",
        }
    }
}

/// 上传失败原因。可通过 `retry` 手动重试。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UploadError {
    #[error("网络错误：{0}")]
    NetworkFailure(String),

    #[error("远端拒绝：{0}")]
    RemoteRejected(String),
}

impl UploadError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::NetworkFailure(_) => "E_NETWORK",
            Self::RemoteRejected(_) => "E_REMOTE_REJECTED",
        }
    }
}

/// 任务失败原因：区分渲染阶段与上传阶段。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FailureReason {
    #[error(transparent)]
    Render(#[from] RenderFailure),

    #[error(transparent)]
    Upload(#[from] UploadError),
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Render(err) => err.code(),
            Self::Upload(err) => err.code(),
        }
    }

    pub fn stage(&self) -> &'static str {
        match self {
            Self::Render(_) => "render",
            Self::Upload(_) => "upload",
        }
    }
}

/// 前端只关心 `code / stage / message` 三个字段。
impl Serialize for FailureReason {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("FailureReason", 3)?;
        state.serialize_field("code", self.code())?;
        state.serialize_field("stage", self.stage())?;
        state.serialize_field("message", &self.to_string())?;
        state.end()
    }
}

/// 编排器操作误用。渲染/上传失败不会以此类型抛出。
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PipelineError {
    #[error("任务不存在：{0}")]
    TaskNotFound(TaskId),

    #[error("任务 {task} 状态不符：期望 {expected}，实际 {actual}")]
    InvalidState {
        task: TaskId,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("任务 {0} 没有本地图片，无法编辑或提交")]
    NotLocal(TaskId),

    #[error("任务 {task} 的视口非法：{reason}")]
    InvalidTransform { task: TaskId, reason: String },

    #[error("流水线已关闭")]
    Closed,

    #[error("当前线程没有可用的异步运行时")]
    NoRuntime,

    #[error("图片集合状态锁已中毒")]
    StatePoisoned,
}

impl PipelineError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::TaskNotFound(_) => "E_TASK_NOT_FOUND",
            Self::InvalidState { .. } => "E_INVALID_STATE",
            Self::NotLocal(_) => "E_NOT_LOCAL",
            Self::InvalidTransform { .. } => "E_INVALID_TRANSFORM",
            Self::Closed => "E_CLOSED",
            Self::NoRuntime => "E_NO_RUNTIME",
            Self::StatePoisoned => "E_STATE_POISONED",
        }
    }

    pub fn stage(&self) -> &'static str {
        "orchestrator"
    }
}

/// 配置错误，只会在初始化阶段出现。
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("允许的文件类型列表为空")]
    EmptyAllowList,

    #[error("文件体积上限不能为 0")]
    ZeroSizeLimit,

    #[error("图片数量上限不能为 0")]
    ZeroImageLimit,

    #[error("并发上传上限不能为 0")]
    ZeroConcurrency,

    #[error("裁剪宽高比非法：{0}")]
    InvalidAspectRatio(f64),

    #[error("上传地址非法：{0}")]
    InvalidEndpoint(String),

    #[error("配置非法：{0}")]
    Invalid(String),
}
