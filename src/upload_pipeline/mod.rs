//! # 图片变换与上传流水线（upload_pipeline）
//!
//! ## 设计思路
//!
//! 将“选择图片 → 校验 → 裁剪/缩放/旋转 → 渲染 → 上传 → 导出”按职责拆分为多个子模块，
//! 数据单向流动，下层模块不感知上层：
//!
//! - `validation`：MIME 白名单 + 体积上限（纯同步）
//! - `render`：两阶段离屏绘制 + 编码（依赖 `crate::geometry`）
//! - `orchestrator`：有序任务集合、状态机、主图不变量、并发上传、读模型导出
//! - `preview`：预览缩略图注册表（RAII 释放）
//! - `store`：远端存储抽象与 HTTP 实现
//! - `task`：任务、状态与集合模型
//! - `config/error/source/resize`：配置、错误、中间数据模型、降采样
//!
//! ## 新同事快速上手
//!
//! ```text
//! 调用方 add(files)
//!    ↓
//! validation.rs（类型 + 体积）
//!    ↓
//! orchestrator.rs（数量上限 → 解码 → 预览 → Pending 任务）
//!    ↓ set_transform / set_primary / remove
//! orchestrator.rs commit
//!    ├─ render.rs（旋转表面 → 裁剪映射 → 编码）
//!    └─ store.rs（multipart 上传）
//!    ↓
//! export_set() → [{ taskId, source, isPrimary, preview, status }]
//! ```
//!
//! ## 分层职责建议
//!
//! - 裁剪坐标问题优先看 `geometry.rs` 的 `source_crop_rect`
//! - 输出格式/质量调整改 `config.rs` 的渲染常量
//! - 状态流转或并发问题优先看 `orchestrator.rs`
//! - 对接新的存储后端只需实现 `RemoteStore`

mod config;
mod error;
mod orchestrator;
mod preview;
mod render;
mod resize;
mod source;
mod store;
mod task;
mod validation;

pub use config::{
    DEFAULT_ALLOWED_TYPES, DEFAULT_UPLOAD_CONCURRENCY, OutputFormat, PipelineConfig,
    RENDER_OUTPUT_FORMAT, RENDER_OUTPUT_QUALITY,
};
pub use error::{
    ConfigError, FailureReason, PipelineError, RenderFailure, UploadError, ValidationError,
};
pub use orchestrator::{AddReport, Rejection, UploadOrchestrator};
pub use preview::{PreviewHandle, PreviewId, PreviewRef, PreviewRegistry};
pub use render::{RenderPipeline, RenderSettings};
pub use source::{CandidateFile, CropResult, SourceImage};
pub use store::{DisabledStore, HttpRemoteStore, RemoteStore, UploadPayload};
pub use task::{ExportedImage, ExportedSource, ImageSet, TaskId, TaskSource, TaskStatus, UploadTask};
pub use validation::ValidationGate;
