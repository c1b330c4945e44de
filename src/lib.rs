//! # 图片变换与上传流水线：库入口
//!
//! ## 架构总览
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                调用方（表单 / 命令行）                    │
//! │     add · set_transform · set_primary · commit · export   │
//! └───────┬──────────────────────────────────────────────────┘
//!         ↓ Result<T, PipelineError> / AddReport
//! ┌───────┼──────────────────────────────────────────────────┐
//! │       ↓            upload_pipeline                        │
//! │                                                          │
//! │  validation ──▶ geometry ──▶ render ──▶ orchestrator      │
//! │  (类型+体积)    (纯数学)     (离屏绘制)   (状态机+并发)    │
//! │                                              │           │
//! │  preview (RAII 缩略图)          store (RemoteStore)      │
//! └──────────────────────────────────────────────┼───────────┘
//!                                                ↓ multipart POST
//!                                           远端存储服务
//! ```
//!
//! ## 模块职责
//!
//! | 模块 | 职责 |
//! |------|------|
//! | [`error`] | 统一错误类型 `AppError`，供命令行与宿主应用使用 |
//! | [`geometry`] | 旋转外接框、裁剪框 → 源像素映射、视口收敛 |
//! | [`upload_pipeline`] | 校验、渲染、编排、预览、远端存储 |
//! | [`settings`] | 流水线设置文件的读写 |

pub mod error;
pub mod geometry;
pub mod settings;
pub mod upload_pipeline;
