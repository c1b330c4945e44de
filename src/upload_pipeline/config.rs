//! # 配置模块
//!
//! ## 设计思路
//!
//! 将所有“可调策略”集中到 `PipelineConfig`，保证运行时行为可观测、可调整、可测试。
//! 上游表单传入的选项（数量/体积/类型/比例/仅预览）与内部资源上限放在同一结构中，
//! 由 `validate` 在构造阶段一次性校验，运行期不再出现“配置类”失败。
//!
//! ## 实现思路
//!
//! - `Default` 提供生产可用的默认配置。
//! - `serde(default)` 允许设置文件只覆盖部分字段。
//! - 输出编码格式与质量是渲染常量（`RENDER_OUTPUT_*`），不暴露给上游表单。

use serde::{Deserialize, Serialize};

use super::ConfigError;

/// 并发上传默认上限。
pub const DEFAULT_UPLOAD_CONCURRENCY: usize = 3;

/// 渲染输出编码格式。
pub const RENDER_OUTPUT_FORMAT: OutputFormat = OutputFormat::Jpeg;

/// 渲染输出编码质量（1~100）。
pub const RENDER_OUTPUT_QUALITY: u8 = 92;

/// 默认允许的栅格图片类型。
pub const DEFAULT_ALLOWED_TYPES: &[&str] = &[
    "image/jpeg",
    "image/png",
    "image/webp",
    "image/gif",
    "image/bmp",
];

/// 渲染结果的编码格式。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    pub fn mime_type(self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpeg => "jpg",
            Self::Png => "png",
        }
    }
}

/// 图片变换与上传流水线配置。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct PipelineConfig {
    /// 图片集合允许的最大数量。
    pub max_images: usize,
    /// 单个文件允许的最大体积（字节）。
    pub max_size_bytes: u64,
    /// 允许的 MIME 类型白名单。
    pub allowed_types: Vec<String>,
    /// 裁剪框宽高比（宽 / 高），`None` 表示自由裁剪。
    pub aspect_ratio: Option<f64>,
    /// 仅预览：`commit` 只产出裁剪结果，不调用远端上传。
    pub preview_only: bool,
    /// 同时进行中的提交（渲染 + 上传）数量上限。
    pub upload_concurrency: usize,
    /// 远端存储目标目录。
    pub target_directory: String,
    /// 解码后的像素上限（`width * height`），在完整解码前按文件头检查。
    pub max_decoded_pixels: u64,
    /// 离屏绘制表面的像素上限，超过即视为无法获取绘制表面。
    pub max_surface_pixels: u64,
    /// 预览缩略图单边最大值。
    pub preview_max_dimension: u32,
    /// 渲染结果单边最大值，`None` 表示保持裁剪后的原始分辨率。
    pub max_output_dimension: Option<u32>,
    /// 建立连接（TCP/TLS）超时时间（秒）。
    pub connect_timeout_secs: u64,
    /// 单次上传请求的总超时时间（秒）。
    pub upload_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_images: 10,
            max_size_bytes: 10 * 1024 * 1024,
            allowed_types: DEFAULT_ALLOWED_TYPES.iter().map(|t| t.to_string()).collect(),
            aspect_ratio: None,
            preview_only: false,
            upload_concurrency: DEFAULT_UPLOAD_CONCURRENCY,
            target_directory: "images".to_string(),
            max_decoded_pixels: 40_000_000,
            max_surface_pixels: 80_000_000,
            preview_max_dimension: 320,
            max_output_dimension: None,
            connect_timeout_secs: 8,
            upload_timeout_secs: 30,
        }
    }
}

impl PipelineConfig {
    /// 校验配置合法性。
    ///
    /// 空白名单、零体积上限等属于“配置错误”，必须在初始化阶段拦截，
    /// 而不是在运行期表现为校验失败。
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.allowed_types.iter().all(|t| t.trim().is_empty()) {
            return Err(ConfigError::EmptyAllowList);
        }
        if self.max_size_bytes == 0 {
            return Err(ConfigError::ZeroSizeLimit);
        }
        if self.max_images == 0 {
            return Err(ConfigError::ZeroImageLimit);
        }
        if self.upload_concurrency == 0 {
            return Err(ConfigError::ZeroConcurrency);
        }
        if let Some(aspect) = self.aspect_ratio {
            if !aspect.is_finite() || aspect <= 0.0 {
                return Err(ConfigError::InvalidAspectRatio(aspect));
            }
        }
        if self.max_decoded_pixels == 0 || self.max_surface_pixels == 0 {
            return Err(ConfigError::Invalid("像素上限必须大于 0".to_string()));
        }
        if self.preview_max_dimension == 0 || self.max_output_dimension == Some(0) {
            return Err(ConfigError::Invalid("预览/输出尺寸上限必须大于 0".to_string()));
        }
        if !(1..=120).contains(&self.connect_timeout_secs) {
            return Err(ConfigError::Invalid("connectTimeoutSecs 必须在 1~120 秒之间".to_string()));
        }
        if !(1..=600).contains(&self.upload_timeout_secs) {
            return Err(ConfigError::Invalid("uploadTimeoutSecs 必须在 1~600 秒之间".to_string()));
        }

        Ok(())
    }
}
