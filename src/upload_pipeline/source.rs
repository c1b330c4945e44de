//! # 数据源与中间模型
//!
//! ## 设计思路
//!
//! 将“外部输入”和“流水线中间结果”解耦：
//! - `CandidateFile` 表示调用方递交的候选文件（名称、声明类型、原始字节）
//! - `SourceImage` 表示已通过校验并完成解码的源图（不可变）
//! - `CropResult` 表示渲染或原图直传时最终要交付的二进制载荷
//!
//! ## 实现思路
//!
//! 解码沿用“先读文件头尺寸 → 按像素上限快速拒绝 → 再完整解码”的顺序，
//! 降低恶意输入触发高内存开销的风险。解码后的像素统一为 RGBA8，
//! 渲染阶段无需再区分色彩类型。

use std::io::Cursor;
use std::path::Path;

use bytes::Bytes;
use image::RgbaImage;
use serde::Serialize;

use super::ValidationError;

/// 调用方递交的候选文件。
#[derive(Debug, Clone)]
pub struct CandidateFile {
    /// 文件名（仅用于展示与生成上传文件名）。
    pub file_name: String,
    /// 声明的 MIME 类型，可为空（由校验闸门按文件签名识别）。
    pub mime_type: String,
    /// 原始字节。
    pub bytes: Bytes,
}

impl CandidateFile {
    pub fn new(
        file_name: impl Into<String>,
        mime_type: impl Into<String>,
        bytes: impl Into<Bytes>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            mime_type: mime_type.into(),
            bytes: bytes.into(),
        }
    }

    /// 从本地路径读取候选文件，MIME 类型按文件签名（magic bytes）识别。
    pub fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let mime_type = infer::get(&bytes)
            .map(|kind| kind.mime_type().to_string())
            .unwrap_or_default();
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "image".to_string());

        log::debug!("📁 读取本地图片 - 路径: {} 类型: {}", path.display(), mime_type);

        Ok(Self::new(file_name, mime_type, bytes))
    }

    /// 文件体积（字节）。
    pub fn size(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// 已接受的源图：固有尺寸、解码后像素与原始载荷。
///
/// 创建后不可变。任务与进行中的渲染通过 `Arc` 共享，
/// 最后一个持有者释放时像素缓冲随之释放。
#[derive(Debug)]
pub struct SourceImage {
    file_name: String,
    mime_type: String,
    pixels: RgbaImage,
    original: Bytes,
}

impl SourceImage {
    /// 解码候选文件。`mime_type` 为校验闸门确认后的类型。
    pub(crate) fn decode(
        file: &CandidateFile,
        mime_type: String,
        max_decoded_pixels: u64,
    ) -> Result<Self, ValidationError> {
        let (header_width, header_height) = inspect_dimensions(&file.bytes)?;
        validate_pixel_limit(header_width, header_height, max_decoded_pixels)?;

        let decoded = image::load_from_memory(&file.bytes)
            .map_err(|e| ValidationError::Undecodable(format!("图片解码失败：{}", e)))?;
        let pixels = decoded.to_rgba8();
        validate_pixel_limit(pixels.width(), pixels.height(), max_decoded_pixels)?;

        log::info!(
            "✅ 图片解码成功 - 文件: {} 类型: {} 尺寸: {}x{}",
            file.file_name,
            mime_type,
            pixels.width(),
            pixels.height()
        );

        Ok(Self {
            file_name: file.file_name.clone(),
            mime_type,
            pixels,
            original: file.bytes.clone(),
        })
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn mime_type(&self) -> &str {
        &self.mime_type
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    pub fn original(&self) -> &Bytes {
        &self.original
    }
}

/// 仅通过图片头信息读取宽高，用于在完整解码前做像素限制检查。
fn inspect_dimensions(bytes: &[u8]) -> Result<(u32, u32), ValidationError> {
    image::ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| ValidationError::Undecodable(format!("无法识别图片格式：{}", e)))?
        .into_dimensions()
        .map_err(|e| ValidationError::Undecodable(format!("无法读取图片尺寸：{}", e)))
}

fn validate_pixel_limit(width: u32, height: u32, limit: u64) -> Result<(), ValidationError> {
    let pixels = (width as u64) * (height as u64);
    if pixels == 0 {
        return Err(ValidationError::Undecodable("图片尺寸为 0".to_string()));
    }
    if pixels > limit {
        return Err(ValidationError::Undecodable(format!(
            "图片像素过大：{} 像素（限制：{} 像素）",
            pixels, limit
        )));
    }
    Ok(())
}

/// 渲染（或原图直传）的最终载荷。生成后不可变。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CropResult {
    #[serde(skip)]
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
    pub mime_type: String,
}

impl CropResult {
    /// 载荷体积（字节）。
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}
