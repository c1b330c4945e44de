//! # 渲染流水线
//!
//! ## 设计思路
//!
//! 两阶段离屏绘制，纯 CPU、无网络：
//!
//! ```text
//! SourceImage ──(1) 旋转外接框表面：居中绘制 + 绕中心旋转──▶ rotated surface
//!             ──(2) source_crop_rect 映射 + 子矩形拷贝──────▶ crop surface
//!             ──(3) 可选降采样 ──(4) 固定格式/质量编码──────▶ CropResult
//! ```
//!
//! ## 实现思路
//!
//! - 整直角走 `imageops::rotate90/180/270` 无损旋转；任意角度走
//!   `imageproc::geometric_transformations::rotate_about_center`（双线性插值，透明填充）。
//!   任意角度先在 `max(源图, 外接框)` 画布上旋转，再取居中的外接框窗口，源图不会被提前裁掉。
//! - 表面分配前按像素上限检查，超限或溢出即 `SurfaceUnavailable`。
//! - 映射结果零面积即 `DegenerateCrop`，不会产出空文件。
//! - 编码格式与质量是渲染常量，调用方无法通过视口改变。

use std::borrow::Cow;
use std::io::Cursor;
use std::time::Instant;

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat, Rgba, RgbaImage, imageops};
use imageproc::geometric_transformations::{Interpolation, rotate_about_center};

use super::config::{OutputFormat, RENDER_OUTPUT_FORMAT, RENDER_OUTPUT_QUALITY};
use super::resize::downscale_to_fit;
use super::{CropResult, PipelineConfig, RenderFailure, SourceImage};
use crate::geometry::{self, ViewportTransform};

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// 渲染参数。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderSettings {
    pub format: OutputFormat,
    pub quality: u8,
    pub max_surface_pixels: u64,
    pub max_output_dimension: Option<u32>,
}

impl Default for RenderSettings {
    fn default() -> Self {
        Self {
            format: RENDER_OUTPUT_FORMAT,
            quality: RENDER_OUTPUT_QUALITY,
            max_surface_pixels: PipelineConfig::default().max_surface_pixels,
            max_output_dimension: None,
        }
    }
}

impl RenderSettings {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            max_surface_pixels: config.max_surface_pixels,
            max_output_dimension: config.max_output_dimension,
            ..Self::default()
        }
    }
}

/// 渲染流水线。无状态，可在阻塞线程池中并行使用。
#[derive(Debug, Clone, Default)]
pub struct RenderPipeline {
    settings: RenderSettings,
}

impl RenderPipeline {
    pub fn new(settings: RenderSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &RenderSettings {
        &self.settings
    }

    /// 按视口渲染裁剪结果。
    pub fn render(
        &self,
        source: &SourceImage,
        viewport: &ViewportTransform,
    ) -> Result<CropResult, RenderFailure> {
        let viewport = viewport.normalized();
        let total_start = Instant::now();

        let rotate_start = Instant::now();
        let rotated = self.draw_rotated(source.pixels(), viewport.rotation_degrees)?;
        let rotate_elapsed = rotate_start.elapsed();

        let crop_start = Instant::now();
        let rect = geometry::source_crop_rect(
            &viewport,
            rotated.width(),
            rotated.height(),
            viewport.rendered_size.width,
            viewport.rendered_size.height,
        );
        if rect.is_empty() {
            log::warn!(
                "⚠️ 裁剪区域面积为零 - 文件: {} 裁剪框: {:?}",
                source.file_name(),
                viewport.crop
            );
            return Err(RenderFailure::DegenerateCrop);
        }
        self.check_surface(rect.width, rect.height)?;
        let cropped = imageops::crop_imm(&*rotated, rect.x, rect.y, rect.width, rect.height)
            .to_image();
        drop(rotated);
        let cropped = match self.settings.max_output_dimension {
            Some(max) => downscale_to_fit(&cropped, max).unwrap_or(cropped),
            None => cropped,
        };
        let crop_elapsed = crop_start.elapsed();

        let encode_start = Instant::now();
        let result = self.encode(cropped)?;
        let encode_elapsed = encode_start.elapsed();

        log::info!(
            "✅ 渲染完成 - 文件: {} 输出: {}x{} {} 字节 rotate={}ms crop={}ms encode={}ms total={}ms",
            source.file_name(),
            result.width,
            result.height,
            result.size(),
            rotate_elapsed.as_millis(),
            crop_elapsed.as_millis(),
            encode_elapsed.as_millis(),
            total_start.elapsed().as_millis()
        );

        Ok(result)
    }

    /// 原图直传：不经过任何绘制，载荷即原始字节。
    pub fn render_original(&self, source: &SourceImage) -> CropResult {
        CropResult {
            bytes: source.original().clone(),
            width: source.width(),
            height: source.height(),
            mime_type: source.mime_type().to_string(),
        }
    }

    /// 第一阶段：得到旋转外接框尺寸的表面，源图居中并按角度顺时针旋转。
    fn draw_rotated<'a>(
        &self,
        pixels: &'a RgbaImage,
        rotation_degrees: f64,
    ) -> Result<Cow<'a, RgbaImage>, RenderFailure> {
        let (width, height) = pixels.dimensions();
        let (surface_width, surface_height) =
            geometry::rotated_pixel_bounds(width, height, rotation_degrees);
        self.check_surface(surface_width, surface_height)?;

        let rotated = match geometry::quarter_turns(rotation_degrees) {
            Some(0) => Cow::Borrowed(pixels),
            Some(1) => Cow::Owned(imageops::rotate90(pixels)),
            Some(2) => Cow::Owned(imageops::rotate180(pixels)),
            Some(_) => Cow::Owned(imageops::rotate270(pixels)),
            None => {
                // 画布同时容纳源图与外接框
                let canvas_width = width.max(surface_width);
                let canvas_height = height.max(surface_height);
                self.check_surface(canvas_width, canvas_height)?;

                let mut canvas = RgbaImage::from_pixel(canvas_width, canvas_height, TRANSPARENT);
                let offset_x = (canvas_width - width) / 2;
                let offset_y = (canvas_height - height) / 2;
                imageops::overlay(&mut canvas, pixels, offset_x as i64, offset_y as i64);

                let theta = geometry::normalize_degrees(rotation_degrees).to_radians() as f32;
                let rotated =
                    rotate_about_center(&canvas, theta, Interpolation::Bilinear, TRANSPARENT);
                drop(canvas);

                let window_x = (canvas_width - surface_width) / 2;
                let window_y = (canvas_height - surface_height) / 2;
                if (window_x, window_y) == (0, 0)
                    && rotated.dimensions() == (surface_width, surface_height)
                {
                    Cow::Owned(rotated)
                } else {
                    Cow::Owned(
                        imageops::crop_imm(
                            &rotated,
                            window_x,
                            window_y,
                            surface_width,
                            surface_height,
                        )
                        .to_image(),
                    )
                }
            }
        };

        Ok(rotated)
    }

    /// 表面分配前的资源检查。
    fn check_surface(&self, width: u32, height: u32) -> Result<(), RenderFailure> {
        if width == 0 || height == 0 {
            return Err(RenderFailure::SurfaceUnavailable(format!(
                "表面尺寸为 0：{}x{}",
                width, height
            )));
        }

        let pixels = (width as u64)
            .checked_mul(height as u64)
            .ok_or_else(|| RenderFailure::SurfaceUnavailable("表面像素数溢出".to_string()))?;

        if pixels > self.settings.max_surface_pixels {
            return Err(RenderFailure::SurfaceUnavailable(format!(
                "表面像素过大：{}x{}（限制：{} 像素）",
                width, height, self.settings.max_surface_pixels
            )));
        }

        Ok(())
    }

    fn encode(&self, image: RgbaImage) -> Result<CropResult, RenderFailure> {
        let (width, height) = image.dimensions();
        let mut cursor = Cursor::new(Vec::new());

        match self.settings.format {
            OutputFormat::Jpeg => {
                // JPEG 不支持 alpha，透明区域落为黑色
                let rgb = DynamicImage::ImageRgba8(image).to_rgb8();
                let mut encoder = JpegEncoder::new_with_quality(&mut cursor, self.settings.quality);
                encoder
                    .encode_image(&rgb)
                    .map_err(|e| RenderFailure::EncodeFailed(format!("JPEG 编码失败：{}", e)))?;
            }
            OutputFormat::Png => {
                image
                    .write_to(&mut cursor, ImageFormat::Png)
                    .map_err(|e| RenderFailure::EncodeFailed(format!("PNG 编码失败：{}", e)))?;
            }
        }

        let bytes = cursor.into_inner();
        if bytes.is_empty() {
            return Err(RenderFailure::EncodeFailed("编码结果为空".to_string()));
        }

        Ok(CropResult {
            bytes: Bytes::from(bytes),
            width,
            height,
            mime_type: self.settings.format.mime_type().to_string(),
        })
    }
}
