//! # 降采样
//!
//! 预览缩略图与渲染结果的尺寸上限共用同一套降采样逻辑：
//! 优先使用 `fast_image_resize`（SIMD 卷积），失败时回退到 `image::imageops::resize`。

use fast_image_resize as fr;
use image::imageops::{self, FilterType};
use image::RgbaImage;

use super::RenderFailure;

/// 按单边上限等比缩放后的目标尺寸，结果至少为 1×1。
pub(crate) fn fit_within(width: u32, height: u32, max_dimension: u32) -> (u32, u32) {
    if width <= max_dimension && height <= max_dimension {
        return (width, height);
    }

    let scale = (max_dimension as f64 / width as f64).min(max_dimension as f64 / height as f64);
    let target_width = ((width as f64 * scale).floor() as u32).max(1);
    let target_height = ((height as f64 * scale).floor() as u32).max(1);
    (target_width, target_height)
}

/// 超出上限时返回降采样后的新图，未超出返回 `None`。
pub(crate) fn downscale_to_fit(image: &RgbaImage, max_dimension: u32) -> Option<RgbaImage> {
    let (width, height) = image.dimensions();
    let (target_width, target_height) = fit_within(width, height, max_dimension);
    if (target_width, target_height) == (width, height) {
        return None;
    }

    log::debug!(
        "🧩 降采样：{}x{} -> {}x{}",
        width,
        height,
        target_width,
        target_height
    );

    match resize_with_fast_image_resize(image, target_width, target_height) {
        Ok(resized) => Some(resized),
        Err(err) => {
            log::warn!("⚠️ fast_image_resize 降采样失败，回退 imageops::resize：{}", err);
            Some(imageops::resize(
                image,
                target_width,
                target_height,
                FilterType::Triangle,
            ))
        }
    }
}

fn resize_with_fast_image_resize(
    image: &RgbaImage,
    target_width: u32,
    target_height: u32,
) -> Result<RgbaImage, RenderFailure> {
    let (src_width, src_height) = image.dimensions();

    let src_image = fr::images::Image::from_vec_u8(
        src_width,
        src_height,
        image.as_raw().clone(),
        fr::PixelType::U8x4,
    )
    .map_err(|e| RenderFailure::SurfaceUnavailable(format!("构建源图像缓冲失败：{}", e)))?;

    let mut dst_image = fr::images::Image::new(target_width, target_height, fr::PixelType::U8x4);

    let mut resizer = fr::Resizer::new();
    let options = fr::ResizeOptions::new()
        .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear));

    resizer
        .resize(&src_image, &mut dst_image, Some(&options))
        .map_err(|e| RenderFailure::SurfaceUnavailable(format!("fast_image_resize 执行失败：{}", e)))?;

    RgbaImage::from_raw(target_width, target_height, dst_image.into_vec())
        .ok_or_else(|| RenderFailure::SurfaceUnavailable("降采样输出缓冲长度异常".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    #[test]
    fn fit_within_keeps_aspect_ratio() {
        assert_eq!(fit_within(4000, 2000, 320), (320, 160));
        assert_eq!(fit_within(100, 3000, 300), (10, 300));
        assert_eq!(fit_within(200, 100, 320), (200, 100));
        assert_eq!(fit_within(10_000, 1, 100), (100, 1));
    }

    #[test]
    fn downscale_skips_small_images() {
        let image = RgbaImage::from_pixel(16, 16, Rgba([1, 2, 3, 255]));
        assert!(downscale_to_fit(&image, 32).is_none());
    }

    #[test]
    fn downscale_shrinks_large_images() {
        let image = RgbaImage::from_pixel(640, 480, Rgba([200, 100, 50, 255]));
        let resized = downscale_to_fit(&image, 64).expect("image should be resized");

        assert_eq!(resized.dimensions(), (64, 48));
        let pixel = resized.get_pixel(10, 10);
        for (actual, expected) in pixel.0.iter().zip([200u8, 100, 50, 255]) {
            assert!(actual.abs_diff(expected) <= 1);
        }
    }
}
