//! # 几何引擎
//!
//! 把“旋转 + 缩放 + 裁剪框”映射回源像素坐标的全部数学集中在这里。
//!
//! ## 设计思路
//!
//! - 算法纯函数化：输入为尺寸、角度与视口，输出唯一结果，不依赖任何绘制表面，便于属性测试。
//! - 先算理想值，再做边界收敛，保证输出坐标永不为负、永不越界。
//! - 对异常输入（NaN、零尺寸、缩放 < 1）给出安全回退，由调用方决定是否视为退化裁剪。
//!
//! ## 坐标约定
//!
//! ```text
//! 源图 (w × h) ──旋转θ──▶ 旋转外接框 (bw × bh) ──缩放到显示尺寸 × zoom──▶ 视口显示坐标
//!                                                              │
//!                                     裁剪框 crop {x, y, width, height}（显示坐标）
//! ```
//!
//! `rendered_size` 是旋转后的图片在 zoom = 1.0 时的显示尺寸；
//! zoom 放大后图片显示为 `rendered_size × zoom`，裁剪框始终位于这个范围内。

use serde::{Deserialize, Serialize};

/// 判断“整直角”时允许的角度误差（度）。
const RIGHT_ANGLE_EPSILON: f64 = 1e-9;

/// 浮点尺寸（显示坐标或旋转外接框）。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Size {
    pub width: f64,
    pub height: f64,
}

impl Size {
    pub const fn new(width: f64, height: f64) -> Self {
        Self { width, height }
    }

    /// 宽高均为有限正数时才可用于绘制或映射。
    pub fn is_drawable(&self) -> bool {
        self.width.is_finite() && self.height.is_finite() && self.width > 0.0 && self.height > 0.0
    }

    pub fn scaled(&self, factor: f64) -> Self {
        Self::new(self.width * factor, self.height * factor)
    }
}

/// 显示坐标系下的矩形。
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub const fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    pub fn has_area(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }
}

/// 源像素坐标系下的整数矩形。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// 零面积矩形（宽或高为 0）。
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    pub fn right(&self) -> u64 {
        self.x as u64 + self.width as u64
    }

    pub fn bottom(&self) -> u64 {
        self.y as u64 + self.height as u64
    }
}

/// 交互编辑期间的视口变换。
///
/// 只在一次编辑会话内存在，不做持久化。
/// 不变量：`crop` 完整落在 `[0, rendered.width × zoom] × [0, rendered.height × zoom]` 内，
/// 通过 [`ViewportTransform::normalized`] 收敛。
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ViewportTransform {
    /// 裁剪框（显示坐标，相对缩放后图片的左上角）。
    pub crop: Rect,
    /// 缩放倍数，1.0 表示整张图完整显示在视口内。
    pub zoom: f64,
    /// 旋转角度（度），连续取值，顺时针为正。
    pub rotation_degrees: f64,
    /// 旋转后图片在 zoom = 1.0 时的显示尺寸，须与源图旋转外接框同比例。
    pub rendered_size: Size,
}

impl ViewportTransform {
    /// 编辑会话的初始视口：不旋转、不缩放，裁剪框为居中的最大比例框。
    pub fn initial(rendered_size: Size, aspect_ratio: Option<f64>) -> Self {
        Self::centered(rendered_size, 1.0, 0.0, aspect_ratio)
    }

    /// 以视口中心为锚点构造变换。
    ///
    /// 裁剪窗口大小取 zoom = 1.0 时的居中比例框，放大后图片变大、窗口不变，
    /// 与交互式裁剪器“滚轮放大”的表现一致。
    pub fn centered(
        rendered_size: Size,
        zoom: f64,
        rotation_degrees: f64,
        aspect_ratio: Option<f64>,
    ) -> Self {
        let zoom = normalize_zoom(zoom);
        let window = centered_crop(rendered_size, aspect_ratio);
        let zoomed = rendered_size.scaled(zoom);
        let crop = Rect::new(
            (zoomed.width - window.width) / 2.0,
            (zoomed.height - window.height) / 2.0,
            window.width,
            window.height,
        );

        Self {
            crop,
            zoom,
            rotation_degrees,
            rendered_size,
        }
        .normalized()
    }

    /// 缩放后的图片显示范围。
    pub fn zoomed_bounds(&self) -> Size {
        self.rendered_size.scaled(normalize_zoom(self.zoom))
    }

    /// 收敛到合法视口：zoom ≥ 1.0、角度为有限值、裁剪框位于缩放后的显示范围内。
    pub fn normalized(&self) -> Self {
        let zoom = normalize_zoom(self.zoom);
        let rotation_degrees = if self.rotation_degrees.is_finite() {
            self.rotation_degrees
        } else {
            0.0
        };
        let bounds = self.rendered_size.scaled(zoom);

        Self {
            crop: clamp_rect(self.crop, bounds),
            zoom,
            rotation_degrees,
            rendered_size: self.rendered_size,
        }
    }

    /// 在 [`normalized`](Self::normalized) 的基础上把裁剪框约束到指定宽高比。
    pub fn normalized_with_aspect(&self, aspect_ratio: Option<f64>) -> Self {
        let mut normalized = self.normalized();
        normalized.crop = constrain_aspect(normalized.crop, aspect_ratio);
        normalized
    }
}

/// 缩放倍数兜底：非有限值或小于 1.0 一律视为 1.0。
pub fn normalize_zoom(zoom: f64) -> f64 {
    if zoom.is_finite() && zoom >= 1.0 { zoom } else { 1.0 }
}

/// 角度归一化到 `[0, 360)`；非有限值返回 0。
pub fn normalize_degrees(degrees: f64) -> f64 {
    if !degrees.is_finite() {
        return 0.0;
    }
    let normalized = degrees.rem_euclid(360.0);
    // rem_euclid 对极小负数可能得到 360.0
    if normalized >= 360.0 { 0.0 } else { normalized }
}

/// 若角度是 90° 的整数倍，返回顺时针四分之一圈数（0..=3）。
pub fn quarter_turns(degrees: f64) -> Option<u8> {
    let normalized = normalize_degrees(degrees);
    let turns = (normalized / 90.0).round();
    if (normalized - turns * 90.0).abs() < RIGHT_ANGLE_EPSILON {
        Some((turns as u8) % 4)
    } else {
        None
    }
}

/// 计算 `width × height` 矩形绕中心旋转后的轴对齐外接框。
///
/// `bw = |cos θ|·w + |sin θ|·h`，`bh = |sin θ|·w + |cos θ|·h`，对任意角度成立。
pub fn rotated_bounds(width: f64, height: f64, rotation_degrees: f64) -> Size {
    let theta = rotation_degrees.to_radians();
    let (sin, cos) = theta.sin_cos();
    let (sin, cos) = (sin.abs(), cos.abs());

    Size::new(cos * width + sin * height, sin * width + cos * height)
}

/// 旋转外接框的整数像素尺寸，用于分配离屏绘制表面。
///
/// 整直角直接交换宽高，避免 `cos(90°)` 的浮点残差让尺寸多出 1 像素。
pub fn rotated_pixel_bounds(width: u32, height: u32, rotation_degrees: f64) -> (u32, u32) {
    match quarter_turns(rotation_degrees) {
        Some(0) | Some(2) => (width, height),
        Some(_) => (height, width),
        None => {
            let bounds = rotated_bounds(width as f64, height as f64, rotation_degrees);
            (
                bounds.width.round().clamp(0.0, u32::MAX as f64) as u32,
                bounds.height.round().clamp(0.0, u32::MAX as f64) as u32,
            )
        }
    }
}

/// 把显示坐标下的裁剪框映射回源像素矩形。
///
/// 依次逆向应用 zoom 与“显示 → 源”的缩放比例，四条边各自取整后收敛到
/// `[0, source_width] × [0, source_height]`。越界的拖拽请求被静默截断，
/// 不会产生负数或超范围坐标。
///
/// 显示尺寸非法（非有限值、≤ 0）或源尺寸为 0 时返回空矩形，
/// 由渲染流水线报告为退化裁剪。
pub fn source_crop_rect(
    viewport: &ViewportTransform,
    source_width: u32,
    source_height: u32,
    rendered_width: f64,
    rendered_height: f64,
) -> PixelRect {
    let rendered = Size::new(rendered_width, rendered_height);
    if !rendered.is_drawable() || source_width == 0 || source_height == 0 {
        return PixelRect::default();
    }

    let zoom = normalize_zoom(viewport.zoom);
    let scale_x = source_width as f64 / (rendered_width * zoom);
    let scale_y = source_height as f64 / (rendered_height * zoom);

    let crop = viewport.crop;
    let (x, width) = map_axis(crop.x, crop.width, scale_x, source_width);
    let (y, height) = map_axis(crop.y, crop.height, scale_y, source_height);

    PixelRect::new(x, y, width, height)
}

/// 单轴映射：起点与终点分别取整并收敛，返回 `(起点, 长度)`。
fn map_axis(start: f64, length: f64, scale: f64, limit: u32) -> (u32, u32) {
    let start = if start.is_finite() { start } else { 0.0 };
    let length = if length.is_finite() { length.max(0.0) } else { 0.0 };
    let limit = limit as f64;

    let low = (start * scale).round().clamp(0.0, limit) as u32;
    let high = ((start + length) * scale).round().clamp(0.0, limit) as u32;

    (low, high.saturating_sub(low))
}

/// 在 `bounds` 内取居中的最大矩形；给定宽高比时按比例收缩。
pub fn centered_crop(bounds: Size, aspect_ratio: Option<f64>) -> Rect {
    if !bounds.is_drawable() {
        return Rect::default();
    }

    let full = Rect::new(0.0, 0.0, bounds.width, bounds.height);
    constrain_aspect(full, aspect_ratio)
}

/// 把矩形收缩为指定宽高比，保持中心不变。非法比例原样返回。
pub fn constrain_aspect(rect: Rect, aspect_ratio: Option<f64>) -> Rect {
    let Some(aspect) = aspect_ratio.filter(|a| a.is_finite() && *a > 0.0) else {
        return rect;
    };
    if !rect.has_area() {
        return rect;
    }

    let (width, height) = if rect.width / rect.height > aspect {
        (rect.height * aspect, rect.height)
    } else {
        (rect.width, rect.width / aspect)
    };

    Rect::new(
        rect.x + (rect.width - width) / 2.0,
        rect.y + (rect.height - height) / 2.0,
        width,
        height,
    )
}

/// 把矩形收敛到 `[0, bounds.width] × [0, bounds.height]`。
///
/// 先限制尺寸，再平移位置，所以拖出边界的裁剪框会被“推回”而不是被削小。
pub fn clamp_rect(rect: Rect, bounds: Size) -> Rect {
    if !bounds.is_drawable() {
        return Rect::default();
    }

    let finite_or_zero = |v: f64| if v.is_finite() { v } else { 0.0 };

    let width = finite_or_zero(rect.width).clamp(0.0, bounds.width);
    let height = finite_or_zero(rect.height).clamp(0.0, bounds.height);
    let x = finite_or_zero(rect.x).clamp(0.0, bounds.width - width);
    let y = finite_or_zero(rect.y).clamp(0.0, bounds.height - height);

    Rect::new(x, y, width, height)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    fn viewport(crop: Rect, zoom: f64, rendered: Size) -> ViewportTransform {
        ViewportTransform {
            crop,
            zoom,
            rotation_degrees: 0.0,
            rendered_size: rendered,
        }
    }

    #[test]
    fn rotated_bounds_identity() {
        let size = rotated_bounds(100.0, 50.0, 0.0);
        assert!(approx(size.width, 100.0));
        assert!(approx(size.height, 50.0));
    }

    #[test]
    fn rotated_bounds_right_angle_swaps_axes() {
        let size = rotated_bounds(100.0, 50.0, 90.0);
        assert!(approx(size.width, 50.0));
        assert!(approx(size.height, 100.0));
    }

    #[test]
    fn rotated_bounds_diagonal() {
        let size = rotated_bounds(100.0, 100.0, 45.0);
        assert!((size.width - 141.421).abs() < 0.01);
        assert!((size.height - 141.421).abs() < 0.01);
    }

    #[test]
    fn rotated_bounds_negative_angle_matches_positive() {
        let a = rotated_bounds(320.0, 200.0, -30.0);
        let b = rotated_bounds(320.0, 200.0, 30.0);
        assert!(approx(a.width, b.width));
        assert!(approx(a.height, b.height));
    }

    #[test]
    fn rotated_pixel_bounds_exact_for_quarter_turns() {
        assert_eq!(rotated_pixel_bounds(100, 50, 90.0), (50, 100));
        assert_eq!(rotated_pixel_bounds(100, 50, 180.0), (100, 50));
        assert_eq!(rotated_pixel_bounds(100, 50, -90.0), (50, 100));
        assert_eq!(rotated_pixel_bounds(100, 100, 45.0), (141, 141));
    }

    #[test]
    fn quarter_turns_detects_right_angles_only() {
        assert_eq!(quarter_turns(0.0), Some(0));
        assert_eq!(quarter_turns(90.0), Some(1));
        assert_eq!(quarter_turns(-90.0), Some(3));
        assert_eq!(quarter_turns(540.0), Some(2));
        assert_eq!(quarter_turns(45.0), None);
        assert_eq!(quarter_turns(f64::NAN), Some(0));
    }

    #[test]
    fn source_crop_rect_inverts_zoom_and_scale() {
        // 源图 1000×500，显示 500×250，放大 2 倍后显示坐标与源像素 1:1
        let vp = viewport(Rect::new(100.0, 50.0, 200.0, 100.0), 2.0, Size::new(500.0, 250.0));
        let rect = source_crop_rect(&vp, 1000, 500, 500.0, 250.0);
        assert_eq!(rect, PixelRect::new(100, 50, 200, 100));

        // 不缩放时显示 1px 对应源图 2px
        let vp = viewport(Rect::new(100.0, 50.0, 200.0, 100.0), 1.0, Size::new(500.0, 250.0));
        let rect = source_crop_rect(&vp, 1000, 500, 500.0, 250.0);
        assert_eq!(rect, PixelRect::new(200, 100, 400, 200));
    }

    #[test]
    fn source_crop_rect_clamps_out_of_range_drag() {
        let vp = viewport(Rect::new(-20.0, -10.0, 600.0, 300.0), 1.0, Size::new(500.0, 250.0));
        let rect = source_crop_rect(&vp, 1000, 500, 500.0, 250.0);

        assert_eq!(rect, PixelRect::new(0, 0, 1000, 500));
    }

    #[test]
    fn source_crop_rect_fully_outside_is_empty() {
        let vp = viewport(Rect::new(900.0, 10.0, 50.0, 50.0), 1.0, Size::new(500.0, 250.0));
        let rect = source_crop_rect(&vp, 1000, 500, 500.0, 250.0);

        assert!(rect.is_empty());
        assert!(rect.right() <= 1000);
    }

    #[test]
    fn source_crop_rect_rejects_invalid_rendered_size() {
        let vp = viewport(Rect::new(0.0, 0.0, 10.0, 10.0), 1.0, Size::new(0.0, 0.0));
        assert!(source_crop_rect(&vp, 100, 100, 0.0, 100.0).is_empty());
        assert!(source_crop_rect(&vp, 100, 100, f64::NAN, 100.0).is_empty());
        assert!(source_crop_rect(&vp, 0, 100, 100.0, 100.0).is_empty());
    }

    #[test]
    fn centered_crop_respects_aspect_ratio() {
        let crop = centered_crop(Size::new(400.0, 200.0), Some(1.0));
        assert_eq!(crop, Rect::new(100.0, 0.0, 200.0, 200.0));

        let crop = centered_crop(Size::new(400.0, 200.0), Some(4.0));
        assert_eq!(crop, Rect::new(0.0, 50.0, 400.0, 100.0));

        let crop = centered_crop(Size::new(400.0, 200.0), None);
        assert_eq!(crop, Rect::new(0.0, 0.0, 400.0, 200.0));
    }

    #[test]
    fn clamp_rect_pushes_back_inside() {
        let clamped = clamp_rect(Rect::new(350.0, -40.0, 100.0, 100.0), Size::new(400.0, 200.0));
        assert_eq!(clamped, Rect::new(300.0, 0.0, 100.0, 100.0));

        let clamped = clamp_rect(Rect::new(0.0, 0.0, 900.0, f64::NAN), Size::new(400.0, 200.0));
        assert_eq!(clamped, Rect::new(0.0, 0.0, 400.0, 0.0));
    }

    #[test]
    fn normalized_viewport_fixes_zoom_and_crop() {
        let vp = ViewportTransform {
            crop: Rect::new(450.0, 0.0, 100.0, 100.0),
            zoom: 0.25,
            rotation_degrees: f64::INFINITY,
            rendered_size: Size::new(500.0, 250.0),
        }
        .normalized();

        assert_eq!(vp.zoom, 1.0);
        assert_eq!(vp.rotation_degrees, 0.0);
        assert_eq!(vp.crop, Rect::new(400.0, 0.0, 100.0, 100.0));
    }

    #[test]
    fn centered_viewport_keeps_window_when_zoomed() {
        let vp = ViewportTransform::centered(Size::new(400.0, 200.0), 2.0, 15.0, Some(1.0));

        assert_eq!(vp.zoom, 2.0);
        assert_eq!(vp.rotation_degrees, 15.0);
        assert_eq!(vp.crop, Rect::new(300.0, 100.0, 200.0, 200.0));
        assert_eq!(vp.zoomed_bounds(), Size::new(800.0, 400.0));
    }
}
