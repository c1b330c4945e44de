//! # 预览引用注册表
//!
//! ## 设计思路
//!
//! 预览缩略图是任务持有的“本地资源”，必须有确定的释放路径：
//! 删除任务、关闭流水线、甚至 panic 展开时都不能泄漏。
//!
//! - **注册表（arena）**：集中保存缩略图像素，按 `PreviewId` 索引，
//!   UI 只拿到轻量的 `PreviewRef`，需要时再换取 data URL。
//! - **RAII 句柄**：`PreviewHandle` 构造即登记，`Drop` 即注销；
//!   句柄只持有注册表的 `Weak` 引用，不会反向延长注册表寿命。
//! - **兜底清扫**：`release_all` 在关闭流水线时清空所有残留槽位。

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use base64::{Engine as _, engine::general_purpose};
use image::{ImageFormat, RgbaImage};
use serde::{Deserialize, Serialize};

/// 预览槽位标识。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PreviewId(u64);

impl PreviewId {
    pub fn get(self) -> u64 {
        self.0
    }
}

/// 交给 UI 的预览引用。
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum PreviewRef {
    /// 本地缩略图，通过 `preview_data_url` 换取可显示的数据。
    Local { id: PreviewId, width: u32, height: u32 },
    /// 远端已有图片，直接使用其地址。
    Remote { url: String },
}

#[derive(Debug, Default)]
struct RegistryInner {
    next_id: AtomicU64,
    slots: Mutex<HashMap<PreviewId, Arc<RgbaImage>>>,
}

impl RegistryInner {
    /// 槽位表只做插入/删除，中毒后数据依然一致，直接取回继续使用。
    fn slots(&self) -> MutexGuard<'_, HashMap<PreviewId, Arc<RgbaImage>>> {
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// 预览缩略图注册表。
#[derive(Debug, Clone, Default)]
pub struct PreviewRegistry {
    inner: Arc<RegistryInner>,
}

impl PreviewRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 登记缩略图并返回 RAII 句柄。
    pub fn acquire(&self, thumbnail: RgbaImage) -> PreviewHandle {
        let id = PreviewId(self.inner.next_id.fetch_add(1, Ordering::Relaxed) + 1);
        let (width, height) = thumbnail.dimensions();
        self.inner.slots().insert(id, Arc::new(thumbnail));

        log::debug!("🖼️ 登记预览 {} ({}x{})", id.0, width, height);

        PreviewHandle {
            id,
            width,
            height,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// 读取缩略图像素。
    pub fn get(&self, id: PreviewId) -> Option<Arc<RgbaImage>> {
        self.inner.slots().get(&id).cloned()
    }

    /// 把缩略图编码为 `data:image/png;base64,...`，槽位已释放时返回 `None`。
    pub fn data_url(&self, id: PreviewId) -> Option<String> {
        let thumbnail = self.get(id)?;
        let mut cursor = Cursor::new(Vec::new());
        if let Err(err) = thumbnail.write_to(&mut cursor, ImageFormat::Png) {
            log::warn!("⚠️ 预览 {} 编码失败：{}", id.0, err);
            return None;
        }

        let encoded = general_purpose::STANDARD.encode(cursor.into_inner());
        Some(format!("data:image/png;base64,{}", encoded))
    }

    /// 当前仍被占用的槽位数量。
    pub fn live_count(&self) -> usize {
        self.inner.slots().len()
    }

    /// 清空全部槽位，返回被清理的数量。
    pub fn release_all(&self) -> usize {
        let mut slots = self.inner.slots();
        let released = slots.len();
        slots.clear();
        released
    }
}

/// 预览槽位的 RAII 句柄，`Drop` 时自动注销。
#[derive(Debug)]
pub struct PreviewHandle {
    id: PreviewId,
    width: u32,
    height: u32,
    registry: Weak<RegistryInner>,
}

impl PreviewHandle {
    pub fn id(&self) -> PreviewId {
        self.id
    }

    pub fn preview_ref(&self) -> PreviewRef {
        PreviewRef::Local {
            id: self.id,
            width: self.width,
            height: self.height,
        }
    }
}

impl Drop for PreviewHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            if registry.slots().remove(&self.id).is_some() {
                log::debug!("🧹 释放预览 {}", self.id.0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgba;

    fn thumbnail() -> RgbaImage {
        RgbaImage::from_pixel(4, 3, Rgba([10, 20, 30, 255]))
    }

    #[test]
    fn handle_drop_releases_slot() {
        let registry = PreviewRegistry::new();
        let handle = registry.acquire(thumbnail());
        let id = handle.id();

        assert_eq!(registry.live_count(), 1);
        assert!(registry.get(id).is_some());

        drop(handle);

        assert_eq!(registry.live_count(), 0);
        assert!(registry.get(id).is_none());
        assert!(registry.data_url(id).is_none());
    }

    #[test]
    fn preview_ref_carries_dimensions() {
        let registry = PreviewRegistry::new();
        let handle = registry.acquire(thumbnail());

        assert_eq!(
            handle.preview_ref(),
            PreviewRef::Local { id: handle.id(), width: 4, height: 3 }
        );
    }

    #[test]
    fn data_url_is_png() {
        let registry = PreviewRegistry::new();
        let handle = registry.acquire(thumbnail());

        let url = registry.data_url(handle.id()).expect("data url should exist");
        assert!(url.starts_with("data:image/png;base64,iVBORw0KGgo"));
    }

    #[test]
    fn release_all_sweeps_leaked_handles() {
        let registry = PreviewRegistry::new();
        let first = registry.acquire(thumbnail());
        let second = registry.acquire(thumbnail());
        std::mem::forget(first);

        assert_eq!(registry.release_all(), 2);
        assert_eq!(registry.live_count(), 0);

        // 清扫后句柄再释放不会出错
        drop(second);
        assert_eq!(registry.live_count(), 0);
    }

    #[test]
    fn handle_outliving_registry_is_harmless() {
        let registry = PreviewRegistry::new();
        let handle = registry.acquire(thumbnail());
        drop(registry);
        drop(handle);
    }
}
