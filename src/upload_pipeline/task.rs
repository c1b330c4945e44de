//! # 任务与图片集合
//!
//! ## 设计思路
//!
//! - `TaskStatus` 是带载荷的标签枚举：远端地址只存在于 `Succeeded`，
//!   失败原因只存在于 `Failed`，不会出现“失败但带着地址”的组合。
//! - 主图由集合层面的单个 `Option<TaskId>` 表示，“两张主图”在类型上不可表达；
//!   `is_primary` 只在导出读模型时派生。
//! - 集合按插入顺序保存任务，完成顺序与删除都不会打乱相对顺序。

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use super::preview::{PreviewHandle, PreviewRef};
use super::{CropResult, FailureReason, PipelineError, SourceImage};
use crate::geometry::ViewportTransform;

static NEXT_TASK_ID: AtomicU64 = AtomicU64::new(1);

/// 任务标识，进程内唯一。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct TaskId(u64);

impl TaskId {
    pub(crate) fn next() -> Self {
        Self(NEXT_TASK_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", self.0)
    }
}

/// 任务状态。
///
/// `Pending → Uploading → {Succeeded | Failed | Ready}`，`Failed → Uploading` 仅通过重试。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum TaskStatus {
    Pending,
    Uploading,
    Succeeded { url: String },
    Failed { reason: FailureReason },
    /// 仅预览模式下的终态，携带裁剪结果。
    Ready { result: Arc<CropResult> },
}

impl TaskStatus {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Uploading => "uploading",
            Self::Succeeded { .. } => "succeeded",
            Self::Failed { .. } => "failed",
            Self::Ready { .. } => "ready",
        }
    }

    /// 是否已结束本次提交（成功、失败或仅预览完成）。
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            Self::Succeeded { .. } | Self::Failed { .. } | Self::Ready { .. }
        )
    }

    pub fn remote_url(&self) -> Option<&str> {
        match self {
            Self::Succeeded { url } => Some(url),
            _ => None,
        }
    }
}

/// 任务的图片来源。本地图片与其预览句柄同生共死。
#[derive(Debug)]
pub enum TaskSource {
    Local {
        image: Arc<SourceImage>,
        preview: PreviewHandle,
    },
    Remote { url: String },
}

/// 已渲染载荷缓存，以产生它的视口为键。
#[derive(Debug, Clone)]
pub(crate) struct RenderedPayload {
    pub(crate) viewport: Option<ViewportTransform>,
    pub(crate) result: Arc<CropResult>,
}

/// 单张图片的生命周期记录。
#[derive(Debug)]
pub struct UploadTask {
    pub(crate) id: TaskId,
    pub(crate) source: TaskSource,
    pub(crate) status: TaskStatus,
    pub(crate) viewport: Option<ViewportTransform>,
    pub(crate) rendered: Option<RenderedPayload>,
    pub(crate) attempt: u32,
}

impl UploadTask {
    pub(crate) fn local(image: Arc<SourceImage>, preview: PreviewHandle) -> Self {
        Self {
            id: TaskId::next(),
            source: TaskSource::Local { image, preview },
            status: TaskStatus::Pending,
            viewport: None,
            rendered: None,
            attempt: 0,
        }
    }

    pub(crate) fn remote(url: String) -> Self {
        Self {
            id: TaskId::next(),
            source: TaskSource::Remote { url: url.clone() },
            status: TaskStatus::Succeeded { url },
            viewport: None,
            rendered: None,
            attempt: 0,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn status(&self) -> &TaskStatus {
        &self.status
    }

    pub fn viewport(&self) -> Option<&ViewportTransform> {
        self.viewport.as_ref()
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// 视口未变化时可复用的已渲染载荷。
    pub(crate) fn cached_payload(&self) -> Option<Arc<CropResult>> {
        self.rendered
            .as_ref()
            .filter(|cached| cached.viewport == self.viewport)
            .map(|cached| Arc::clone(&cached.result))
    }

    /// 本地源图；远端行返回 `None`。
    pub(crate) fn local_image(&self) -> Option<&Arc<SourceImage>> {
        match &self.source {
            TaskSource::Local { image, .. } => Some(image),
            TaskSource::Remote { .. } => None,
        }
    }

    pub(crate) fn preview_ref(&self) -> PreviewRef {
        match &self.source {
            TaskSource::Local { preview, .. } => preview.preview_ref(),
            TaskSource::Remote { url } => PreviewRef::Remote { url: url.clone() },
        }
    }

    fn export(&self, is_primary: bool) -> ExportedImage {
        let source = match &self.source {
            TaskSource::Local { image, .. } => ExportedSource::Local {
                file_name: image.file_name().to_string(),
                mime_type: image.mime_type().to_string(),
                width: image.width(),
                height: image.height(),
            },
            TaskSource::Remote { url } => ExportedSource::Remote { url: url.clone() },
        };

        ExportedImage {
            task_id: self.id,
            source,
            is_primary,
            preview: self.preview_ref(),
            status: self.status.clone(),
        }
    }
}

/// 读模型中的图片来源。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum ExportedSource {
    #[serde(rename_all = "camelCase")]
    Local {
        file_name: String,
        mime_type: String,
        width: u32,
        height: u32,
    },
    Remote { url: String },
}

/// `export_set` 的单行结果。
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedImage {
    pub task_id: TaskId,
    pub source: ExportedSource,
    pub is_primary: bool,
    pub preview: PreviewRef,
    pub status: TaskStatus,
}

/// 有序任务集合与主图标记。
///
/// 不变量：集合非空时 `primary` 恰好指向其中一个任务；集合为空时为 `None`。
#[derive(Debug, Default)]
pub struct ImageSet {
    tasks: Vec<UploadTask>,
    primary: Option<TaskId>,
}

impl ImageSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn primary(&self) -> Option<TaskId> {
        self.primary
    }

    pub fn iter(&self) -> impl Iterator<Item = &UploadTask> {
        self.tasks.iter()
    }

    pub fn ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|task| task.id).collect()
    }

    pub fn get(&self, id: TaskId) -> Option<&UploadTask> {
        self.tasks.iter().find(|task| task.id == id)
    }

    pub(crate) fn get_mut(&mut self, id: TaskId) -> Option<&mut UploadTask> {
        self.tasks.iter_mut().find(|task| task.id == id)
    }

    /// 追加任务；空集合的第一个任务成为主图。
    pub(crate) fn push(&mut self, task: UploadTask) -> TaskId {
        let id = task.id;
        self.tasks.push(task);
        if self.primary.is_none() {
            self.primary = Some(id);
        }
        self.debug_check();
        id
    }

    /// 移除任务并返回；若移除的是主图，则新的第一个任务成为主图。
    pub(crate) fn remove(&mut self, id: TaskId) -> Result<UploadTask, PipelineError> {
        let index = self
            .tasks
            .iter()
            .position(|task| task.id == id)
            .ok_or(PipelineError::TaskNotFound(id))?;

        let removed = self.tasks.remove(index);
        if self.primary == Some(id) {
            self.primary = self.tasks.first().map(|task| task.id);
        }
        self.debug_check();
        Ok(removed)
    }

    /// 设置主图。返回是否发生变化；对当前主图调用是幂等的。
    pub(crate) fn set_primary(&mut self, id: TaskId) -> Result<bool, PipelineError> {
        if self.get(id).is_none() {
            return Err(PipelineError::TaskNotFound(id));
        }
        let changed = self.primary != Some(id);
        self.primary = Some(id);
        self.debug_check();
        Ok(changed)
    }

    /// 取出全部任务，集合回到空状态。
    pub(crate) fn drain_all(&mut self) -> Vec<UploadTask> {
        self.primary = None;
        std::mem::take(&mut self.tasks)
    }

    /// 按集合顺序导出读模型。
    pub fn export(&self) -> Vec<ExportedImage> {
        self.tasks
            .iter()
            .map(|task| task.export(self.primary == Some(task.id)))
            .collect()
    }

    fn debug_check(&self) {
        debug_assert_eq!(
            self.primary.is_some(),
            !self.tasks.is_empty(),
            "主图存在性必须与集合是否为空一致"
        );
        debug_assert!(
            self.primary.is_none_or(|id| self.tasks.iter().any(|task| task.id == id)),
            "主图必须属于集合"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn remote(n: usize) -> UploadTask {
        UploadTask::remote(format!("https://cdn.example.com/{}.jpg", n))
    }

    fn primary_count(set: &ImageSet) -> usize {
        set.export().iter().filter(|row| row.is_primary).count()
    }

    #[test]
    fn first_task_becomes_primary() {
        let mut set = ImageSet::new();
        let first = set.push(remote(1));
        set.push(remote(2));

        assert_eq!(set.primary(), Some(first));
        assert_eq!(primary_count(&set), 1);
    }

    #[test]
    fn removing_primary_promotes_new_first() {
        let mut set = ImageSet::new();
        let a = set.push(remote(1));
        let b = set.push(remote(2));
        let c = set.push(remote(3));

        set.set_primary(b).expect("set primary failed");
        set.remove(b).expect("remove failed");
        assert_eq!(set.primary(), Some(a));
        assert_eq!(set.ids(), vec![a, c]);

        set.remove(a).expect("remove failed");
        set.remove(c).expect("remove failed");
        assert!(set.is_empty());
        assert_eq!(set.primary(), None);
    }

    #[test]
    fn set_primary_on_current_primary_is_noop() {
        let mut set = ImageSet::new();
        let a = set.push(remote(1));
        set.push(remote(2));
        let before = set.export();

        assert_eq!(set.set_primary(a), Ok(false));
        assert_eq!(set.export(), before);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let mut set = ImageSet::new();
        set.push(remote(1));
        let missing = TaskId(u64::MAX);

        assert_eq!(set.set_primary(missing), Err(PipelineError::TaskNotFound(missing)));
        assert!(matches!(set.remove(missing), Err(PipelineError::TaskNotFound(_))));
    }

    #[test]
    fn remote_rows_are_succeeded_with_remote_preview() {
        let task = remote(7);
        assert_eq!(task.status().remote_url(), Some("https://cdn.example.com/7.jpg"));
        assert_eq!(
            task.preview_ref(),
            PreviewRef::Remote { url: "https://cdn.example.com/7.jpg".to_string() }
        );
    }

    #[test]
    fn status_serializes_with_tag() {
        let json = serde_json::to_value(TaskStatus::Succeeded { url: "u".to_string() })
            .expect("serialize failed");
        assert_eq!(json, serde_json::json!({ "state": "succeeded", "url": "u" }));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push,
        Remove(usize),
        SetPrimary(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Push),
            (0usize..8).prop_map(Op::Remove),
            (0usize..8).prop_map(Op::SetPrimary),
        ]
    }

    proptest! {
        #[test]
        fn exactly_one_primary_when_non_empty(ops in proptest::collection::vec(op(), 0..40)) {
            let mut set = ImageSet::new();
            let mut counter = 0;

            for op in ops {
                let order_before = set.ids();
                match op {
                    Op::Push => {
                        counter += 1;
                        set.push(remote(counter));
                    }
                    Op::Remove(i) => {
                        if let Some(id) = order_before.get(i).copied() {
                            let was_primary = set.primary() == Some(id);
                            set.remove(id).expect("remove failed");
                            let expected: Vec<_> = order_before.iter().copied().filter(|x| *x != id).collect();
                            prop_assert_eq!(set.ids(), expected.clone());
                            if was_primary {
                                prop_assert_eq!(set.primary(), expected.first().copied());
                            }
                        }
                    }
                    Op::SetPrimary(i) => {
                        if let Some(id) = order_before.get(i).copied() {
                            set.set_primary(id).expect("set primary failed");
                            prop_assert_eq!(set.primary(), Some(id));
                            prop_assert_eq!(set.ids(), order_before);
                        }
                    }
                }

                let expected = if set.is_empty() { 0 } else { 1 };
                prop_assert_eq!(primary_count(&set), expected);
            }
        }
    }
}
