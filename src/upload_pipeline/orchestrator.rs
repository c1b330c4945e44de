//! # 上传编排器
//!
//! ## 设计思路
//!
//! `UploadOrchestrator` 独占图片集合，负责：
//! 1. 入队：校验闸门 → 数量上限 → 解码 → 生成预览
//! 2. 编辑：记录视口变换、切换主图、删除
//! 3. 提交：渲染（或原图直传）→ 上传（或仅预览）→ 结算状态
//! 4. 导出：按集合顺序输出只读快照
//!
//! ## 实现思路
//!
//! - 集合的所有变更都在同一把锁内完成，读方不会看到中间状态；锁从不跨越 `await`。
//! - 提交拆成两段：同步的 `begin`（`Pending → Uploading`，记录 attempt）与异步的 `execute`。
//!   结算时校验任务仍存在、attempt 未被替换、流水线未关闭，否则丢弃结果。
//! - 每次提交持有一个 `AttemptGuard`：future 被取消、任务 panic 或 `commit_all` 被中途丢弃时，
//!   仍停在本次 `Uploading` 的任务落为可重试的 `Failed`。
//! - 视口的显示尺寸必须与旋转外接框同比例，否则 `set_transform` 返回 `InvalidTransform`。
//! - 并发上限由信号量控制，许可覆盖“渲染 + 上传”整个提交过程。
//! - 渲染在阻塞线程池执行；上传是唯一的网络挂起点。
//! - 关闭时广播 shutdown 信号，进行中的提交在下一个挂起点放弃；
//!   清空集合会连带释放预览槽位与解码像素。

use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use tokio::runtime::Handle;
use tokio::sync::{Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};

use super::config::OutputFormat;
use super::preview::{PreviewId, PreviewRegistry};
use super::render::{RenderPipeline, RenderSettings};
use super::resize::downscale_to_fit;
use super::store::{RemoteStore, UploadPayload};
use super::task::{ExportedImage, ImageSet, RenderedPayload, TaskId, TaskStatus, UploadTask};
use super::{
    CandidateFile, ConfigError, CropResult, FailureReason, PipelineConfig, PipelineError,
    RenderFailure, SourceImage, UploadError, ValidationError, ValidationGate,
};
use crate::geometry::{self, ViewportTransform};

/// 单个被拒绝的文件。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub file_name: String,
    pub error: ValidationError,
}

/// `add` 的结果：被拒绝的文件不会中断整批处理。
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddReport {
    pub accepted: Vec<TaskId>,
    pub rejected: Vec<Rejection>,
}

#[derive(Debug, Clone, Copy)]
enum CommitKind {
    Commit,
    Retry,
}

impl CommitKind {
    fn expected(self) -> &'static str {
        match self {
            Self::Commit => "pending",
            Self::Retry => "failed",
        }
    }

    fn accepts(self, status: &TaskStatus) -> bool {
        matches!(
            (self, status),
            (Self::Commit, TaskStatus::Pending) | (Self::Retry, TaskStatus::Failed { .. })
        )
    }
}

/// 显示尺寸与旋转外接框宽高比允许的相对误差（UI 取整）。
const RENDERED_ASPECT_TOLERANCE: f64 = 0.01;

/// 一次提交所需的快照，`begin` 时在锁内生成。
struct CommitJob {
    id: TaskId,
    attempt: u32,
    image: Arc<SourceImage>,
    viewport: Option<ViewportTransform>,
    cached: Option<Arc<CropResult>>,
    guard: AttemptGuard,
}

/// 未经结算就被丢弃时，把本次尝试落为 `Failed`。
struct AttemptGuard {
    inner: Arc<Inner>,
    id: TaskId,
    attempt: u32,
    armed: bool,
}

impl AttemptGuard {
    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard {
    fn drop(&mut self) {
        if self.armed {
            self.inner.interrupt(self.id, self.attempt);
        }
    }
}

enum Settlement {
    Uploaded(String),
    Ready(Arc<CropResult>),
}

struct CommitOutcome {
    rendered: Option<RenderedPayload>,
    result: Result<Settlement, FailureReason>,
}

impl CommitOutcome {
    fn failed(reason: impl Into<FailureReason>) -> Self {
        Self {
            rendered: None,
            result: Err(reason.into()),
        }
    }
}

struct Inner {
    config: PipelineConfig,
    gate: ValidationGate,
    renderer: RenderPipeline,
    store: Arc<dyn RemoteStore>,
    previews: PreviewRegistry,
    set: Mutex<ImageSet>,
    permits: Semaphore,
    shutdown: watch::Sender<bool>,
    revision: watch::Sender<u64>,
}

/// 图片集合的上传编排器。
///
/// 需在 tokio 运行时中使用异步方法；同步方法可在任意线程调用。
pub struct UploadOrchestrator {
    inner: Arc<Inner>,
}

impl UploadOrchestrator {
    /// 根据配置与远端存储创建编排器。配置非法时返回 `ConfigError`。
    ///
    /// # 示例
    /// ```rust
    /// use std::sync::Arc;
    /// use image_upload_pipeline::upload_pipeline::{DisabledStore, PipelineConfig, UploadOrchestrator};
    ///
    /// let config = PipelineConfig { preview_only: true, ..PipelineConfig::default() };
    /// let orchestrator = UploadOrchestrator::new(config, Arc::new(DisabledStore))?;
    /// assert!(orchestrator.is_empty());
    /// # Ok::<(), image_upload_pipeline::upload_pipeline::ConfigError>(())
    /// ```
    pub fn new(config: PipelineConfig, store: Arc<dyn RemoteStore>) -> Result<Self, ConfigError> {
        config.validate()?;
        let gate = ValidationGate::from_config(&config)?;
        let renderer = RenderPipeline::new(RenderSettings::from_config(&config));
        let (shutdown, _) = watch::channel(false);
        let (revision, _) = watch::channel(0);

        log::info!(
            "🚀 上传编排器已创建 - 上限: {} 张 / {} 字节 并发: {} 仅预览: {}",
            config.max_images,
            config.max_size_bytes,
            config.upload_concurrency,
            config.preview_only
        );

        Ok(Self {
            inner: Arc::new(Inner {
                permits: Semaphore::new(config.upload_concurrency),
                config,
                gate,
                renderer,
                store,
                previews: PreviewRegistry::new(),
                set: Mutex::new(ImageSet::new()),
                shutdown,
                revision,
            }),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.inner.config
    }

    /// 批量加入候选文件，按递交顺序追加为 `Pending` 任务。
    pub fn add<I>(&self, files: I) -> Result<AddReport, PipelineError>
    where
        I: IntoIterator<Item = CandidateFile>,
    {
        self.inner.ensure_open()?;
        let mut report = AddReport::default();

        for file in files {
            match self.inner.admit(&file)? {
                Ok(id) => {
                    log::info!("➕ 已加入图片 - 任务: {} 文件: {}", id, file.file_name);
                    report.accepted.push(id);
                }
                Err(error) => {
                    log::warn!("⚠️ 拒绝图片 - 文件: {} 原因: {}", file.file_name, error);
                    report.rejected.push(Rejection {
                        file_name: file.file_name,
                        error,
                    });
                }
            }
        }

        if !report.accepted.is_empty() {
            self.inner.bump_revision();
        }
        Ok(report)
    }

    /// 加入已存在于远端的图片（编辑已有记录时使用），状态直接为 `Succeeded`。
    pub fn add_remote<I, U>(&self, urls: I) -> Result<AddReport, PipelineError>
    where
        I: IntoIterator<Item = U>,
        U: Into<String>,
    {
        self.inner.ensure_open()?;
        let mut report = AddReport::default();
        let limit = self.inner.config.max_images;

        {
            let mut set = self.inner.lock_set()?;
            for url in urls {
                let url = url.into();
                if set.len() >= limit {
                    report.rejected.push(Rejection {
                        file_name: url,
                        error: ValidationError::TooMany { limit },
                    });
                    continue;
                }
                report.accepted.push(set.push(UploadTask::remote(url)));
            }
        }

        if !report.accepted.is_empty() {
            self.inner.bump_revision();
        }
        Ok(report)
    }

    /// 删除任务。预览与解码像素随任务一起释放；删除主图时新的第一个任务成为主图。
    pub fn remove(&self, id: TaskId) -> Result<(), PipelineError> {
        let removed = self.inner.lock_set()?.remove(id)?;
        if matches!(removed.status, TaskStatus::Uploading) {
            log::info!("🗑️ 删除进行中的任务 {}，其结果将被丢弃", id);
        } else {
            log::info!("🗑️ 已删除任务 {}", id);
        }
        drop(removed);
        self.inner.bump_revision();
        Ok(())
    }

    /// 设置主图；对当前主图调用不产生任何变化。
    pub fn set_primary(&self, id: TaskId) -> Result<(), PipelineError> {
        let changed = self.inner.lock_set()?.set_primary(id)?;
        if changed {
            log::info!("⭐ 主图切换为 {}", id);
            self.inner.bump_revision();
        }
        Ok(())
    }

    /// 以视口中心为锚点，为任务生成指定缩放与旋转的视口（显示尺寸与源图 1:1）。
    pub fn centered_transform(
        &self,
        id: TaskId,
        zoom: f64,
        rotation_degrees: f64,
    ) -> Result<ViewportTransform, PipelineError> {
        let set = self.inner.lock_set()?;
        let task = set.get(id).ok_or(PipelineError::TaskNotFound(id))?;
        let image = task.local_image().ok_or(PipelineError::NotLocal(id))?;

        let rendered = geometry::rotated_bounds(
            image.width() as f64,
            image.height() as f64,
            rotation_degrees,
        );
        Ok(ViewportTransform::centered(
            rendered,
            zoom,
            rotation_degrees,
            self.inner.config.aspect_ratio,
        ))
    }

    /// 记录（或清除）编辑会话的视口变换，返回收敛后的变换。
    ///
    /// 仅允许 `Pending`、`Failed`、`Ready` 状态的本地任务；`Ready` 会回到 `Pending`。
    pub fn set_transform(
        &self,
        id: TaskId,
        viewport: Option<ViewportTransform>,
    ) -> Result<Option<ViewportTransform>, PipelineError> {
        self.inner.ensure_open()?;
        let normalized = viewport.map(|v| v.normalized_with_aspect(self.inner.config.aspect_ratio));

        {
            let mut set = self.inner.lock_set()?;
            let task = set.get_mut(id).ok_or(PipelineError::TaskNotFound(id))?;
            let image = task.local_image().ok_or(PipelineError::NotLocal(id))?;
            if let Some(viewport) = &normalized {
                check_rendered_aspect(id, image, viewport)?;
            }

            match task.status {
                TaskStatus::Pending | TaskStatus::Failed { .. } => {}
                TaskStatus::Ready { .. } => task.status = TaskStatus::Pending,
                _ => {
                    return Err(PipelineError::InvalidState {
                        task: id,
                        expected: "pending|failed|ready",
                        actual: task.status.label(),
                    });
                }
            }
            task.viewport = normalized;
        }

        log::debug!("✂️ 更新视口 - 任务: {} 视口: {:?}", id, normalized);
        self.inner.bump_revision();
        Ok(normalized)
    }

    /// 提交 `Pending` 任务并等待结算。
    ///
    /// 渲染/上传失败记录在任务状态中（`Failed`），不会作为 `Err` 返回。
    pub async fn commit(&self, id: TaskId) -> Result<TaskStatus, PipelineError> {
        let job = self.inner.begin(id, CommitKind::Commit)?;
        Inner::execute(Arc::clone(&self.inner), job)
            .await
            .ok_or_else(|| self.inner.abandoned_error(id))
    }

    /// 重试 `Failed` 任务。视口未变化时复用已渲染的载荷。
    pub async fn retry(&self, id: TaskId) -> Result<TaskStatus, PipelineError> {
        let job = self.inner.begin(id, CommitKind::Retry)?;
        Inner::execute(Arc::clone(&self.inner), job)
            .await
            .ok_or_else(|| self.inner.abandoned_error(id))
    }

    /// 后台提交：立即切到 `Uploading` 并返回句柄，不等待前序提交。
    ///
    /// 句柄结果为 `None` 表示结果已被丢弃（任务删除或流水线关闭）。
    pub fn spawn_commit(&self, id: TaskId) -> Result<JoinHandle<Option<TaskStatus>>, PipelineError> {
        self.spawn(id, CommitKind::Commit)
    }

    pub fn spawn_retry(&self, id: TaskId) -> Result<JoinHandle<Option<TaskStatus>>, PipelineError> {
        self.spawn(id, CommitKind::Retry)
    }

    fn spawn(
        &self,
        id: TaskId,
        kind: CommitKind,
    ) -> Result<JoinHandle<Option<TaskStatus>>, PipelineError> {
        let runtime = Handle::try_current().map_err(|_| PipelineError::NoRuntime)?;
        let job = self.inner.begin(id, kind)?;
        Ok(runtime.spawn(Inner::execute(Arc::clone(&self.inner), job)))
    }

    /// 并发提交全部 `Pending` 本地任务，返回按集合顺序排列的结算结果。
    pub async fn commit_all(&self) -> Result<Vec<(TaskId, TaskStatus)>, PipelineError> {
        self.inner.ensure_open()?;
        let pending: Vec<TaskId> = self
            .inner
            .lock_set()?
            .iter()
            .filter(|task| matches!(task.status, TaskStatus::Pending) && task.local_image().is_some())
            .map(|task| task.id())
            .collect();

        let started = Instant::now();
        let mut join_set = JoinSet::new();
        let mut spawned = vec![false; pending.len()];
        for (index, id) in pending.iter().copied().enumerate() {
            let job = match self.inner.begin(id, CommitKind::Commit) {
                Ok(job) => job,
                Err(err) => {
                    log::warn!("⚠️ 任务 {} 无法提交：{}", id, err);
                    continue;
                }
            };
            spawned[index] = true;
            let inner = Arc::clone(&self.inner);
            join_set.spawn(async move { (index, Inner::execute(inner, job).await) });
        }

        let mut settled: Vec<Option<TaskStatus>> = vec![None; pending.len()];
        let mut crashed = 0usize;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, status)) => settled[index] = status,
                Err(err) => {
                    crashed += 1;
                    log::warn!("⚠️ 提交任务异常退出：{}", err);
                }
            }
        }

        // 异常退出的任务已由 AttemptGuard 落为 Failed，从集合中补齐
        if crashed > 0 {
            let set = self.inner.lock_set()?;
            for (index, id) in pending.iter().enumerate() {
                if spawned[index] && settled[index].is_none() {
                    settled[index] = set
                        .get(*id)
                        .map(|task| task.status().clone())
                        .filter(|status| !matches!(status, TaskStatus::Uploading));
                }
            }
        }

        log::info!(
            "📦 批量提交完成 - 任务数: {} 耗时: {}ms",
            pending.len(),
            started.elapsed().as_millis()
        );

        Ok(pending
            .into_iter()
            .zip(settled)
            .filter_map(|(id, status)| status.map(|status| (id, status)))
            .collect())
    }

    /// 按集合顺序导出只读快照。
    pub fn export_set(&self) -> Result<Vec<ExportedImage>, PipelineError> {
        Ok(self.inner.lock_set()?.export())
    }

    pub fn status(&self, id: TaskId) -> Result<TaskStatus, PipelineError> {
        self.inner
            .lock_set()?
            .get(id)
            .map(|task| task.status().clone())
            .ok_or(PipelineError::TaskNotFound(id))
    }

    pub fn primary(&self) -> Result<Option<TaskId>, PipelineError> {
        Ok(self.inner.lock_set()?.primary())
    }

    pub fn len(&self) -> usize {
        match self.inner.set.lock() {
            Ok(set) => set.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 本地预览的 PNG data URL。
    pub fn preview_data_url(&self, id: PreviewId) -> Option<String> {
        self.inner.previews.data_url(id)
    }

    /// 仍被占用的预览槽位数量（诊断用）。
    pub fn live_previews(&self) -> usize {
        self.inner.previews.live_count()
    }

    /// 订阅集合版本号，每次可见变更后递增。
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }

    /// 关闭流水线：放弃进行中的提交，释放全部预览与解码像素。
    pub fn close(&self) {
        self.inner.shutdown_now();
    }
}

impl Drop for UploadOrchestrator {
    fn drop(&mut self) {
        if !self.is_closed() {
            self.inner.shutdown_now();
        }
    }
}

impl Inner {
    fn lock_set(&self) -> Result<MutexGuard<'_, ImageSet>, PipelineError> {
        self.set.lock().map_err(|_| PipelineError::StatePoisoned)
    }

    fn ensure_open(&self) -> Result<(), PipelineError> {
        if *self.shutdown.borrow() {
            return Err(PipelineError::Closed);
        }
        Ok(())
    }

    fn bump_revision(&self) {
        self.revision.send_modify(|revision| *revision += 1);
    }

    fn abandoned_error(&self, id: TaskId) -> PipelineError {
        if *self.shutdown.borrow() {
            PipelineError::Closed
        } else {
            PipelineError::TaskNotFound(id)
        }
    }

    /// 单个文件的入队流程。外层 `Err` 表示编排器故障，内层 `Err` 表示该文件被拒绝。
    fn admit(&self, file: &CandidateFile) -> Result<Result<TaskId, ValidationError>, PipelineError> {
        let limit = self.config.max_images;

        let mime_type = match self.gate.validate(file) {
            Ok(mime_type) => mime_type,
            Err(err) => return Ok(Err(err)),
        };
        if self.lock_set()?.len() >= limit {
            return Ok(Err(ValidationError::TooMany { limit }));
        }

        let image = match SourceImage::decode(file, mime_type, self.config.max_decoded_pixels) {
            Ok(image) => image,
            Err(err) => return Ok(Err(err)),
        };

        let thumbnail = downscale_to_fit(image.pixels(), self.config.preview_max_dimension)
            .unwrap_or_else(|| image.pixels().clone());
        let task = UploadTask::local(Arc::new(image), self.previews.acquire(thumbnail));

        // 解码期间可能有并发入队，落锁后再确认一次
        let mut set = self.lock_set()?;
        if set.len() >= limit {
            return Ok(Err(ValidationError::TooMany { limit }));
        }
        Ok(Ok(set.push(task)))
    }

    fn begin(self: &Arc<Self>, id: TaskId, kind: CommitKind) -> Result<CommitJob, PipelineError> {
        self.ensure_open()?;

        let job = {
            let mut set = self.lock_set()?;
            let task = set.get_mut(id).ok_or(PipelineError::TaskNotFound(id))?;
            let image = task
                .local_image()
                .cloned()
                .ok_or(PipelineError::NotLocal(id))?;

            if !kind.accepts(&task.status) {
                return Err(PipelineError::InvalidState {
                    task: id,
                    expected: kind.expected(),
                    actual: task.status.label(),
                });
            }

            task.status = TaskStatus::Uploading;
            task.attempt += 1;

            CommitJob {
                id,
                attempt: task.attempt,
                image,
                viewport: task.viewport,
                cached: task.cached_payload(),
                guard: AttemptGuard {
                    inner: Arc::clone(self),
                    id,
                    attempt: task.attempt,
                    armed: true,
                },
            }
        };

        log::info!("📤 开始提交 - 任务: {} 第 {} 次", id, job.attempt);
        self.bump_revision();
        Ok(job)
    }

    /// 执行提交并结算。返回 `None` 表示结果被丢弃。
    async fn execute(inner: Arc<Inner>, mut job: CommitJob) -> Option<TaskStatus> {
        let mut shutdown = inner.shutdown.subscribe();
        if *shutdown.borrow_and_update() {
            return None;
        }

        let outcome = tokio::select! {
            outcome = inner.perform(&job) => outcome,
            _ = shutdown.wait_for(|closed| *closed) => {
                log::info!("🛑 流水线已关闭，放弃任务 {} 的提交", job.id);
                return None;
            }
        };

        let status = inner.settle(&job, outcome);
        job.guard.disarm();
        status
    }

    async fn perform(&self, job: &CommitJob) -> CommitOutcome {
        let Ok(_permit) = self.permits.acquire().await else {
            return CommitOutcome::failed(RenderFailure::SurfaceUnavailable(
                "并发许可已关闭".to_string(),
            ));
        };
        let total_start = Instant::now();

        let render_start = Instant::now();
        let (result, rendered) = match (&job.cached, job.viewport) {
            (Some(cached), _) => {
                log::debug!("♻️ 复用已渲染载荷 - 任务: {}", job.id);
                (Arc::clone(cached), None)
            }
            (None, Some(viewport)) => {
                let renderer = self.renderer.clone();
                let image = Arc::clone(&job.image);
                let rendered =
                    tokio::task::spawn_blocking(move || renderer.render(&image, &viewport)).await;

                let result = match rendered {
                    Ok(Ok(result)) => Arc::new(result),
                    Ok(Err(failure)) => {
                        log::warn!("⚠️ 渲染失败 - 任务: {} 原因: {}", job.id, failure);
                        return CommitOutcome::failed(failure);
                    }
                    Err(err) => {
                        return CommitOutcome::failed(RenderFailure::SurfaceUnavailable(format!(
                            "渲染线程异常：{}",
                            err
                        )));
                    }
                };
                let cache = RenderedPayload {
                    viewport: Some(viewport),
                    result: Arc::clone(&result),
                };
                (result, Some(cache))
            }
            (None, None) => {
                let result = Arc::new(self.renderer.render_original(&job.image));
                let cache = RenderedPayload {
                    viewport: None,
                    result: Arc::clone(&result),
                };
                (result, Some(cache))
            }
        };
        let render_elapsed = render_start.elapsed();

        if self.config.preview_only {
            log::info!(
                "✅ 仅预览完成 - 任务: {} render={}ms",
                job.id,
                render_elapsed.as_millis()
            );
            return CommitOutcome {
                rendered,
                result: Ok(Settlement::Ready(result)),
            };
        }

        let upload_start = Instant::now();
        let payload = UploadPayload {
            file_name: upload_file_name(job.image.file_name(), &result.mime_type),
            mime_type: result.mime_type.clone(),
            bytes: result.bytes.clone(),
        };
        let uploaded = self
            .store
            .upload_binary(payload, &self.config.target_directory)
            .await;
        let upload_elapsed = upload_start.elapsed();

        log::info!(
            "✅ 提交结束 - 任务: {} 成功: {} render={}ms upload={}ms total={}ms",
            job.id,
            uploaded.is_ok(),
            render_elapsed.as_millis(),
            upload_elapsed.as_millis(),
            total_start.elapsed().as_millis()
        );

        CommitOutcome {
            rendered,
            result: uploaded.map(Settlement::Uploaded).map_err(FailureReason::from),
        }
    }

    /// 在锁内结算。任务已删除、attempt 已被替换或流水线已关闭时丢弃结果。
    fn settle(&self, job: &CommitJob, outcome: CommitOutcome) -> Option<TaskStatus> {
        if *self.shutdown.borrow() {
            return None;
        }

        let status = {
            let mut set = match self.lock_set() {
                Ok(set) => set,
                Err(err) => {
                    log::warn!("⚠️ 无法结算任务 {}：{}", job.id, err);
                    return None;
                }
            };
            let Some(task) = set.get_mut(job.id) else {
                log::debug!("🗑️ 任务 {} 已删除，丢弃提交结果", job.id);
                return None;
            };
            if task.attempt != job.attempt || !matches!(task.status, TaskStatus::Uploading) {
                log::debug!("⏭️ 任务 {} 的第 {} 次提交已过期", job.id, job.attempt);
                return None;
            }

            if let Some(rendered) = outcome.rendered {
                task.rendered = Some(rendered);
            }
            task.status = match outcome.result {
                Ok(Settlement::Uploaded(url)) => TaskStatus::Succeeded { url },
                Ok(Settlement::Ready(result)) => TaskStatus::Ready { result },
                Err(reason) => TaskStatus::Failed { reason },
            };
            task.status.clone()
        };

        self.bump_revision();
        Some(status)
    }

    /// 提交尝试未结算即被丢弃：仍停在该 attempt 的 `Uploading` 任务落为 `Failed`。
    fn interrupt(&self, id: TaskId, attempt: u32) {
        if *self.shutdown.borrow() {
            return;
        }

        let interrupted = match self.set.lock() {
            Ok(mut set) => match set.get_mut(id) {
                Some(task)
                    if task.attempt == attempt && matches!(task.status, TaskStatus::Uploading) =>
                {
                    task.status = TaskStatus::Failed {
                        reason: FailureReason::Upload(UploadError::NetworkFailure(
                            "提交被中断".to_string(),
                        )),
                    };
                    true
                }
                _ => false,
            },
            Err(_) => false,
        };

        if interrupted {
            log::warn!("⚠️ 任务 {} 的第 {} 次提交被中断，已标记为失败", id, attempt);
            self.bump_revision();
        }
    }

    fn shutdown_now(&self) {
        let was_closed = self.shutdown.send_replace(true);

        // 拆除阶段即使锁已中毒也要释放资源
        let drained = match self.set.lock() {
            Ok(mut set) => set.drain_all(),
            Err(poisoned) => poisoned.into_inner().drain_all(),
        };
        let task_count = drained.len();
        drop(drained);
        let leaked = self.previews.release_all();

        if !was_closed {
            log::info!("🛑 上传编排器已关闭 - 释放任务: {} 残留预览: {}", task_count, leaked);
            self.bump_revision();
        }
    }
}

/// 显示尺寸须与源图旋转外接框同比例，否则横纵两轴的映射比例不一致。
fn check_rendered_aspect(
    id: TaskId,
    image: &SourceImage,
    viewport: &ViewportTransform,
) -> Result<(), PipelineError> {
    let rendered = viewport.rendered_size;
    // 非法显示尺寸交给渲染阶段报告为退化裁剪
    if !rendered.is_drawable() {
        return Ok(());
    }

    let bounds = geometry::rotated_bounds(
        image.width() as f64,
        image.height() as f64,
        viewport.rotation_degrees,
    );
    let expected = bounds.width / bounds.height;
    let actual = rendered.width / rendered.height;
    if ((actual - expected) / expected).abs() > RENDERED_ASPECT_TOLERANCE {
        return Err(PipelineError::InvalidTransform {
            task: id,
            reason: format!(
                "显示尺寸 {:.1}x{:.1} 与旋转外接框 {:.1}x{:.1} 比例不一致",
                rendered.width, rendered.height, bounds.width, bounds.height
            ),
        });
    }
    Ok(())
}

/// 上传文件名：原文件名主干 + 时间戳 + 与载荷类型一致的扩展名。
fn upload_file_name(original: &str, mime_type: &str) -> String {
    let path = Path::new(original);
    let stem = path
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .filter(|stem| !stem.trim().is_empty())
        .unwrap_or_else(|| "image".to_string());

    let extension = match mime_type {
        "image/jpeg" => OutputFormat::Jpeg.extension().to_string(),
        "image/png" => OutputFormat::Png.extension().to_string(),
        "image/webp" => "webp".to_string(),
        "image/gif" => "gif".to_string(),
        "image/bmp" => "bmp".to_string(),
        _ => path
            .extension()
            .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_else(|| "bin".to_string()),
    };

    let timestamp = chrono::Local::now().format("%Y%m%d%H%M%S%3f");
    format!("{}-{}.{}", stem, timestamp, extension)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload_pipeline::UploadError;
    use async_trait::async_trait;
    use bytes::Bytes;
    use image::{ImageBuffer, ImageFormat, Rgba};
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// 前 `fail_first` 次上传失败，之后成功。
    #[derive(Default)]
    struct FlakyStore {
        fail_first: usize,
        calls: AtomicUsize,
        uploads: Mutex<Vec<Bytes>>,
    }

    #[async_trait]
    impl RemoteStore for FlakyStore {
        async fn upload_binary(
            &self,
            payload: UploadPayload,
            _target_directory: &str,
        ) -> Result<String, UploadError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            self.uploads
                .lock()
                .expect("uploads lock poisoned")
                .push(payload.bytes.clone());

            if call < self.fail_first {
                Err(UploadError::NetworkFailure("connection reset".to_string()))
            } else {
                Ok(format!("https://cdn.example.com/{}", payload.file_name))
            }
        }
    }

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x % 255) as u8, (y % 255) as u8, 128, 255])
        });
        let mut cursor = Cursor::new(Vec::new());
        img.write_to(&mut cursor, ImageFormat::Png)
            .expect("failed to encode test image");
        cursor.into_inner()
    }

    fn cached_result(orchestrator: &UploadOrchestrator, id: TaskId) -> Arc<CropResult> {
        let set = orchestrator.inner.lock_set().expect("lock failed");
        let task = set.get(id).expect("task missing");
        Arc::clone(&task.rendered.as_ref().expect("no rendered payload").result)
    }

    #[tokio::test]
    async fn retry_reuses_payload_until_transform_changes() {
        let store = Arc::new(FlakyStore {
            fail_first: 2,
            ..FlakyStore::default()
        });
        let orchestrator =
            UploadOrchestrator::new(PipelineConfig::default(), store.clone()).expect("init failed");

        let report = orchestrator
            .add([CandidateFile::new("a.png", "image/png", create_png_bytes(64, 48))])
            .expect("add failed");
        let id = report.accepted[0];

        let viewport = orchestrator
            .centered_transform(id, 1.5, 30.0)
            .expect("transform failed");
        orchestrator
            .set_transform(id, Some(viewport))
            .expect("set transform failed");

        let status = orchestrator.commit(id).await.expect("commit failed");
        assert!(matches!(status, TaskStatus::Failed { .. }));
        let first = cached_result(&orchestrator, id);

        // 视口未变：重试复用同一份载荷
        let status = orchestrator.retry(id).await.expect("retry failed");
        assert!(matches!(status, TaskStatus::Failed { .. }));
        assert!(Arc::ptr_eq(&first, &cached_result(&orchestrator, id)));

        // 视口变化：重试重新渲染
        let changed = orchestrator
            .centered_transform(id, 1.0, 0.0)
            .expect("transform failed");
        orchestrator
            .set_transform(id, Some(changed))
            .expect("set transform failed");
        let status = orchestrator.retry(id).await.expect("retry failed");
        assert!(matches!(status, TaskStatus::Succeeded { .. }));
        assert!(!Arc::ptr_eq(&first, &cached_result(&orchestrator, id)));

        let uploads = store.uploads.lock().expect("uploads lock poisoned");
        assert_eq!(uploads.len(), 3);
        assert_eq!(uploads[0], uploads[1]);
        assert_ne!(uploads[1], uploads[2]);
    }

    #[tokio::test]
    async fn commit_requires_pending_and_retry_requires_failed() {
        let orchestrator = UploadOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(FlakyStore::default()),
        )
        .expect("init failed");
        let id = orchestrator
            .add([CandidateFile::new("a.png", "image/png", create_png_bytes(8, 8))])
            .expect("add failed")
            .accepted[0];

        assert!(matches!(
            orchestrator.retry(id).await,
            Err(PipelineError::InvalidState { expected: "failed", actual: "pending", .. })
        ));

        let status = orchestrator.commit(id).await.expect("commit failed");
        assert!(matches!(status, TaskStatus::Succeeded { .. }));

        assert!(matches!(
            orchestrator.commit(id).await,
            Err(PipelineError::InvalidState { expected: "pending", actual: "succeeded", .. })
        ));
        assert!(matches!(
            orchestrator.set_transform(id, None),
            Err(PipelineError::InvalidState { .. })
        ));
    }

    #[test]
    fn remote_rows_cannot_be_edited_or_committed() {
        let orchestrator = UploadOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(FlakyStore::default()),
        )
        .expect("init failed");
        let id = orchestrator
            .add_remote(["https://cdn.example.com/existing.jpg"])
            .expect("add remote failed")
            .accepted[0];

        assert_eq!(orchestrator.set_transform(id, None), Err(PipelineError::NotLocal(id)));
        assert!(matches!(
            orchestrator.centered_transform(id, 1.0, 0.0),
            Err(PipelineError::NotLocal(_))
        ));
        assert!(matches!(orchestrator.spawn_commit(id), Err(PipelineError::NoRuntime)));
    }

    #[test]
    fn len_survives_poisoned_lock() {
        let orchestrator = UploadOrchestrator::new(
            PipelineConfig::default(),
            Arc::new(FlakyStore::default()),
        )
        .expect("init failed");
        orchestrator
            .add([CandidateFile::new("a.png", "image/png", create_png_bytes(8, 8))])
            .expect("add failed");

        let inner = Arc::clone(&orchestrator.inner);
        let poisoned = std::thread::spawn(move || {
            let _set = inner.set.lock().expect("lock failed");
            panic!("poison the set lock");
        })
        .join();
        assert!(poisoned.is_err());

        assert_eq!(orchestrator.len(), 1);
        assert!(!orchestrator.is_empty());
        assert_eq!(orchestrator.primary(), Err(PipelineError::StatePoisoned));
    }

    #[test]
    fn upload_file_name_follows_payload_type() {
        let name = upload_file_name("holiday photo.png", "image/jpeg");
        assert!(name.starts_with("holiday photo-"));
        assert!(name.ends_with(".jpg"));

        assert!(upload_file_name("", "image/png").starts_with("image-"));
        assert!(upload_file_name("scan.tiff", "image/tiff").ends_with(".tiff"));
    }
}
