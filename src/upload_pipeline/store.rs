//! # 远端存储
//!
//! ## 设计思路
//!
//! 编排器只依赖一个能力：`upload_binary(payload, directory) -> url`。
//! 以 trait 抽象远端，生产环境走 HTTP multipart，测试替换为内存实现。
//!
//! ## 实现思路
//!
//! - HTTP 客户端在构造时创建并复用（连接超时 + 总超时）。
//! - 4xx 视为远端拒绝（重试无意义），5xx / 超时 / 连接失败视为网络错误。
//! - 日志中的 URL 去掉 query 与 fragment，避免泄漏签名参数。

use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;

use super::{ConfigError, PipelineConfig, UploadError};

/// 错误响应体最多保留的字符数。
const ERROR_BODY_PREVIEW_CHARS: usize = 200;

/// 一次上传的载荷。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadPayload {
    pub file_name: String,
    pub mime_type: String,
    pub bytes: Bytes,
}

impl UploadPayload {
    pub fn size(&self) -> usize {
        self.bytes.len()
    }
}

/// 远端存储抽象。
///
/// 成功返回可公开访问的地址；失败按 [`UploadError`] 分类。
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn upload_binary(
        &self,
        payload: UploadPayload,
        target_directory: &str,
    ) -> Result<String, UploadError>;
}

/// 基于 HTTP multipart 的远端存储。
///
/// 请求：`POST {endpoint}`，表单字段 `directory`（文本）与 `file`（二进制）。
/// 响应：JSON `{"url": "..."}`（兼容 `location` / `secure_url`）。
#[derive(Debug, Clone)]
pub struct HttpRemoteStore {
    endpoint: reqwest::Url,
    client: reqwest::Client,
    upload_timeout_secs: u64,
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    #[serde(alias = "location", alias = "secure_url")]
    url: String,
}

impl HttpRemoteStore {
    /// 创建 HTTP 存储。
    ///
    /// # 示例
    /// ```rust
    /// use image_upload_pipeline::upload_pipeline::{HttpRemoteStore, PipelineConfig};
    ///
    /// let store = HttpRemoteStore::new("https://example.com/upload", &PipelineConfig::default())?;
    /// assert_eq!(store.endpoint().path(), "/upload");
    /// # Ok::<(), image_upload_pipeline::upload_pipeline::ConfigError>(())
    /// ```
    pub fn new(endpoint: &str, config: &PipelineConfig) -> Result<Self, ConfigError> {
        let endpoint = reqwest::Url::parse(endpoint)
            .map_err(|e| ConfigError::InvalidEndpoint(format!("{}：{}", endpoint, e)))?;

        if !matches!(endpoint.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidEndpoint(format!(
                "仅支持 http/https：{}",
                redact_url_for_log(endpoint.as_str())
            )));
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upload_timeout_secs))
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .build()
            .map_err(|e| ConfigError::Invalid(format!("无法创建 HTTP 客户端：{}", e)))?;

        Ok(Self {
            endpoint,
            client,
            upload_timeout_secs: config.upload_timeout_secs,
        })
    }

    pub fn endpoint(&self) -> &reqwest::Url {
        &self.endpoint
    }

    fn map_reqwest_error(&self, e: reqwest::Error) -> UploadError {
        let err_msg = e
            .to_string()
            .replace(self.endpoint.as_str(), &redact_url_for_log(self.endpoint.as_str()));

        if e.is_timeout() {
            UploadError::NetworkFailure(format!("上传超时（{}秒）", self.upload_timeout_secs))
        } else if e.is_connect() {
            UploadError::NetworkFailure(format!("无法连接：{}", err_msg))
        } else if e.is_decode() {
            UploadError::RemoteRejected(format!("响应格式错误：{}", err_msg))
        } else {
            UploadError::NetworkFailure(format!("请求失败：{}", err_msg))
        }
    }
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn upload_binary(
        &self,
        payload: UploadPayload,
        target_directory: &str,
    ) -> Result<String, UploadError> {
        let start = Instant::now();
        let size = payload.size();
        log::info!(
            "🌐 开始上传 - 地址: {} 文件: {} 大小: {} 字节",
            redact_url_for_log(self.endpoint.as_str()),
            payload.file_name,
            size
        );

        let file_part = Part::bytes(payload.bytes.to_vec())
            .file_name(payload.file_name.clone())
            .mime_str(&payload.mime_type)
            .map_err(|e| UploadError::NetworkFailure(format!("构建上传请求失败：{}", e)))?;
        let form = Form::new()
            .text("directory", target_directory.to_string())
            .part("file", file_part);

        let response = self
            .client
            .post(self.endpoint.clone())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.map_reqwest_error(e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(ERROR_BODY_PREVIEW_CHARS).collect();
            let message = format!("HTTP {} {}", status.as_u16(), body.trim());

            log::warn!("⚠️ 上传失败 - 文件: {} {}", payload.file_name, message);

            return Err(if status.is_client_error() {
                UploadError::RemoteRejected(message)
            } else {
                UploadError::NetworkFailure(message)
            });
        }

        let parsed: UploadResponse = response.json().await.map_err(|e| self.map_reqwest_error(e))?;
        if parsed.url.trim().is_empty() {
            return Err(UploadError::RemoteRejected("响应中的 url 为空".to_string()));
        }

        log::info!(
            "✅ 上传完成 - 文件: {} 地址: {} 耗时: {}ms",
            payload.file_name,
            redact_url_for_log(&parsed.url),
            start.elapsed().as_millis()
        );

        Ok(parsed.url)
    }
}

/// 未配置上传地址时使用：任何上传都被拒绝。
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledStore;

#[async_trait]
impl RemoteStore for DisabledStore {
    async fn upload_binary(
        &self,
        payload: UploadPayload,
        _target_directory: &str,
    ) -> Result<String, UploadError> {
        log::warn!("⚠️ 未配置上传地址，拒绝上传: {}", payload.file_name);
        Err(UploadError::RemoteRejected("上传已禁用".to_string()))
    }
}

/// 日志用 URL：只保留 scheme、host、port 与 path。
pub(crate) fn redact_url_for_log(url: &str) -> String {
    let Ok(parsed) = reqwest::Url::parse(url) else {
        return "<invalid-url>".to_string();
    };

    let host = parsed.host_str().unwrap_or("<unknown-host>");
    let port = parsed.port().map(|p| format!(":{}", p)).unwrap_or_default();

    format!("{}://{}{}{}", parsed.scheme(), host, port, parsed.path())
}
