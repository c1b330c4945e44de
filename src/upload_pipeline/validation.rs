//! # 校验闸门
//!
//! ## 设计思路
//!
//! 校验闸门是整条链路的第一道关卡：只看 MIME 类型与字节长度，
//! 纯同步、无副作用、无网络访问，尽快失败以减少后续解码开销。
//!
//! ## 实现思路
//!
//! - 白名单在构造时归一化（小写、去参数、`image/jpg` → `image/jpeg`）。
//! - 空白名单或零体积上限在构造阶段返回 `ConfigError`。
//! - 声明类型为空时，退回到文件签名识别（`infer`）。
//! - 先查类型，再查体积。

use std::collections::BTreeSet;

use super::{CandidateFile, ConfigError, PipelineConfig, ValidationError};

/// 校验闸门：MIME 白名单 + 体积上限。
#[derive(Debug, Clone)]
pub struct ValidationGate {
    allowed_types: BTreeSet<String>,
    max_size_bytes: u64,
}

impl ValidationGate {
    /// 创建校验闸门。
    ///
    /// # 示例
    /// ```rust
    /// use image_upload_pipeline::upload_pipeline::ValidationGate;
    ///
    /// let gate = ValidationGate::new(["image/png", "image/JPEG"], 1024)?;
    /// assert!(gate.allows("image/jpeg"));
    /// # Ok::<(), image_upload_pipeline::upload_pipeline::ConfigError>(())
    /// ```
    pub fn new<I, T>(allowed_types: I, max_size_bytes: u64) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: AsRef<str>,
    {
        let allowed_types: BTreeSet<String> = allowed_types
            .into_iter()
            .map(|t| normalize_mime(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();

        if allowed_types.is_empty() {
            return Err(ConfigError::EmptyAllowList);
        }
        if max_size_bytes == 0 {
            return Err(ConfigError::ZeroSizeLimit);
        }

        Ok(Self {
            allowed_types,
            max_size_bytes,
        })
    }

    pub fn from_config(config: &PipelineConfig) -> Result<Self, ConfigError> {
        Self::new(&config.allowed_types, config.max_size_bytes)
    }

    /// 校验候选文件，成功时返回归一化后的 MIME 类型。
    pub fn validate(&self, file: &CandidateFile) -> Result<String, ValidationError> {
        let declared = normalize_mime(&file.mime_type);
        let mime_type = if declared.is_empty() {
            sniff_image_mime(&file.bytes).unwrap_or_default()
        } else {
            declared
        };

        if mime_type.is_empty() || !self.allowed_types.contains(&mime_type) {
            let shown = if mime_type.is_empty() { "未知".to_string() } else { mime_type };
            return Err(ValidationError::InvalidType(shown));
        }

        let size = file.size();
        if size > self.max_size_bytes {
            return Err(ValidationError::TooLarge {
                size,
                limit: self.max_size_bytes,
            });
        }

        Ok(mime_type)
    }

    /// 白名单是否包含该类型（参数与大小写不敏感）。
    pub fn allows(&self, mime_type: &str) -> bool {
        self.allowed_types.contains(&normalize_mime(mime_type))
    }

    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_bytes
    }
}

/// 归一化 MIME：去参数、去空白、小写，并合并常见别名。
pub(crate) fn normalize_mime(raw: &str) -> String {
    let base = raw
        .split(';')
        .next()
        .map(|base| base.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match base.as_str() {
        "image/jpg" | "image/pjpeg" => "image/jpeg".to_string(),
        _ => base,
    }
}

/// 通过文件签名识别图片类型，非图片返回 `None`。
fn sniff_image_mime(bytes: &[u8]) -> Option<String> {
    let kind = infer::get(bytes)?;
    if kind.matcher_type() != infer::MatcherType::Image {
        return None;
    }
    Some(normalize_mime(kind.mime_type()))
}
