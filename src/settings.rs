//! 流水线设置文件的读写（JSON，字段为 camelCase，缺省字段取默认值）。

use std::fs;
use std::path::Path;

use crate::error::AppError;
use crate::upload_pipeline::PipelineConfig;

/// 读取设置文件。文件不存在时返回默认配置；内容非法时返回错误。
pub fn load_pipeline_config(path: &Path) -> Result<PipelineConfig, AppError> {
    if !path.exists() {
        log::info!("📄 设置文件不存在，使用默认配置: {}", path.display());
        return Ok(PipelineConfig::default());
    }

    let content = fs::read_to_string(path)?;
    let config = serde_json::from_str::<PipelineConfig>(&content)
        .map_err(|e| AppError::Settings(format!("解析设置文件失败: {}", e)))?;
    config.validate()?;

    log::info!("📄 已加载设置文件: {}", path.display());
    Ok(config)
}

/// 写入设置文件，必要时创建父目录。
pub fn save_pipeline_config(path: &Path, config: &PipelineConfig) -> Result<(), AppError> {
    config.validate()?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }

    let content = serde_json::to_string_pretty(config)
        .map_err(|e| AppError::Settings(format!("序列化设置失败: {}", e)))?;

    fs::write(path, content)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_path(name: &str) -> PathBuf {
        std::env::temp_dir()
            .join(format!("upload-pipeline-settings-{}", std::process::id()))
            .join(name)
    }

    #[test]
    fn missing_file_yields_defaults() {
        let config = load_pipeline_config(&temp_path("missing.json")).expect("load failed");
        assert_eq!(config, PipelineConfig::default());
    }

    #[test]
    fn save_then_load_keeps_values() {
        let path = temp_path("roundtrip.json");
        let config = PipelineConfig {
            max_images: 3,
            aspect_ratio: Some(16.0 / 9.0),
            target_directory: "avatars".to_string(),
            ..PipelineConfig::default()
        };

        save_pipeline_config(&path, &config).expect("save failed");
        let loaded = load_pipeline_config(&path).expect("load failed");
        let _ = fs::remove_file(&path);

        assert_eq!(loaded, config);
    }

    #[test]
    fn invalid_content_is_reported() {
        let path = temp_path("broken.json");
        fs::create_dir_all(path.parent().expect("no parent")).expect("create dir failed");

        fs::write(&path, "{ not json").expect("write failed");
        assert!(matches!(load_pipeline_config(&path), Err(AppError::Settings(_))));

        fs::write(&path, r#"{ "maxImages": 0 }"#).expect("write failed");
        assert!(matches!(load_pipeline_config(&path), Err(AppError::Config(_))));

        let _ = fs::remove_file(&path);
    }
}
